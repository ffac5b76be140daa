//! nftables DNAT backend
//!
//! Keeps the desired set of mappings and regenerates the whole `ipf` table on
//! every change. The batch flushes the table before re-adding chains and
//! rules, so each apply is atomic: either the new ruleset is live or the old
//! one still is.
//!
//! Per mapping:
//! - `output`: DNAT for local traffic to `local_port` addressed to this host
//! - `prerouting`: the same DNAT for LAN peers, only when `allow_lan` is set
//!
//! One shared `postrouting` rule masquerades every DNAT'd connection.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use serde_json::{Value, json};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::adapter::FirewallAdapter;
use crate::core::error::AdapterFailure;
use crate::core::rule::Mapping;

pub const DEFAULT_TABLE: &str = "ipf";

/// nft identifiers: a letter followed by letters, digits or underscores.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 64
}

pub struct NftablesAdapter {
    table: String,
    desired: Mutex<BTreeMap<Mapping, bool>>,
    audit: Option<AuditLog>,
    runtime: Runtime,
}

impl NftablesAdapter {
    /// Creates an adapter managing `table` in the `inet` family.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the table name is not a valid nft identifier or the
    /// runtime cannot be built.
    pub fn new(table: impl Into<String>, audit: Option<AuditLog>) -> std::io::Result<Self> {
        let table = table.into();
        if !is_valid_table_name(&table) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid nftables table name '{table}'"),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            table,
            desired: Mutex::new(BTreeMap::new()),
            audit,
            runtime,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Mappings currently applied, with their `allow_lan` flag
    pub fn mappings(&self) -> Vec<(Mapping, bool)> {
        self.desired()
            .map(|d| d.iter().map(|(m, lan)| (*m, *lan)).collect())
            .unwrap_or_default()
    }

    /// The batch that would be applied for the current mappings.
    pub fn ruleset_json(&self) -> Value {
        let desired = self.desired().map(|d| d.clone()).unwrap_or_default();
        build_ruleset(&self.table, &desired)
    }

    fn desired(&self) -> Result<MutexGuard<'_, BTreeMap<Mapping, bool>>, AdapterFailure> {
        self.desired.lock().map_err(|_| {
            error!("nftables desired-state lock poisoned");
            AdapterFailure::Unknown
        })
    }

    /// Applies `next` and, on success, makes it the desired state.
    fn commit(
        &self,
        desired: &mut BTreeMap<Mapping, bool>,
        next: BTreeMap<Mapping, bool>,
        event_type: EventType,
        mapping: &Mapping,
    ) -> Result<(), AdapterFailure> {
        let batch = build_ruleset(&self.table, &next);
        let result = self.runtime.block_on(apply_batch(&batch));

        if let Some(audit) = &self.audit {
            let event = AuditEvent::new(
                event_type,
                result.is_ok(),
                json!({
                    "table": self.table,
                    "mapping": mapping.to_string(),
                    "mapping_count": next.len(),
                }),
                result.as_ref().err().map(ToString::to_string),
            );
            if let Err(e) = self.runtime.block_on(audit.log(event)) {
                warn!("Failed to write audit log: {e}");
            }
        }

        result?;
        *desired = next;
        Ok(())
    }
}

impl FirewallAdapter for NftablesAdapter {
    fn install(&self, mapping: &Mapping, allow_lan: bool) -> Result<(), AdapterFailure> {
        let mut desired = self.desired()?;

        if desired.contains_key(mapping) {
            return Err(AdapterFailure::AlreadyExists);
        }
        if let Some(taken) = desired.keys().find(|m| m.local_port == mapping.local_port) {
            debug!("Local port {} already forwarded by {taken}", mapping.local_port);
            return Err(AdapterFailure::AddrInUse);
        }

        let mut next = desired.clone();
        next.insert(*mapping, allow_lan);
        self.commit(&mut desired, next, EventType::InstallMapping, mapping)
    }

    fn remove(&self, mapping: &Mapping) -> Result<(), AdapterFailure> {
        let mut desired = self.desired()?;

        if !desired.contains_key(mapping) {
            return Err(AdapterFailure::Unknown);
        }

        let mut next = desired.clone();
        next.remove(mapping);
        self.commit(&mut desired, next, EventType::RemoveMapping, mapping)
    }

    fn name(&self) -> &'static str {
        "nftables"
    }
}

impl std::fmt::Debug for NftablesAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NftablesAdapter")
            .field("table", &self.table)
            .field("desired", &self.desired)
            .field("audit", &self.audit.is_some())
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Batch generation
// ═══════════════════════════════════════════════════════════════════════════

/// Builds the complete `nft --json` batch for `mappings` in `table`.
pub fn build_ruleset(table: &str, mappings: &BTreeMap<Mapping, bool>) -> Value {
    let lan_count = mappings.values().filter(|lan| **lan).count();
    let mut nft_rules = Vec::with_capacity(6 + mappings.len() + lan_count);

    // 1. Setup Table & Flush
    nft_rules.push(json!({ "add": { "table": { "family": "inet", "name": table } } }));
    nft_rules.push(json!({ "flush": { "table": { "family": "inet", "name": table } } }));

    // 2. NAT chains
    for (name, priority) in [("prerouting", -100), ("output", -100), ("postrouting", 100)] {
        nft_rules.push(json!({
            "add": {
                "chain": {
                    "family": "inet",
                    "table": table,
                    "name": name,
                    "type": "nat",
                    "hook": name,
                    "prio": priority,
                    "policy": "accept"
                }
            }
        }));
    }

    // 3. Per-mapping DNAT
    for (mapping, allow_lan) in mappings {
        let comment = format!("ipf {mapping}");

        let mut local = dnat_match(mapping);
        local.insert(
            1,
            json!({ "match": { "left": { "fib": { "result": "type", "flags": ["daddr"] } }, "op": "==", "right": "local" } }),
        );
        local.push(dnat(mapping));
        nft_rules.push(rule_add(table, "output", &local, &comment));

        if *allow_lan {
            let mut lan = dnat_match(mapping);
            lan.push(dnat(mapping));
            nft_rules.push(rule_add(table, "prerouting", &lan, &comment));
        }
    }

    // 4. Masquerade anything we rewrote
    nft_rules.push(rule_add(
        table,
        "postrouting",
        &[
            json!({ "match": { "left": { "ct": { "key": "status" } }, "op": "in", "right": "dnat" } }),
            json!({ "masquerade": null }),
        ],
        "ipf masquerade",
    ));

    json!({ "nftables": nft_rules })
}

fn nfproto(addr: IpAddr) -> (&'static str, &'static str) {
    match addr {
        IpAddr::V4(_) => ("ipv4", "ip"),
        IpAddr::V6(_) => ("ipv6", "ip6"),
    }
}

/// `meta nfproto <family> tcp dport <local_port>`
fn dnat_match(mapping: &Mapping) -> Vec<Value> {
    let (proto, _) = nfproto(mapping.remote_address);
    vec![
        json!({ "match": { "left": { "meta": { "key": "nfproto" } }, "op": "==", "right": proto } }),
        json!({ "match": { "left": { "payload": { "protocol": "tcp", "field": "dport" } }, "op": "==", "right": mapping.local_port } }),
    ]
}

fn dnat(mapping: &Mapping) -> Value {
    let (_, family) = nfproto(mapping.remote_address);
    json!({
        "dnat": {
            "family": family,
            "addr": mapping.remote_address.to_string(),
            "port": mapping.remote_port
        }
    })
}

fn rule_add(table: &str, chain: &str, expr: &[Value], comment: &str) -> Value {
    json!({
        "add": {
            "rule": {
                "family": "inet",
                "table": table,
                "chain": chain,
                "expr": expr,
                "comment": comment
            }
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════════

/// Feeds `batch` to elevated `nft --json -f -`.
async fn apply_batch(batch: &Value) -> Result<(), AdapterFailure> {
    use tokio::io::AsyncWriteExt;

    let payload = serde_json::to_string(batch).map_err(|e| {
        error!("Failed to serialize nftables batch: {e}");
        AdapterFailure::Unknown
    })?;

    let mut cmd = crate::elevation::create_elevated_nft_command(&["--json", "-f", "-"])
        .map_err(|e| {
            error!("Cannot elevate nft: {e}");
            AdapterFailure::PermissionDenied
        })?;

    let mut child = cmd
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!("Failed to spawn elevated nft: {e}");
            AdapterFailure::from(e)
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(payload.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;

    if output.status.success() {
        info!("nftables batch applied ({} bytes)", payload.len());
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let failure = AdapterFailure::from_nft_stderr(&stderr);
        error!(
            "nft exited with {:?}: {} ({failure})",
            output.status.code(),
            stderr.trim()
        );
        Err(failure)
    }
}
