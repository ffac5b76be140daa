//! Forward rule manager
//!
//! Orchestrates validation, id allocation, range decomposition and adapter
//! calls. The rule table and id pool sit behind one mutex that is held
//! across the adapter call, so allocate-then-install and lookup-then-remove
//! are critical sections. Failures are returned to the caller and then, after
//! the lock is released, delivered once to the registered notifier.
//!
//! # Example
//!
//! ```
//! use ipf::core::adapter::FirewallAdapter;
//! use ipf::core::error::AdapterFailure;
//! use ipf::core::manager::ForwardManager;
//! use ipf::core::rule::Mapping;
//!
//! struct Noop;
//!
//! impl FirewallAdapter for Noop {
//!     fn install(&self, _: &Mapping, _: bool) -> Result<(), AdapterFailure> {
//!         Ok(())
//!     }
//!     fn remove(&self, _: &Mapping) -> Result<(), AdapterFailure> {
//!         Ok(())
//!     }
//! }
//!
//! let manager = ForwardManager::new(Noop);
//! let id = manager.forward("192.168.1.20", 22, 2222, false).unwrap();
//! let range = manager.forward_range("192.168.1.20", 8000, 8002, 9000, true).unwrap();
//! assert_eq!(range.len(), 3);
//!
//! manager.cancel(id).unwrap();
//! assert!(manager.cancel(id).is_err());
//! ```

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::core::adapter::FirewallAdapter;
use crate::core::error::{AdapterFailure, Error, Result};
use crate::core::ids::RuleId;
use crate::core::notifier::{ErrorNotifier, HandlerSlot};
use crate::core::rollback::Rollback;
use crate::core::rule::{ForwardRule, Mapping};
use crate::core::table::RuleTable;
use crate::validators;

pub struct ForwardManager<A> {
    adapter: A,
    table: Mutex<RuleTable>,
    handler: HandlerSlot,
}

impl<A: FirewallAdapter> ForwardManager<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            table: Mutex::new(RuleTable::new()),
            handler: HandlerSlot::new(),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Checks whether `address` is a well-formed forward target.
    pub fn is_valid_address(address: &str) -> bool {
        validators::is_valid_address(address)
    }

    /// Forwards `local_port` on this host to `address:remote_port`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`] / [`Error::InvalidPort`] before any state is touched
    /// - [`Error::ResourceExhausted`] when all 128 ids are live (no adapter call)
    /// - [`Error::InstallationFailed`] when the adapter rejects the mapping; the id is released
    pub fn forward(
        &self,
        address: &str,
        remote_port: u16,
        local_port: u16,
        allow_lan: bool,
    ) -> Result<RuleId> {
        let result = self.try_forward(address, remote_port, local_port, allow_lan);
        self.report(None, result)
    }

    /// Forwards the inclusive range `remote_start..=remote_end`, pairing
    /// `remote_start + k` with `local_start + k`.
    ///
    /// All-or-nothing: if any port fails, every mapping this call already
    /// installed is cancelled before the error is returned. On success the
    /// ids come back in ascending port order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPortRange`] if `remote_end < remote_start`
    /// - [`Error::LocalPortOverflow`] if the local end would exceed 65535
    /// - any error [`forward`](Self::forward) can return, after rollback
    pub fn forward_range(
        &self,
        address: &str,
        remote_start: u16,
        remote_end: u16,
        local_start: u16,
        allow_lan: bool,
    ) -> Result<Vec<RuleId>> {
        let result = self.try_forward_range(address, remote_start, remote_end, local_start, allow_lan);
        self.report(None, result)
    }

    /// Cancels an active rule.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownRuleId`] if no rule has this id
    /// - [`Error::RemovalFailed`] if the adapter could not remove the mapping;
    ///   the rule stays active
    pub fn cancel(&self, id: RuleId) -> Result<()> {
        let result = self.lock().and_then(|mut table| self.cancel_locked(&mut table, id));
        self.report(Some(id), result)
    }

    /// Cancels every active rule, continuing past failures.
    ///
    /// Returns the first failure; rules whose removal failed stay active.
    pub fn cancel_all(&self) -> Result<()> {
        let mut table = self.lock()?;
        let mut first_error = None;

        for id in table.ids() {
            if let Err(e) = self.cancel_locked(&mut table, id) {
                first_error.get_or_insert((id, e));
            }
        }
        drop(table);

        match first_error {
            None => Ok(()),
            Some((id, e)) => self.report(Some(id), Err(e)),
        }
    }

    /// Installs `handler` as the error notifier, replacing any previous one.
    pub fn register_handler(&self, handler: Arc<dyn ErrorNotifier>) -> Result<()> {
        self.handler.register(handler)
    }

    /// Removes the error notifier, returning whether one was installed.
    pub fn clear_handler(&self) -> Result<bool> {
        self.handler.clear()
    }

    /// Delivers a failure raised outside the manager (e.g. at the C boundary)
    /// to the registered notifier.
    pub fn notify(&self, rule_id: Option<RuleId>, error: &Error) {
        self.handler.notify(rule_id, error);
    }

    pub fn get(&self, id: RuleId) -> Option<ForwardRule> {
        self.lock().ok()?.get(id).cloned()
    }

    /// Snapshot of active rules in id order
    pub fn active_rules(&self) -> Vec<ForwardRule> {
        self.lock()
            .map(|table| table.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_ids(&self) -> Vec<RuleId> {
        self.lock().map(|table| table.ids()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|table| table.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids still available for new rules
    pub fn available_ids(&self) -> usize {
        self.lock().map(|table| table.available()).unwrap_or(0)
    }

    // ═══════════════════════════════════════════════════════════════════════════

    fn try_forward(
        &self,
        address: &str,
        remote_port: u16,
        local_port: u16,
        allow_lan: bool,
    ) -> Result<RuleId> {
        let remote_address = Self::parse_target(address)?;
        validators::validate_port(remote_port)?;
        validators::validate_port(local_port)?;

        let mapping = Mapping::new(remote_address, remote_port, local_port);
        let mut table = self.lock()?;
        self.forward_locked(&mut table, mapping, allow_lan)
    }

    fn try_forward_range(
        &self,
        address: &str,
        remote_start: u16,
        remote_end: u16,
        local_start: u16,
        allow_lan: bool,
    ) -> Result<Vec<RuleId>> {
        let span = validators::validate_port_range(remote_start, remote_end, local_start)?;
        let remote_address = Self::parse_target(address)?;

        let mut table = self.lock()?;
        let mut installed = Rollback::with_capacity(usize::from(span) + 1);

        for offset in 0..=span {
            let mapping = Mapping::new(remote_address, remote_start + offset, local_start + offset);

            match self.forward_locked(&mut table, mapping, allow_lan) {
                Ok(id) => installed.push(id),
                Err(e) => {
                    warn!(
                        "Range forward failed at {mapping} after {} mapping(s), rolling back: {e}",
                        installed.len()
                    );
                    let failed = installed.unwind(|id| {
                        self.cancel_locked(&mut table, id).inspect_err(|undo| {
                            error!("Rollback could not cancel rule {id}, it stays active: {undo}");
                        })
                    });
                    if failed > 0 {
                        error!("{failed} mapping(s) left installed after failed rollback");
                    }
                    return Err(e);
                }
            }
        }

        Ok(installed.commit())
    }

    fn forward_locked(
        &self,
        table: &mut RuleTable,
        mapping: Mapping,
        allow_lan: bool,
    ) -> Result<RuleId> {
        if table.contains_mapping(&mapping) {
            return Err(Error::InstallationFailed {
                mapping,
                cause: AdapterFailure::AlreadyExists,
            });
        }

        let id = table.reserve()?;

        if let Err(cause) = self.adapter.install(&mapping, allow_lan) {
            table.abandon(id);
            warn!("{} rejected {mapping}: {cause}", self.adapter.name());
            return Err(Error::InstallationFailed { mapping, cause });
        }

        let rule = table.commit(id, mapping, allow_lan);
        info!("Forward rule {rule} installed via {}", self.adapter.name());
        Ok(id)
    }

    fn cancel_locked(&self, table: &mut RuleTable, id: RuleId) -> Result<()> {
        let mapping = table
            .get(id)
            .map(ForwardRule::mapping)
            .ok_or(Error::UnknownRuleId(id.get()))?;

        if let Err(cause) = self.adapter.remove(&mapping) {
            warn!("{} failed to remove rule {id} ({mapping}): {cause}", self.adapter.name());
            return Err(Error::RemovalFailed { id, cause });
        }

        table.remove(id);
        info!("Forward rule {id} ({mapping}) cancelled");
        Ok(())
    }

    fn parse_target(address: &str) -> Result<IpAddr> {
        let ip = validators::parse_address(address)?;
        if let Some(notice) = validators::check_reserved_ip(ip) {
            debug!("Forward target {ip}: {notice}");
        }
        Ok(ip)
    }

    fn lock(&self) -> Result<MutexGuard<'_, RuleTable>> {
        self.table
            .lock()
            .map_err(|_| Error::Internal("rule table lock poisoned".to_string()))
    }

    fn report<T>(&self, rule_id: Option<RuleId>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.handler.notify(rule_id, e);
        }
        result
    }
}

impl<A> std::fmt::Debug for ForwardManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardManager")
            .field("table", &self.table)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}
