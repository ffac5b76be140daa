//! Shared test utilities for core module tests
//!
//! Provides common test helpers to avoid duplication across test suites.
//! This module is only compiled in test mode.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once, OnceLock};

use crate::core::adapter::FirewallAdapter;
use crate::core::error::{AdapterFailure, Error};
use crate::core::ids::RuleId;
use crate::core::notifier::ErrorNotifier;
use crate::core::rule::Mapping;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// For tests that just need mock nft, use `setup_mock_nft()` instead.
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

static MOCK_NFT_INIT: Once = Once::new();

/// Points `IPF_NFT_COMMAND` at `tests/mock_nft.sh` and disables elevation.
///
/// Thread-safe and can be called multiple times (initialization happens once).
pub fn setup_mock_nft() {
    MOCK_NFT_INIT.call_once(|| {
        let mock_path = format!("{}/tests/mock_nft.sh", env!("CARGO_MANIFEST_DIR"));
        // SAFETY: Guarded by Once, and only in test code.
        unsafe {
            std::env::set_var("IPF_NFT_COMMAND", &mock_path);
            std::env::set_var("IPF_TEST_NO_ELEVATION", "1");
        }
    });
}

static TEST_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Points `HOME` and the XDG base dirs at a fresh directory for the rest of
/// the test process, so nothing reads or writes the developer's real config,
/// state, or audit log.
///
/// The directory starts empty; `$DATA/ipf` and `$STATE/ipf` do not exist
/// until something creates them.
pub fn isolate_home() -> &'static Path {
    TEST_HOME.get_or_init(|| {
        let home = tempfile::tempdir()
            .expect("create isolated home")
            .keep();
        // SAFETY: Guarded by OnceLock, and only in test code.
        unsafe {
            std::env::set_var("HOME", &home);
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
        home
    })
}

/// Stateful in-memory adapter with failure injection.
///
/// Keeps the set of installed mappings the way a real backend would, so
/// tests can assert on the OS-side state after rollbacks.
#[derive(Debug, Default)]
pub struct RecordingAdapter {
    installed: Mutex<BTreeMap<Mapping, bool>>,
    fail_install: Mutex<BTreeMap<u16, AdapterFailure>>,
    fail_remove: Mutex<BTreeMap<u16, AdapterFailure>>,
    calls: Mutex<Vec<String>>,
}

impl RecordingAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes installs with this remote port fail.
    pub fn fail_install_on(&self, remote_port: u16, failure: AdapterFailure) {
        self.fail_install.lock().unwrap().insert(remote_port, failure);
    }

    /// Makes removals with this remote port fail until cleared.
    pub fn fail_remove_on(&self, remote_port: u16, failure: AdapterFailure) {
        self.fail_remove.lock().unwrap().insert(remote_port, failure);
    }

    pub fn clear_failures(&self) {
        self.fail_install.lock().unwrap().clear();
        self.fail_remove.lock().unwrap().clear();
    }

    pub fn installed(&self) -> Vec<Mapping> {
        self.installed.lock().unwrap().keys().copied().collect()
    }

    pub fn is_installed(&self, mapping: &Mapping) -> bool {
        self.installed.lock().unwrap().contains_key(mapping)
    }

    pub fn allow_lan(&self, mapping: &Mapping) -> Option<bool> {
        self.installed.lock().unwrap().get(mapping).copied()
    }

    /// Every adapter call in order, e.g. `install :9000 -> 10.0.0.1:8000`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl FirewallAdapter for RecordingAdapter {
    fn install(&self, mapping: &Mapping, allow_lan: bool) -> Result<(), AdapterFailure> {
        self.calls.lock().unwrap().push(format!("install {mapping}"));

        if let Some(failure) = self.fail_install.lock().unwrap().get(&mapping.remote_port) {
            return Err(*failure);
        }

        let mut installed = self.installed.lock().unwrap();
        if installed.contains_key(mapping) {
            return Err(AdapterFailure::AlreadyExists);
        }
        installed.insert(*mapping, allow_lan);
        Ok(())
    }

    fn remove(&self, mapping: &Mapping) -> Result<(), AdapterFailure> {
        self.calls.lock().unwrap().push(format!("remove {mapping}"));

        if let Some(failure) = self.fail_remove.lock().unwrap().get(&mapping.remote_port) {
            return Err(*failure);
        }

        self.installed
            .lock()
            .unwrap()
            .remove(mapping)
            .map(|_| ())
            .ok_or(AdapterFailure::Unknown)
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Collects every notification as `(rule_id, code)`.
pub fn recording_handler() -> (Arc<Mutex<Vec<(Option<RuleId>, i8)>>>, Arc<dyn ErrorNotifier>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: Arc<dyn ErrorNotifier> = Arc::new(move |id: Option<RuleId>, e: &Error| {
        sink.lock().unwrap().push((id, e.code()));
        0
    });
    (seen, handler)
}

pub fn mapping(address: &str, remote_port: u16, local_port: u16) -> Mapping {
    Mapping::new(address.parse().unwrap(), remote_port, local_port)
}
