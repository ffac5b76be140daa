//! C ABI, declared in `include/ipf.h`
//!
//! Every entry point runs against one process-wide [`ForwardManager`] that is
//! built on first use from the configuration file. Results are encoded the
//! same way everywhere: a non-negative value is a rule id (or a count), a
//! negative value is an [`Error::code`]. Panics never cross the boundary;
//! they come back as `-1`.
//!
//! The registered handler is called as `handler(rule_id, code, diagnostic)`
//! where `rule_id` is `-1` when the failure is not tied to a rule and
//! `diagnostic` is the adapter code (`-51..=-55`, `-1`) or `0`.

use std::ffi::{CStr, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};

use tracing::error;

use crate::config;
use crate::core::adapter::FirewallAdapter;
use crate::core::error::Error;
use crate::core::ids::RuleId;
use crate::core::manager::ForwardManager;
use crate::core::notifier::ErrorNotifier;
use crate::utils;
use crate::validators;

type Manager = ForwardManager<Box<dyn FirewallAdapter>>;

/// Error handler signature: `(rule_id, code, diagnostic) -> i8`
pub type ErrorHandlerFn = extern "C" fn(i8, i8, i8) -> i8;

static MANAGER: OnceLock<Option<Manager>> = OnceLock::new();

/// Code returned when the backend could not be started.
const INIT_FAILED: i8 = -1;

fn manager() -> Option<&'static Manager> {
    MANAGER
        .get_or_init(|| {
            let dirs = utils::ensure_dirs();
            let config = config::load_config_blocking();
            utils::init_logging(config.log_to_file);
            if let Err(e) = dirs {
                error!("Cannot create ipf directories: {e}");
            }

            match config::build_adapter(&config) {
                Ok(adapter) => Some(ForwardManager::new(adapter)),
                Err(e) => {
                    error!("ipf backend unavailable: {e}");
                    None
                }
            }
        })
        .as_ref()
}

struct CHandler(ErrorHandlerFn);

impl ErrorNotifier for CHandler {
    fn notify(&self, rule_id: Option<RuleId>, error: &Error) -> i8 {
        let diagnostic = error.diagnostic().map_or(0, |d| d.code());
        (self.0)(rule_id.map_or(-1, RuleId::get), error.code(), diagnostic)
    }
}

/// Runs `f` with the global manager, mapping panics and init failure to codes.
fn with_manager<T>(on_fail: T, f: impl FnOnce(&Manager) -> T) -> T
where
    T: Copy,
{
    catch_unwind(AssertUnwindSafe(|| manager().map_or(on_fail, f))).unwrap_or_else(|_| {
        error!("panic caught at the C boundary");
        on_fail
    })
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn read_str<'a>(ptr: *const c_char) -> Result<&'a str, Error> {
    if ptr.is_null() {
        return Err(Error::InvalidString);
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| Error::InvalidString)
}

/// Returns the error code after sending it to the registered handler.
fn fail(manager: &Manager, rule_id: Option<RuleId>, e: &Error) -> i8 {
    manager.notify(rule_id, e);
    e.code()
}

/// Checks whether `ip` is a valid IPv4 or IPv6 address.
///
/// # Safety
///
/// `ip` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ipf_check_ip_is_valid(ip: *const c_char) -> bool {
    catch_unwind(|| {
        // SAFETY: forwarded caller contract
        unsafe { read_str(ip) }.is_ok_and(validators::is_valid_address)
    })
    .unwrap_or(false)
}

/// Forwards `local_port` to `ip:remote_port`. Returns the rule id.
///
/// # Safety
///
/// `ip` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ipf_forward(
    ip: *const c_char,
    remote_port: u16,
    local_port: u16,
    allow_lan: bool,
) -> i8 {
    with_manager(INIT_FAILED, |manager| {
        // SAFETY: forwarded caller contract
        let address = match unsafe { read_str(ip) } {
            Ok(address) => address,
            Err(e) => return fail(manager, None, &e),
        };
        manager
            .forward(address, remote_port, local_port, allow_lan)
            .map_or_else(|e| e.code(), RuleId::get)
    })
}

/// Forwards `remote_port_start..=remote_port_end` to consecutive local ports.
///
/// Returns the number of rules created (all or none); enumerate them with
/// [`ipf_active_rule_ids`].
///
/// # Safety
///
/// `ip` must be null or point to a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ipf_forward_range(
    ip: *const c_char,
    remote_port_start: u16,
    remote_port_end: u16,
    local_port_start: u16,
    allow_lan: bool,
) -> i16 {
    with_manager(i16::from(INIT_FAILED), |manager| {
        // SAFETY: forwarded caller contract
        let address = match unsafe { read_str(ip) } {
            Ok(address) => address,
            Err(e) => return i16::from(fail(manager, None, &e)),
        };
        manager
            .forward_range(address, remote_port_start, remote_port_end, local_port_start, allow_lan)
            .map_or_else(|e| i16::from(e.code()), |ids| ids.len() as i16)
    })
}

/// Writes up to `capacity` active rule ids (ascending) to `out`.
///
/// Returns the total number of active rules, which may exceed `capacity`.
///
/// # Safety
///
/// `out` must be valid for `capacity` writes of `i8`, or null with `capacity == 0`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ipf_active_rule_ids(out: *mut i8, capacity: usize) -> i16 {
    with_manager(i16::from(INIT_FAILED), |manager| {
        let ids = manager.active_ids();
        if !out.is_null() {
            for (i, id) in ids.iter().take(capacity).enumerate() {
                // SAFETY: i < capacity and out is valid for capacity writes
                unsafe { out.add(i).write(id.get()) };
            }
        }
        ids.len() as i16
    })
}

/// Cancels a rule. Returns `forward_rule_id` on success.
#[unsafe(no_mangle)]
pub extern "C" fn ipf_cancel_forward(forward_rule_id: i8) -> i8 {
    with_manager(INIT_FAILED, |manager| {
        let id = match RuleId::try_from(forward_rule_id) {
            Ok(id) => id,
            Err(e) => return fail(manager, None, &e),
        };
        match manager.cancel(id) {
            Ok(()) => forward_rule_id,
            Err(e) => e.code(),
        }
    })
}

/// Cancels every active rule. Returns `0` or the first failure's code.
#[unsafe(no_mangle)]
pub extern "C" fn ipf_cancel_all() -> i8 {
    with_manager(INIT_FAILED, |manager| {
        manager.cancel_all().map_or_else(|e| e.code(), |()| 0)
    })
}

/// Registers `handler`, replacing any earlier one. NULL is rejected.
#[unsafe(no_mangle)]
pub extern "C" fn ipf_register_error_handler(handler: Option<ErrorHandlerFn>) -> i8 {
    with_manager(INIT_FAILED, |manager| {
        let Some(handler) = handler else {
            return Error::Registration("handler is NULL".to_string()).code();
        };
        manager
            .register_handler(Arc::new(CHandler(handler)))
            .map_or_else(|e| e.code(), |()| 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::isolate_home;
    use std::ffi::CString;
    use std::sync::Mutex;

    static SEEN: Mutex<Vec<(i8, i8, i8)>> = Mutex::new(Vec::new());

    extern "C" fn record(rule_id: i8, code: i8, diagnostic: i8) -> i8 {
        SEEN.lock().unwrap().push((rule_id, code, diagnostic));
        0
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_global_manager_built_from_isolated_defaults() {
        let home = isolate_home();
        let manager = manager().expect("default backend starts");

        assert_eq!(manager.adapter().name(), "proxy");
        assert!(crate::utils::get_state_dir().unwrap().starts_with(home));
        assert!(crate::utils::get_state_dir().unwrap().is_dir());
    }

    #[test]
    fn test_check_ip() {
        isolate_home();
        let valid = CString::new("192.168.1.1").unwrap();
        let invalid = CString::new("999.1.1.1").unwrap();
        unsafe {
            assert!(ipf_check_ip_is_valid(valid.as_ptr()));
            assert!(!ipf_check_ip_is_valid(invalid.as_ptr()));
            assert!(!ipf_check_ip_is_valid(std::ptr::null()));
        }
    }

    #[test]
    fn test_invalid_utf8_is_invalid_string() {
        isolate_home();
        let bytes = [0xffu8, 0xfe, 0];
        let code = unsafe { ipf_forward(bytes.as_ptr().cast(), 80, 8080, false) };
        assert_eq!(code, -10);
        assert_eq!(unsafe { ipf_forward(std::ptr::null(), 80, 8080, false) }, -10);
    }

    #[test]
    fn test_error_codes_cross_boundary() {
        isolate_home();
        let bad = CString::new("not-an-ip").unwrap();
        let ip = CString::new("127.0.0.1").unwrap();
        unsafe {
            assert_eq!(ipf_forward(bad.as_ptr(), 80, 8080, false), -11);
            assert_eq!(ipf_forward_range(ip.as_ptr(), 90, 80, 8080, false), -15);
            assert_eq!(ipf_forward_range(ip.as_ptr(), 1, 10, 65530, false), -14);
        }
        assert_eq!(ipf_cancel_forward(-3), -13);
        assert_eq!(ipf_register_error_handler(None), -16);
    }

    #[test]
    fn test_handler_receives_rule_id_code_and_diagnostic() {
        isolate_home();
        assert_eq!(ipf_register_error_handler(Some(record)), 0);

        let bad = CString::new("not-an-ip").unwrap();
        unsafe { ipf_forward(bad.as_ptr(), 80, 8080, false) };
        assert!(SEEN.lock().unwrap().contains(&(-1, -11, 0)));
    }

    #[test]
    fn test_forward_list_cancel() {
        isolate_home();
        let ip = CString::new("127.0.0.1").unwrap();
        let id = unsafe { ipf_forward(ip.as_ptr(), 7, free_port(), false) };
        assert!(id >= 0, "forward failed with {id}");

        let mut ids = [0i8; 128];
        let total = unsafe { ipf_active_rule_ids(ids.as_mut_ptr(), ids.len()) };
        assert!(total >= 1);
        assert!(ids[..total as usize].contains(&id));

        assert_eq!(ipf_cancel_forward(id), id);
        assert_eq!(ipf_cancel_forward(id), -13);
    }

    #[test]
    fn test_active_rule_ids_count_only() {
        isolate_home();
        let total = unsafe { ipf_active_rule_ids(std::ptr::null_mut(), 0) };
        assert!(total >= 0);
    }
}
