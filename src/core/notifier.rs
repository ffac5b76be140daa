//! Error handler registry
//!
//! A single replaceable slot holding the [`ErrorNotifier`] that receives
//! every failure the manager returns. Notification is a side channel; it
//! never changes the outcome already returned to the caller.

use std::sync::{Arc, RwLock};

use crate::core::error::{Error, Result};
use crate::core::ids::RuleId;

/// Receives failures from manager operations.
///
/// `rule_id` is set when the failure concerns an existing rule (cancel).
/// The returned code is advisory and only logged.
pub trait ErrorNotifier: Send + Sync {
    fn notify(&self, rule_id: Option<RuleId>, error: &Error) -> i8;
}

impl<F> ErrorNotifier for F
where
    F: Fn(Option<RuleId>, &Error) -> i8 + Send + Sync,
{
    fn notify(&self, rule_id: Option<RuleId>, error: &Error) -> i8 {
        self(rule_id, error)
    }
}

#[derive(Default)]
pub struct HandlerSlot {
    handler: RwLock<Option<Arc<dyn ErrorNotifier>>>,
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler`, dropping the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registration`] if a handler panicked while the slot
    /// was being replaced and the lock is poisoned.
    pub fn register(&self, handler: Arc<dyn ErrorNotifier>) -> Result<()> {
        let mut slot = self
            .handler
            .write()
            .map_err(|_| Error::Registration("handler slot poisoned".to_string()))?;
        *slot = Some(handler);
        Ok(())
    }

    /// Empties the slot, returning whether a handler was installed.
    pub fn clear(&self) -> Result<bool> {
        let mut slot = self
            .handler
            .write()
            .map_err(|_| Error::Registration("handler slot poisoned".to_string()))?;
        Ok(slot.take().is_some())
    }

    pub fn is_registered(&self) -> bool {
        self.handler.read().is_ok_and(|slot| slot.is_some())
    }

    /// Delivers `error` to the current handler, if any.
    ///
    /// The handler is cloned out of the slot before it runs, so it may
    /// re-register or call back into the manager.
    pub fn notify(&self, rule_id: Option<RuleId>, error: &Error) {
        let handler = match self.handler.read() {
            Ok(slot) => slot.clone(),
            Err(_) => {
                tracing::warn!("Error handler slot poisoned, dropping notification");
                return;
            }
        };

        if let Some(handler) = handler {
            let code = handler.notify(rule_id, error);
            tracing::trace!("Error handler returned {code} for {error}");
        }
    }
}

impl std::fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("registered", &self.is_registered())
            .finish()
    }
}
