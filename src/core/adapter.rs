//! Boundary to the OS-level forwarding engine.
//!
//! The manager never touches packet filtering itself; it issues one
//! install or remove per mapping through [`FirewallAdapter`] and interprets
//! the result. Production backends live in [`crate::core::nft`] and
//! [`crate::core::proxy`].

use std::sync::Arc;

use crate::core::error::AdapterFailure;
use crate::core::rule::Mapping;

/// Applies or removes single port mappings at the OS level.
///
/// Both calls are synchronous and run to completion. The manager serializes
/// calls under its table lock, so implementations see at most one call at a
/// time from a given manager.
pub trait FirewallAdapter: Send + Sync {
    /// Installs `mapping`. `allow_lan` is passed through verbatim.
    fn install(&self, mapping: &Mapping, allow_lan: bool) -> Result<(), AdapterFailure>;

    /// Removes a previously installed `mapping`.
    fn remove(&self, mapping: &Mapping) -> Result<(), AdapterFailure>;

    /// Short backend name for logs
    fn name(&self) -> &'static str {
        "adapter"
    }
}

impl<A: FirewallAdapter + ?Sized> FirewallAdapter for Box<A> {
    fn install(&self, mapping: &Mapping, allow_lan: bool) -> Result<(), AdapterFailure> {
        (**self).install(mapping, allow_lan)
    }

    fn remove(&self, mapping: &Mapping) -> Result<(), AdapterFailure> {
        (**self).remove(mapping)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

impl<A: FirewallAdapter + ?Sized> FirewallAdapter for Arc<A> {
    fn install(&self, mapping: &Mapping, allow_lan: bool) -> Result<(), AdapterFailure> {
        (**self).install(mapping, allow_lan)
    }

    fn remove(&self, mapping: &Mapping) -> Result<(), AdapterFailure> {
        (**self).remove(mapping)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
