//! Core port-forwarding functionality
//!
//! This module contains the rule lifecycle and the backends that apply it.
//! It provides:
//!
//! - [`manager`]: Forward/range/cancel orchestration with rollback
//! - [`table`] and [`ids`]: Active rule registry and bounded id space
//! - [`rule`]: Mapping and rule records
//! - [`adapter`]: Trait boundary to the OS forwarding engine
//! - [`nft`]: nftables DNAT backend
//! - [`proxy`]: Userspace TCP relay backend
//! - [`notifier`]: Error handler registry
//! - [`rollback`]: Accumulate-and-compensate helper
//! - [`error`]: Error types and stable codes

pub mod adapter;
pub mod error;
pub mod ids;
pub mod manager;
pub mod nft;
pub mod notifier;
pub mod proxy;
pub mod rollback;
pub mod rule;
pub mod table;

#[cfg(test)]
pub mod test_helpers;
