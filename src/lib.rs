//! ipf - TCP port forwarding rule manager
//!
//! Maps a local TCP port (or a range of them) to a port on another host and
//! keeps track of every active mapping under a small integer id.
//!
//! # Architecture
//!
//! - [`core`] - Rule lifecycle, id allocation, and the forwarding backends
//! - [`validators`] - Address and port validation
//! - [`ffi`] - C ABI over a process-wide manager
//! - [`audit`] - Audit log of privileged nftables operations
//! - [`elevation`] - Privileged `nft` invocation
//! - [`config`] - Configuration persistence and backend selection
//! - [`utils`] - XDG directories and logging setup
//!
//! # Guarantees
//!
//! - At most 128 concurrent rules, ids `0..=127`, lowest free id first
//! - Range forwards are all-or-nothing
//! - A failed operation leaves no partial state behind
//! - Every failure is returned to the caller and sent to the error handler

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod ffi;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::adapter::FirewallAdapter;
pub use core::error::{AdapterFailure, Error, Result};
pub use core::ids::RuleId;
pub use core::manager::ForwardManager;
pub use core::notifier::ErrorNotifier;
pub use core::rule::{ForwardRule, Mapping};
