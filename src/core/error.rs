use std::io;

use thiserror::Error;

use crate::core::ids::RuleId;
use crate::core::rule::Mapping;

/// Core error types for ipf
///
/// Every variant maps to a stable negative code (see [`Error::code`]), so the
/// same value can cross the C ABI unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// Input string was not valid UTF-8 (C ABI only)
    #[error("Invalid C format string")]
    InvalidString,

    /// The target address is not a valid IPv4/IPv6 address
    #[error("The IP address is invalid: {0:?}")]
    InvalidAddress(String),

    /// All 128 rule ids are in use
    #[error("At most {} rules are allowed", crate::core::ids::MAX_RULES)]
    ResourceExhausted,

    /// Cancel/lookup target not found
    #[error("The forward rule ID is invalid: {0}")]
    UnknownRuleId(i8),

    /// Local port start would push the local port end past 65535
    #[error("The local port start is invalid: {local_start} + {span} exceeds 65535")]
    LocalPortOverflow { local_start: u16, span: u16 },

    /// Remote port end lies before remote port start
    #[error("The remote port end is invalid: {end} < {start}")]
    InvalidPortRange { start: u16, end: u16 },

    /// Error handler could not be registered
    #[error("Error handler registration failed: {0}")]
    Registration(String),

    /// The firewall adapter rejected or failed to apply a mapping
    #[error("Failed to install {mapping}: {cause}")]
    InstallationFailed {
        mapping: Mapping,
        cause: AdapterFailure,
    },

    /// The firewall adapter failed to remove an existing mapping
    #[error("Failed to remove rule {id}: {cause}")]
    RemovalFailed { id: RuleId, cause: AdapterFailure },

    /// Port 0 cannot be forwarded
    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    /// Internal logic error (poisoned lock, runtime setup)
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns the stable negative code for this error.
    ///
    /// Library errors live in `-10..=-50`; `-1` covers ambient failures
    /// (I/O, serialization) that have no dedicated kind.
    pub const fn code(&self) -> i8 {
        match self {
            Self::InvalidString => -10,
            Self::InvalidAddress(_) => -11,
            Self::ResourceExhausted => -12,
            Self::UnknownRuleId(_) => -13,
            Self::LocalPortOverflow { .. } => -14,
            Self::InvalidPortRange { .. } => -15,
            Self::Registration(_) => -16,
            Self::InstallationFailed { .. } => -17,
            Self::RemovalFailed { .. } => -18,
            Self::InvalidPort => -19,
            Self::Internal(_) => -20,
            Self::Io(_) | Self::Serialization(_) => -1,
        }
    }

    /// Adapter-supplied diagnostic for install/removal failures.
    pub const fn diagnostic(&self) -> Option<AdapterFailure> {
        match self {
            Self::InstallationFailed { cause, .. } | Self::RemovalFailed { cause, .. } => {
                Some(*cause)
            }
            _ => None,
        }
    }
}

/// Failure reported by a firewall adapter.
///
/// Codes occupy the OS range `-51..=-127`, with `-1` for anything unclassified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum AdapterFailure {
    #[error("Unknown error")]
    Unknown,

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Address already in use")]
    AddrInUse,

    #[error("Address already exists")]
    AlreadyExists,

    /// An operation could not be completed, because it failed
    /// to allocate enough memory.
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Too many open files")]
    TooManyOpenFiles,
}

impl AdapterFailure {
    pub const fn code(self) -> i8 {
        match self {
            Self::Unknown => -1,
            Self::PermissionDenied => -51,
            Self::AddrInUse => -52,
            Self::AlreadyExists => -53,
            Self::OutOfMemory => -54,
            Self::TooManyOpenFiles => -55,
        }
    }

    /// Classifies `nft` stderr output.
    ///
    /// Matching is case-insensitive and keyed on the kernel/libnftables
    /// phrasing, falling back to [`AdapterFailure::Unknown`].
    pub fn from_nft_stderr(msg: &str) -> Self {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("cache initialization failed")
        {
            return Self::PermissionDenied;
        }

        if lower.contains("address already in use") || lower.contains("resource busy") {
            return Self::AddrInUse;
        }

        if lower.contains("already exists") || lower.contains("file exists") {
            return Self::AlreadyExists;
        }

        if lower.contains("cannot allocate memory") || lower.contains("out of memory") {
            return Self::OutOfMemory;
        }

        if lower.contains("too many open files") {
            return Self::TooManyOpenFiles;
        }

        Self::Unknown
    }
}

impl From<io::Error> for AdapterFailure {
    fn from(io_error: io::Error) -> Self {
        if io_error.raw_os_error() == Some(nix::errno::Errno::EMFILE as i32) {
            return Self::TooManyOpenFiles;
        }
        Self::from(io_error.kind())
    }
}

impl From<io::ErrorKind> for AdapterFailure {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::AddrInUse => Self::AddrInUse,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
