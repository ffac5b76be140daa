//! Forward rule data structures
//!
//! A [`Mapping`] is the external effect of one rule: traffic arriving on
//! `local_port` is sent to `remote_address:remote_port`. A [`ForwardRule`]
//! is a mapping that is currently installed and owns a [`RuleId`].

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::core::ids::RuleId;

/// One single-port mapping, the unit the firewall adapters operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mapping {
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub local_port: u16,
}

impl Mapping {
    pub const fn new(remote_address: IpAddr, remote_port: u16, local_port: u16) -> Self {
        Self {
            remote_address,
            remote_port,
            local_port,
        }
    }

    /// Destination the traffic is forwarded to
    pub const fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} -> {}", self.local_port, self.remote())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub id: RuleId,
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub local_port: u16,
    /// Whether LAN-originated traffic may use this mapping
    pub allow_lan: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ForwardRule {
    pub fn new(id: RuleId, mapping: Mapping, allow_lan: bool) -> Self {
        Self {
            id,
            remote_address: mapping.remote_address,
            remote_port: mapping.remote_port,
            local_port: mapping.local_port,
            allow_lan,
            created_at: chrono::Utc::now(),
        }
    }

    pub const fn mapping(&self) -> Mapping {
        Mapping::new(self.remote_address, self.remote_port, self.local_port)
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.mapping())?;
        if self.allow_lan {
            write!(f, " (lan)")?;
        }
        Ok(())
    }
}
