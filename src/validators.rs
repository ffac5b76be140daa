//! Input validation for forward requests
//!
//! Everything here is pure and runs before the rule table or the firewall
//! adapter is touched, so a rejected request never has side effects.

use std::net::IpAddr;

use crate::core::error::{Error, Result};

/// Checks whether `address` is a well-formed IPv4 or IPv6 address.
///
/// IPv4 must be a dotted quad of four decimal groups in `0..=255` with no
/// leading zeros, signs, whitespace or trailing garbage. IPv6 accepts the
/// standard colon-hex forms. Never fails; bad input is simply `false`.
///
/// # Examples
///
/// ```
/// use ipf::validators::is_valid_address;
///
/// assert!(is_valid_address("192.168.1.1"));
/// assert!(is_valid_address("2001:db8::1"));
/// assert!(!is_valid_address("999.1.1.1"));
/// assert!(!is_valid_address("1.2.3"));
/// ```
pub fn is_valid_address(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok()
}

/// Parses a forward target.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] carrying the rejected input.
pub fn parse_address(address: &str) -> Result<IpAddr> {
    address
        .parse::<IpAddr>()
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns [`Error::InvalidPort`] if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        Err(Error::InvalidPort)
    } else {
        Ok(port)
    }
}

/// Validates a remote port range and the local ports it maps onto.
///
/// Returns the span (`end - start`) on success.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either remote port or the local start is 0
/// - Start port is greater than end port
/// - `local_start + span` does not fit in a port number
pub fn validate_port_range(remote_start: u16, remote_end: u16, local_start: u16) -> Result<u16> {
    if remote_end < remote_start {
        return Err(Error::InvalidPortRange {
            start: remote_start,
            end: remote_end,
        });
    }

    validate_port(remote_start)?;
    validate_port(local_start)?;

    let span = remote_end - remote_start;
    if local_start.checked_add(span).is_none() {
        return Err(Error::LocalPortOverflow { local_start, span });
    }

    Ok(span)
}

/// Checks if an IP is in a reserved range and returns informational warning.
///
/// This is informational only and does not block forwarding.
pub fn check_reserved_ip(ip: IpAddr) -> Option<String> {
    match ip {
        IpAddr::V4(ipv4) => {
            if ipv4.is_private() {
                return Some("Private IP range (RFC 1918) - usually safe for LAN".to_string());
            }

            if ipv4.is_loopback() {
                return Some("Loopback target (127.x) - forwarding to this host".to_string());
            }

            if ipv4.is_link_local() {
                return Some("Link-local range (169.254.x.x) - APIPA addresses".to_string());
            }

            if ipv4.is_unspecified() || ipv4.is_broadcast() {
                return Some(format!("{ipv4} is not a routable unicast target"));
            }

            None
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() {
                return Some("IPv6 loopback (::1) - forwarding to this host".to_string());
            }

            if ipv6.segments()[0] & 0xffc0 == 0xfe80 {
                return Some("IPv6 link-local (fe80::/10) - local network only".to_string());
            }

            if ipv6.is_unspecified() {
                return Some("IPv6 unspecified (::) is not a routable target".to_string());
            }

            None
        }
    }
}
