//! Privilege elevation for nftables operations
//!
//! Installing NAT rules needs `CAP_NET_ADMIN`. ipf runs as an unprivileged
//! user and only elevates the `nft` invocations issued by the nftables
//! backend.
//!
//! # Elevation Strategy
//!
//! - **Preferred (all modes)**: Uses `run0` when available (systemd v256+, no SUID)
//! - **CLI fallback**: Uses `sudo` when stdin is a terminal
//! - **Host app fallback**: Uses `pkexec` for graphical authentication
//!
//! # Environment Variables
//!
//! - `IPF_ELEVATION_METHOD`: Force a specific elevation method (`sudo`, `run0`, or `pkexec`).
//! - `IPF_NFT_COMMAND`: Run this program instead of `nft` (used by the test suite's mock).
//! - `IPF_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Security
//!
//! - Only `nft` can be elevated
//! - Commands are constructed without shell interpolation
//! - Elevation binaries are checked for availability

use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `IPF_ELEVATION_METHOD`
    #[error("Invalid IPF_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Wraps `program args..` in `wrapper` (sudo/run0/pkexec).
fn wrapped(wrapper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

fn build_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict test mode override, also covers root
    if std::env::var("IPF_TEST_NO_ELEVATION").is_ok() || nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Explicit elevation method override (for sudoers NOPASSWD setups, etc.)
    if let Ok(method) = std::env::var("IPF_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrapped(&method, program, args))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 3. Automatic detection - prefer run0, fall back to sudo/pkexec
    if binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", program, args))
    } else if binary_exists("pkexec") {
        Ok(wrapped("pkexec", program, args))
    } else {
        Err(ElevationError::PkexecNotFound)
    }
}

/// Creates an elevated `nft` command with the specified arguments
///
/// Arguments are passed directly to `nft` without shell interpretation.
///
/// # Example
///
/// ```no_run
/// use ipf::elevation::create_elevated_nft_command;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cmd = create_elevated_nft_command(&["--json", "-f", "-"])?;
/// cmd.stdin(std::process::Stdio::piped());
/// # Ok(())
/// # }
/// ```
pub fn create_elevated_nft_command(args: &[&str]) -> Result<Command, ElevationError> {
    let program = std::env::var("IPF_NFT_COMMAND").unwrap_or_else(|_| "nft".to_string());
    build_elevated_command(&program, args)
}
