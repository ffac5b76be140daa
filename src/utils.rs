//! Utility functions for directory management and logging setup
//!
//! Paths follow the XDG Base Directory specification:
//!
//! - Data: `~/.local/share/ipf/` - Configuration file
//! - State: `~/.local/state/ipf/` - Log file and audit log
//!
//! # Example
//!
//! ```no_run
//! use ipf::utils::{ensure_dirs, get_data_dir};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     println!("config lives in {}", data_path.display());
//! }
//! ```

use directories::ProjectDirs;
use std::path::PathBuf;

pub fn get_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "ipf", "ipf").map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "ipf", "ipf")
        .and_then(|pd| pd.state_dir().map(std::path::Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = DirBuilder::new();
    builder.mode(0o700); // User read/write/execute only
    builder.recursive(true);

    if let Some(dir) = get_data_dir() {
        builder.create(dir)?;
    }
    if let Some(dir) = get_state_dir() {
        builder.create(dir)?;
    }

    Ok(())
}

/// Installs the global `tracing` subscriber.
///
/// With `to_file`, output is appended to `$STATE/ipf.log` (the directory is
/// created first); if that cannot be opened it goes to stderr. A subscriber
/// installed earlier by the host wins.
pub fn init_logging(to_file: bool) {
    if to_file
        && ensure_dirs().is_ok()
        && let Some(mut log_path) = get_state_dir()
    {
        log_path.push("ipf.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let _ = tracing_subscriber::fmt()
                .with_writer(file)
                .with_ansi(false)
                .try_init();
            return;
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init();
}
