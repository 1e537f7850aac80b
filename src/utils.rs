//! Directory helpers and display formatting
//!
//! Configuration and state live under the platform's project directories:
//!
//! - Config/data: the `directories` data dir for `vpnguard`
//! - State (audit trail, log file): the state dir where the platform has
//!   one, falling back to the data dir

use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "vpnguard", "vpnguard")
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| {
        pd.state_dir()
            .unwrap_or_else(|| pd.data_dir())
            .to_path_buf()
    })
}

pub fn ensure_dirs() -> std::io::Result<()> {
    if let Some(dir) = get_data_dir() {
        std::fs::create_dir_all(dir)?;
    }
    if let Some(dir) = get_state_dir() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

/// Formats a byte count for the stats output, e.g. `1.21 MiB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Formats a connect duration as `h:mm:ss`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
