//! Platform-specific locations for desktop and companion state

use std::path::{Path, PathBuf};

/// Get the platform-specific data directory for storing application data
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\PairSync
/// - macOS: ~/Library/Application Support/PairSync
/// - Linux/Other: ~/.local/share/pairsync
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    if cfg!(any(target_os = "windows", target_os = "macos")) {
        base.join("PairSync")
    } else {
        base.join("pairsync")
    }
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    if cfg!(any(target_os = "windows", target_os = "macos")) {
        base.join("PairSync")
    } else {
        base.join("pairsync")
    }
}

/// Desktop store inside a data directory
pub fn desktop_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("desktop.db")
}

/// Companion cache inside a data directory
pub fn companion_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("companion.db")
}

/// Root CA material inside a data directory
pub fn ca_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("ca")
}

/// Default daemon config file
pub fn default_config_path() -> PathBuf {
    get_config_dir().join("pairsync.toml")
}

/// Ensure the data directory exists, creating it if necessary
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Restrict a file holding secret material to the current user.
#[cfg(unix)]
pub fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

/// Restrict a file holding secret material to the current user.
#[cfg(not(unix))]
pub fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
