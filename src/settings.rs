//! Host settings

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "WARDEN_DATA_DIR";

/// Fallback data directory when no user data dir exists
pub const SYSTEM_DATA_DIR: &str = "/var/lib/warden";

/// Where Warden keeps its state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Data directory
    pub data_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(SYSTEM_DATA_DIR),
        }
    }
}

impl Settings {
    /// Resolve settings from the process environment
    pub fn resolve(data_dir: Option<PathBuf>) -> Self {
        Self::resolve_with(data_dir, std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
    }

    /// Resolve with an explicit flag and environment value; the flag wins
    pub fn resolve_with(flag: Option<PathBuf>, env: Option<PathBuf>) -> Self {
        let data_dir = flag
            .or(env.filter(|p| !p.as_os_str().is_empty()))
            .or_else(|| dirs::data_dir().map(|d| d.join("warden")))
            .unwrap_or_else(|| PathBuf::from(SYSTEM_DATA_DIR));

        Self { data_dir }
    }

    /// Directory holding named volumes
    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }
}

/// Project name: the declared one, else the project directory name
pub fn project_name(declared: Option<&str>, project_dir: &Path) -> String {
    declared
        .map(str::to_string)
        .or_else(|| {
            project_dir
                .file_name()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "default".to_string())
}
