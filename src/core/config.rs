/*
 * Plain configuration values consumed by the core. `ScanSettings` carries the
 * knobs the scanner, watcher, and filter share; it is serialized into the
 * workspace file by the persistence layer and passed by reference into the
 * core, which never mutates it.
 *
 * The module also persists the last-opened workspace root in the per-user
 * configuration directory, via a trait so tests can substitute a mock.
 */
use crate::core::path_utils;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

const LAST_WORKSPACE_ROOT_FILENAME: &str = "last_workspace_root.txt";

/// Folder names excluded from scanning by default.
pub const DEFAULT_IGNORE_FOLDERS: &[&str] = &[
    ".git",
    "__pycache__",
    ".vscode",
    ".idea",
    "node_modules",
    "venv",
    ".svn",
    "dist",
    "build",
    "target",
    "out",
    "bin",
    "obj",
];

/// Default per-file size ceiling: 200 KB.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 200 * 1024;

/// Default ceiling on content embedded per file in the rendered artifact.
pub const DEFAULT_MAX_RENDER_FILE_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanSettings {
    pub ignore_folders: Vec<String>,
    /// Additional glob patterns matched against relative paths or file names.
    #[serde(default)]
    pub custom_ignore_patterns: Vec<String>,
    pub max_file_size_bytes: u64,
    #[serde(default = "default_true")]
    pub include_subfolders: bool,
    #[serde(default)]
    pub live_watcher_enabled: bool,
    #[serde(default = "default_max_render_file_bytes")]
    pub max_render_file_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_render_file_bytes() -> u64 {
    DEFAULT_MAX_RENDER_FILE_BYTES
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            ignore_folders: DEFAULT_IGNORE_FOLDERS.iter().map(|s| s.to_string()).collect(),
            custom_ignore_patterns: Vec::new(),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            include_subfolders: true,
            live_watcher_enabled: false,
            max_render_file_bytes: DEFAULT_MAX_RENDER_FILE_BYTES,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    NoConfigDirectory,
    Utf8Error(std::string::FromUtf8Error),
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<std::string::FromUtf8Error> for ConfigError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        ConfigError::Utf8Error(err)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Configuration I/O error: {e}"),
            ConfigError::NoConfigDirectory => {
                write!(f, "Could not determine configuration directory")
            }
            ConfigError::Utf8Error(e) => write!(f, "Configuration file UTF-8 error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Utf8Error(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub trait ConfigManagerOperations: Send + Sync {
    fn load_last_workspace_root(&self, app_name: &str) -> Result<Option<PathBuf>>;
    fn save_last_workspace_root(&self, app_name: &str, root: Option<&Path>) -> Result<()>;
}

pub struct CoreConfigManager {}

impl CoreConfigManager {
    pub fn new() -> Self {
        CoreConfigManager {}
    }
}

impl Default for CoreConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManagerOperations for CoreConfigManager {
    /*
     * Loads the root path of the last opened workspace, if one was recorded.
     * An absent or empty record yields `Ok(None)`.
     */
    fn load_last_workspace_root(&self, app_name: &str) -> Result<Option<PathBuf>> {
        let config_dir = path_utils::get_base_app_config_local_dir(app_name)
            .ok_or(ConfigError::NoConfigDirectory)?;
        let file_path = config_dir.join(LAST_WORKSPACE_ROOT_FILENAME);

        if !file_path.exists() {
            log::debug!("ConfigManager: Last workspace file {file_path:?} does not exist.");
            return Ok(None);
        }

        let mut file = File::open(&file_path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(PathBuf::from(trimmed)))
        }
    }

    /*
     * Saves (or clears, when `root` is None) the last opened workspace root.
     */
    fn save_last_workspace_root(&self, app_name: &str, root: Option<&Path>) -> Result<()> {
        let config_dir = path_utils::get_base_app_config_local_dir(app_name)
            .ok_or(ConfigError::NoConfigDirectory)?;
        let file_path = config_dir.join(LAST_WORKSPACE_ROOT_FILENAME);

        let mut file = File::create(&file_path)?;
        if let Some(root) = root {
            write!(file, "{}", root.display())?;
            log::debug!("ConfigManager: Saved last workspace root {root:?} to {file_path:?}.");
        } else {
            log::debug!("ConfigManager: Cleared last workspace root in {file_path:?}.");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_settings_defaults() {
        let settings = ScanSettings::default();
        assert!(settings.ignore_folders.contains(&"node_modules".to_string()));
        assert!(settings.ignore_folders.contains(&".git".to_string()));
        assert_eq!(settings.max_file_size_bytes, 200 * 1024);
        assert!(settings.include_subfolders);
        assert!(!settings.live_watcher_enabled);
    }

    #[test]
    fn test_scan_settings_round_trip() {
        let mut settings = ScanSettings::default();
        settings.ignore_folders = vec!["node_modules".into()];
        settings.custom_ignore_patterns = vec!["*.log".into()];
        settings.max_file_size_bytes = 1024;
        settings.live_watcher_enabled = true;

        let json = serde_json::to_string(&settings).unwrap();
        let back: ScanSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(settings, back);
    }

    #[test]
    fn test_scan_settings_tolerates_missing_optional_fields() {
        // A settings blob written before the optional fields existed.
        let json = r#"{"ignore_folders":["target"],"max_file_size_bytes":4096}"#;
        let settings: ScanSettings = serde_json::from_str(json).unwrap();
        assert!(settings.include_subfolders);
        assert!(!settings.live_watcher_enabled);
        assert!(settings.custom_ignore_patterns.is_empty());
        assert_eq!(settings.max_render_file_bytes, DEFAULT_MAX_RENDER_FILE_BYTES);
    }

    #[test]
    fn test_save_and_load_last_workspace_root() {
        let app_name = format!("TestApp_ContextPackerCfg_{}", rand::random::<u128>());
        let manager = CoreConfigManager::new();

        assert_eq!(manager.load_last_workspace_root(&app_name).unwrap(), None);

        let root = PathBuf::from("/some/workspace");
        manager
            .save_last_workspace_root(&app_name, Some(&root))
            .unwrap();
        assert_eq!(
            manager.load_last_workspace_root(&app_name).unwrap(),
            Some(root)
        );

        manager.save_last_workspace_root(&app_name, None).unwrap();
        assert_eq!(manager.load_last_workspace_root(&app_name).unwrap(), None);

        // Cleanup the per-user directory created for this unique app name.
        if let Some(dir) = path_utils::get_base_app_config_local_dir(&app_name) {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
