/*
 * Named selection groups and their persistence. A workspace's state (scan
 * settings, selection groups, the token cache) is stored as one JSON file
 * under the project-local `.contextpacker` directory. The file carries a
 * sha256 integrity field; a corrupted file is restored from the most recent
 * good backup, and every save rotates a timestamped backup of the previous
 * contents.
 *
 * The "Default" group always exists and cannot be deleted. A group that does
 * not exist reads as an empty selection, so a stale active-group name never
 * breaks rendering.
 */
use super::checksum_utils;
use super::config::ScanSettings;
use super::token_worker::TokenCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const PROJECT_CONFIG_DIR_NAME: &str = ".contextpacker";
const WORKSPACE_FILE_NAME: &str = "workspace.json";
const BACKUPS_SUBFOLDER_NAME: &str = "backups";
const MAX_BACKUPS: usize = 5;
pub const DEFAULT_GROUP_NAME: &str = "Default";
pub const WORKSPACE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Serde(serde_json::Error),
    /// The file or all of its backups failed checksum verification.
    Integrity(String),
    NoProjectDirectory,
    GroupNotFound(String),
    ProtectedGroup(String),
    InvalidGroupName(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serde(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::Serde(e) => write!(f, "Serialization/Deserialization error: {e}"),
            StoreError::Integrity(msg) => write!(f, "Workspace file integrity error: {msg}"),
            StoreError::NoProjectDirectory => {
                write!(f, "Could not determine project directory for workspace data")
            }
            StoreError::GroupNotFound(name) => write!(f, "Selection group not found: {name}"),
            StoreError::ProtectedGroup(name) => {
                write!(f, "Selection group '{name}' cannot be deleted")
            }
            StoreError::InvalidGroupName(name) => write!(
                f,
                "Invalid selection group name: {name}. Contains invalid characters or is empty."
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub fn is_valid_group_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == ' '
}

fn validate_group_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || !name.chars().all(is_valid_group_name_char) {
        return Err(StoreError::InvalidGroupName(name.to_string()));
    }
    Ok(())
}

/// A named, saved set of checked relative paths within a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionGroup {
    pub name: String,
    pub description: String,
    pub checked_paths: BTreeSet<String>,
}

/*
 * Everything persisted per workspace. `file_details` caches per-file token
 * counts keyed by relative path and is only trusted while `token_encoding`
 * matches the live tokenizer's encoding name.
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceData {
    pub schema_version: u32,
    pub root_folder: PathBuf,
    pub settings: ScanSettings,
    pub groups: BTreeMap<String, SelectionGroup>,
    pub active_group: String,
    #[serde(default)]
    pub token_encoding: String,
    #[serde(default)]
    pub file_details: TokenCache,
}

impl WorkspaceData {
    pub fn new(root_folder: PathBuf, settings: ScanSettings, token_encoding: &str) -> Self {
        let mut data = WorkspaceData {
            schema_version: WORKSPACE_SCHEMA_VERSION,
            root_folder,
            settings,
            groups: BTreeMap::new(),
            active_group: DEFAULT_GROUP_NAME.to_string(),
            token_encoding: token_encoding.to_string(),
            file_details: TokenCache::new(),
        };
        data.ensure_default_group();
        data
    }

    /// Guarantees the Default group exists (e.g. after loading old data).
    pub fn ensure_default_group(&mut self) {
        self.groups
            .entry(DEFAULT_GROUP_NAME.to_string())
            .or_insert_with(|| SelectionGroup {
                name: DEFAULT_GROUP_NAME.to_string(),
                description: "Default selection".to_string(),
                checked_paths: BTreeSet::new(),
            });
        if !self.groups.contains_key(&self.active_group) {
            self.active_group = DEFAULT_GROUP_NAME.to_string();
        }
    }

    /// The checked paths of a group; a missing group is an empty selection.
    pub fn checked_paths_of(&self, group_name: &str) -> BTreeSet<String> {
        self.groups
            .get(group_name)
            .map(|g| g.checked_paths.clone())
            .unwrap_or_default()
    }

    pub fn save_group(
        &mut self,
        name: &str,
        description: &str,
        checked_paths: BTreeSet<String>,
    ) -> Result<()> {
        validate_group_name(name)?;
        self.groups.insert(
            name.to_string(),
            SelectionGroup {
                name: name.to_string(),
                description: description.to_string(),
                checked_paths,
            },
        );
        Ok(())
    }

    pub fn delete_group(&mut self, name: &str) -> Result<()> {
        if name == DEFAULT_GROUP_NAME {
            return Err(StoreError::ProtectedGroup(name.to_string()));
        }
        if self.groups.remove(name).is_none() {
            return Err(StoreError::GroupNotFound(name.to_string()));
        }
        if self.active_group == name {
            self.active_group = DEFAULT_GROUP_NAME.to_string();
        }
        Ok(())
    }

    pub fn rename_group(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        if old_name == DEFAULT_GROUP_NAME {
            return Err(StoreError::ProtectedGroup(old_name.to_string()));
        }
        validate_group_name(new_name)?;
        let Some(mut group) = self.groups.remove(old_name) else {
            return Err(StoreError::GroupNotFound(old_name.to_string()));
        };
        group.name = new_name.to_string();
        self.groups.insert(new_name.to_string(), group);
        if self.active_group == old_name {
            self.active_group = new_name.to_string();
        }
        Ok(())
    }

    /*
     * Drops every cached token count when the live encoding differs from the
     * one the cache was produced with. Counts from one encoding are
     * meaningless under another.
     */
    pub fn invalidate_cache_for_encoding(&mut self, current_encoding: &str) {
        if self.token_encoding != current_encoding {
            log::info!(
                "WorkspaceData: Token encoding changed ('{}' -> '{current_encoding}'); \
                 discarding {} cached counts.",
                self.token_encoding,
                self.file_details.len()
            );
            self.file_details.clear();
            self.token_encoding = current_encoding.to_string();
        }
    }
}

pub trait WorkspaceStoreOperations: Send + Sync {
    fn load_workspace(&self, project_root: &Path) -> Result<Option<WorkspaceData>>;
    fn save_workspace(&self, project_root: &Path, data: &WorkspaceData) -> Result<()>;
}

pub struct CoreWorkspaceStore {}

impl CoreWorkspaceStore {
    pub fn new() -> Self {
        CoreWorkspaceStore {}
    }

    fn ensure_config_dir(project_root: &Path) -> Option<PathBuf> {
        let config_dir = project_root.join(PROJECT_CONFIG_DIR_NAME);
        if !config_dir.exists() {
            if let Err(e) = fs::create_dir_all(&config_dir) {
                log::error!("WorkspaceStore: Failed to create {config_dir:?}: {e}");
                return None;
            }
        }
        Some(config_dir)
    }

    fn backups_dir(config_dir: &Path) -> PathBuf {
        config_dir.join(BACKUPS_SUBFOLDER_NAME)
    }

    /// Copies the current workspace file aside before it is overwritten and
    /// prunes the oldest backups beyond the retention count.
    fn rotate_backup(config_dir: &Path, workspace_file: &Path) -> io::Result<()> {
        if !workspace_file.exists() {
            return Ok(());
        }
        let backups = Self::backups_dir(config_dir);
        fs::create_dir_all(&backups)?;

        let stamp = backup_timestamp();
        let mut backup_path = backups.join(format!("workspace_{stamp}.bak"));
        let mut suffix = 1;
        while backup_path.exists() {
            backup_path = backups.join(format!("workspace_{stamp}_{suffix}.bak"));
            suffix += 1;
        }
        fs::copy(workspace_file, &backup_path)?;

        let mut existing: Vec<PathBuf> = fs::read_dir(&backups)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "bak"))
            .collect();
        existing.sort();
        while existing.len() > MAX_BACKUPS {
            let oldest = existing.remove(0);
            log::debug!("WorkspaceStore: Pruning old backup {oldest:?}.");
            let _ = fs::remove_file(oldest);
        }
        Ok(())
    }

    /// Parses and checksum-verifies one workspace file.
    fn load_and_verify(path: &Path) -> Result<WorkspaceData> {
        let raw = fs::read_to_string(path)?;
        let envelope: Value = serde_json::from_str(&raw)?;
        let checksum = envelope
            .get("checksum")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Integrity("missing checksum field".to_string()))?
            .to_string();
        let data_value = envelope
            .get("data")
            .cloned()
            .ok_or_else(|| StoreError::Integrity("missing data field".to_string()))?;

        let canonical = serde_json::to_vec(&data_value)?;
        let calculated = checksum_utils::bytes_sha256(&canonical);
        if calculated != checksum {
            return Err(StoreError::Integrity(format!(
                "checksum mismatch in {path:?}"
            )));
        }

        let mut data: WorkspaceData = serde_json::from_value(data_value)?;
        data.ensure_default_group();
        Ok(data)
    }
}

impl Default for CoreWorkspaceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceStoreOperations for CoreWorkspaceStore {
    /*
     * Loads the workspace file for a project root. Returns `Ok(None)` when no
     * file exists yet. A file that fails verification is replaced by the
     * newest backup that still verifies; only when every candidate is bad
     * does the integrity error propagate.
     */
    fn load_workspace(&self, project_root: &Path) -> Result<Option<WorkspaceData>> {
        let config_dir =
            Self::ensure_config_dir(project_root).ok_or(StoreError::NoProjectDirectory)?;
        let workspace_file = config_dir.join(WORKSPACE_FILE_NAME);
        if !workspace_file.exists() {
            return Ok(None);
        }

        match Self::load_and_verify(&workspace_file) {
            Ok(data) => Ok(Some(data)),
            Err(primary_err) => {
                log::warn!(
                    "WorkspaceStore: Could not load {workspace_file:?} ({primary_err}); \
                     trying backups."
                );
                let backups = Self::backups_dir(&config_dir);
                let mut candidates: Vec<PathBuf> = match fs::read_dir(&backups) {
                    Ok(entries) => entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.extension().is_some_and(|ext| ext == "bak"))
                        .collect(),
                    Err(_) => Vec::new(),
                };
                candidates.sort();
                for backup in candidates.into_iter().rev() {
                    match Self::load_and_verify(&backup) {
                        Ok(data) => {
                            log::info!("WorkspaceStore: Restored workspace from {backup:?}.");
                            fs::copy(&backup, &workspace_file)?;
                            return Ok(Some(data));
                        }
                        Err(e) => {
                            log::warn!("WorkspaceStore: Backup {backup:?} is unusable: {e}");
                        }
                    }
                }
                Err(primary_err)
            }
        }
    }

    fn save_workspace(&self, project_root: &Path, data: &WorkspaceData) -> Result<()> {
        let config_dir =
            Self::ensure_config_dir(project_root).ok_or(StoreError::NoProjectDirectory)?;
        let workspace_file = config_dir.join(WORKSPACE_FILE_NAME);

        if let Err(e) = Self::rotate_backup(&config_dir, &workspace_file) {
            log::warn!("WorkspaceStore: Backup rotation failed: {e}");
        }

        let data_value = serde_json::to_value(data)?;
        let canonical = serde_json::to_vec(&data_value)?;
        let checksum = checksum_utils::bytes_sha256(&canonical);
        let envelope = serde_json::json!({
            "checksum": checksum,
            "data": data_value,
        });
        fs::write(&workspace_file, serde_json::to_string_pretty(&envelope)?)?;
        log::debug!("WorkspaceStore: Saved workspace data to {workspace_file:?}.");
        Ok(())
    }
}

/// Filesystem-safe UTC timestamp for backup filenames.
fn backup_timestamp() -> String {
    time::format_description::parse("[year][month][day]_[hour][minute][second]")
        .ok()
        .and_then(|format| time::OffsetDateTime::now_utc().format(&format).ok())
        .unwrap_or_else(|| "unknown".to_string())
}
