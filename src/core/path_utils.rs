/*
 * Path helpers shared across the core: resolution of the per-user application
 * configuration directory, and normalization of tree paths to the relative,
 * forward-slash form used as node keys.
 */
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

/*
 * Retrieves the application's local configuration directory, creating it if
 * necessary. The path is derived without an organization qualifier, placing it
 * directly under the user's local application data directory. Returns `None`
 * if the directory could not be determined or created.
 */
pub fn get_base_app_config_local_dir(app_name: &str) -> Option<PathBuf> {
    ProjectDirs::from("", "", app_name).and_then(|proj_dirs| {
        let config_path = proj_dirs.config_local_dir();
        if !config_path.exists() {
            if let Err(e) = fs::create_dir_all(config_path) {
                log::error!("PathUtils: Failed to create config directory {config_path:?}: {e}");
                return None;
            }
            log::debug!("PathUtils: Created config directory: {config_path:?}");
        }
        Some(config_path.to_path_buf())
    })
}

/*
 * Converts an absolute path inside `root` to the relative, forward-slash key
 * used throughout the tree index. Returns `None` when the path is not under
 * the root. The root itself maps to the empty string.
 */
pub fn to_relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut key = String::new();
    for component in relative.components() {
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    Some(key)
}

/// Inverse of `to_relative_key`: joins a relative key onto the root using the
/// host platform's separators.
pub fn from_relative_key(root: &Path, key: &str) -> PathBuf {
    if key.is_empty() {
        return root.to_path_buf();
    }
    let mut path = root.to_path_buf();
    for segment in key.split('/') {
        path.push(segment);
    }
    path
}

/// Parent key of a relative key, or `None` for the root key itself.
pub fn parent_key(key: &str) -> Option<&str> {
    if key.is_empty() {
        return None;
    }
    Some(match key.rfind('/') {
        Some(idx) => &key[..idx],
        None => "",
    })
}

/// Final path segment of a relative key. The root key yields an empty name.
pub fn file_name_of_key(key: &str) -> &str {
    match key.rfind('/') {
        Some(idx) => &key[idx + 1..],
        None => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_base_app_config_local_dir_creates_and_reuses() {
        let unique_app_name = format!("TestApp_ContextPacker_{}", rand::random::<u128>());

        let first = get_base_app_config_local_dir(&unique_app_name).unwrap();
        assert!(first.is_dir());

        let second = get_base_app_config_local_dir(&unique_app_name).unwrap();
        assert_eq!(first, second);

        // Cleanup the directory created for this unique name.
        if let Some(proj_dirs) = ProjectDirs::from("", "", &unique_app_name) {
            let _ = fs::remove_dir_all(proj_dirs.config_local_dir());
        }
    }

    #[test]
    fn test_to_relative_key_uses_forward_slashes() {
        let root = Path::new("/workspace/project");
        let nested = root.join("src").join("core").join("main.rs");
        assert_eq!(
            to_relative_key(root, &nested),
            Some("src/core/main.rs".to_string())
        );
    }

    #[test]
    fn test_to_relative_key_root_is_empty() {
        let root = Path::new("/workspace/project");
        assert_eq!(to_relative_key(root, root), Some(String::new()));
    }

    #[test]
    fn test_to_relative_key_outside_root() {
        let root = Path::new("/workspace/project");
        assert_eq!(to_relative_key(root, Path::new("/elsewhere/file.txt")), None);
    }

    #[test]
    fn test_from_relative_key_round_trip() {
        let root = Path::new("/workspace/project");
        let path = from_relative_key(root, "src/lib.rs");
        assert_eq!(to_relative_key(root, &path), Some("src/lib.rs".to_string()));
        assert_eq!(from_relative_key(root, ""), root.to_path_buf());
    }

    #[test]
    fn test_parent_key_chain() {
        assert_eq!(parent_key("src/core/main.rs"), Some("src/core"));
        assert_eq!(parent_key("src/core"), Some("src"));
        assert_eq!(parent_key("src"), Some(""));
        assert_eq!(parent_key(""), None);
    }

    #[test]
    fn test_file_name_of_key() {
        assert_eq!(file_name_of_key("src/core/main.rs"), "main.rs");
        assert_eq!(file_name_of_key("src"), "src");
        assert_eq!(file_name_of_key(""), "");
    }
}
