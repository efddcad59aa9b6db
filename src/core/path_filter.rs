/*
 * Evaluates ignore rules against candidate paths. One `PathFilter` is compiled
 * per workspace open and shared by the scanner and the watcher, so a path gets
 * the same verdict whether it is seen during the initial walk or arrives later
 * as a filesystem event.
 *
 * Rule precedence, first match wins:
 *   1. a path segment equal to a configured ignore-folder name;
 *   2. a hidden segment (leading '.');
 *   3. `.gitignore` patterns, nearest directory first, `!` whitelists honored;
 *   4. custom glob patterns from the scan settings;
 *   5. otherwise not ignored.
 */
use super::config::ScanSettings;
use super::path_utils;
use glob::Pattern;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct PathFilter {
    root: PathBuf,
    ignore_folders: HashSet<String>,
    custom_patterns: Vec<Pattern>,
    /// (directory key, compiled rules), sorted deepest directory first.
    gitignores: Vec<(String, Gitignore)>,
}

impl PathFilter {
    /*
     * Compiles the filter for a workspace root: lowercases the folder-name
     * set, parses the custom glob patterns (invalid ones are skipped with a
     * warning), and loads every reachable `.gitignore` under the root.
     * `.gitignore` files inside directories that are themselves ignored by
     * the folder rules, the hidden rule, or a shallower `.gitignore` are not
     * loaded.
     */
    pub fn build(root: &Path, settings: &ScanSettings) -> Self {
        let ignore_folders: HashSet<String> = settings
            .ignore_folders
            .iter()
            .map(|name| name.to_lowercase())
            .collect();

        let mut custom_patterns = Vec::new();
        for raw in &settings.custom_ignore_patterns {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match Pattern::new(trimmed) {
                Ok(pattern) => custom_patterns.push(pattern),
                Err(e) => {
                    log::warn!("PathFilter: Invalid ignore pattern '{raw}' skipped: {e}");
                }
            }
        }

        let mut filter = PathFilter {
            root: root.to_path_buf(),
            ignore_folders,
            custom_patterns,
            gitignores: Vec::new(),
        };
        filter.load_gitignores();
        filter
    }

    /*
     * Returns true when the path must not appear in the index. The key is the
     * relative forward-slash form; the workspace root itself (empty key) is
     * never ignored.
     */
    pub fn matches(&self, relative_key: &str, is_dir: bool) -> bool {
        if relative_key.is_empty() {
            return false;
        }

        for segment in relative_key.split('/') {
            if segment.starts_with('.') {
                return true;
            }
            if self.ignore_folders.contains(&segment.to_lowercase()) {
                return true;
            }
        }

        let absolute = path_utils::from_relative_key(&self.root, relative_key);
        for (dir_key, gitignore) in &self.gitignores {
            let applies = dir_key.is_empty()
                || relative_key
                    .strip_prefix(dir_key.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
            if !applies {
                continue;
            }
            let verdict = gitignore.matched_path_or_any_parents(&absolute, is_dir);
            if verdict.is_ignore() {
                return true;
            }
            if verdict.is_whitelist() {
                // Explicit un-ignore from the nearest file ends evaluation.
                return false;
            }
        }

        let file_name = path_utils::file_name_of_key(relative_key);
        for pattern in &self.custom_patterns {
            if pattern.matches(relative_key) || pattern.matches(file_name) {
                return true;
            }
        }

        false
    }

    fn load_gitignores(&mut self) {
        // Candidates sorted shallow-first so ancestor rules can veto deeper
        // files while the chain is being built.
        let mut candidates: Vec<(usize, String, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() || entry.file_name() != ".gitignore" {
                continue;
            }
            let Some(file_key) = path_utils::to_relative_key(&self.root, entry.path()) else {
                continue;
            };
            let dir_key = path_utils::parent_key(&file_key).unwrap_or("").to_string();
            let depth = if dir_key.is_empty() {
                0
            } else {
                dir_key.split('/').count()
            };
            candidates.push((depth, dir_key, entry.path().to_path_buf()));
        }
        candidates.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        for (_, dir_key, file_path) in candidates {
            if !dir_key.is_empty() && self.matches(&dir_key, true) {
                log::trace!(
                    "PathFilter: Skipping {file_path:?}; its directory is already ignored."
                );
                continue;
            }
            let base = file_path.parent().unwrap_or(&self.root);
            let mut builder = GitignoreBuilder::new(base);
            if let Some(e) = builder.add(&file_path) {
                log::warn!("PathFilter: Failed to parse {file_path:?}: {e}");
                continue;
            }
            match builder.build() {
                Ok(gitignore) => {
                    log::debug!("PathFilter: Loaded ignore rules from {file_path:?}.");
                    self.gitignores.push((dir_key, gitignore));
                }
                Err(e) => {
                    log::warn!("PathFilter: Failed to compile {file_path:?}: {e}");
                }
            }
        }

        // Deepest directory first: nearest rules win.
        self.gitignores
            .sort_by(|a, b| b.0.split('/').count().cmp(&a.0.split('/').count()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn settings_with(folders: &[&str], patterns: &[&str]) -> ScanSettings {
        ScanSettings {
            ignore_folders: folders.iter().map(|s| s.to_string()).collect(),
            custom_ignore_patterns: patterns.iter().map(|s| s.to_string()).collect(),
            ..ScanSettings::default()
        }
    }

    #[test]
    fn test_ignore_folder_segment_any_depth() {
        let dir = tempdir().unwrap();
        let filter = PathFilter::build(dir.path(), &settings_with(&["node_modules"], &[]));

        assert!(filter.matches("node_modules", true));
        assert!(filter.matches("node_modules/x.js", false));
        assert!(filter.matches("web/node_modules/pkg/index.js", false));
        assert!(!filter.matches("src/main.rs", false));
    }

    #[test]
    fn test_ignore_folder_is_case_insensitive() {
        let dir = tempdir().unwrap();
        let filter = PathFilter::build(dir.path(), &settings_with(&["Target"], &[]));
        assert!(filter.matches("target/debug/app", false));
        assert!(filter.matches("TARGET", true));
    }

    #[test]
    fn test_hidden_segments_are_ignored() {
        let dir = tempdir().unwrap();
        let filter = PathFilter::build(dir.path(), &settings_with(&[], &[]));

        assert!(filter.matches(".git", true));
        assert!(filter.matches(".env", false));
        assert!(filter.matches("src/.hidden/file.txt", false));
        assert!(!filter.matches("src/visible.txt", false));
        // The root itself is never ignored.
        assert!(!filter.matches("", true));
    }

    #[test]
    fn test_gitignore_patterns_apply() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.tmp\nlogs/\n").unwrap();
        fs::create_dir(dir.path().join("logs")).unwrap();

        let filter = PathFilter::build(dir.path(), &settings_with(&[], &[]));
        assert!(filter.matches("scratch.tmp", false));
        assert!(filter.matches("logs", true));
        assert!(filter.matches("logs/app.log", false));
        assert!(!filter.matches("main.rs", false));
    }

    #[test]
    fn test_nested_gitignore_whitelist_wins_over_ancestor() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("data")).unwrap();
        fs::write(dir.path().join(".gitignore"), "*.dat\n").unwrap();
        fs::write(dir.path().join("data/.gitignore"), "!keep.dat\n").unwrap();

        let filter = PathFilter::build(dir.path(), &settings_with(&[], &[]));
        assert!(filter.matches("blob.dat", false));
        assert!(filter.matches("data/other.dat", false));
        // The nearer file un-ignores it.
        assert!(!filter.matches("data/keep.dat", false));
    }

    #[test]
    fn test_gitignore_inside_ignored_directory_is_not_loaded() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("build")).unwrap();
        fs::write(dir.path().join(".gitignore"), "build/\n").unwrap();
        // A whitelist rule that must never be consulted.
        fs::write(dir.path().join("build/.gitignore"), "!*\n").unwrap();

        let filter = PathFilter::build(dir.path(), &settings_with(&[], &[]));
        assert!(filter.matches("build", true));
        assert!(filter.matches("build/artifact.o", false));
    }

    #[test]
    fn test_folder_rule_beats_gitignore_whitelist() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "!node_modules\n").unwrap();
        let filter = PathFilter::build(dir.path(), &settings_with(&["node_modules"], &[]));
        // Rule 1 is evaluated before the gitignore chain.
        assert!(filter.matches("node_modules", true));
    }

    #[test]
    fn test_custom_glob_patterns() {
        let dir = tempdir().unwrap();
        let filter = PathFilter::build(dir.path(), &settings_with(&[], &["*.log", "temp_*"]));

        assert!(filter.matches("app.log", false));
        assert!(filter.matches("notes/activity.log", false));
        assert!(filter.matches("temp_output", false));
        assert!(!filter.matches("notes/readme.md", false));
    }

    #[test]
    fn test_invalid_custom_pattern_is_skipped() {
        let dir = tempdir().unwrap();
        let filter = PathFilter::build(dir.path(), &settings_with(&[], &["[", "*.log"]));
        assert!(filter.matches("app.log", false));
        assert!(!filter.matches("bracket.txt", false));
    }
}
