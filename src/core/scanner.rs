/*
 * Recursive directory scanning. A scan runs on its own worker thread and
 * streams discovered nodes back over a channel in bounded batches, so the
 * interactive side can update progressively without being flooded. Token
 * counts are never computed here: structural discovery stays fast and the
 * token worker pool fills counts in asynchronously.
 *
 * Failure policy: only an invalid root is fatal. A directory that cannot be
 * read is recorded as a PermissionDenied node, its contents are simply absent,
 * and the scan continues with siblings.
 */
use super::classifier::FileClassifierOperations;
use super::config::ScanSettings;
use super::path_filter::PathFilter;
use super::path_utils;
use super::tree_index::{Node, Validity};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use walkdir::WalkDir;

/// Discovered entries are reported in batches of this size.
pub const SCAN_BATCH_SIZE: usize = 100;

#[derive(Debug)]
pub enum ScanError {
    /// The root path is missing or not a directory. Fatal: the scan never starts.
    InvalidRoot(PathBuf),
    Io(io::Error),
}

impl From<io::Error> for ScanError {
    fn from(err: io::Error) -> Self {
        ScanError::Io(err)
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::InvalidRoot(p) => write!(f, "Root path is not a readable directory: {p:?}"),
            ScanError::Io(e) => write!(f, "I/O error during scan: {e}"),
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub discovered: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub enum ScanEvent {
    /// Up to `SCAN_BATCH_SIZE` newly discovered nodes.
    Discovered(Vec<Node>),
    /// A non-fatal per-entry failure; the scan continues.
    Error { path: PathBuf, message: String },
    /// The walk completed (not emitted when the scan was cancelled).
    Finished(ScanStats),
}

/*
 * Handle to a running scan. The event receiver is the scan's output: a finite,
 * consume-once sequence. `stop` cancels the walk; the worker notices within
 * one entry and exits without emitting `Finished`.
 */
pub struct ScanHandle {
    events: Receiver<ScanEvent>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ScanHandle {
    pub fn events(&self) -> &Receiver<ScanEvent> {
        &self.events
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("Scanner: Scan worker panicked.");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct CoreScanner {}

impl CoreScanner {
    pub fn new() -> Self {
        CoreScanner {}
    }

    /*
     * Starts a scan of `root` on a dedicated worker thread. The filter and
     * classifier are the same objects the watcher will use, which is what
     * keeps scan-time and watch-time verdicts identical for any path.
     */
    pub fn scan(
        &self,
        root: &Path,
        settings: &ScanSettings,
        filter: Arc<PathFilter>,
        classifier: Arc<dyn FileClassifierOperations>,
    ) -> Result<ScanHandle> {
        if !root.is_dir() {
            return Err(ScanError::InvalidRoot(root.to_path_buf()));
        }

        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let root = root.to_path_buf();
        let max_file_size = settings.max_file_size_bytes;
        let include_subfolders = settings.include_subfolders;

        log::debug!("Scanner: Starting scan of {root:?}.");
        let join = std::thread::spawn(move || {
            run_scan(
                root,
                max_file_size,
                include_subfolders,
                filter,
                classifier,
                worker_stop,
                tx,
            );
        });

        Ok(ScanHandle {
            events: rx,
            stop,
            join: Some(join),
        })
    }
}

impl Default for CoreScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn run_scan(
    root: PathBuf,
    max_file_size: u64,
    include_subfolders: bool,
    filter: Arc<PathFilter>,
    classifier: Arc<dyn FileClassifierOperations>,
    stop: Arc<AtomicBool>,
    tx: Sender<ScanEvent>,
) {
    let mut stats = ScanStats::default();
    let mut batch: Vec<Node> = Vec::with_capacity(SCAN_BATCH_SIZE);

    let mut walker = WalkDir::new(&root).follow_links(false);
    if !include_subfolders {
        walker = walker.max_depth(1);
    }

    let filter_root = root.clone();
    let entry_filter = Arc::clone(&filter);
    let iter = walker.into_iter().filter_entry(move |entry| {
        if entry.depth() == 0 {
            return true;
        }
        match path_utils::to_relative_key(&filter_root, entry.path()) {
            Some(key) => !entry_filter.matches(&key, entry.file_type().is_dir()),
            None => true,
        }
    });

    for entry_result in iter {
        if stop.load(Ordering::Relaxed) {
            log::debug!("Scanner: Scan of {root:?} cancelled.");
            return;
        }
        match entry_result {
            Ok(entry) => {
                if entry.depth() == 0 {
                    continue;
                }
                let Some(key) = path_utils::to_relative_key(&root, entry.path()) else {
                    continue;
                };
                let node = if entry.file_type().is_dir() {
                    Node::new_directory(key, Validity::Includable)
                } else {
                    let validity = classifier.classify(entry.path(), max_file_size);
                    Node::new_file(key, validity)
                };
                batch.push(node);
                stats.discovered += 1;
            }
            Err(e) => {
                // Usually a permission failure on a directory: record the
                // entry itself and move on to siblings.
                stats.errors += 1;
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                let message = match e.io_error() {
                    Some(io_err) => io_err.to_string(),
                    None => e.to_string(),
                };
                log::warn!("Scanner: Failed to read {path:?}: {message}");
                if let Some(key) = path_utils::to_relative_key(&root, &path) {
                    batch.push(Node::new_directory(key, Validity::PermissionDenied));
                    stats.discovered += 1;
                }
                if tx.send(ScanEvent::Error { path, message }).is_err() {
                    return;
                }
            }
        }
        if batch.len() >= SCAN_BATCH_SIZE {
            if tx
                .send(ScanEvent::Discovered(std::mem::take(&mut batch)))
                .is_err()
            {
                return;
            }
        }
    }

    if !batch.is_empty() && tx.send(ScanEvent::Discovered(batch)).is_err() {
        return;
    }
    log::debug!(
        "Scanner: Scan of {root:?} finished: {} entries, {} errors.",
        stats.discovered,
        stats.errors
    );
    let _ = tx.send(ScanEvent::Finished(stats));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::CoreFileClassifier;
    use crate::core::tree_index::{NodeKind, TreeIndex};
    use std::collections::HashMap;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn collect_scan(root: &Path, settings: &ScanSettings) -> (HashMap<String, Node>, ScanStats) {
        let filter = Arc::new(PathFilter::build(root, settings));
        let classifier: Arc<dyn FileClassifierOperations> = Arc::new(CoreFileClassifier::new());
        let scanner = CoreScanner::new();
        let handle = scanner.scan(root, settings, filter, classifier).unwrap();

        let mut nodes = HashMap::new();
        let mut stats = ScanStats::default();
        loop {
            match handle
                .events()
                .recv_timeout(Duration::from_secs(10))
                .expect("scan did not finish in time")
            {
                ScanEvent::Discovered(batch) => {
                    for node in batch {
                        nodes.insert(node.relative_path.clone(), node);
                    }
                }
                ScanEvent::Error { .. } => {}
                ScanEvent::Finished(s) => {
                    stats = s;
                    break;
                }
            }
        }
        (nodes, stats)
    }

    #[test]
    fn test_scan_classifies_and_filters() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::write(dir.path().join("b.bin"), b"bi\x00nary").unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/x.js"), "var x;").unwrap();

        let settings = ScanSettings {
            ignore_folders: vec!["node_modules".into()],
            ..ScanSettings::default()
        };
        let (nodes, stats) = collect_scan(dir.path(), &settings);

        assert_eq!(nodes["a.txt"].validity, Validity::Includable);
        assert_eq!(nodes["b.bin"].validity, Validity::SkippedBinary);
        assert!(!nodes.contains_key("node_modules"));
        assert!(!nodes.contains_key("node_modules/x.js"));
        assert_eq!(stats.discovered, 2);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_scan_emits_directories_and_nested_files() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/core")).unwrap();
        fs::write(dir.path().join("src/core/deep.rs"), "mod deep;").unwrap();

        let (nodes, _) = collect_scan(dir.path(), &ScanSettings::default());
        assert_eq!(nodes["src"].kind, NodeKind::Directory);
        assert_eq!(nodes["src/core"].kind, NodeKind::Directory);
        assert_eq!(nodes["src/core/deep.rs"].kind, NodeKind::File);
    }

    #[test]
    fn test_scan_progress_batches_are_bounded() {
        let dir = tempdir().unwrap();
        for i in 0..(SCAN_BATCH_SIZE * 2 + 10) {
            fs::write(dir.path().join(format!("f{i:04}.txt")), "x").unwrap();
        }

        let settings = ScanSettings::default();
        let filter = Arc::new(PathFilter::build(dir.path(), &settings));
        let classifier: Arc<dyn FileClassifierOperations> = Arc::new(CoreFileClassifier::new());
        let handle = CoreScanner::new()
            .scan(dir.path(), &settings, filter, classifier)
            .unwrap();

        let mut batches = 0;
        loop {
            match handle
                .events()
                .recv_timeout(Duration::from_secs(10))
                .unwrap()
            {
                ScanEvent::Discovered(batch) => {
                    assert!(batch.len() <= SCAN_BATCH_SIZE);
                    batches += 1;
                }
                ScanEvent::Error { .. } => {}
                ScanEvent::Finished(stats) => {
                    assert_eq!(stats.discovered, SCAN_BATCH_SIZE * 2 + 10);
                    break;
                }
            }
        }
        assert!(batches >= 3);
    }

    #[test]
    fn test_invalid_root_is_fatal() {
        let settings = ScanSettings::default();
        let missing = Path::new("this_root_does_not_exist");
        let filter = Arc::new(PathFilter::build(missing, &settings));
        let classifier: Arc<dyn FileClassifierOperations> = Arc::new(CoreFileClassifier::new());
        let result = CoreScanner::new().scan(missing, &settings, filter, classifier);
        assert!(matches!(result, Err(ScanError::InvalidRoot(_))));
    }

    #[test]
    fn test_scan_fills_index_order_independently() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        fs::write(dir.path().join("b/nested/two.txt"), "two").unwrap();

        let (nodes, _) = collect_scan(dir.path(), &ScanSettings::default());

        // Insert in reverse discovery order: the index must not care.
        let mut tree = TreeIndex::new(dir.path().to_path_buf());
        let mut keys: Vec<&String> = nodes.keys().collect();
        keys.sort();
        for key in keys.iter().rev() {
            tree.insert_scanned(nodes[key.as_str()].clone()).unwrap();
        }
        assert_eq!(tree.len(), nodes.len());
        tree.assert_invariants();
    }

    #[test]
    fn test_scan_and_watch_apply_identical_filter_verdicts() {
        use crate::core::watcher::{RawOp, coalesce};

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("kept.txt"), "keep").unwrap();
        fs::create_dir(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/dep.js"), "x").unwrap();

        let settings = ScanSettings {
            ignore_folders: vec!["node_modules".into()],
            ..ScanSettings::default()
        };
        // One compiled filter shared by both sides; the rest of the engine
        // depends on this equivalence.
        let filter = Arc::new(PathFilter::build(dir.path(), &settings));
        let classifier: Arc<dyn FileClassifierOperations> = Arc::new(CoreFileClassifier::new());

        let handle = CoreScanner::new()
            .scan(dir.path(), &settings, Arc::clone(&filter), classifier)
            .unwrap();
        let mut scanned: Vec<String> = Vec::new();
        loop {
            match handle
                .events()
                .recv_timeout(Duration::from_secs(10))
                .unwrap()
            {
                ScanEvent::Discovered(batch) => {
                    scanned.extend(batch.into_iter().map(|n| n.relative_path));
                }
                ScanEvent::Error { .. } => {}
                ScanEvent::Finished(_) => break,
            }
        }

        let ops = vec![
            RawOp::Create(dir.path().join("kept.txt")),
            RawOp::Create(dir.path().join("node_modules/dep.js")),
        ];
        let batch = coalesce(&ops, dir.path(), &filter);

        assert!(scanned.contains(&"kept.txt".to_string()));
        assert!(batch.added.contains(&"kept.txt".to_string()));
        assert!(!scanned.iter().any(|k| k.starts_with("node_modules")));
        assert!(!batch.added.iter().any(|k| k.starts_with("node_modules")));
    }

    #[test]
    fn test_stop_after_completion_is_safe() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("only.txt"), "x").unwrap();
        let settings = ScanSettings::default();
        let filter = Arc::new(PathFilter::build(dir.path(), &settings));
        let classifier: Arc<dyn FileClassifierOperations> = Arc::new(CoreFileClassifier::new());
        let mut handle = CoreScanner::new()
            .scan(dir.path(), &settings, filter, classifier)
            .unwrap();

        // Drain to completion, then stop() must be a clean no-op join.
        while let Ok(event) = handle.events().recv_timeout(Duration::from_secs(10)) {
            if matches!(event, ScanEvent::Finished(_)) {
                break;
            }
        }
        handle.stop();
        assert!(!handle.is_running());
    }
}
