/*
 * The session facade the host UI talks to. One `WorkspaceSession` owns one
 * `TreeIndex` and the workers that feed it: the scanner (initial fill), the
 * watcher (incremental batches), and the token pool (asynchronous counts).
 * There are no ambient singletons; opening another workspace means dropping
 * this session (which stops its workers) and constructing a new one, so two
 * roots are never watched under one index.
 *
 * Concurrency discipline: the index lives behind an RwLock. Every mutation
 * (scan fill, batch application, token result, selection toggle) takes the
 * write lock for the whole logical step, so readers always observe a
 * consistent snapshot and batches apply atomically. Producers hand their
 * results over channels to small consumer loops owned by the session, which
 * keeps ordering auditable: batches are applied in the order their windows
 * closed.
 */
use super::aggregator::{AggregatorOperations, CoreAggregator};
use super::classifier::{CoreFileClassifier, FileClassifierOperations};
use super::config::ScanSettings;
use super::path_filter::PathFilter;
use super::scanner::{CoreScanner, ScanError, ScanEvent, ScanHandle};
use super::token_worker::{TokenCache, TokenProgressEntry, TokenSubmitter, TokenWorkerPool};
use super::tokenizer_utils::TokenCounterOperations;
use super::tree_index::{BatchApplyError, BatchSummary, Node, TreeIndex};
use super::watcher::{CoreWatcher, WatchError, WatchMessage, WatchState};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

#[derive(Debug)]
pub enum SessionError {
    Scan(ScanError),
    Watch(WatchError),
    Index(BatchApplyError),
}

impl From<ScanError> for SessionError {
    fn from(err: ScanError) -> Self {
        SessionError::Scan(err)
    }
}

impl From<WatchError> for SessionError {
    fn from(err: WatchError) -> Self {
        SessionError::Watch(err)
    }
}

impl From<BatchApplyError> for SessionError {
    fn from(err: BatchApplyError) -> Self {
        SessionError::Index(err)
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Scan(e) => write!(f, "{e}"),
            SessionError::Watch(e) => write!(f, "{e}"),
            SessionError::Index(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Scan(e) => Some(e),
            SessionError::Watch(e) => Some(e),
            SessionError::Index(e) => Some(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Notifications for the host UI, delivered on the session's event channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ScanProgress { discovered: usize },
    ScanFinished { discovered: usize, errors: usize },
    BatchApplied(BatchSummary),
    TokensUpdated { total_tokens: usize },
    /// The watched root disappeared; the watcher has wound down.
    WatchLost,
}

pub struct WorkspaceSession {
    root: PathBuf,
    settings: ScanSettings,
    filter: Arc<PathFilter>,
    classifier: Arc<dyn FileClassifierOperations>,
    tree: Arc<RwLock<TreeIndex>>,
    cache: Arc<Mutex<TokenCache>>,
    aggregator: CoreAggregator,
    token_pool: TokenWorkerPool,
    token_consumer: Option<JoinHandle<()>>,
    scan: Option<ScanHandle>,
    scan_consumer: Option<JoinHandle<()>>,
    watcher: CoreWatcher,
    watch_consumer: Option<JoinHandle<()>>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl WorkspaceSession {
    /*
     * Opens a session on `root`. `initial_cache` carries token counts loaded
     * from the persisted workspace (already invalidated against the current
     * encoding by the caller). Fails only when the root is not a directory.
     */
    pub fn open(
        root: &Path,
        settings: ScanSettings,
        counter: Arc<dyn TokenCounterOperations>,
        initial_cache: TokenCache,
    ) -> Result<Self> {
        if !root.is_dir() {
            return Err(SessionError::Scan(ScanError::InvalidRoot(
                root.to_path_buf(),
            )));
        }
        log::info!("WorkspaceSession: Opening workspace {root:?}.");

        let filter = Arc::new(PathFilter::build(root, &settings));
        let classifier: Arc<dyn FileClassifierOperations> = Arc::new(CoreFileClassifier::new());
        let tree = Arc::new(RwLock::new(TreeIndex::new(root.to_path_buf())));
        let cache = Arc::new(Mutex::new(initial_cache));
        let (events_tx, events_rx) = unbounded();

        let (results_tx, results_rx) = unbounded::<TokenProgressEntry>();
        let token_pool = TokenWorkerPool::new(
            root.to_path_buf(),
            counter,
            Arc::clone(&cache),
            results_tx,
            0,
        );
        let token_consumer = spawn_token_consumer(results_rx, Arc::clone(&tree), events_tx.clone());

        Ok(WorkspaceSession {
            root: root.to_path_buf(),
            settings,
            filter,
            classifier,
            tree,
            cache,
            aggregator: CoreAggregator::new(),
            token_pool,
            token_consumer: Some(token_consumer),
            scan: None,
            scan_consumer: None,
            watcher: CoreWatcher::new(),
            watch_consumer: None,
            events_tx,
            events_rx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// The session's notification stream. Clones share one queue; each event
    /// is delivered to one receiver, so hand a single clone to the UI loop.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    /*
     * Starts (or restarts) the initial scan. The index is rebuilt from
     * scratch; the caller re-applies its active selection group afterwards,
     * which is how check states survive a refresh. Progress and completion
     * arrive as session events.
     */
    pub fn start_scan(&mut self) -> Result<()> {
        self.abort_scan();
        {
            let mut tree = self.tree.write().expect("tree lock poisoned");
            *tree = TreeIndex::new(self.root.clone());
        }

        let handle = CoreScanner::new().scan(
            &self.root,
            &self.settings,
            Arc::clone(&self.filter),
            Arc::clone(&self.classifier),
        )?;

        let events = handle.events().clone();
        let tree = Arc::clone(&self.tree);
        let submitter = self.token_pool.submitter();
        let events_tx = self.events_tx.clone();
        self.scan_consumer = Some(std::thread::spawn(move || {
            scan_consumer_loop(events, tree, submitter, events_tx);
        }));
        self.scan = Some(handle);
        Ok(())
    }

    /// Cancels a running scan, if any. Safe when none is active.
    pub fn abort_scan(&mut self) {
        if let Some(mut handle) = self.scan.take() {
            handle.stop();
        }
        if let Some(consumer) = self.scan_consumer.take() {
            if consumer.join().is_err() {
                log::error!("WorkspaceSession: Scan consumer panicked.");
            }
        }
    }

    /*
     * Starts live watching of the root. Batches flow through a consumer loop
     * that applies them to the index atomically and reports a summary per
     * window. Any previous watch owned by this session is stopped first.
     */
    pub fn start_watch(&mut self) -> Result<()> {
        self.stop_watch();

        let (watch_tx, watch_rx) = unbounded::<WatchMessage>();
        self.watcher
            .start(&self.root, Arc::clone(&self.filter), watch_tx)?;

        let tree = Arc::clone(&self.tree);
        let classifier = Arc::clone(&self.classifier);
        let submitter = self.token_pool.submitter();
        let events_tx = self.events_tx.clone();
        let max_file_size = self.settings.max_file_size_bytes;
        self.watch_consumer = Some(std::thread::spawn(move || {
            watch_consumer_loop(
                watch_rx,
                tree,
                classifier,
                submitter,
                events_tx,
                max_file_size,
            );
        }));
        Ok(())
    }

    /// Stops the watcher; no batch is applied after this returns.
    pub fn stop_watch(&mut self) {
        self.watcher.stop();
        if let Some(consumer) = self.watch_consumer.take() {
            if consumer.join().is_err() {
                log::error!("WorkspaceSession: Watch consumer panicked.");
            }
        }
    }

    pub fn watch_state(&self) -> WatchState {
        self.watcher.state()
    }

    /// Toggles a file's check state, or a whole directory subtree.
    pub fn toggle_check(&self, relative_key: &str, checked: bool) -> Result<()> {
        let mut tree = self.tree.write().expect("tree lock poisoned");
        tree.set_checked(relative_key, checked)?;
        Ok(())
    }

    /// Replaces the current selection with the given set of checked paths
    /// (e.g. when the user activates a selection group).
    pub fn apply_selection(&self, checked_paths: &BTreeSet<String>) -> Result<()> {
        let mut tree = self.tree.write().expect("tree lock poisoned");
        tree.set_checked("", false)?;
        for key in checked_paths {
            tree.set_checked(key, true)?;
        }
        Ok(())
    }

    /// Current selection as relative keys, for saving into a group.
    pub fn checked_paths(&self) -> BTreeSet<String> {
        self.tree.read().expect("tree lock poisoned").checked_paths()
    }

    /// Renders the artifact for the current selection.
    pub fn render_artifact(&self, instructions: &str) -> (String, usize) {
        let tree = self.tree.read().expect("tree lock poisoned");
        let checked = tree.checked_paths();
        self.aggregator.render(
            &tree,
            &checked,
            instructions,
            self.settings.max_render_file_bytes,
        )
    }

    /// Renders the artifact for an explicit selection (e.g. a saved group),
    /// without touching the live check states.
    pub fn render_artifact_for(
        &self,
        checked_paths: &BTreeSet<String>,
        instructions: &str,
    ) -> (String, usize) {
        let tree = self.tree.read().expect("tree lock poisoned");
        self.aggregator.render(
            &tree,
            checked_paths,
            instructions,
            self.settings.max_render_file_bytes,
        )
    }

    pub fn total_tokens(&self) -> usize {
        self.tree.read().expect("tree lock poisoned").total_tokens()
    }

    pub fn node(&self, relative_key: &str) -> Option<Node> {
        self.tree
            .read()
            .expect("tree lock poisoned")
            .get(relative_key)
            .cloned()
    }

    /// Snapshot of all nodes in key order, for rendering a tree view.
    pub fn snapshot(&self) -> Vec<Node> {
        self.tree
            .read()
            .expect("tree lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Copy of the token cache, for persisting with the workspace.
    pub fn token_cache_snapshot(&self) -> TokenCache {
        self.cache.lock().expect("token cache poisoned").clone()
    }

    /// Stops every worker owned by this session. Called on drop; idempotent.
    pub fn close(&mut self) {
        self.abort_scan();
        self.stop_watch();
        self.token_pool.stop();
        if let Some(consumer) = self.token_consumer.take() {
            if consumer.join().is_err() {
                log::error!("WorkspaceSession: Token consumer panicked.");
            }
        }
        log::info!("WorkspaceSession: Closed workspace {:?}.", self.root);
    }
}

impl Drop for WorkspaceSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_token_consumer(
    results_rx: Receiver<TokenProgressEntry>,
    tree: Arc<RwLock<TreeIndex>>,
    events_tx: Sender<SessionEvent>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(first) = results_rx.recv() {
            // Drain whatever else is ready so one event covers the burst.
            let mut entries = vec![first];
            while let Ok(more) = results_rx.try_recv() {
                entries.push(more);
            }
            let total_tokens = {
                let mut tree = tree.write().expect("tree lock poisoned");
                for entry in &entries {
                    if let Err(e) = tree.set_token_count(&entry.path, entry.token_count) {
                        log::error!(
                            "WorkspaceSession: Token result for '{}' violated an invariant: {e}",
                            entry.path
                        );
                    }
                }
                tree.total_tokens()
            };
            let _ = events_tx.send(SessionEvent::TokensUpdated { total_tokens });
        }
    })
}

fn scan_consumer_loop(
    events: Receiver<ScanEvent>,
    tree: Arc<RwLock<TreeIndex>>,
    submitter: TokenSubmitter,
    events_tx: Sender<SessionEvent>,
) {
    let mut discovered = 0usize;
    while let Ok(event) = events.recv() {
        match event {
            ScanEvent::Discovered(batch) => {
                discovered += batch.len();
                let mut to_tokenize: Vec<String> = Vec::new();
                {
                    let mut tree = tree.write().expect("tree lock poisoned");
                    for node in batch {
                        if node.is_includable_file() {
                            to_tokenize.push(node.relative_path.clone());
                        }
                        if let Err(e) = tree.insert_scanned(node) {
                            log::error!("WorkspaceSession: Scan insert violated an invariant: {e}");
                        }
                    }
                }
                for key in to_tokenize {
                    submitter.submit(&key);
                }
                let _ = events_tx.send(SessionEvent::ScanProgress { discovered });
            }
            ScanEvent::Error { path, message } => {
                log::warn!("WorkspaceSession: Scan error at {path:?}: {message}");
            }
            ScanEvent::Finished(stats) => {
                let _ = events_tx.send(SessionEvent::ScanFinished {
                    discovered: stats.discovered,
                    errors: stats.errors,
                });
                return;
            }
        }
    }
}

fn watch_consumer_loop(
    watch_rx: Receiver<WatchMessage>,
    tree: Arc<RwLock<TreeIndex>>,
    classifier: Arc<dyn FileClassifierOperations>,
    submitter: TokenSubmitter,
    events_tx: Sender<SessionEvent>,
    max_file_size: u64,
) {
    while let Ok(message) = watch_rx.recv() {
        match message {
            WatchMessage::Batch(batch) => {
                let outcome = {
                    let mut tree = tree.write().expect("tree lock poisoned");
                    tree.apply_batch(&batch, classifier.as_ref(), max_file_size)
                };
                match outcome {
                    Ok(outcome) => {
                        for key in &outcome.to_tokenize {
                            submitter.submit(key);
                        }
                        let _ = events_tx.send(SessionEvent::BatchApplied(outcome.summary));
                    }
                    Err(e) => {
                        // Batches must never corrupt the index; this is a
                        // defect and is surfaced as loudly as a library can.
                        log::error!("WorkspaceSession: Batch application failed: {e}");
                    }
                }
            }
            WatchMessage::RootGone => {
                log::warn!("WorkspaceSession: Watched root disappeared.");
                let _ = events_tx.send(SessionEvent::WatchLost);
                return;
            }
            WatchMessage::Error(message) => {
                log::warn!("WorkspaceSession: Watcher reported: {message}");
            }
        }
    }
}
