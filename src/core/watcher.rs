/*
 * Live filesystem watching. Raw notifications from the OS are queued to a
 * worker thread; the first event opens a 200 ms coalescing window, everything
 * arriving within the window is reduced to one net action per path, the
 * shared `PathFilter` drops ignored paths, and the survivors are handed off
 * as a single `Batch` per window. Consumers therefore never observe a
 * half-applied window.
 *
 * When the platform's native notification backend cannot be subscribed (for
 * example on some network mounts), the watcher degrades to a polling backend
 * at a fixed interval instead of failing.
 */
use super::path_filter::PathFilter;
use super::path_utils;
use super::tree_index::Batch;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Length of the event coalescing window.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(200);

/// Poll interval used by the degraded (non-native) backend.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bound on how long `stop()` waits for the worker to wind down.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Stopped,
    Starting,
    Active,
    /// Native notifications unavailable; the polling backend is in use.
    Degraded,
    Stopping,
}

#[derive(Debug)]
pub enum WatchError {
    /// The root path is missing or not a directory. Fatal for `start`.
    Path(PathBuf),
    /// Neither the native nor the polling backend could be subscribed.
    Subscription(String),
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Path(p) => write!(f, "Watch root is not a readable directory: {p:?}"),
            WatchError::Subscription(msg) => {
                write!(f, "Could not subscribe to filesystem notifications: {msg}")
            }
        }
    }
}

impl std::error::Error for WatchError {}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Messages delivered to the watch consumer.
#[derive(Debug)]
pub enum WatchMessage {
    Batch(Batch),
    /// The watched root itself disappeared; the watcher winds down.
    RootGone,
    Error(String),
}

pub struct CoreWatcher {
    state: Arc<Mutex<WatchState>>,
    stop_flag: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    done_rx: Option<Receiver<()>>,
    join: Option<JoinHandle<()>>,
}

impl CoreWatcher {
    pub fn new() -> Self {
        CoreWatcher {
            state: Arc::new(Mutex::new(WatchState::Stopped)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            done_rx: None,
            join: None,
        }
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock().expect("watch state poisoned")
    }

    /*
     * Starts watching `root` recursively. Batches are delivered on `out` in
     * the order their windows closed. Any previous subscription owned by this
     * instance is stopped first, so one `CoreWatcher` never watches two roots
     * at once.
     */
    pub fn start(
        &mut self,
        root: &Path,
        filter: Arc<PathFilter>,
        out: Sender<WatchMessage>,
    ) -> Result<()> {
        self.stop();
        if !root.is_dir() {
            return Err(WatchError::Path(root.to_path_buf()));
        }
        *self.state.lock().expect("watch state poisoned") = WatchState::Starting;

        let (raw_tx, raw_rx) = unbounded::<notify::Result<Event>>();
        let backend = match self.create_backend(root, raw_tx) {
            Ok(backend) => backend,
            Err(e) => {
                *self.state.lock().expect("watch state poisoned") = WatchState::Stopped;
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = unbounded::<()>();
        let (done_tx, done_rx) = unbounded::<()>();
        self.stop_flag.store(false, Ordering::Relaxed);

        let worker_root = root.to_path_buf();
        let worker_state = Arc::clone(&self.state);
        let worker_stop = Arc::clone(&self.stop_flag);
        let join = std::thread::spawn(move || {
            // The backend must live as long as the worker: dropping it would
            // silently end the subscription.
            let _backend = backend;
            let _done_tx = done_tx;
            worker_loop(worker_root, filter, raw_rx, stop_rx, out, worker_stop);
            *worker_state.lock().expect("watch state poisoned") = WatchState::Stopped;
        });

        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);
        self.join = Some(join);
        log::debug!("Watcher: Watching {root:?} ({:?}).", self.state());
        Ok(())
    }

    /// Tries the native notification backend first and falls back to polling
    /// when the subscription cannot be established (Degraded state).
    fn create_backend(
        &self,
        root: &Path,
        raw_tx: Sender<notify::Result<Event>>,
    ) -> Result<Box<dyn Watcher + Send>> {
        let handler_tx = raw_tx.clone();
        match RecommendedWatcher::new(
            move |res| {
                let _ = handler_tx.send(res);
            },
            Config::default(),
        ) {
            Ok(mut native) => match native.watch(root, RecursiveMode::Recursive) {
                Ok(()) => {
                    *self.state.lock().expect("watch state poisoned") = WatchState::Active;
                    Ok(Box::new(native))
                }
                Err(e) => {
                    log::warn!(
                        "Watcher: Native subscription for {root:?} failed ({e}); \
                         falling back to polling."
                    );
                    self.poll_backend(root, raw_tx)
                }
            },
            Err(e) => {
                log::warn!("Watcher: Native backend unavailable ({e}); falling back to polling.");
                self.poll_backend(root, raw_tx)
            }
        }
    }

    fn poll_backend(
        &self,
        root: &Path,
        raw_tx: Sender<notify::Result<Event>>,
    ) -> Result<Box<dyn Watcher + Send>> {
        let mut poller = PollWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )
        .map_err(|e| WatchError::Subscription(e.to_string()))?;
        poller
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::Subscription(e.to_string()))?;
        *self.state.lock().expect("watch state poisoned") = WatchState::Degraded;
        Ok(Box::new(poller))
    }

    /*
     * Stops the watcher. Safe to call in any state. Guarantees that no Batch
     * is delivered after this returns: the stop flag is observed by the
     * worker before every send, and the join is bounded: if the worker does
     * not wind down within the timeout it is abandoned with the flag set.
     */
    pub fn stop(&mut self) {
        if self.join.is_none() {
            return;
        }
        *self.state.lock().expect("watch state poisoned") = WatchState::Stopping;
        self.stop_flag.store(true, Ordering::Relaxed);
        self.stop_tx.take();

        let finished = match self.done_rx.take() {
            Some(done_rx) => matches!(
                done_rx.recv_timeout(STOP_JOIN_TIMEOUT),
                Err(RecvTimeoutError::Disconnected)
            ),
            None => true,
        };
        if finished {
            if let Some(join) = self.join.take() {
                if join.join().is_err() {
                    log::error!("Watcher: Worker panicked.");
                }
            }
        } else {
            log::error!("Watcher: Worker did not stop within {STOP_JOIN_TIMEOUT:?}; abandoning.");
            self.join.take();
        }
        *self.state.lock().expect("watch state poisoned") = WatchState::Stopped;
    }
}

impl Default for CoreWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoreWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    root: PathBuf,
    filter: Arc<PathFilter>,
    raw_rx: Receiver<notify::Result<Event>>,
    stop_rx: Receiver<()>,
    out: Sender<WatchMessage>,
    stop_flag: Arc<AtomicBool>,
) {
    loop {
        // Block until the first event of a window, or a stop.
        let first = crossbeam_channel::select! {
            recv(stop_rx) -> _ => return,
            recv(raw_rx) -> msg => match msg {
                Ok(event) => event,
                Err(_) => return,
            },
        };

        let mut ops: Vec<RawOp> = Vec::new();
        absorb(first, &mut ops, &out);

        let deadline = Instant::now() + COALESCE_WINDOW;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => break,
            };
            crossbeam_channel::select! {
                recv(stop_rx) -> _ => return,
                recv(raw_rx) -> msg => match msg {
                    Ok(event) => absorb(event, &mut ops, &out),
                    Err(_) => return,
                },
                default(remaining) => break,
            }
        }

        if stop_flag.load(Ordering::Relaxed) {
            return;
        }
        if !root.exists() {
            let _ = out.send(WatchMessage::RootGone);
            return;
        }

        let batch = coalesce(&ops, &root, &filter);
        if !batch.is_empty() {
            if out.send(WatchMessage::Batch(batch)).is_err() {
                return;
            }
        }
    }
}

fn absorb(event: notify::Result<Event>, ops: &mut Vec<RawOp>, out: &Sender<WatchMessage>) {
    match event {
        Ok(event) => ops.extend(map_event(event)),
        Err(e) => {
            log::warn!("Watcher: Backend error: {e}");
            let _ = out.send(WatchMessage::Error(e.to_string()));
        }
    }
}

/// A single raw action after unpacking a notify event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawOp {
    Create(PathBuf),
    Modify(PathBuf),
    Remove(PathBuf),
    Rename(PathBuf, PathBuf),
}

fn map_event(event: Event) -> Vec<RawOp> {
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().map(RawOp::Create).collect(),
        EventKind::Remove(_) => event.paths.into_iter().map(RawOp::Remove).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![RawOp::Rename(from, to)],
                (Some(only), None) => vec![RawOp::Modify(only)],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.into_iter().map(RawOp::Remove).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.into_iter().map(RawOp::Create).collect()
        }
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => {
            event.paths.into_iter().map(RawOp::Modify).collect()
        }
        EventKind::Access(_) => Vec::new(),
    }
}

/// Net per-path action after reduction. `None` in the map means the window's
/// actions cancelled out (e.g. create followed by delete).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Net {
    Added,
    Removed,
    Modified,
}

pub(crate) fn reduce_ops(
    ops: &[RawOp],
) -> (HashMap<PathBuf, Option<Net>>, Vec<(PathBuf, PathBuf)>) {
    let mut map: HashMap<PathBuf, Option<Net>> = HashMap::new();
    let mut renames: Vec<(PathBuf, PathBuf)> = Vec::new();

    for op in ops {
        match op {
            RawOp::Create(path) => {
                let entry = map.entry(path.clone()).or_insert(None);
                *entry = match *entry {
                    // Deleted earlier in the window, now back: content may
                    // differ, so it surfaces as a modify. Identical content is
                    // later downgraded to a no-op by the checksum cache.
                    Some(Net::Removed) => Some(Net::Modified),
                    Some(Net::Modified) => Some(Net::Modified),
                    _ => Some(Net::Added),
                };
            }
            RawOp::Modify(path) => {
                let entry = map.entry(path.clone()).or_insert(None);
                *entry = match *entry {
                    Some(Net::Added) => Some(Net::Added),
                    _ => Some(Net::Modified),
                };
            }
            RawOp::Remove(path) => {
                let entry = map.entry(path.clone()).or_insert(Some(Net::Removed));
                *entry = match *entry {
                    // Created and deleted within the same window: nothing
                    // happened as far as the index is concerned.
                    Some(Net::Added) => None,
                    None => None,
                    _ => Some(Net::Removed),
                };
            }
            RawOp::Rename(from, to) => {
                let previous = map.remove(from).flatten();
                map.remove(to);
                match previous {
                    // The file was born in this window; the index never saw
                    // the old name, so it is just an addition at the new one.
                    Some(Net::Added) => {
                        map.insert(to.clone(), Some(Net::Added));
                    }
                    other => {
                        renames.push((from.clone(), to.clone()));
                        if other == Some(Net::Modified) {
                            map.insert(to.clone(), Some(Net::Modified));
                        }
                    }
                }
            }
        }
    }
    (map, renames)
}

/*
 * Turns the reduced window into a Batch: relative keys, filter application
 * (dropped silently), directory additions expanded to their visible contents,
 * paths that already vanished again counted as still missing, and the lists
 * sorted for deterministic downstream processing.
 */
pub(crate) fn coalesce(ops: &[RawOp], root: &Path, filter: &PathFilter) -> Batch {
    let (net, renames) = reduce_ops(ops);
    let mut batch = Batch::default();

    for (path, action) in net {
        let Some(action) = action else { continue };
        let Some(key) = path_utils::to_relative_key(root, &path) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let exists = path.exists();
        let is_dir = exists && path.is_dir();
        let ignored = if exists {
            filter.matches(&key, is_dir)
        } else {
            filter.matches(&key, false) || filter.matches(&key, true)
        };
        if ignored {
            continue;
        }
        match action {
            Net::Added => {
                if !exists {
                    batch.still_missing += 1;
                } else if is_dir {
                    expand_directory(&path, root, filter, &mut batch.added);
                } else {
                    batch.added.push(key);
                }
            }
            Net::Modified => {
                if !exists {
                    batch.still_missing += 1;
                } else {
                    batch.modified.push(key);
                }
            }
            Net::Removed => batch.removed.push(key),
        }
    }

    for (from, to) in renames {
        let from_key = path_utils::to_relative_key(root, &from);
        let to_key = path_utils::to_relative_key(root, &to);
        match (from_key, to_key) {
            (Some(from_key), Some(to_key)) => {
                let to_is_dir = to.is_dir();
                let from_ignored =
                    filter.matches(&from_key, false) || filter.matches(&from_key, true);
                let to_ignored = filter.matches(&to_key, to_is_dir);
                match (from_ignored, to_ignored) {
                    (false, false) => batch.renamed.push((from_key, to_key)),
                    // Moved out of visibility: all the index can do is forget it.
                    (false, true) => batch.removed.push(from_key),
                    // Moved into visibility: a plain addition.
                    (true, false) => {
                        if to_is_dir {
                            expand_directory(&to, root, filter, &mut batch.added);
                        } else {
                            batch.added.push(to_key);
                        }
                    }
                    (true, true) => {}
                }
            }
            (Some(from_key), None) => {
                if !filter.matches(&from_key, false) && !filter.matches(&from_key, true) {
                    batch.removed.push(from_key);
                }
            }
            (None, Some(to_key)) => {
                if !filter.matches(&to_key, to.is_dir()) {
                    batch.added.push(to_key);
                }
            }
            (None, None) => {}
        }
    }

    batch.added.sort();
    batch.added.dedup();
    batch.removed.sort();
    batch.removed.dedup();
    batch.modified.sort();
    batch.modified.dedup();
    batch.renamed.sort();
    batch
}

/// A directory that appeared as one event (e.g. moved into the tree) is
/// expanded to every visible entry beneath it, using the same filter as the
/// initial scan.
fn expand_directory(path: &Path, root: &Path, filter: &PathFilter, added: &mut Vec<String>) {
    let walk_root = root.to_path_buf();
    let walk_filter = filter;
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| match path_utils::to_relative_key(&walk_root, e.path()) {
            Some(key) if !key.is_empty() => {
                !walk_filter.matches(&key, e.file_type().is_dir())
            }
            _ => true,
        })
        .filter_map(|e| e.ok())
    {
        if let Some(key) = path_utils::to_relative_key(root, entry.path()) {
            if !key.is_empty() {
                added.push(key);
            }
        }
    }
}
