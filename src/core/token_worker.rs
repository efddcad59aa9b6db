/*
 * Background token counting. Structural discovery marks includable files as
 * Pending; this pool fills the counts in, file by file, off the interactive
 * thread. CPU-bound work is spread over a bounded number of workers sized to
 * the available parallelism, the job queue is bounded (submission applies
 * backpressure rather than growing without limit), and duplicate requests for
 * a path already waiting are coalesced through a pending set.
 *
 * A per-path cache of (sha256 checksum, token count) short-circuits
 * re-tokenization of unchanged content. This is also what turns a
 * delete-then-create of identical bytes into a no-op for token totals.
 */
use super::checksum_utils;
use super::path_utils;
use super::tokenizer_utils::TokenCounterOperations;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Upper bound on queued tokenization jobs before submitters block.
const JOB_QUEUE_CAP: usize = 1024;

/// How often idle workers check for shutdown.
const WORKER_IDLE_TICK: Duration = Duration::from_millis(50);

/*
 * File name and extension patterns whose token counts are not worth
 * computing: generated lockfiles, minified bundles, and similar artifacts
 * that would dominate the totals without informing anyone. Matching files
 * are reported with a count of zero.
 */
pub const SKIP_TOKENIZATION_PATTERNS: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Gemfile.lock",
    "Pipfile.lock",
    "poetry.lock",
    "composer.lock",
    "go.sum",
    "Cargo.lock",
    "*.min.js",
    "*.min.css",
    "*.bundle.js",
    "*.bundle.css",
    "*.map",
];

/// Cached result for one file, persisted with the workspace so unchanged
/// files keep their counts across sessions. Entries are only valid for the
/// encoding they were produced with (see `WorkspaceData::token_encoding`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenCacheEntry {
    pub checksum: String,
    pub token_count: usize,
}

pub type TokenCache = HashMap<String, TokenCacheEntry>;

/// One completed count, flowing from a worker back to the session.
#[derive(Debug, Clone)]
pub struct TokenProgressEntry {
    pub path: String,
    pub token_count: usize,
    pub from_cache: bool,
}

/*
 * Cheap cloneable handle for queueing work from any thread. A path already
 * waiting is coalesced into the existing request; when the bounded queue is
 * full, `submit` blocks until a worker frees a slot; that backpressure is
 * deliberate.
 */
#[derive(Clone)]
pub struct TokenSubmitter {
    job_tx: Sender<String>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl TokenSubmitter {
    pub fn submit(&self, relative_key: &str) {
        {
            let mut pending = self.pending.lock().expect("pending set poisoned");
            if !pending.insert(relative_key.to_string()) {
                log::trace!("TokenWorkerPool: Coalesced duplicate request for '{relative_key}'.");
                return;
            }
        }
        if self.job_tx.send(relative_key.to_string()).is_err() {
            log::warn!("TokenWorkerPool: Job queue closed; dropping '{relative_key}'.");
        }
    }
}

pub struct TokenWorkerPool {
    submitter: TokenSubmitter,
    job_rx: Receiver<String>,
    closing: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl TokenWorkerPool {
    /*
     * Spawns `worker_count` workers (defaulting to the available parallelism
     * when zero is passed). Results are delivered on `results_tx`; the
     * receiving side owns applying them to the tree index.
     */
    pub fn new(
        root: PathBuf,
        counter: Arc<dyn TokenCounterOperations>,
        cache: Arc<Mutex<TokenCache>>,
        results_tx: Sender<TokenProgressEntry>,
        worker_count: usize,
    ) -> Self {
        let worker_count = if worker_count == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            worker_count
        };

        let (job_tx, job_rx): (Sender<String>, Receiver<String>) = bounded(JOB_QUEUE_CAP);
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let skip_patterns: Arc<Vec<Pattern>> = Arc::new(
            SKIP_TOKENIZATION_PATTERNS
                .iter()
                .filter_map(|p| Pattern::new(p).ok())
                .collect(),
        );

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let job_rx = job_rx.clone();
            let results_tx = results_tx.clone();
            let counter = Arc::clone(&counter);
            let cache = Arc::clone(&cache);
            let pending = Arc::clone(&pending);
            let closing = Arc::clone(&closing);
            let skip_patterns = Arc::clone(&skip_patterns);
            let root = root.clone();
            workers.push(std::thread::spawn(move || {
                worker_loop(
                    root,
                    job_rx,
                    results_tx,
                    counter,
                    cache,
                    pending,
                    closing,
                    skip_patterns,
                );
            }));
        }
        log::debug!("TokenWorkerPool: Started {worker_count} workers.");

        TokenWorkerPool {
            submitter: TokenSubmitter { job_tx, pending },
            job_rx,
            closing,
            workers,
        }
    }

    /// Handle for queueing work; clones freely across threads.
    pub fn submitter(&self) -> TokenSubmitter {
        self.submitter.clone()
    }

    /// See `TokenSubmitter::submit`.
    pub fn submit(&self, relative_key: &str) {
        self.submitter.submit(relative_key);
    }

    /// Graceful shutdown: workers drain the queued jobs (the queue is
    /// bounded, so this is bounded work) and are then joined.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.closing.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("TokenWorkerPool: Worker panicked.");
            }
        }
        debug_assert!(self.job_rx.is_empty());
    }
}

impl Drop for TokenWorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    root: PathBuf,
    job_rx: Receiver<String>,
    results_tx: Sender<TokenProgressEntry>,
    counter: Arc<dyn TokenCounterOperations>,
    cache: Arc<Mutex<TokenCache>>,
    pending: Arc<Mutex<HashSet<String>>>,
    closing: Arc<AtomicBool>,
    skip_patterns: Arc<Vec<Pattern>>,
) {
    loop {
        match job_rx.recv_timeout(WORKER_IDLE_TICK) {
            Ok(key) => {
                // Clear the pending mark first: a change arriving while we
                // read the file must be able to requeue it.
                pending.lock().expect("pending set poisoned").remove(&key);
                let entry = tokenize_one(&root, &key, &counter, &cache, &skip_patterns);
                if results_tx.send(entry).is_err() {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if closing.load(Ordering::Relaxed) && job_rx.is_empty() {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn tokenize_one(
    root: &Path,
    key: &str,
    counter: &Arc<dyn TokenCounterOperations>,
    cache: &Arc<Mutex<TokenCache>>,
    skip_patterns: &[Pattern],
) -> TokenProgressEntry {
    let file_name = path_utils::file_name_of_key(key);
    if skip_patterns
        .iter()
        .any(|p| p.matches(file_name) || p.matches(key))
    {
        log::debug!("TokenWorkerPool: Skipping tokenization of generated file '{key}'.");
        return TokenProgressEntry {
            path: key.to_string(),
            token_count: 0,
            from_cache: false,
        };
    }

    let absolute = path_utils::from_relative_key(root, key);
    let checksum = match checksum_utils::file_sha256(&absolute) {
        Ok(sum) => sum,
        Err(e) => {
            // The file vanished or became unreadable since it was queued.
            log::warn!("TokenWorkerPool: Cannot checksum '{key}': {e}. Reporting 0 tokens.");
            return TokenProgressEntry {
                path: key.to_string(),
                token_count: 0,
                from_cache: false,
            };
        }
    };

    {
        let cache = cache.lock().expect("token cache poisoned");
        if let Some(entry) = cache.get(key) {
            if entry.checksum == checksum {
                return TokenProgressEntry {
                    path: key.to_string(),
                    token_count: entry.token_count,
                    from_cache: true,
                };
            }
        }
    }

    let token_count = match std::fs::read(&absolute) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            counter.count_tokens(&text)
        }
        Err(e) => {
            log::warn!("TokenWorkerPool: Cannot read '{key}': {e}. Reporting 0 tokens.");
            0
        }
    };

    cache.lock().expect("token cache poisoned").insert(
        key.to_string(),
        TokenCacheEntry {
            checksum,
            token_count,
        },
    );

    TokenProgressEntry {
        path: key.to_string(),
        token_count,
        from_cache: false,
    }
}
