/*
 * The core engine: directory scanning, live filesystem watching, token
 * counting, the in-memory tree index, and deterministic artifact rendering.
 * This module re-exports the abstractions (`FileClassifierOperations`,
 * `TokenCounterOperations`, `AggregatorOperations`, `WorkspaceStoreOperations`,
 * `ConfigManagerOperations`) alongside their concrete implementations, and the
 * `WorkspaceSession` facade that ties them together for a host UI.
 */
pub mod aggregator;
pub mod checksum_utils;
pub mod classifier;
pub mod config;
pub mod logging;
pub mod path_filter;
pub mod path_utils;
pub mod scanner;
pub mod selection_groups;
pub mod token_worker;
pub mod tokenizer_utils;
pub mod tree_index;
pub mod watcher;
pub mod workspace;

// Re-export the tree model and batch types
pub use tree_index::{
    Batch, BatchApplyError, BatchOutcome, BatchSummary, CheckState, Node, NodeKind, TokenCount,
    TreeIndex, Validity,
};

// Re-export filtering and classification
pub use classifier::{CoreFileClassifier, FileClassifierOperations};
pub use path_filter::PathFilter;

// Re-export scanning
pub use scanner::{CoreScanner, ScanError, ScanEvent, ScanHandle, ScanStats};

// Re-export watching
pub use watcher::{CoreWatcher, WatchError, WatchMessage, WatchState};

// Re-export token counting
pub use token_worker::{
    TokenCache, TokenCacheEntry, TokenProgressEntry, TokenSubmitter, TokenWorkerPool,
};
pub use tokenizer_utils::{
    CoreTikTokenCounter, SimpleWhitespaceTokenCounter, TokenCounterOperations,
};

// Re-export aggregation
pub use aggregator::{AggregatorOperations, CoreAggregator};

// Re-export selection groups and persistence
pub use selection_groups::{
    CoreWorkspaceStore, SelectionGroup, StoreError, WorkspaceData, WorkspaceStoreOperations,
};

// Re-export configuration
pub use config::{ConfigError, ConfigManagerOperations, CoreConfigManager, ScanSettings};

// Re-export the session facade
pub use workspace::{SessionError, SessionEvent, WorkspaceSession};

pub use logging::init_logging;
