/*
 * context_packer: an incremental directory-scanning and live-update engine
 * for assembling LLM context from a source tree.
 *
 * The crate enumerates a file tree under configurable ignore rules,
 * classifies files as text/binary/too-large, computes per-file token counts
 * with a cl100k_base tokenizer, mirrors external filesystem changes into a
 * consistent in-memory index, and renders a deterministic text artifact from
 * the checked selection. Presentation (tree views, dialogs, clipboard) is the
 * host application's concern; it drives this crate through
 * `core::WorkspaceSession` and renders whatever the session emits.
 */
pub mod core;

pub use crate::core::{
    ScanSettings, SessionError, SessionEvent, WorkspaceData, WorkspaceSession,
};
