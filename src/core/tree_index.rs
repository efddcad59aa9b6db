/*
 * The authoritative in-memory mirror of a scanned directory tree. All paths
 * are relative keys with forward-slash separators (see `path_utils`); the root
 * directory is the node with the empty key. Every mutation (scan fill, batch
 * application, tokenization results, selection toggles) goes through
 * `TreeIndex`, which maintains three derived facts incrementally:
 *
 *   - a directory's token count is the sum of Known token counts of its
 *     includable descendant files, updated in O(depth) via deltas;
 *   - a directory's check state is Checked/Unchecked/Partial derived from its
 *     includable descendant files, via per-directory counters;
 *   - every non-root node's parent directory is present in the index.
 *
 * Consumers read through the owning session's lock and never observe a
 * half-applied mutation.
 */
use super::classifier::FileClassifierOperations;
use super::path_utils;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Includable,
    SkippedBinary,
    SkippedTooLarge,
    SkippedIgnored,
    PermissionDenied,
}

/*
 * Token count of a single node. Files discovered by the scanner start Pending
 * until the token worker reports a count; directories are always Known, since
 * their sum only covers descendants whose counts are Known.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCount {
    Pending,
    Known(usize),
}

impl TokenCount {
    pub fn known_or_zero(self) -> usize {
        match self {
            TokenCount::Pending => 0,
            TokenCount::Known(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Checked,
    Unchecked,
    Partial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub relative_path: String,
    pub kind: NodeKind,
    pub validity: Validity,
    pub token_count: TokenCount,
    pub check_state: CheckState,
}

impl Node {
    pub fn new_file(relative_path: String, validity: Validity) -> Self {
        let token_count = match validity {
            Validity::Includable => TokenCount::Pending,
            _ => TokenCount::Known(0),
        };
        Node {
            relative_path,
            kind: NodeKind::File,
            validity,
            token_count,
            check_state: CheckState::Unchecked,
        }
    }

    pub fn new_directory(relative_path: String, validity: Validity) -> Self {
        Node {
            relative_path,
            kind: NodeKind::Directory,
            validity,
            token_count: TokenCount::Known(0),
            check_state: CheckState::Unchecked,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_includable_file(&self) -> bool {
        self.kind == NodeKind::File && self.validity == Validity::Includable
    }
}

/*
 * One reconciled set of net filesystem changes, produced by the watcher once
 * per coalescing window and consumed exactly once by `apply_batch`. `renamed`
 * pairs are applied as delete(old)+insert(new) with the old node's check state
 * carried over. `still_missing` counts event paths that no longer existed on
 * disk when the window closed.
 */
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub renamed: Vec<(String, String)>,
    pub still_missing: usize,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.renamed.is_empty()
            && self.still_missing == 0
    }
}

/// Per-batch counts suitable for a transient notification in the host UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub still_missing: usize,
}

/// Result of applying one batch: the UI summary plus the includable files
/// whose token counts are now pending and must be (re)queued.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub summary: BatchSummary,
    pub to_tokenize: Vec<String>,
}

/*
 * A violated index invariant. These indicate a programming defect, never an
 * expected runtime condition, and are surfaced instead of silently corrupting
 * the aggregates.
 */
#[derive(Debug)]
pub enum BatchApplyError {
    MissingNode(String),
    AggregateUnderflow(String),
}

impl std::fmt::Display for BatchApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchApplyError::MissingNode(key) => {
                write!(f, "Index invariant violated: node '{key}' is missing")
            }
            BatchApplyError::AggregateUnderflow(key) => {
                write!(f, "Index invariant violated: aggregate underflow at '{key}'")
            }
        }
    }
}

impl std::error::Error for BatchApplyError {}

pub type Result<T> = std::result::Result<T, BatchApplyError>;

/// Per-directory counters backing the O(depth) check-state derivation.
#[derive(Debug, Clone, Copy, Default)]
struct DirStats {
    includable_files: usize,
    checked_files: usize,
}

impl DirStats {
    fn derive_state(&self) -> CheckState {
        if self.includable_files == 0 || self.checked_files == 0 {
            CheckState::Unchecked
        } else if self.checked_files == self.includable_files {
            CheckState::Checked
        } else {
            CheckState::Partial
        }
    }
}

pub struct TreeIndex {
    root: PathBuf,
    nodes: BTreeMap<String, Node>,
    children: HashMap<String, BTreeSet<String>>,
    dir_stats: HashMap<String, DirStats>,
}

impl TreeIndex {
    pub fn new(root: PathBuf) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node::new_directory(String::new(), Validity::Includable),
        );
        let mut dir_stats = HashMap::new();
        dir_stats.insert(String::new(), DirStats::default());
        let mut children = HashMap::new();
        children.insert(String::new(), BTreeSet::new());
        TreeIndex {
            root,
            nodes,
            children,
            dir_stats,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// Number of nodes excluding the synthetic root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All nodes in byte-lexicographic key order, root first.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Sorted child keys of a directory.
    pub fn children_of(&self, key: &str) -> impl Iterator<Item = &String> {
        self.children.get(key).into_iter().flatten()
    }

    /// Total token count of the tree (the root directory's aggregate).
    pub fn total_tokens(&self) -> usize {
        self.nodes[""].token_count.known_or_zero()
    }

    /// Checked includable files, in byte-lexicographic order.
    pub fn checked_paths(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .filter(|n| n.is_includable_file() && n.check_state == CheckState::Checked)
            .map(|n| n.relative_path.clone())
            .collect()
    }

    /*
     * Inserts one scanner-discovered node. Missing ancestor directories are
     * created on the fly so the no-orphan invariant holds regardless of the
     * order in which the scanner emits entries. Re-inserting an existing key
     * updates the node in place (idempotent fill).
     */
    pub fn insert_scanned(&mut self, node: Node) -> Result<()> {
        match node.kind {
            NodeKind::Directory => self.upsert_directory(node),
            NodeKind::File => self.upsert_file(node).map(|_| ()),
        }
    }

    /*
     * Applies one watcher batch atomically. Renames are applied first so that
     * carried check states are in place before adds/modifies touch the same
     * subtrees; removals follow; additions and modifications classify the
     * on-disk entry through `classifier`. The returned outcome lists every
     * includable file left Pending, for the caller to enqueue.
     */
    pub fn apply_batch(
        &mut self,
        batch: &Batch,
        classifier: &dyn FileClassifierOperations,
        max_file_size_bytes: u64,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        outcome.summary.still_missing = batch.still_missing;

        for (old_key, new_key) in &batch.renamed {
            self.apply_rename(old_key, new_key, classifier, max_file_size_bytes, &mut outcome)?;
        }

        for key in &batch.removed {
            if self.nodes.contains_key(key) {
                self.remove_subtree(key)?;
                outcome.summary.removed += 1;
            }
        }

        for key in &batch.added {
            self.apply_upsert_from_disk(key, classifier, max_file_size_bytes, &mut outcome, true)?;
        }

        for key in &batch.modified {
            self.apply_upsert_from_disk(key, classifier, max_file_size_bytes, &mut outcome, false)?;
        }

        log::debug!(
            "TreeIndex: Applied batch: {} added, {} removed, {} modified, {} still missing.",
            outcome.summary.added,
            outcome.summary.removed,
            outcome.summary.modified,
            outcome.summary.still_missing
        );
        Ok(outcome)
    }

    /*
     * Records a token count produced by the worker pool. Stale results, for
     * paths that were removed or reclassified since the request was queued,
     * are dropped. Ancestor sums absorb the delta in O(depth).
     */
    pub fn set_token_count(&mut self, key: &str, count: usize) -> Result<()> {
        let Some(node) = self.nodes.get_mut(key) else {
            log::trace!("TreeIndex: Dropping token count for vanished path '{key}'.");
            return Ok(());
        };
        if !node.is_includable_file() {
            log::trace!("TreeIndex: Dropping token count for non-includable path '{key}'.");
            return Ok(());
        }
        let previous = node.token_count.known_or_zero();
        node.token_count = TokenCount::Known(count);
        let delta = count as i64 - previous as i64;
        if delta != 0 {
            let parent = path_utils::parent_key(key)
                .ok_or_else(|| BatchApplyError::MissingNode(key.to_string()))?
                .to_string();
            self.bubble_token_delta(&parent, delta)?;
        }
        Ok(())
    }

    /*
     * Toggles the check state of a file, or of a whole directory subtree. The
     * parent chain is re-derived bottom-up afterwards. Toggling a skipped file
     * is a no-op; skipped files never participate in the artifact.
     */
    pub fn set_checked(&mut self, key: &str, checked: bool) -> Result<()> {
        let Some(node) = self.nodes.get(key) else {
            log::debug!("TreeIndex: set_checked on unknown path '{key}' ignored.");
            return Ok(());
        };
        match node.kind {
            NodeKind::File => {
                if !node.is_includable_file() {
                    return Ok(());
                }
                self.set_file_checked(key.to_string(), checked)
            }
            NodeKind::Directory => {
                let files: Vec<String> = self
                    .descendants_of(key)
                    .filter(|k| self.nodes[k.as_str()].is_includable_file())
                    .collect();
                for file_key in files {
                    self.set_file_checked(file_key, checked)?;
                }
                Ok(())
            }
        }
    }

    // ---- internals ----

    fn set_file_checked(&mut self, key: String, checked: bool) -> Result<()> {
        let node = self
            .nodes
            .get_mut(&key)
            .ok_or_else(|| BatchApplyError::MissingNode(key.clone()))?;
        let was_checked = node.check_state == CheckState::Checked;
        if was_checked == checked {
            return Ok(());
        }
        node.check_state = if checked {
            CheckState::Checked
        } else {
            CheckState::Unchecked
        };
        let parent = path_utils::parent_key(&key)
            .ok_or_else(|| BatchApplyError::MissingNode(key.clone()))?
            .to_string();
        self.bubble_stats_delta(&parent, 0, if checked { 1 } else { -1 })
    }

    fn upsert_directory(&mut self, node: Node) -> Result<()> {
        let key = node.relative_path.clone();
        if let Some(existing) = self.nodes.get_mut(&key) {
            existing.validity = node.validity;
            return Ok(());
        }
        self.ensure_parent_chain(&key)?;
        let parent = path_utils::parent_key(&key)
            .ok_or_else(|| BatchApplyError::MissingNode(key.clone()))?
            .to_string();
        self.children.entry(parent).or_default().insert(key.clone());
        self.children.entry(key.clone()).or_default();
        self.dir_stats.entry(key.clone()).or_default();
        self.nodes.insert(key, node);
        Ok(())
    }

    /// Returns true when the resulting node is an includable file whose token
    /// count is Pending (i.e. it needs tokenization).
    fn upsert_file(&mut self, node: Node) -> Result<bool> {
        let key = node.relative_path.clone();
        if self.nodes.contains_key(&key) {
            return self.reclassify_existing_file(&key, node.validity);
        }
        self.ensure_parent_chain(&key)?;
        let parent = path_utils::parent_key(&key)
            .ok_or_else(|| BatchApplyError::MissingNode(key.clone()))?
            .to_string();
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(key.clone());
        let needs_tokens = node.is_includable_file();
        let d_includable = if needs_tokens { 1 } else { 0 };
        self.nodes.insert(key, node);
        if d_includable != 0 {
            self.bubble_stats_delta(&parent, d_includable, 0)?;
        }
        Ok(needs_tokens)
    }

    /// Applies a fresh classification to a file already in the index,
    /// preserving its check state. Returns true when re-tokenization is due.
    fn reclassify_existing_file(&mut self, key: &str, validity: Validity) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(key)
            .ok_or_else(|| BatchApplyError::MissingNode(key.to_string()))?;
        let was_includable = node.is_includable_file();
        let was_checked = node.check_state == CheckState::Checked;
        let old_tokens = node.token_count.known_or_zero();

        node.validity = validity;
        let now_includable = node.is_includable_file();
        let mut token_delta = 0i64;
        let mut d_includable = 0i64;
        let mut d_checked = 0i64;

        if now_includable {
            // Content may have changed: counts revert to Pending either way.
            node.token_count = TokenCount::Pending;
            token_delta = -(old_tokens as i64);
            if !was_includable {
                d_includable = 1;
            }
        } else {
            node.token_count = TokenCount::Known(0);
            node.check_state = CheckState::Unchecked;
            if was_includable {
                token_delta = -(old_tokens as i64);
                d_includable = -1;
                if was_checked {
                    d_checked = -1;
                }
            }
        }

        let parent = path_utils::parent_key(key)
            .ok_or_else(|| BatchApplyError::MissingNode(key.to_string()))?
            .to_string();
        if token_delta != 0 {
            self.bubble_token_delta(&parent, token_delta)?;
        }
        if d_includable != 0 || d_checked != 0 {
            self.bubble_stats_delta(&parent, d_includable, d_checked)?;
        }
        Ok(now_includable)
    }

    fn apply_upsert_from_disk(
        &mut self,
        key: &str,
        classifier: &dyn FileClassifierOperations,
        max_file_size_bytes: u64,
        outcome: &mut BatchOutcome,
        counts_as_added: bool,
    ) -> Result<()> {
        let absolute = path_utils::from_relative_key(&self.root, key);
        if !absolute.exists() {
            // The path vanished again between window close and application.
            outcome.summary.still_missing += 1;
            return Ok(());
        }
        let existed = self.nodes.contains_key(key);
        if absolute.is_dir() {
            self.upsert_directory(Node::new_directory(key.to_string(), Validity::Includable))?;
        } else {
            let validity = classifier.classify(&absolute, max_file_size_bytes);
            let needs_tokens = self.upsert_file(Node::new_file(key.to_string(), validity))?;
            if needs_tokens {
                outcome.to_tokenize.push(key.to_string());
            }
        }
        if counts_as_added && !existed {
            outcome.summary.added += 1;
        } else if existed {
            outcome.summary.modified += 1;
        } else {
            // A modify event for a path the index never saw (e.g. it became
            // visible only now) surfaces as an addition.
            outcome.summary.added += 1;
        }
        Ok(())
    }

    fn apply_rename(
        &mut self,
        old_key: &str,
        new_key: &str,
        classifier: &dyn FileClassifierOperations,
        max_file_size_bytes: u64,
        outcome: &mut BatchOutcome,
    ) -> Result<()> {
        let Some(old_node) = self.nodes.get(old_key).cloned() else {
            // Second application of the same batch, or a rename of an ignored
            // path: fall back to treating the destination as an addition.
            if !self.nodes.contains_key(new_key) {
                self.apply_upsert_from_disk(
                    new_key,
                    classifier,
                    max_file_size_bytes,
                    outcome,
                    true,
                )?;
            }
            return Ok(());
        };

        // Capture the carried state of the whole moved subtree before removal.
        let mut carried: Vec<Node> = vec![old_node.clone()];
        if old_node.is_dir() {
            for descendant in self.descendants_of(old_key).collect::<Vec<_>>() {
                carried.push(self.nodes[&descendant].clone());
            }
        }
        self.remove_subtree(old_key)?;
        outcome.summary.removed += 1;

        for node in carried {
            let suffix = node.relative_path[old_key.len()..].to_string();
            let key = format!("{new_key}{suffix}");
            match node.kind {
                NodeKind::Directory => {
                    self.upsert_directory(Node::new_directory(key, node.validity))?;
                }
                NodeKind::File => {
                    // Content is unchanged by a rename: re-insert a fresh node
                    // and replay the carried token count and check state so
                    // the ancestor aggregates absorb them as normal deltas.
                    let needs = self.upsert_file(Node::new_file(key.clone(), node.validity))?;
                    if let TokenCount::Known(n) = node.token_count {
                        self.set_token_count(&key, n)?;
                    }
                    if node.check_state == CheckState::Checked {
                        self.set_checked(&key, true)?;
                    }
                    if needs && node.token_count == TokenCount::Pending {
                        outcome.to_tokenize.push(key);
                    }
                }
            }
        }
        outcome.summary.added += 1;
        Ok(())
    }

    fn remove_subtree(&mut self, key: &str) -> Result<()> {
        let removed_keys: Vec<String> = std::iter::once(key.to_string())
            .chain(self.descendants_of(key))
            .collect();

        // Aggregate the removed contribution before touching the maps.
        let mut token_delta = 0i64;
        let mut d_includable = 0i64;
        let mut d_checked = 0i64;
        for k in &removed_keys {
            let node = self
                .nodes
                .get(k)
                .ok_or_else(|| BatchApplyError::MissingNode(k.clone()))?;
            if node.is_includable_file() {
                token_delta -= node.token_count.known_or_zero() as i64;
                d_includable -= 1;
                if node.check_state == CheckState::Checked {
                    d_checked -= 1;
                }
            }
        }

        let parent = path_utils::parent_key(key)
            .ok_or_else(|| BatchApplyError::MissingNode(key.to_string()))?
            .to_string();
        for k in &removed_keys {
            self.nodes.remove(k);
            self.children.remove(k);
            self.dir_stats.remove(k);
        }
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.remove(key);
        }
        if token_delta != 0 {
            self.bubble_token_delta(&parent, token_delta)?;
        }
        if d_includable != 0 || d_checked != 0 {
            self.bubble_stats_delta(&parent, d_includable, d_checked)?;
        }
        Ok(())
    }

    /// Descendant keys of a directory, in key order.
    fn descendants_of(&self, key: &str) -> impl Iterator<Item = String> + '_ {
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };
        let start = prefix.clone();
        self.nodes
            .range(start..)
            .map(|(k, _)| k.clone())
            .skip(if key.is_empty() { 1 } else { 0 }) // skip the root itself
            .take_while(move |k| k.starts_with(&prefix))
    }

    fn ensure_parent_chain(&mut self, key: &str) -> Result<()> {
        let mut missing: Vec<String> = Vec::new();
        let mut cursor = path_utils::parent_key(key)
            .ok_or_else(|| BatchApplyError::MissingNode(key.to_string()))?;
        while !cursor.is_empty() && !self.nodes.contains_key(cursor) {
            missing.push(cursor.to_string());
            cursor = path_utils::parent_key(cursor)
                .ok_or_else(|| BatchApplyError::MissingNode(cursor.to_string()))?;
        }
        for dir_key in missing.into_iter().rev() {
            self.upsert_directory(Node::new_directory(dir_key, Validity::Includable))?;
        }
        Ok(())
    }

    fn bubble_token_delta(&mut self, start: &str, delta: i64) -> Result<()> {
        let mut cursor = Some(start.to_string());
        while let Some(key) = cursor {
            let node = self
                .nodes
                .get_mut(&key)
                .ok_or_else(|| BatchApplyError::MissingNode(key.clone()))?;
            let current = node.token_count.known_or_zero() as i64;
            let next = current + delta;
            if next < 0 {
                return Err(BatchApplyError::AggregateUnderflow(key));
            }
            node.token_count = TokenCount::Known(next as usize);
            cursor = path_utils::parent_key(&key).map(str::to_string);
        }
        Ok(())
    }

    fn bubble_stats_delta(&mut self, start: &str, d_includable: i64, d_checked: i64) -> Result<()> {
        let mut cursor = Some(start.to_string());
        while let Some(key) = cursor {
            let stats = self
                .dir_stats
                .get_mut(&key)
                .ok_or_else(|| BatchApplyError::MissingNode(key.clone()))?;
            let includable = stats.includable_files as i64 + d_includable;
            let checked = stats.checked_files as i64 + d_checked;
            if includable < 0 || checked < 0 || checked > includable {
                return Err(BatchApplyError::AggregateUnderflow(key));
            }
            stats.includable_files = includable as usize;
            stats.checked_files = checked as usize;
            let derived = stats.derive_state();
            self.nodes
                .get_mut(&key)
                .ok_or_else(|| BatchApplyError::MissingNode(key.clone()))?
                .check_state = derived;
            cursor = path_utils::parent_key(&key).map(str::to_string);
        }
        Ok(())
    }

    /*
     * Recomputes every aggregate from scratch and compares with the
     * incrementally maintained values. Test-only; mutation tests call this
     * after every step.
     */
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        // Recompute every directory aggregate from the files alone.
        let mut expected: HashMap<String, DirStats> = HashMap::new();
        let mut expected_tokens: HashMap<String, usize> = HashMap::new();
        for (key, node) in &self.nodes {
            assert_eq!(key, &node.relative_path);
            if !key.is_empty() {
                let parent = path_utils::parent_key(key).unwrap();
                assert!(
                    self.nodes.contains_key(parent),
                    "orphan node '{key}': parent '{parent}' missing"
                );
                assert!(
                    self.children[parent].contains(key),
                    "child index missing '{key}' under '{parent}'"
                );
            }
            if node.is_dir() {
                expected.entry(key.clone()).or_default();
                expected_tokens.entry(key.clone()).or_default();
            }
            if node.is_includable_file() {
                let mut cursor = path_utils::parent_key(key);
                while let Some(dir) = cursor {
                    let stats = expected.entry(dir.to_string()).or_default();
                    stats.includable_files += 1;
                    if node.check_state == CheckState::Checked {
                        stats.checked_files += 1;
                    }
                    *expected_tokens.entry(dir.to_string()).or_default() +=
                        node.token_count.known_or_zero();
                    cursor = path_utils::parent_key(dir);
                }
            }
        }
        for (key, node) in &self.nodes {
            if !node.is_dir() {
                continue;
            }
            let want = expected[key.as_str()];
            let have = self.dir_stats[key.as_str()];
            assert_eq!(
                node.token_count,
                TokenCount::Known(expected_tokens[key.as_str()]),
                "token sum drift at '{key}'"
            );
            assert_eq!(
                have.includable_files, want.includable_files,
                "includable drift at '{key}'"
            );
            assert_eq!(have.checked_files, want.checked_files, "checked drift at '{key}'");
            assert_eq!(node.check_state, want.derive_state(), "state drift at '{key}'");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::CoreFileClassifier;
    use rand::Rng;
    use std::fs;
    use tempfile::tempdir;

    fn index_with_files(files: &[(&str, Validity)]) -> TreeIndex {
        let mut tree = TreeIndex::new(PathBuf::from("/test/root"));
        for (path, validity) in files {
            tree.insert_scanned(Node::new_file(path.to_string(), *validity))
                .unwrap();
        }
        tree
    }

    #[test]
    fn test_insert_creates_parent_chain() {
        let tree = index_with_files(&[("src/core/deep.rs", Validity::Includable)]);
        assert!(tree.get("src").is_some());
        assert!(tree.get("src/core").is_some());
        assert!(tree.get("src/core/deep.rs").is_some());
        tree.assert_invariants();
    }

    #[test]
    fn test_token_counts_bubble_to_ancestors() {
        let mut tree = index_with_files(&[
            ("src/a.rs", Validity::Includable),
            ("src/sub/b.rs", Validity::Includable),
            ("readme.md", Validity::Includable),
        ]);
        tree.set_token_count("src/a.rs", 10).unwrap();
        tree.set_token_count("src/sub/b.rs", 7).unwrap();
        tree.set_token_count("readme.md", 3).unwrap();

        assert_eq!(tree.get("src").unwrap().token_count, TokenCount::Known(17));
        assert_eq!(tree.total_tokens(), 20);
        tree.assert_invariants();

        // Re-reporting a different count replaces, not accumulates.
        tree.set_token_count("src/a.rs", 4).unwrap();
        assert_eq!(tree.get("src").unwrap().token_count, TokenCount::Known(11));
        tree.assert_invariants();
    }

    #[test]
    fn test_skipped_files_do_not_contribute() {
        let mut tree = index_with_files(&[
            ("a.txt", Validity::Includable),
            ("b.bin", Validity::SkippedBinary),
        ]);
        tree.set_token_count("a.txt", 5).unwrap();
        // Counts reported for skipped files are dropped.
        tree.set_token_count("b.bin", 99).unwrap();
        assert_eq!(tree.total_tokens(), 5);
        tree.assert_invariants();
    }

    #[test]
    fn test_check_state_derivation() {
        let mut tree = index_with_files(&[
            ("src/a.rs", Validity::Includable),
            ("src/b.rs", Validity::Includable),
        ]);
        assert_eq!(tree.get("src").unwrap().check_state, CheckState::Unchecked);

        tree.set_checked("src/a.rs", true).unwrap();
        assert_eq!(tree.get("src").unwrap().check_state, CheckState::Partial);
        assert_eq!(tree.get("").unwrap().check_state, CheckState::Partial);

        tree.set_checked("src/b.rs", true).unwrap();
        assert_eq!(tree.get("src").unwrap().check_state, CheckState::Checked);
        tree.assert_invariants();

        tree.set_checked("src/a.rs", false).unwrap();
        assert_eq!(tree.get("src").unwrap().check_state, CheckState::Partial);
        tree.assert_invariants();
    }

    #[test]
    fn test_directory_toggle_is_recursive() {
        let mut tree = index_with_files(&[
            ("src/a.rs", Validity::Includable),
            ("src/sub/b.rs", Validity::Includable),
            ("src/sub/skip.bin", Validity::SkippedBinary),
            ("other.txt", Validity::Includable),
        ]);
        tree.set_checked("src", true).unwrap();

        assert_eq!(tree.get("src/a.rs").unwrap().check_state, CheckState::Checked);
        assert_eq!(
            tree.get("src/sub/b.rs").unwrap().check_state,
            CheckState::Checked
        );
        // Skipped files are never checked.
        assert_eq!(
            tree.get("src/sub/skip.bin").unwrap().check_state,
            CheckState::Unchecked
        );
        assert_eq!(tree.get("src").unwrap().check_state, CheckState::Checked);
        assert_eq!(tree.get("").unwrap().check_state, CheckState::Partial);
        tree.assert_invariants();

        tree.set_checked("", false).unwrap();
        assert!(tree.checked_paths().is_empty());
        tree.assert_invariants();
    }

    #[test]
    fn test_directory_without_includable_descendants_is_unchecked() {
        let tree = index_with_files(&[("assets/logo.png", Validity::SkippedBinary)]);
        assert_eq!(tree.get("assets").unwrap().check_state, CheckState::Unchecked);
    }

    #[test]
    fn test_apply_batch_add_remove_modify() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/new.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("kept.txt"), "kept").unwrap();

        // The index must point at the real temp root for disk-backed upserts.
        let mut tree2 = TreeIndex::new(dir.path().to_path_buf());
        tree2
            .insert_scanned(Node::new_file("gone.txt".into(), Validity::Includable))
            .unwrap();
        tree2
            .insert_scanned(Node::new_file("kept.txt".into(), Validity::Includable))
            .unwrap();

        let classifier = CoreFileClassifier::new();
        let batch = Batch {
            added: vec!["src/new.rs".into()],
            removed: vec!["gone.txt".into()],
            modified: vec!["kept.txt".into()],
            ..Default::default()
        };
        let outcome = tree2.apply_batch(&batch, &classifier, 200 * 1024).unwrap();

        assert_eq!(outcome.summary.added, 1);
        assert_eq!(outcome.summary.removed, 1);
        assert_eq!(outcome.summary.modified, 1);
        assert!(tree2.get("gone.txt").is_none());
        assert!(tree2.get("src/new.rs").is_some());
        assert!(outcome.to_tokenize.contains(&"src/new.rs".to_string()));
        assert!(outcome.to_tokenize.contains(&"kept.txt".to_string()));
        tree2.assert_invariants();
    }

    #[test]
    fn test_apply_batch_is_idempotent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();

        let mut tree = TreeIndex::new(dir.path().to_path_buf());
        tree.insert_scanned(Node::new_file("stale.txt".into(), Validity::Includable))
            .unwrap();

        let classifier = CoreFileClassifier::new();
        let batch = Batch {
            added: vec!["a.txt".into()],
            removed: vec!["stale.txt".into()],
            ..Default::default()
        };

        tree.apply_batch(&batch, &classifier, 200 * 1024).unwrap();
        let snapshot: Vec<Node> = tree.iter().cloned().collect();
        tree.assert_invariants();

        // Second application: duplicate add becomes a modify, duplicate
        // remove is a no-op; the resulting node set is unchanged.
        tree.apply_batch(&batch, &classifier, 200 * 1024).unwrap();
        let again: Vec<Node> = tree.iter().cloned().collect();
        assert_eq!(snapshot, again);
        tree.assert_invariants();
    }

    #[test]
    fn test_rename_carries_check_state() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("new.py"), "print('hi')").unwrap();

        let mut tree = TreeIndex::new(dir.path().to_path_buf());
        tree.insert_scanned(Node::new_file("old.py".into(), Validity::Includable))
            .unwrap();
        tree.set_token_count("old.py", 6).unwrap();
        tree.set_checked("old.py", true).unwrap();

        let classifier = CoreFileClassifier::new();
        let batch = Batch {
            renamed: vec![("old.py".into(), "new.py".into())],
            ..Default::default()
        };
        tree.apply_batch(&batch, &classifier, 200 * 1024).unwrap();

        assert!(tree.get("old.py").is_none());
        let new_node = tree.get("new.py").unwrap();
        assert_eq!(new_node.check_state, CheckState::Checked);
        // Content is unchanged by a rename, so the Known count survives.
        assert_eq!(new_node.token_count, TokenCount::Known(6));
        assert_eq!(tree.total_tokens(), 6);
        tree.assert_invariants();
    }

    #[test]
    fn test_modify_to_binary_removes_contribution() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flip.txt");
        fs::write(&path, b"now\x00binary").unwrap();

        let mut tree = TreeIndex::new(dir.path().to_path_buf());
        tree.insert_scanned(Node::new_file("flip.txt".into(), Validity::Includable))
            .unwrap();
        tree.set_token_count("flip.txt", 12).unwrap();
        tree.set_checked("flip.txt", true).unwrap();
        assert_eq!(tree.total_tokens(), 12);

        let classifier = CoreFileClassifier::new();
        let batch = Batch {
            modified: vec!["flip.txt".into()],
            ..Default::default()
        };
        tree.apply_batch(&batch, &classifier, 200 * 1024).unwrap();

        let node = tree.get("flip.txt").unwrap();
        assert_eq!(node.validity, Validity::SkippedBinary);
        assert_eq!(node.check_state, CheckState::Unchecked);
        assert_eq!(tree.total_tokens(), 0);
        tree.assert_invariants();
    }

    #[test]
    fn test_still_missing_counted_for_vanished_paths() {
        let dir = tempdir().unwrap();
        let mut tree = TreeIndex::new(dir.path().to_path_buf());
        let classifier = CoreFileClassifier::new();
        let batch = Batch {
            added: vec!["never_created.txt".into()],
            ..Default::default()
        };
        let outcome = tree.apply_batch(&batch, &classifier, 200 * 1024).unwrap();
        assert_eq!(outcome.summary.added, 0);
        assert_eq!(outcome.summary.still_missing, 1);
    }

    #[test]
    fn test_invariants_hold_under_random_mutations() {
        let mut rng = rand::rng();
        let mut tree = TreeIndex::new(PathBuf::from("/fuzz/root"));
        let dirs = ["", "src", "src/core", "docs", "src/util"];
        let names = ["a.rs", "b.rs", "c.txt", "d.md", "e.bin"];

        let mut live: Vec<String> = Vec::new();
        for _ in 0..500 {
            match rng.random_range(0..4) {
                0 => {
                    let dir = dirs[rng.random_range(0..dirs.len())];
                    let name = names[rng.random_range(0..names.len())];
                    let key = if dir.is_empty() {
                        name.to_string()
                    } else {
                        format!("{dir}/{name}")
                    };
                    let validity = if name.ends_with(".bin") {
                        Validity::SkippedBinary
                    } else {
                        Validity::Includable
                    };
                    tree.insert_scanned(Node::new_file(key.clone(), validity))
                        .unwrap();
                    if !live.contains(&key) {
                        live.push(key);
                    }
                }
                1 => {
                    if !live.is_empty() {
                        let key = live[rng.random_range(0..live.len())].clone();
                        tree.set_token_count(&key, rng.random_range(0..1000)).unwrap();
                    }
                }
                2 => {
                    if !live.is_empty() {
                        let key = live[rng.random_range(0..live.len())].clone();
                        tree.set_checked(&key, rng.random_range(0..2) == 0).unwrap();
                    }
                }
                _ => {
                    if !live.is_empty() {
                        let idx = rng.random_range(0..live.len());
                        let key = live.remove(idx);
                        if tree.get(&key).is_some() {
                            let batch = Batch {
                                removed: vec![key.clone()],
                                ..Default::default()
                            };
                            let classifier = CoreFileClassifier::new();
                            tree.apply_batch(&batch, &classifier, 1024).unwrap();
                        }
                    }
                }
            }
            // The point of the test: aggregates stay exact after *every*
            // mutation, not just at the end.
            tree.assert_invariants();
        }
    }
}
