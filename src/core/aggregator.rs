/*
 * Renders the aggregated text artifact from the current tree and selection:
 * optional instructions, an ASCII tree of the checked paths, then one fenced
 * code block per checked includable file in byte-lexicographic path order.
 *
 * The output is byte-for-byte reproducible for identical inputs. Nothing here
 * depends on scan or event order, timestamps, or map iteration order.
 */
use super::path_utils;
use super::tree_index::TreeIndex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

/// Marker appended when a file's content is cut at the render size ceiling.
pub const TRUNCATION_MARKER: &str = "[truncated]";

/// Body emitted when a selected file cannot be read at render time.
const UNREADABLE_MARKER: &str = "[unreadable file]";

pub trait AggregatorOperations: Send + Sync {
    /*
     * Produces the artifact and the total token count of the rendered files.
     * `checked_paths` is the selection (relative keys); paths that are not
     * includable files in the tree are skipped silently, so a stale selection
     * group degrades gracefully.
     */
    fn render(
        &self,
        tree: &TreeIndex,
        checked_paths: &BTreeSet<String>,
        instructions: &str,
        max_render_file_bytes: u64,
    ) -> (String, usize);
}

pub struct CoreAggregator {}

impl CoreAggregator {
    pub fn new() -> Self {
        CoreAggregator {}
    }
}

impl Default for CoreAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregatorOperations for CoreAggregator {
    fn render(
        &self,
        tree: &TreeIndex,
        checked_paths: &BTreeSet<String>,
        instructions: &str,
        max_render_file_bytes: u64,
    ) -> (String, usize) {
        // BTreeSet iteration is already byte-lexicographic, which is the
        // artifact's required ordering.
        let files: Vec<&String> = checked_paths
            .iter()
            .filter(|key| tree.get(key).is_some_and(|n| n.is_includable_file()))
            .collect();

        let total_tokens: usize = files
            .iter()
            .filter_map(|key| tree.get(key))
            .map(|n| n.token_count.known_or_zero())
            .sum();

        let mut out = String::new();
        if !instructions.is_empty() {
            out.push_str(instructions);
            if !instructions.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }

        if files.is_empty() {
            return (out, 0);
        }

        out.push_str(&render_tree_section(tree.root(), &files));
        out.push_str("\n---\n\n");

        for key in &files {
            let absolute = path_utils::from_relative_key(tree.root(), key);
            out.push_str(&format!("## {key}\n\n"));
            let lang = language_for_path(key);
            out.push_str("```");
            out.push_str(lang);
            out.push('\n');
            out.push_str(&read_for_render(&absolute, max_render_file_bytes));
            out.push_str("```\n\n");
        }

        (out, total_tokens)
    }
}

/// Reads a file body for embedding, truncating at the configured ceiling with
/// an explicit marker and normalizing the trailing newline before the fence.
fn read_for_render(path: &Path, max_bytes: u64) -> String {
    let mut body = match fs::read(path) {
        Ok(bytes) => {
            let truncated = bytes.len() as u64 > max_bytes;
            let mut cut = if truncated {
                let mut end = max_bytes as usize;
                // Never cut inside a UTF-8 sequence.
                while end > 0 && bytes.get(end).is_some_and(|b| b & 0xC0 == 0x80) {
                    end -= 1;
                }
                String::from_utf8_lossy(&bytes[..end]).into_owned()
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            };
            if truncated {
                if !cut.ends_with('\n') {
                    cut.push('\n');
                }
                cut.push_str(TRUNCATION_MARKER);
                cut.push('\n');
            }
            cut
        }
        Err(e) => {
            log::warn!("Aggregator: Cannot read {path:?} while rendering: {e}");
            format!("{UNREADABLE_MARKER}\n")
        }
    };
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body
}

/*
 * ASCII tree of the checked paths and their implied ancestor directories,
 * in the familiar `├──`/`└──` box-drawing format, headed by the workspace
 * root's name.
 */
fn render_tree_section(root: &Path, files: &[&String]) -> String {
    #[derive(Default)]
    struct Level(BTreeMap<String, Level>);

    let mut top = Level::default();
    for key in files {
        let mut node = &mut top;
        for segment in key.split('/') {
            node = node.0.entry(segment.to_string()).or_default();
        }
    }

    fn build_lines(level: &Level, prefix: &str, out: &mut String) {
        let count = level.0.len();
        for (i, (name, child)) in level.0.iter().enumerate() {
            let is_last = i == count - 1;
            let connector = if is_last { "└── " } else { "├── " };
            let suffix = if child.0.is_empty() { "" } else { "/" };
            out.push_str(prefix);
            out.push_str(connector);
            out.push_str(name);
            out.push_str(suffix);
            out.push('\n');
            if !child.0.is_empty() {
                let deeper = format!("{prefix}{}", if is_last { "    " } else { "│   " });
                build_lines(child, &deeper, out);
            }
        }
    }

    let root_name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.to_string_lossy().into_owned());
    let mut out = format!("{root_name}/\n");
    build_lines(&top, "", &mut out);
    out
}

/// Fence language tag derived from the file extension; unrecognized
/// extensions get an untagged fence.
fn language_for_path(key: &str) -> &'static str {
    let ext = match path_utils::file_name_of_key(key).rsplit_once('.') {
        Some((_, ext)) => ext,
        None => return "",
    };
    match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" => "typescript",
        "tsx" => "tsx",
        "jsx" => "jsx",
        "html" | "htm" => "html",
        "css" => "css",
        "scss" => "scss",
        "json" => "json",
        "toml" => "toml",
        "yml" | "yaml" => "yaml",
        "md" => "markdown",
        "sh" | "bash" => "bash",
        "ps1" => "powershell",
        "sql" => "sql",
        "xml" => "xml",
        "c" => "c",
        "h" | "hpp" | "cc" | "cpp" | "cxx" => "cpp",
        "cs" => "csharp",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        _ => "",
    }
}
