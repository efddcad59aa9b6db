/*
 * Token counting abstractions. `TokenCounterOperations` decouples consumers
 * from the tokenization strategy; `CoreTikTokenCounter` implements it with the
 * `tiktoken-rs` cl100k_base BPE, and `SimpleWhitespaceTokenCounter` provides a
 * cheap word-count estimate used as a fallback and in tests.
 *
 * Counts are deterministic for identical input, which is what allows cached
 * per-file counts to be reused as long as the file checksum and the encoding
 * name match.
 */
use log::error;
use tiktoken_rs::{CoreBPE, cl100k_base};

/*
 * Contract for a service that can count tokens in a text buffer. The encoding
 * is versioned via `encoding_name` so persisted counts can be invalidated when
 * the scheme changes.
 */
pub trait TokenCounterOperations: Send + Sync {
    /// Counts the number of tokens in the provided text.
    fn count_tokens(&self, text: &str) -> usize;

    /// Stable identifier of the encoding scheme used for counting.
    fn encoding_name(&self) -> &'static str;
}

/*
 * `TokenCounterOperations` backed by the cl100k_base model (~100K merges).
 * The BPE tables are built once at construction; if initialization fails the
 * counter degrades to whitespace counting and logs the error once.
 */
pub struct CoreTikTokenCounter {
    bpe: Option<CoreBPE>,
}

impl CoreTikTokenCounter {
    pub fn new() -> Self {
        let bpe = match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                error!(
                    "TokenCounter: Failed to initialize cl100k_base BPE: {e:?}. \
                     Falling back to whitespace token counts."
                );
                None
            }
        };
        CoreTikTokenCounter { bpe }
    }
}

impl Default for CoreTikTokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounterOperations for CoreTikTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.split_whitespace().count(),
        }
    }

    fn encoding_name(&self) -> &'static str {
        "cl100k_base"
    }
}

/*
 * Estimates tokens by counting whitespace-separated words. Deterministic and
 * dependency-free; useful where an exact count is not needed.
 */
pub struct SimpleWhitespaceTokenCounter;

impl SimpleWhitespaceTokenCounter {
    pub fn new() -> Self {
        SimpleWhitespaceTokenCounter
    }
}

impl Default for SimpleWhitespaceTokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounterOperations for SimpleWhitespaceTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn encoding_name(&self) -> &'static str {
        "whitespace"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_counter_empty_string() {
        let counter = SimpleWhitespaceTokenCounter::new();
        assert_eq!(counter.count_tokens(""), 0);
    }

    #[test]
    fn test_whitespace_counter_multiple_words() {
        let counter = SimpleWhitespaceTokenCounter::new();
        assert_eq!(counter.count_tokens("hello world example"), 3);
        assert_eq!(counter.count_tokens("  hello world  "), 2);
        assert_eq!(counter.count_tokens("hello\tworld\r\nexample"), 3);
    }

    #[test]
    fn test_tiktoken_counter_empty_string() {
        let counter = CoreTikTokenCounter::new();
        assert_eq!(counter.count_tokens(""), 0);
    }

    #[test]
    fn test_tiktoken_counter_simple_text() {
        let counter = CoreTikTokenCounter::new();
        // "hello world" is 2 tokens with cl100k_base.
        assert_eq!(counter.count_tokens("hello world"), 2);
        // "Hello, world!" splits into "Hello", ",", " world", "!".
        assert_eq!(counter.count_tokens("Hello, world!"), 4);
    }

    #[test]
    fn test_tiktoken_counter_is_deterministic() {
        let counter = CoreTikTokenCounter::new();
        let text = "fn main() {\n    println!(\"hello\");\n}\n";
        assert_eq!(counter.count_tokens(text), counter.count_tokens(text));
    }

    #[test]
    fn test_encoding_names() {
        assert_eq!(CoreTikTokenCounter::new().encoding_name(), "cl100k_base");
        assert_eq!(
            SimpleWhitespaceTokenCounter::new().encoding_name(),
            "whitespace"
        );
    }
}
