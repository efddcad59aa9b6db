/*
 * File classification: decides whether a file can be included in the
 * aggregated artifact. The checks are ordered so that no content is read for
 * oversized files, and only a bounded prefix is read for everything else.
 *
 * Classification is advisory; a file that later fails to read in full is
 * handled at that point (see the aggregator and the token worker).
 */
use super::tree_index::Validity;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

/// Number of prefix bytes inspected when sniffing for binary content.
pub const BINARY_CHECK_CHUNK_SIZE: usize = 1024;

/*
 * Contract for file classification. Implementations must be cheap: a metadata
 * lookup plus at most one bounded read, never a full-file scan.
 */
pub trait FileClassifierOperations: Send + Sync {
    fn classify(&self, file_path: &Path, max_file_size_bytes: u64) -> Validity;
}

pub struct CoreFileClassifier {}

impl CoreFileClassifier {
    pub fn new() -> Self {
        CoreFileClassifier {}
    }
}

impl Default for CoreFileClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FileClassifierOperations for CoreFileClassifier {
    /*
     * Classifies a file as Includable, SkippedBinary, SkippedTooLarge, or
     * PermissionDenied.
     *
     * The size threshold is checked from metadata before any content read. A
     * file exactly at the threshold is still includable; one byte over is not.
     * The binary sniff reads a 1024-byte prefix and rejects content containing
     * a NUL byte or bytes that are not valid UTF-8. A prefix that ends inside
     * a multi-byte sequence is not treated as invalid.
     *
     * Unexpected read errors are conservatively mapped to SkippedBinary so a
     * single unreadable file never aborts a scan.
     */
    fn classify(&self, file_path: &Path, max_file_size_bytes: u64) -> Validity {
        let metadata = match file_path.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Validity::PermissionDenied;
            }
            Err(e) => {
                log::warn!("Classifier: Failed to stat {file_path:?}: {e}");
                return Validity::SkippedBinary;
            }
        };

        if !metadata.is_file() {
            log::warn!("Classifier: {file_path:?} is not a regular file.");
            return Validity::SkippedBinary;
        }

        if metadata.len() > max_file_size_bytes {
            return Validity::SkippedTooLarge;
        }

        let mut file = match File::open(file_path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Validity::PermissionDenied;
            }
            Err(e) => {
                log::warn!("Classifier: Failed to open {file_path:?}: {e}");
                return Validity::SkippedBinary;
            }
        };

        let mut chunk = [0u8; BINARY_CHECK_CHUNK_SIZE];
        let mut filled = 0;
        while filled < chunk.len() {
            match file.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    return Validity::PermissionDenied;
                }
                Err(e) => {
                    log::warn!("Classifier: Read error on {file_path:?}: {e}");
                    return Validity::SkippedBinary;
                }
            }
        }
        let prefix = &chunk[..filled];

        // Empty files are text.
        if prefix.is_empty() {
            return Validity::Includable;
        }

        if prefix.contains(&0u8) {
            return Validity::SkippedBinary;
        }

        match std::str::from_utf8(prefix) {
            Ok(_) => Validity::Includable,
            // `error_len() == None` means the prefix ends mid-sequence, which
            // only happens when the window is full and truncated the content.
            Err(e) if e.error_len().is_none() && filled == BINARY_CHECK_CHUNK_SIZE => {
                Validity::Includable
            }
            Err(_) => Validity::SkippedBinary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const LIMIT: u64 = 200 * 1024;

    fn classify(path: &Path) -> Validity {
        CoreFileClassifier::new().classify(path, LIMIT)
    }

    #[test]
    fn test_text_file_is_includable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "hello").unwrap();
        assert_eq!(classify(&path), Validity::Includable);
    }

    #[test]
    fn test_empty_file_is_includable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        fs::write(&path, "").unwrap();
        assert_eq!(classify(&path), Validity::Includable);
    }

    #[test]
    fn test_nul_byte_is_binary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.bin");
        fs::write(&path, b"he\x00llo").unwrap();
        assert_eq!(classify(&path), Validity::SkippedBinary);
    }

    #[test]
    fn test_invalid_utf8_is_binary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latin1.txt");
        // 0xFF is never valid in UTF-8.
        fs::write(&path, b"caf\xff").unwrap();
        assert_eq!(classify(&path), Validity::SkippedBinary);
    }

    #[test]
    fn test_multibyte_sequence_cut_at_window_edge_is_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cut.txt");
        // Fill up to one byte short of the window, then a 2-byte char that
        // straddles the boundary.
        let mut content = vec![b'a'; BINARY_CHECK_CHUNK_SIZE - 1];
        content.extend_from_slice("é".as_bytes());
        fs::write(&path, &content).unwrap();
        assert_eq!(classify(&path), Validity::Includable);
    }

    #[test]
    fn test_size_boundary() {
        let dir = tempdir().unwrap();

        let at_limit = dir.path().join("at_limit.txt");
        fs::write(&at_limit, vec![b'x'; 100]).unwrap();
        assert_eq!(
            CoreFileClassifier::new().classify(&at_limit, 100),
            Validity::Includable
        );

        let over_limit = dir.path().join("over_limit.txt");
        fs::write(&over_limit, vec![b'x'; 101]).unwrap();
        assert_eq!(
            CoreFileClassifier::new().classify(&over_limit, 100),
            Validity::SkippedTooLarge
        );
    }

    #[test]
    fn test_missing_file_is_binary_not_panic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vanished.txt");
        assert_eq!(classify(&path), Validity::SkippedBinary);
    }
}
