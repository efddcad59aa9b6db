/*
 * Utility functions for calculating SHA256 checksums. Checksums are used to
 * detect file content changes without re-tokenizing unchanged files, and to
 * verify the integrity of persisted workspace data.
 */
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/*
 * Calculates the SHA256 checksum of a file and returns it as a hex-encoded string.
 * Reads the file in chunks so large files do not need to be held in memory.
 * Returns an `io::Error` if the path does not point to a regular file or a read fails.
 */
pub fn file_sha256(file_path: &Path) -> io::Result<String> {
    if !file_path.is_file() {
        let err_msg = format!("Path {file_path:?} is not a file, cannot calculate checksum.");
        log::warn!("ChecksumUtils: {err_msg}");
        return Err(io::Error::new(io::ErrorKind::InvalidInput, err_msg));
    }

    let file = File::open(file_path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0; 1024 * 4];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex-encoded SHA256 of an in-memory byte buffer. Used for the integrity
/// field of persisted workspace files.
pub fn bytes_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
