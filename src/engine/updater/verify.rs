//! Integrity Verification
//!
//! SHA-256 content digests rendered as lowercase hex.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Computes and compares content digests
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Digest of an in-memory buffer
    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Digest of a file, streamed in fixed-size blocks
    pub fn digest_file(path: &Path) -> io::Result<String> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();

        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Exact, case-sensitive comparison of a declared and a computed digest
    pub fn matches(declared: &str, computed: &str) -> bool {
        declared == computed
    }
}
