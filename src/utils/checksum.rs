use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::DownloadError;

/// SHA-256 computed chunk by chunk while a transfer streams in
#[derive(Clone, Default)]
pub struct StreamingHasher {
    hasher: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compare a finished digest against the expected one, case-insensitively
pub fn check_digest(actual: &str, expected: &str) -> Result<(), DownloadError> {
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(DownloadError::Checksum {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

pub fn verify_file(file_path: &Path, expected_hash: &str) -> Result<(), DownloadError> {
    let mut file = File::open(file_path)?;
    let mut hasher = StreamingHasher::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    check_digest(&hasher.finalize_hex(), expected_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn chunked_digest_matches_whole() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"a");
        hasher.update(b"bc");
        assert_eq!(hasher.finalize_hex(), ABC);
    }

    #[test]
    fn verify_file_accepts_uppercase_and_rejects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.bin");
        std::fs::write(&path, b"abc").unwrap();

        assert!(verify_file(&path, &ABC.to_uppercase()).is_ok());
        match verify_file(&path, "00") {
            Err(DownloadError::Checksum { actual, .. }) => assert_eq!(actual, ABC),
            other => panic!("unexpected {other:?}"),
        }
    }
}
