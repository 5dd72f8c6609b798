// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Script hashing for cache invalidation.
//!
//! The sync cache records a hash of the processing scripts that produced
//! it. When any of those files change, the hash changes, and
//! [`determine_sync_mode`](crate::SyncMetadataStore::determine_sync_mode)
//! discards the cache: outputs produced by old logic cannot be trusted.

use std::io::Read;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to hash {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Hex sha256 over the contents of `paths`, visited in sorted order so
/// the result is independent of the caller's ordering. A missing file
/// is an error; silently skipping one would mask a logic change.
pub fn hash_script_files(paths: &[PathBuf]) -> Result<String, HashError> {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    for path in sorted {
        // Path names participate so a rename also changes the hash
        hasher.update(path.to_string_lossy().as_bytes());
        let mut file = std::fs::File::open(path).map_err(|source| HashError::Io {
            path: path.display().to_string(),
            source,
        })?;
        loop {
            let n = file.read(&mut buf).map_err(|source| HashError::Io {
                path: path.display().to_string(),
                source,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.rs");
        let b = dir.path().join("b.rs");
        std::fs::write(&a, "fn a() {}").unwrap();
        std::fs::write(&b, "fn b() {}").unwrap();

        let forward = hash_script_files(&[a.clone(), b.clone()]).unwrap();
        let reverse = hash_script_files(&[b, a]).unwrap();
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.rs");

        std::fs::write(&a, "fn a() {}").unwrap();
        let before = hash_script_files(std::slice::from_ref(&a)).unwrap();

        std::fs::write(&a, "fn a() { /* changed */ }").unwrap();
        let after = hash_script_files(std::slice::from_ref(&a)).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = hash_script_files(&[PathBuf::from("/definitely/not/here.rs")]);
        assert!(matches!(result, Err(HashError::Io { .. })));
    }
}
