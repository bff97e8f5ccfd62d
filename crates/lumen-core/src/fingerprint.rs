//! Content fingerprinting for prompts, images, and parameter tuples.
//!
//! Every cache key in the pipeline is a SHA-256 digest. Image fingerprints
//! cover only the leading 1 MiB of the file: generated images differ in
//! their first bytes, and a bounded read keeps hashing cheap and immune to
//! trailing metadata edits.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::error::PipelineResult;
use crate::types::Fingerprint;

/// Number of leading bytes hashed for an image fingerprint.
pub const IMAGE_HASH_PREFIX_BYTES: u64 = 1024 * 1024;

/// SHA-256 of arbitrary bytes.
pub fn sha256(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(hasher.finalize().into())
}

/// Fingerprint of a single text, used as the cache key for one content kind.
pub fn text_fingerprint(text: &str) -> Fingerprint {
    sha256(text.as_bytes())
}

/// Fingerprint of a prompt pair: `UTF-8(prompt) || 0x7C || UTF-8(negative)`.
pub fn prompt_fingerprint(prompt: &str, negative_prompt: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0x7C]);
    hasher.update(negative_prompt.as_bytes());
    Fingerprint(hasher.finalize().into())
}

/// Fingerprint of the first 1 MiB of a file (the whole file if smaller).
///
/// Reads exactly `min(1 MiB, file length)` bytes. Two files agreeing on
/// their first 1 MiB collide by construction; acceptable for generated
/// images whose headers are unique per render.
pub fn image_fingerprint(path: &Path) -> PipelineResult<Fingerprint> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file).take(IMAGE_HASH_PREFIX_BYTES);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 65536];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(Fingerprint(hasher.finalize().into()))
}

/// Memoized image fingerprints keyed by path.
///
/// A process-wide resource owned by the orchestrator for its lifetime and
/// cleared on shutdown. Entries are invalidated when the file's size or
/// modification time changes.
pub struct HashCache {
    entries: Mutex<HashMap<PathBuf, CachedHash>>,
}

struct CachedHash {
    file_size: u64,
    modified: Option<SystemTime>,
    fingerprint: Fingerprint,
}

impl HashCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fingerprint `path`, reusing the memoized digest while the file is
    /// unchanged on disk.
    pub fn image_fingerprint(&self, path: &Path) -> PipelineResult<Fingerprint> {
        let meta = std::fs::metadata(path)?;
        let file_size = meta.len();
        let modified = meta.modified().ok();

        {
            let entries = self.entries.lock().expect("hash cache lock poisoned");
            if let Some(cached) = entries.get(path) {
                if cached.file_size == file_size && cached.modified == modified {
                    return Ok(cached.fingerprint);
                }
            }
        }

        let fingerprint = image_fingerprint(path)?;
        let mut entries = self.entries.lock().expect("hash cache lock poisoned");
        entries.insert(
            path.to_path_buf(),
            CachedHash {
                file_size,
                modified,
                fingerprint,
            },
        );
        Ok(fingerprint)
    }

    /// Number of memoized paths.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("hash cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all memoized digests.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("hash cache lock poisoned")
            .clear();
    }
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new()
    }
}
