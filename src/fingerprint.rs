//! Corpus fingerprinting.
//!
//! A [`Fingerprint`] is a SHA-256 hex digest over, for each artifact in name
//! order:
//!
//! ```text
//! name bytes ‖ mtime (ns since epoch, decimal) ‖ first 16 KiB of content
//! ```
//!
//! Only the head of each file is read. Bytes past
//! [`FINGERPRINT_HEAD_BYTES`] do not contribute, so an edit that lands
//! entirely beyond the head *and* preserves the mtime goes unnoticed. Any
//! ordinary write bumps the mtime, which is why this is acceptable in
//! practice. The boundary is pinned by a test.
//!
//! The same digest is computed from a directory listing (reading heads from
//! disk) and from a [`LoadedCorpus`] snapshot (slicing the bytes already in
//! memory). When nothing changed in between, both agree.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::time::SystemTime;

use crate::corpus::{Corpus, LoadedCorpus};

/// Number of leading bytes of each artifact that feed the digest.
pub const FINGERPRINT_HEAD_BYTES: usize = 16 * 1024;

/// Opaque corpus digest (64 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a corpus with no artifacts (SHA-256 of nothing).
    pub fn empty() -> Self {
        digest_entries(std::iter::empty::<(&str, SystemTime, &[u8])>())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Fingerprint(s)
    }
}

/// Fingerprint a directory listing, reading each file's head from disk.
///
/// Files that cannot be opened contribute their name and mtime only.
pub fn fingerprint_corpus(corpus: &Corpus) -> Fingerprint {
    let heads: Vec<(&str, SystemTime, Vec<u8>)> = corpus
        .artifacts()
        .iter()
        .map(|a| (a.name.as_str(), a.modified, read_head(&a.path)))
        .collect();
    digest_entries(
        heads
            .iter()
            .map(|(name, modified, head)| (*name, *modified, head.as_slice())),
    )
}

/// Fingerprint a loaded snapshot from the bytes already in memory.
pub fn fingerprint_loaded(corpus: &LoadedCorpus) -> Fingerprint {
    digest_entries(corpus.artifacts().iter().map(|a| {
        let head = &a.bytes[..a.bytes.len().min(FINGERPRINT_HEAD_BYTES)];
        (a.name.as_str(), a.modified, head)
    }))
}

fn digest_entries<'a>(entries: impl Iterator<Item = (&'a str, SystemTime, &'a [u8])>) -> Fingerprint {
    let mut hasher = Sha256::new();
    for (name, modified, head) in entries {
        hasher.update(name.as_bytes());
        hasher.update(mtime_nanos(modified).to_string().as_bytes());
        hasher.update(head);
    }
    Fingerprint(hex::encode(hasher.finalize()))
}

fn mtime_nanos(t: SystemTime) -> u128 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn read_head(path: &std::path::Path) -> Vec<u8> {
    let mut head = Vec::new();
    match std::fs::File::open(path) {
        Ok(file) => {
            if let Err(e) = file.take(FINGERPRINT_HEAD_BYTES as u64).read_to_end(&mut head) {
                tracing::debug!(path = %path.display(), error = %e, "head read failed");
                head.clear();
            }
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unreadable corpus file");
        }
    }
    head
}
