//! Fingerprint-keyed chunk cache.
//!
//! Wraps a [`Splitter`] with a single persisted record at
//! `<cache_dir>/kb_splits.json`:
//!
//! ```json
//! { "hash": "<fingerprint>",
//!   "splits": [ { "content": "...", "metadata": { "source": "a.txt" } } ] }
//! ```
//!
//! A record is trusted only when its `hash` equals the requested
//! fingerprint. A missing, unreadable, or mismatched record is a miss; the
//! documents are split again and the record is overwritten. Writing the
//! record is best-effort.
//!
//! The record does not carry `sequence_index`; it is recovered on load by
//! counting chunks per source in record order.
//!
//! The splitter parameters are not part of the key. Changing `chunk_size`
//! or `overlap` on an unchanged corpus requires a forced rebuild.

use kb_harness_core::chunk::Splitter;
use kb_harness_core::models::{Chunk, Document};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::fingerprint::Fingerprint;
use crate::persist;

pub const CHUNK_CACHE_FILE: &str = "kb_splits.json";

#[derive(Debug, Serialize, Deserialize)]
struct ChunkCacheRecord {
    hash: Fingerprint,
    splits: Vec<SplitRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SplitRecord {
    content: String,
    metadata: SplitMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct SplitMetadata {
    source: String,
}

pub struct ChunkCache {
    path: PathBuf,
    splitter: Arc<dyn Splitter>,
}

impl ChunkCache {
    pub fn new(cache_dir: &Path, splitter: Arc<dyn Splitter>) -> Self {
        Self {
            path: cache_dir.join(CHUNK_CACHE_FILE),
            splitter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the chunks for `documents`, whose corpus fingerprint is
    /// `fingerprint`.
    ///
    /// Without `force_rebuild`, a persisted record with a matching hash is
    /// returned as-is and the splitter is not called.
    pub async fn get_chunks(
        &self,
        documents: &[Document],
        fingerprint: &Fingerprint,
        force_rebuild: bool,
    ) -> Vec<Chunk> {
        if !force_rebuild {
            if let Some(chunks) = self.load(fingerprint).await {
                tracing::debug!(
                    fingerprint = fingerprint.short(),
                    chunks = chunks.len(),
                    "chunk cache hit"
                );
                return chunks;
            }
        }

        let chunks = self.splitter.split(documents);
        tracing::info!(
            fingerprint = fingerprint.short(),
            documents = documents.len(),
            chunks = chunks.len(),
            forced = force_rebuild,
            "split corpus into chunks"
        );

        if let Err(e) = self.persist(fingerprint, &chunks).await {
            tracing::warn!(error = %e, "failed to persist chunk cache; continuing with in-memory chunks");
        }
        chunks
    }

    async fn load(&self, fingerprint: &Fingerprint) -> Option<Vec<Chunk>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no chunk cache record");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable chunk cache; ignoring");
                return None;
            }
        };

        let record: ChunkCacheRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "corrupt chunk cache; ignoring");
                return None;
            }
        };

        if &record.hash != fingerprint {
            tracing::debug!(
                stored = record.hash.short(),
                current = fingerprint.short(),
                "chunk cache stale"
            );
            return None;
        }

        Some(renumber(record.splits))
    }

    async fn persist(
        &self,
        fingerprint: &Fingerprint,
        chunks: &[Chunk],
    ) -> Result<(), crate::error::PersistError> {
        let record = ChunkCacheRecord {
            hash: fingerprint.clone(),
            splits: chunks
                .iter()
                .map(|c| SplitRecord {
                    content: c.content.clone(),
                    metadata: SplitMetadata {
                        source: c.source.clone(),
                    },
                })
                .collect(),
        };
        persist::write_json_atomic(&self.path, "chunk cache", &record).await
    }
}

/// Fingerprint recorded in the persisted chunk record, if one is readable.
pub async fn stored_fingerprint(cache_dir: &Path) -> Option<Fingerprint> {
    let bytes = tokio::fs::read(cache_dir.join(CHUNK_CACHE_FILE)).await.ok()?;
    serde_json::from_slice::<ChunkCacheRecord>(&bytes)
        .ok()
        .map(|record| record.hash)
}

fn renumber(splits: Vec<SplitRecord>) -> Vec<Chunk> {
    let mut next: HashMap<String, usize> = HashMap::new();
    splits
        .into_iter()
        .map(|s| {
            let seq = next.entry(s.metadata.source.clone()).or_insert(0);
            let chunk = Chunk {
                content: s.content,
                source: s.metadata.source,
                sequence_index: *seq,
            };
            *seq += 1;
            chunk
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_harness_core::chunk::WindowSplitter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingSplitter {
        inner: WindowSplitter,
        calls: AtomicUsize,
    }

    impl Splitter for CountingSplitter {
        fn split(&self, documents: &[Document]) -> Vec<Chunk> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.split(documents)
        }
    }

    fn counting() -> Arc<CountingSplitter> {
        Arc::new(CountingSplitter {
            inner: WindowSplitter::new(5, 2).unwrap(),
            calls: AtomicUsize::new(0),
        })
    }

    fn docs() -> Vec<Document> {
        vec![
            Document::new("a.txt", "abcdefghij"),
            Document::new("b.txt", "xyz"),
        ]
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from(s.to_string())
    }

    #[tokio::test]
    async fn test_miss_then_hit_skips_splitter() {
        let tmp = TempDir::new().unwrap();
        let splitter = counting();
        let cache = ChunkCache::new(tmp.path(), splitter.clone());

        let first = cache.get_chunks(&docs(), &fp("h1"), false).await;
        assert_eq!(splitter.calls.load(Ordering::SeqCst), 1);
        let contents: Vec<&str> = first.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["abcde", "defgh", "ghij", "xyz"]);

        let second = cache.get_chunks(&docs(), &fp("h1"), false).await;
        assert_eq!(splitter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(stored_fingerprint(tmp.path()).await, Some(fp("h1")));
    }

    #[tokio::test]
    async fn test_persisted_record_wire_shape() {
        let tmp = TempDir::new().unwrap();
        let cache = ChunkCache::new(tmp.path(), counting());
        cache.get_chunks(&docs(), &fp("h1"), false).await;

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join(CHUNK_CACHE_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["hash"], "h1");
        assert_eq!(raw["splits"][0]["content"], "abcde");
        assert_eq!(raw["splits"][0]["metadata"]["source"], "a.txt");
        assert!(raw["splits"][0].get("sequence_index").is_none());
    }

    #[tokio::test]
    async fn test_sequence_index_recovered_on_load() {
        let tmp = TempDir::new().unwrap();
        let splitter = counting();
        let cache = ChunkCache::new(tmp.path(), splitter.clone());
        let built = cache.get_chunks(&docs(), &fp("h1"), false).await;

        // A fresh cache object has no in-memory state; it must read the file.
        let reloaded = ChunkCache::new(tmp.path(), splitter.clone())
            .get_chunks(&docs(), &fp("h1"), false)
            .await;
        assert_eq!(splitter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(reloaded, built);
        assert_eq!(reloaded[2].sequence_index, 2);
        assert_eq!(reloaded[3].sequence_index, 0);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_miss() {
        let tmp = TempDir::new().unwrap();
        let splitter = counting();
        let cache = ChunkCache::new(tmp.path(), splitter.clone());
        cache.get_chunks(&docs(), &fp("h1"), false).await;
        cache.get_chunks(&docs(), &fp("h2"), false).await;
        assert_eq!(splitter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_force_rebuild_resplits() {
        let tmp = TempDir::new().unwrap();
        let splitter = counting();
        let cache = ChunkCache::new(tmp.path(), splitter.clone());
        cache.get_chunks(&docs(), &fp("h1"), false).await;
        cache.get_chunks(&docs(), &fp("h1"), true).await;
        assert_eq!(splitter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_miss() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CHUNK_CACHE_FILE), "{not json").unwrap();
        let splitter = counting();
        let cache = ChunkCache::new(tmp.path(), splitter.clone());
        let chunks = cache.get_chunks(&docs(), &fp("h1"), false).await;
        assert_eq!(chunks.len(), 4);
        assert_eq!(splitter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_still_returns_chunks() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "not a dir").unwrap();
        let cache = ChunkCache::new(&blocker, counting());
        let chunks = cache.get_chunks(&docs(), &fp("h1"), false).await;
        assert_eq!(chunks.len(), 4);
    }
}
