//! Fingerprint-keyed vector index cache.
//!
//! Turns a chunk list into a [`VectorIndex`] by embedding every chunk, and
//! avoids doing so whenever possible. Lookups go, cheapest first:
//!
//! 1. **Memo**: the last index built or loaded in this process, reused when
//!    both the fingerprint and the chunk list match. No I/O.
//! 2. **Disk**: the persisted artifact, if its sidecar hash matches.
//! 3. **Build**: embed all chunks in batches and insert them in order.
//!
//! # On-disk layout
//!
//! ```text
//! <cache_dir>/
//! ├── kb_index/
//! │   ├── index.json      schema_version, model, dims, chunks
//! │   └── vectors.bin     "KBV1" ‖ u32 dims ‖ u32 count ‖ count×dims f32 (LE)
//! └── kb_index.meta.json  { "hash": "<fingerprint>" }
//! ```
//!
//! The sidecar is removed before the artifact is rewritten and written back
//! last, so an interrupted write leaves no sidecar and the next load is a
//! miss. A persisted index is trusted only if the sidecar hash, schema
//! version, embedding model, dimensionality, and chunk list all match;
//! anything else (including unreadable or truncated files) is a miss.

use kb_harness_core::embedding::{blob_to_vec, vec_to_blob, Embedder};
use kb_harness_core::index::VectorIndex;
use kb_harness_core::models::Chunk;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PersistError, PipelineError};
use crate::fingerprint::Fingerprint;
use crate::persist;

pub const INDEX_DIR: &str = "kb_index";
pub const INDEX_SIDECAR_FILE: &str = "kb_index.meta.json";
const MANIFEST_FILE: &str = "index.json";
const VECTORS_FILE: &str = "vectors.bin";
const INDEX_SCHEMA_VERSION: u32 = 1;
const VECTORS_MAGIC: &[u8; 4] = b"KBV1";
const VECTORS_HEADER_LEN: usize = 12;

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    hash: Fingerprint,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexManifest {
    schema_version: u32,
    model: String,
    dims: usize,
    chunks: Vec<Chunk>,
}

pub struct IndexCache {
    dir: PathBuf,
    sidecar: PathBuf,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    memo: Option<(Fingerprint, Arc<VectorIndex>)>,
}

impl IndexCache {
    pub fn new(cache_dir: &Path, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            dir: cache_dir.join(INDEX_DIR),
            sidecar: cache_dir.join(INDEX_SIDECAR_FILE),
            embedder,
            batch_size: batch_size.max(1),
            memo: None,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Fingerprint of the index held in memory, if any.
    pub fn memo_fingerprint(&self) -> Option<&Fingerprint> {
        self.memo.as_ref().map(|(fp, _)| fp)
    }

    /// Forget the in-memory index. The persisted artifact is left alone.
    pub fn clear_memo(&mut self) {
        self.memo = None;
    }

    /// Return an index over `chunks`, whose corpus fingerprint is
    /// `fingerprint`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Embedding`] when the embedder fails or returns the
    /// wrong number of vectors, [`PipelineError::Index`] when a vector has
    /// the wrong dimensionality. Persistence failures are logged only.
    pub async fn get_index(
        &mut self,
        chunks: &[Chunk],
        fingerprint: &Fingerprint,
        force_rebuild: bool,
    ) -> Result<Arc<VectorIndex>, PipelineError> {
        if !force_rebuild {
            if let Some((memo_fp, index)) = &self.memo {
                if memo_fp == fingerprint && index.chunks() == chunks {
                    tracing::debug!(fingerprint = fingerprint.short(), "index memo hit");
                    return Ok(index.clone());
                }
            }

            if let Some(index) = self.load(chunks, fingerprint).await {
                tracing::debug!(
                    fingerprint = fingerprint.short(),
                    vectors = index.len(),
                    "index loaded from disk"
                );
                let index = Arc::new(index);
                self.memo = Some((fingerprint.clone(), index.clone()));
                return Ok(index);
            }
        }

        let index = Arc::new(self.build(chunks).await?);
        tracing::info!(
            fingerprint = fingerprint.short(),
            vectors = index.len(),
            model = index.model(),
            forced = force_rebuild,
            "built vector index"
        );

        if let Err(e) = self.persist(&index, fingerprint).await {
            tracing::warn!(error = %e, "failed to persist index; continuing with in-memory index");
        }
        self.memo = Some((fingerprint.clone(), index.clone()));
        Ok(index)
    }

    async fn build(&self, chunks: &[Chunk]) -> Result<VectorIndex, PipelineError> {
        let mut index = VectorIndex::new(self.embedder.model_name(), self.embedder.dims());
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

        for (batch_no, (batch_texts, batch_chunks)) in texts
            .chunks(self.batch_size)
            .zip(chunks.chunks(self.batch_size))
            .enumerate()
        {
            let vectors = self
                .embedder
                .embed(batch_texts)
                .await
                .map_err(PipelineError::Embedding)?;
            if vectors.len() != batch_texts.len() {
                return Err(PipelineError::Embedding(anyhow::anyhow!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch_texts.len()
                )));
            }
            for (chunk, vector) in batch_chunks.iter().zip(vectors) {
                index
                    .insert(chunk.clone(), vector)
                    .map_err(PipelineError::Index)?;
            }
            tracing::debug!(batch = batch_no, size = batch_texts.len(), "embedded batch");
        }
        Ok(index)
    }

    async fn load(&self, chunks: &[Chunk], fingerprint: &Fingerprint) -> Option<VectorIndex> {
        let sidecar: Sidecar = match tokio::fs::read(&self.sidecar).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(sidecar) => sidecar,
                Err(e) => {
                    tracing::warn!(error = %e, "corrupt index sidecar; ignoring persisted index");
                    return None;
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "no index sidecar");
                return None;
            }
        };
        if &sidecar.hash != fingerprint {
            tracing::debug!(
                stored = sidecar.hash.short(),
                current = fingerprint.short(),
                "persisted index stale"
            );
            return None;
        }

        match self.read_artifact(chunks).await {
            Ok(index) => Some(index),
            Err(reason) => {
                tracing::warn!(reason = %reason, "persisted index unusable; rebuilding");
                None
            }
        }
    }

    async fn read_artifact(&self, chunks: &[Chunk]) -> Result<VectorIndex, String> {
        let manifest_bytes = tokio::fs::read(self.dir.join(MANIFEST_FILE))
            .await
            .map_err(|e| format!("reading {}: {}", MANIFEST_FILE, e))?;
        let manifest: IndexManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| format!("parsing {}: {}", MANIFEST_FILE, e))?;

        if manifest.schema_version != INDEX_SCHEMA_VERSION {
            return Err(format!(
                "schema version {} (expected {})",
                manifest.schema_version, INDEX_SCHEMA_VERSION
            ));
        }
        if manifest.model != self.embedder.model_name() || manifest.dims != self.embedder.dims() {
            return Err(format!(
                "built by {} ({} dims), current embedder is {} ({} dims)",
                manifest.model,
                manifest.dims,
                self.embedder.model_name(),
                self.embedder.dims()
            ));
        }
        if manifest.chunks != chunks {
            return Err("chunk list differs from the current chunks".to_string());
        }

        let blob = tokio::fs::read(self.dir.join(VECTORS_FILE))
            .await
            .map_err(|e| format!("reading {}: {}", VECTORS_FILE, e))?;
        let vectors = decode_vectors(&blob, manifest.dims)?;
        if vectors.len() != manifest.chunks.len() {
            return Err(format!(
                "{} vectors for {} chunks",
                vectors.len(),
                manifest.chunks.len()
            ));
        }

        let mut index = VectorIndex::new(manifest.model, manifest.dims);
        for (chunk, vector) in manifest.chunks.into_iter().zip(vectors) {
            index.insert(chunk, vector).map_err(|e| e.to_string())?;
        }
        Ok(index)
    }

    async fn persist(&self, index: &VectorIndex, fingerprint: &Fingerprint) -> Result<(), PersistError> {
        persist::remove_if_exists(&self.sidecar).await?;

        let manifest = IndexManifest {
            schema_version: INDEX_SCHEMA_VERSION,
            model: index.model().to_string(),
            dims: index.dims(),
            chunks: index.chunks().to_vec(),
        };
        persist::write_json_atomic(&self.dir.join(MANIFEST_FILE), "index manifest", &manifest)
            .await?;
        persist::write_atomic(
            &self.dir.join(VECTORS_FILE),
            &encode_vectors(index.dims(), index.vectors()),
        )
        .await?;

        persist::write_json_atomic(
            &self.sidecar,
            "index sidecar",
            &Sidecar {
                hash: fingerprint.clone(),
            },
        )
        .await
    }
}

/// Hash recorded in the index sidecar, if one is readable.
pub async fn stored_fingerprint(cache_dir: &Path) -> Option<Fingerprint> {
    let bytes = tokio::fs::read(cache_dir.join(INDEX_SIDECAR_FILE)).await.ok()?;
    serde_json::from_slice::<Sidecar>(&bytes)
        .ok()
        .map(|sidecar| sidecar.hash)
}

fn encode_vectors(dims: usize, vectors: &[Vec<f32>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(VECTORS_HEADER_LEN + vectors.len() * dims * 4);
    out.extend_from_slice(VECTORS_MAGIC);
    out.extend_from_slice(&(dims as u32).to_le_bytes());
    out.extend_from_slice(&(vectors.len() as u32).to_le_bytes());
    for v in vectors {
        out.extend_from_slice(&vec_to_blob(v));
    }
    out
}

fn decode_vectors(blob: &[u8], dims: usize) -> Result<Vec<Vec<f32>>, String> {
    if blob.len() < VECTORS_HEADER_LEN || &blob[..4] != VECTORS_MAGIC {
        return Err("bad vectors.bin header".to_string());
    }
    let stored_dims = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
    let count = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]) as usize;
    if stored_dims != dims {
        return Err(format!("vectors.bin has {} dims, manifest {}", stored_dims, dims));
    }
    let body = &blob[VECTORS_HEADER_LEN..];
    if body.len() != count * dims * 4 {
        return Err(format!(
            "vectors.bin body is {} bytes, expected {}",
            body.len(),
            count * dims * 4
        ));
    }
    if dims == 0 {
        return Ok(vec![Vec::new(); count]);
    }
    Ok(body.chunks_exact(dims * 4).map(blob_to_vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Two-dimensional embedder: (length, vowel count), counting calls.
    struct CountingEmbedder {
        model: &'static str,
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new(model: &'static str) -> Arc<Self> {
            Arc::new(Self {
                model,
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            self.model
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count();
                    vec![t.len() as f32, vowels as f32 + 1.0]
                })
                .collect())
        }
    }

    fn chunks() -> Vec<Chunk> {
        ["alpha", "bravo", "charlie"]
            .iter()
            .enumerate()
            .map(|(i, s)| Chunk {
                content: s.to_string(),
                source: "a.txt".to_string(),
                sequence_index: i,
            })
            .collect()
    }

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from(s.to_string())
    }

    #[tokio::test]
    async fn test_build_batches_and_memo() {
        let tmp = TempDir::new().unwrap();
        let embedder = CountingEmbedder::new("counting");
        let mut cache = IndexCache::new(tmp.path(), embedder.clone(), 2);

        let index = cache.get_index(&chunks(), &fp("h1"), false).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), 3);

        let again = cache.get_index(&chunks(), &fp("h1"), false).await.unwrap();
        assert!(Arc::ptr_eq(&index, &again));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_memo_requires_matching_chunks() {
        let tmp = TempDir::new().unwrap();
        let embedder = CountingEmbedder::new("counting");
        let mut cache = IndexCache::new(tmp.path(), embedder.clone(), 16);
        cache.get_index(&chunks(), &fp("h1"), false).await.unwrap();

        // Same fingerprint and count, different content (e.g. new chunk params).
        let mut resplit = chunks();
        resplit[2].content = "delta".to_string();
        let index = cache.get_index(&resplit, &fp("h1"), false).await.unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(index.chunks(), resplit.as_slice());
    }

    #[tokio::test]
    async fn test_cold_load_from_disk_skips_embedding() {
        let tmp = TempDir::new().unwrap();
        let first = CountingEmbedder::new("counting");
        let built = IndexCache::new(tmp.path(), first.clone(), 16)
            .get_index(&chunks(), &fp("h1"), false)
            .await
            .unwrap();
        assert!(tmp.path().join(INDEX_SIDECAR_FILE).exists());

        let second = CountingEmbedder::new("counting");
        let loaded = IndexCache::new(tmp.path(), second.clone(), 16)
            .get_index(&chunks(), &fp("h1"), false)
            .await
            .unwrap();
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert_eq!(loaded.chunks(), built.chunks());
        assert_eq!(loaded.vectors(), built.vectors());
    }

    #[tokio::test]
    async fn test_sidecar_mismatch_rebuilds() {
        let tmp = TempDir::new().unwrap();
        IndexCache::new(tmp.path(), CountingEmbedder::new("counting"), 16)
            .get_index(&chunks(), &fp("h1"), false)
            .await
            .unwrap();

        let embedder = CountingEmbedder::new("counting");
        IndexCache::new(tmp.path(), embedder.clone(), 16)
            .get_index(&chunks(), &fp("h2"), false)
            .await
            .unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let raw: serde_json::Value = serde_json::from_slice(
            &std::fs::read(tmp.path().join(INDEX_SIDECAR_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["hash"], "h2");
    }

    #[tokio::test]
    async fn test_model_change_rebuilds() {
        let tmp = TempDir::new().unwrap();
        IndexCache::new(tmp.path(), CountingEmbedder::new("model-a"), 16)
            .get_index(&chunks(), &fp("h1"), false)
            .await
            .unwrap();

        let embedder = CountingEmbedder::new("model-b");
        let index = IndexCache::new(tmp.path(), embedder.clone(), 16)
            .get_index(&chunks(), &fp("h1"), false)
            .await
            .unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(index.model(), "model-b");
    }

    #[tokio::test]
    async fn test_truncated_vectors_is_miss() {
        let tmp = TempDir::new().unwrap();
        IndexCache::new(tmp.path(), CountingEmbedder::new("counting"), 16)
            .get_index(&chunks(), &fp("h1"), false)
            .await
            .unwrap();
        let vectors = tmp.path().join(INDEX_DIR).join(VECTORS_FILE);
        let bytes = std::fs::read(&vectors).unwrap();
        std::fs::write(&vectors, &bytes[..bytes.len() - 3]).unwrap();

        let embedder = CountingEmbedder::new("counting");
        let index = IndexCache::new(tmp.path(), embedder.clone(), 16)
            .get_index(&chunks(), &fp("h1"), false)
            .await
            .unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn test_force_bypasses_memo() {
        let tmp = TempDir::new().unwrap();
        let embedder = CountingEmbedder::new("counting");
        let mut cache = IndexCache::new(tmp.path(), embedder.clone(), 16);
        cache.get_index(&chunks(), &fp("h1"), false).await.unwrap();
        cache.get_index(&chunks(), &fp("h1"), true).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_chunk_list_needs_no_embedding() {
        let tmp = TempDir::new().unwrap();
        let embedder = CountingEmbedder::new("counting");
        let mut cache = IndexCache::new(tmp.path(), embedder.clone(), 16);
        let index = cache.get_index(&[], &fp("empty"), false).await.unwrap();
        assert!(index.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_vectors_header_checked() {
        let blob = encode_vectors(2, &[vec![1.0, 2.0]]);
        assert_eq!(&blob[..4], b"KBV1");
        assert_eq!(decode_vectors(&blob, 2).unwrap(), vec![vec![1.0, 2.0]]);
        assert!(decode_vectors(&blob, 3).is_err());
        assert!(decode_vectors(b"NOPE", 2).is_err());
    }
}
