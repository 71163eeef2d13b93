//! Pipeline coordinator.
//!
//! [`ChainCoordinator`] owns the process-wide pipeline state (fingerprint,
//! chunks, index, retrieval handle) and decides, per request, whether the
//! current state can be reused or must be rebuilt.
//!
//! # Decision rule
//!
//! ```text
//! lock ─► scan + fingerprint corpus
//!           │
//!           ├─ state fingerprint == current && !force ─► return handle (fast path)
//!           │
//!           └─ otherwise ─► load corpus ─► ChunkCache ─► IndexCache
//!                             ─► replace state ─► unlock ─► return new handle
//! ```
//!
//! The whole decision and every construction step run under one
//! `tokio::sync::Mutex`. A caller arriving mid-rebuild waits, then takes the
//! fast path against the state the rebuild just installed, so concurrent
//! requests for one changed corpus cause exactly one rebuild.
//!
//! A changed fingerprint rebuilds the in-memory state, but the on-disk
//! caches only see the caller's explicit `force_rebuild`. They check the
//! fingerprint themselves, which is what lets a fresh process reuse the
//! chunks and index persisted by a previous one.
//!
//! A failed rebuild leaves the previous state in place. Handles are
//! immutable snapshots: replacing the state never affects a handle a caller
//! already holds.

use kb_harness_core::chunk::{Splitter, WindowSplitter};
use kb_harness_core::embedding::Embedder;
use kb_harness_core::index::{SearchMode, VectorIndex};
use kb_harness_core::models::Chunk;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chunk_cache::ChunkCache;
use crate::config::{Config, RetrievalConfig};
use crate::corpus::Corpus;
use crate::embedding::create_embedder;
use crate::error::PipelineError;
use crate::fingerprint::{fingerprint_corpus, fingerprint_loaded, Fingerprint};
use crate::index_cache::IndexCache;
use crate::llm::{create_model, LanguageModel};

/// Similarity-search settings carried by a handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrieverConfig {
    pub k: usize,
    pub mode: SearchMode,
}

impl RetrieverConfig {
    pub fn new(k: usize, mode: SearchMode) -> Self {
        Self { k, mode }
    }

    /// Plain similarity search returning `k` chunks.
    pub fn similarity(k: usize) -> Self {
        Self::new(k, SearchMode::Similarity)
    }

    /// Settings from the `[retrieval]` section, with optional per-request
    /// overrides of `k` and the mode name.
    pub fn from_settings(
        settings: &RetrievalConfig,
        k: Option<usize>,
        mode: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mode = match mode {
            Some(name) => settings.search_mode_named(name)?,
            None => settings.search_mode()?,
        };
        Ok(Self::new(k.unwrap_or(settings.k), mode))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineRequest {
    pub force_rebuild: bool,
    pub retriever: RetrieverConfig,
}

impl PipelineRequest {
    pub fn new(retriever: RetrieverConfig) -> Self {
        Self {
            force_rebuild: false,
            retriever,
        }
    }

    pub fn forced(retriever: RetrieverConfig) -> Self {
        Self {
            force_rebuild: true,
            retriever,
        }
    }
}

/// Everything needed to answer queries against one pipeline snapshot.
///
/// Cheap to clone. Never mutated after construction.
#[derive(Clone)]
pub struct RetrievalHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    fingerprint: Fingerprint,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn LanguageModel>,
    retriever: RetrieverConfig,
}

impl RetrievalHandle {
    pub fn new(
        fingerprint: Fingerprint,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
        retriever: RetrieverConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                fingerprint,
                index,
                embedder,
                model,
                retriever,
            }),
        }
    }

    /// A handle over the same index with different search settings.
    pub fn with_retriever(&self, retriever: RetrieverConfig) -> Self {
        Self::new(
            self.inner.fingerprint.clone(),
            self.inner.index.clone(),
            self.inner.embedder.clone(),
            self.inner.model.clone(),
            retriever,
        )
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.inner.fingerprint
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.inner.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.inner.embedder
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.inner.model
    }

    pub fn retriever(&self) -> RetrieverConfig {
        self.inner.retriever
    }
}

impl std::fmt::Debug for RetrievalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalHandle")
            .field("fingerprint", &self.inner.fingerprint.short())
            .field("vectors", &self.inner.index.len())
            .field("retriever", &self.inner.retriever)
            .finish()
    }
}

/// The current pipeline. Every field describes the same corpus snapshot.
struct PipelineState {
    fingerprint: Fingerprint,
    chunks: Arc<Vec<Chunk>>,
    handle: RetrievalHandle,
}

struct Inner {
    state: Option<PipelineState>,
    chunk_cache: ChunkCache,
    index_cache: IndexCache,
}

/// Point-in-time view of the coordinator, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub fingerprint: Option<String>,
    pub chunks: usize,
    pub vectors: usize,
    pub embedding_model: String,
    pub rebuilds: u64,
}

/// Components a coordinator is assembled from.
pub struct CoordinatorParts {
    pub splitter: Arc<dyn Splitter>,
    pub embedder: Arc<dyn Embedder>,
    pub model: Arc<dyn LanguageModel>,
}

pub struct ChainCoordinator {
    corpus_dir: PathBuf,
    include_globs: Vec<String>,
    model: Arc<dyn LanguageModel>,
    inner: Mutex<Inner>,
    rebuilds: AtomicU64,
}

impl ChainCoordinator {
    /// Build a coordinator with the splitter, embedder, and model the
    /// config names.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let splitter =
            WindowSplitter::new(config.chunking.chunk_size, config.chunking.overlap)?;
        let parts = CoordinatorParts {
            splitter: Arc::new(splitter),
            embedder: create_embedder(&config.embedding)?,
            model: create_model(&config.llm)?,
        };
        Ok(Self::with_parts(config, parts))
    }

    /// Build a coordinator from explicit components. Paths and batch size
    /// still come from `config`.
    pub fn with_parts(config: &Config, parts: CoordinatorParts) -> Self {
        let cache_dir = config.cache.dir.clone();
        Self {
            corpus_dir: config.corpus.dir.clone(),
            include_globs: config.corpus.include_globs.clone(),
            model: parts.model,
            inner: Mutex::new(Inner {
                state: None,
                chunk_cache: ChunkCache::new(&cache_dir, parts.splitter),
                index_cache: IndexCache::new(
                    &cache_dir,
                    parts.embedder,
                    config.embedding.batch_size,
                ),
            }),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Return a ready handle, rebuilding the pipeline first if the corpus
    /// changed or a rebuild is forced.
    ///
    /// # Errors
    ///
    /// [`PipelineError::InvalidRequest`] for `k == 0`; otherwise the error
    /// of whichever stage failed. On error the previous state is kept.
    pub async fn get_or_build(
        &self,
        request: PipelineRequest,
    ) -> Result<RetrievalHandle, PipelineError> {
        validate(&request)?;
        let mut guard = self.inner.lock().await;
        self.resolve(&mut guard, request).await
    }

    /// Drop the in-memory state and index memo. Persisted caches are kept
    /// and still validated by fingerprint on the next request.
    pub async fn invalidate(&self) {
        let mut guard = self.inner.lock().await;
        guard.state = None;
        guard.index_cache.clear_memo();
        tracing::info!("pipeline state invalidated");
    }

    /// Forced rebuild that bypasses the memo and both persisted caches.
    ///
    /// The current state is replaced only once the rebuild succeeds; on
    /// error it stays in place and keeps serving.
    pub async fn invalidate_and_rebuild(
        &self,
        retriever: RetrieverConfig,
    ) -> Result<RetrievalHandle, PipelineError> {
        let request = PipelineRequest::forced(retriever);
        validate(&request)?;
        let mut guard = self.inner.lock().await;
        self.resolve(&mut guard, request).await
    }

    pub async fn snapshot(&self) -> PipelineSnapshot {
        let guard = self.inner.lock().await;
        let embedding_model = guard.index_cache.embedder().model_name().to_string();
        match &guard.state {
            Some(state) => PipelineSnapshot {
                fingerprint: Some(state.fingerprint.to_string()),
                chunks: state.chunks.len(),
                vectors: state.handle.index().len(),
                embedding_model,
                rebuilds: self.rebuild_count(),
            },
            None => PipelineSnapshot {
                fingerprint: None,
                chunks: 0,
                vectors: 0,
                embedding_model,
                rebuilds: self.rebuild_count(),
            },
        }
    }

    /// Number of successful rebuilds since construction.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    async fn resolve(
        &self,
        inner: &mut Inner,
        request: PipelineRequest,
    ) -> Result<RetrievalHandle, PipelineError> {
        let (corpus, current) = self.scan().await?;

        if !request.force_rebuild {
            if let Some(state) = inner.state.as_ref().filter(|s| s.fingerprint == current) {
                tracing::debug!(fingerprint = current.short(), "pipeline up to date");
                if state.handle.retriever() == request.retriever {
                    return Ok(state.handle.clone());
                }
                return Ok(state.handle.with_retriever(request.retriever));
            }
        }

        let reason = if request.force_rebuild {
            "forced"
        } else if inner.state.is_none() {
            "cold start"
        } else {
            "corpus changed"
        };
        tracing::info!(
            reason,
            fingerprint = current.short(),
            documents = corpus.len(),
            "rebuilding pipeline"
        );

        let loaded = tokio::task::spawn_blocking(move || corpus.load())
            .await?
            .map_err(PipelineError::Corpus)?;
        // Stamp the state with the bytes actually read, not the earlier listing.
        let fingerprint = fingerprint_loaded(&loaded);
        let documents = loaded.documents();

        let chunks = inner
            .chunk_cache
            .get_chunks(&documents, &fingerprint, request.force_rebuild)
            .await;
        let index = inner
            .index_cache
            .get_index(&chunks, &fingerprint, request.force_rebuild)
            .await?;

        let handle = RetrievalHandle::new(
            fingerprint.clone(),
            index,
            inner.index_cache.embedder().clone(),
            self.model.clone(),
            request.retriever,
        );
        inner.state = Some(PipelineState {
            fingerprint,
            chunks: Arc::new(chunks),
            handle: handle.clone(),
        });
        let total = self.rebuilds.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            fingerprint = handle.fingerprint().short(),
            vectors = handle.index().len(),
            rebuilds = total,
            "pipeline ready"
        );
        Ok(handle)
    }

    async fn scan(&self) -> Result<(Corpus, Fingerprint), PipelineError> {
        let dir = self.corpus_dir.clone();
        let globs = self.include_globs.clone();
        tokio::task::spawn_blocking(move || {
            let corpus = Corpus::scan(&dir, &globs)?;
            let fingerprint = fingerprint_corpus(&corpus);
            Ok::<_, anyhow::Error>((corpus, fingerprint))
        })
        .await?
        .map_err(PipelineError::Corpus)
    }
}

fn validate(request: &PipelineRequest) -> Result<(), PipelineError> {
    if request.retriever.k == 0 {
        return Err(PipelineError::InvalidRequest(
            "retriever k must be >= 1".to_string(),
        ));
    }
    Ok(())
}
