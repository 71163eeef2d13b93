//! TOML configuration.
//!
//! Every section except `[corpus]` is optional and falls back to the
//! defaults below. A minimal file looks like:
//!
//! ```toml
//! [corpus]
//! dir = "junit_kb"
//! ```

use anyhow::{bail, Context, Result};
use kb_harness_core::index::SearchMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    pub dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".kb-cache")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1200
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_search_mode")]
    pub search_mode: String,
    #[serde(default = "default_fetch_k")]
    pub fetch_k: usize,
    #[serde(default = "default_lambda_mult")]
    pub lambda_mult: f32,
    #[serde(default)]
    pub score_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            search_mode: default_search_mode(),
            fetch_k: default_fetch_k(),
            lambda_mult: default_lambda_mult(),
            score_threshold: 0.0,
        }
    }
}

fn default_k() -> usize {
    2
}
fn default_search_mode() -> String {
    "similarity".to_string()
}
fn default_fetch_k() -> usize {
    20
}
fn default_lambda_mult() -> f32 {
    0.5
}

impl RetrievalConfig {
    /// Resolve a mode name into a [`SearchMode`], taking the tuning knobs
    /// (`fetch_k`, `lambda_mult`, `score_threshold`) from this section.
    pub fn search_mode_named(&self, name: &str) -> Result<SearchMode> {
        match name {
            "similarity" => Ok(SearchMode::Similarity),
            "mmr" => Ok(SearchMode::Mmr {
                fetch_k: self.fetch_k,
                lambda: self.lambda_mult,
            }),
            "similarity_score_threshold" => Ok(SearchMode::ScoreThreshold {
                threshold: self.score_threshold,
            }),
            other => bail!(
                "Unknown search mode: '{}'. Must be similarity, mmr, or similarity_score_threshold.",
                other
            ),
        }
    }

    /// The configured default mode.
    pub fn search_mode(&self) -> Result<SearchMode> {
        self.search_mode_named(&self.search_mode)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: None,
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "ollama".to_string()
}
fn default_llm_model() -> String {
    "codellama".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_llm_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// A config pointing at `corpus_dir` with every other setting defaulted.
    pub fn for_corpus(corpus_dir: impl Into<PathBuf>) -> Self {
        Self {
            corpus: CorpusConfig {
                dir: corpus_dir.into(),
                include_globs: default_include_globs(),
            },
            cache: CacheConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            bail!("chunking.overlap must be smaller than chunking.chunk_size");
        }

        if self.retrieval.k < 1 {
            bail!("retrieval.k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.lambda_mult) {
            bail!("retrieval.lambda_mult must be in [0.0, 1.0]");
        }
        self.retrieval.search_mode()?;

        if self.corpus.include_globs.is_empty() {
            bail!("corpus.include_globs must not be empty");
        }

        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "local" | "hash" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hash.",
                other
            ),
        }
        if matches!(self.embedding.provider.as_str(), "openai" | "ollama") {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        match self.llm.provider.as_str() {
            "disabled" | "ollama" | "openai" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be disabled, ollama, or openai.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[corpus]\ndir = \"junit_kb\"\n").unwrap();
        assert_eq!(config.corpus.include_globs, vec!["*.txt"]);
        assert_eq!(config.chunking.chunk_size, 1200);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.retrieval.k, 2);
        assert_eq!(config.retrieval.search_mode().unwrap(), SearchMode::Similarity);
        assert_eq!(config.llm.model, "codellama");
        assert!((config.llm.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let err = parse("[corpus]\ndir = \"kb\"\n[chunking]\nchunk_size = 10\noverlap = 10\n")
            .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_k_must_be_positive() {
        assert!(parse("[corpus]\ndir = \"kb\"\n[retrieval]\nk = 0\n").is_err());
    }

    #[test]
    fn test_mmr_mode_takes_tuning_knobs() {
        let config =
            parse("[corpus]\ndir = \"kb\"\n[retrieval]\nsearch_mode = \"mmr\"\nfetch_k = 8\nlambda_mult = 0.25\n")
                .unwrap();
        assert_eq!(
            config.retrieval.search_mode().unwrap(),
            SearchMode::Mmr {
                fetch_k: 8,
                lambda: 0.25
            }
        );
    }

    #[test]
    fn test_unknown_search_mode_rejected() {
        assert!(parse("[corpus]\ndir = \"kb\"\n[retrieval]\nsearch_mode = \"fuzzy\"\n").is_err());
    }

    #[test]
    fn test_remote_embedder_requires_model_and_dims() {
        assert!(parse("[corpus]\ndir = \"kb\"\n[embedding]\nprovider = \"openai\"\n").is_err());
        assert!(parse(
            "[corpus]\ndir = \"kb\"\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n"
        )
        .is_ok());
    }
}
