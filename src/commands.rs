//! CLI command implementations.
//!
//! Each `run_*` function backs one `kbh` subcommand. Results go to stdout;
//! diagnostics go through `tracing` to stderr.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::Path;
use std::time::SystemTime;

use crate::chunk_cache::{self, CHUNK_CACHE_FILE};
use crate::config::Config;
use crate::coordinator::{ChainCoordinator, PipelineRequest, RetrieverConfig};
use crate::corpus::Corpus;
use crate::fingerprint::{fingerprint_corpus, Fingerprint};
use crate::index_cache::{self, INDEX_DIR, INDEX_SIDECAR_FILE};
use crate::persist;
use crate::prompt::generate_tests;
use crate::query::QueryExecutor;

/// Per-invocation pipeline options shared by `search`, `query`, and
/// `generate`.
#[derive(Debug, Clone, Default)]
pub struct PipelineArgs {
    pub k: Option<usize>,
    pub mode: Option<String>,
    pub force: bool,
}

impl PipelineArgs {
    fn request(&self, config: &Config) -> Result<PipelineRequest> {
        let retriever =
            RetrieverConfig::from_settings(&config.retrieval, self.k, self.mode.as_deref())?;
        Ok(PipelineRequest {
            force_rebuild: self.force,
            retriever,
        })
    }
}

fn current_fingerprint(config: &Config) -> Result<(Corpus, Fingerprint)> {
    let corpus = Corpus::scan(&config.corpus.dir, &config.corpus.include_globs)?;
    let fingerprint = fingerprint_corpus(&corpus);
    Ok((corpus, fingerprint))
}

pub fn run_fingerprint(config: &Config) -> Result<()> {
    let (_, fingerprint) = current_fingerprint(config)?;
    println!("{}", fingerprint);
    Ok(())
}

/// Report corpus and on-disk cache state without building anything.
pub async fn run_status(config: &Config) -> Result<()> {
    let (corpus, fingerprint) = current_fingerprint(config)?;
    let chunk_fp = chunk_cache::stored_fingerprint(&config.cache.dir).await;
    let index_fp = index_cache::stored_fingerprint(&config.cache.dir).await;

    let describe = |stored: &Option<Fingerprint>| match stored {
        Some(fp) if fp == &fingerprint => format!("fresh ({})", fp.short()),
        Some(fp) => format!("stale ({})", fp.short()),
        None => "absent".to_string(),
    };

    let newest = corpus.artifacts().iter().map(|a| a.modified).max();
    let index_written = tokio::fs::metadata(config.cache.dir.join(INDEX_SIDECAR_FILE))
        .await
        .and_then(|m| m.modified())
        .ok();

    println!("Corpus:       {}", config.corpus.dir.display());
    println!("  files:      {}", corpus.len());
    println!("  modified:   {}", format_time(newest));
    println!("  fingerprint {}", fingerprint);
    println!("Cache:        {}", config.cache.dir.display());
    println!("  chunks:     {}", describe(&chunk_fp));
    println!("  index:      {}", describe(&index_fp));
    println!("  written:    {}", format_time(index_written));
    Ok(())
}

fn format_time(time: Option<SystemTime>) -> String {
    match time {
        Some(t) => DateTime::<Local>::from(t)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => "never".to_string(),
    }
}

/// Build (or load) the pipeline so the next process starts warm.
pub async fn run_warmup(config: &Config, force: bool) -> Result<()> {
    let coordinator = ChainCoordinator::from_config(config)?;
    let retriever = RetrieverConfig::from_settings(&config.retrieval, None, None)?;
    let request = PipelineRequest {
        force_rebuild: force,
        retriever,
    };
    let handle = coordinator.get_or_build(request).await?;
    let snapshot = coordinator.snapshot().await;

    println!("Pipeline ready.");
    println!("  fingerprint: {}", handle.fingerprint());
    println!("  chunks:      {}", snapshot.chunks);
    println!("  vectors:     {}", snapshot.vectors);
    println!("  model:       {}", snapshot.embedding_model);
    Ok(())
}

pub async fn run_search(config: &Config, query: &str, args: &PipelineArgs) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let coordinator = ChainCoordinator::from_config(config)?;
    let handle = coordinator.get_or_build(args.request(config)?).await?;
    let hits = QueryExecutor::new().retrieve(&handle, query).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}#{}",
            i + 1,
            hit.score,
            hit.chunk.source,
            hit.chunk.sequence_index
        );
        println!("    {}", snippet(&hit.chunk.content, 200));
    }
    Ok(())
}

pub async fn run_query(config: &Config, prompt: &str, args: &PipelineArgs) -> Result<()> {
    let coordinator = ChainCoordinator::from_config(config)?;
    let handle = coordinator.get_or_build(args.request(config)?).await?;
    let text = QueryExecutor::new().execute(&handle, prompt).await?;
    println!("{}", text);
    Ok(())
}

/// Generate unit tests for the AST JSON in `payload_path` (`-` for stdin).
pub async fn run_generate(config: &Config, payload_path: &Path, args: &PipelineArgs) -> Result<()> {
    let payload = if payload_path == Path::new("-") {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
            .context("Failed to read payload from stdin")?;
        buf
    } else {
        std::fs::read_to_string(payload_path)
            .with_context(|| format!("Failed to read payload: {}", payload_path.display()))?
    };

    let coordinator = ChainCoordinator::from_config(config)?;
    let text = generate_tests(
        &coordinator,
        &QueryExecutor::new(),
        &payload,
        args.request(config)?,
    )
    .await?;
    println!("{}", text);
    Ok(())
}

/// Delete the persisted chunk record, index artifact, and sidecar.
pub async fn run_clear_cache(config: &Config) -> Result<()> {
    let dir = &config.cache.dir;
    // Sidecar first so a partially cleared cache is never trusted.
    persist::remove_if_exists(&dir.join(INDEX_SIDECAR_FILE)).await?;
    persist::remove_if_exists(&dir.join(CHUNK_CACHE_FILE)).await?;
    match tokio::fs::remove_dir_all(dir.join(INDEX_DIR)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", dir.join(INDEX_DIR).display()))
        }
    }
    println!("Cache cleared: {}", dir.display());
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
