//! Knowledge-base corpus discovery.
//!
//! The corpus is the set of top-level files in one directory whose names
//! match the configured include globs (`*.txt` by default). Subdirectories
//! are not descended into.
//!
//! Two views exist:
//!
//! - [`Corpus`]: the listing (name, size, mtime). Cheap; enough to
//!   fingerprint by reading only each file's head.
//! - [`LoadedCorpus`]: the listing plus full contents. Built only when a
//!   rebuild is needed.
//!
//! Both are sorted by name so every downstream step is deterministic.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use kb_harness_core::models::Document;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// One file of the corpus, as listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// File name relative to the corpus directory.
    pub name: String,
    pub path: PathBuf,
    pub len: u64,
    pub modified: SystemTime,
}

/// One file of the corpus with its full contents.
#[derive(Debug, Clone)]
pub struct LoadedArtifact {
    pub name: String,
    pub modified: SystemTime,
    pub bytes: Vec<u8>,
}

/// Sorted listing of the corpus directory.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    artifacts: Vec<Artifact>,
}

/// Sorted corpus snapshot with contents read.
#[derive(Debug, Clone, Default)]
pub struct LoadedCorpus {
    artifacts: Vec<LoadedArtifact>,
}

impl Corpus {
    /// List the top-level files of `dir` matching any of `include_globs`.
    ///
    /// A missing directory is an empty corpus, not an error.
    pub fn scan(dir: &Path, include_globs: &[String]) -> Result<Corpus> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "corpus directory missing, treating as empty");
            return Ok(Corpus::default());
        }

        let include_set = build_globset(include_globs)?;
        let mut artifacts = Vec::new();

        let walker = WalkDir::new(dir).min_depth(1).max_depth(1);
        for entry in walker {
            let entry =
                entry.with_context(|| format!("Failed to list corpus dir: {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if !include_set.is_match(&name) {
                continue;
            }

            let metadata = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
            artifacts.push(Artifact {
                name,
                path: entry.path().to_path_buf(),
                len: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Corpus { artifacts })
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Read the full contents of every listed file.
    ///
    /// Unlike fingerprinting, a read failure here is an error: a rebuild
    /// must not silently drop a document.
    pub fn load(&self) -> Result<LoadedCorpus> {
        let mut artifacts = Vec::with_capacity(self.artifacts.len());
        for artifact in &self.artifacts {
            let bytes = std::fs::read(&artifact.path)
                .with_context(|| format!("Failed to read {}", artifact.path.display()))?;
            // Re-stat so the snapshot's mtime belongs to the bytes just read.
            let modified = std::fs::metadata(&artifact.path)
                .and_then(|m| m.modified())
                .unwrap_or(artifact.modified);
            artifacts.push(LoadedArtifact {
                name: artifact.name.clone(),
                modified,
                bytes,
            });
        }
        Ok(LoadedCorpus { artifacts })
    }
}

impl LoadedCorpus {
    pub fn artifacts(&self) -> &[LoadedArtifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Text documents for the splitter, in name order. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn documents(&self) -> Vec<Document> {
        self.artifacts
            .iter()
            .map(|a| Document::new(a.name.clone(), String::from_utf8_lossy(&a.bytes)))
            .collect()
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
