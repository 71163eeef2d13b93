//! Sliding-window text splitter.
//!
//! Splits each [`Document`] into fixed-size character windows that overlap
//! by a configurable amount. The algorithm is fully deterministic: the same
//! documents and the same `(chunk_size, overlap)` always yield byte-identical
//! chunk sequences.
//!
//! # Algorithm
//!
//! 1. Windows are measured in characters (Unicode scalar values), never
//!    bytes, so a window never splits a multi-byte character.
//! 2. The first window starts at offset 0; each following window starts
//!    `chunk_size - overlap` characters later.
//! 3. The window that reaches the end of the text is the last one. It may be
//!    shorter than `chunk_size` and is still emitted.
//! 4. Empty documents produce no chunks.
//!
//! # Example
//!
//! ```rust
//! use kb_harness_core::chunk::split_windows;
//!
//! let windows = split_windows("abcdefghij", 5, 2);
//! assert_eq!(windows, vec!["abcde", "defgh", "ghij"]);
//! ```

use anyhow::{bail, Result};

use crate::models::{Chunk, Document};

/// Strategy that turns an ordered list of documents into an ordered list of
/// chunks.
///
/// Implementations must be deterministic and must keep the chunks of one
/// document contiguous, numbered from 0.
pub trait Splitter: Send + Sync {
    fn split(&self, documents: &[Document]) -> Vec<Chunk>;
}

/// The production [`Splitter`]: fixed-size overlapping character windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSplitter {
    chunk_size: usize,
    overlap: usize,
}

impl WindowSplitter {
    /// Create a splitter.
    ///
    /// # Errors
    ///
    /// Fails when `chunk_size` is 0 or `overlap >= chunk_size` (the window
    /// would never advance).
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk_size must be > 0");
        }
        if overlap >= chunk_size {
            bail!(
                "overlap ({}) must be smaller than chunk_size ({})",
                overlap,
                chunk_size
            );
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

impl Splitter for WindowSplitter {
    fn split(&self, documents: &[Document]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for doc in documents {
            for (i, window) in split_windows(&doc.content, self.chunk_size, self.overlap)
                .into_iter()
                .enumerate()
            {
                chunks.push(Chunk {
                    content: window,
                    source: doc.name.clone(),
                    sequence_index: i,
                });
            }
        }
        chunks
    }
}

/// Split `text` into overlapping windows of at most `chunk_size` characters.
///
/// Callers are expected to pass `overlap < chunk_size`; out-of-range values
/// are clamped so the window always advances by at least one character.
pub fn split_windows(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let step = chunk_size.saturating_sub(overlap).max(1);

    // Byte offset of every char boundary, plus the end of the string.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = bounds.len() - 1;

    let mut windows = Vec::new();
    let mut start = 0;
    while start < char_len {
        let end = (start + chunk_size).min(char_len);
        windows.push(text[bounds[start]..bounds[end]].to_string());
        if end == char_len {
            break;
        }
        start += step;
    }
    windows
}
