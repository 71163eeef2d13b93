//! Core data models that flow through the chunk and index stages.

use serde::{Deserialize, Serialize};

/// A corpus artifact's full text, tagged with the artifact name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Artifact name (file name relative to the corpus directory).
    pub name: String,
    pub content: String,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// A bounded, possibly overlapping slice of one document's text.
///
/// `sequence_index` starts at 0 for every source and increases by one per
/// chunk. Chunks of different sources never interleave in a chunk list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub source: String,
    pub sequence_index: usize,
}
