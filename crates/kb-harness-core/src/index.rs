//! In-memory nearest-neighbour index over chunk embeddings.
//!
//! [`VectorIndex`] stores chunks alongside their embedding vectors in
//! insertion order and answers queries by brute-force cosine similarity.
//! Three retrieval modes are supported, see [`SearchMode`].
//!
//! Scores are always the cosine similarity between the query vector and the
//! chunk vector, whatever the mode. Ties are broken by insertion order so
//! results are reproducible.

use anyhow::{bail, Result};
use std::cmp::Ordering;

use crate::embedding::cosine_similarity;
use crate::models::Chunk;

/// How the index picks results for a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    /// Plain top-k by cosine similarity.
    Similarity,
    /// Maximal marginal relevance: take the `fetch_k` most similar chunks,
    /// then greedily pick `k` of them trading relevance against redundancy.
    /// `lambda = 1.0` is pure relevance, `0.0` is pure diversity.
    Mmr { fetch_k: usize, lambda: f32 },
    /// Top-k by cosine similarity, dropping anything scoring below
    /// `threshold`.
    ScoreThreshold { threshold: f32 },
}

impl SearchMode {
    /// Stable name used in config files and API payloads.
    pub fn name(&self) -> &'static str {
        match self {
            SearchMode::Similarity => "similarity",
            SearchMode::Mmr { .. } => "mmr",
            SearchMode::ScoreThreshold { .. } => "similarity_score_threshold",
        }
    }
}

/// A chunk returned by a query, with its cosine similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Brute-force vector index.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: String,
    dims: usize,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    /// Create an empty index for vectors produced by `model`.
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
            chunks: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Append a chunk and its vector.
    ///
    /// # Errors
    ///
    /// Fails when the vector length differs from the index dimensionality.
    pub fn insert(&mut self, chunk: Chunk, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dims {
            bail!(
                "invalid vector dimension: expected {}, got {}",
                self.dims,
                vector.len()
            );
        }
        self.chunks.push(chunk);
        self.vectors.push(vector);
        Ok(())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks in insertion order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Vectors in insertion order, parallel to [`chunks`](Self::chunks).
    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    /// Query the index.
    ///
    /// # Errors
    ///
    /// Fails when the query vector length differs from the index
    /// dimensionality.
    pub fn search(&self, query: &[f32], k: usize, mode: &SearchMode) -> Result<Vec<ScoredChunk>> {
        if query.len() != self.dims {
            bail!(
                "invalid query dimension: expected {}, got {}",
                self.dims,
                query.len()
            );
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let ranked = self.rank(query);
        let picked: Vec<(usize, f32)> = match *mode {
            SearchMode::Similarity => ranked.into_iter().take(k).collect(),
            SearchMode::ScoreThreshold { threshold } => ranked
                .into_iter()
                .take(k)
                .filter(|(_, score)| *score >= threshold)
                .collect(),
            SearchMode::Mmr { fetch_k, lambda } => {
                let fetch = fetch_k.max(k);
                let candidates: Vec<(usize, f32)> = ranked.into_iter().take(fetch).collect();
                self.select_mmr(&candidates, k, lambda.clamp(0.0, 1.0))
            }
        };

        Ok(picked
            .into_iter()
            .map(|(i, score)| ScoredChunk {
                chunk: self.chunks[i].clone(),
                score,
            })
            .collect())
    }

    /// Every position with its query similarity, best first.
    fn rank(&self, query: &[f32]) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored
    }

    fn select_mmr(&self, candidates: &[(usize, f32)], k: usize, lambda: f32) -> Vec<(usize, f32)> {
        let mut remaining: Vec<(usize, f32)> = candidates.to_vec();
        let mut selected: Vec<(usize, f32)> = Vec::with_capacity(k);

        while selected.len() < k && !remaining.is_empty() {
            let mut best_pos = 0;
            let mut best_value = f32::NEG_INFINITY;
            for (pos, &(idx, relevance)) in remaining.iter().enumerate() {
                let redundancy = selected
                    .iter()
                    .map(|&(s, _)| cosine_similarity(&self.vectors[idx], &self.vectors[s]))
                    .fold(f32::NEG_INFINITY, f32::max);
                let redundancy = if selected.is_empty() { 0.0 } else { redundancy };
                let value = lambda * relevance - (1.0 - lambda) * redundancy;
                if value > best_value {
                    best_value = value;
                    best_pos = pos;
                }
            }
            selected.push(remaining.remove(best_pos));
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, seq: usize, content: &str) -> Chunk {
        Chunk {
            content: content.to_string(),
            source: source.to_string(),
            sequence_index: seq,
        }
    }

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new("test", 3);
        index.insert(chunk("a.txt", 0, "exact"), vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(chunk("a.txt", 1, "near-duplicate"), vec![0.99, 0.01, 0.0]).unwrap();
        index.insert(chunk("b.txt", 0, "different"), vec![0.7, 0.7, 0.0]).unwrap();
        index.insert(chunk("c.txt", 0, "orthogonal"), vec![0.0, 0.0, 1.0]).unwrap();
        index
    }

    fn contents(results: &[ScoredChunk]) -> Vec<&str> {
        results.iter().map(|r| r.chunk.content.as_str()).collect()
    }

    #[test]
    fn test_similarity_top_k() {
        let index = sample_index();
        let results = index
            .search(&[1.0, 0.0, 0.0], 2, &SearchMode::Similarity)
            .unwrap();
        assert_eq!(contents(&results), vec!["exact", "near-duplicate"]);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mmr_prefers_diverse_results() {
        let index = sample_index();
        let mode = SearchMode::Mmr {
            fetch_k: 4,
            lambda: 0.5,
        };
        let query = [1.0, 0.3, 0.0];
        let plain = index.search(&query, 2, &SearchMode::Similarity).unwrap();
        assert_eq!(contents(&plain), vec!["near-duplicate", "exact"]);
        let results = index.search(&query, 2, &mode).unwrap();
        assert_eq!(contents(&results), vec!["near-duplicate", "different"]);
    }

    #[test]
    fn test_mmr_with_lambda_one_matches_similarity() {
        let index = sample_index();
        let mode = SearchMode::Mmr {
            fetch_k: 4,
            lambda: 1.0,
        };
        let mmr = index.search(&[1.0, 0.0, 0.0], 3, &mode).unwrap();
        let sim = index
            .search(&[1.0, 0.0, 0.0], 3, &SearchMode::Similarity)
            .unwrap();
        assert_eq!(contents(&mmr), contents(&sim));
    }

    #[test]
    fn test_score_threshold_filters() {
        let index = sample_index();
        let mode = SearchMode::ScoreThreshold { threshold: 0.9 };
        let results = index.search(&[1.0, 0.0, 0.0], 4, &mode).unwrap();
        assert_eq!(contents(&results), vec!["exact", "near-duplicate"]);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut index = VectorIndex::new("test", 2);
        index.insert(chunk("a.txt", 0, "first"), vec![1.0, 0.0]).unwrap();
        index.insert(chunk("b.txt", 0, "second"), vec![1.0, 0.0]).unwrap();
        let results = index
            .search(&[1.0, 0.0], 2, &SearchMode::Similarity)
            .unwrap();
        assert_eq!(contents(&results), vec!["first", "second"]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new("test", 3);
        assert!(index.insert(chunk("a.txt", 0, "x"), vec![1.0, 0.0]).is_err());
        index.insert(chunk("a.txt", 0, "x"), vec![1.0, 0.0, 0.0]).unwrap();
        assert!(index.search(&[1.0, 0.0], 1, &SearchMode::Similarity).is_err());
    }

    #[test]
    fn test_empty_index_and_zero_k() {
        let index = VectorIndex::new("test", 2);
        assert!(index
            .search(&[1.0, 0.0], 3, &SearchMode::Similarity)
            .unwrap()
            .is_empty());
        let index = sample_index();
        assert!(index
            .search(&[1.0, 0.0, 0.0], 0, &SearchMode::Similarity)
            .unwrap()
            .is_empty());
    }
}
