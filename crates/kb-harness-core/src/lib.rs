//! # kb-harness core
//!
//! Pure logic shared by the kb-harness pipeline: data models, the
//! deterministic window splitter, the [`embedding::Embedder`] trait and
//! vector helpers, and the in-memory [`index::VectorIndex`].
//!
//! This crate performs no filesystem or network I/O. Caching, persistence,
//! and concrete embedding backends live in the `kb-harness` app crate.

pub mod chunk;
pub mod embedding;
pub mod index;
pub mod models;
