//! # kb-harness
//!
//! A cache-and-rebuild pipeline for retrieval-augmented generation over a
//! directory of text files.
//!
//! The expensive steps (splitting the corpus into chunks and embedding every
//! chunk) run only when the corpus changes. Their outputs are persisted, so a
//! fresh process against an unchanged corpus starts without re-embedding.
//! One coordinator serializes rebuilds while queries run in parallel against
//! immutable handles.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌────────────┐   ┌────────────┐
//! │  Corpus  │──▶│ Fingerprint │──▶│ ChunkCache │──▶│ IndexCache │
//! │  *.txt   │   │  SHA-256    │   │ kb_splits  │   │  kb_index  │
//! └──────────┘   └─────────────┘   └────────────┘   └─────┬──────┘
//!                                                         │
//!                      ChainCoordinator (one lock) ◀──────┘
//!                               │ RetrievalHandle
//!                 ┌─────────────┼─────────────┐
//!                 ▼             ▼             ▼
//!           QueryExecutor   CLI (kbh)     HTTP server
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbh status                          # corpus fingerprint and cache freshness
//! kbh warmup                          # build or load chunks + index
//! kbh search "mock a static method"
//! kbh generate --payload Calculator.ast.json
//! kbh serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`corpus`] | Corpus directory listing and loading |
//! | [`fingerprint`] | Corpus digest |
//! | [`chunk_cache`] | Fingerprint-keyed chunk cache |
//! | [`index_cache`] | Fingerprint-keyed vector index cache |
//! | [`coordinator`] | Pipeline state and rebuild decisions |
//! | [`query`] | Retrieval and generation |
//! | [`prompt`] | Unit-test generation prompt |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Language-model providers |
//! | [`error`] | Pipeline and persistence errors |
//! | [`server`] | HTTP server |
//! | [`commands`] | CLI command implementations |

pub mod chunk_cache;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod index_cache;
pub mod llm;
mod persist;
pub mod prompt;
pub mod query;
pub mod server;

pub use coordinator::{ChainCoordinator, PipelineRequest, RetrievalHandle, RetrieverConfig};
pub use error::PipelineError;
pub use query::QueryExecutor;
