//! # kbase
//!
//! A local knowledge base: ingest text documents in mixed encodings, split
//! them into overlapping chunks, embed the chunks, and answer semantic
//! queries with provenance back to the source document.
//!
//! ## Architecture
//!
//! ```text
//! raw bytes ──▶ EncodingDetector ──▶ Chunker ──▶ EmbeddingProvider
//!                                                      │
//!                       ┌──────────────────────────────┘
//!                       ▼
//!              ┌──────────────────┐      ┌──────────────┐
//!              │  KnowledgeStore  │─────▶│  snapshot    │
//!              │ docs + VectorIdx │      │  (one file)  │
//!              └────────┬─────────┘      └──────────────┘
//!                       │
//!                       ▼
//!                 query → ranked chunks
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb ingest ./docs              # decode, chunk, embed, save snapshot
//! kb query "deployment steps"   # top chunks with scores
//! kb list                       # stored documents
//! kb show <id>                  # metadata, preview, chunk ranges
//! kb remove <id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error type and `Result` alias |
//! | [`models`] | Core data types |
//! | [`encoding`] | Encoding detection and normalization |
//! | [`chunk`] | Deterministic overlapping chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index (exact and approximate) |
//! | [`store`] | Knowledge store, ingest pipeline, snapshots |
//! | [`progress`] | Progress reporting |
//! | [`files`] | Input file discovery |
//! | [`commands`] | CLI command implementations |

pub mod chunk;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod encoding;
pub mod error;
pub mod files;
pub mod index;
pub mod models;
pub mod progress;
pub mod store;

pub use error::{KbError, Result};
pub use store::KnowledgeStore;
