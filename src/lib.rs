//! # codemesh — Self-improving code knowledge mesh
//!
//! Extracts a queryable knowledge graph (functions, classes, endpoints,
//! tables, queues and the edges between them) from source trees using a
//! tiered ladder: fast regex patterns first, LLM verification of a
//! trust-sampled subset second, full LLM discovery only when confidence
//! stays low. Verification feedback evolves the patterns over time.
//!
//! ## Architecture
//!
//! - **[`config`]** — Configuration loading, validation and defaults
//! - **[`mesh`]** — Node/edge model and the mesh JSON document format
//! - **[`schema`]** — Extraction schemas, patterns, detection, evolution
//! - **[`extract`]** — File walking and the three-tier pipeline
//! - **[`trust`]** — Per-pattern verification counters and sampling
//! - **[`llm`]** — Provider trait, OpenAI-compatible HTTP client, mock
//! - **[`store`]** — SQLite graph store with per-file merge transactions
//! - **[`git`]** — Branch/commit context and change sets for sync
//! - **[`sync`]** — Full/incremental sync orchestration
//! - **[`link`]** — Cross-project reference matching

pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod git;
pub mod link;
pub mod llm;
pub mod mesh;
pub mod schema;
pub mod store;
pub mod sync;
pub mod trust;
