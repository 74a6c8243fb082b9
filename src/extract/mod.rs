//! Extraction tiers and the orchestration pipeline.
//!
//! Tier-1 is pure regex work, Tier-2 verifies a trust-sampled subset of
//! its output against a model, Tier-3 rediscovers whole files whose
//! confidence stays low. The pipeline wires the tiers together with
//! bounded concurrency.
pub mod files;
pub mod pipeline;
pub mod tier1;
pub mod tier2;
pub mod tier3;

pub use files::{FileEntry, FileExtractor, ProjectContext, SourceFile};
pub use pipeline::{Pipeline, PipelineConfig, PipelineOutput};
pub use tier1::Tier1Matcher;
pub use tier2::Verifier;
pub use tier3::Discoverer;
