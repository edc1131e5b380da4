// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod ingest;
pub mod model;

// Block extraction and analysis (signatures, rules, clustering, AI classifier)
pub mod analyze;
pub mod extract;

// Synthesis, extraction and run outputs
pub mod content;
pub mod output;
pub mod report;
pub mod schema;
pub mod store;

pub mod metrics;
pub mod pipeline;

// ---- Re-exports for stable public API ----
pub use analyze::ai_adapter;
pub use crate::config::{ai::AiConfig, PipelineConfig};
pub use crate::error::{ParseError, PipelineError};
pub use crate::ingest::types::RawPage;
pub use crate::pipeline::{Pipeline, RunOutput};
pub use crate::report::MigrationReport;
