//! Error taxonomy for the migration pipeline.
//!
//! Only `PipelineError` is fatal to a run. Everything else is recoverable and
//! ends up as an entry in the `MigrationReport`.

use serde::Serialize;
use thiserror::Error;

use crate::model::DataType;

/// Markup that could not be tokenized. The page is skipped, the run continues.
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[error("cannot parse page {page_id} at byte {position}: {reason}")]
pub struct ParseError {
    pub page_id: String,
    pub position: usize,
    pub reason: String,
}

/// The AI service answered, but not with something we can use.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiResponseError {
    #[error("no JSON object in completion")]
    NoJson,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing or empty field `{0}`")]
    MissingField(&'static str),
    #[error("confidence {0} outside [0,1]")]
    ConfidenceOutOfRange(String),
}

/// Failure of a single AI call. All variants except `Disabled` are retryable.
#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("AI call timed out")]
    Timeout,
    #[error("AI provider rate limited the request")]
    RateLimited,
    #[error("AI transport error: {0}")]
    Transport(String),
    #[error("AI provider returned HTTP {0}")]
    Status(u16),
    #[error("AI classification is disabled")]
    Disabled,
    #[error(transparent)]
    Response(#[from] AiResponseError),
}

impl AiError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AiError::Disabled)
    }
}

/// Two member instances typed the same field incompatibly. Resolved, logged.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("schema {schema_uid}: field `{field}` observed as {observed:?}, resolved to {resolved:?}")]
pub struct SchemaConflict {
    pub schema_uid: String,
    pub field: String,
    pub observed: Vec<DataType>,
    pub resolved: DataType,
}

/// A record could not be written to the document store.
#[derive(Debug, Clone, Error, Serialize)]
#[error("persisting {kind} `{uid}` failed: {message}")]
pub struct PersistenceError {
    pub kind: &'static str,
    pub uid: String,
    pub message: String,
}

/// Corpus-level invariant violations. These abort the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no pages loaded; nothing to migrate")]
    EmptyCorpus,
    #[error("worker task failed: {0}")]
    Worker(String),
}
