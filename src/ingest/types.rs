// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capture metadata written next to each HTML file by the capture tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureMeta {
    #[serde(default)]
    pub url: String,
    #[serde(default, alias = "page_type_hint")]
    pub page_type: Option<String>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

/// One captured page. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawPage {
    /// URL or file name; unique within a corpus.
    pub id: String,
    pub html: String,
    pub meta: CaptureMeta,
}

impl RawPage {
    pub fn new(id: impl Into<String>, html: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            meta: CaptureMeta {
                url: id.clone(),
                ..Default::default()
            },
            id,
            html: html.into(),
        }
    }

    pub fn with_meta(mut self, meta: CaptureMeta) -> Self {
        self.meta = meta;
        self
    }
}
