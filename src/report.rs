//! Run report: everything recoverable that went wrong, plus counts and timing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::analyze::classifier::{AiOutcome, Classification, ClassifierStats};
use crate::error::{ParseError, PersistenceError, SchemaConflict};
use crate::model::{BlockKey, ClassificationResult, ContentInstance};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AiFailure {
    pub block: BlockKey,
    pub attempts: u32,
    pub error: String,
}

/// A block whose final confidence stayed below the classifier threshold.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LowConfidence {
    pub block: BlockKey,
    pub label: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IncompleteInstance {
    pub uid: String,
    pub schema_uid: String,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PageSummary {
    pub page_id: String,
    pub url: String,
    pub blocks: usize,
    pub instances: usize,
    /// Instances per schema uid.
    pub components: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RunCounts {
    pub pages: usize,
    pub pages_failed: usize,
    pub blocks: usize,
    pub component_types: usize,
    pub reusable_components: usize,
    pub schemas: usize,
    pub instances: usize,
    pub ai_calls: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
    pub ai_skipped: u64,
    pub abandoned: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub counts: RunCounts,
    pub average_confidence: f32,
    pub parse_errors: Vec<ParseError>,
    pub ai_failures: Vec<AiFailure>,
    pub low_confidence: Vec<LowConfidence>,
    pub conflicts: Vec<SchemaConflict>,
    pub incomplete: Vec<IncompleteInstance>,
    pub persistence_failures: Vec<PersistenceError>,
    /// Blocks no rule, cluster or AI answer could name.
    pub unresolved: Vec<BlockKey>,
    /// Named blocks whose type never became reusable.
    pub unpromoted: Vec<BlockKey>,
    /// Reusable types left without a schema because no member had fields.
    pub fieldless_types: Vec<String>,
    pub pages: Vec<PageSummary>,
}

impl MigrationReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            elapsed_ms: 0,
            counts: RunCounts::default(),
            average_confidence: 0.0,
            parse_errors: Vec::new(),
            ai_failures: Vec::new(),
            low_confidence: Vec::new(),
            conflicts: Vec::new(),
            incomplete: Vec::new(),
            persistence_failures: Vec::new(),
            unresolved: Vec::new(),
            unpromoted: Vec::new(),
            fieldless_types: Vec::new(),
            pages: Vec::new(),
        }
    }

    pub fn record_parse_error(&mut self, err: ParseError) {
        self.counts.pages_failed += 1;
        self.parse_errors.push(err);
    }

    /// Note AI failures and deadline cut-offs for one classification.
    pub fn record_outcome(&mut self, c: &Classification) {
        let block = c.result.key();
        match &c.outcome {
            AiOutcome::Failed { attempts, error } => self.ai_failures.push(AiFailure {
                block,
                attempts: *attempts,
                error: error.clone(),
            }),
            AiOutcome::Abandoned => {
                self.counts.abandoned += 1;
                self.ai_failures.push(AiFailure {
                    block,
                    attempts: 0,
                    error: "run deadline exceeded".to_string(),
                });
            }
            _ => {}
        }
    }

    /// Ambiguous, unresolved and unpromoted blocks, judged on the final results.
    ///
    /// Any named result below `threshold` is ambiguous, whatever its source.
    pub fn record_results(
        &mut self,
        results: &[ClassificationResult],
        threshold: f32,
        reusable: &BTreeSet<String>,
    ) {
        for r in results {
            if r.is_unknown() {
                self.unresolved.push(r.key());
                continue;
            }
            if !reusable.contains(&r.component_uid) {
                self.unpromoted.push(r.key());
            }
            if r.confidence < threshold {
                self.low_confidence.push(LowConfidence {
                    block: r.key(),
                    label: r.label.clone(),
                    confidence: r.confidence,
                });
            }
        }
        let known: Vec<f32> = results
            .iter()
            .filter(|r| !r.is_unknown())
            .map(|r| r.confidence)
            .collect();
        self.average_confidence = if known.is_empty() {
            0.0
        } else {
            known.iter().sum::<f32>() / known.len() as f32
        };
    }

    pub fn record_instances(&mut self, instances: &[ContentInstance]) {
        self.counts.instances = instances.len();
        for i in instances.iter().filter(|i| i.incomplete) {
            self.incomplete.push(IncompleteInstance {
                uid: i.uid.clone(),
                schema_uid: i.schema_uid.clone(),
                missing: i.missing_mandatory.clone(),
            });
        }
        for page in &mut self.pages {
            for i in instances.iter().filter(|i| i.page_id == page.page_id) {
                page.instances += 1;
                *page.components.entry(i.schema_uid.clone()).or_default() += 1;
            }
        }
    }

    pub fn record_classifier(&mut self, stats: ClassifierStats) {
        self.counts.ai_calls = stats.ai_calls;
        self.counts.cache_hits = stats.cache_hits;
        self.counts.fallbacks = stats.fallbacks;
        self.counts.ai_skipped = stats.skipped;
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.elapsed_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(finished_at);
    }

    /// True when no error was recorded; ambiguity and promotion notes do not count.
    pub fn is_clean(&self) -> bool {
        self.parse_errors.is_empty()
            && self.ai_failures.is_empty()
            && self.conflicts.is_empty()
            && self.incomplete.is_empty()
            && self.persistence_failures.is_empty()
    }

    /// One-line summary for the log.
    pub fn summary(&self) -> String {
        format!(
            "{} pages ({} failed), {} blocks, {} schemas, {} instances ({} incomplete), {} AI calls, {} cache hits, {} fallbacks, {} conflicts, {} unresolved, {} unpromoted",
            self.counts.pages,
            self.counts.pages_failed,
            self.counts.blocks,
            self.counts.schemas,
            self.counts.instances,
            self.incomplete.len(),
            self.counts.ai_calls,
            self.counts.cache_hits,
            self.counts.fallbacks,
            self.conflicts.len(),
            self.unresolved.len(),
            self.unpromoted.len(),
        )
    }
}
