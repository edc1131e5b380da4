//! Classifier: decides whether a block needs the AI, calls it through the
//! run-scoped cache with bounded retries, and fuses the answer with the
//! heuristic opinion.
//!
//! Cache entries are one `OnceCell` per (text, shape) key, so two identical
//! blocks never cause two AI calls, even when classified concurrently. The map
//! lock is only held to fetch the cell, never across an AI call.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use crate::analyze::ai_adapter::{normalize_label, AiAnswer, AiRequest, DynAiClient};
use crate::analyze::patterns::ClusterId;
use crate::analyze::retry::{RetryExhausted, RetryPolicy};
use crate::analyze::rules::{Heuristic, KNOWN_LABELS};
use crate::analyze::scoring::{fallback_confidence, fuse, FusionParams};
use crate::config::PipelineConfig;
use crate::model::{
    component_uid, ClassificationResult, ClassificationSource, ContentBlock, FieldValue,
};

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    /// Heuristic confidence at or above which the AI is skipped (when the cluster agrees).
    pub threshold: f32,
    pub label_snap: f64,
    pub fusion: FusionParams,
    pub retry: RetryPolicy,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            label_snap: 0.92,
            fusion: FusionParams::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClassifierSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            threshold: cfg.classifier.threshold,
            label_snap: cfg.classifier.label_snap,
            fusion: FusionParams {
                disagreement_penalty: cfg.classifier.disagreement_penalty,
                fallback_cap: cfg.classifier.fallback_cap,
            },
            retry: cfg.retry_policy(),
        }
    }
}

/// One block ready for classification.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub block: &'a ContentBlock,
    pub heuristic: &'a Heuristic,
    pub cluster_id: ClusterId,
    pub cluster_title: &'a str,
}

/// What happened on the AI path for one block.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AiOutcome {
    /// Heuristic was confident and agreed with the cluster.
    Skipped,
    /// AI turned off in config.
    Disabled,
    Answered { attempts: u32 },
    CacheHit,
    Failed { attempts: u32, error: String },
    /// Run deadline passed before the call finished.
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub result: ClassificationResult,
    pub outcome: AiOutcome,
}

/// Snapshot of classifier counters for the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifierStats {
    pub ai_calls: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    ai_calls: AtomicU64,
    cache_hits: AtomicU64,
    fallbacks: AtomicU64,
    skipped: AtomicU64,
}

type CachedAnswer = Result<(AiAnswer, u32), RetryExhausted>;

pub struct Classifier {
    client: DynAiClient,
    settings: ClassifierSettings,
    known_titles: Vec<String>,
    cache: Mutex<HashMap<String, Arc<OnceCell<CachedAnswer>>>>,
    counters: Counters,
}

impl Classifier {
    /// `cluster_titles` are the working titles of the candidate types; they are
    /// offered to the model and used to snap its labels.
    pub fn new(client: DynAiClient, settings: ClassifierSettings, cluster_titles: &[String]) -> Self {
        let mut known_titles: Vec<String> = KNOWN_LABELS.iter().map(|s| s.to_string()).collect();
        for t in cluster_titles {
            if !known_titles.contains(t) && t != crate::model::UNKNOWN {
                known_titles.push(t.clone());
            }
        }
        Self {
            client,
            settings,
            known_titles,
            cache: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn settings(&self) -> &ClassifierSettings {
        &self.settings
    }

    pub fn stats(&self) -> ClassifierStats {
        ClassifierStats {
            ai_calls: self.counters.ai_calls.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Number of distinct cache keys seen so far.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn classify(&self, input: ClassifyInput<'_>) -> Classification {
        let h = input.heuristic;

        if !self.client.is_enabled() {
            return Classification {
                result: self.heuristic_result(&input, h.confidence, ClassificationSource::HeuristicOnly),
                outcome: AiOutcome::Disabled,
            };
        }

        if h.confidence >= self.settings.threshold && input.cluster_title == h.label {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return Classification {
                result: self.heuristic_result(&input, h.confidence, ClassificationSource::HeuristicOnly),
                outcome: AiOutcome::Skipped,
            };
        }

        let key = cache_key(&input.block.text, &input.block.signature.digest);
        let cell = {
            let mut map = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.clone()).or_default())
        };

        let mut fresh = false;
        let cached = cell
            .get_or_init(|| {
                fresh = true;
                self.call_ai(&input)
            })
            .await;

        if !fresh {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            crate::metrics::ai_cache_hit();
        }

        match cached {
            Ok((answer, attempts)) => {
                let outcome = if fresh {
                    AiOutcome::Answered {
                        attempts: *attempts,
                    }
                } else {
                    AiOutcome::CacheHit
                };
                Classification {
                    result: self.fused_result(&input, answer),
                    outcome,
                }
            }
            Err(exhausted) => {
                tracing::warn!(
                    target: "classifier",
                    block = %input.block.key(),
                    key = &key[..12],
                    attempts = exhausted.attempts,
                    error = %exhausted.last,
                    "AI classification failed; using heuristic fallback"
                );
                let outcome = if fresh {
                    AiOutcome::Failed {
                        attempts: exhausted.attempts,
                        error: exhausted.last.to_string(),
                    }
                } else {
                    AiOutcome::CacheHit
                };
                Classification {
                    result: self.fallback_result(&input),
                    outcome,
                }
            }
        }
    }

    /// Result for a block whose classification was cut off by the run deadline.
    pub fn abandoned(&self, input: ClassifyInput<'_>) -> Classification {
        Classification {
            result: self.fallback_result(&input),
            outcome: AiOutcome::Abandoned,
        }
    }

    async fn call_ai(&self, input: &ClassifyInput<'_>) -> CachedAnswer {
        let req = AiRequest::from_block(input.block, input.heuristic, &self.known_titles);
        let mut used = 0;
        let answer = self
            .settings
            .retry
            .run("classify", |attempt| {
                used = attempt;
                self.counters.ai_calls.fetch_add(1, Ordering::Relaxed);
                crate::metrics::ai_call();
                self.client.classify(&req)
            })
            .await?;
        tracing::debug!(
            target: "classifier",
            block = %input.block.key(),
            provider = self.client.provider_name(),
            label = %answer.label,
            confidence = answer.confidence,
            "AI answered"
        );
        Ok((answer, used))
    }

    fn base_result(
        &self,
        input: &ClassifyInput<'_>,
        label: String,
        fields: BTreeMap<String, FieldValue>,
        confidence: f32,
        source: ClassificationSource,
    ) -> ClassificationResult {
        ClassificationResult {
            page_id: input.block.page_id.clone(),
            block_id: input.block.id,
            component_uid: component_uid(&label),
            label,
            fields,
            confidence,
            source,
            cluster_id: input.cluster_id,
        }
    }

    fn heuristic_result(
        &self,
        input: &ClassifyInput<'_>,
        confidence: f32,
        source: ClassificationSource,
    ) -> ClassificationResult {
        let h = input.heuristic;
        self.base_result(input, h.label.clone(), h.fields.clone(), confidence, source)
    }

    fn fallback_result(&self, input: &ClassifyInput<'_>) -> ClassificationResult {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        crate::metrics::ai_fallback();
        let c = fallback_confidence(input.heuristic.confidence, &self.settings.fusion);
        self.heuristic_result(input, c, ClassificationSource::HeuristicFallback)
    }

    fn fused_result(&self, input: &ClassifyInput<'_>, answer: &AiAnswer) -> ClassificationResult {
        let h = input.heuristic;
        let label = normalize_label(&answer.label, &self.known_titles, self.settings.label_snap);
        let (confidence, source) = fuse(
            &h.label,
            h.confidence,
            input.cluster_title,
            &label,
            answer.confidence,
            &self.settings.fusion,
        );
        let mut fields = h.fields.clone();
        for (k, v) in &answer.fields {
            fields.insert(k.clone(), v.clone());
        }
        self.base_result(input, label, fields, confidence, source)
    }
}

/// Hex SHA-256 over block text and shape digest.
pub fn cache_key(text: &str, digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0x1f]);
    hasher.update(digest.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::ai_adapter::{PromptClient, ScriptedProvider};
    use crate::analyze::signature::StructuralSignature;
    use crate::error::AiError;
    use crate::model::BlockFeatures;
    use std::time::Duration;

    fn block(text: &str) -> ContentBlock {
        ContentBlock {
            id: 1,
            page_id: "p".into(),
            path: "body > div".into(),
            tag: "div".into(),
            text: text.into(),
            children: vec![],
            parent: None,
            attrs: Default::default(),
            signature: StructuralSignature::from_parts("div", 0, Default::default(), text.len()),
            features: BlockFeatures::default(),
            repeated_children: 0,
        }
    }

    fn heuristic(label: &str, confidence: f32) -> Heuristic {
        Heuristic {
            label: label.into(),
            confidence,
            fields: BTreeMap::new(),
        }
    }

    fn settings() -> ClassifierSettings {
        ClassifierSettings {
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        }
    }

    fn classifier(provider: ScriptedProvider) -> Classifier {
        let client: DynAiClient = Arc::new(PromptClient::new(provider, Duration::from_secs(5)));
        Classifier::new(client, settings(), &[])
    }

    #[tokio::test]
    async fn confident_heuristic_skips_ai() {
        let provider = ScriptedProvider::new(|_| Err(AiError::Timeout));
        let calls = provider.calls();
        let c = classifier(provider);
        let (b, h) = (block("Welcome"), heuristic("headline", 0.85));
        let out = c
            .classify(ClassifyInput {
                block: &b,
                heuristic: &h,
                cluster_id: 0,
                cluster_title: "headline",
            })
            .await;
        assert_eq!(out.outcome, AiOutcome::Skipped);
        assert_eq!(out.result.source, ClassificationSource::HeuristicOnly);
        assert_eq!(out.result.component_uid, "headline_component");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back() {
        let provider = ScriptedProvider::new(|_| Err(AiError::Timeout));
        let calls = provider.calls();
        let c = classifier(provider);
        let (b, h) = (block("Some card"), heuristic("card", 0.7));
        let out = c
            .classify(ClassifyInput {
                block: &b,
                heuristic: &h,
                cluster_id: 0,
                cluster_title: "card",
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.result.source, ClassificationSource::HeuristicFallback);
        assert!(out.result.confidence <= 0.5);
        assert_eq!(out.result.label, "card");
        assert!(matches!(out.outcome, AiOutcome::Failed { attempts: 3, .. }));
        assert_eq!(c.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn ai_override_is_adopted() {
        let provider = ScriptedProvider::new(|_| {
            Ok(r#"{"type": "Teaser-Component", "confidence": 0.9, "fields": {"title": "X"}}"#.into())
        });
        let c = classifier(provider);
        let (b, h) = (block("Some card text"), heuristic("card", 0.6));
        let out = c
            .classify(ClassifyInput {
                block: &b,
                heuristic: &h,
                cluster_id: 2,
                cluster_title: "card",
            })
            .await;
        assert_eq!(out.result.label, "teaser");
        assert_eq!(out.result.component_uid, "teaser_component");
        assert_eq!(out.result.source, ClassificationSource::AiOverridden);
        // max(0.6, 0.9) - 0.15
        assert!((out.result.confidence - 0.75).abs() < 1e-6);
        assert_eq!(out.result.fields["title"], FieldValue::Text("X".into()));
        assert_eq!(out.result.cluster_id, 2);
    }

    #[tokio::test]
    async fn identical_blocks_share_one_call() {
        let provider = ScriptedProvider::new(|_| {
            Ok(r#"{"type": "card", "confidence": 0.7, "fields": {}}"#.into())
        })
        .with_latency(Duration::from_millis(20));
        let calls = provider.calls();
        let c = classifier(provider);
        let (b1, h) = (block("Same text"), heuristic("card", 0.5));
        let mut b2 = b1.clone();
        b2.id = 2;
        let i1 = ClassifyInput {
            block: &b1,
            heuristic: &h,
            cluster_id: 0,
            cluster_title: "card",
        };
        let i2 = ClassifyInput { block: &b2, ..i1 };
        let (r1, r2) = tokio::join!(c.classify(i1), c.classify(i2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(r1.result.label, r2.result.label);
        assert_eq!(r1.result.confidence, r2.result.confidence);
        assert_eq!(c.stats().cache_hits, 1);
        assert_eq!(c.cache_len(), 1);
    }

    #[test]
    fn cache_key_depends_on_text_and_shape() {
        assert_eq!(cache_key("a", "d1"), cache_key("a", "d1"));
        assert_ne!(cache_key("a", "d1"), cache_key("a", "d2"));
        assert_ne!(cache_key("a", "d1"), cache_key("b", "d1"));
        assert_eq!(cache_key("a", "d").len(), 64);
    }
}
