// src/config/mod.rs
//! Pipeline tuning knobs, loaded from `config/migrator.toml`.
//!
//! Every key has a serde default, so an empty file (or no file) yields the
//! documented defaults. Env overrides are applied after parsing.

pub mod ai;

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::analyze::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "config/migrator.toml";
pub const ENV_CONFIG_PATH: &str = "MIGRATOR_CONFIG_PATH";
pub const ENV_AI_THRESHOLD: &str = "MIGRATOR_AI_THRESHOLD";
pub const ENV_OUTPUT_DIR: &str = "MIGRATOR_OUTPUT_DIR";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub classifier: ClassifierSection,
    #[serde(default)]
    pub schema: SchemaSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Minimum members for a cluster to become a reusable component type.
    pub min_cluster_members: usize,
    /// Page parsing workers.
    pub parse_workers: usize,
    /// Overall deadline for the run, measured from its start; 0 disables it.
    pub run_timeout_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            min_cluster_members: 2,
            parse_workers: 4,
            run_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    /// Heuristic confidence at or above which the AI call is skipped.
    pub threshold: f32,
    pub disagreement_penalty: f32,
    /// Confidence cap for heuristic results used after AI failure.
    pub fallback_cap: f32,
    /// Jaro-Winkler similarity needed to snap an AI label onto a known title.
    pub label_snap: f64,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            disagreement_penalty: 0.15,
            fallback_cap: 0.5,
            label_snap: 0.92,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaSection {
    /// Share of member instances that must carry a field for it to be mandatory.
    pub mandatory_ratio: f32,
    /// Enum fields with this many distinct values (or more) degrade to text.
    pub enum_cap: usize,
}

impl Default for SchemaSection {
    fn default() -> Self {
        Self {
            mandatory_ratio: 0.9,
            enum_cap: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: PathBuf,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migration_outputs"),
        }
    }
}

impl PipelineConfig {
    /// Resolve the config path (env or default), read it if present, apply env overrides.
    pub fn from_toml() -> anyhow::Result<Self> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut cfg = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                anyhow::anyhow!("Failed to read migrator config at {}: {}", path.display(), e)
            })?;
            Self::from_toml_str(&content)?
        } else {
            tracing::info!(target: "config", path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        if let Some(t) = parse_unit_env(std::env::var(ENV_AI_THRESHOLD).ok()) {
            cfg.classifier.threshold = t;
        }
        if let Ok(dir) = std::env::var(ENV_OUTPUT_DIR) {
            if !dir.trim().is_empty() {
                cfg.output.dir = PathBuf::from(dir.trim());
            }
        }
        Ok(cfg)
    }

    /// Load from a TOML string and sanitize out-of-range values.
    pub fn from_toml_str(toml_str: &str) -> anyhow::Result<Self> {
        let mut cfg: PipelineConfig = toml::from_str(toml_str)?;
        cfg.sanitize();
        Ok(cfg)
    }

    fn sanitize(&mut self) {
        let d = PipelineConfig::default();
        fn unit_or(x: f32, fallback: f32) -> f32 {
            if x.is_finite() && (0.0..=1.0).contains(&x) {
                x
            } else {
                fallback
            }
        }
        self.pipeline.min_cluster_members = self.pipeline.min_cluster_members.max(1);
        self.pipeline.parse_workers = self.pipeline.parse_workers.max(1);
        self.classifier.threshold = unit_or(self.classifier.threshold, d.classifier.threshold);
        self.classifier.disagreement_penalty = unit_or(
            self.classifier.disagreement_penalty,
            d.classifier.disagreement_penalty,
        );
        self.classifier.fallback_cap =
            unit_or(self.classifier.fallback_cap, d.classifier.fallback_cap);
        if !(0.0..=1.0).contains(&self.classifier.label_snap) {
            self.classifier.label_snap = d.classifier.label_snap;
        }
        self.schema.mandatory_ratio = unit_or(self.schema.mandatory_ratio, d.schema.mandatory_ratio);
        self.schema.enum_cap = self.schema.enum_cap.max(1);
        self.retry.max_attempts = self.retry.max_attempts.max(1);
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_jitter: Duration::from_millis(self.retry.max_jitter_ms),
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        match self.pipeline.run_timeout_secs {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }
}

// parse optional float env and clamp to <0.0..=1.0>
fn parse_unit_env(raw: Option<String>) -> Option<f32> {
    raw.and_then(|s| s.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
}
