//! Run counters. Without an installed recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::path::Path;

pub const AI_CALLS: &str = "migrator_ai_calls_total";
pub const AI_CACHE_HITS: &str = "migrator_ai_cache_hits_total";
pub const AI_FALLBACKS: &str = "migrator_ai_fallbacks_total";
pub const BLOCKS: &str = "migrator_blocks_total";
pub const PARSE_ERRORS: &str = "migrator_parse_errors_total";
pub const PARSE_MS: &str = "migrator_parse_ms";
pub const LAST_RUN_TS: &str = "migrator_last_run_ts";

/// One-time metrics registration (so series show up in the snapshot).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(AI_CALLS, "AI provider requests, retries included.");
        describe_counter!(AI_CACHE_HITS, "Classifications answered from the run cache.");
        describe_counter!(
            AI_FALLBACKS,
            "Blocks that fell back to heuristics after AI failure."
        );
        describe_counter!(BLOCKS, "Content blocks extracted from pages.");
        describe_counter!(PARSE_ERRORS, "Pages that could not be parsed.");
        describe_histogram!(PARSE_MS, "Per-page parse and detection time in milliseconds.");
        describe_gauge!(LAST_RUN_TS, "Unix ts when the last run finished.");
    });
}

pub fn ai_call() {
    counter!(AI_CALLS).increment(1);
}

pub fn ai_cache_hit() {
    counter!(AI_CACHE_HITS).increment(1);
}

pub fn ai_fallback() {
    counter!(AI_FALLBACKS).increment(1);
}

pub fn page_parsed(blocks: usize, ms: f64) {
    counter!(BLOCKS).increment(blocks as u64);
    histogram!(PARSE_MS).record(ms);
}

pub fn parse_error() {
    counter!(PARSE_ERRORS).increment(1);
}

pub fn run_finished() {
    gauge!(LAST_RUN_TS).set(chrono::Utc::now().timestamp() as f64);
}

/// Install the Prometheus recorder for this process.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
    ensure_described();
    Ok(handle)
}

/// Write the exposition-format snapshot to `path`.
pub fn write_snapshot(handle: &PrometheusHandle, path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, handle.render())?;
    Ok(())
}
