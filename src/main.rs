//! cms-migrator — binary entrypoint.
//! Loads config and a captured corpus, runs the migration pipeline and writes
//! the timestamped outputs plus a metrics snapshot.
//!
//! Usage: `cms-migrator <capture-dir> [output-dir]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cms_migrator::config::ai::{AiConfig, DEFAULT_AI_CONFIG_PATH};
use cms_migrator::ingest::load_corpus;
use cms_migrator::store::JsonlStore;
use cms_migrator::{metrics, output, Pipeline, PipelineConfig};

/// Compact logs by default, JSON lines with `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cms_migrator=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; OPENAI_API_KEY and MIGRATOR_* overrides live there.
    let _ = dotenvy::dotenv();
    init_tracing();

    let mut args = std::env::args().skip(1);
    let capture_dir = args
        .next()
        .map(PathBuf::from)
        .context("usage: cms-migrator <capture-dir> [output-dir]")?;

    let mut config = PipelineConfig::from_toml().context("loading pipeline config")?;
    if let Some(dir) = args.next() {
        config.output.dir = PathBuf::from(dir);
    }
    let ai_path =
        std::env::var("MIGRATOR_AI_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_AI_CONFIG_PATH.into());
    let ai = AiConfig::load_or_default(&ai_path)
        .with_context(|| format!("loading AI config from {ai_path}"))?;

    let handle = metrics::install_prometheus()?;

    let corpus = load_corpus(&capture_dir)?;
    for (id, reason) in &corpus.skipped {
        tracing::warn!(page = %id, reason = %reason, "page not loaded");
    }

    let out_dir = config.output.dir.clone();
    let pipeline = Pipeline::from_configs(config, &ai)
        .with_store(std::sync::Arc::new(JsonlStore::new(out_dir.join("store"))));
    let run = pipeline.run(corpus.pages).await?;

    let paths = output::write_outputs(&out_dir, &run, run.report.started_at)?;
    metrics::write_snapshot(&handle, &out_dir.join("metrics.prom"))?;

    for p in paths.all() {
        println!("{}", p.display());
    }
    tracing::info!(summary = %run.report.summary(), "done");
    Ok(())
}
