//! Timestamped JSON outputs written at the end of a run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::ContentInstance;
use crate::pipeline::RunOutput;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub schemas: PathBuf,
    pub content: PathBuf,
    pub reusable: PathBuf,
    pub report: PathBuf,
}

impl OutputPaths {
    pub fn in_dir(dir: &Path, at: DateTime<Utc>) -> Self {
        let ts = at.format(TIMESTAMP_FORMAT).to_string();
        Self {
            schemas: dir.join(format!("content_schemas_{ts}.json")),
            content: dir.join(format!("extracted_content_{ts}.json")),
            reusable: dir.join(format!("reusable_components_{ts}.json")),
            report: dir.join(format!("migration_report_{ts}.json")),
        }
    }

    pub fn all(&self) -> [&Path; 4] {
        [
            self.schemas.as_path(),
            self.content.as_path(),
            self.reusable.as_path(),
            self.report.as_path(),
        ]
    }
}

#[derive(Serialize)]
struct PageContent<'a> {
    page_id: &'a str,
    url: &'a str,
    instances: Vec<&'a ContentInstance>,
}

/// Write all four files into `dir`, creating it if needed.
pub fn write_outputs(dir: &Path, run: &RunOutput, at: DateTime<Utc>) -> Result<OutputPaths> {
    fs::create_dir_all(dir).with_context(|| format!("creating output dir {}", dir.display()))?;
    let paths = OutputPaths::in_dir(dir, at);

    let mut by_page: BTreeMap<&str, Vec<&ContentInstance>> = BTreeMap::new();
    for i in &run.instances {
        by_page.entry(i.page_id.as_str()).or_default().push(i);
    }
    let content: Vec<PageContent<'_>> = run
        .report
        .pages
        .iter()
        .filter(|p| p.parse_error.is_none())
        .map(|p| PageContent {
            page_id: &p.page_id,
            url: &p.url,
            instances: by_page.remove(p.page_id.as_str()).unwrap_or_default(),
        })
        .collect();

    write_json(&paths.schemas, &run.schemas)?;
    write_json(&paths.content, &content)?;
    write_json(&paths.reusable, &run.reusable)?;
    write_json(&paths.report, &run.report)?;

    tracing::info!(
        target: "output",
        dir = %dir.display(),
        schemas = run.schemas.len(),
        instances = run.instances.len(),
        "outputs written"
    );
    Ok(paths)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_names_carry_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let p = OutputPaths::in_dir(Path::new("out"), at);
        assert_eq!(
            p.schemas,
            Path::new("out").join("content_schemas_20250304_050607.json")
        );
        assert!(p.report.ends_with("migration_report_20250304_050607.json"));
    }
}
