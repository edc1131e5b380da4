// src/ingest/config.rs
//! Sidecar metadata files written by the capture tool (`<stem>.json` or `<stem>.toml`).

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::types::CaptureMeta;

/// Look for `<stem>.json`, then `<stem>.toml` next to `html_path`.
pub fn sidecar_path(html_path: &Path) -> Option<PathBuf> {
    ["json", "toml"]
        .iter()
        .map(|ext| html_path.with_extension(ext))
        .find(|p| p.exists())
}

/// Load capture metadata from an explicit path. Supports TOML or JSON formats.
pub fn load_meta_from(path: &Path) -> Result<CaptureMeta> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading capture metadata from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_meta(&content, ext.as_str())
}

fn parse_meta(s: &str, hint_ext: &str) -> Result<CaptureMeta> {
    let try_toml = hint_ext == "toml";
    if try_toml {
        if let Ok(v) = toml::from_str::<CaptureMeta>(s) {
            return Ok(clean(v));
        }
    }
    if let Ok(v) = serde_json::from_str::<CaptureMeta>(s) {
        return Ok(clean(v));
    }
    if !try_toml {
        if let Ok(v) = toml::from_str::<CaptureMeta>(s) {
            return Ok(clean(v));
        }
    }
    Err(anyhow!("unsupported capture metadata format"))
}

fn clean(mut meta: CaptureMeta) -> CaptureMeta {
    meta.url = meta.url.trim().to_string();
    meta.page_type = meta
        .page_type
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty());
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_and_toml_formats_work() {
        let json = r#"{"url": " https://example.com/a ", "page_type": "Article", "captured_at": "2025-01-02T03:04:05Z"}"#;
        let toml = r#"
url = "https://example.com/b"
page_type_hint = ""
"#;
        let j = parse_meta(json, "json").unwrap();
        assert_eq!(j.url, "https://example.com/a");
        assert_eq!(j.page_type.as_deref(), Some("article"));
        assert!(j.captured_at.is_some());

        let t = parse_meta(toml, "toml").unwrap();
        assert_eq!(t.url, "https://example.com/b");
        assert!(t.page_type.is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_meta("[[[", "json").is_err());
    }
}
