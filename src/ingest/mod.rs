// src/ingest/mod.rs
//! Corpus loading: reads the HTML files and metadata written by the capture tool.

pub mod config;
pub mod types;

use crate::ingest::types::{CaptureMeta, RawPage};
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::Path;

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Normalize text: decode entities, unify quotes, collapse whitespace, trim.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Normalize “ ” ‘ ’ « » to ASCII quotes, nbsp to space
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    // 3) Collapse whitespace
    RE_WS.replace_all(&out, " ").trim().to_string()
}

/// Pages loaded from a capture directory, plus files that could not be read.
#[derive(Debug, Default)]
pub struct Corpus {
    pub pages: Vec<RawPage>,
    pub skipped: Vec<(String, String)>,
}

/// Load every `*.html` / `*.htm` file in `dir` (non-recursive), sorted by file name.
pub fn load_corpus(dir: &Path) -> Result<Corpus> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("reading capture directory {}", dir.display()))?;

    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut corpus = Corpus::default();
    for path in paths {
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let html = match fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!(target: "ingest", page = %id, error = %e, "unreadable page");
                corpus.skipped.push((id, e.to_string()));
                continue;
            }
        };
        let meta = match config::sidecar_path(&path) {
            Some(p) => config::load_meta_from(&p).unwrap_or_else(|e| {
                tracing::warn!(target: "ingest", page = %id, error = %e, "bad capture metadata");
                CaptureMeta::default()
            }),
            None => CaptureMeta::default(),
        };
        let meta = if meta.url.is_empty() {
            CaptureMeta {
                url: id.clone(),
                ..meta
            }
        } else {
            meta
        };
        corpus.pages.push(RawPage { id, html, meta });
    }

    tracing::info!(
        target: "ingest",
        pages = corpus.pages.len(),
        skipped = corpus.skipped.len(),
        dir = %dir.display(),
        "corpus loaded"
    );
    Ok(corpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_collapses_ws_and_entities() {
        let s = "  Hello,&nbsp;&nbsp; \u{201C}world\u{201D}  ";
        assert_eq!(normalize_text(s), "Hello, \"world\"");
    }

    #[test]
    fn loads_html_with_sidecars_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("b.html"), "<p>b</p>").unwrap();
        fs::write(tmp.path().join("a.html"), "<p>a</p>").unwrap();
        fs::write(
            tmp.path().join("a.json"),
            r#"{"url": "https://site/a", "page_type": "home"}"#,
        )
        .unwrap();
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let c = load_corpus(tmp.path()).unwrap();
        let ids: Vec<_> = c.pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a.html", "b.html"]);
        assert_eq!(c.pages[0].meta.url, "https://site/a");
        assert_eq!(c.pages[0].meta.page_type.as_deref(), Some("home"));
        assert_eq!(c.pages[1].meta.url, "b.html");
    }
}
