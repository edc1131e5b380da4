//! Page segmentation: HTML -> forest of meaningful content blocks.
//!
//! Rules are fixed:
//! - excluded subtrees (scripts, styles, navigation chrome, noise widgets) are invisible;
//! - `html`/`body`/`main` and inline elements are transparent;
//! - leaf tags carry inline content and are not segmented further;
//! - a container with no text of its own and exactly one meaningful child collapses into it;
//! - empty or whitespace-only elements are dropped (images with a source are kept).

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};
use std::collections::{BTreeMap, HashMap};

use crate::analyze::signature::StructuralSignature;
use crate::error::ParseError;
use crate::ingest::normalize_text;
use crate::ingest::types::RawPage;
use crate::model::{BlockFeatures, BlockId, ContentBlock, FormInput, Image, Link};

const EXCLUDED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "iframe", "svg", "canvas", "head", "nav", "footer",
    "link", "meta",
];
const TRANSPARENT_TAGS: &[&str] = &["html", "body", "main"];
const LEAF_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "blockquote", "pre", "img", "figcaption", "dt",
    "dd", "td", "th", "button", "label",
];
const CONTAINER_TAGS: &[&str] = &[
    "section", "article", "aside", "header", "div", "form", "ul", "ol", "table", "figure",
    "details", "dl", "tr", "tbody", "thead",
];
/// class/id substrings marking noise widgets.
const NOISE_SUBSTRINGS: &[&str] = &["cookie", "advert", "popup", "social-media", "skip-link"];
/// class/id tokens marking noise widgets when they appear as a whole token.
const NOISE_TOKENS: &[&str] = &["ad", "ads", "sponsored"];
/// Own attributes copied into the block's attribute map.
const KEPT_ATTRS: &[&str] = &[
    "id", "class", "href", "src", "alt", "action", "method", "type", "name", "role", "title",
];

const MAX_HEADINGS: usize = 8;
const MAX_PARAGRAPHS: usize = 8;
const MAX_LINKS: usize = 20;
const MAX_IMAGES: usize = 12;
const MAX_INPUTS: usize = 20;
const MAX_LIST_ITEMS: usize = 20;
const MAX_ATTR_LEN: usize = 200;

static RE_BG_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"background(?:-image)?\s*:[^;]*url\(\s*['"]?([^'")]+)['"]?\s*\)"#)
        .expect("background url regex")
});

/// Stateless segmenter with the fixed rule set above.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockExtractor;

impl BlockExtractor {
    /// Tokenize the page. Fails only on input that is not markup at all.
    pub fn parse(page: &RawPage) -> Result<ParsedPage, ParseError> {
        let html = page.html.as_str();
        let fail = |position: usize, reason: &str| ParseError {
            page_id: page.id.clone(),
            position,
            reason: reason.to_string(),
        };

        if html.trim().is_empty() {
            return Err(fail(0, "empty document"));
        }
        if let Some(pos) = html.find('\0') {
            return Err(fail(pos, "binary content (NUL byte)"));
        }
        if !html.contains('<') {
            let pos = html.len() - html.trim_start().len();
            return Err(fail(pos, "no markup found"));
        }

        let doc = Html::parse_document(html);
        if !doc.errors.is_empty() {
            tracing::debug!(
                target: "extract",
                page = %page.id,
                recovered = doc.errors.len(),
                "html parser recovered from markup errors"
            );
        }
        Ok(ParsedPage {
            page_id: page.id.clone(),
            doc,
        })
    }
}

/// A tokenized page. Not `Send`; consume it on the thread that parsed it.
pub struct ParsedPage {
    page_id: String,
    doc: Html,
}

impl ParsedPage {
    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Lazy pre-order walk over the block forest.
    pub fn blocks(&self) -> Blocks<'_> {
        let mut it = Blocks {
            page_id: &self.page_id,
            stack: Vec::new(),
            next_id: 0,
        };
        let roots = meaningful_children(self.doc.root_element(), "");
        it.push_pending(roots, None);
        it
    }
}

/// Iterator over one page's blocks. Finite and non-restartable.
pub struct Blocks<'a> {
    page_id: &'a str,
    stack: Vec<Pending<'a>>,
    next_id: BlockId,
}

struct Pending<'a> {
    el: ElementRef<'a>,
    id: BlockId,
    parent: Option<BlockId>,
    path: String,
    signature: StructuralSignature,
    text: String,
}

impl<'a> Blocks<'a> {
    /// Reserve ids for `found` (in document order) and queue them.
    fn push_pending(
        &mut self,
        found: Vec<(ElementRef<'a>, String)>,
        parent: Option<BlockId>,
    ) -> Vec<(BlockId, StructuralSignature)> {
        let mut queued = Vec::with_capacity(found.len());
        for (el, path) in found {
            let id = self.next_id;
            self.next_id += 1;
            let text = block_text(el);
            let signature = StructuralSignature::of_element(el, text.chars().count(), is_excluded);
            queued.push(Pending {
                el,
                id,
                parent,
                path,
                signature,
                text,
            });
        }
        let ids = queued.iter().map(|p| (p.id, p.signature.clone())).collect();
        // Reverse so the first child is popped first.
        self.stack.extend(queued.into_iter().rev());
        ids
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = ContentBlock;

    fn next(&mut self) -> Option<ContentBlock> {
        let p = self.stack.pop()?;
        let tag = p.el.value().name().to_string();

        let children = if is_leaf(&tag) {
            Vec::new()
        } else {
            let found = meaningful_children(p.el, &p.path);
            self.push_pending(found, Some(p.id))
        };

        let repeated_children = largest_shape_group(children.iter().map(|(_, s)| s));

        Some(ContentBlock {
            id: p.id,
            page_id: self.page_id.to_string(),
            path: p.path,
            tag,
            text: p.text,
            children: children.into_iter().map(|(id, _)| id).collect(),
            parent: p.parent,
            attrs: kept_attrs(p.el),
            signature: p.signature,
            features: features_of(p.el),
            repeated_children,
        })
    }
}

/// Convenience: parse and collect all blocks of a page.
pub fn extract_blocks(page: &RawPage) -> Result<Vec<ContentBlock>, ParseError> {
    let parsed = BlockExtractor::parse(page)?;
    let blocks = parsed.blocks().collect();
    Ok(blocks)
}

// --- segmentation rules ---

pub(crate) fn is_excluded(el: &ElementRef<'_>) -> bool {
    let v = el.value();
    let name = v.name();
    if EXCLUDED_TAGS.contains(&name) {
        return true;
    }
    if v.attr("role").is_some_and(|r| r.eq_ignore_ascii_case("navigation"))
        || v.attr("aria-hidden").is_some_and(|a| a.eq_ignore_ascii_case("true"))
        || v.attr("hidden").is_some()
    {
        return true;
    }
    let markers = [v.attr("class"), v.attr("id")];
    markers.iter().flatten().any(|m| {
        let lower = m.to_ascii_lowercase();
        NOISE_SUBSTRINGS.iter().any(|n| lower.contains(n))
            || lower
                .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
                .any(|tok| NOISE_TOKENS.contains(&tok))
    })
}

fn is_leaf(tag: &str) -> bool {
    LEAF_TAGS.contains(&tag)
}

fn is_container(tag: &str) -> bool {
    CONTAINER_TAGS.contains(&tag) || tag.contains('-')
}

fn is_block_level(tag: &str) -> bool {
    is_leaf(tag) || is_container(tag) || TRANSPARENT_TAGS.contains(&tag) || tag == "br"
}

fn path_step(el: ElementRef<'_>) -> String {
    let v = el.value();
    let mut step = v.name().to_string();
    if let Some(id) = v.attr("id") {
        step.push('#');
        step.push_str(id);
    } else if let Some(class) = v.attr("class").and_then(|c| c.split_whitespace().next()) {
        step.push('.');
        step.push_str(class);
    }
    step
}

fn join_path(base: &str, el: ElementRef<'_>) -> String {
    let step = path_step(el);
    if base.is_empty() {
        step
    } else {
        format!("{base} > {step}")
    }
}

/// Nearest meaningful descendants of `el`, with their paths, in document order.
fn meaningful_children<'a>(el: ElementRef<'a>, base: &str) -> Vec<(ElementRef<'a>, String)> {
    let mut out = Vec::new();
    for child in el.children().filter_map(ElementRef::wrap) {
        if is_excluded(&child) {
            continue;
        }
        let path = join_path(base, child);
        let tag = child.value().name();

        if is_leaf(tag) {
            if !is_empty_leaf(child) {
                out.push((child, path));
            }
        } else if is_container(tag) {
            out.extend(collapse_container(child, path));
        } else {
            // transparent roots and inline wrappers
            out.extend(meaningful_children(child, &path));
        }
    }
    out
}

/// A container is kept unless it is empty or a pure wrapper around a single block.
fn collapse_container<'a>(el: ElementRef<'a>, path: String) -> Vec<(ElementRef<'a>, String)> {
    let inner = meaningful_children(el, &path);
    // Inputs are not blocks, so a form is its own block whatever it wraps.
    if el.value().name() == "form" && (has_inputs(el) || !inner.is_empty()) {
        return vec![(el, path)];
    }
    let has_own_text = !direct_text(el).trim().is_empty();
    match inner.len() {
        0 if !has_own_text && background_image(el).is_none() => Vec::new(),
        1 if !has_own_text => inner,
        _ => vec![(el, path)],
    }
}

fn has_inputs(el: ElementRef<'_>) -> bool {
    descendants(el)
        .iter()
        .any(|d| matches!(d.value().name(), "input" | "select" | "textarea"))
}

fn is_empty_leaf(el: ElementRef<'_>) -> bool {
    if el.value().name() == "img" {
        return image_src(el).is_none();
    }
    block_text(el).is_empty() && first_image(el).is_none()
}

/// Text that belongs to `el` itself: direct text nodes and inline descendants.
fn direct_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    for child in el.children() {
        if let Some(t) = child.value().as_text() {
            out.push_str(t);
        } else if let Some(c) = ElementRef::wrap(child) {
            if is_excluded(&c) || is_block_level(c.value().name()) {
                continue;
            }
            if c.value().name() == "img" {
                continue;
            }
            if meaningful_children(c, "").is_empty() {
                out.push_str(&direct_text(c));
            }
        }
    }
    out
}

/// Normalized visible text of the subtree, block-level boundaries become spaces.
fn block_text(el: ElementRef<'_>) -> String {
    fn walk(el: ElementRef<'_>, out: &mut String) {
        for child in el.children() {
            if let Some(t) = child.value().as_text() {
                out.push_str(t);
            } else if let Some(c) = ElementRef::wrap(child) {
                if is_excluded(&c) {
                    continue;
                }
                let spaced = is_block_level(c.value().name());
                if spaced {
                    out.push(' ');
                }
                walk(c, out);
                if spaced {
                    out.push(' ');
                }
            }
        }
    }
    let mut raw = String::new();
    walk(el, &mut raw);
    normalize_text(&raw)
}

fn image_src(el: ElementRef<'_>) -> Option<String> {
    let v = el.value();
    ["src", "data-src", "data-lazy-src"]
        .iter()
        .find_map(|k| v.attr(k))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn background_image(el: ElementRef<'_>) -> Option<String> {
    el.value()
        .attr("style")
        .and_then(|s| RE_BG_URL.captures(s))
        .map(|c| c[1].trim().to_string())
}

fn descendants<'a>(el: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    fn walk<'a>(el: ElementRef<'a>, out: &mut Vec<ElementRef<'a>>) {
        for c in el.children().filter_map(ElementRef::wrap) {
            if is_excluded(&c) {
                continue;
            }
            out.push(c);
            walk(c, out);
        }
    }
    let mut out = vec![el];
    walk(el, &mut out);
    out
}

fn first_image(el: ElementRef<'_>) -> Option<String> {
    descendants(el)
        .into_iter()
        .filter(|d| d.value().name() == "img")
        .find_map(image_src)
}

fn kept_attrs(el: ElementRef<'_>) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    for (k, v) in el.value().attrs() {
        let k = k.to_ascii_lowercase();
        if KEPT_ATTRS.contains(&k.as_str()) || k.starts_with("data-") {
            let v: String = v.trim().chars().take(MAX_ATTR_LEN).collect();
            attrs.insert(k, v);
        }
    }
    if let Some(bg) = background_image(el) {
        attrs.insert("background_image".to_string(), bg);
    }
    attrs
}

fn features_of(el: ElementRef<'_>) -> BlockFeatures {
    let mut f = BlockFeatures::default();
    for d in descendants(el) {
        let v = d.value();
        match v.name() {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let t = block_text(d);
                if !t.is_empty() && f.headings.len() < MAX_HEADINGS {
                    f.headings.push(t);
                }
            }
            "p" => {
                let t = block_text(d);
                if !t.is_empty() && f.paragraphs.len() < MAX_PARAGRAPHS {
                    f.paragraphs.push(t);
                }
            }
            "a" => {
                if let Some(href) = v.attr("href").map(str::trim).filter(|h| !h.is_empty()) {
                    f.link_count += 1;
                    if f.links.len() < MAX_LINKS {
                        f.links.push(Link {
                            text: block_text(d),
                            href: href.to_string(),
                        });
                    }
                }
            }
            "img" => {
                if let Some(src) = image_src(d) {
                    f.image_count += 1;
                    if f.images.len() < MAX_IMAGES {
                        f.images.push(Image {
                            src,
                            alt: v.attr("alt").unwrap_or_default().trim().to_string(),
                        });
                    }
                }
            }
            "input" | "select" | "textarea" => {
                let kind = v.attr("type").unwrap_or(v.name()).to_ascii_lowercase();
                if kind != "hidden" && f.inputs.len() < MAX_INPUTS {
                    f.inputs.push(FormInput {
                        kind,
                        name: v.attr("name").unwrap_or_default().to_string(),
                        placeholder: v.attr("placeholder").unwrap_or_default().to_string(),
                        required: v.attr("required").is_some(),
                    });
                }
            }
            "form" if f.form_action.is_none() => {
                f.form_action = Some(v.attr("action").unwrap_or_default().trim().to_string());
                f.form_method = Some(v.attr("method").unwrap_or("get").trim().to_ascii_lowercase());
            }
            "li" => {
                let t = block_text(d);
                if !t.is_empty() && f.list_items.len() < MAX_LIST_ITEMS {
                    f.list_items.push(t);
                }
            }
            _ => {}
        }
    }
    f.word_count = block_text(el).split_whitespace().count();
    f
}

/// Size of the largest group of sibling signatures with the same shape.
fn largest_shape_group<'s>(sigs: impl Iterator<Item = &'s StructuralSignature>) -> usize {
    let mut groups: HashMap<(&str, usize), usize> = HashMap::new();
    for s in sigs {
        *groups.entry((s.digest.as_str(), s.child_count)).or_default() += 1;
    }
    groups.values().copied().max().unwrap_or(0)
}
