//! Heuristic component detection: a fixed, ordered rule table over block features.
//!
//! Rules are evaluated top to bottom and the first match wins:
//! form, headline, quote, gallery, list, teaser, banner, card, article,
//! short text leaf (headline), paragraph, image.
//! No match yields `unknown` with confidence 0.0 and no fields.
//!
//! Phrase checks are case- and whitespace-insensitive. Detection is a pure
//! function of the block, so the same block always gets the same answer.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::model::{ContentBlock, FieldValue, UNKNOWN};

/// Every label the rule table can produce (besides `unknown`).
pub const KNOWN_LABELS: &[&str] = &[
    "form",
    "headline",
    "quote",
    "gallery",
    "list",
    "teaser",
    "banner",
    "card",
    "article",
    "paragraph",
    "image",
];

const DESCRIPTION_MAX_CHARS: usize = 200;
const HEADLINE_MAX_WORDS: usize = 15;
const PARAGRAPH_MIN_WORDS: usize = 5;

static RE_PRICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[$€£¥]\s?(\d{1,3}(?:[,.]\d{3})*(?:[.,]\d{1,2})?))|(?:(\d+(?:[.,]\d{1,2})?)\s?(?:USD|EUR|GBP|Kč|CZK))")
        .expect("price regex")
});
static RE_BYLINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bby\s+([A-Z][\w.'-]+(?:\s+[A-Z][\w.'-]+){0,3})").expect("byline regex")
});
static RE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{4}-\d{2}-\d{2}|(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},?\s+\d{4}|\d{1,2}\.\s?\d{1,2}\.\s?\d{4})\b",
    )
    .expect("date regex")
});
static RE_ATTRIBUTED_QUOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^"(.{3,}?)"\s*(?:[-–—]\s*|,\s*said\s+)?(.*)$"#).expect("quote regex")
});

/// Outcome of the rule table for one block.
#[derive(Debug, Clone, PartialEq)]
pub struct Heuristic {
    pub label: String,
    pub confidence: f32,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Heuristic {
    pub fn unknown() -> Self {
        Self {
            label: UNKNOWN.to_string(),
            confidence: 0.0,
            fields: BTreeMap::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN
    }
}

/// Everything the rules look at, computed once per block.
struct Probe<'a> {
    block: &'a ContentBlock,
    text: String,
    markers: String,
    words: usize,
}

impl<'a> Probe<'a> {
    fn new(block: &'a ContentBlock) -> Self {
        let markers = [block.attrs.get("class"), block.attrs.get("id")]
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            block,
            text: normalize(&block.text),
            markers: normalize(&markers),
            words: block.features.word_count,
        }
    }

    fn marker(&self, tokens: &[&str]) -> bool {
        tokens.iter().any(|t| self.markers.contains(t))
    }

    fn phrase(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|p| contains(&self.text, p))
    }

    fn tag(&self) -> &str {
        self.block.tag.as_str()
    }

    fn has_image(&self) -> bool {
        self.block.features.image_count > 0 || self.block.attrs.contains_key("background_image")
    }

    fn has_link(&self) -> bool {
        self.block.features.link_count > 0 || self.block.attrs.contains_key("href")
    }

    fn has_heading(&self) -> bool {
        !self.block.features.headings.is_empty()
    }
}

type Check = fn(&Probe<'_>) -> Option<f32>;
type Extract = fn(&Probe<'_>, &mut BTreeMap<String, FieldValue>);

struct Rule {
    label: &'static str,
    check: Check,
    extract: Extract,
}

/// Priority order. Changing it changes labels for the whole corpus.
static RULES: &[Rule] = &[
    Rule { label: "form", check: is_form, extract: form_fields },
    Rule { label: "headline", check: is_headline, extract: headline_fields },
    Rule { label: "quote", check: is_quote, extract: quote_fields },
    Rule { label: "gallery", check: is_gallery, extract: gallery_fields },
    Rule { label: "list", check: is_list, extract: list_fields },
    Rule { label: "teaser", check: is_teaser, extract: teaser_fields },
    Rule { label: "banner", check: is_banner, extract: banner_fields },
    Rule { label: "card", check: is_card, extract: card_fields },
    Rule { label: "article", check: is_article, extract: article_fields },
    Rule { label: "headline", check: is_short_leaf, extract: headline_fields },
    Rule { label: "paragraph", check: is_paragraph, extract: paragraph_fields },
    Rule { label: "image", check: is_image, extract: image_fields },
];

/// Stateless detector over the fixed rule table.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicDetector;

impl HeuristicDetector {
    pub fn detect(&self, block: &ContentBlock) -> Heuristic {
        detect(block)
    }
}

/// Apply the rule table to one block.
pub fn detect(block: &ContentBlock) -> Heuristic {
    let probe = Probe::new(block);
    for rule in RULES {
        if let Some(confidence) = (rule.check)(&probe) {
            let mut fields = BTreeMap::new();
            (rule.extract)(&probe, &mut fields);
            price_field(&probe, &mut fields);
            fields.retain(|_, v| !v.is_empty());
            return Heuristic {
                label: rule.label.to_string(),
                confidence: confidence.clamp(0.0, 1.0),
                fields,
            };
        }
    }
    Heuristic::unknown()
}

// --- checks ---

fn is_form(p: &Probe<'_>) -> Option<f32> {
    let f = &p.block.features;
    // Loose inputs only count when no form element encloses them.
    let loose_inputs = f.form_action.is_none() && !f.inputs.is_empty();
    (p.tag() == "form" || loose_inputs).then_some(0.9)
}

fn is_headline(p: &Probe<'_>) -> Option<f32> {
    if p.text.is_empty() {
        return None;
    }
    match p.tag() {
        "h1" | "h2" | "h3" => return Some(0.85),
        "h4" | "h5" | "h6" => return Some(0.8),
        _ => {}
    }
    if !p.block.children.is_empty() || p.words > HEADLINE_MAX_WORDS {
        return None;
    }
    p.marker(&["headline", "title", "heading"]).then_some(0.8)
}

/// Unmarked short text leaf, checked after the richer rules.
fn is_short_leaf(p: &Probe<'_>) -> Option<f32> {
    if p.text.is_empty() || !p.block.children.is_empty() || p.words > HEADLINE_MAX_WORDS {
        return None;
    }
    // `p` markup keeps its paragraphs.
    let text_only = !p.has_image() && p.block.features.list_items.is_empty();
    let prose = p.tag() == "p" && p.words >= PARAGRAPH_MIN_WORDS;
    (text_only && !prose).then_some(0.7)
}

fn is_quote(p: &Probe<'_>) -> Option<f32> {
    if p.tag() == "blockquote" || p.marker(&["quote", "testimonial"]) {
        return Some(0.8);
    }
    let attributed = RE_ATTRIBUTED_QUOTE
        .captures(&p.block.text)
        .is_some_and(|c| !c[2].trim().is_empty());
    if attributed || (p.block.text.starts_with('"') && p.phrase(&["said", "says"])) {
        return Some(0.6);
    }
    None
}

fn is_gallery(p: &Probe<'_>) -> Option<f32> {
    let images = p.block.features.image_count;
    if images < 3 {
        return None;
    }
    if p.marker(&["gallery", "carousel", "slideshow", "slider"]) {
        Some(0.85)
    } else if p.words <= images * 15 {
        Some(0.7)
    } else {
        None
    }
}

fn is_list(p: &Probe<'_>) -> Option<f32> {
    let list_tag = matches!(p.tag(), "ul" | "ol") && p.block.features.list_items.len() >= 3;
    (p.block.repeated_children >= 3 || list_tag).then_some(0.85)
}

fn is_teaser(p: &Probe<'_>) -> Option<f32> {
    if p.marker(&["teaser", "preview"]) {
        return Some(0.8);
    }
    let complete = p.has_image() && p.has_link() && p.has_heading() && (20..=100).contains(&p.words);
    if complete && p.phrase(&["read more", "continue", "learn more", "discover"]) {
        Some(0.75)
    } else if complete {
        Some(0.65)
    } else {
        None
    }
}

fn is_banner(p: &Probe<'_>) -> Option<f32> {
    if p.marker(&["banner", "hero", "promo", "jumbotron"]) {
        return Some(0.75);
    }
    let promotional = p.phrase(&[
        "special", "offer", "limited", "exclusive", "promotion", "discount", "save ", "deal",
    ]);
    (promotional && p.has_link() && p.words <= 40).then_some(0.6)
}

fn is_card(p: &Probe<'_>) -> Option<f32> {
    if p.marker(&["card", "tile"]) {
        return Some(0.75);
    }
    (p.has_image() && p.has_heading() && p.words <= 60).then_some(0.65)
}

fn is_article(p: &Probe<'_>) -> Option<f32> {
    let f = &p.block.features;
    if p.words >= 100 && p.has_heading() && f.paragraphs.len() >= 2 {
        Some(if p.tag() == "article" { 0.85 } else { 0.8 })
    } else {
        None
    }
}

fn is_paragraph(p: &Probe<'_>) -> Option<f32> {
    let plain = p.tag() == "p" || (p.block.children.is_empty() && !p.has_image());
    (plain && p.words >= PARAGRAPH_MIN_WORDS).then_some(0.6)
}

fn is_image(p: &Probe<'_>) -> Option<f32> {
    let f = &p.block.features;
    if p.tag() == "img" || (f.image_count == 1 && p.words <= 3) {
        Some(0.7)
    } else {
        None
    }
}

// --- field extraction ---

fn text(s: impl Into<String>) -> FieldValue {
    FieldValue::Text(s.into())
}

fn set_title(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    if let Some(h) = p.block.features.headings.first() {
        out.insert("title".into(), text(h.clone()));
    }
}

fn set_description(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    let first = p
        .block
        .features
        .paragraphs
        .first()
        .cloned()
        .unwrap_or_default();
    let desc: String = first.chars().take(DESCRIPTION_MAX_CHARS).collect();
    out.insert("description".into(), text(desc));
}

fn set_image(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    let src = p
        .block
        .features
        .images
        .first()
        .map(|i| i.src.clone())
        .or_else(|| p.block.attrs.get("background_image").cloned());
    if let Some(src) = src {
        out.insert("image".into(), FieldValue::Reference(src));
    }
}

fn set_link(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    let href = p
        .block
        .features
        .links
        .first()
        .map(|l| l.href.clone())
        .or_else(|| p.block.attrs.get("href").cloned());
    if let Some(href) = href {
        out.insert("link".into(), FieldValue::Reference(href));
    }
}

fn price_field(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    if out.contains_key("price") {
        return;
    }
    if let Some(n) = parse_price(&p.block.text) {
        out.insert("price".into(), FieldValue::Number(n));
    }
}

/// First currency amount in `s`, e.g. `$1,299.00` -> 1299.0.
pub fn parse_price(s: &str) -> Option<f64> {
    let caps = RE_PRICE.captures(s)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
    parse_number(raw)
}

/// Lenient number parsing: thousands separators and decimal commas.
pub fn parse_number(raw: &str) -> Option<f64> {
    let s: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if s.is_empty() {
        return None;
    }
    let cleaned = match (s.rfind('.'), s.rfind(',')) {
        // 1,299.50
        (Some(d), Some(c)) if d > c => s.replace(',', ""),
        // 1.299,50
        (Some(_), Some(_)) => s.replace('.', "").replace(',', "."),
        // 12,50 vs 1,299
        (None, Some(c)) if s.len() - c - 1 == 3 => s.replace(',', ""),
        (None, Some(_)) => s.replace(',', "."),
        _ => s,
    };
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn form_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    let f = &p.block.features;
    if let Some(action) = &f.form_action {
        out.insert("action".into(), FieldValue::Reference(action.clone()));
    }
    if let Some(method) = &f.form_method {
        out.insert("method".into(), FieldValue::Enum(method.clone()));
    }
    let inputs: Vec<String> = f
        .inputs
        .iter()
        .map(|i| {
            let name = if i.name.is_empty() { &i.placeholder } else { &i.name };
            let req = if i.required { " (required)" } else { "" };
            format!("{} {}{}", i.kind, name, req).trim().to_string()
        })
        .collect();
    out.insert("fields".into(), FieldValue::RichText(inputs.join("\n")));
}

fn headline_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    out.insert("headline_text".into(), text(p.block.text.clone()));
}

fn quote_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    match RE_ATTRIBUTED_QUOTE.captures(&p.block.text) {
        Some(c) => {
            out.insert("quote_text".into(), text(c[1].trim()));
            out.insert("author".into(), text(c[2].trim()));
        }
        None => {
            out.insert("quote_text".into(), text(p.block.text.clone()));
        }
    }
}

fn gallery_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    let images = &p.block.features.images;
    let srcs: Vec<&str> = images.iter().map(|i| i.src.as_str()).collect();
    let alts: Vec<&str> = images
        .iter()
        .map(|i| i.alt.as_str())
        .filter(|a| !a.is_empty())
        .collect();
    out.insert("images".into(), FieldValue::RichText(srcs.join("\n")));
    out.insert("captions".into(), FieldValue::RichText(alts.join("\n")));
}

fn list_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    let f = &p.block.features;
    let items = if !f.list_items.is_empty() {
        &f.list_items
    } else if !f.headings.is_empty() {
        &f.headings
    } else {
        &f.paragraphs
    };
    out.insert("items".into(), FieldValue::RichText(items.join("\n")));
}

fn teaser_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    set_title(p, out);
    set_description(p, out);
    set_image(p, out);
    set_link(p, out);
}

fn banner_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    let f = &p.block.features;
    let title = f
        .headings
        .first()
        .cloned()
        .unwrap_or_else(|| p.block.text.chars().take(80).collect());
    out.insert("title".into(), text(title));
    if let Some(cta) = f.links.first().filter(|l| !l.text.is_empty()) {
        out.insert("call_to_action".into(), text(cta.text.clone()));
    }
    set_link(p, out);
    set_image(p, out);
}

fn card_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    set_title(p, out);
    set_image(p, out);
    set_description(p, out);
    set_link(p, out);
}

fn article_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    set_title(p, out);
    let body = p.block.features.paragraphs.join("\n\n");
    out.insert("content".into(), FieldValue::RichText(body));
    if let Some(c) = RE_BYLINE.captures(&p.block.text) {
        out.insert("author".into(), text(c[1].trim()));
    }
    if let Some(c) = RE_DATE.captures(&p.block.text) {
        out.insert("publish_date".into(), text(c[1].trim()));
    }
}

fn paragraph_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    out.insert("body".into(), text(p.block.text.clone()));
}

fn image_fields(p: &Probe<'_>, out: &mut BTreeMap<String, FieldValue>) {
    let img = p.block.features.images.first();
    let src = img
        .map(|i| i.src.clone())
        .or_else(|| p.block.attrs.get("src").cloned());
    if let Some(src) = src {
        out.insert("image".into(), FieldValue::Reference(src));
    }
    let alt = img
        .map(|i| i.alt.clone())
        .or_else(|| p.block.attrs.get("alt").cloned())
        .unwrap_or_default();
    out.insert("alt".into(), text(alt));
}

// --- internals ---

fn contains(text: &str, pat: &str) -> bool {
    let p = normalize(pat);
    if p.is_empty() {
        return true;
    }
    text.contains(p.as_str())
}

/// Lower-case and condense whitespace.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.chars() {
        let lc = ch.to_lowercase();
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.extend(lc);
            last_space = false;
        }
    }
    out.trim().to_string()
}
