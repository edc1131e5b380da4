//! Structural signatures: text-free fingerprints of a block's shape.
//!
//! The shape string is built recursively as `tag[attr-keys|class-tokens](children…)`.
//! Class tokens are lower-cased with digits stripped so `item-1` and `item-2`
//! compare equal. Free text only contributes through the coarse `length_band`,
//! which is context for the classifier and never part of a structural match.

use scraper::ElementRef;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Recursion cap for the shape string.
const MAX_DEPTH: usize = 6;

/// Upper bounds (chars, inclusive) of the text-length bands 0..=3; longer is band 4.
const LENGTH_BANDS: [usize; 4] = [16, 64, 256, 1024];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructuralSignature {
    /// Hex prefix of SHA-256 over the shape string.
    pub digest: String,
    pub child_count: usize,
    pub attr_keys: BTreeSet<String>,
    pub length_band: u8,
}

impl StructuralSignature {
    /// Signature of `el`, skipping descendants for which `skip` returns true.
    pub fn of_element(el: ElementRef<'_>, text_len: usize, skip: fn(&ElementRef<'_>) -> bool) -> Self {
        let mut shape = String::new();
        write_shape(el, 0, skip, &mut shape);
        let child_count = el
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| !skip(c))
            .count();
        let attr_keys = el
            .value()
            .attrs()
            .map(|(k, _)| k.to_ascii_lowercase())
            .collect();
        Self::from_parts(&shape, child_count, attr_keys, text_len)
    }

    pub fn from_parts(
        shape: &str,
        child_count: usize,
        attr_keys: BTreeSet<String>,
        text_len: usize,
    ) -> Self {
        Self {
            digest: shape_digest(shape),
            child_count,
            attr_keys,
            length_band: length_band(text_len),
        }
    }

    /// Exact structural match: same shape, same child count, same attribute keys.
    /// Text length is ignored.
    pub fn same_shape(&self, other: &StructuralSignature) -> bool {
        self.digest == other.digest
            && self.child_count == other.child_count
            && self.attr_keys == other.attr_keys
    }
}

pub fn length_band(text_len: usize) -> u8 {
    LENGTH_BANDS
        .iter()
        .position(|&max| text_len <= max)
        .unwrap_or(LENGTH_BANDS.len()) as u8
}

pub fn shape_digest(shape: &str) -> String {
    let digest = Sha256::digest(shape.as_bytes());
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// `Card-3 card--featured` -> `card`, `card--featured`.
pub fn class_tokens(class_attr: &str) -> BTreeSet<String> {
    class_attr
        .split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| !c.is_ascii_digit())
                .collect::<String>()
                .to_ascii_lowercase()
                .trim_matches(|c| c == '-' || c == '_')
                .to_string()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

fn write_shape(el: ElementRef<'_>, depth: usize, skip: fn(&ElementRef<'_>) -> bool, out: &mut String) {
    let v = el.value();
    out.push_str(v.name());
    out.push('[');
    let keys: BTreeSet<String> = v.attrs().map(|(k, _)| k.to_ascii_lowercase()).collect();
    out.push_str(&keys.into_iter().collect::<Vec<_>>().join(","));
    out.push('|');
    let classes = v.attr("class").map(class_tokens).unwrap_or_default();
    out.push_str(&classes.into_iter().collect::<Vec<_>>().join("."));
    out.push(']');

    if depth >= MAX_DEPTH {
        out.push_str("(…)");
        return;
    }
    let mut first = true;
    for child in el.children().filter_map(ElementRef::wrap) {
        if skip(&child) {
            continue;
        }
        out.push(if first { '(' } else { ' ' });
        first = false;
        write_shape(child, depth + 1, skip, out);
    }
    if !first {
        out.push(')');
    }
}
