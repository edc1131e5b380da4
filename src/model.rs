//! model.rs — the records that flow between pipeline stages.
//!
//! Blocks and signatures live only for one run. Schemas, classification
//! results, component types and instances are handed to the store and the
//! file outputs, so their serde shape is part of the external contract.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::analyze::signature::StructuralSignature;

/// Label used when no rule or AI answer recognised the block.
pub const UNKNOWN: &str = "unknown";

/// Index of a block inside its page.
pub type BlockId = u32;

/// Corpus-wide reference to one block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    pub page_id: String,
    pub block_id: BlockId,
}

impl BlockKey {
    pub fn new(page_id: impl Into<String>, block_id: BlockId) -> Self {
        Self {
            page_id: page_id.into(),
            block_id,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.page_id, self.block_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub text: String,
    pub href: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub src: String,
    pub alt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormInput {
    /// `type` attribute, or the tag name for select/textarea.
    pub kind: String,
    pub name: String,
    pub placeholder: String,
    pub required: bool,
}

/// Structured content found anywhere in a block's subtree (capped lists).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockFeatures {
    pub headings: Vec<String>,
    pub paragraphs: Vec<String>,
    pub links: Vec<Link>,
    pub images: Vec<Image>,
    pub inputs: Vec<FormInput>,
    pub list_items: Vec<String>,
    pub form_action: Option<String>,
    pub form_method: Option<String>,
    pub word_count: usize,
    /// Total number of links/images before the lists were capped.
    pub link_count: usize,
    pub image_count: usize,
}

/// A meaningful subtree of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: BlockId,
    pub page_id: String,
    /// CSS-like path from the document root, e.g. `body > div.hero > h1`.
    pub path: String,
    pub tag: String,
    pub text: String,
    pub children: Vec<BlockId>,
    pub parent: Option<BlockId>,
    pub attrs: BTreeMap<String, String>,
    pub signature: StructuralSignature,
    pub features: BlockFeatures,
    /// Size of the largest group of child blocks sharing one signature.
    pub repeated_children: usize,
}

impl ContentBlock {
    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.page_id.clone(), self.id)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attrs
            .get("class")
            .map(|c| c.split_whitespace())
            .into_iter()
            .flatten()
    }
}

/// Declared schema field types, in priority order (later wins a tie).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    Text,
    Number,
    Boolean,
    Enum,
    Reference,
    RichText,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Text,
        DataType::Number,
        DataType::Boolean,
        DataType::Enum,
        DataType::Reference,
        DataType::RichText,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Enum => "enum",
            DataType::Reference => "reference",
            DataType::RichText => "rich-text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        DataType::ALL
            .into_iter()
            .find(|t| t.as_str() == norm)
            .or(match norm.as_str() {
                "string" | "str" => Some(DataType::Text),
                "int" | "integer" | "float" | "decimal" => Some(DataType::Number),
                "bool" => Some(DataType::Boolean),
                "url" | "link" | "file" | "image" => Some(DataType::Reference),
                "html" | "richtext" | "markdown" => Some(DataType::RichText),
                _ => None,
            })
    }
}

/// Typed field value. Untyped AI payloads are converted into this at the
/// classifier boundary and never travel further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    Enum(String),
    Reference(String),
    RichText(String),
}

impl FieldValue {
    pub fn data_type(&self) -> DataType {
        match self {
            FieldValue::Text(_) => DataType::Text,
            FieldValue::Number(_) => DataType::Number,
            FieldValue::Boolean(_) => DataType::Boolean,
            FieldValue::Enum(_) => DataType::Enum,
            FieldValue::Reference(_) => DataType::Reference,
            FieldValue::RichText(_) => DataType::RichText,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s)
            | FieldValue::Enum(s)
            | FieldValue::Reference(s)
            | FieldValue::RichText(s) => s.trim().is_empty(),
            FieldValue::Number(n) => !n.is_finite(),
            FieldValue::Boolean(_) => false,
        }
    }

    /// Plain-text rendering, used for coercion and enum value sets.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::Text(s)
            | FieldValue::Enum(s)
            | FieldValue::Reference(s)
            | FieldValue::RichText(s) => s.clone(),
            FieldValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            FieldValue::Boolean(b) => b.to_string(),
        }
    }
}

/// How the final label of a block was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassificationSource {
    HeuristicOnly,
    AiConfirmed,
    AiOverridden,
    HeuristicFallback,
}

/// Per-block classifier output. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub page_id: String,
    pub block_id: BlockId,
    /// Final component-type uid, `unknown` when unassigned.
    pub component_uid: String,
    pub label: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub confidence: f32,
    pub source: ClassificationSource,
    pub cluster_id: usize,
}

impl ClassificationResult {
    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.page_id.clone(), self.block_id)
    }

    pub fn is_unknown(&self) -> bool {
        self.component_uid == UNKNOWN
    }
}

/// A named cluster of interchangeable blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentType {
    pub cluster_id: usize,
    pub title: String,
    pub uid: String,
    pub members: Vec<BlockKey>,
    /// Members whose final label stayed `unknown`; taken on by the cluster only.
    #[serde(default)]
    pub adopted: Vec<BlockKey>,
    pub confidence: f32,
    /// Single-member cluster; not reusable unless confirmed.
    pub unique: bool,
    /// Title agreed by classifier consensus.
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiline: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_upload: Option<bool>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<EnumOption>>,
}

impl FieldMetadata {
    pub fn is_empty(&self) -> bool {
        self.multiline.is_none() && self.allow_upload.is_none() && self.enum_values.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub uid: String,
    pub data_type: DataType,
    pub display_name: String,
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "FieldMetadata::is_empty")]
    pub field_metadata: FieldMetadata,
}

impl Field {
    /// Allowed values of an enum field (lower-cased), empty otherwise.
    pub fn enum_values(&self) -> Vec<&str> {
        self.field_metadata
            .enum_values
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|o| o.value.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaOptions {
    pub singleton: bool,
    pub is_page: bool,
    /// uid of the field used as the entry title.
    pub title: String,
}

/// Canonical CMS definition of one component type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSchema {
    pub title: String,
    pub uid: String,
    #[serde(rename = "schema")]
    pub fields: Vec<Field>,
    pub options: SchemaOptions,
    pub description: String,
}

impl ComponentSchema {
    pub fn field(&self, uid: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.uid == uid)
    }

    pub fn mandatory_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.mandatory)
    }
}

/// One concrete occurrence of a schema on a page. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentInstance {
    pub uid: String,
    pub schema_uid: String,
    pub page_id: String,
    pub block_id: BlockId,
    pub fields: BTreeMap<String, FieldValue>,
    pub confidence: f32,
    pub incomplete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_mandatory: Vec<String>,
    /// Fields kept as text because they could not be coerced to the declared type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uncoerced: Vec<String>,
}

/// Lower-case, `_`-separated identifier. Empty input yields `field`.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_sep = true;
    for ch in input.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        return "field".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "f_");
    }
    out
}

/// Stable component uid derived from a working title.
/// Generic cluster titles (`component_<n>`) are already uids.
pub fn component_uid(title: &str) -> String {
    if title == UNKNOWN {
        return UNKNOWN.to_string();
    }
    let s = slug(title);
    if s.ends_with("_component") || s.starts_with("component_") {
        s
    } else {
        format!("{s}_component")
    }
}

/// `hero_title` -> `Hero Title`.
pub fn display_name(uid: &str) -> String {
    uid.split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut cs = w.chars();
            match cs.next() {
                Some(first) => first.to_uppercase().chain(cs).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
