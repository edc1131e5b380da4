//! Schema synthesis: one canonical `ComponentSchema` per final component uid.
//!
//! Runs once, after every block of the corpus has been classified. Field
//! types are decided by majority vote with a fixed priority order for ties;
//! incompatible observations are resolved the same way and recorded.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::SchemaConflict;
use crate::model::{
    display_name, slug, BlockKey, ClassificationResult, ComponentSchema, DataType, EnumOption,
    Field, FieldMetadata, FieldValue, SchemaOptions,
};

/// Fields that make a good entry title, in preference order.
pub const TITLE_FIELDS: &[&str] = &["title", "headline", "headline_text", "heading", "name"];
const MAX_FIELD_UID_LEN: usize = 50;
const IS_PAGE_TEXT_SHARE: f32 = 0.8;
const IS_PAGE_MIN_WORDS: f32 = 50.0;

static RE_FIELD_UID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("field uid regex"));

#[derive(Debug, Clone, Copy)]
pub struct SchemaSettings {
    pub mandatory_ratio: f32,
    pub enum_cap: usize,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            mandatory_ratio: 0.9,
            enum_cap: 10,
        }
    }
}

/// Per-block facts needed for the page-level options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockStats {
    pub is_root: bool,
    pub text_len: usize,
    pub word_count: usize,
}

/// Corpus-level signals for `singleton` / `is_page`.
#[derive(Debug, Clone, Default)]
pub struct CorpusStats {
    /// Every successfully parsed page, with its total visible text length.
    pub page_text_len: BTreeMap<String, usize>,
    pub blocks: HashMap<BlockKey, BlockStats>,
}

impl CorpusStats {
    pub fn page_count(&self) -> usize {
        self.page_text_len.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SynthesisOutput {
    pub schemas: Vec<ComponentSchema>,
    pub conflicts: Vec<SchemaConflict>,
    /// Reusable uids whose members carried no fields at all.
    pub fieldless: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaSynthesizer {
    settings: SchemaSettings,
    /// When set, only these component uids get a schema.
    reusable: Option<BTreeSet<String>>,
}

/// Field observations for one schema, in first-seen order.
#[derive(Default)]
struct FieldTally {
    order: Vec<String>,
    types: HashMap<String, BTreeMap<DataType, usize>>,
    present: HashMap<String, usize>,
    values: HashMap<String, BTreeSet<String>>,
}

impl FieldTally {
    fn observe(&mut self, uid: &str, value: &FieldValue) {
        if !self.types.contains_key(uid) {
            self.order.push(uid.to_string());
        }
        *self
            .types
            .entry(uid.to_string())
            .or_default()
            .entry(value.data_type())
            .or_default() += 1;
        if !value.is_empty() {
            *self.present.entry(uid.to_string()).or_default() += 1;
            self.values
                .entry(uid.to_string())
                .or_default()
                .insert(value.to_text().trim().to_lowercase());
        }
    }
}

impl SchemaSynthesizer {
    pub fn new(settings: SchemaSettings) -> Self {
        Self {
            settings,
            reusable: None,
        }
    }

    /// Restrict synthesis to the uids of reusable component types.
    pub fn with_reusable(mut self, uids: impl IntoIterator<Item = String>) -> Self {
        self.reusable = Some(uids.into_iter().collect());
        self
    }

    fn admits(&self, r: &ClassificationResult) -> bool {
        !r.is_unknown()
            && self
                .reusable
                .as_ref()
                .map_or(true, |uids| uids.contains(&r.component_uid))
    }

    /// Build one schema per admitted component uid, in first-seen order.
    /// A uid whose members carry no fields gets no schema.
    pub fn synthesize(
        &self,
        results: &[ClassificationResult],
        corpus: &CorpusStats,
    ) -> SynthesisOutput {
        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<&ClassificationResult>> = HashMap::new();
        for r in results.iter().filter(|r| self.admits(r)) {
            let uid = r.component_uid.as_str();
            groups
                .entry(uid)
                .or_insert_with(|| {
                    order.push(uid);
                    Vec::new()
                })
                .push(r);
        }

        let mut out = SynthesisOutput::default();
        for uid in order {
            let members = &groups[uid];
            let schema = self.synthesize_one(uid, members, corpus, &mut out.conflicts);
            if schema.fields.is_empty() {
                tracing::warn!(
                    target: "schema",
                    %uid,
                    members = members.len(),
                    "no fields observed; schema skipped"
                );
                out.fieldless.push(uid.to_string());
                continue;
            }
            tracing::debug!(
                target: "schema",
                uid = %schema.uid,
                fields = schema.fields.len(),
                members = members.len(),
                "schema synthesized"
            );
            out.schemas.push(schema);
        }
        out
    }

    fn synthesize_one(
        &self,
        uid: &str,
        members: &[&ClassificationResult],
        corpus: &CorpusStats,
        conflicts: &mut Vec<SchemaConflict>,
    ) -> ComponentSchema {
        let label = members
            .first()
            .map(|r| r.label.as_str())
            .unwrap_or(uid);

        let mut tally = FieldTally::default();
        for r in members {
            // A renamed uid may collide with an existing one; the first value wins.
            let mut seen = BTreeSet::new();
            for (name, value) in &r.fields {
                let field_uid = field_uid(name);
                if seen.insert(field_uid.clone()) {
                    tally.observe(&field_uid, value);
                }
            }
        }

        let n = members.len().max(1) as f32;
        let mut fields: Vec<Field> = tally
            .order
            .iter()
            .map(|f| {
                let observed = &tally.types[f];
                let mut data_type = resolve_type(observed);
                if let Some(conflict) = conflict_for(uid, f, observed, data_type) {
                    tracing::warn!(target: "schema", %conflict, "field type conflict resolved");
                    conflicts.push(conflict);
                }
                let present = tally.present.get(f).copied().unwrap_or(0) as f32;
                let mandatory = present + f32::EPSILON >= self.settings.mandatory_ratio * n;

                let mut field_metadata = FieldMetadata::default();
                match data_type {
                    DataType::Enum => {
                        let values = tally.values.get(f).cloned().unwrap_or_default();
                        if values.len() < self.settings.enum_cap {
                            field_metadata.enum_values = Some(
                                values
                                    .into_iter()
                                    .map(|v| EnumOption {
                                        label: display_name(&v),
                                        value: v,
                                    })
                                    .collect(),
                            );
                        } else {
                            data_type = DataType::Text;
                        }
                    }
                    DataType::RichText => field_metadata.multiline = Some(true),
                    DataType::Reference if is_media_name(f) => {
                        field_metadata.allow_upload = Some(true)
                    }
                    _ => {}
                }

                Field {
                    uid: f.clone(),
                    data_type,
                    display_name: display_name(f),
                    mandatory,
                    field_metadata,
                }
            })
            .collect();

        // Title-like fields first, otherwise first-seen order.
        fields.sort_by_key(|f| {
            TITLE_FIELDS
                .iter()
                .position(|t| *t == f.uid)
                .unwrap_or(TITLE_FIELDS.len())
        });

        let options = infer_options(members, corpus, &fields);
        let pages: BTreeSet<&str> = members.iter().map(|r| r.page_id.as_str()).collect();
        let description = describe(label, pages.len(), &fields);

        ComponentSchema {
            title: display_name(label),
            uid: uid.to_string(),
            fields,
            options,
            description,
        }
    }
}

/// Most frequent type; ties go to the type ranked later in priority order.
pub fn resolve_type(observed: &BTreeMap<DataType, usize>) -> DataType {
    observed
        .iter()
        .max_by(|(t1, n1), (t2, n2)| n1.cmp(n2).then(t1.cmp(t2)))
        .map(|(t, _)| *t)
        .unwrap_or(DataType::Text)
}

/// Pairs that are different spellings of free text rather than a conflict.
pub fn compatible(a: DataType, b: DataType) -> bool {
    use DataType::*;
    a == b || matches!((a, b), (Text, RichText) | (RichText, Text) | (Text, Enum) | (Enum, Text))
}

fn conflict_for(
    schema_uid: &str,
    field: &str,
    observed: &BTreeMap<DataType, usize>,
    resolved: DataType,
) -> Option<SchemaConflict> {
    let types: Vec<DataType> = observed.keys().copied().collect();
    let clash = types
        .iter()
        .enumerate()
        .any(|(i, a)| types[i + 1..].iter().any(|b| !compatible(*a, *b)));
    clash.then(|| SchemaConflict {
        schema_uid: schema_uid.to_string(),
        field: field.to_string(),
        observed: types,
        resolved,
    })
}

/// Valid field uids pass through; anything else is slugged and truncated.
pub fn field_uid(name: &str) -> String {
    if name.len() <= MAX_FIELD_UID_LEN && RE_FIELD_UID.is_match(name) {
        return name.to_string();
    }
    let mut s = slug(name);
    s.truncate(MAX_FIELD_UID_LEN);
    s.trim_end_matches('_').to_string()
}

fn is_media_name(uid: &str) -> bool {
    ["image", "img", "photo", "images", "file"]
        .iter()
        .any(|k| uid == *k || uid.ends_with(&format!("_{k}")))
}

fn infer_options(
    members: &[&ClassificationResult],
    corpus: &CorpusStats,
    fields: &[Field],
) -> SchemaOptions {
    let mut per_page: BTreeMap<&str, usize> = BTreeMap::new();
    for r in members {
        *per_page.entry(r.page_id.as_str()).or_default() += 1;
    }
    let singleton = corpus.page_count() > 0
        && corpus
            .page_text_len
            .keys()
            .all(|p| per_page.get(p.as_str()) == Some(&1));

    let is_page = singleton && {
        let stats: Vec<(BlockStats, usize)> = members
            .iter()
            .map(|r| {
                let b = corpus.blocks.get(&r.key()).copied().unwrap_or_default();
                let page_len = corpus.page_text_len.get(&r.page_id).copied().unwrap_or(0);
                (b, page_len)
            })
            .collect();
        let avg_words =
            stats.iter().map(|(b, _)| b.word_count).sum::<usize>() as f32 / stats.len().max(1) as f32;
        stats.iter().all(|(b, page_len)| {
            b.is_root && *page_len > 0 && b.text_len as f32 >= IS_PAGE_TEXT_SHARE * *page_len as f32
        }) && avg_words >= IS_PAGE_MIN_WORDS
    };

    let title = fields
        .iter()
        .find(|f| TITLE_FIELDS.contains(&f.uid.as_str()))
        .or_else(|| fields.first())
        .map(|f| f.uid.clone())
        .unwrap_or_else(|| "title".to_string());

    SchemaOptions {
        singleton,
        is_page,
        title,
    }
}

fn describe(label: &str, pages: usize, fields: &[Field]) -> String {
    let noun = if pages == 1 { "page" } else { "pages" };
    let mut s = format!(
        "Reusable {} component used across {} {}.",
        display_name(label).to_lowercase(),
        pages,
        noun
    );
    if !fields.is_empty() {
        let names: Vec<&str> = fields.iter().take(3).map(|f| f.uid.as_str()).collect();
        s.push_str(&format!(" Contains {}.", names.join(", ")));
    }
    s
}
