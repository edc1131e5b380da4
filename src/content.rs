//! Pass 2: turn classified blocks into content instances of the final schemas.
//!
//! Values come from the classification fields first; a schema field the
//! classifier did not fill is looked up in the block's own features by name.
//! Coercion is best-effort and never drops a value.

use std::collections::{BTreeMap, HashMap};

use crate::analyze::rules::parse_number;
use crate::model::{
    slug, BlockKey, ClassificationResult, ComponentSchema, ContentBlock, ContentInstance, DataType,
    Field, FieldValue,
};

#[derive(Debug, Default, Clone)]
pub struct ContentExtractor;

impl ContentExtractor {
    /// One instance per block whose final uid is not `unknown` and has a schema.
    /// Output follows the order of `results`.
    pub fn extract(
        &self,
        blocks: &HashMap<BlockKey, ContentBlock>,
        results: &[ClassificationResult],
        schemas: &[ComponentSchema],
    ) -> Vec<ContentInstance> {
        let by_uid: HashMap<&str, &ComponentSchema> =
            schemas.iter().map(|s| (s.uid.as_str(), s)).collect();

        results
            .iter()
            .filter(|r| !r.is_unknown())
            .filter_map(|r| {
                let schema = by_uid.get(r.component_uid.as_str())?;
                Some(instance_for(schema, r, blocks.get(&r.key())))
            })
            .collect()
    }
}

/// Build the instance of `schema` for one classified block.
pub fn instance_for(
    schema: &ComponentSchema,
    result: &ClassificationResult,
    block: Option<&ContentBlock>,
) -> ContentInstance {
    let mut fields = BTreeMap::new();
    let mut uncoerced = Vec::new();
    let mut missing = Vec::new();

    for field in &schema.fields {
        let raw = result
            .fields
            .get(&field.uid)
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| block.and_then(|b| from_block(b, &field.uid)));

        match raw {
            Some(v) => {
                let (value, ok) = coerce(v, field);
                if !ok {
                    uncoerced.push(field.uid.clone());
                }
                fields.insert(field.uid.clone(), value);
            }
            None if field.mandatory => missing.push(field.uid.clone()),
            None => {}
        }
    }

    if !missing.is_empty() {
        tracing::debug!(
            target: "content",
            schema = %schema.uid,
            block = %result.key(),
            missing = ?missing,
            "instance missing mandatory fields"
        );
    }

    ContentInstance {
        uid: instance_uid(&schema.uid, &result.key()),
        schema_uid: schema.uid.clone(),
        page_id: result.page_id.clone(),
        block_id: result.block_id,
        fields,
        confidence: result.confidence,
        incomplete: !missing.is_empty(),
        missing_mandatory: missing,
        uncoerced,
    }
}

/// Stable across runs on the same corpus.
pub fn instance_uid(schema_uid: &str, key: &BlockKey) -> String {
    format!("{}_{}_{}", schema_uid, slug(&key.page_id), key.block_id)
}

/// Block-derived value for a well-known field name.
pub fn from_block(block: &ContentBlock, field: &str) -> Option<FieldValue> {
    let f = &block.features;
    let text = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| FieldValue::Text(s.to_string()))
    };
    match field {
        "title" | "heading" | "headline" | "name" | "headline_text" => f
            .headings
            .first()
            .and_then(|h| text(h))
            .or_else(|| (field == "headline_text").then(|| text(&block.text)).flatten()),
        "description" | "content" | "body" | "text" => match f.paragraphs.len() {
            0 => text(&block.text),
            1 => text(&f.paragraphs[0]),
            _ => Some(FieldValue::RichText(f.paragraphs.join("\n"))),
        },
        "image" | "img" | "photo" | "background_image" => f
            .images
            .first()
            .map(|i| i.src.clone())
            .or_else(|| block.attrs.get("background_image").cloned())
            .filter(|s| !s.is_empty())
            .map(FieldValue::Reference),
        "alt" => f.images.first().and_then(|i| text(&i.alt)),
        "link" | "url" | "href" => f
            .links
            .first()
            .map(|l| l.href.clone())
            .filter(|s| !s.is_empty())
            .map(FieldValue::Reference),
        "call_to_action" | "cta" => f.links.first().and_then(|l| text(&l.text)),
        "items" => (!f.list_items.is_empty()).then(|| FieldValue::RichText(f.list_items.join("\n"))),
        _ => None,
    }
}

/// Coerce to the declared type. `false` means the value was kept as text.
pub fn coerce(value: FieldValue, field: &Field) -> (FieldValue, bool) {
    if value.data_type() == field.data_type && field.data_type != DataType::Enum {
        return (value, true);
    }
    let s = value.to_text();
    let coerced = match field.data_type {
        DataType::Text => Some(FieldValue::Text(s.clone())),
        DataType::RichText => Some(FieldValue::RichText(s.clone())),
        DataType::Number => parse_number(&s).map(FieldValue::Number),
        DataType::Boolean => parse_bool(&s).map(FieldValue::Boolean),
        DataType::Enum => {
            let v = s.trim().to_lowercase();
            let allowed = field.enum_values();
            (allowed.is_empty() || allowed.contains(&v.as_str())).then(|| FieldValue::Enum(v))
        }
        DataType::Reference => looks_like_reference(&s).then(|| FieldValue::Reference(s.trim().to_string())),
    };
    match coerced {
        Some(v) => (v, true),
        None => (FieldValue::Text(s), false),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" | "checked" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn looks_like_reference(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty()
        && !s.contains(char::is_whitespace)
        && (s.contains("://") || s.starts_with('/') || s.starts_with('#') || s.contains('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::signature::StructuralSignature;
    use crate::model::{
        BlockFeatures, ClassificationSource, FieldMetadata, Image, SchemaOptions,
    };

    fn field(uid: &str, data_type: DataType, mandatory: bool) -> Field {
        Field {
            uid: uid.into(),
            data_type,
            display_name: uid.into(),
            mandatory,
            field_metadata: FieldMetadata::default(),
        }
    }

    fn schema(fields: Vec<Field>) -> ComponentSchema {
        ComponentSchema {
            title: "Card".into(),
            uid: "card_component".into(),
            fields,
            options: SchemaOptions {
                singleton: false,
                is_page: false,
                title: "title".into(),
            },
            description: String::new(),
        }
    }

    fn result(fields: &[(&str, FieldValue)]) -> ClassificationResult {
        ClassificationResult {
            page_id: "shop.html".into(),
            block_id: 4,
            component_uid: "card_component".into(),
            label: "card".into(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            confidence: 0.7,
            source: ClassificationSource::HeuristicOnly,
            cluster_id: 1,
        }
    }

    fn block() -> ContentBlock {
        ContentBlock {
            id: 4,
            page_id: "shop.html".into(),
            path: "body > div.card".into(),
            tag: "div".into(),
            text: "Lamp Nice lamp".into(),
            children: vec![],
            parent: None,
            attrs: Default::default(),
            signature: StructuralSignature::from_parts("div", 2, Default::default(), 14),
            features: BlockFeatures {
                headings: vec!["Lamp".into()],
                paragraphs: vec!["Nice lamp".into()],
                images: vec![Image {
                    src: "/lamp.png".into(),
                    alt: "lamp".into(),
                }],
                ..Default::default()
            },
            repeated_children: 0,
        }
    }

    #[test]
    fn missing_mandatory_marks_incomplete() {
        let s = schema(vec![
            field("title", DataType::Text, true),
            field("price", DataType::Number, true),
        ]);
        let inst = instance_for(&s, &result(&[("title", FieldValue::Text("Lamp".into()))]), None);
        assert!(inst.incomplete);
        assert_eq!(inst.missing_mandatory, vec!["price"]);
        assert_eq!(inst.uid, "card_component_shop_html_4");
    }

    #[test]
    fn block_features_fill_gaps() {
        let s = schema(vec![
            field("title", DataType::Text, true),
            field("description", DataType::Text, false),
            field("image", DataType::Reference, false),
        ]);
        let b = block();
        let inst = instance_for(&s, &result(&[]), Some(&b));
        assert!(!inst.incomplete);
        assert_eq!(inst.fields["title"], FieldValue::Text("Lamp".into()));
        assert_eq!(inst.fields["description"], FieldValue::Text("Nice lamp".into()));
        assert_eq!(inst.fields["image"], FieldValue::Reference("/lamp.png".into()));
    }

    #[test]
    fn uncoercible_values_stay_text() {
        let s = schema(vec![field("price", DataType::Number, false)]);
        let ok = instance_for(&s, &result(&[("price", FieldValue::Text("$1,299.00".into()))]), None);
        assert_eq!(ok.fields["price"], FieldValue::Number(1299.0));
        assert!(ok.uncoerced.is_empty());

        let bad = instance_for(&s, &result(&[("price", FieldValue::Text("call us".into()))]), None);
        assert_eq!(bad.fields["price"], FieldValue::Text("call us".into()));
        assert_eq!(bad.uncoerced, vec!["price"]);
    }

    #[test]
    fn extract_skips_unknown_and_unschematized() {
        let s = schema(vec![field("title", DataType::Text, false)]);
        let mut unknown = result(&[]);
        unknown.component_uid = crate::model::UNKNOWN.into();
        let mut other = result(&[]);
        other.component_uid = "banner_component".into();
        let known = result(&[("title", FieldValue::Text("x".into()))]);
        let out = ContentExtractor.extract(&HashMap::new(), &[unknown, other, known], &[s]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].schema_uid, "card_component");
    }

    #[test]
    fn coerce_booleans_and_enums() {
        let b = field("featured", DataType::Boolean, false);
        assert_eq!(coerce(FieldValue::Text("Yes".into()), &b), (FieldValue::Boolean(true), true));
        let mut e = field("method", DataType::Enum, false);
        e.field_metadata.enum_values = Some(vec![crate::model::EnumOption {
            label: "Post".into(),
            value: "post".into(),
        }]);
        assert_eq!(coerce(FieldValue::Enum("POST".into()), &e), (FieldValue::Enum("post".into()), true));
        assert_eq!(coerce(FieldValue::Enum("put".into()), &e), (FieldValue::Text("put".into()), false));
    }
}
