//! AI adapter: prompt rendering, provider abstraction and completion parsing.
//!
//! The client never sees the cluster table or the cache; it turns one
//! `AiRequest` into one `AiAnswer` (or an `AiError`). Untyped JSON from the
//! completion is converted to `FieldValue` here and nowhere else.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analyze::rules::{Heuristic, KNOWN_LABELS};
use crate::config::ai::AiConfig;
use crate::error::{AiError, AiResponseError};
use crate::model::{slug, ContentBlock, DataType, FieldValue, UNKNOWN};

/// Block text sent to the model is cut to this many chars.
pub const MAX_PROMPT_TEXT: usize = 800;

static RE_DETECTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Detected type: (\S+)$").expect("detected-type regex"));

// ------------------------------------------------------------
// Public surface
// ------------------------------------------------------------

/// Everything the model gets to see about one block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiRequest {
    pub text: String,
    /// Compact structural summary (tag, path, shape, features).
    pub context: String,
    pub heuristic_label: String,
    pub heuristic_confidence: f32,
    pub known_titles: Vec<String>,
}

impl AiRequest {
    pub fn from_block(block: &ContentBlock, heuristic: &Heuristic, known_titles: &[String]) -> Self {
        Self {
            text: block.text.chars().take(MAX_PROMPT_TEXT).collect(),
            context: structural_context(block),
            heuristic_label: heuristic.label.clone(),
            heuristic_confidence: heuristic.confidence,
            known_titles: known_titles.to_vec(),
        }
    }
}

/// Parsed model answer. Label is raw (not yet snapped to known titles).
#[derive(Debug, Clone, PartialEq)]
pub struct AiAnswer {
    pub label: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub confidence: f32,
}

/// Trait object used by the classifier.
pub trait AiClient: Send + Sync {
    fn classify<'a>(
        &'a self,
        req: &'a AiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AiAnswer, AiError>> + Send + 'a>>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
    /// `false` means every call fails with `AiError::Disabled`.
    fn is_enabled(&self) -> bool {
        true
    }
}

pub type DynAiClient = Arc<dyn AiClient>;

/// Factory: build a client according to config and environment variables.
///
/// * `AI_TEST_MODE=mock` returns a deterministic mock client.
/// * `enabled == false` returns a disabled client.
/// * otherwise the OpenAI-compatible provider.
pub fn build_client_from_config(config: &AiConfig) -> DynAiClient {
    let timeout = Duration::from_secs(config.timeout_secs);
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
        || (config.enabled && config.provider == "mock")
    {
        return Arc::new(PromptClient::new(MockProvider::default(), timeout));
    }

    if !config.enabled {
        return Arc::new(DisabledClient);
    }

    match config.provider.as_str() {
        "openai" | "" => match OpenAiProvider::new(config) {
            Ok(p) => Arc::new(PromptClient::new(p, timeout)),
            Err(e) => {
                tracing::warn!(target: "ai", error = %e, "cannot build OpenAI client; AI disabled");
                Arc::new(DisabledClient)
            }
        },
        other => {
            tracing::warn!(target: "ai", provider = other, "unsupported AI provider; AI disabled");
            Arc::new(DisabledClient)
        }
    }
}

// ------------------------------------------------------------
// Provider abstraction + concrete providers
// ------------------------------------------------------------

/// Low-level provider: turns a prompt into raw completion text.
pub trait Provider: Send + Sync + 'static {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, AiError>> + Send + 'a>>;
    fn name(&self) -> &'static str;
}

/// OpenAI-compatible chat completions provider.
pub struct OpenAiProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiProvider {
    pub fn new(config: &AiConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cms-migrator/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        let api_key = if config.api_key.is_empty() {
            std::env::var("OPENAI_API_KEY").unwrap_or_default()
        } else {
            config.api_key.clone()
        };
        if api_key.is_empty() {
            anyhow::bail!("no API key configured (set OPENAI_API_KEY)");
        }
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
        })
    }
}

impl Provider for OpenAiProvider {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, AiError>> + Send + 'a>> {
        Box::pin(async move {
            #[derive(Serialize)]
            struct Msg<'a> {
                role: &'a str,
                content: &'a str,
            }
            #[derive(Serialize)]
            struct Req<'a> {
                model: &'a str,
                messages: Vec<Msg<'a>>,
                temperature: f32,
                max_tokens: u32,
            }
            #[derive(Deserialize)]
            struct Resp {
                choices: Vec<Choice>,
            }
            #[derive(Deserialize)]
            struct Choice {
                message: ChoiceMsg,
            }
            #[derive(Deserialize)]
            struct ChoiceMsg {
                content: String,
            }

            let req = Req {
                model: &self.model,
                messages: vec![
                    Msg {
                        role: "system",
                        content: SYSTEM_PROMPT,
                    },
                    Msg {
                        role: "user",
                        content: prompt,
                    },
                ],
                temperature: 0.1,
                max_tokens: 600,
            };

            let resp = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&req)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = resp.status();
            if status.as_u16() == 429 {
                return Err(AiError::RateLimited);
            }
            if !status.is_success() {
                return Err(AiError::Status(status.as_u16()));
            }
            let body: Resp = resp.json().await.map_err(map_reqwest_error)?;
            Ok(body
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .unwrap_or_default())
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

fn map_reqwest_error(e: reqwest::Error) -> AiError {
    if e.is_timeout() {
        AiError::Timeout
    } else if e.is_decode() {
        AiError::Response(AiResponseError::InvalidJson(e.to_string()))
    } else {
        AiError::Transport(e.to_string())
    }
}

/// Always fails with `Disabled`; used when AI is off.
pub struct DisabledClient;

impl AiClient for DisabledClient {
    fn classify<'a>(
        &'a self,
        _req: &'a AiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AiAnswer, AiError>> + Send + 'a>> {
        Box::pin(async { Err(AiError::Disabled) })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
    fn is_enabled(&self) -> bool {
        false
    }
}

/// Deterministic local provider: agrees with the heuristic hint in the prompt.
#[derive(Clone)]
pub struct MockProvider {
    pub confidence: f32,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self { confidence: 0.9 }
    }
}

impl Provider for MockProvider {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, AiError>> + Send + 'a>> {
        let label = RE_DETECTED
            .captures(prompt)
            .map(|c| c[1].to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let out = serde_json::json!({
            "type": label,
            "confidence": self.confidence,
            "fields": {}
        })
        .to_string();
        Box::pin(async move { Ok(out) })
    }
    fn name(&self) -> &'static str {
        "mock"
    }
}

type ScriptFn = dyn Fn(&str) -> Result<String, AiError> + Send + Sync;

/// Provider driven by a closure; counts calls. Useful for tests and dry runs.
pub struct ScriptedProvider {
    script: Box<ScriptFn>,
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str) -> Result<String, AiError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            latency: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared call counter (clone it before handing the provider away).
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Provider for ScriptedProvider {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, AiError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            (self.script)(prompt)
        })
    }
    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ------------------------------------------------------------
// Prompt client wrapper (render + timeout + parse)
// ------------------------------------------------------------

pub struct PromptClient<P: Provider> {
    inner: P,
    timeout: Duration,
}

impl<P: Provider> PromptClient<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn classify_impl(&self, req: &AiRequest) -> Result<AiAnswer, AiError> {
        let prompt = render_prompt(req);
        let completion = tokio::time::timeout(self.timeout, self.inner.complete(&prompt))
            .await
            .map_err(|_| AiError::Timeout)??;
        Ok(parse_completion(&completion)?)
    }
}

impl<P: Provider> AiClient for PromptClient<P> {
    fn classify<'a>(
        &'a self,
        req: &'a AiRequest,
    ) -> Pin<Box<dyn Future<Output = Result<AiAnswer, AiError>> + Send + 'a>> {
        Box::pin(self.classify_impl(req))
    }
    fn provider_name(&self) -> &'static str {
        self.inner.name()
    }
}

// ------------------------------------------------------------
// Prompt
// ------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You classify fragments of web pages into reusable CMS components. Answer with one JSON object only.";

/// Fixed prompt template. Deterministic for a given request.
pub fn render_prompt(req: &AiRequest) -> String {
    let mut known: Vec<&str> = KNOWN_LABELS.to_vec();
    for t in &req.known_titles {
        if !known.contains(&t.as_str()) {
            known.push(t.as_str());
        }
    }
    format!(
        "### Pre-analysis\n\
Detected type: {label}\n\
Confidence: {conf:.2}\n\
\n\
### Structure\n\
{context}\n\
\n\
### Content text\n\
{text}\n\
\n\
### Task\n\
Classify this block as one reusable component type. Prefer one of the known types: {known}.\n\
Suggest a new short type name only when none fits. Extract the block's content fields.\n\
\n\
Return JSON:\n\
{{\"type\": \"component-type\", \"confidence\": 0.0-1.0, \"fields\": {{\"field_name\": \"value\"}}}}",
        label = req.heuristic_label,
        conf = req.heuristic_confidence,
        context = req.context,
        text = req.text,
        known = known.join(", "),
    )
}

/// One-line-per-fact summary of a block's structure.
pub fn structural_context(block: &ContentBlock) -> String {
    let f = &block.features;
    let mut lines = vec![
        format!("tag: {}", block.tag),
        format!("path: {}", block.path),
        format!(
            "shape: {} ({} children, length band {})",
            block.signature.digest, block.signature.child_count, block.signature.length_band
        ),
        format!("words: {}", f.word_count),
    ];
    if !f.headings.is_empty() {
        let hs: Vec<&str> = f.headings.iter().take(3).map(String::as_str).collect();
        lines.push(format!("headings: {}", hs.join(" | ")));
    }
    if f.link_count > 0 {
        lines.push(format!("links: {}", f.link_count));
    }
    if f.image_count > 0 {
        lines.push(format!("images: {}", f.image_count));
    }
    if !f.inputs.is_empty() {
        let ins: Vec<String> = f
            .inputs
            .iter()
            .map(|i| format!("{}:{}", i.kind, i.name))
            .collect();
        lines.push(format!("inputs: {}", ins.join(", ")));
    }
    if !f.list_items.is_empty() {
        lines.push(format!("list items: {}", f.list_items.len()));
    }
    if block.repeated_children > 1 {
        lines.push(format!("repeated children: {}", block.repeated_children));
    }
    lines.join("\n")
}

// ------------------------------------------------------------
// Response parsing
// ------------------------------------------------------------

/// Parse the first JSON object in `completion` into an answer.
pub fn parse_completion(completion: &str) -> Result<AiAnswer, AiResponseError> {
    let raw = first_json_object(completion).ok_or(AiResponseError::NoJson)?;
    let v: Value =
        serde_json::from_str(raw).map_err(|e| AiResponseError::InvalidJson(e.to_string()))?;
    let obj = v.as_object().ok_or(AiResponseError::NoJson)?;

    let label = ["type", "type_label", "label"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(AiResponseError::MissingField("type"))?
        .to_string();

    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or(AiResponseError::MissingField("confidence"))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(AiResponseError::ConfidenceOutOfRange(confidence.to_string()));
    }

    let mut fields = BTreeMap::new();
    if let Some(map) = obj.get("fields").and_then(Value::as_object) {
        for (k, v) in map {
            let name = slug(k);
            if let Some(fv) = json_to_field(&name, v) {
                if !fv.is_empty() {
                    fields.insert(name, fv);
                }
            }
        }
    }

    Ok(AiAnswer {
        label,
        fields,
        confidence: confidence as f32,
    })
}

/// Convert one untyped JSON value into a typed field value.
pub fn json_to_field(name: &str, v: &Value) -> Option<FieldValue> {
    match v {
        Value::Null => None,
        Value::Bool(b) => Some(FieldValue::Boolean(*b)),
        Value::Number(n) => n.as_f64().map(FieldValue::Number),
        Value::String(s) => Some(string_field(name, s.trim())),
        Value::Array(items) => {
            let lines: Vec<String> = items
                .iter()
                .filter_map(|i| json_to_field(name, i))
                .map(|f| f.to_text())
                .filter(|s| !s.is_empty())
                .collect();
            Some(FieldValue::RichText(lines.join("\n")))
        }
        Value::Object(map) => {
            let declared = map
                .get("type")
                .and_then(Value::as_str)
                .and_then(DataType::parse);
            match (declared, map.get("value")) {
                (Some(t), Some(inner)) => typed_field(t, inner),
                _ => Some(FieldValue::RichText(v.to_string())),
            }
        }
    }
}

fn typed_field(t: DataType, v: &Value) -> Option<FieldValue> {
    let as_text = || match v {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    Some(match t {
        DataType::Text => FieldValue::Text(as_text()),
        DataType::RichText => FieldValue::RichText(as_text()),
        DataType::Enum => FieldValue::Enum(as_text()),
        DataType::Reference => FieldValue::Reference(as_text()),
        DataType::Number => match v {
            Value::Number(n) => FieldValue::Number(n.as_f64()?),
            _ => crate::analyze::rules::parse_number(&as_text())
                .map(FieldValue::Number)
                .unwrap_or_else(|| FieldValue::Text(as_text())),
        },
        DataType::Boolean => match v {
            Value::Bool(b) => FieldValue::Boolean(*b),
            _ => match as_text().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => FieldValue::Boolean(true),
                "false" | "no" | "0" => FieldValue::Boolean(false),
                other => FieldValue::Text(other.to_string()),
            },
        },
    })
}

fn string_field(name: &str, s: &str) -> FieldValue {
    let reference_name = ["image", "img", "photo", "link", "url", "href", "src", "action"]
        .iter()
        .any(|k| name == *k || name.ends_with(&format!("_{k}")));
    let looks_like_url = s.starts_with("http://")
        || s.starts_with("https://")
        || (s.starts_with('/') && !s.contains(' '));
    if reference_name || looks_like_url {
        FieldValue::Reference(s.to_string())
    } else if s.contains('\n') || s.chars().count() > 200 {
        FieldValue::RichText(s.to_string())
    } else {
        FieldValue::Text(s.to_string())
    }
}

/// Byte slice of the first balanced `{…}` in `s`, string-literal aware.
fn first_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, ch) in s[start..].char_indices() {
        if in_str {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Normalize a model label and snap it onto a known title when close enough.
///
/// `Hero-Component` -> `hero`; `headlines` snaps to `headline` at the default threshold.
pub fn normalize_label(raw: &str, known: &[String], snap_threshold: f64) -> String {
    let mut label = slug(raw);
    for suffix in ["_component", "_block", "_section"] {
        if let Some(stripped) = label.strip_suffix(suffix) {
            if !stripped.is_empty() {
                label = stripped.to_string();
            }
        }
    }
    if label == "field" || label == UNKNOWN || label == "none" {
        return UNKNOWN.to_string();
    }
    if known.iter().any(|k| *k == label) {
        return label;
    }
    let best = known
        .iter()
        .map(|k| (k, strsim::jaro_winkler(&label, k)))
        .filter(|(_, score)| *score >= snap_threshold)
        .max_by(|a, b| a.1.total_cmp(&b.1));
    match best {
        Some((k, _)) => k.clone(),
        None => label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_first_object_with_prose_around() {
        let c = r#"Sure! Here you go:
{"type": "teaser-component", "confidence": 0.92, "fields": {"title": "Hi {there}", "link": "/a", "price": 9.5, "tags": ["a", "b"]}}
Anything else? {"ignored": true}"#;
        let a = parse_completion(c).unwrap();
        assert_eq!(a.label, "teaser-component");
        assert!((a.confidence - 0.92).abs() < 1e-6);
        assert_eq!(a.fields["title"], FieldValue::Text("Hi {there}".into()));
        assert_eq!(a.fields["link"], FieldValue::Reference("/a".into()));
        assert_eq!(a.fields["price"], FieldValue::Number(9.5));
        assert_eq!(a.fields["tags"], FieldValue::RichText("a\nb".into()));
    }

    #[test]
    fn malformed_answers_are_typed_errors() {
        assert_eq!(parse_completion("no json"), Err(AiResponseError::NoJson));
        assert_eq!(
            parse_completion(r#"{"confidence": 0.5}"#),
            Err(AiResponseError::MissingField("type"))
        );
        assert_eq!(
            parse_completion(r#"{"type": "card"}"#),
            Err(AiResponseError::MissingField("confidence"))
        );
        assert!(matches!(
            parse_completion(r#"{"type": "card", "confidence": 7}"#),
            Err(AiResponseError::ConfidenceOutOfRange(_))
        ));
        assert!(matches!(
            parse_completion(r#"{"type": "card", "confidence": }"#),
            Err(AiResponseError::InvalidJson(_))
        ));
    }

    #[test]
    fn tagged_values_keep_their_type() {
        let v = json!({"type": "number", "value": "1,299"});
        assert_eq!(json_to_field("price", &v), Some(FieldValue::Number(1299.0)));
        let v = json!({"type": "enum", "value": "large"});
        assert_eq!(json_to_field("size", &v), Some(FieldValue::Enum("large".into())));
        assert_eq!(json_to_field("x", &Value::Null), None);
    }

    #[test]
    fn labels_are_normalized_and_snapped() {
        let known = vec!["headline".to_string(), "card".to_string()];
        assert_eq!(normalize_label("Headline-Component", &known, 0.92), "headline");
        assert_eq!(normalize_label("headlines", &known, 0.92), "headline");
        assert_eq!(normalize_label("Pricing Table", &known, 0.92), "pricing_table");
        assert_eq!(normalize_label("", &known, 0.92), UNKNOWN);
    }

    #[test]
    fn prompt_carries_hint_and_known_types() {
        let req = AiRequest {
            text: "Welcome".into(),
            context: "tag: h1".into(),
            heuristic_label: "headline".into(),
            heuristic_confidence: 0.85,
            known_titles: vec!["component_4".into()],
        };
        let p = render_prompt(&req);
        assert!(p.contains("Detected type: headline"));
        assert!(p.contains("Confidence: 0.85"));
        assert!(p.contains("component_4"));
        assert_eq!(p, render_prompt(&req));
    }

    #[tokio::test]
    async fn mock_agrees_with_hint() {
        let client = PromptClient::new(MockProvider::default(), Duration::from_secs(1));
        let req = AiRequest {
            text: "x".into(),
            context: String::new(),
            heuristic_label: "card".into(),
            heuristic_confidence: 0.5,
            known_titles: vec![],
        };
        let a = client.classify(&req).await.unwrap();
        assert_eq!(a.label, "card");
        assert!((a.confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let slow = ScriptedProvider::new(|_| Ok("{}".into())).with_latency(Duration::from_secs(30));
        let client = PromptClient::new(slow, Duration::from_secs(1));
        let req = AiRequest {
            text: "x".into(),
            context: String::new(),
            heuristic_label: "card".into(),
            heuristic_confidence: 0.5,
            known_titles: vec![],
        };
        assert!(matches!(client.classify(&req).await, Err(AiError::Timeout)));
    }

    #[tokio::test]
    async fn disabled_client_refuses() {
        let req = AiRequest {
            text: String::new(),
            context: String::new(),
            heuristic_label: UNKNOWN.into(),
            heuristic_confidence: 0.0,
            known_titles: vec![],
        };
        assert!(!DisabledClient.is_enabled());
        assert!(matches!(DisabledClient.classify(&req).await, Err(AiError::Disabled)));
    }
}
