// tests/scenarios.rs
// End-to-end runs over small in-memory corpora with scripted AI providers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cms_migrator::ai_adapter::{DisabledClient, PromptClient, ScriptedProvider};
use cms_migrator::analyze::AiOutcome;
use cms_migrator::error::AiError;
use cms_migrator::model::{ClassificationSource, DataType};
use cms_migrator::{Pipeline, PipelineConfig, RawPage};

fn config(extra: &str) -> PipelineConfig {
    let toml = format!(
        r#"
[retry]
max_attempts = 3
base_delay_ms = 0
max_jitter_ms = 0
{extra}
"#
    );
    PipelineConfig::from_toml_str(&toml).unwrap()
}

fn scripted(provider: ScriptedProvider, cfg: PipelineConfig) -> Pipeline {
    Pipeline::new(
        cfg,
        Arc::new(PromptClient::new(provider, Duration::from_secs(5))),
    )
}

fn welcome_page(id: &str) -> RawPage {
    RawPage::new(
        id,
        r#"<html><body><div class="hero"><h1>Welcome</h1></div></body></html>"#,
    )
}

#[tokio::test]
async fn welcome_on_three_pages_gives_one_type_one_schema_three_instances() {
    let pipeline = Pipeline::new(config(""), Arc::new(DisabledClient));
    let pages = vec![welcome_page("a.html"), welcome_page("b.html"), welcome_page("c.html")];
    let out = pipeline.run(pages).await.unwrap();

    assert_eq!(out.component_types.len(), 1);
    assert_eq!(out.component_types[0].members.len(), 3);

    assert_eq!(out.schemas.len(), 1);
    let schema = &out.schemas[0];
    let mandatory: Vec<_> = schema.mandatory_fields().collect();
    assert_eq!(mandatory.len(), 1);
    assert_eq!(mandatory[0].data_type, DataType::Text);

    assert_eq!(out.instances.len(), 3);
    assert!(out.instances.iter().all(|i| i.schema_uid == schema.uid));
    assert!(out.instances.iter().all(|i| !i.incomplete));
    assert!(out.report.is_clean());
}

#[tokio::test]
async fn bare_welcome_text_on_three_pages_is_a_headline_schema() {
    let pipeline = Pipeline::new(config(""), Arc::new(DisabledClient));
    let pages = ["a.html", "b.html", "c.html"]
        .into_iter()
        .map(|id| RawPage::new(id, "<html><body><p>Welcome</p></body></html>"))
        .collect();
    let out = pipeline.run(pages).await.unwrap();

    assert_eq!(out.component_types.len(), 1);
    assert_eq!(out.component_types[0].title, "headline");
    assert_eq!(out.schemas.len(), 1);
    let schema = &out.schemas[0];
    assert_eq!(schema.uid, "headline_component");
    let mandatory: Vec<_> = schema.mandatory_fields().collect();
    assert_eq!(mandatory.len(), 1);
    assert_eq!(mandatory[0].data_type, DataType::Text);
    assert_eq!(out.instances.len(), 3);
    assert!(out.report.unresolved.is_empty());
}

#[tokio::test]
async fn three_timeouts_fall_back_to_heuristic() {
    let provider = ScriptedProvider::new(|_| Err(AiError::Timeout));
    let calls = provider.calls();
    let pipeline = scripted(provider, config(""));
    let page = RawPage::new(
        "p.html",
        "<body><p>This is just some plain paragraph text</p></body>",
    );
    let out = pipeline.run(vec![page]).await.unwrap();

    assert_eq!(out.results.len(), 1);
    let r = &out.results[0];
    assert_eq!(r.label, "paragraph");
    assert_eq!(r.source, ClassificationSource::HeuristicFallback);
    assert!(r.confidence <= 0.5);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(out.report.ai_failures.len(), 1);
    assert_eq!(out.report.ai_failures[0].attempts, 3);
    assert_eq!(out.report.counts.fallbacks, 1);
    assert!(out
        .report
        .low_confidence
        .iter()
        .any(|l| l.block == r.key() && l.label == "paragraph"));
}

#[tokio::test]
async fn price_number_beats_text_and_conflict_is_recorded() {
    let provider = ScriptedProvider::new(|prompt| {
        if prompt.contains("Detected type: card") {
            let price = if prompt.contains("Lamp") {
                "9.99"
            } else {
                "\"call us\""
            };
            Ok(format!(
                r#"{{"type": "card", "confidence": 0.9, "fields": {{"price": {price}}}}}"#
            ))
        } else {
            Ok(r#"{"type": "paragraph", "confidence": 0.7, "fields": {}}"#.to_string())
        }
    });
    let pipeline = scripted(provider, config(""));
    let pages = vec![
        RawPage::new(
            "lamp.html",
            r#"<body><div class="card"><h3>Lamp</h3><p>A bright lamp for the desk</p></div></body>"#,
        ),
        RawPage::new(
            "chair.html",
            r#"<body><div class="card"><h3>Chair</h3><p>A comfy chair for the office</p></div></body>"#,
        ),
    ];
    let out = pipeline.run(pages).await.unwrap();

    let card = out
        .schemas
        .iter()
        .find(|s| s.uid == "card_component")
        .expect("card schema");
    assert_eq!(card.field("price").unwrap().data_type, DataType::Number);

    let conflict = out
        .report
        .conflicts
        .iter()
        .find(|c| c.field == "price")
        .expect("price conflict");
    assert_eq!(conflict.schema_uid, "card_component");
    assert_eq!(conflict.resolved, DataType::Number);
    assert!(conflict.observed.contains(&DataType::Text));

    // The text value survives in its instance, flagged as uncoerced.
    let chair = out
        .instances
        .iter()
        .find(|i| i.schema_uid == "card_component" && i.page_id == "chair.html")
        .unwrap();
    assert_eq!(chair.uncoerced, vec!["price".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn run_deadline_abandons_slow_calls() {
    let provider = ScriptedProvider::new(|_| {
        Ok(r#"{"type": "paragraph", "confidence": 0.9, "fields": {}}"#.to_string())
    })
    .with_latency(Duration::from_secs(30));
    let cfg = config("[pipeline]\nrun_timeout_secs = 1\n");
    let pipeline = Pipeline::new(
        cfg,
        Arc::new(PromptClient::new(provider, Duration::from_secs(60))),
    );
    let page = RawPage::new(
        "slow.html",
        "<body><p>This is just some plain paragraph text</p></body>",
    );
    let out = pipeline.run(vec![page]).await.unwrap();

    assert_eq!(out.report.counts.abandoned, 1);
    let r = &out.results[0];
    assert_eq!(r.source, ClassificationSource::HeuristicFallback);
    assert!(r.confidence <= 0.5);
    assert_eq!(out.report.ai_failures[0].error, "run deadline exceeded");
}

fn slow_provider(latency: Duration) -> Pipeline {
    let provider = ScriptedProvider::new(|_| {
        Ok(r#"{"type": "paragraph", "confidence": 0.9, "fields": {}}"#.to_string())
    })
    .with_latency(latency);
    Pipeline::new(
        config("[pipeline]\nrun_timeout_secs = 10\n"),
        Arc::new(PromptClient::new(provider, Duration::from_secs(60))),
    )
}

fn paragraph_page() -> RawPage {
    RawPage::new(
        "p.html",
        "<body><p>This is just some plain paragraph text</p></body>",
    )
}

#[tokio::test(start_paused = true)]
async fn run_budget_fits_a_call_when_nothing_else_ran() {
    let out = slow_provider(Duration::from_secs(5))
        .run(vec![paragraph_page()])
        .await
        .unwrap();
    assert_eq!(out.report.counts.abandoned, 0);
    assert_eq!(out.results[0].source, ClassificationSource::AiConfirmed);
}

#[tokio::test(start_paused = true)]
async fn time_spent_before_classification_counts_against_the_deadline() {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    // Earlier passes used most of the budget.
    tokio::time::advance(Duration::from_secs(9)).await;

    let out = slow_provider(Duration::from_secs(5))
        .run_until(vec![paragraph_page()], Some(deadline))
        .await
        .unwrap();
    assert_eq!(out.report.counts.abandoned, 1);
    assert_eq!(out.results[0].source, ClassificationSource::HeuristicFallback);
}

#[tokio::test]
async fn ai_answers_are_reported_per_block() {
    let provider = ScriptedProvider::new(|_| {
        Ok(r#"{"type": "paragraph", "confidence": 0.95, "fields": {}}"#.to_string())
    });
    let client = Arc::new(PromptClient::new(provider, Duration::from_secs(5)));
    let classifier = cms_migrator::analyze::Classifier::new(client, Default::default(), &[]);
    let blocks = cms_migrator::extract::extract_blocks(&RawPage::new(
        "p.html",
        "<p>This is just some plain paragraph text</p>",
    ))
    .unwrap();
    let h = cms_migrator::analyze::detect(&blocks[0]);
    let c = classifier
        .classify(cms_migrator::analyze::ClassifyInput {
            block: &blocks[0],
            heuristic: &h,
            cluster_id: 0,
            cluster_title: "paragraph",
        })
        .await;
    assert_eq!(c.outcome, AiOutcome::Answered { attempts: 1 });
    assert_eq!(c.result.source, ClassificationSource::AiConfirmed);
    assert!((c.result.confidence - 0.95).abs() < 1e-6);
}
