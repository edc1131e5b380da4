//! Pipeline orchestration: one migration run over a corpus of pages.
//!
//! Pass 1 parses pages and detects heuristics on a bounded blocking pool,
//! clusters blocks in corpus order on a single writer, then classifies every
//! block on a bounded async pool under the run deadline, which is fixed when
//! the run starts. Schemas are only synthesized once every classification has
//! resolved, and only for reusable types. Pass 2 extracts the content
//! instances and hands everything to the store.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::analyze::ai_adapter::{build_client_from_config, DynAiClient};
use crate::analyze::classifier::{Classification, Classifier, ClassifierSettings, ClassifyInput};
use crate::analyze::patterns::{reusable_components, ClusterId, ClusterTable, ReusableComponent};
use crate::analyze::rules::{Heuristic, HeuristicDetector};
use crate::config::ai::AiConfig;
use crate::config::PipelineConfig;
use crate::content::ContentExtractor;
use crate::error::{ParseError, PipelineError};
use crate::extract::extract_blocks;
use crate::ingest::types::RawPage;
use crate::model::{
    BlockKey, ClassificationResult, ComponentSchema, ComponentType, ContentBlock, ContentInstance,
};
use crate::report::{MigrationReport, PageSummary};
use crate::schema::{BlockStats, CorpusStats, SchemaSettings, SchemaSynthesizer};
use crate::store::{DynStore, MemoryStore};

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub schemas: Vec<ComponentSchema>,
    pub instances: Vec<ContentInstance>,
    pub results: Vec<ClassificationResult>,
    /// Promoted clusters plus confirmed single-member types.
    pub component_types: Vec<ComponentType>,
    pub reusable: Vec<ReusableComponent>,
    pub report: MigrationReport,
}

struct AnalyzedPage {
    blocks: Vec<ContentBlock>,
    heuristics: Vec<Heuristic>,
}

/// One block with everything the classifier needs, owned so it can cross tasks.
#[derive(Debug, Clone)]
struct WorkItem {
    block: ContentBlock,
    heuristic: Heuristic,
    cluster_id: ClusterId,
    cluster_title: String,
}

impl WorkItem {
    fn input(&self) -> ClassifyInput<'_> {
        ClassifyInput {
            block: &self.block,
            heuristic: &self.heuristic,
            cluster_id: self.cluster_id,
            cluster_title: &self.cluster_title,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    client: DynAiClient,
    ai_concurrency: usize,
    store: DynStore,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, client: DynAiClient) -> Self {
        Self {
            config,
            client,
            ai_concurrency: 4,
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Client and pool size from the AI config.
    pub fn from_configs(config: PipelineConfig, ai: &AiConfig) -> Self {
        Self::new(config, build_client_from_config(ai)).with_ai_concurrency(ai.concurrency)
    }

    pub fn with_store(mut self, store: DynStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_ai_concurrency(mut self, n: usize) -> Self {
        self.ai_concurrency = n.max(1);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run over `pages`; the configured run timeout starts counting now.
    pub async fn run(&self, pages: Vec<RawPage>) -> Result<RunOutput, PipelineError> {
        let deadline = self.config.run_timeout().map(|d| Instant::now() + d);
        self.run_until(pages, deadline).await
    }

    /// Run over `pages`, abandoning outstanding AI calls at `deadline`.
    pub async fn run_until(
        &self,
        pages: Vec<RawPage>,
        deadline: Option<Instant>,
    ) -> Result<RunOutput, PipelineError> {
        if pages.is_empty() {
            return Err(PipelineError::EmptyCorpus);
        }
        crate::metrics::ensure_described();
        let started = Utc::now();
        let mut report = MigrationReport::new(started);
        report.counts.pages = pages.len();
        tracing::info!(
            target: "pipeline",
            pages = pages.len(),
            ai = self.client.provider_name(),
            "migration run started"
        );

        // Pass 1a: parse + detect, bounded blocking pool, results in corpus order.
        let analyzed = self.parse_pages(pages, &mut report).await?;

        // Pass 1b: single-writer clustering in corpus order.
        let mut table = ClusterTable::new();
        let mut assigned = Vec::new();
        for page in &analyzed {
            for (block, heuristic) in page.blocks.iter().zip(&page.heuristics) {
                let id = table.assign(block.key(), &block.signature, &heuristic.label);
                assigned.push(id);
            }
        }
        let candidates = table.finalize(self.config.pipeline.min_cluster_members);
        tracing::info!(
            target: "pipeline",
            clusters = candidates.len(),
            promoted = candidates.iter().filter(|t| !t.unique).count(),
            "blocks clustered"
        );

        let items: Vec<WorkItem> = analyzed
            .into_iter()
            .flat_map(|p| p.blocks.into_iter().zip(p.heuristics))
            .zip(assigned)
            .map(|((block, heuristic), cluster_id)| WorkItem {
                cluster_title: table.title_of(cluster_id).unwrap_or_default().to_string(),
                block,
                heuristic,
                cluster_id,
            })
            .collect();
        report.counts.blocks = items.len();

        // Pass 1c: classification under the run deadline.
        let titles: Vec<String> = candidates
            .iter()
            .filter(|t| !t.unique)
            .map(|t| t.title.clone())
            .collect();
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&self.client),
            ClassifierSettings::from_config(&self.config),
            &titles,
        ));
        let (items, classifications) = self.classify_all(items, &classifier, deadline).await?;
        report.record_classifier(classifier.stats());

        // Barrier passed: every block has a final classification.
        let mut results: Vec<ClassificationResult> = Vec::with_capacity(classifications.len());
        for c in classifications {
            report.record_outcome(&c);
            results.push(c.result);
        }
        table.confirm(&results, self.config.classifier.threshold);
        let all_types = table.component_types();
        let component_types = table.reusable_types();
        let reusable_uids: BTreeSet<String> =
            component_types.iter().map(|t| t.uid.clone()).collect();
        let reusable = reusable_components(&all_types, &results);
        report.counts.component_types = component_types.len();
        report.counts.reusable_components = reusable.len();
        report.record_results(&results, self.config.classifier.threshold, &reusable_uids);

        let blocks: HashMap<BlockKey, ContentBlock> = items
            .into_iter()
            .map(|it| (it.block.key(), it.block))
            .collect();
        let corpus = corpus_stats(&blocks, &report.pages);

        let synthesizer = SchemaSynthesizer::new(SchemaSettings {
            mandatory_ratio: self.config.schema.mandatory_ratio,
            enum_cap: self.config.schema.enum_cap,
        })
        .with_reusable(reusable_uids);
        let synthesis = synthesizer.synthesize(&results, &corpus);
        report.counts.schemas = synthesis.schemas.len();
        report.conflicts = synthesis.conflicts;
        report.fieldless_types = synthesis.fieldless;
        let schemas = synthesis.schemas;

        // Pass 2: content instances against the final schema set; blocks of
        // types without a schema produce none.
        let instances = ContentExtractor.extract(&blocks, &results, &schemas);
        report.record_instances(&instances);

        self.persist(&schemas, &results, &instances, &component_types, &mut report)
            .await;

        crate::metrics::run_finished();
        report.finish(Utc::now());
        tracing::info!(
            target: "pipeline",
            elapsed_ms = report.elapsed_ms,
            summary = %report.summary(),
            "migration run finished"
        );

        Ok(RunOutput {
            schemas,
            instances,
            results,
            component_types,
            reusable,
            report,
        })
    }

    async fn parse_pages(
        &self,
        pages: Vec<RawPage>,
        report: &mut MigrationReport,
    ) -> Result<Vec<AnalyzedPage>, PipelineError> {
        let sem = Arc::new(Semaphore::new(self.config.pipeline.parse_workers.max(1)));
        let mut handles = Vec::with_capacity(pages.len());
        for page in pages {
            let permit = Arc::clone(&sem)
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Worker(e.to_string()))?;
            let summary = PageSummary {
                page_id: page.id.clone(),
                url: page.meta.url.clone(),
                ..Default::default()
            };
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                analyze_page(&page)
            });
            handles.push((summary, handle));
        }

        let mut analyzed = Vec::with_capacity(handles.len());
        for (mut summary, handle) in handles {
            let outcome = handle
                .await
                .map_err(|e| PipelineError::Worker(e.to_string()))?;
            match outcome {
                Ok(page) => {
                    summary.blocks = page.blocks.len();
                    analyzed.push(page);
                }
                Err(err) => {
                    tracing::warn!(target: "pipeline", error = %err, "page skipped");
                    crate::metrics::parse_error();
                    summary.parse_error = Some(err.reason.clone());
                    report.record_parse_error(err);
                }
            }
            report.pages.push(summary);
        }
        Ok(analyzed)
    }

    /// Classify every item on a bounded pool. Items still outstanding at the
    /// deadline are abandoned and fall back to their heuristic.
    async fn classify_all(
        &self,
        items: Vec<WorkItem>,
        classifier: &Arc<Classifier>,
        deadline: Option<Instant>,
    ) -> Result<(Vec<WorkItem>, Vec<Classification>), PipelineError> {
        let n = items.len();
        let items = Arc::new(items);
        let sem = Arc::new(Semaphore::new(self.ai_concurrency));

        let mut set = JoinSet::new();
        for idx in 0..n {
            let items = Arc::clone(&items);
            let classifier = Arc::clone(classifier);
            let sem = Arc::clone(&sem);
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let c = classifier.classify(items[idx].input()).await;
                (idx, c)
            });
        }

        let mut slots: Vec<Option<Classification>> = vec![None; n];
        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(
                            target: "pipeline",
                            outstanding = set.len(),
                            "run deadline reached; abandoning outstanding classifications"
                        );
                        break;
                    }
                },
                None => set.join_next().await,
            };
            match next {
                Some(Ok((idx, c))) => slots[idx] = Some(c),
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => return Err(PipelineError::Worker(e.to_string())),
                None => break,
            }
        }
        set.shutdown().await;

        let items = Arc::try_unwrap(items).unwrap_or_else(|shared| (*shared).clone());
        let classifications = slots
            .into_iter()
            .zip(&items)
            .map(|(slot, it)| slot.unwrap_or_else(|| classifier.abandoned(it.input())))
            .collect();
        Ok((items, classifications))
    }

    async fn persist(
        &self,
        schemas: &[ComponentSchema],
        results: &[ClassificationResult],
        instances: &[ContentInstance],
        types: &[ComponentType],
        report: &mut MigrationReport,
    ) {
        let mut failures = Vec::new();
        for s in schemas {
            failures.extend(self.store.save_schema(s).await.err());
        }
        for r in results {
            failures.extend(self.store.save_classification(r).await.err());
        }
        for i in instances {
            failures.extend(self.store.save_instance(i).await.err());
        }
        for t in types {
            failures.extend(self.store.save_component_type(t).await.err());
        }
        for p in &report.pages {
            failures.extend(self.store.save_page_summary(p).await.err());
        }
        for f in &failures {
            tracing::warn!(target: "pipeline", error = %f, "store write failed");
        }
        report.persistence_failures.extend(failures);
    }
}

/// Parse one page and run the heuristic detector over its blocks.
fn analyze_page(page: &RawPage) -> Result<AnalyzedPage, ParseError> {
    let t0 = StdInstant::now();
    let blocks = extract_blocks(page)?;
    let heuristics: Vec<Heuristic> = blocks.iter().map(|b| HeuristicDetector.detect(b)).collect();
    let ms = t0.elapsed().as_secs_f64() * 1000.0;
    crate::metrics::page_parsed(blocks.len(), ms);
    tracing::debug!(
        target: "pipeline",
        page = %page.id,
        blocks = blocks.len(),
        ms,
        "page analyzed"
    );
    Ok(AnalyzedPage { blocks, heuristics })
}

/// Page text share and root flags for the page-level schema options.
fn corpus_stats(blocks: &HashMap<BlockKey, ContentBlock>, pages: &[PageSummary]) -> CorpusStats {
    let mut page_text_len: BTreeMap<String, usize> = pages
        .iter()
        .filter(|p| p.parse_error.is_none())
        .map(|p| (p.page_id.clone(), 0))
        .collect();
    let mut stats = HashMap::with_capacity(blocks.len());
    for (key, b) in blocks {
        if b.is_root() {
            if let Some(len) = page_text_len.get_mut(&b.page_id) {
                *len += b.text.len();
            }
        }
        stats.insert(
            key.clone(),
            BlockStats {
                is_root: b.is_root(),
                text_len: b.text.len(),
                word_count: b.features.word_count,
            },
        );
    }
    CorpusStats {
        page_text_len,
        blocks: stats,
    }
}
