//! Pattern matching: groups structurally equivalent blocks into clusters.
//!
//! The table is a run-scoped value with a single writer. Blocks are assigned in
//! corpus order, so membership and tie-breaks do not depend on scheduling.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::analyze::signature::StructuralSignature;
use crate::model::{component_uid, BlockKey, ClassificationResult, ComponentType, UNKNOWN};

pub type ClusterId = usize;

/// Share of members a field must appear in to count as common.
const COMMON_FIELD_RATIO: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    /// Signature of the first member; matches are measured against it.
    pub founder: StructuralSignature,
    pub members: Vec<BlockKey>,
    /// Members the classifier could not name, set by `confirm`.
    pub adopted: Vec<BlockKey>,
    /// Heuristic label per member, same order as `members`.
    pub labels: Vec<String>,
    pub title: String,
    pub confidence: f32,
    pub confirmed: bool,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn generic_title(&self) -> String {
        format!("component_{}", self.id)
    }

    pub fn uid(&self) -> String {
        component_uid(&self.title)
    }
}

#[derive(Debug, Default)]
pub struct ClusterTable {
    clusters: Vec<Cluster>,
    by_block: HashMap<BlockKey, ClusterId>,
    min_members: usize,
}

/// Strict-majority value of `items`, ignoring `unknown`.
fn strict_majority<'a>(items: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let mut total = 0usize;
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for it in items {
        total += 1;
        if it != UNKNOWN {
            *counts.entry(it).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .find(|(_, n)| *n * 2 > total)
        .map(|(label, _)| label)
}

impl ClusterTable {
    pub fn new() -> Self {
        Self {
            min_members: 2,
            ..Default::default()
        }
    }

    /// Add `key` to the best matching cluster, or found a new one.
    ///
    /// A cluster matches when the founder has exactly the same shape; text
    /// length does not matter. Ties go through `best_match`.
    pub fn assign(
        &mut self,
        key: BlockKey,
        signature: &StructuralSignature,
        heuristic_label: &str,
    ) -> ClusterId {
        if let Some(&id) = self.by_block.get(&key) {
            return id;
        }
        let best = best_match(
            self.clusters
                .iter()
                .filter(|c| c.founder.same_shape(signature)),
        );

        let id = match best {
            Some(id) => id,
            None => {
                let id = self.clusters.len();
                self.clusters.push(Cluster {
                    id,
                    founder: signature.clone(),
                    members: Vec::new(),
                    adopted: Vec::new(),
                    labels: Vec::new(),
                    title: String::new(),
                    confidence: 0.0,
                    confirmed: false,
                });
                id
            }
        };
        let cluster = &mut self.clusters[id];
        cluster.members.push(key.clone());
        cluster.labels.push(heuristic_label.to_string());
        self.by_block.insert(key, id);
        id
    }

    pub fn cluster_of(&self, key: &BlockKey) -> Option<ClusterId> {
        self.by_block.get(key).copied()
    }

    pub fn get(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(id)
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Working title of a cluster (set by `finalize`).
    pub fn title_of(&self, id: ClusterId) -> Option<&str> {
        self.clusters.get(id).map(|c| c.title.as_str())
    }

    /// Whether the cluster is large enough to be a reusable type.
    pub fn is_promoted(&self, id: ClusterId) -> bool {
        self.clusters
            .get(id)
            .is_some_and(|c| c.len() >= self.min_members)
    }

    /// Title every cluster by its heuristic majority and return the candidate types.
    ///
    /// Clusters with at least `min_members` members are candidates; smaller ones
    /// are returned with `unique = true` and only count once confirmed.
    pub fn finalize(&mut self, min_members: usize) -> Vec<ComponentType> {
        self.min_members = min_members.max(1);
        for c in &mut self.clusters {
            let majority = strict_majority(c.labels.iter().map(String::as_str));
            c.title = match majority {
                Some(label) => label.to_string(),
                None if c.len() == 1 => c.labels[0].clone(),
                None => c.generic_title(),
            };
            let agreeing = c.labels.iter().filter(|l| **l == c.title).count();
            c.confidence = agreeing as f32 / c.len().max(1) as f32;
        }
        self.component_types()
    }

    /// Apply classifier consensus. Results are only read.
    ///
    /// A strict majority of final labels renames (and confirms) a cluster.
    /// Unknown members of a promoted cluster are recorded as adopted.
    /// Single-member clusters are confirmed only by a recognizable label at or
    /// above `threshold`.
    pub fn confirm(
        &mut self,
        results: &[ClassificationResult],
        threshold: f32,
    ) -> Vec<ComponentType> {
        let mut by_cluster: HashMap<ClusterId, Vec<usize>> = HashMap::new();
        for (i, r) in results.iter().enumerate() {
            by_cluster.entry(r.cluster_id).or_default().push(i);
        }

        for c in &mut self.clusters {
            let Some(idx) = by_cluster.get(&c.id) else {
                continue;
            };
            let majority =
                strict_majority(idx.iter().map(|&i| results[i].label.as_str())).map(str::to_string);
            let avg = idx.iter().map(|&i| results[i].confidence).sum::<f32>() / idx.len() as f32;

            if c.len() >= self.min_members {
                if let Some(label) = majority {
                    if label != c.title {
                        tracing::debug!(
                            target: "patterns",
                            cluster = c.id,
                            from = %c.title,
                            to = %label,
                            "cluster renamed by consensus"
                        );
                        c.title = label;
                    }
                    c.confirmed = true;
                }
                c.confidence = avg;
                c.adopted = idx
                    .iter()
                    .map(|&i| &results[i])
                    .filter(|r| r.is_unknown())
                    .map(ClassificationResult::key)
                    .collect();
            } else if let Some(&i) = idx.first() {
                let r = &results[i];
                if r.label != UNKNOWN && r.confidence >= threshold {
                    c.title = r.label.clone();
                    c.confirmed = true;
                }
                c.confidence = r.confidence;
            }
        }
        self.component_types()
    }

    /// Current view of every cluster as a component type.
    pub fn component_types(&self) -> Vec<ComponentType> {
        self.clusters
            .iter()
            .map(|c| ComponentType {
                cluster_id: c.id,
                title: c.title.clone(),
                uid: c.uid(),
                members: c.members.clone(),
                adopted: c.adopted.clone(),
                confidence: c.confidence,
                unique: c.len() < self.min_members,
                confirmed: c.confirmed,
            })
            .collect()
    }

    /// Types that count as reusable: promoted clusters plus confirmed singles.
    pub fn reusable_types(&self) -> Vec<ComponentType> {
        self.component_types()
            .into_iter()
            .filter(|t| t.title != UNKNOWN && (!t.unique || t.confirmed))
            .collect()
    }
}

/// Among matching clusters: the largest, then the lowest id.
pub fn best_match<'a>(candidates: impl IntoIterator<Item = &'a Cluster>) -> Option<ClusterId> {
    candidates
        .into_iter()
        .max_by(|a, b| a.len().cmp(&b.len()).then(b.id.cmp(&a.id)))
        .map(|c| c.id)
}

/// Reuse summary of one promoted component type.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReusableComponent {
    pub uid: String,
    pub title: String,
    pub instances_count: usize,
    pub pages_count: usize,
    pub common_fields: Vec<String>,
    pub reusability_score: f32,
    pub usage_pages: Vec<String>,
}

/// Summarize reuse of every non-unique type across the classification results.
pub fn reusable_components(
    types: &[ComponentType],
    results: &[ClassificationResult],
) -> Vec<ReusableComponent> {
    let mut by_uid: BTreeMap<&str, Vec<&ClassificationResult>> = BTreeMap::new();
    for r in results.iter().filter(|r| !r.is_unknown()) {
        by_uid.entry(r.component_uid.as_str()).or_default().push(r);
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for t in types.iter().filter(|t| !t.unique && t.title != UNKNOWN) {
        if !seen.insert(t.uid.as_str()) {
            continue;
        }
        let Some(members) = by_uid.get(t.uid.as_str()) else {
            continue;
        };
        let pages: BTreeSet<&str> = members.iter().map(|r| r.page_id.as_str()).collect();

        let mut field_counts: BTreeMap<&str, usize> = BTreeMap::new();
        for r in members {
            for k in r.fields.keys() {
                *field_counts.entry(k.as_str()).or_default() += 1;
            }
        }
        let need = members.len() as f32 * COMMON_FIELD_RATIO;
        let common: Vec<String> = field_counts
            .iter()
            .filter(|(_, n)| **n as f32 >= need)
            .map(|(k, _)| k.to_string())
            .collect();
        let avg_fields =
            members.iter().map(|r| r.fields.len()).sum::<usize>() as f32 / members.len() as f32;

        out.push(ReusableComponent {
            uid: t.uid.clone(),
            title: t.title.clone(),
            instances_count: members.len(),
            pages_count: pages.len(),
            reusability_score: reusability(members.len(), pages.len(), common.len(), avg_fields),
            common_fields: common,
            usage_pages: pages.into_iter().map(str::to_string).collect(),
        });
    }
    out
}

/// Instance count, common-field ratio and cross-page use, each weighted, capped at 1.
pub fn reusability(instances: usize, pages: usize, common_fields: usize, avg_fields: f32) -> f32 {
    let mut score: f32 = match instances {
        n if n >= 5 => 0.3,
        n if n >= 3 => 0.2,
        n if n >= 2 => 0.1,
        _ => 0.0,
    };
    if avg_fields > 0.0 {
        score += (common_fields as f32 / avg_fields).min(1.0) * 0.4;
    }
    score += match pages {
        n if n >= 3 => 0.3,
        2 => 0.2,
        _ => 0.0,
    };
    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClassificationSource;
    use std::collections::BTreeSet;

    fn sig(shape: &str, band_len: usize) -> StructuralSignature {
        StructuralSignature::from_parts(shape, 2, BTreeSet::new(), band_len)
    }

    fn key(page: &str, id: u32) -> BlockKey {
        BlockKey::new(page, id)
    }

    fn result(page: &str, id: u32, cluster: ClusterId, label: &str, conf: f32) -> ClassificationResult {
        ClassificationResult {
            page_id: page.into(),
            block_id: id,
            component_uid: component_uid(label),
            label: label.into(),
            fields: BTreeMap::new(),
            confidence: conf,
            source: ClassificationSource::HeuristicOnly,
            cluster_id: cluster,
        }
    }

    fn cluster(id: ClusterId, size: u32) -> Cluster {
        Cluster {
            id,
            founder: sig("x", 10),
            members: (0..size).map(|n| key("c", n)).collect(),
            adopted: Vec::new(),
            labels: vec!["card".into(); size as usize],
            title: String::new(),
            confidence: 0.0,
            confirmed: false,
        }
    }

    #[test]
    fn same_shape_joins_different_shape_splits() {
        let mut t = ClusterTable::new();
        let a = t.assign(key("p", 0), &sig("card", 10), "card");
        let b = t.assign(key("p", 1), &sig("card", 30), "card");
        let c = t.assign(key("p", 2), &sig("hero", 10), "banner");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // re-assigning is a no-op
        assert_eq!(t.assign(key("p", 0), &sig("card", 10), "card"), a);
        assert_eq!(t.get(a).unwrap().len(), 2);
    }

    #[test]
    fn text_length_never_splits_equal_shapes() {
        let mut t = ClusterTable::new();
        let short = t.assign(key("p", 0), &sig("p", 18), "paragraph");
        let long = t.assign(key("p", 1), &sig("p", 400), "paragraph");
        let huge = t.assign(key("p", 2), &sig("p", 5000), "paragraph");
        assert_eq!(short, long);
        assert_eq!(short, huge);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn larger_cluster_wins_a_tie() {
        let (small, large) = (cluster(0, 3), cluster(1, 5));
        assert_eq!(best_match([&small, &large]), Some(1));
        assert_eq!(best_match([&large, &small]), Some(1));
    }

    #[test]
    fn equal_sizes_pick_lowest_id() {
        let (a, b) = (cluster(4, 2), cluster(7, 2));
        assert_eq!(best_match([&b, &a]), Some(4));
        assert_eq!(best_match(std::iter::empty()), None);
    }

    #[test]
    fn finalize_titles_by_majority() {
        let mut t = ClusterTable::new();
        t.assign(key("a", 0), &sig("h", 5), "headline");
        t.assign(key("b", 0), &sig("h", 5), "headline");
        t.assign(key("c", 0), &sig("h", 5), UNKNOWN);
        t.assign(key("a", 1), &sig("z", 5), UNKNOWN);
        t.assign(key("b", 1), &sig("z", 5), UNKNOWN);
        t.assign(key("a", 2), &sig("solo", 5), "image");

        let types = t.finalize(2);
        assert_eq!(types[0].title, "headline");
        assert_eq!(types[0].uid, "headline_component");
        assert!(!types[0].unique);
        assert_eq!(types[1].title, "component_1");
        assert_eq!(types[1].uid, "component_1");
        assert!(types[2].unique);
        assert_eq!(types[2].title, "image");
    }

    #[test]
    fn consensus_renames_and_adopts_unknowns() {
        let mut t = ClusterTable::new();
        for (i, page) in ["a", "b", "c"].iter().enumerate() {
            t.assign(key(page, i as u32), &sig("t", 5), "card");
        }
        t.finalize(2);
        let results = vec![
            result("a", 0, 0, "teaser", 0.9),
            result("b", 1, 0, "teaser", 0.9),
            result("c", 2, 0, UNKNOWN, 0.2),
        ];
        let before = results.clone();
        let types = t.confirm(&results, 0.8);
        assert_eq!(types[0].title, "teaser");
        assert!(types[0].confirmed);
        assert_eq!(types[0].adopted, vec![key("c", 2)]);
        // results are never rewritten
        assert_eq!(results, before);
        assert_eq!(results[2].component_uid, UNKNOWN);
    }

    #[test]
    fn single_member_needs_confident_label() {
        let mut t = ClusterTable::new();
        t.assign(key("a", 0), &sig("solo", 5), "image");
        t.assign(key("a", 1), &sig("other", 5), "image");
        t.finalize(2);
        let results = vec![
            result("a", 0, 0, "image", 0.9),
            result("a", 1, 1, "image", 0.5),
        ];
        t.confirm(&results, 0.8);
        let reusable = t.reusable_types();
        assert_eq!(reusable.len(), 1);
        assert_eq!(reusable[0].cluster_id, 0);
    }

    #[test]
    fn reusability_report() {
        let mut t = ClusterTable::new();
        for page in ["a", "b", "c"] {
            t.assign(key(page, 0), &sig("h", 5), "headline");
        }
        let types = t.finalize(2);
        let results: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|p| {
                let mut r = result(p, 0, 0, "headline", 0.85);
                r.fields
                    .insert("headline_text".into(), crate::model::FieldValue::Text("Welcome".into()));
                r
            })
            .collect();
        t.confirm(&results, 0.8);
        let report = reusable_components(&types, &results);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].instances_count, 3);
        assert_eq!(report[0].pages_count, 3);
        assert_eq!(report[0].common_fields, vec!["headline_text"]);
        // 0.2 (3 instances) + 0.4 (all fields common) + 0.3 (3 pages)
        assert!((report[0].reusability_score - 0.9).abs() < 1e-6);
    }
}
