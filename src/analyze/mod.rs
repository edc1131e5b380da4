// src/analyze/mod.rs
//! Block analysis: structural signatures, heuristic rules, clustering and
//! AI-assisted classification.

pub mod ai_adapter;
pub mod classifier;
pub mod patterns;
pub mod retry;
pub mod rules;
pub mod scoring;
pub mod signature;

// Re-export convenient types.
pub use crate::analyze::classifier::{
    AiOutcome, Classification, Classifier, ClassifierSettings, ClassifierStats, ClassifyInput,
};
pub use crate::analyze::patterns::{
    best_match, reusable_components, Cluster, ClusterId, ClusterTable, ReusableComponent,
};
pub use crate::analyze::retry::RetryPolicy;
pub use crate::analyze::rules::{detect, Heuristic, HeuristicDetector};
pub use crate::analyze::scoring::FusionParams;
pub use crate::analyze::signature::StructuralSignature;
