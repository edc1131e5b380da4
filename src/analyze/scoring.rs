//! Confidence arithmetic for combining heuristic and AI opinions.
//!
//! Every function here is pure; results are clamped to [0,1].

use crate::model::ClassificationSource;

#[derive(Clone, Copy, Debug)]
pub struct FusionParams {
    /// Subtracted when heuristic and AI labels disagree.
    pub disagreement_penalty: f32,
    /// Ceiling for heuristic confidence once the AI path has failed.
    pub fallback_cap: f32,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            disagreement_penalty: 0.15,
            fallback_cap: 0.5,
        }
    }
}

/// Final confidence and provenance for a successful AI answer.
///
/// - AI label equals the cluster title: the AI confidence is taken as is.
/// - otherwise: `max(heuristic, ai)`, minus the penalty when the two labels disagree.
pub fn fuse(
    heuristic_label: &str,
    heuristic_confidence: f32,
    cluster_title: &str,
    ai_label: &str,
    ai_confidence: f32,
    params: &FusionParams,
) -> (f32, ClassificationSource) {
    let agree = heuristic_label == ai_label;
    let confidence = if ai_label == cluster_title {
        ai_confidence
    } else {
        let base = heuristic_confidence.max(ai_confidence);
        if agree {
            base
        } else {
            base - params.disagreement_penalty
        }
    };
    let source = if agree {
        ClassificationSource::AiConfirmed
    } else {
        ClassificationSource::AiOverridden
    };
    (clamp_unit(confidence), source)
}

/// Heuristic confidence after exhausted AI retries.
pub fn fallback_confidence(heuristic_confidence: f32, params: &FusionParams) -> f32 {
    clamp_unit(heuristic_confidence.min(params.fallback_cap))
}

pub fn clamp_unit(x: f32) -> f32 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: FusionParams = FusionParams {
        disagreement_penalty: 0.15,
        fallback_cap: 0.5,
    };

    #[test]
    fn cluster_agreement_takes_ai_confidence() {
        let (c, s) = fuse("card", 0.6, "teaser", "teaser", 0.7, &P);
        assert!((c - 0.7).abs() < 1e-6);
        assert_eq!(s, ClassificationSource::AiOverridden);

        let (c, s) = fuse("card", 0.6, "card", "card", 0.95, &P);
        assert!((c - 0.95).abs() < 1e-6);
        assert_eq!(s, ClassificationSource::AiConfirmed);
    }

    #[test]
    fn disagreement_is_penalized() {
        let (c, s) = fuse("card", 0.6, "component_2", "banner", 0.7, &P);
        assert!((c - 0.55).abs() < 1e-6);
        assert_eq!(s, ClassificationSource::AiOverridden);

        let (c, _) = fuse("unknown", 0.0, "component_2", "banner", 0.1, &P);
        assert_eq!(c, 0.0);
    }

    #[test]
    fn agreement_outside_cluster_keeps_max() {
        let (c, s) = fuse("card", 0.75, "component_1", "card", 0.6, &P);
        assert!((c - 0.75).abs() < 1e-6);
        assert_eq!(s, ClassificationSource::AiConfirmed);
    }

    #[test]
    fn fallback_is_capped() {
        assert_eq!(fallback_confidence(0.7, &P), 0.5);
        assert_eq!(fallback_confidence(0.3, &P), 0.3);
        assert_eq!(clamp_unit(f32::NAN), 0.0);
    }
}
