//! Embedding matching against a subject's enrolled set.

use crate::types::Embedding;

/// Default acceptance distance between unit-normalized embeddings.
///
/// Loose on purpose: acceptance is additionally gated by liveness.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.0;

/// Result of matching a candidate embedding against an enrolled set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Normalized Euclidean distance of the closest comparable embedding.
    pub distance: Option<f32>,
    /// Index into the enrolled set of the closest embedding.
    pub index: Option<usize>,
}

impl MatchResult {
    fn no_match() -> Self {
        Self {
            matched: false,
            distance: None,
            index: None,
        }
    }
}

/// Strategy for comparing a candidate embedding against enrolled embeddings.
pub trait Matcher {
    fn compare(&self, candidate: &Embedding, enrolled: &[Embedding], threshold: f32)
        -> MatchResult;

    fn matches(&self, candidate: &Embedding, enrolled: &[Embedding], threshold: f32) -> bool {
        self.compare(candidate, enrolled, threshold).matched
    }
}

/// Euclidean distance on L2-normalized vectors, inclusive threshold.
///
/// Every enrolled embedding is visited; there is no early exit on the first
/// hit, so timing does not reveal the match position.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        candidate: &Embedding,
        enrolled: &[Embedding],
        threshold: f32,
    ) -> MatchResult {
        let Some(probe) = candidate.normalized() else {
            tracing::debug!("candidate embedding has zero norm");
            return MatchResult::no_match();
        };

        let mut best: Option<(usize, f32)> = None;

        for (i, reference) in enrolled.iter().enumerate() {
            if reference.dim() != probe.dim() {
                continue;
            }
            let Some(reference) = reference.normalized() else {
                continue;
            };
            let distance = probe.euclidean_distance(&reference);
            tracing::debug!(index = i, distance, "compared enrolled embedding");
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((index, distance)) => MatchResult {
                matched: distance <= threshold,
                distance: Some(distance),
                index: Some(index),
            },
            None => MatchResult::no_match(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_identical_direction_matches_regardless_of_scale() {
        let candidate = emb(&[2.0, 4.0, 6.0]);
        let enrolled = vec![emb(&[1.0, 2.0, 3.0])];
        let result = EuclideanMatcher.compare(&candidate, &enrolled, DEFAULT_MATCH_THRESHOLD);
        assert!(result.matched);
        assert!(result.distance.unwrap() < 1e-6);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // Opposite unit vectors are exactly 2.0 apart.
        let candidate = emb(&[2.0, 0.0]);
        let enrolled = vec![emb(&[-5.0, 0.0])];
        assert!(EuclideanMatcher.matches(&candidate, &enrolled, 2.0));

        let just_below = f32::from_bits(2.0f32.to_bits() - 1);
        assert!(!EuclideanMatcher.matches(&candidate, &enrolled, just_below));
    }

    #[test]
    fn test_any_enrolled_embedding_may_match() {
        let candidate = emb(&[1.0, 0.0, 0.0]);
        let enrolled = vec![
            emb(&[0.0, 1.0, 0.0]),
            emb(&[0.0, 0.0, 1.0]),
            emb(&[0.9, 0.1, 0.0]),
        ];
        let result = EuclideanMatcher.compare(&candidate, &enrolled, 0.5);
        assert!(result.matched);
        assert_eq!(result.index, Some(2));
    }

    #[test]
    fn test_no_match_reports_closest_distance() {
        let candidate = emb(&[1.0, 0.0]);
        let enrolled = vec![emb(&[0.0, 1.0])];
        let result = EuclideanMatcher.compare(&candidate, &enrolled, 0.5);
        assert!(!result.matched);
        let d = result.distance.unwrap();
        assert!((d - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_zero_enrolled_vector_is_non_matching() {
        let candidate = emb(&[0.0, 1.0]);
        let enrolled = vec![emb(&[0.0, 0.0]), emb(&[0.0, 3.0])];
        let result = EuclideanMatcher.compare(&candidate, &enrolled, 0.1);
        assert!(result.matched);
        assert_eq!(result.index, Some(1));

        let only_zero = vec![emb(&[0.0, 0.0])];
        assert!(!EuclideanMatcher.matches(&candidate, &only_zero, 2.0));
    }

    #[test]
    fn test_zero_candidate_never_matches() {
        let candidate = emb(&[0.0, 0.0]);
        let enrolled = vec![emb(&[1.0, 0.0])];
        assert_eq!(
            EuclideanMatcher.compare(&candidate, &enrolled, 2.0),
            MatchResult::no_match()
        );
    }

    #[test]
    fn test_dimension_mismatch_is_non_matching() {
        let candidate = emb(&[1.0, 0.0]);
        let enrolled = vec![emb(&[1.0, 0.0, 0.0])];
        assert!(!EuclideanMatcher.matches(&candidate, &enrolled, 2.0));
    }

    #[test]
    fn test_empty_enrolled_set() {
        let candidate = emb(&[1.0, 0.0]);
        assert!(!EuclideanMatcher.matches(&candidate, &[], 2.0));
    }
}
