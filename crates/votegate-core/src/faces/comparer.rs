/// Maps cosine similarity from [-1, 1] onto [0, 1].
///
/// Empty vectors, mismatched dimensions and zero-norm vectors score 0.0 so a
/// malformed template can never produce a match.
pub fn similarity_score(lhs: &[f64], rhs: &[f64]) -> f64 {
    if lhs.is_empty() || lhs.len() != rhs.len() {
        return 0.0;
    }

    let cosine = cosine_similarity(lhs, rhs);
    if !cosine.is_finite() {
        return 0.0;
    }
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

pub fn cosine_similarity(lhs: &[f64], rhs: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_lhs = 0.0;
    let mut norm_rhs = 0.0;

    for (l, r) in lhs.iter().zip(rhs.iter()) {
        dot += l * r;
        norm_lhs += l * l;
        norm_rhs += r * r;
    }

    let denominator = norm_lhs.sqrt() * norm_rhs.sqrt();
    if denominator <= f64::EPSILON {
        return f64::NAN;
    }
    dot / denominator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = [0.12, -0.4, 0.9, 0.33];
        assert!((similarity_score(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn opposite_vectors_score_zero_and_orthogonal_half() {
        assert!(similarity_score(&[1.0, 0.0], &[-1.0, 0.0]).abs() < 1e-9);
        assert!((similarity_score(&[1.0, 0.0], &[0.0, 1.0]) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn scores_stay_in_unit_interval_and_are_symmetric() {
        let samples = [
            vec![0.5, -0.25, 3.0],
            vec![-10.0, 2.0, 0.001],
            vec![1e-3, 1e-3, -1e-3],
            vec![7.0, 7.0, 7.0],
        ];
        for a in &samples {
            for b in &samples {
                let score = similarity_score(a, b);
                assert!((0.0..=1.0).contains(&score));
                assert_eq!(score, similarity_score(b, a));
            }
        }
    }

    #[test]
    fn malformed_inputs_fail_closed() {
        assert_eq!(similarity_score(&[], &[]), 0.0);
        assert_eq!(similarity_score(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(similarity_score(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn cosine_reports_nan_for_zero_norm() {
        assert!(cosine_similarity(&[0.0], &[1.0]).is_nan());
        assert!((cosine_similarity(&[2.0, 0.0], &[5.0, 0.0]) - 1.0).abs() < 1e-12);
    }
}
