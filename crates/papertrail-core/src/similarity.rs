//! Similarity measures used by the relationship graph.

use std::collections::HashSet;

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for empty input, mismatched lengths or a zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Jaccard index of two string sets (exact, case-sensitive match).
pub fn jaccard(a: &[String], b: &[String]) -> f32 {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_cosine_identical() {
        let v = [0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_jaccard_overlap() {
        let a = s(&["Ada", "Grace"]);
        let b = s(&["Grace", "Alan", "Edsger"]);
        assert!((jaccard(&a, &b) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_jaccard_case_sensitive() {
        assert_eq!(jaccard(&s(&["ada"]), &s(&["Ada"])), 0.0);
    }

    #[test]
    fn test_jaccard_ignores_duplicates_and_empty() {
        assert_eq!(jaccard(&s(&["A", "A"]), &s(&["A"])), 1.0);
        assert_eq!(jaccard(&[], &[]), 0.0);
    }
}
