// Similarity Scoring
// Lexical token-overlap relevance plus cosine similarity over embeddings.
// The scorer is a seam: an embedding-backed implementation can replace the
// lexical baseline without touching the query layer.

use std::collections::HashSet;

/// Relevance of `content` to a free-text query, in [0, 1].
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, query: &str, content: &str) -> f64;
}

/// Baseline scorer: a case-insensitive whole-phrase match scores 1.0,
/// otherwise the fraction of query tokens present in the content. Zero means
/// the item is excluded from semantic results.
pub struct LexicalScorer;

impl SimilarityScorer for LexicalScorer {
    fn score(&self, query: &str, content: &str) -> f64 {
        let query = query.trim();
        if query.is_empty() {
            return 0.0;
        }
        let content_lower = content.to_lowercase();
        let query_lower = query.to_lowercase();
        if content_lower.contains(&query_lower) {
            return 1.0;
        }

        let content_tokens: HashSet<&str> = tokenize(&content_lower).collect();
        let query_tokens: Vec<&str> = tokenize(&query_lower).collect();
        if query_tokens.is_empty() {
            return 0.0;
        }
        let present = query_tokens
            .iter()
            .filter(|t| content_tokens.contains(**t))
            .count();
        present as f64 / query_tokens.len() as f64
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
}

/// Cosine similarity between two vectors. Mismatched lengths and zero
/// vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Jaccard similarity on word sets, used by long-term conflict resolution.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let lower_a = a.to_lowercase();
    let lower_b = b.to_lowercase();
    let set_a: HashSet<&str> = tokenize(&lower_a).collect();
    let set_b: HashSet<&str> = tokenize(&lower_b).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_phrase_match_scores_one() {
        let scorer = LexicalScorer;
        assert_eq!(scorer.score("React and TypeScript", "The project uses React and TypeScript for the frontend."), 1.0);
    }

    #[test]
    fn partial_overlap_scores_fraction() {
        let scorer = LexicalScorer;
        let score = scorer.score("rust memory allocator", "memory usage in rust programs");
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn no_overlap_scores_zero() {
        let scorer = LexicalScorer;
        assert_eq!(scorer.score("quantum chemistry", "weekly grocery list"), 0.0);
        assert_eq!(scorer.score("", "anything"), 0.0);
    }

    #[test]
    fn cosine_identity_and_orthogonality() {
        let a = [1.0f32, 0.0, 0.0];
        let b = [0.0f32, 1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &b), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn jaccard_on_word_sets() {
        assert_eq!(jaccard_similarity("the cat sat", "the cat sat"), 1.0);
        let score = jaccard_similarity("the cat sat", "the dog sat");
        assert!((score - 0.5).abs() < 1e-9);
        assert_eq!(jaccard_similarity("", ""), 1.0);
    }
}
