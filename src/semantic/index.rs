//! In-memory vector index keyed by tag. Tags are immutable strings, so
//! unlike a content index there is nothing to invalidate: a tag is
//! either embedded or missing.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("vector has zero norm")]
    ZeroNormVector,
}

/// A tag scored against a query embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct TagMatch {
    pub tag: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct TagIndex {
    entries: HashMap<String, Vec<f32>>,
    dimensions: usize,
}

impl TagIndex {
    pub fn new(dimensions: usize) -> TagIndex {
        TagIndex {
            entries: HashMap::new(),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.entries.contains_key(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<f32>)> {
        self.entries.iter()
    }

    /// Insert or replace the embedding for a tag. Rejects vectors of the
    /// wrong width and zero-norm vectors, which would poison cosine math.
    pub fn insert(&mut self, tag: String, embedding: Vec<f32>) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }
        if l2_norm(&embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        self.entries.insert(tag, embedding);
        Ok(())
    }

    /// Tags from `tags` that have no embedding yet, input order kept.
    pub fn missing<'a>(&self, tags: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut out: Vec<String> = vec![];
        for tag in tags {
            if !self.contains(tag) && !out.iter().any(|t| t == tag) {
                out.push(tag.clone());
            }
        }
        out
    }

    /// Tags whose cosine similarity against `query` clears `threshold`,
    /// best first, at most `limit` of them.
    pub fn search(
        &self,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<TagMatch>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut matches: Vec<TagMatch> = self
            .entries
            .iter()
            .filter_map(|(tag, embedding)| {
                let score = cosine_similarity(query, query_norm, embedding);
                (score >= threshold).then(|| TagMatch {
                    tag: tag.clone(),
                    score,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tag.cmp(&b.tag))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

fn cosine_similarity(query: &[f32], query_norm: f32, other: &[f32]) -> f32 {
    let dot: f32 = query.iter().zip(other).map(|(a, b)| a * b).sum();
    let other_norm = l2_norm(other);
    if other_norm < f32::EPSILON {
        return 0.0;
    }
    dot / (query_norm * other_norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(entries: &[(&str, Vec<f32>)]) -> TagIndex {
        let dims = entries.first().map(|(_, v)| v.len()).unwrap_or(3);
        let mut index = TagIndex::new(dims);
        for (tag, vector) in entries {
            index.insert(tag.to_string(), vector.clone()).unwrap();
        }
        index
    }

    #[test]
    fn insert_and_lookup() {
        let mut index = TagIndex::new(3);
        index.insert("rust".to_string(), vec![1.0, 0.0, 0.0]).unwrap();
        assert!(index.contains("rust"));
        assert!(!index.contains("python"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn insert_rejects_wrong_dimensions() {
        let mut index = TagIndex::new(3);
        let err = index.insert("rust".to_string(), vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch { expected: 3, got: 2 }
        ));
    }

    #[test]
    fn insert_rejects_zero_norm() {
        let mut index = TagIndex::new(3);
        let err = index.insert("rust".to_string(), vec![0.0; 3]).unwrap_err();
        assert!(matches!(err, IndexError::ZeroNormVector));
    }

    #[test]
    fn reinsert_replaces() {
        let mut index = TagIndex::new(3);
        index.insert("rust".to_string(), vec![1.0, 0.0, 0.0]).unwrap();
        index.insert("rust".to_string(), vec![0.0, 1.0, 0.0]).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn missing_keeps_order_and_deduplicates() {
        let index = index_with(&[("rust", vec![1.0, 0.0, 0.0])]);
        let tags = vec![
            "memory".to_string(),
            "rust".to_string(),
            "borrow".to_string(),
            "memory".to_string(),
        ];
        assert_eq!(index.missing(&tags), vec!["memory", "borrow"]);
    }

    #[test]
    fn search_orders_by_similarity() {
        let index = index_with(&[
            ("exact", vec![1.0, 0.0, 0.0]),
            ("close", vec![0.9, 0.1, 0.0]),
            ("orthogonal", vec![0.0, 1.0, 0.0]),
            ("opposite", vec![-1.0, 0.0, 0.0]),
        ]);
        let matches = index.search(&[1.0, 0.0, 0.0], 0.5, 10).unwrap();
        let tags: Vec<&str> = matches.iter().map(|m| m.tag.as_str()).collect();
        assert_eq!(tags, vec!["exact", "close"]);
        assert!(matches[0].score > matches[1].score);
    }

    #[test]
    fn search_respects_threshold_boundary() {
        let index = index_with(&[("a", vec![1.0, 0.0]), ("b", vec![0.0, 1.0])]);
        // Similarity of a vector with itself is exactly 1.0.
        let matches = index.search(&[1.0, 0.0], 1.0, 10).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].tag, "a");
    }

    #[test]
    fn search_respects_limit() {
        let index = index_with(&[
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.9, 0.1]),
            ("c", vec![0.8, 0.2]),
        ]);
        let matches = index.search(&[1.0, 0.0], 0.0, 2).unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn search_on_empty_index_is_empty() {
        let index = TagIndex::new(3);
        assert!(index.search(&[1.0, 0.0, 0.0], 0.0, 10).unwrap().is_empty());
    }

    #[test]
    fn search_rejects_bad_queries() {
        let index = index_with(&[("a", vec![1.0, 0.0])]);
        assert!(index.search(&[1.0], 0.0, 10).is_err());
        assert!(index.search(&[0.0, 0.0], 0.0, 10).is_err());
    }

    #[test]
    fn cosine_is_scale_invariant() {
        let index = index_with(&[("a", vec![0.5, 0.5, 0.0])]);
        let small = index.search(&[0.1, 0.1, 0.0], 0.9, 10).unwrap();
        let large = index.search(&[10.0, 10.0, 0.0], 0.9, 10).unwrap();
        assert_eq!(small.len(), 1);
        assert_eq!(large.len(), 1);
        assert!((small[0].score - large[0].score).abs() < 1e-5);
    }
}
