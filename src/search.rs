//! Search over captured items: a substring baseline over title,
//! summary and keywords, optionally widened through the semantic tag
//! index.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::items::{Item, ItemQuery, ItemStore};
use crate::semantic::{SemanticSearchError, TagSemantics};

pub const DEFAULT_SEARCH_LIMIT: usize = 25;

/// Tags pulled from the index per expansion.
const TAG_MATCH_LIMIT: usize = 32;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    pub owner: Option<String>,
    pub query: String,
    pub emotion: Option<String>,
    /// Ask for tag expansion. Honored only when the semantic service
    /// is actually usable.
    pub semantic: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<Item>,
    /// True only when tag expansion ran, even if it widened nothing.
    pub semantic_used: bool,
}

pub struct SearchEngine {
    store: Arc<dyn ItemStore>,
    semantic: Arc<dyn TagSemantics>,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn ItemStore>, semantic: Arc<dyn TagSemantics>) -> SearchEngine {
        SearchEngine { store, semantic }
    }

    pub fn search(&self, request: SearchRequest) -> anyhow::Result<SearchResponse> {
        let query = request.query.trim().to_string();
        let limit = request.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);

        let mut results = self.store.query(ItemQuery {
            owner: request.owner.clone(),
            text: (!query.is_empty()).then(|| query.clone()),
            emotion: request.emotion.clone(),
            ..Default::default()
        })?;

        let mut semantic_used = false;
        if request.semantic && !query.is_empty() {
            semantic_used = self.expand(&request, &query, &mut results)?;
        }

        results.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        results.truncate(limit);

        Ok(SearchResponse {
            results,
            semantic_used,
        })
    }

    /// Widens `results` with items whose keywords sit close to the
    /// query in embedding space. Returns whether expansion ran; an
    /// unavailable or failing index degrades to the baseline.
    fn expand(
        &self,
        request: &SearchRequest,
        query: &str,
        results: &mut Vec<Item>,
    ) -> anyhow::Result<bool> {
        let matches = match self.semantic.similar_tags(query, None, TAG_MATCH_LIMIT) {
            Ok(matches) => matches,
            Err(SemanticSearchError::Disabled) => return Ok(false),
            Err(err) => {
                log::warn!("semantic expansion failed, keeping baseline results: {err}");
                return Ok(false);
            }
        };

        let tags: HashSet<String> = matches.into_iter().map(|m| m.tag).collect();
        if !tags.is_empty() {
            let seen: HashSet<u64> = results.iter().map(|item| item.id).collect();
            let candidates = self.store.query(ItemQuery {
                owner: request.owner.clone(),
                emotion: request.emotion.clone(),
                ..Default::default()
            })?;
            results.extend(candidates.into_iter().filter(|item| {
                !seen.contains(&item.id) && item.keywords.iter().any(|k| tags.contains(k))
            }));
        }
        Ok(true)
    }
}
