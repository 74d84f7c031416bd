//! Tag semantics behind a trait seam. The live implementation lazily
//! loads the embedding model and the persisted tag index on first use;
//! callers that only need the seam (search, worker) stay unaware of
//! model lifetimes.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::SemanticSearchConfig;
use crate::semantic::embeddings::{EmbeddingError, EmbeddingModel};
use crate::semantic::index::{IndexError, TagIndex, TagMatch};
use crate::semantic::storage::{TagVectorStorage, VectorStorageError};

#[derive(Debug, thiserror::Error)]
pub enum SemanticSearchError {
    #[error("semantic search is disabled")]
    Disabled,

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// What the rest of the system needs from tag embeddings. `Disabled` is
/// an expected state, not a failure: callers degrade to lexical search
/// when they see it.
pub trait TagSemantics: Send + Sync {
    fn enabled(&self) -> bool;

    /// Embed any of `tags` that are not in the index yet. Returns how
    /// many were added.
    fn ensure_tags(&self, tags: &[String]) -> Result<usize, SemanticSearchError>;

    /// Known tags similar to `query`, best first. `threshold` falls back
    /// to the configured default.
    fn similar_tags(
        &self,
        query: &str,
        threshold: Option<f32>,
        limit: usize,
    ) -> Result<Vec<TagMatch>, SemanticSearchError>;

    /// Flush the index to disk. A no-op when nothing was ever loaded.
    fn save_index(&self) -> Result<(), SemanticSearchError>;
}

struct SemanticState {
    model: EmbeddingModel,
    index: TagIndex,
    storage: TagVectorStorage,
}

/// Live [`TagSemantics`] backed by fastembed and `vectors.bin`.
///
/// Lazy on purpose: constructing the service is free, the model download
/// and index load happen on the first call that needs them.
pub struct SemanticTagService {
    config: SemanticSearchConfig,
    base_path: PathBuf,
    // Mutex<Option<_>> instead of OnceLock because get_or_try_init is unstable.
    state: Mutex<Option<SemanticState>>,
}

impl SemanticTagService {
    pub fn new(config: SemanticSearchConfig, base_path: PathBuf) -> SemanticTagService {
        SemanticTagService {
            config,
            base_path,
            state: Mutex::new(None),
        }
    }

    fn with_state<T>(
        &self,
        op: impl FnOnce(&mut SemanticState) -> Result<T, SemanticSearchError>,
    ) -> Result<T, SemanticSearchError> {
        if !self.config.enabled {
            return Err(SemanticSearchError::Disabled);
        }

        let mut guard = self
            .state
            .lock()
            .map_err(|_| SemanticSearchError::Internal("state lock poisoned".to_string()))?;

        if guard.is_none() {
            *guard = Some(self.initialize()?);
        }
        match guard.as_mut() {
            Some(state) => op(state),
            None => Err(SemanticSearchError::Internal(
                "state missing after init".to_string(),
            )),
        }
    }

    fn initialize(&self) -> Result<SemanticState, SemanticSearchError> {
        let model = EmbeddingModel::new(
            &self.config.model,
            &self.base_path.join("models"),
            Duration::from_secs(self.config.download_timeout_secs),
        )?;
        let storage = TagVectorStorage::new(self.base_path.join("vectors.bin"));

        let index = if storage.exists() {
            match storage.load(&model.model_id_hash(), model.dimensions()) {
                Ok(index) => {
                    log::info!("loaded {} tag vectors", index.len());
                    index
                }
                Err(VectorStorageError::Io(err)) => {
                    return Err(VectorStorageError::Io(err).into());
                }
                // A stale or corrupted index is rebuilt tag by tag as
                // items get enriched, never merged.
                Err(err) => {
                    log::warn!("tag vector index unusable ({err}), starting fresh");
                    TagIndex::new(model.dimensions())
                }
            }
        } else {
            TagIndex::new(model.dimensions())
        };

        Ok(SemanticState {
            model,
            index,
            storage,
        })
    }
}

impl TagSemantics for SemanticTagService {
    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn ensure_tags(&self, tags: &[String]) -> Result<usize, SemanticSearchError> {
        if tags.is_empty() {
            return Ok(0);
        }

        self.with_state(|state| {
            let missing = state.index.missing(tags.iter());
            if missing.is_empty() {
                return Ok(0);
            }

            let embeddings = state.model.embed_batch(&missing)?;
            let mut added = 0;
            for (tag, embedding) in missing.into_iter().zip(embeddings) {
                match state.index.insert(tag.clone(), embedding) {
                    Ok(()) => added += 1,
                    Err(err) => log::warn!("skipping tag {tag:?}: {err}"),
                }
            }

            if added > 0 {
                // In-memory index stays usable even when the flush fails.
                if let Err(err) = state.storage.save(&state.index, &state.model.model_id_hash()) {
                    log::warn!("tag vector index save failed: {err}");
                }
            }
            Ok(added)
        })
    }

    fn similar_tags(
        &self,
        query: &str,
        threshold: Option<f32>,
        limit: usize,
    ) -> Result<Vec<TagMatch>, SemanticSearchError> {
        self.with_state(|state| {
            if state.index.is_empty() {
                return Ok(vec![]);
            }
            let embedding = state.model.embed(query)?;
            let threshold = threshold.unwrap_or(self.config.default_threshold);
            Ok(state.index.search(&embedding, threshold, limit)?)
        })
    }

    fn save_index(&self) -> Result<(), SemanticSearchError> {
        if !self.config.enabled {
            return Err(SemanticSearchError::Disabled);
        }
        let guard = self
            .state
            .lock()
            .map_err(|_| SemanticSearchError::Internal("state lock poisoned".to_string()))?;
        // Never initializes: saving at shutdown must not trigger a model
        // download.
        match guard.as_ref() {
            Some(state) => {
                state
                    .storage
                    .save(&state.index, &state.model.model_id_hash())?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
