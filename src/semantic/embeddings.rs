//! Thin wrapper around fastembed. The first use of an enabled model
//! downloads its weights into the data directory, everything after that
//! is offline.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fastembed::{InitOptions, TextEmbedding};

/// fastembed's embed() needs &mut self, hence the Mutex.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("model initialization failed: {0}")]
    InitFailed(String),

    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("model download did not finish within {0} seconds")]
    DownloadTimeout(u64),

    #[error("unknown model {0:?}, supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5 (-q suffix for quantized)")]
    InvalidModel(String),
}

impl EmbeddingModel {
    /// Load (and on first use download) a model into `models_dir`.
    pub fn new(
        model_name: &str,
        models_dir: &Path,
        download_timeout: Duration,
    ) -> Result<EmbeddingModel, EmbeddingError> {
        let model_enum = parse_model_name(model_name)?;

        std::fs::create_dir_all(models_dir).map_err(|err| {
            EmbeddingError::InitFailed(format!("cannot create models directory: {err}"))
        })?;

        log::info!("loading embedding model {model_name} (downloads on first use)");
        let started = Instant::now();
        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir.to_path_buf())
            .with_show_download_progress(false);

        let mut model = TextEmbedding::try_new(options).map_err(|err| {
            // fastembed gives no dedicated timeout error, so classify by
            // how long the attempt ran.
            if started.elapsed() >= download_timeout {
                EmbeddingError::DownloadTimeout(download_timeout.as_secs())
            } else {
                EmbeddingError::InitFailed(err.to_string())
            }
        })?;

        let dimensions = probe_dimensions(&mut model)?;
        log::debug!("embedding model {model_name} ready, {dimensions} dimensions");

        Ok(EmbeddingModel {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| EmbeddingError::EmbeddingFailed("model lock poisoned".to_string()))?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|err| EmbeddingError::EmbeddingFailed(err.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("no embedding returned".to_string()))
    }

    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| EmbeddingError::EmbeddingFailed("model lock poisoned".to_string()))?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|err| EmbeddingError::EmbeddingFailed(err.to_string()))
    }

    /// SHA256 of the model name, written into the vector file header so
    /// an index built by one model is never served by another.
    pub fn model_id_hash(&self) -> [u8; 32] {
        model_id_for(&self.model_name)
    }
}

pub fn model_id_for(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-small-en-v1.5-q" | "bgesmallenv15q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-base-en-v1.5-q" | "bgebaseenv15q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
        "bge-large-en-v1.5" | "bgelargeenv15" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "bge-large-en-v1.5-q" | "bgelargeenv15q" => Ok(fastembed::EmbeddingModel::BGELargeENV15Q),
        _ => Err(EmbeddingError::InvalidModel(name.to_string())),
    }
}

fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
    let probe = model
        .embed(vec!["probe"], None)
        .map_err(|err| EmbeddingError::InitFailed(format!("dimension probe failed: {err}")))?;

    probe
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::InitFailed("model returned no embedding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_model_names() {
        let dir = tempfile::tempdir().unwrap();
        let result = EmbeddingModel::new("definitely-not-a-model", dir.path(), Duration::from_secs(1));
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn model_names_are_case_insensitive() {
        assert!(parse_model_name("BGE-Base-EN-v1.5").is_ok());
        assert!(parse_model_name("all-MiniLM-L6-v2").is_ok());
    }

    #[test]
    fn model_ids_differ_between_models() {
        let base = model_id_for("bge-base-en-v1.5");
        let small = model_id_for("bge-small-en-v1.5");
        assert_ne!(base, small);
        assert_eq!(base, model_id_for("bge-base-en-v1.5"));
    }

    // Needs a network round trip for the model weights.
    #[test]
    #[ignore = "requires model download"]
    fn embeds_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let model =
            EmbeddingModel::new("all-MiniLM-L6-v2", dir.path(), Duration::from_secs(300)).unwrap();
        assert_eq!(model.dimensions(), 384);

        let embedding = model.embed("hello world").unwrap();
        assert_eq!(embedding.len(), 384);
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }
}
