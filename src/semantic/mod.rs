//! Local semantic expansion over item tags.
//!
//! Keywords produced by enrichment double as tags. Each tag gets a
//! local fastembed embedding, and search can widen a query to items
//! whose tags are semantically close to it. Everything runs offline
//! after the one-time model download.
//!
//! - `embeddings`: wraps fastembed for embedding generation
//! - `index`: in-memory tag index with cosine similarity search
//! - `storage`: binary file I/O for vectors.bin persistence
//! - `service`: lazy high-level service behind the [`TagSemantics`] seam

pub mod embeddings;
mod index;
mod service;
mod storage;

pub use embeddings::{EmbeddingError, EmbeddingModel};
pub use index::{IndexError, TagIndex, TagMatch};
pub use service::{SemanticSearchError, SemanticTagService, TagSemantics};
pub use storage::{TagVectorStorage, VectorStorageError};

/// Default embedding model name (bge-base offers +13% accuracy vs MiniLM)
pub const DEFAULT_MODEL: &str = "bge-base-en-v1.5";

/// Default similarity threshold for tag expansion
pub const DEFAULT_THRESHOLD: f32 = 0.35;
