//! Vector index infrastructure for the catalog.
//!
//! # Architecture
//!
//! - `embeddings`: embedding backends (fastembed in-process, or a remote API)
//! - `index`: positional in-memory vector index with cosine search
//! - `storage`: binary index files, JSON metadata and the generation pointer
//! - `cache`: content-addressed embedding cache
//! - `preprocess`: embedding text for records and queries
//! - `service`: lazily loaded, swappable live generation

mod cache;
pub mod embeddings;
mod index;
mod preprocess;
mod service;
mod storage;

pub use cache::EmbeddingCache;
pub use embeddings::{Embedder, EmbeddingError, EmbeddingModel, RemoteEmbedder};
pub use index::{IndexError, VectorIndex};
pub use preprocess::{content_hash, embedding_text, query_embedding_text};
pub use service::{CatalogError, IndexService, IndexSnapshot};
pub use storage::{
    read_cache, read_index_header, read_metadata, write_cache, IndexStorageError, IndexStore,
};
