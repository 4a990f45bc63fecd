//! Process-wide handle on the live index generation.
//!
//! - Lazily loads the current generation on first use
//! - Duplicate concurrent loads are prevented by a double-checked load lock
//! - Readers hold an `Arc` to the snapshot they started with, so a rebuild
//!   swapping in a new generation never changes an in-flight search

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::catalog::embeddings::{Embedder, EmbeddingError};
use crate::catalog::index::{IndexError, VectorIndex};
use crate::catalog::storage::{self, IndexStorageError, IndexStore};
use crate::facets::FacetRecord;

/// Errors that can occur while serving the index.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] IndexStorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// One generation of the index with its positionally aligned metadata.
pub struct IndexSnapshot {
    generation: Option<u64>,
    index: VectorIndex,
    metadata: Vec<FacetRecord>,
    positions: HashMap<String, usize>,
}

impl IndexSnapshot {
    /// Pair an index with its metadata. Fails unless they have the same length.
    pub fn new(
        generation: Option<u64>,
        index: VectorIndex,
        metadata: Vec<FacetRecord>,
    ) -> Result<Self, IndexStorageError> {
        if index.count() != metadata.len() {
            return Err(IndexStorageError::Misaligned {
                metadata: metadata.len(),
                index: index.count(),
            });
        }

        let mut positions = HashMap::with_capacity(metadata.len());
        for (position, record) in metadata.iter().enumerate() {
            positions.entry(record.id.clone()).or_insert(position);
        }

        Ok(Self {
            generation,
            index,
            metadata,
            positions,
        })
    }

    pub fn empty(dimensions: usize) -> Self {
        Self {
            generation: None,
            index: VectorIndex::new(dimensions),
            metadata: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn metadata(&self) -> &[FacetRecord] {
        &self.metadata
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }

    pub fn record(&self, position: usize) -> Option<&FacetRecord> {
        self.metadata.get(position)
    }

    /// First position holding `id`.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }
}

/// Shared access to the embedder and the live index generation.
pub struct IndexService {
    store: IndexStore,
    embedder: Arc<dyn Embedder>,
    snapshot: RwLock<Option<Arc<IndexSnapshot>>>,
    load_lock: Mutex<()>,
    loads: AtomicUsize,
}

impl IndexService {
    pub fn new(store: IndexStore, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            snapshot: RwLock::new(None),
            load_lock: Mutex::new(()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Number of times the index was read from disk.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// The live snapshot, loading it from disk on first use.
    pub fn snapshot(&self) -> Result<Arc<IndexSnapshot>, CatalogError> {
        if let Some(snapshot) = self.current()? {
            return Ok(snapshot);
        }

        let _guard = self
            .load_lock
            .lock()
            .map_err(|e| CatalogError::Internal(format!("Lock poisoned: {}", e)))?;

        // another thread may have finished loading while we waited
        if let Some(snapshot) = self.current()? {
            return Ok(snapshot);
        }

        let snapshot = Arc::new(self.load()?);
        *self
            .snapshot
            .write()
            .map_err(|e| CatalogError::Internal(format!("Lock poisoned: {}", e)))? =
            Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Replace the live snapshot after a committed rebuild.
    pub fn install(&self, snapshot: IndexSnapshot) -> Result<Arc<IndexSnapshot>, CatalogError> {
        let _guard = self
            .load_lock
            .lock()
            .map_err(|e| CatalogError::Internal(format!("Lock poisoned: {}", e)))?;

        let snapshot = Arc::new(snapshot);
        *self
            .snapshot
            .write()
            .map_err(|e| CatalogError::Internal(format!("Lock poisoned: {}", e)))? =
            Some(snapshot.clone());
        Ok(snapshot)
    }

    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>, CatalogError> {
        Ok(self.embedder.embed(text)?)
    }

    fn current(&self) -> Result<Option<Arc<IndexSnapshot>>, CatalogError> {
        let guard = self
            .snapshot
            .read()
            .map_err(|e| CatalogError::Internal(format!("Lock poisoned: {}", e)))?;
        Ok(guard.clone())
    }

    fn load(&self) -> Result<IndexSnapshot, CatalogError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let dimensions = self.embedder.dimensions();

        let Some(generation) = self.store.current_generation()? else {
            log::info!("no index generation yet, starting empty");
            return Ok(IndexSnapshot::empty(dimensions));
        };

        let model_id = self.embedder.model_id_hash();
        let index = match storage::read_index(&self.store.index_path(generation), &model_id, dimensions)
        {
            Ok(index) => index,
            Err(IndexStorageError::ModelMismatch) => {
                log::warn!("index generation {} was built with a different model, serving empty index until next sync", generation);
                return Ok(IndexSnapshot::empty(dimensions));
            }
            Err(IndexStorageError::VersionMismatch(file_ver, _)) => {
                log::warn!("index format version {} unsupported, serving empty index until next sync", file_ver);
                return Ok(IndexSnapshot::empty(dimensions));
            }
            Err(e) => {
                log::error!("failed to load index generation {}: {}", generation, e);
                return Err(e.into());
            }
        };
        let metadata = storage::read_metadata(&self.store.metadata_path(generation))?;

        let snapshot = IndexSnapshot::new(Some(generation), index, metadata)?;
        log::info!(
            "loaded index generation {} with {} entries",
            generation,
            snapshot.count()
        );
        Ok(snapshot)
    }
}
