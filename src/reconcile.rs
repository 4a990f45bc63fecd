//! Reconciliation between the inventory and the index.
//!
//! `status` diffs the inventory against the live metadata. `rebuild` consumes
//! that diff: it drops orphaned and flagged records from the working set,
//! regenerates metadata for new and pending items, re-embeds the survivors
//! (through the embedding cache) and commits a new generation. Nothing
//! replaces the live generation until the commit succeeds.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};

use rayon::prelude::*;
use serde::Serialize;

use crate::catalog::{
    content_hash, embedding_text, read_cache, read_index_header, read_metadata, write_cache,
    CatalogError, EmbeddingCache, EmbeddingError, IndexError, IndexSnapshot, IndexService,
    IndexStorageError, VectorIndex,
};
use crate::facets::{FacetKind, FacetRecord};
use crate::generator::MetadataGenerator;
use crate::inventory::{scan_all, EmbeddingStatus, InventoryError, InventoryItem, InventoryStore};
use crate::lock::FileLock;
use crate::vocabulary::VocabularyDigest;

const SCAN_PAGE_SIZE: usize = 500;
const EMBED_BATCH_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("a rebuild is already running")]
    AlreadyRunning,

    #[error("failed to take the rebuild lock: {0}")]
    Locked(std::io::Error),

    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index construction failed: {0}")]
    Index(#[from] IndexError),

    #[error("index storage failed: {0}")]
    Storage(#[from] IndexStorageError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("failed to start generation workers: {0}")]
    Workers(#[from] rayon::ThreadPoolBuildError),
}

/// Diff between the inventory and the live index generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub generation: Option<u64>,
    /// Indexable inventory items
    pub db_count: usize,
    pub index_count: usize,
    pub metadata_count: usize,
    pub missing_ids: Vec<String>,
    pub orphaned_ids: Vec<String>,
    pub pending_ids: Vec<String>,
    pub pending_remove_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity_error: Option<String>,
}

impl SyncStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.missing_ids.is_empty()
            && self.orphaned_ids.is_empty()
            && self.pending_ids.is_empty()
            && self.pending_remove_ids.is_empty()
            && self.integrity_error.is_none()
    }
}

/// One item whose metadata could not be generated this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildOutcome {
    UpToDate,
    Rebuilt,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub outcome: RebuildOutcome,
    pub message: String,
    pub generation: Option<u64>,
    /// Entries in the committed index
    pub indexed: usize,
    /// Items sent through the metadata generator
    pub generated: usize,
    /// Vectors computed by the embedder; the rest came from the cache
    pub embedded: usize,
    pub cache_hits: usize,
    pub removed: usize,
    pub full_rebuild: bool,
    pub failed: Vec<FailedItem>,
}

impl RebuildReport {
    fn up_to_date(generation: Option<u64>, indexed: usize) -> Self {
        Self {
            outcome: RebuildOutcome::UpToDate,
            message: "already up to date".to_string(),
            generation,
            indexed,
            generated: 0,
            embedded: 0,
            cache_hits: 0,
            removed: 0,
            full_rebuild: false,
            failed: vec![],
        }
    }
}

/// Rebuild phases reported to a progress observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPhase {
    Generating,
    Embedding,
}

impl RebuildPhase {
    pub fn label(&self) -> &'static str {
        match self {
            RebuildPhase::Generating => "generating",
            RebuildPhase::Embedding => "embedding",
        }
    }
}

/// Receives rebuild progress. Called from worker threads.
pub trait RebuildProgress: Sync {
    fn start(&self, _phase: RebuildPhase, _total: usize) {}
    fn advance(&self, _count: usize) {}
    fn finish(&self) {}
}

/// Discards progress.
pub struct NoProgress;

impl RebuildProgress for NoProgress {}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Directory holding `catalog.lock`
    pub lock_dir: PathBuf,
    /// Generation workers; 0 lets rayon decide
    pub workers: usize,
    pub digest_values_per_facet: usize,
}

/// Live metadata of the current generation as read from disk.
struct LiveState {
    generation: Option<u64>,
    index_count: usize,
    metadata: Vec<FacetRecord>,
    integrity_error: Option<String>,
}

pub struct Reconciler {
    inventory: Arc<dyn InventoryStore>,
    index: Arc<IndexService>,
    generator: Arc<MetadataGenerator>,
    options: ReconcileOptions,
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        inventory: Arc<dyn InventoryStore>,
        index: Arc<IndexService>,
        generator: Arc<MetadataGenerator>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            inventory,
            index,
            generator,
            options,
            running: Mutex::new(()),
        }
    }

    /// Diff the inventory against the committed generation.
    pub fn status(&self) -> Result<SyncStatus, RebuildError> {
        let items = scan_all(self.inventory.as_ref(), SCAN_PAGE_SIZE)?;
        let live = self.read_live();
        Ok(diff(&items, &live))
    }

    /// Bring the index in line with the inventory.
    ///
    /// An integrity error rebuilds the whole index from the readable records.
    /// `reset` also regenerates every item's metadata and discards the
    /// embedding cache.
    pub fn rebuild(
        &self,
        reset: bool,
        progress: &dyn RebuildProgress,
    ) -> Result<RebuildReport, RebuildError> {
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(RebuildError::AlreadyRunning),
            // a panicked rebuild left nothing half-committed
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let _lock = FileLock::try_acquire(&self.options.lock_dir).map_err(RebuildError::Locked)?;
        let _span = tracing::info_span!("rebuild", reset).entered();

        let items = scan_all(self.inventory.as_ref(), SCAN_PAGE_SIZE)?;
        let live = self.read_live();
        let status = diff(&items, &live);

        if !reset && status.is_up_to_date() {
            log::info!("index is already up to date ({} entries)", status.index_count);
            return Ok(RebuildReport::up_to_date(status.generation, status.index_count));
        }

        let full = reset || status.integrity_error.is_some();
        if reset {
            log::info!("reset requested, regenerating every item");
            self.index.store().discard_cache()?;
        } else if let Some(err) = &status.integrity_error {
            log::warn!("integrity error, rebuilding the whole index: {}", err);
        }

        let items_by_id: HashMap<&str, &InventoryItem> =
            items.iter().map(|item| (item.id.as_str(), item)).collect();

        // Working set: surviving records of the live generation, first occurrence wins
        let dropped: HashSet<&str> = status
            .orphaned_ids
            .iter()
            .chain(&status.pending_ids)
            .chain(&status.pending_remove_ids)
            .map(String::as_str)
            .collect();
        let orphaned: HashSet<&str> = status.orphaned_ids.iter().map(String::as_str).collect();
        let mut working: Vec<FacetRecord> = Vec::new();
        let mut kept_ids = HashSet::new();
        let mut removed = 0;
        for record in &live.metadata {
            if orphaned.contains(record.id.as_str()) {
                removed += 1;
                continue;
            }
            if reset || dropped.contains(record.id.as_str()) || !kept_ids.insert(record.id.clone()) {
                continue;
            }
            working.push(record.clone());
        }

        let to_generate: Vec<&InventoryItem> = if reset {
            items.iter().filter(|item| item.is_indexable()).collect()
        } else {
            status
                .missing_ids
                .iter()
                .chain(&status.pending_ids)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter_map(|id| items_by_id.get(id.as_str()).copied())
                .collect()
        };

        log::info!(
            "rebuilding index: {} kept, {} to generate, {} removed",
            working.len(),
            to_generate.len(),
            removed
        );

        let digest = VocabularyDigest::from_records(&live.metadata, self.options.digest_values_per_facet);
        let (generated, mut failed) = self.generate(&to_generate, &digest, progress)?;
        let generated_count = to_generate.len();
        let succeeded: HashSet<String> = generated.iter().map(|r| r.id.clone()).collect();
        working.extend(generated);

        // Occasions and colors always reflect the live item
        for record in working.iter_mut() {
            if let Some(item) = items_by_id.get(record.id.as_str()) {
                refresh_live_facets(record, item);
            }
        }

        let (records, index, embedded, cache_hits) = self.embed(working, &mut failed, progress)?;

        let model_id = self.index.embedder().model_id_hash();
        let generation = self.index.store().commit(&index, &records, &model_id)?;
        let indexed = records.len();
        self.index
            .install(IndexSnapshot::new(Some(generation), index, records)?)?;
        log::info!("committed index generation {} with {} entries", generation, indexed);

        self.clear_flags(&status, &succeeded, &items_by_id);

        let message = if failed.is_empty() {
            format!("indexed {indexed} items")
        } else {
            format!("indexed {indexed} items, {} failed", failed.len())
        };

        Ok(RebuildReport {
            outcome: RebuildOutcome::Rebuilt,
            message,
            generation: Some(generation),
            indexed,
            generated: generated_count,
            embedded,
            cache_hits,
            removed,
            full_rebuild: full,
            failed,
        })
    }

    fn read_live(&self) -> LiveState {
        let store = self.index.store();
        let generation = match store.current_generation() {
            Ok(generation) => generation,
            Err(err) => {
                return LiveState {
                    generation: None,
                    index_count: 0,
                    metadata: vec![],
                    integrity_error: Some(format!("unreadable generation pointer: {err}")),
                }
            }
        };
        let Some(generation) = generation else {
            return LiveState {
                generation: None,
                index_count: 0,
                metadata: vec![],
                integrity_error: None,
            };
        };

        let metadata = read_metadata(&store.metadata_path(generation));
        let header = read_index_header(&store.index_path(generation));
        let (metadata, header) = match (metadata, header) {
            (Ok(metadata), Ok(header)) => (metadata, header),
            (metadata, header) => {
                let err = header
                    .err()
                    .map(|e| format!("unreadable index: {e}"))
                    .or_else(|| metadata.err().map(|e| format!("unreadable metadata: {e}")))
                    .unwrap_or_default();
                return LiveState {
                    generation: Some(generation),
                    index_count: 0,
                    metadata: vec![],
                    integrity_error: Some(err),
                };
            }
        };

        let embedder = self.index.embedder();
        let index_count = header.entry_count as usize;
        let distinct: HashSet<&str> = metadata.iter().map(|r| r.id.as_str()).collect();

        let integrity_error = if header.model_id != embedder.model_id_hash()
            || header.dimensions as usize != embedder.dimensions()
        {
            Some("index was built with a different embedding model".to_string())
        } else if metadata.len() != index_count {
            Some(format!(
                "metadata has {} records but index has {} vectors",
                metadata.len(),
                index_count
            ))
        } else if distinct.len() != index_count {
            Some(format!(
                "{} distinct ids for {} index entries",
                distinct.len(),
                index_count
            ))
        } else {
            None
        };

        LiveState {
            generation: Some(generation),
            index_count,
            metadata,
            integrity_error,
        }
    }

    /// Generate records in parallel. Per-item failures are collected.
    fn generate(
        &self,
        items: &[&InventoryItem],
        digest: &VocabularyDigest,
        progress: &dyn RebuildProgress,
    ) -> Result<(Vec<FacetRecord>, Vec<FailedItem>), RebuildError> {
        if items.is_empty() {
            return Ok((vec![], vec![]));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .build()?;

        progress.start(RebuildPhase::Generating, items.len());
        let results: Vec<(String, Result<FacetRecord, String>)> = pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    let result = self
                        .generator
                        .generate_for(item, digest)
                        .map(|generated| FacetRecord {
                            id: item.id.clone(),
                            title: generated.title,
                            description: generated.description,
                            category: item.category.clone(),
                            facets: generated.facets,
                            keywords: generated.keywords,
                            image: item.image.clone(),
                            embedded_at: chrono::Utc::now(),
                        })
                        .map_err(|e| e.to_string());
                    progress.advance(1);
                    (item.id.clone(), result)
                })
                .collect()
        });
        progress.finish();

        let mut records = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (id, result) in results {
            match result {
                Ok(record) => records.push(record),
                Err(error) => {
                    log::warn!("metadata generation failed for {}: {}", id, error);
                    failed.push(FailedItem { id, error });
                }
            }
        }
        log::info!("generated {} records, {} failed", records.len(), failed.len());
        Ok((records, failed))
    }

    /// Embed the working set into a fresh index.
    ///
    /// Records without any text are dropped and reported. Embedder errors
    /// abort the rebuild.
    fn embed(
        &self,
        records: Vec<FacetRecord>,
        failed: &mut Vec<FailedItem>,
        progress: &dyn RebuildProgress,
    ) -> Result<(Vec<FacetRecord>, VectorIndex, usize, usize), RebuildError> {
        let embedder = self.index.embedder();
        let model = embedder.name().to_string();
        let model_id = embedder.model_id_hash();
        let dimensions = embedder.dimensions();
        let cache_path = self.index.store().cache_path();

        let mut cache = match read_cache(&cache_path, &model_id, dimensions) {
            Ok(cache) => cache,
            Err(IndexStorageError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                EmbeddingCache::new(dimensions)
            }
            Err(err) => {
                log::warn!("discarding embedding cache: {}", err);
                EmbeddingCache::new(dimensions)
            }
        };

        let mut texts = Vec::with_capacity(records.len());
        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            match embedding_text(&record) {
                Some(text) => {
                    texts.push(text);
                    kept.push(record);
                }
                None => failed.push(FailedItem {
                    id: record.id.clone(),
                    error: "no text to embed".to_string(),
                }),
            }
        }

        let keys: Vec<u64> = texts.iter().map(|text| content_hash(&model, text)).collect();
        let misses: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, key)| cache.get(**key).is_none())
            .map(|(i, _)| i)
            .collect();
        let cache_hits = keys.len() - misses.len();

        progress.start(RebuildPhase::Embedding, misses.len());
        for chunk in misses.chunks(EMBED_BATCH_SIZE) {
            let batch: Vec<String> = chunk.iter().map(|&i| texts[i].clone()).collect();
            let vectors = embedder.embed_batch(&batch)?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingError::EmbeddingFailed(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                ))
                .into());
            }
            for (&i, vector) in chunk.iter().zip(vectors) {
                if vector.len() != dimensions {
                    return Err(IndexError::DimensionMismatch {
                        expected: dimensions,
                        got: vector.len(),
                    }
                    .into());
                }
                cache.insert(keys[i], vector);
            }
            progress.advance(chunk.len());
        }
        progress.finish();
        log::info!("embedded {} records, {} from cache", misses.len(), cache_hits);

        let mut index = VectorIndex::with_capacity(dimensions, kept.len());
        for key in &keys {
            let vector = cache
                .get(*key)
                .ok_or_else(|| EmbeddingError::EmbeddingFailed("vector missing after embedding".to_string()))?;
            index.push(vector.to_vec())?;
        }

        let live: HashSet<u64> = keys.into_iter().collect();
        cache.retain_keys(&live);
        if let Err(err) = write_cache(&cache_path, &cache, &model_id) {
            log::warn!("failed to save embedding cache: {}", err);
        }

        Ok((kept, index, misses.len(), cache_hits))
    }

    /// Clear processed flags. Items that failed stay pending for the next
    /// cycle, and so do items edited after the scan this rebuild started from.
    fn clear_flags(
        &self,
        status: &SyncStatus,
        succeeded: &HashSet<String>,
        scanned: &HashMap<&str, &InventoryItem>,
    ) {
        let pending = status.pending_ids.iter().filter(|id| succeeded.contains(*id));
        for id in pending.chain(&status.pending_remove_ids) {
            let Some(seen) = scanned.get(id.as_str()) else {
                continue;
            };
            match self.inventory.clear_embedding_status(seen) {
                Ok(true) => {}
                Ok(false) => log::info!("item {} changed during the rebuild, keeping it pending", id),
                Err(err) => log::warn!("failed to clear embedding flag of {}: {}", id, err),
            }
        }
    }
}

/// Overwrite a record's occasions with the item's current flags and add its colors.
fn refresh_live_facets(record: &mut FacetRecord, item: &InventoryItem) {
    let occasions = item.occasion_set();
    record.facets.occasions = (!occasions.is_empty()).then_some(occasions);
    record
        .facets
        .extend(FacetKind::Colors, item.commercial_colors().iter().chain(&item.base_colors()));
    record.category = item.category.clone();
}

fn diff(items: &[InventoryItem], live: &LiveState) -> SyncStatus {
    let db_ids: BTreeSet<&str> = items
        .iter()
        .filter(|item| item.is_indexable())
        .map(|item| item.id.as_str())
        .collect();
    let pending: BTreeSet<&str> = items
        .iter()
        .filter(|item| item.embedding_status == EmbeddingStatus::Pending && item.is_indexable())
        .map(|item| item.id.as_str())
        .collect();
    let pending_remove: BTreeSet<&str> = items
        .iter()
        .filter(|item| item.embedding_status == EmbeddingStatus::PendingRemove)
        .map(|item| item.id.as_str())
        .collect();
    let index_ids: BTreeSet<&str> = live.metadata.iter().map(|r| r.id.as_str()).collect();

    let missing = db_ids
        .iter()
        .filter(|id| {
            !index_ids.contains(*id) && !pending.contains(*id) && !pending_remove.contains(*id)
        })
        .map(|id| id.to_string())
        .collect();
    let orphaned = index_ids
        .iter()
        .filter(|id| !db_ids.contains(*id))
        .map(|id| id.to_string())
        .collect();

    let to_vec = |set: BTreeSet<&str>| set.into_iter().map(str::to_string).collect();

    SyncStatus {
        generation: live.generation,
        db_count: db_ids.len(),
        index_count: live.index_count,
        metadata_count: live.metadata.len(),
        missing_ids: missing,
        orphaned_ids: orphaned,
        pending_ids: to_vec(pending),
        pending_remove_ids: to_vec(pending_remove),
        integrity_error: live.integrity_error.clone(),
    }
}
