//! On-disk persistence for the vector index, its metadata and the embedding cache.
//!
//! Vector file format (`index.<gen>.bin`, `embeddings.cache`):
//!
//! Header (51 bytes):
//! - magic: [u8; 4] (`CSIX` for the index, `CSEC` for the cache)
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Index entries are bare `[f32; dimensions]` in position order. Cache entries
//! are prefixed with a u64 content key.
//!
//! The index and `metadata.<gen>.json` form one generation. The `CURRENT`
//! file names the live generation and is only ever replaced by rename, so
//! readers see either the old pair or the new pair, never a mix.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::catalog::cache::EmbeddingCache;
use crate::catalog::index::VectorIndex;
use crate::facets::FacetRecord;

const FORMAT_VERSION: u8 = 1;
const HEADER_SIZE: usize = 51;
const INDEX_MAGIC: [u8; 4] = *b"CSIX";
const CACHE_MAGIC: [u8; 4] = *b"CSEC";
const CURRENT_FILE: &str = "CURRENT";

#[derive(Debug, thiserror::Error)]
pub enum IndexStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Metadata has {metadata} records but index has {index} vectors")]
    Misaligned { metadata: usize, index: usize },
}

/// Parsed vector file header.
#[derive(Debug, Clone)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u8,
    pub model_id: [u8; 32],
    pub dimensions: u16,
    pub entry_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes[5..37].copy_from_slice(&self.model_id);
        bytes[37..39].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[39..47].copy_from_slice(&self.entry_count.to_le_bytes());
        let checksum = crc32fast::hash(&bytes[0..47]);
        bytes[47..51].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE], magic: [u8; 4]) -> Result<Self, IndexStorageError> {
        if bytes[0..4] != magic {
            return Err(IndexStorageError::InvalidFormat(format!(
                "expected magic {:?}",
                String::from_utf8_lossy(&magic)
            )));
        }

        let version = bytes[4];
        if version > FORMAT_VERSION {
            return Err(IndexStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes([bytes[47], bytes[48], bytes[49], bytes[50]]);
        if stored_checksum != crc32fast::hash(&bytes[0..47]) {
            return Err(IndexStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&bytes[5..37]);
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[39..47]);

        Ok(Header {
            magic,
            version,
            model_id,
            dimensions: u16::from_le_bytes([bytes[37], bytes[38]]),
            entry_count: u64::from_le_bytes(count),
        })
    }

    fn validate(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), IndexStorageError> {
        if self.model_id != *expected_model_id {
            return Err(IndexStorageError::ModelMismatch);
        }
        if self.dimensions as usize != expected_dimensions {
            return Err(IndexStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: self.dimensions as usize,
            });
        }
        Ok(())
    }
}

fn read_header(
    reader: &mut impl Read,
    magic: [u8; 4],
) -> Result<Header, IndexStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;
    Header::decode(&bytes, magic)
}

fn read_vector(reader: &mut impl Read, dimensions: usize) -> Result<Vec<f32>, IndexStorageError> {
    let mut embedding = Vec::with_capacity(dimensions);
    let mut float_bytes = [0u8; 4];
    for _ in 0..dimensions {
        reader.read_exact(&mut float_bytes)?;
        embedding.push(f32::from_le_bytes(float_bytes));
    }
    Ok(embedding)
}

/// Write through a temp file, fsync, then rename over `path`.
fn write_atomic<F>(path: &Path, write: F) -> Result<(), IndexStorageError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), IndexStorageError>,
{
    let temp_path = path.with_extension("tmp");

    let result = (|| {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn write_index(
    path: &Path,
    index: &VectorIndex,
    model_id: &[u8; 32],
) -> Result<(), IndexStorageError> {
    write_atomic(path, |writer| {
        let header = Header {
            magic: INDEX_MAGIC,
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions: index.dimensions() as u16,
            entry_count: index.count() as u64,
        };
        writer.write_all(&header.encode())?;
        for vector in index.iter() {
            for value in vector {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        Ok(())
    })
}

pub fn read_index(
    path: &Path,
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<VectorIndex, IndexStorageError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(&mut reader, INDEX_MAGIC)?;
    header.validate(expected_model_id, expected_dimensions)?;

    let dimensions = header.dimensions as usize;
    let mut index = VectorIndex::with_capacity(dimensions, header.entry_count as usize);
    for position in 0..header.entry_count {
        let vector = read_vector(&mut reader, dimensions)?;
        // A vector that cannot be pushed would shift every later position.
        index.push(vector).map_err(|e| {
            IndexStorageError::InvalidFormat(format!("vector at position {position}: {e}"))
        })?;
    }

    Ok(index)
}

/// Read only the header of an index file.
pub fn read_index_header(path: &Path) -> Result<Header, IndexStorageError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header(&mut reader, INDEX_MAGIC)
}

pub fn write_cache(
    path: &Path,
    cache: &EmbeddingCache,
    model_id: &[u8; 32],
) -> Result<(), IndexStorageError> {
    write_atomic(path, |writer| {
        let header = Header {
            magic: CACHE_MAGIC,
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions: cache.dimensions() as u16,
            entry_count: cache.len() as u64,
        };
        writer.write_all(&header.encode())?;
        for (key, vector) in cache.iter() {
            writer.write_all(&key.to_le_bytes())?;
            for value in vector {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        Ok(())
    })
}

pub fn read_cache(
    path: &Path,
    expected_model_id: &[u8; 32],
    expected_dimensions: usize,
) -> Result<EmbeddingCache, IndexStorageError> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = read_header(&mut reader, CACHE_MAGIC)?;
    header.validate(expected_model_id, expected_dimensions)?;

    let dimensions = header.dimensions as usize;
    let mut cache = EmbeddingCache::new(dimensions);
    let mut key_bytes = [0u8; 8];
    for _ in 0..header.entry_count {
        reader.read_exact(&mut key_bytes)?;
        let vector = read_vector(&mut reader, dimensions)?;
        cache.insert(u64::from_le_bytes(key_bytes), vector);
    }

    Ok(cache)
}

pub fn write_metadata(path: &Path, records: &[FacetRecord]) -> Result<(), IndexStorageError> {
    write_atomic(path, |writer| {
        serde_json::to_writer(&mut *writer, records)?;
        Ok(())
    })
}

pub fn read_metadata(path: &Path) -> Result<Vec<FacetRecord>, IndexStorageError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// File layout of the index directory and the generation pointer.
#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn index_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("index.{generation}.bin"))
    }

    pub fn metadata_path(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("metadata.{generation}.json"))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.dir.join("embeddings.cache")
    }

    /// The live generation, `None` when nothing has been committed yet.
    pub fn current_generation(&self) -> Result<Option<u64>, IndexStorageError> {
        let path = self.dir.join(CURRENT_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => content
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|e| IndexStorageError::InvalidFormat(format!("CURRENT: {e}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Write a new generation and atomically make it the live one.
    ///
    /// Nothing becomes visible until the pointer rename; a failure before it
    /// leaves the previous generation live.
    pub fn commit(
        &self,
        index: &VectorIndex,
        metadata: &[FacetRecord],
        model_id: &[u8; 32],
    ) -> Result<u64, IndexStorageError> {
        if index.count() != metadata.len() {
            return Err(IndexStorageError::Misaligned {
                metadata: metadata.len(),
                index: index.count(),
            });
        }

        std::fs::create_dir_all(&self.dir)?;
        let previous = self.current_generation()?;
        let generation = previous.map(|g| g + 1).unwrap_or(1);

        let index_path = self.index_path(generation);
        let metadata_path = self.metadata_path(generation);
        let staged = write_index(&index_path, index, model_id)
            .and_then(|_| write_metadata(&metadata_path, metadata));
        if let Err(err) = staged {
            let _ = std::fs::remove_file(&index_path);
            let _ = std::fs::remove_file(&metadata_path);
            return Err(err);
        }

        write_atomic(&self.dir.join(CURRENT_FILE), |writer| {
            writer.write_all(format!("{generation}\n").as_bytes())?;
            Ok(())
        })?;

        // readers may still hold the previous pair open
        self.prune(&[generation, previous.unwrap_or(generation)]);
        Ok(generation)
    }

    /// Remove files of every generation not in `keep`.
    fn prune(&self, keep: &[u64]) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            let generation = name
                .strip_prefix("index.")
                .and_then(|rest| rest.strip_suffix(".bin"))
                .or_else(|| {
                    name.strip_prefix("metadata.")
                        .and_then(|rest| rest.strip_suffix(".json"))
                })
                .and_then(|g| g.parse::<u64>().ok());

            if matches!(generation, Some(g) if !keep.contains(&g)) {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    log::warn!("failed to prune {}: {}", name, err);
                }
            }
        }
    }

    /// Delete the embedding cache. Committed generations are untouched.
    pub fn discard_cache(&self) -> Result<(), IndexStorageError> {
        match std::fs::remove_file(self.cache_path()) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facets::Facets;

    fn test_model_id() -> [u8; 32] {
        let mut id = [0u8; 32];
        id[0] = 0xAB;
        id[31] = 0xCD;
        id
    }

    fn record(id: &str) -> FacetRecord {
        FacetRecord {
            id: id.to_string(),
            title: format!("Vestido {id}"),
            description: "Vestido longo".to_string(),
            category: None,
            facets: Facets::default(),
            keywords: vec![],
            image: None,
            embedded_at: chrono::Utc::now(),
        }
    }

    fn three_vectors() -> VectorIndex {
        let mut index = VectorIndex::new(3);
        index.push(vec![1.0, 0.0, 0.0]).unwrap();
        index.push(vec![0.0, 1.0, 0.0]).unwrap();
        index.push(vec![0.0, 0.0, 1.0]).unwrap();
        index
    }

    #[test]
    fn test_index_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        write_index(&path, &three_vectors(), &test_model_id()).unwrap();

        let loaded = read_index(&path, &test_model_id(), 3).unwrap();
        assert_eq!(loaded.count(), 3);
        assert_eq!(loaded.vector(1), Some(&[0.0, 1.0, 0.0][..]));
        assert_eq!(read_index_header(&path).unwrap().entry_count, 3);
    }

    #[test]
    fn test_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        write_index(&path, &VectorIndex::new(3), &test_model_id()).unwrap();

        let mut wrong_model_id = [0u8; 32];
        wrong_model_id[0] = 0xFF;
        let result = read_index(&path, &wrong_model_id, 3);
        assert!(matches!(result, Err(IndexStorageError::ModelMismatch)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        write_index(&path, &VectorIndex::new(3), &test_model_id()).unwrap();

        let result = read_index(&path, &test_model_id(), 384);
        assert!(matches!(result, Err(IndexStorageError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        use std::io::{Seek, SeekFrom};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        write_index(&path, &three_vectors(), &test_model_id()).unwrap();

        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = read_index(&path, &test_model_id(), 3);
        assert!(matches!(result, Err(IndexStorageError::ChecksumMismatch)));
    }

    #[test]
    fn test_cache_file_is_not_an_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.cache");
        let mut cache = EmbeddingCache::new(2);
        cache.insert(7, vec![0.5, 0.5]);
        write_cache(&path, &cache, &test_model_id()).unwrap();

        assert!(matches!(
            read_index(&path, &test_model_id(), 2),
            Err(IndexStorageError::InvalidFormat(_))
        ));
        let loaded = read_cache(&path, &test_model_id(), 2).unwrap();
        assert_eq!(loaded.get(7), Some(&[0.5, 0.5][..]));
    }

    #[test]
    fn test_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/index.bin");
        let result = write_index(&path, &VectorIndex::new(3), &test_model_id());
        assert!(result.is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_commit_swaps_generation_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path().to_path_buf());
        assert_eq!(store.current_generation().unwrap(), None);

        let metadata = vec![record("a"), record("b"), record("c")];
        let first = store.commit(&three_vectors(), &metadata, &test_model_id()).unwrap();
        assert_eq!(first, 1);
        let second = store.commit(&three_vectors(), &metadata, &test_model_id()).unwrap();
        assert_eq!(second, 2);

        // the replaced generation survives until the next swap
        assert_eq!(store.current_generation().unwrap(), Some(2));
        assert!(store.index_path(1).exists());
        assert!(store.metadata_path(1).exists());
        assert_eq!(read_metadata(&store.metadata_path(2)).unwrap(), metadata);

        let third = store.commit(&three_vectors(), &metadata, &test_model_id()).unwrap();
        assert_eq!(third, 3);
        assert!(!store.index_path(1).exists());
        assert!(!store.metadata_path(1).exists());
        assert!(store.index_path(2).exists());
        assert!(store.index_path(3).exists());
    }

    #[test]
    fn test_commit_rejects_misaligned_pair() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path().to_path_buf());
        let metadata = vec![record("a")];

        let result = store.commit(&three_vectors(), &metadata, &test_model_id());
        assert!(matches!(result, Err(IndexStorageError::Misaligned { .. })));
        assert_eq!(store.current_generation().unwrap(), None);
    }

    #[test]
    fn test_discard_cache_keeps_generations() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path().to_path_buf());
        let metadata = vec![record("a"), record("b"), record("c")];
        store.commit(&three_vectors(), &metadata, &test_model_id()).unwrap();
        std::fs::write(store.cache_path(), b"stale").unwrap();

        store.discard_cache().unwrap();
        assert!(!store.cache_path().exists());
        assert_eq!(store.current_generation().unwrap(), Some(1));
        assert!(store.index_path(1).exists());

        // nothing to discard is fine
        store.discard_cache().unwrap();
    }
}
