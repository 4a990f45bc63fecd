//! Content-addressed embedding cache.
//!
//! Rebuilds re-embed the whole working set; items whose text did not change
//! hit the cache and skip the model.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct EmbeddingCache {
    entries: HashMap<u64, Vec<f32>>,
    dimensions: usize,
}

impl EmbeddingCache {
    pub fn new(dimensions: usize) -> Self {
        Self {
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

    pub fn get(&self, key: u64) -> Option<&[f32]> {
        self.entries.get(&key).map(Vec::as_slice)
    }

    /// Vectors of the wrong dimensions are ignored.
    pub fn insert(&mut self, key: u64, vector: Vec<f32>) {
        if vector.len() == self.dimensions {
            self.entries.insert(key, vector);
        }
    }

    /// Keep only the entries whose keys are in `live`.
    pub fn retain_keys(&mut self, live: &std::collections::HashSet<u64>) {
        self.entries.retain(|key, _| live.contains(key));
    }

    /// Entries sorted by key, so the file layout is deterministic.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f32])> {
        let mut keys: Vec<&u64> = self.entries.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(move |key| (*key, self.entries[key].as_slice()))
    }
}
