//! Inventory store: the authoritative item records the index is reconciled against.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::facets::FacetSet;
use crate::normalize::{base_hue, canonical_color, canonical_occasion, canonical_set, canonical_size};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("item already exists: {0}")]
    AlreadyExists(String),

    #[error("malformed record on line {line}: {message}")]
    Malformed { line: u64, message: String },

    #[error("inventory lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Available,
    Archived,
    Deleted,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Available => "available",
            ItemStatus::Archived => "archived",
            ItemStatus::Deleted => "deleted",
        }
    }

    /// Deleted items never come back into the index.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Deleted)
    }

    pub fn is_sellable(&self) -> bool {
        matches!(self, ItemStatus::Available)
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "available" => Ok(ItemStatus::Available),
            "archived" => Ok(ItemStatus::Archived),
            "deleted" => Ok(ItemStatus::Deleted),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    #[default]
    None,
    Pending,
    PendingRemove,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::None => "",
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::PendingRemove => "pending_remove",
        }
    }
}

impl FromStr for EmbeddingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "none" => Ok(EmbeddingStatus::None),
            "pending" => Ok(EmbeddingStatus::Pending),
            "pending_remove" => Ok(EmbeddingStatus::PendingRemove),
            other => Err(format!("unknown embedding status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: ItemStatus,
    pub embedding_status: EmbeddingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Occasions flagged on the item, as canonical slugs.
    #[serde(default)]
    pub occasions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_commercial: Option<String>,
    #[serde(default)]
    pub sizes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl InventoryItem {
    /// Has an image and is not soft-deleted.
    pub fn is_indexable(&self) -> bool {
        !self.status.is_terminal()
            && self
                .image
                .as_deref()
                .map(|img| !img.trim().is_empty())
                .unwrap_or(false)
    }

    pub fn occasion_set(&self) -> FacetSet {
        canonical_set(&self.occasions, canonical_occasion)
    }

    /// Base hues of the item: the declared base color plus the hue of its commercial name.
    pub fn base_colors(&self) -> FacetSet {
        let mut set = FacetSet::new();
        if let Some(base) = self.color_base.as_deref() {
            let canonical = canonical_color(base);
            if let Some(hue) = base_hue(&canonical) {
                set.insert(hue);
            }
            if !canonical.is_empty() {
                set.insert(canonical);
            }
        }
        if let Some(hue) = self.color_commercial.as_deref().and_then(base_hue) {
            set.insert(hue);
        }
        set
    }

    pub fn commercial_colors(&self) -> FacetSet {
        canonical_set(self.color_commercial.iter(), canonical_color)
    }

    pub fn size_set(&self) -> FacetSet {
        canonical_set(&self.sizes, canonical_size)
    }
}

/// Which edits require the item to be re-embedded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReembedPolicy {
    /// Size list changes trigger re-embedding. Off unless configured.
    pub size_triggers: bool,
}

/// Partial edit of an inventory item.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ItemUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_commercial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occasions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
}

impl ItemUpdate {
    /// Apply the edit and return whether a trigger field actually changed.
    ///
    /// Image, title, description, colors and occasions always trigger; sizes
    /// only under `policy.size_triggers`; price and status never do.
    pub fn apply(self, item: &mut InventoryItem, policy: ReembedPolicy) -> bool {
        let mut triggered = false;

        fn set<T: PartialEq>(slot: &mut T, value: Option<T>) -> bool {
            match value {
                Some(value) if *slot != value => {
                    *slot = value;
                    true
                }
                _ => false,
            }
        }

        triggered |= set(&mut item.title, self.title);
        triggered |= set(&mut item.description, self.description);
        triggered |= set(&mut item.image, self.image.map(Some));
        triggered |= set(&mut item.color_base, self.color_base.map(Some));
        triggered |= set(&mut item.color_commercial, self.color_commercial.map(Some));
        triggered |= set(
            &mut item.occasions,
            self.occasions
                .map(|values| canonical_set(values, canonical_occasion)),
        );
        triggered |= set(&mut item.category, self.category.map(Some));

        let sizes_changed = set(&mut item.sizes, self.sizes);
        if policy.size_triggers {
            triggered |= sizes_changed;
        }

        set(&mut item.price, self.price.map(Some));
        set(&mut item.status, self.status);

        if triggered && item.embedding_status == EmbeddingStatus::None {
            item.embedding_status = EmbeddingStatus::Pending;
        }

        triggered
    }
}

/// One page of a paginated inventory scan.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<InventoryItem>,
    /// Cursor for the next page, `None` when the store is exhausted.
    pub next: Option<usize>,
}

pub trait InventoryStore: Send + Sync {
    fn scan(&self, cursor: Option<usize>, page_size: usize) -> Result<ScanPage, InventoryError>;
    fn get(&self, id: &str) -> Result<Option<InventoryItem>, InventoryError>;
    fn insert(&self, item: InventoryItem) -> Result<(), InventoryError>;
    fn set_embedding_status(&self, id: &str, status: EmbeddingStatus) -> Result<(), InventoryError>;
    /// Reset the embedding flag only if the stored item still equals `seen`.
    /// Returns whether the flag was cleared.
    fn clear_embedding_status(&self, seen: &InventoryItem) -> Result<bool, InventoryError>;
    fn apply_update(
        &self,
        id: &str,
        update: ItemUpdate,
        policy: ReembedPolicy,
    ) -> Result<InventoryItem, InventoryError>;
    fn soft_delete(&self, id: &str) -> Result<InventoryItem, InventoryError>;
}

/// Walk every page of the store.
pub fn scan_all(
    store: &dyn InventoryStore,
    page_size: usize,
) -> Result<Vec<InventoryItem>, InventoryError> {
    let mut items = vec![];
    let mut cursor = None;
    loop {
        let page = store.scan(cursor, page_size)?;
        items.extend(page.items);
        match page.next {
            Some(next) => cursor = Some(next),
            None => return Ok(items),
        }
    }
}

const CSV_HEADERS: [&str; 12] = [
    "id",
    "title",
    "description",
    "status",
    "embedding_status",
    "category",
    "occasions",
    "color_base",
    "color_commercial",
    "sizes",
    "price",
    "image",
];

/// CSV-backed inventory, fully held in memory and rewritten on every mutation.
#[derive(Debug, Clone)]
pub struct InventoryCsv {
    list: Arc<RwLock<Vec<InventoryItem>>>,
    path: PathBuf,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl InventoryCsv {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new inventory at {}", path.display());
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;

        let mut items = vec![];
        for (idx, record) in csv_reader.records().enumerate() {
            let record = record?;
            let line = idx as u64 + 2;
            let field = |i: usize| record.get(i).unwrap_or_default();
            let malformed = |message: String| InventoryError::Malformed { line, message };

            let id = field(0).trim().to_string();
            if id.is_empty() {
                return Err(malformed("empty id".to_string()));
            }

            let price = match non_empty(field(10)) {
                Some(raw) => Some(
                    raw.parse::<f64>()
                        .map_err(|e| malformed(format!("price '{raw}': {e}")))?,
                ),
                None => None,
            };

            items.push(InventoryItem {
                id,
                title: field(1).to_string(),
                description: field(2).to_string(),
                status: field(3).parse().map_err(malformed)?,
                embedding_status: field(4).parse().map_err(malformed)?,
                category: non_empty(field(5)),
                occasions: canonical_set(split_list(field(6)), canonical_occasion),
                color_base: non_empty(field(7)),
                color_commercial: non_empty(field(8)),
                sizes: split_list(field(9)),
                price,
                image: non_empty(field(11)),
            });
        }

        log::debug!(
            "took {}ms to read inventory csv ({} items)",
            now.elapsed().as_micros() as f64 / 1000.0,
            items.len()
        );

        Ok(InventoryCsv {
            list: Arc::new(RwLock::new(items)),
            path: path.to_path_buf(),
        })
    }

    fn save(&self, items: &[InventoryItem]) -> Result<(), InventoryError> {
        let temp_path = self.path.with_extension("csv-tmp");
        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for item in items {
            let occasions = item.occasions.iter().cloned().collect::<Vec<_>>().join(",");
            let sizes = item.sizes.join(",");
            let price = item.price.map(|p| p.to_string()).unwrap_or_default();
            csv_wrt.write_record([
                item.id.as_str(),
                item.title.as_str(),
                item.description.as_str(),
                item.status.as_str(),
                item.embedding_status.as_str(),
                item.category.as_deref().unwrap_or_default(),
                occasions.as_str(),
                item.color_base.as_deref().unwrap_or_default(),
                item.color_commercial.as_deref().unwrap_or_default(),
                sizes.as_str(),
                price.as_str(),
                item.image.as_deref().unwrap_or_default(),
            ])?;
        }
        csv_wrt.flush()?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<InventoryItem, InventoryError>
    where
        F: FnOnce(&mut InventoryItem),
    {
        let mut items = self.list.write().map_err(|_| InventoryError::Poisoned)?;
        let position = items
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| InventoryError::NotFound(id.to_string()))?;
        let mut updated = items[position].clone();
        f(&mut updated);
        if updated == items[position] {
            return Ok(updated);
        }

        // memory only changes once the file has
        let previous = std::mem::replace(&mut items[position], updated.clone());
        if let Err(err) = self.save(&items) {
            items[position] = previous;
            return Err(err);
        }
        Ok(updated)
    }
}

impl InventoryStore for InventoryCsv {
    fn scan(&self, cursor: Option<usize>, page_size: usize) -> Result<ScanPage, InventoryError> {
        let items = self.list.read().map_err(|_| InventoryError::Poisoned)?;
        let start = cursor.unwrap_or(0).min(items.len());
        let end = start.saturating_add(page_size.max(1)).min(items.len());

        Ok(ScanPage {
            items: items[start..end].to_vec(),
            next: if end < items.len() { Some(end) } else { None },
        })
    }

    fn get(&self, id: &str) -> Result<Option<InventoryItem>, InventoryError> {
        let items = self.list.read().map_err(|_| InventoryError::Poisoned)?;
        Ok(items.iter().find(|item| item.id == id).cloned())
    }

    fn insert(&self, item: InventoryItem) -> Result<(), InventoryError> {
        let mut items = self.list.write().map_err(|_| InventoryError::Poisoned)?;
        if items.iter().any(|existing| existing.id == item.id) {
            return Err(InventoryError::AlreadyExists(item.id));
        }
        items.push(item);
        if let Err(err) = self.save(&items) {
            items.pop();
            return Err(err);
        }
        Ok(())
    }

    fn set_embedding_status(&self, id: &str, status: EmbeddingStatus) -> Result<(), InventoryError> {
        self.mutate(id, |item| item.embedding_status = status)
            .map(|_| ())
    }

    fn clear_embedding_status(&self, seen: &InventoryItem) -> Result<bool, InventoryError> {
        let mut cleared = false;
        self.mutate(&seen.id, |item| {
            if *item == *seen {
                item.embedding_status = EmbeddingStatus::None;
                cleared = true;
            }
        })?;
        Ok(cleared)
    }

    fn apply_update(
        &self,
        id: &str,
        update: ItemUpdate,
        policy: ReembedPolicy,
    ) -> Result<InventoryItem, InventoryError> {
        self.mutate(id, |item| {
            if update.apply(item, policy) {
                log::debug!("item {} marked for re-embedding", item.id);
            }
        })
    }

    fn soft_delete(&self, id: &str) -> Result<InventoryItem, InventoryError> {
        self.mutate(id, |item| {
            item.status = ItemStatus::Deleted;
            item.embedding_status = EmbeddingStatus::PendingRemove;
        })
    }
}
