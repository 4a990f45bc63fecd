//! Cross-module tests with deterministic fakes for the embedder, the chat
//! model and image fetching.

mod embeddings;
mod search;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::catalog::{Embedder, EmbeddingError, IndexService, IndexStore};
use crate::config::SearchConfig;
use crate::generator::{GeneratorOptions, MetadataGenerator};
use crate::images::{ImageError, ImageSource};
use crate::inventory::{InventoryCsv, InventoryItem, InventoryStore};
use crate::llm::{ChatModel, ChatRequest, LlmError};
use crate::normalize::fold_text;
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::rewrite::{QueryRewriter, RewriteCache};
use crate::search::SearchService;

pub const DIMENSIONS: usize = 32;

/// Bag-of-words embedder: every folded word bumps one hashed dimension.
/// The last dimension is a constant bias so no vector has zero norm.
pub struct WordEmbedder {
    pub embedded: AtomicUsize,
    pub fail: AtomicBool,
}

impl WordEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            embedded: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    pub fn embedded(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; DIMENSIONS];
        vector[DIMENSIONS - 1] = 0.1;
        for word in fold_text(text).split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            let hash = word
                .bytes()
                .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
            vector[(hash % (DIMENSIONS as u64 - 1)) as usize] += 1.0;
        }
        vector
    }
}

impl Embedder for WordEmbedder {
    fn name(&self) -> &str {
        "word-bag"
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbeddingError::EmbeddingFailed("embedder offline".to_string()));
        }
        self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Chat model answering every call with the same reply.
pub struct CannedChat {
    reply: String,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl CannedChat {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(vec![]),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChatModel for CannedChat {
    fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.reply.clone())
    }
}

/// Serves a small PNG for every reference except `missing.jpg`.
pub struct FixtureImages;

impl ImageSource for FixtureImages {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, ImageError> {
        if reference == "missing.jpg" {
            return Err(ImageError::NotAnImage(reference.to_string()));
        }
        let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([30, 60, 200, 255]));
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        Ok(buf)
    }
}

pub const VISION_REPLY: &str = r#"{"description": "Vestido longo em crepe", "title": "Vestido Gerado",
    "occasions": ["formatura"], "colors": [], "fabrics": ["crepe"], "silhouette": ["evase"],
    "neckline": ["tomara que caia"], "sleeves": [], "details": [], "keywords": ["longo"]}"#;

pub struct ItemSpec<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub occasions: &'a [&'a str],
    pub color_base: Option<&'a str>,
    pub color_commercial: Option<&'a str>,
    pub sizes: &'a [&'a str],
}

impl ItemSpec<'_> {
    pub fn build(&self) -> InventoryItem {
        InventoryItem {
            id: self.id.to_string(),
            title: self.title.to_string(),
            description: self.description.to_string(),
            occasions: self.occasions.iter().map(|o| o.to_string()).collect(),
            color_base: self.color_base.map(str::to_string),
            color_commercial: self.color_commercial.map(str::to_string),
            sizes: self.sizes.iter().map(|s| s.to_string()).collect(),
            price: Some(350.0),
            image: Some(format!("{}.jpg", self.id)),
            ..Default::default()
        }
    }
}

/// An isolated data directory with inventory, index and reconciler.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub inventory: Arc<InventoryCsv>,
    pub embedder: Arc<WordEmbedder>,
    pub vision: Arc<CannedChat>,
    pub index: Arc<IndexService>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(items: Vec<InventoryItem>) -> Self {
        Self::with_images(items, Arc::new(FixtureImages))
    }

    pub fn with_images(items: Vec<InventoryItem>, images: Arc<dyn ImageSource>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let inventory = Arc::new(
            InventoryCsv::load(&dir.path().join("inventory.csv")).expect("failed to create inventory"),
        );
        for item in items {
            inventory.insert(item).unwrap();
        }

        let embedder = WordEmbedder::new();
        let index = Arc::new(IndexService::new(
            IndexStore::new(dir.path().join("index")),
            embedder.clone(),
        ));

        let vision = CannedChat::new(VISION_REPLY);
        let generator = Arc::new(MetadataGenerator::new(
            vision.clone(),
            images,
            GeneratorOptions {
                vision_model: "vision".to_string(),
                copy_model: "copy".to_string(),
                force: false,
                copywriting: false,
                image_max_dimension: 256,
            },
        ));

        let reconciler = Reconciler::new(
            inventory.clone(),
            index.clone(),
            generator,
            ReconcileOptions {
                lock_dir: dir.path().to_path_buf(),
                workers: 2,
                digest_values_per_facet: 32,
            },
        );

        Self {
            dir,
            inventory,
            embedder,
            vision,
            index,
            reconciler,
        }
    }

    pub fn store(&self) -> Arc<dyn InventoryStore> {
        self.inventory.clone()
    }

    /// Search service; with a chat model, queries go through the rewriter.
    pub fn search(&self, chat: Option<Arc<dyn ChatModel>>, config: SearchConfig) -> SearchService {
        let rewriter = chat.map(|chat| {
            Arc::new(QueryRewriter::new(
                chat,
                "rewrite",
                RewriteCache::new(std::time::Duration::from_secs(900), 64),
            ))
        });
        SearchService::new(self.index.clone(), self.store(), rewriter, config, 32)
    }
}
