use crate::{
    app::App,
    catalog::{Embedder, EmbeddingModel, IndexService, IndexStore, RemoteEmbedder},
    config::{Config, EmbeddingProvider},
    generator::{GeneratorOptions, MetadataGenerator},
    images::HttpImageSource,
    inventory::{InventoryCsv, InventoryStore},
    llm::{ChatModel, ChatRequest, LlmError, OpenAiClient},
    reconcile::{ReconcileOptions, Reconciler},
    rewrite::{QueryRewriter, RewriteCache},
    search::SearchService,
};
use anyhow::{Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Application factory wiring stores, models and services together
pub struct AppFactory;

/// Files and directories under the data directory
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    pub inventory_path: PathBuf,
    pub index_dir: PathBuf,
    pub images_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            inventory_path: base_path.join("inventory.csv"),
            index_dir: base_path.join("index"),
            images_dir: base_path.join("images"),
            base_path,
        }
    }
}

/// Stand-in chat model when no API key is configured. Every call fails, so
/// items that need the model are reported as failed and retried next sync.
struct UnconfiguredChat {
    api_key_env: String,
}

impl ChatModel for UnconfiguredChat {
    fn complete(&self, _request: &ChatRequest) -> Result<String, LlmError> {
        Err(LlmError::MissingApiKey(self.api_key_env.clone()))
    }
}

impl AppFactory {
    /// Get application paths, creating the data directory
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;
        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;
        Ok(AppPaths::new(base_path))
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("CATALOG_DIR") {
            return Ok(PathBuf::from(path));
        }
        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/catalog-search"))
    }

    pub fn create_app(paths: &AppPaths) -> Result<App> {
        let config = Config::load_with(&paths.base_path)?;

        let inventory: Arc<dyn InventoryStore> = Arc::new(
            InventoryCsv::load(&paths.inventory_path)
                .with_context(|| format!("Failed to open {}", paths.inventory_path.display()))?,
        );

        let client = match OpenAiClient::from_config(&config.llm) {
            Ok(client) => Some(client),
            Err(err) => {
                log::warn!("model API unavailable, query rewriting and metadata generation are disabled: {}", err);
                None
            }
        };

        let embedder = Self::create_embedder(&config, paths, client.clone())?;
        let index = Arc::new(IndexService::new(IndexStore::new(paths.index_dir.clone()), embedder));

        let chat: Arc<dyn ChatModel> = match &client {
            Some(client) => Arc::new(client.clone()),
            None => Arc::new(UnconfiguredChat {
                api_key_env: config.llm.api_key_env.clone(),
            }),
        };

        let rewriter = client.as_ref().map(|_| {
            Arc::new(QueryRewriter::new(
                chat.clone(),
                config.rewrite_model(),
                RewriteCache::new(Duration::from_secs(config.rewrite.ttl_secs), config.rewrite.capacity),
            ))
        });

        let images = Arc::new(
            HttpImageSource::new(paths.images_dir.clone()).context("Failed to create image client")?,
        );
        let generator = Arc::new(MetadataGenerator::new(
            chat,
            images,
            GeneratorOptions {
                vision_model: config.llm.vision_model.clone(),
                copy_model: config.llm.chat_model.clone(),
                force: config.sync.force_regenerate,
                copywriting: config.sync.copywriting,
                image_max_dimension: config.sync.image_max_dimension,
            },
        ));

        let search = SearchService::new(
            index.clone(),
            inventory.clone(),
            rewriter,
            config.search.clone(),
            config.rewrite.digest_values_per_facet,
        );
        let reconciler = Reconciler::new(
            inventory,
            index,
            generator,
            ReconcileOptions {
                lock_dir: paths.base_path.clone(),
                workers: config.sync.worker_count(),
                digest_values_per_facet: config.rewrite.digest_values_per_facet,
            },
        );

        Ok(App {
            config,
            search,
            reconciler,
        })
    }

    fn create_embedder(
        config: &Config,
        paths: &AppPaths,
        client: Option<OpenAiClient>,
    ) -> Result<Arc<dyn Embedder>> {
        let embedding = &config.embedding;
        match embedding.provider {
            EmbeddingProvider::Local => {
                log::info!("Loading embedding model {}", embedding.model);
                let model = EmbeddingModel::new(
                    &embedding.model,
                    paths.base_path.clone(),
                    Some(Duration::from_secs(embedding.download_timeout_secs)),
                )
                .context("Failed to load embedding model")?;
                Ok(Arc::new(model))
            }
            EmbeddingProvider::Remote => {
                let client = client.with_context(|| {
                    format!(
                        "embedding.provider is remote but {} is not set",
                        config.llm.api_key_env
                    )
                })?;
                let model = RemoteEmbedder::new(client, &embedding.model)
                    .context("Failed to reach the embeddings endpoint")?;
                Ok(Arc::new(model))
            }
        }
    }
}
