use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

/// Default local embedding model (multilingual, the catalog is in Portuguese)
const DEFAULT_EMBEDDING_MODEL: &str = "multilingual-e5-small";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_VISION_MODEL: &str = "gpt-4o";

/// Search orchestration knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Upper bound for a request's `limit`
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// Limit used when a request does not specify one
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// First window is `max(limit * k_multiplier, k_minimum)`
    #[serde(default = "default_k_multiplier")]
    pub k_multiplier: usize,

    #[serde(default = "default_k_minimum")]
    pub k_minimum: usize,

    /// Each expansion grows the window to `max(k + expansion_step, 2k)`
    #[serde(default = "default_expansion_step")]
    pub expansion_step: usize,

    /// Return unconstrained candidates when constraints would eliminate all of them
    #[serde(default = "default_true")]
    pub degrade_constraints: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_limit: default_max_limit(),
            default_limit: default_limit(),
            k_multiplier: default_k_multiplier(),
            k_minimum: default_k_minimum(),
            expansion_step: default_expansion_step(),
            degrade_constraints: true,
        }
    }
}

fn default_max_limit() -> usize {
    48
}

fn default_limit() -> usize {
    12
}

fn default_k_multiplier() -> usize {
    20
}

fn default_k_minimum() -> usize {
    80
}

fn default_expansion_step() -> usize {
    80
}

fn default_true() -> bool {
    true
}

/// Query rewriting and its cache
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RewriteConfig {
    #[serde(default = "default_rewrite_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum cached rewrites; oldest entries are evicted on write
    #[serde(default = "default_rewrite_capacity")]
    pub capacity: usize,

    /// Overrides `llm.chat_model` for rewriting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Observed values per facet passed to the model as hints
    #[serde(default = "default_digest_values_per_facet")]
    pub digest_values_per_facet: usize,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_rewrite_ttl_secs(),
            capacity: default_rewrite_capacity(),
            model: None,
            digest_values_per_facet: default_digest_values_per_facet(),
        }
    }
}

fn default_rewrite_ttl_secs() -> u64 {
    900
}

fn default_rewrite_capacity() -> usize {
    512
}

fn default_digest_values_per_facet() -> usize {
    32
}

/// Index synchronization
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether editing an item's size list marks it for re-embedding
    #[serde(default)]
    pub reembed_on_size_change: bool,

    /// Run a second model pass that rewrites title and description
    #[serde(default)]
    pub copywriting: bool,

    /// Call the vision model even when title and description already exist
    #[serde(default)]
    pub force_regenerate: bool,

    /// Parallelism for metadata generation: "auto" or a positive integer
    #[serde(default = "default_parallelism")]
    pub parallelism: String,

    /// Longest side, in pixels, of images sent to the vision model
    #[serde(default = "default_image_max_dimension")]
    pub image_max_dimension: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reembed_on_size_change: false,
            copywriting: false,
            force_regenerate: false,
            parallelism: default_parallelism(),
            image_max_dimension: default_image_max_dimension(),
        }
    }
}

impl SyncConfig {
    /// Number of generation workers; 0 lets rayon decide.
    pub fn worker_count(&self) -> usize {
        self.parallelism.parse::<usize>().unwrap_or(0)
    }
}

fn default_parallelism() -> String {
    "auto".to_string()
}

fn default_image_max_dimension() -> u32 {
    1024
}

/// OpenAI-compatible model endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            vision_model: default_vision_model(),
            chat_model: default_chat_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_vision_model() -> String {
    DEFAULT_VISION_MODEL.to_string()
}

fn default_chat_model() -> String {
    DEFAULT_CHAT_MODEL.to_string()
}

fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// fastembed model running in-process
    #[default]
    Local,
    /// `embeddings` endpoint of the configured LLM API
    Remote,
}

/// Embedding generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    /// Model name (e.g., "multilingual-e5-small", "text-embedding-3-small")
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Local,
            model: default_embedding_model(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        }
    }
}

fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let search = &self.search;
        if search.max_limit == 0 {
            bail!("search.max_limit must be greater than 0");
        }
        if search.default_limit == 0 || search.default_limit > search.max_limit {
            bail!(
                "search.default_limit must be between 1 and search.max_limit ({}), got {}",
                search.max_limit,
                search.default_limit
            );
        }
        if search.k_multiplier == 0 || search.k_minimum == 0 || search.expansion_step == 0 {
            bail!("search.k_multiplier, search.k_minimum and search.expansion_step must be greater than 0");
        }

        if self.rewrite.capacity == 0 {
            bail!("rewrite.capacity must be greater than 0");
        }

        // parallelism: "auto" or positive integer
        let sync = &self.sync;
        if sync.parallelism != "auto" {
            match sync.parallelism.parse::<u32>() {
                Ok(0) => bail!("sync.parallelism must be 'auto' or a positive integer, got '0'"),
                Err(_) => bail!(
                    "sync.parallelism must be 'auto' or a positive integer, got '{}'",
                    sync.parallelism
                ),
                Ok(_) => {}
            }
        }
        if sync.image_max_dimension < 64 {
            bail!(
                "sync.image_max_dimension must be at least 64, got {}",
                sync.image_max_dimension
            );
        }

        if self.llm.timeout_secs == 0 {
            bail!("llm.timeout_secs must be greater than 0");
        }
        if self.embedding.download_timeout_secs == 0 {
            bail!("embedding.download_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Model used by the query rewriter.
    pub fn rewrite_model(&self) -> &str {
        self.rewrite.model.as_deref().unwrap_or(&self.llm.chat_model)
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, defaults)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self.base_path.join(CONFIG_FILE);
        let temp = path.with_extension("yaml-tmp");
        std::fs::write(&temp, serde_yml::to_string(&self)?)?;
        std::fs::rename(&temp, &path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
