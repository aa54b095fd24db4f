use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_MODEL_BASE_URL: &str = "https://api.anthropic.com/v1/";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_EMBEDDING_BASE_URL: &str = "https://api.openai.com/v1/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    Png,
    Jpeg { quality: u8 },
}

impl ImageEncoding {
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg { .. } => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTier {
    pub dpi: u32,
    pub encoding: ImageEncoding,
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub text_dense_min_chars: usize,
    pub text_dense_max_images: usize,
    pub max_workers: usize,
    pub sheet_chunk_rows: usize,
    pub image_budget_bytes: usize,
    pub render_tiers: Vec<RenderTier>,
    pub unit_timeout: Duration,
    pub conversion_timeout: Duration,
    pub vision_max_tokens: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            text_dense_min_chars: 500,
            text_dense_max_images: 2,
            max_workers: 5,
            sheet_chunk_rows: 200,
            // ~5MB once base64 encoded
            image_budget_bytes: 3_700_000,
            render_tiers: vec![
                RenderTier {
                    dpi: 300,
                    encoding: ImageEncoding::Png,
                },
                RenderTier {
                    dpi: 200,
                    encoding: ImageEncoding::Png,
                },
                RenderTier {
                    dpi: 150,
                    encoding: ImageEncoding::Png,
                },
                RenderTier {
                    dpi: 150,
                    encoding: ImageEncoding::Jpeg { quality: 85 },
                },
                RenderTier {
                    dpi: 150,
                    encoding: ImageEncoding::Jpeg { quality: 60 },
                },
            ],
            unit_timeout: Duration::from_secs(120),
            conversion_timeout: Duration::from_secs(120),
            vision_max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 77,
            separators: ["\n## ", "\n### ", "\n\n", "\n", "。", "、", " ", ""]
                .iter()
                .map(|separator| separator.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub catalog_page_size: usize,
    pub recency_weight: f64,
    pub recency_horizon: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            max_top_k: 20,
            catalog_page_size: 50,
            recency_weight: 0.03,
            recency_horizon: Duration::from_secs(180 * 86_400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub query_ceiling: usize,
    pub authoring_ceiling: usize,
    pub query_history_turns: usize,
    pub authoring_history_turns: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub authoring_output_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            query_ceiling: 10,
            authoring_ceiling: 15,
            query_history_turns: 10,
            authoring_history_turns: 20,
            max_tokens: 4096,
            temperature: 0.3,
            authoring_output_dir: PathBuf::from("generated_docs"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EMBEDDING_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: 1536,
            batch_size: 100,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub extraction: ExtractionConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub agent: AgentConfig,
    pub model: ModelConfig,
    pub embedding: EmbeddingConfig,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            lookup(name).and_then(|value| {
                let value = value.trim().to_string();
                if value.is_empty() {
                    None
                } else {
                    Some(value)
                }
            })
        };

        let mut config = Self::default();

        config.model.api_key = read("ANTHROPIC_API_KEY");
        if let Some(base_url) = read("ANTHROPIC_BASE_URL") {
            config.model.base_url = base_url;
        }
        if let Some(model) = read("ANTHROPIC_MODEL") {
            config.model.model = model;
        }

        config.embedding.api_key = read("OPENAI_API_KEY");
        if let Some(base_url) = read("OPENAI_BASE_URL") {
            config.embedding.base_url = base_url;
        }
        if let Some(model) = read("OPENAI_EMBEDDING_MODEL") {
            config.embedding.model = model;
        }

        if let Some(size) = read("CORPUS_AGENT_CHUNK_SIZE").and_then(|value| value.parse().ok()) {
            config.chunking.chunk_size = size;
        }
        if let Some(overlap) =
            read("CORPUS_AGENT_CHUNK_OVERLAP").and_then(|value| value.parse().ok())
        {
            config.chunking.chunk_overlap = overlap;
        }
        if let Some(top_k) = read("CORPUS_AGENT_TOP_K").and_then(|value| value.parse().ok()) {
            config.retrieval.default_top_k = top_k;
        }

        config
    }
}
