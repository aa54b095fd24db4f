pub mod authoring;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod ranking;
pub mod service;
pub mod sources;
pub mod stores;
pub mod tools;
pub mod traits;

pub use authoring::{AuthoringTools, IssueKind, QualityIssue, QualityIssueSource, StaticQualityIssues};
pub use chunking::TextChunker;
pub use config::{
    AgentConfig, ChunkingConfig, CoreConfig, EmbeddingConfig, ExtractionConfig, ModelConfig,
    RetrievalConfig,
};
pub use embeddings::{CharacterNgramEmbedder, Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{EmbeddingError, IngestError, ModelError, StoreError, ToolError};
pub use extractor::{Extractor, PageText};
pub use ingest::{digest_bytes, IngestReceipt, IngestRequest, IngestionPipeline, Visibility};
pub use llm::{AnthropicClient, LanguageModel};
pub use models::{
    Chunk, Citation, ConversationTurn, Document, DocumentStatus, DocumentSummary, FileFormat,
    RetrievalResult, Role, SearchScope, TraceEntry,
};
pub use orchestrator::{AgentEvent, AgentLoop, DonePayload, LoopProfile, RunStatus, StepEvent, StepStatus};
pub use ranking::Ranker;
pub use service::{AuthoringRequest, CorpusService, QueryRequest, QueryStream};
pub use sources::{sync_source, ExternalFileSource, LocalFolderSource, SourceConfig, SyncReport};
pub use stores::{MemoryChunkStore, SqliteChunkStore};
pub use tools::{KnowledgeTool, KnowledgeTools, RunOutcome, ToolOutput, Toolset};
pub use traits::ChunkStore;
