use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use corpus_agent_core::{
    AgentEvent, AgentLoop, AnthropicClient, AuthoringRequest, CharacterNgramEmbedder,
    ChunkStore, ConversationTurn, CoreConfig, CorpusService, Embedder, Extractor, IngestRequest,
    IngestionPipeline, LanguageModel, LocalFolderSource, OpenAiEmbedder, QualityIssue,
    QueryRequest, Ranker, SearchScope, SourceConfig, SqliteChunkStore, StaticQualityIssues,
    TextChunker, Visibility,
};
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "corpus-agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database holding documents and chunks.
    #[arg(long, env = "CORPUS_AGENT_DB", default_value = "corpus-agent.db")]
    database: PathBuf,

    /// Top-K used when the model does not ask for one.
    #[arg(long, env = "CORPUS_AGENT_TOP_K")]
    top_k: Option<usize>,

    /// Use the offline character n-gram embedder even when an embedding key is set.
    #[arg(long, default_value_t = false)]
    offline_embeddings: bool,
}

#[derive(Args)]
struct VisibilityArgs {
    /// Department allowed to see the document. Repeat for several; none means public.
    #[arg(long = "department")]
    departments: Vec<String>,

    /// Optional category label.
    #[arg(long)]
    category: Option<String>,
}

impl VisibilityArgs {
    fn visibility(&self) -> Visibility {
        if self.departments.is_empty() {
            Visibility::public()
        } else {
            Visibility::departments(self.departments.iter().cloned())
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Extract, chunk, embed and store one file.
    Ingest {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        file: PathBuf,
        #[command(flatten)]
        visibility: VisibilityArgs,
    },
    /// Ask a question; events are written to stdout as NDJSON.
    Query {
        #[arg(long)]
        tenant: String,
        /// Caller's department. Omit for the administrator view.
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        question: String,
        /// JSON array of {"role": "user"|"assistant", "content": ".."} turns.
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Remove a document and its chunks. Unknown ids are not an error.
    Delete {
        #[arg(long)]
        document_id: String,
    },
    /// List documents visible in a scope.
    Documents {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        department: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Ingest new and changed files of a folder, skipping unchanged ones.
    Sync {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        folder: PathBuf,
        #[command(flatten)]
        visibility: VisibilityArgs,
    },
    /// Run the document-authoring loop; events are written to stdout as NDJSON.
    Author {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        instruction: String,
        /// JSON array of quality issues exported from the chat history.
        #[arg(long)]
        issues: Option<PathBuf>,
        /// Directory receiving generated .docx files.
        #[arg(long, default_value = "generated_docs")]
        output_dir: PathBuf,
    },
}

fn embedder(config: &CoreConfig, offline: bool) -> anyhow::Result<Arc<dyn Embedder>> {
    if offline || config.embedding.api_key.is_none() {
        warn!("using the offline character n-gram embedder");
        return Ok(Arc::new(CharacterNgramEmbedder::default()));
    }
    Ok(Arc::new(
        OpenAiEmbedder::new(&config.embedding).context("embedding client")?,
    ))
}

fn language_model(config: &CoreConfig) -> anyhow::Result<Arc<dyn LanguageModel>> {
    Ok(Arc::new(
        AnthropicClient::new(&config.model).context("language model client")?,
    ))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn scope(tenant: String, department: Option<String>) -> SearchScope {
    match department {
        Some(department) => SearchScope::department(tenant, department),
        None => SearchScope::tenant(tenant),
    }
}

fn print_line(line: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = CoreConfig::from_env();
    if let Some(top_k) = cli.top_k {
        config.retrieval.default_top_k = top_k;
    }

    let ranker = Ranker::from(&config.retrieval);
    let store: Arc<dyn ChunkStore> = Arc::new(
        SqliteChunkStore::open(&cli.database, ranker)
            .await
            .with_context(|| format!("cannot open {}", cli.database.display()))?,
    );
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        database = %cli.database.display(),
        "corpus-agent boot"
    );

    // Vision and spreadsheet reformatting are skipped when no model key is configured.
    let model = language_model(&config);
    let mut extractor = Extractor::new(config.extraction.clone());
    match &model {
        Ok(model) => extractor = extractor.with_model(Arc::clone(model)),
        Err(error) => warn!(%error, "extracting without a language model"),
    }
    let pipeline = IngestionPipeline::new(
        Arc::clone(&store),
        extractor,
        TextChunker::new(config.chunking.clone()),
        embedder(&config, cli.offline_embeddings)?,
    );

    match cli.command {
        Command::Ingest {
            tenant,
            file,
            visibility,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("cannot read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .context("file name is not valid UTF-8")?
                .to_string();

            let mut request = IngestRequest::new(tenant, filename, bytes);
            request.visibility = visibility.visibility();
            request.category = visibility.category.clone();

            let receipt = pipeline.ingest_document(request).await?;
            print_line(&serde_json::to_string(&receipt)?)?;
        }
        Command::Delete { document_id } => {
            let deleted = pipeline.delete_document(&document_id).await?;
            print_line(&json!({ "document_id": document_id, "deleted": deleted }).to_string())?;
        }
        Command::Documents {
            tenant,
            department,
            limit,
        } => {
            let documents = store
                .list_documents(&scope(tenant, department), limit)
                .await?;
            for document in documents {
                print_line(&serde_json::to_string(&document)?)?;
            }
        }
        Command::Sync {
            tenant,
            folder,
            visibility,
        } => {
            let source = LocalFolderSource::new(folder);
            let source_config = SourceConfig {
                tenant_id: tenant,
                visibility: visibility.visibility(),
                category: visibility.category.clone(),
            };
            let report = corpus_agent_core::sync_source(&pipeline, &source_config, &source).await?;
            for failure in &report.failed {
                warn!(external_ref = %failure.external_ref, reason = %failure.reason, "file not synced");
            }
            print_line(&serde_json::to_string(&report)?)?;
        }
        Command::Query {
            tenant,
            department,
            question,
            history,
        } => {
            let model = model?;
            let history: Vec<ConversationTurn> = match history {
                Some(path) => read_json(&path)?,
                None => Vec::new(),
            };
            let service = CorpusService::new(
                pipeline,
                AgentLoop::new(model, config.agent.clone()),
                config.retrieval.clone(),
            );
            let request = QueryRequest {
                tenant_id: tenant.clone(),
                department_id: department.clone(),
                question,
                history,
            };

            let mut stream = service.spawn_query(request)?;
            let mut done = None;
            while let Some(event) = stream.events.recv().await {
                print_line(&event.to_ndjson()?)?;
                if let AgentEvent::Done(payload) = event {
                    done = Some(payload);
                }
            }
            let status = stream.handle.await?;
            info!(?status, "query stream closed");

            if let Some(done) = done {
                let fallback = service
                    .fallback_citations(&scope(tenant, department), &done)
                    .await?;
                if !fallback.is_empty() {
                    print_line(&json!({ "fallback_citations": fallback }).to_string())?;
                }
            }
        }
        Command::Author {
            tenant,
            instruction,
            issues,
            output_dir,
        } => {
            let model = model?;
            let issues: Vec<QualityIssue> = match issues {
                Some(path) => read_json(&path)?,
                None => Vec::new(),
            };
            let mut agent_config = config.agent.clone();
            agent_config.authoring_output_dir = output_dir;
            let service = CorpusService::new(
                pipeline,
                AgentLoop::new(model, agent_config),
                config.retrieval.clone(),
            )
            .with_quality_issues(Arc::new(StaticQualityIssues::new(issues)));

            let (sender, mut receiver) = mpsc::unbounded_channel::<AgentEvent>();
            let request = AuthoringRequest {
                tenant_id: tenant,
                instruction,
                history: Vec::new(),
            };
            let printer = tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    print_line(&event.to_ndjson()?)?;
                }
                anyhow::Ok(())
            });
            let status = service.author(&request, &sender).await?;
            drop(sender);
            printer.await??;
            info!(?status, "authoring finished");
        }
    }

    Ok(())
}
