use crate::authoring::{AuthoringTools, QualityIssueSource, StaticQualityIssues};
use crate::config::RetrievalConfig;
use crate::error::IngestError;
use crate::ingest::{IngestReceipt, IngestRequest, IngestionPipeline};
use crate::models::{Citation, ConversationTurn, DocumentSummary, SearchScope};
use crate::orchestrator::{AgentEvent, AgentLoop, DonePayload, LoopProfile, RunStatus};
use crate::sources::{sync_source, ExternalFileSource, SourceConfig, SyncReport};
use crate::tools::KnowledgeTools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub department_id: Option<String>,
    pub question: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

impl QueryRequest {
    pub fn new(tenant_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            department_id: None,
            question: question.into(),
            history: Vec::new(),
        }
    }

    fn scope(&self) -> SearchScope {
        match &self.department_id {
            Some(department_id) => SearchScope::department(&self.tenant_id, department_id),
            None => SearchScope::tenant(&self.tenant_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthoringRequest {
    pub tenant_id: String,
    pub instruction: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
}

/// A running query: events arrive on `events` until the `done` event, after
/// which the channel closes. Dropping `events` cancels the run.
pub struct QueryStream {
    pub events: UnboundedReceiver<AgentEvent>,
    pub handle: JoinHandle<RunStatus>,
}

/// The operations collaborators call: ingest, query, delete, plus catalog,
/// source sync and the authoring loop.
#[derive(Clone)]
pub struct CorpusService {
    pipeline: Arc<IngestionPipeline>,
    agent: Arc<AgentLoop>,
    retrieval: RetrievalConfig,
    issues: Arc<dyn QualityIssueSource>,
}

impl CorpusService {
    pub fn new(pipeline: IngestionPipeline, agent: AgentLoop, retrieval: RetrievalConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            agent: Arc::new(agent),
            retrieval,
            issues: Arc::new(StaticQualityIssues::default()),
        }
    }

    pub fn with_quality_issues(mut self, issues: Arc<dyn QualityIssueSource>) -> Self {
        self.issues = issues;
        self
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub async fn ingest_document(&self, request: IngestRequest) -> Result<IngestReceipt, IngestError> {
        self.pipeline.ingest_document(request).await
    }

    /// Idempotent; `false` when nothing was stored under `document_id`.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool, IngestError> {
        self.pipeline.delete_document(document_id).await
    }

    pub async fn list_documents(
        &self,
        scope: &SearchScope,
        limit: usize,
    ) -> Result<Vec<DocumentSummary>, IngestError> {
        Ok(self.pipeline.store().list_documents(scope, limit).await?)
    }

    pub async fn sync_source(
        &self,
        config: &SourceConfig,
        source: &dyn ExternalFileSource,
    ) -> Result<SyncReport, IngestError> {
        sync_source(&self.pipeline, config, source).await
    }

    /// Runs one question to completion, sending events to `events`.
    pub async fn query(
        &self,
        request: &QueryRequest,
        events: &UnboundedSender<AgentEvent>,
    ) -> Result<RunStatus, IngestError> {
        validate_query(request)?;
        let mut tools = KnowledgeTools::new(
            Arc::clone(self.pipeline.store()),
            Arc::clone(self.pipeline.embedder()),
            request.scope(),
            self.retrieval.clone(),
        );
        let profile = LoopProfile::query(self.agent.config());

        info!(
            tenant_id = %request.tenant_id,
            department_id = request.department_id.as_deref().unwrap_or("-"),
            "query started"
        );
        let status = self
            .agent
            .run(&profile, &mut tools, &request.history, &request.question, events)
            .await;
        info!(tenant_id = %request.tenant_id, ?status, "query finished");
        Ok(status)
    }

    /// Spawns the query on the runtime and hands back its event stream.
    pub fn spawn_query(&self, request: QueryRequest) -> Result<QueryStream, IngestError> {
        validate_query(&request)?;
        let (sender, events) = mpsc::unbounded_channel();
        let service = self.clone();
        let handle = tokio::spawn(async move {
            match service.query(&request, &sender).await {
                Ok(status) => status,
                Err(error) => {
                    warn!(%error, "query rejected after spawn");
                    RunStatus::ModelFailed
                }
            }
        });
        Ok(QueryStream { events, handle })
    }

    /// The document-authoring loop. Generated files land in the configured
    /// output directory and are announced with a `download` event.
    pub async fn author(
        &self,
        request: &AuthoringRequest,
        events: &UnboundedSender<AgentEvent>,
    ) -> Result<RunStatus, IngestError> {
        if request.tenant_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument("tenant id is empty".to_string()));
        }
        if request.instruction.trim().is_empty() {
            return Err(IngestError::InvalidArgument("instruction is empty".to_string()));
        }

        let mut tools = AuthoringTools::new(
            Arc::clone(self.pipeline.store()),
            Arc::clone(&self.issues),
            request.tenant_id.clone(),
            self.agent.config().authoring_output_dir.clone(),
        );
        let profile = LoopProfile::authoring(self.agent.config());
        let status = self
            .agent
            .run(&profile, &mut tools, &request.history, &request.instruction, events)
            .await;
        info!(tenant_id = %request.tenant_id, ?status, "authoring finished");
        Ok(status)
    }

    /// Secondary citation path for answers where the model never registered
    /// citations: one entry per referenced document that is still visible,
    /// with no section and an empty excerpt. Returns nothing when the run
    /// produced citations of its own.
    pub async fn fallback_citations(
        &self,
        scope: &SearchScope,
        done: &DonePayload,
    ) -> Result<Vec<Citation>, IngestError> {
        if !done.citations.is_empty() {
            return Ok(Vec::new());
        }

        let mut citations = Vec::new();
        for document_id in &done.referenced_document_ids {
            let Some(document) = self
                .pipeline
                .store()
                .get_document(&scope.tenant_id, document_id)
                .await?
            else {
                continue;
            };
            if !document.visible_to(scope.department_id.as_deref()) {
                continue;
            }
            citations.push(Citation {
                document_id: document.id,
                filename: document.filename,
                section: None,
                excerpt: String::new(),
            });
        }
        Ok(citations)
    }
}

fn validate_query(request: &QueryRequest) -> Result<(), IngestError> {
    if request.tenant_id.trim().is_empty() {
        return Err(IngestError::InvalidArgument("tenant id is empty".to_string()));
    }
    if request.question.trim().is_empty() {
        return Err(IngestError::InvalidArgument("question is empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::TextChunker;
    use crate::config::{AgentConfig, ChunkingConfig, ExtractionConfig};
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::extractor::Extractor;
    use crate::ingest::Visibility;
    use crate::orchestrator::testing::{text_response, tool_response, ScriptedModel};
    use crate::ranking::Ranker;
    use crate::stores::MemoryChunkStore;
    use serde_json::json;
    use tempfile::tempdir;

    fn service(model: ScriptedModel, agent: AgentConfig) -> CorpusService {
        let pipeline = IngestionPipeline::new(
            Arc::new(MemoryChunkStore::new(Ranker::default())),
            Extractor::new(ExtractionConfig::default()),
            TextChunker::new(ChunkingConfig::default()),
            Arc::new(CharacterNgramEmbedder::default()),
        );
        CorpusService::new(
            pipeline,
            AgentLoop::new(Arc::new(model), agent),
            RetrievalConfig::default(),
        )
    }

    fn searching_model() -> ScriptedModel {
        ScriptedModel::new(vec![
            Ok(tool_response(&[(
                "call-1",
                "search_knowledge",
                json!({"query": "annual leave"}),
            )])),
            Ok(text_response("Ten days.")),
        ])
    }

    async fn collect(mut stream: QueryStream) -> (Vec<AgentEvent>, RunStatus) {
        let mut events = Vec::new();
        while let Some(event) = stream.events.recv().await {
            events.push(event);
        }
        let status = stream.handle.await.expect("join");
        (events, status)
    }

    fn done_payload(events: &[AgentEvent]) -> DonePayload {
        match events.last() {
            Some(AgentEvent::Done(done)) => done.clone(),
            other => panic!("expected done event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawned_query_streams_until_done() -> Result<(), Box<dyn std::error::Error>> {
        let service = service(searching_model(), AgentConfig::default());
        let receipt = service
            .ingest_document(IngestRequest::new(
                "tenant-a",
                "leave.md",
                b"Annual leave is ten days.".to_vec(),
            ))
            .await?;

        let stream = service.spawn_query(QueryRequest::new("tenant-a", "How much leave?"))?;
        let (events, status) = collect(stream).await;

        assert_eq!(status, RunStatus::Answered);
        let done = done_payload(&events);
        assert_eq!(done.referenced_document_ids, vec![receipt.document_id.clone()]);
        assert!(done.citations.is_empty());

        let scope = SearchScope::tenant("tenant-a");
        let fallback = service.fallback_citations(&scope, &done).await?;
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].filename, "leave.md");
        assert!(fallback[0].excerpt.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn department_scope_hides_other_departments() -> Result<(), Box<dyn std::error::Error>> {
        let service = service(searching_model(), AgentConfig::default());
        let mut request = IngestRequest::new("tenant-a", "hr.md", b"Annual leave is ten days.".to_vec());
        request.visibility = Visibility::departments(["hr"]);
        service.ingest_document(request).await?;

        let mut query = QueryRequest::new("tenant-a", "How much leave?");
        query.department_id = Some("sales".to_string());
        let (events, _) = collect(service.spawn_query(query)?).await;

        assert!(done_payload(&events).referenced_document_ids.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn blank_queries_are_rejected_before_running() {
        let service = service(ScriptedModel::new(Vec::new()), AgentConfig::default());
        assert!(matches!(
            service.spawn_query(QueryRequest::new("tenant-a", "  ")),
            Err(IngestError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.spawn_query(QueryRequest::new("", "question")),
            Err(IngestError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn registered_citations_suppress_the_fallback() -> Result<(), Box<dyn std::error::Error>> {
        let service = service(ScriptedModel::new(Vec::new()), AgentConfig::default());
        let done = DonePayload {
            citations: vec![Citation {
                document_id: "doc-1".to_string(),
                filename: "a.pdf".to_string(),
                section: None,
                excerpt: "quoted".to_string(),
            }],
            referenced_document_ids: vec!["doc-1".to_string()],
            ..DonePayload::default()
        };

        let fallback = service
            .fallback_citations(&SearchScope::tenant("tenant-a"), &done)
            .await?;
        assert!(fallback.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn authoring_writes_a_document_and_announces_it() -> Result<(), Box<dyn std::error::Error>> {
        let output = tempdir()?;
        let agent = AgentConfig {
            authoring_output_dir: output.path().to_path_buf(),
            ..AgentConfig::default()
        };
        let model = ScriptedModel::new(vec![
            Ok(tool_response(&[(
                "call-1",
                "generate_document",
                json!({"title": "Leave FAQ", "content_markdown": "# Leave\n- Ten days"}),
            )])),
            Ok(text_response("Done.")),
        ]);
        let service = service(model, agent);

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let request = AuthoringRequest {
            tenant_id: "tenant-a".to_string(),
            instruction: "Write a leave FAQ".to_string(),
            history: Vec::new(),
        };
        let status = service.author(&request, &sender).await?;
        drop(sender);

        assert_eq!(status, RunStatus::Answered);
        let mut filename = None;
        while let Some(event) = receiver.recv().await {
            if let AgentEvent::Download { filename: name } = event {
                filename = Some(name);
            }
        }
        let filename = filename.expect("download event");
        assert!(filename.starts_with("Leave FAQ_"));
        assert!(output.path().join(&filename).is_file());
        Ok(())
    }

    #[tokio::test]
    async fn delete_through_the_service_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let service = service(ScriptedModel::new(Vec::new()), AgentConfig::default());
        let receipt = service
            .ingest_document(IngestRequest::new("tenant-a", "a.txt", b"content".to_vec()))
            .await?;

        assert!(service.delete_document(&receipt.document_id).await?);
        assert!(!service.delete_document(&receipt.document_id).await?);
        assert!(service
            .list_documents(&SearchScope::tenant("tenant-a"), 50)
            .await?
            .is_empty());
        Ok(())
    }
}
