use crate::config::RetrievalConfig;
use crate::embeddings::Embedder;
use crate::error::ToolError;
use crate::llm::ToolDefinition;
use crate::models::{Citation, SearchScope};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// What a tool hands back: the JSON the model sees, plus a short line for
/// step events and the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: Value,
    pub summary: String,
    pub download: Option<String>,
}

impl ToolOutput {
    pub fn new(content: Value, summary: impl Into<String>) -> Self {
        Self {
            content,
            summary: summary.into(),
            download: None,
        }
    }
}

/// Bookkeeping a tool registry accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub citations: Vec<Citation>,
    pub mean_similarity: f64,
    pub followups: Vec<String>,
    pub referenced_document_ids: Vec<String>,
}

/// A closed set of tools the agent loop may dispatch to by name.
#[async_trait]
pub trait Toolset: Send {
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Hidden tools still run, but emit no step events.
    fn is_visible(&self, name: &str) -> bool;

    async fn execute(&mut self, name: &str, input: &Value) -> Result<ToolOutput, ToolError>;

    fn outcome(&self) -> RunOutcome;
}

pub(crate) fn parse_input<T: DeserializeOwned>(tool: &str, input: &Value) -> Result<T, ToolError> {
    // Tools without arguments are sometimes called with `null`.
    let input = if input.is_null() { json!({}) } else { input.clone() };
    serde_json::from_value(input).map_err(|error| ToolError::InvalidInput {
        tool: tool.to_string(),
        details: error.to_string(),
    })
}

pub(crate) fn definition(name: &str, description: &str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeTool {
    SearchKnowledge,
    GetDocumentDetail,
    ListDocuments,
    RegisterCitations,
    SuggestFollowups,
}

impl KnowledgeTool {
    pub const ALL: [Self; 5] = [
        Self::SearchKnowledge,
        Self::GetDocumentDetail,
        Self::ListDocuments,
        Self::RegisterCitations,
        Self::SuggestFollowups,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchKnowledge => "search_knowledge",
            Self::GetDocumentDetail => "get_document_detail",
            Self::ListDocuments => "list_documents",
            Self::RegisterCitations => "register_citations",
            Self::SuggestFollowups => "suggest_followups",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    fn definition(&self, max_top_k: usize) -> ToolDefinition {
        match self {
            Self::SearchKnowledge => definition(
                self.name(),
                "Search the knowledge base for passages relevant to a query. Use it first; \
                 calling it several times with reworded queries improves recall.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Search terms optimised for retrieval rather than the user's literal question."
                        },
                        "top_k": {
                            "type": "integer",
                            "description": format!("Number of passages to return (default 5, at most {max_top_k})."),
                            "default": 5
                        }
                    },
                    "required": ["query"]
                }),
            ),
            Self::GetDocumentDetail => definition(
                self.name(),
                "Fetch the full text of one document when search passages are not enough.",
                json!({
                    "type": "object",
                    "properties": {
                        "document_id": {"type": "string", "description": "Document id from a search result."}
                    },
                    "required": ["document_id"]
                }),
            ),
            Self::ListDocuments => definition(
                self.name(),
                "List the documents available to search.",
                json!({"type": "object", "properties": {}}),
            ),
            Self::RegisterCitations => definition(
                self.name(),
                "Register the sources the answer relies on. Call it right before answering.",
                json!({
                    "type": "object",
                    "properties": {
                        "citations": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "document_id": {"type": "string"},
                                    "filename": {"type": "string"},
                                    "section": {"type": "string", "description": "Chapter or article referred to."},
                                    "excerpt": {"type": "string", "description": "Quote or summary of the supporting passage, about 100 characters."}
                                },
                                "required": ["document_id", "filename", "excerpt"]
                            }
                        }
                    },
                    "required": ["citations"]
                }),
            ),
            Self::SuggestFollowups => definition(
                self.name(),
                "Suggest two or three concrete follow-up questions the user is likely to ask next.",
                json!({
                    "type": "object",
                    "properties": {
                        "questions": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["questions"]
                }),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchInput {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DocumentInput {
    document_id: String,
}

#[derive(Debug, Deserialize)]
struct CitationsInput {
    #[serde(default)]
    citations: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct FollowupsInput {
    #[serde(default)]
    questions: Vec<Value>,
}

pub(crate) const MAX_FOLLOWUPS: usize = 3;

/// Some models send nested objects as JSON-encoded strings.
fn parse_citation(entry: &Value) -> Option<Citation> {
    let entry = match entry {
        Value::String(raw) => serde_json::from_str::<Value>(raw).ok()?,
        other => other.clone(),
    };
    let citation = serde_json::from_value::<Citation>(entry).ok()?;
    let well_formed = !citation.document_id.trim().is_empty()
        && !citation.filename.trim().is_empty()
        && !citation.excerpt.trim().is_empty();
    well_formed.then_some(citation)
}

/// Full text of a document, chunks joined in ordinal order. Documents hidden
/// from the caller's department read as missing.
pub(crate) async fn document_text(
    store: &dyn ChunkStore,
    scope: &SearchScope,
    document_id: &str,
) -> Result<Value, ToolError> {
    let document = store
        .get_document(&scope.tenant_id, document_id)
        .await?
        .filter(|document| document.visible_to(scope.department_id.as_deref()))
        .ok_or_else(|| ToolError::NotFound(document_id.to_string()))?;

    let chunks = store.document_chunks(&scope.tenant_id, document_id).await?;
    if chunks.is_empty() {
        return Err(ToolError::NotFound(document_id.to_string()));
    }

    Ok(json!({
        "document_id": document.id,
        "filename": document.filename,
        "content": chunks.iter().map(|chunk| chunk.content.as_str()).collect::<Vec<_>>().join("\n\n"),
        "chunk_count": chunks.len(),
    }))
}

/// Tools of the question-answering loop, scoped to one tenant and department.
pub struct KnowledgeTools {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    scope: SearchScope,
    config: RetrievalConfig,
    citations: Vec<Citation>,
    followups: Vec<String>,
    similarities: Vec<f64>,
    referenced_document_ids: Vec<String>,
}

impl KnowledgeTools {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
        scope: SearchScope,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            scope,
            config,
            citations: Vec::new(),
            followups: Vec::new(),
            similarities: Vec::new(),
            referenced_document_ids: Vec::new(),
        }
    }

    async fn search_knowledge(&mut self, input: SearchInput) -> Result<ToolOutput, ToolError> {
        let query = input.query.trim();
        if query.is_empty() {
            return Err(ToolError::InvalidInput {
                tool: KnowledgeTool::SearchKnowledge.name().to_string(),
                details: "query is empty".to_string(),
            });
        }
        let top_k = input
            .top_k
            .unwrap_or(self.config.default_top_k)
            .clamp(1, self.config.max_top_k.max(1));

        let query_vector = self.embedder.embed_query(query).await?;
        let results = self.store.search(&query_vector, &self.scope, top_k).await?;
        debug!(query, top_k, hits = results.len(), "search_knowledge");

        for result in &results {
            self.similarities.push(result.score);
            if !self.referenced_document_ids.contains(&result.document_id) {
                self.referenced_document_ids.push(result.document_id.clone());
            }
        }

        if results.is_empty() {
            return Ok(ToolOutput::new(
                json!({"results": [], "message": "No matching information was found."}),
                "no matching information",
            ));
        }

        let summary = format!("{} relevant passages", results.len());
        let results = results
            .into_iter()
            .map(|result| {
                json!({
                    "document_id": result.document_id,
                    "filename": result.filename,
                    "chunk_index": result.ordinal,
                    "content": result.content,
                    "similarity": (result.score * 1000.0).round() / 1000.0,
                })
            })
            .collect::<Vec<_>>();
        Ok(ToolOutput::new(json!({ "results": results }), summary))
    }

    async fn get_document_detail(&self, input: DocumentInput) -> Result<ToolOutput, ToolError> {
        let content = document_text(self.store.as_ref(), &self.scope, &input.document_id).await?;
        let summary = format!(
            "read full text of {}",
            content["filename"].as_str().unwrap_or_default()
        );
        Ok(ToolOutput::new(content, summary))
    }

    async fn list_documents(&self) -> Result<ToolOutput, ToolError> {
        let documents = self
            .store
            .list_documents(&self.scope, self.config.catalog_page_size)
            .await?;
        let summary = format!("{} documents listed", documents.len());
        let documents = documents
            .into_iter()
            .map(|document| {
                json!({
                    "id": document.id,
                    "filename": document.filename,
                    "category": document.category.unwrap_or_default(),
                    "updated_at": document.updated_at.to_rfc3339(),
                })
            })
            .collect::<Vec<_>>();
        Ok(ToolOutput::new(json!({ "documents": documents }), summary))
    }

    fn register_citations(&mut self, input: CitationsInput) -> ToolOutput {
        let submitted = input.citations.len();
        self.citations = input.citations.iter().filter_map(parse_citation).collect();
        if self.citations.len() < submitted {
            debug!(
                submitted,
                kept = self.citations.len(),
                "dropped malformed citations"
            );
        }
        ToolOutput::new(
            json!({"status": "ok", "registered": self.citations.len()}),
            format!("registered {} citations", self.citations.len()),
        )
    }

    fn suggest_followups(&mut self, input: FollowupsInput) -> ToolOutput {
        self.followups = input
            .questions
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|question| !question.is_empty())
            .take(MAX_FOLLOWUPS)
            .map(str::to_string)
            .collect();
        ToolOutput::new(
            json!({"status": "ok", "count": self.followups.len()}),
            format!("suggested {} follow-up questions", self.followups.len()),
        )
    }
}

#[async_trait]
impl Toolset for KnowledgeTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        KnowledgeTool::ALL
            .iter()
            .map(|tool| tool.definition(self.config.max_top_k))
            .collect()
    }

    fn is_visible(&self, name: &str) -> bool {
        !matches!(
            KnowledgeTool::from_name(name),
            Some(KnowledgeTool::RegisterCitations | KnowledgeTool::SuggestFollowups)
        )
    }

    async fn execute(&mut self, name: &str, input: &Value) -> Result<ToolOutput, ToolError> {
        let tool = KnowledgeTool::from_name(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        match tool {
            KnowledgeTool::SearchKnowledge => {
                self.search_knowledge(parse_input(name, input)?).await
            }
            KnowledgeTool::GetDocumentDetail => {
                self.get_document_detail(parse_input(name, input)?).await
            }
            KnowledgeTool::ListDocuments => self.list_documents().await,
            KnowledgeTool::RegisterCitations => {
                Ok(self.register_citations(parse_input(name, input)?))
            }
            KnowledgeTool::SuggestFollowups => {
                Ok(self.suggest_followups(parse_input(name, input)?))
            }
        }
    }

    fn outcome(&self) -> RunOutcome {
        let mean_similarity = if self.similarities.is_empty() {
            0.0
        } else {
            self.similarities.iter().sum::<f64>() / self.similarities.len() as f64
        };
        RunOutcome {
            citations: self.citations.clone(),
            mean_similarity,
            followups: self.followups.clone(),
            referenced_document_ids: self.referenced_document_ids.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::Chunk;
    use crate::ranking::Ranker;
    use crate::stores::test_support::document;
    use crate::stores::MemoryChunkStore;

    async fn seeded_tools(department: Option<&str>) -> Result<KnowledgeTools, Box<dyn std::error::Error>> {
        let embedder = Arc::new(CharacterNgramEmbedder::default());
        let store = Arc::new(MemoryChunkStore::new(Ranker::default()));

        let texts = [
            ("doc-travel", true, &[][..], vec!["Domestic travel allowance is 2000 yen per day.", "Overseas trips need approval."]),
            ("doc-salary", false, &["hr"][..], vec!["Salary bands are reviewed every April."]),
        ];
        for (id, is_public, departments, contents) in texts {
            store.upsert_document(&document(id, "tenant-a", is_public, departments)).await?;
            let chunks = contents
                .iter()
                .enumerate()
                .map(|(ordinal, content)| Chunk {
                    document_id: id.to_string(),
                    tenant_id: "tenant-a".to_string(),
                    ordinal: ordinal as u32,
                    content: content.to_string(),
                    embedding: embedder.embed_one(content),
                })
                .collect::<Vec<_>>();
            store.replace_chunks(id, &chunks).await?;
        }

        let scope = match department {
            Some(department) => SearchScope::department("tenant-a", department),
            None => SearchScope::tenant("tenant-a"),
        };
        Ok(KnowledgeTools::new(store, embedder, scope, RetrievalConfig::default()))
    }

    #[tokio::test]
    async fn search_tracks_similarities_and_referenced_documents(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut tools = seeded_tools(None).await?;

        let output = tools
            .execute("search_knowledge", &json!({"query": "travel allowance per day", "top_k": 2}))
            .await?;

        let results = output.content["results"].as_array().expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["document_id"], "doc-travel");
        assert_eq!(output.summary, "2 relevant passages");

        let outcome = tools.outcome();
        assert!(outcome.mean_similarity > 0.0);
        assert_eq!(outcome.referenced_document_ids[0], "doc-travel");
        Ok(())
    }

    #[tokio::test]
    async fn mean_similarity_is_zero_without_searches() -> Result<(), Box<dyn std::error::Error>> {
        let tools = seeded_tools(None).await?;
        assert_eq!(tools.outcome().mean_similarity, 0.0);
        Ok(())
    }

    #[tokio::test]
    async fn document_detail_joins_chunks_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut tools = seeded_tools(None).await?;

        let output = tools
            .execute("get_document_detail", &json!({"document_id": "doc-travel"}))
            .await?;

        assert_eq!(
            output.content["content"],
            "Domestic travel allowance is 2000 yen per day.\n\nOverseas trips need approval."
        );
        assert_eq!(output.content["chunk_count"], 2);
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_hidden_documents_are_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let mut tools = seeded_tools(Some("sales")).await?;

        for id in ["doc-missing", "doc-salary"] {
            let result = tools
                .execute("get_document_detail", &json!({"document_id": id}))
                .await;
            assert!(matches!(result, Err(ToolError::NotFound(_))), "{id}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn malformed_citations_are_dropped() -> Result<(), Box<dyn std::error::Error>> {
        let mut tools = seeded_tools(None).await?;

        let output = tools
            .execute(
                "register_citations",
                &json!({"citations": [
                    {"document_id": "doc-travel", "filename": "travel.pdf", "section": "Art. 3", "excerpt": "2000 yen"},
                    {"document_id": "doc-travel", "filename": "travel.pdf"},
                    "not json",
                    "{\"document_id\":\"doc-salary\",\"filename\":\"pay.xlsx\",\"excerpt\":\"April\"}",
                    {"document_id": "", "filename": "x", "excerpt": "y"}
                ]}),
            )
            .await?;

        assert_eq!(output.content["registered"], 2);
        let citations = tools.outcome().citations;
        assert_eq!(citations[0].section.as_deref(), Some("Art. 3"));
        assert_eq!(citations[1].document_id, "doc-salary");
        Ok(())
    }

    #[tokio::test]
    async fn followups_are_capped_at_three() -> Result<(), Box<dyn std::error::Error>> {
        let mut tools = seeded_tools(None).await?;

        tools
            .execute(
                "suggest_followups",
                &json!({"questions": ["a?", "b?", " ", "c?", "d?"]}),
            )
            .await?;

        assert_eq!(tools.outcome().followups, vec!["a?", "b?", "c?"]);
        Ok(())
    }

    #[tokio::test]
    async fn catalog_respects_department_visibility() -> Result<(), Box<dyn std::error::Error>> {
        let mut tools = seeded_tools(Some("sales")).await?;

        let output = tools.execute("list_documents", &Value::Null).await?;

        let documents = output.content["documents"].as_array().expect("documents");
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0]["id"], "doc-travel");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tools_and_bad_input_are_tool_errors() -> Result<(), Box<dyn std::error::Error>> {
        let mut tools = seeded_tools(None).await?;

        assert!(matches!(
            tools.execute("drop_tables", &json!({})).await,
            Err(ToolError::UnknownTool(_))
        ));
        assert!(matches!(
            tools.execute("search_knowledge", &json!({"top_k": 3})).await,
            Err(ToolError::InvalidInput { .. })
        ));
        assert!(!tools.is_visible("register_citations"));
        assert!(tools.is_visible("search_knowledge"));
        Ok(())
    }
}
