use crate::error::ToolError;
use crate::llm::ToolDefinition;
use crate::models::SearchScope;
use crate::tools::{definition, document_text, parse_input, RunOutcome, ToolOutput, Toolset};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub mod docx;

const MAX_ISSUES: usize = 50;
const ANSWER_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    NoAnswer,
    Bad,
    #[default]
    All,
}

/// A past question that went unanswered or was rated badly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub question: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub is_no_answer: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QualityIssue {
    fn matches(&self, kind: IssueKind) -> bool {
        let badly_rated = self.feedback.as_deref() == Some("bad");
        match kind {
            IssueKind::NoAnswer => self.is_no_answer,
            IssueKind::Bad => badly_rated,
            IssueKind::All => self.is_no_answer || badly_rated,
        }
    }
}

/// Chat history lives outside the core; this is how the authoring loop reads it.
#[async_trait]
pub trait QualityIssueSource: Send + Sync {
    async fn quality_issues(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
        kind: IssueKind,
        limit: usize,
    ) -> Result<Vec<QualityIssue>, ToolError>;
}

/// Issues held in memory, e.g. loaded from an exported JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticQualityIssues {
    issues: Vec<QualityIssue>,
}

impl StaticQualityIssues {
    pub fn new(issues: Vec<QualityIssue>) -> Self {
        Self { issues }
    }
}

#[async_trait]
impl QualityIssueSource for StaticQualityIssues {
    async fn quality_issues(
        &self,
        _tenant_id: &str,
        since: DateTime<Utc>,
        kind: IssueKind,
        limit: usize,
    ) -> Result<Vec<QualityIssue>, ToolError> {
        let mut issues = self
            .issues
            .iter()
            .filter(|issue| issue.created_at >= since && issue.matches(kind))
            .cloned()
            .collect::<Vec<_>>();
        issues.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        issues.truncate(limit);
        Ok(issues)
    }
}

#[derive(Debug, Deserialize)]
struct IssuesInput {
    #[serde(default = "default_days")]
    days: i64,
    #[serde(default)]
    issue_type: IssueKind,
}

fn default_days() -> i64 {
    30
}

#[derive(Debug, Deserialize)]
struct DocumentInput {
    document_id: String,
}

#[derive(Debug, Deserialize)]
struct GenerateInput {
    title: String,
    content_markdown: String,
}

const GET_QUALITY_ISSUES: &str = "get_quality_issues";
const GET_EXISTING_DOCUMENTS: &str = "get_existing_documents";
const GET_DOCUMENT_CONTENT: &str = "get_document_content";
const GENERATE_DOCUMENT: &str = "generate_document";

/// Tools of the document-authoring loop. Administrator scope: every document
/// of the tenant is visible.
pub struct AuthoringTools {
    store: Arc<dyn ChunkStore>,
    issues: Arc<dyn QualityIssueSource>,
    tenant_id: String,
    output_dir: PathBuf,
}

impl AuthoringTools {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        issues: Arc<dyn QualityIssueSource>,
        tenant_id: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            issues,
            tenant_id: tenant_id.into(),
            output_dir: output_dir.into(),
        }
    }

    async fn get_quality_issues(&self, input: IssuesInput) -> Result<ToolOutput, ToolError> {
        let days = input.days.clamp(1, 3650);
        let since = Utc::now() - Duration::days(days);
        let issues = self
            .issues
            .quality_issues(&self.tenant_id, since, input.issue_type, MAX_ISSUES)
            .await?;

        let items = issues
            .iter()
            .map(|issue| {
                json!({
                    "question": issue.question,
                    "answer": issue.answer.chars().take(ANSWER_PREVIEW_CHARS).collect::<String>(),
                    "is_no_answer": issue.is_no_answer,
                    "feedback": issue.feedback,
                    "created_at": issue.created_at.to_rfc3339(),
                })
            })
            .collect::<Vec<_>>();

        Ok(ToolOutput::new(
            json!({"period_days": days, "total": items.len(), "items": items}),
            format!("{} quality issues", items.len()),
        ))
    }

    async fn get_existing_documents(&self) -> Result<ToolOutput, ToolError> {
        let mut documents = self
            .store
            .list_documents(&SearchScope::tenant(&self.tenant_id), usize::MAX)
            .await?;
        documents.sort_by(|left, right| left.filename.cmp(&right.filename));

        let documents = documents
            .into_iter()
            .map(|document| {
                json!({
                    "id": document.id,
                    "filename": document.filename,
                    "category": document.category.unwrap_or_default(),
                    "chunk_count": document.chunk_count,
                })
            })
            .collect::<Vec<_>>();
        let total = documents.len();
        Ok(ToolOutput::new(
            json!({"documents": documents, "total": total}),
            format!("{total} documents listed"),
        ))
    }

    async fn get_document_content(&self, input: DocumentInput) -> Result<ToolOutput, ToolError> {
        let content = document_text(
            self.store.as_ref(),
            &SearchScope::tenant(&self.tenant_id),
            &input.document_id,
        )
        .await?;
        let summary = format!(
            "read full text of {}",
            content["filename"].as_str().unwrap_or_default()
        );
        Ok(ToolOutput::new(content, summary))
    }

    async fn generate_document(&self, input: GenerateInput) -> Result<ToolOutput, ToolError> {
        let bytes = docx::markdown_to_docx(&input.title, &input.content_markdown)
            .map_err(|error| ToolError::Failed(format!("docx generation failed: {error}")))?;

        let filename = docx::output_filename(&input.title, Utc::now());
        tokio::fs::create_dir_all(&self.output_dir).await?;
        tokio::fs::write(self.output_dir.join(&filename), bytes).await?;
        info!(tenant_id = %self.tenant_id, %filename, "generated document");

        Ok(ToolOutput {
            content: json!({
                "status": "ok",
                "filename": filename,
                "message": format!("Generated {filename}."),
            }),
            summary: format!("generated {filename}"),
            download: Some(filename),
        })
    }
}

#[async_trait]
impl Toolset for AuthoringTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            definition(
                GET_QUALITY_ISSUES,
                "Fetch recent questions that went unanswered or were rated badly, for knowledge gap analysis.",
                json!({
                    "type": "object",
                    "properties": {
                        "days": {"type": "integer", "description": "How many past days to include (default 30).", "default": 30},
                        "issue_type": {"type": "string", "enum": ["no_answer", "bad", "all"], "default": "all"}
                    }
                }),
            ),
            definition(
                GET_EXISTING_DOCUMENTS,
                "List registered documents with their categories and chunk counts.",
                json!({"type": "object", "properties": {}}),
            ),
            definition(
                GET_DOCUMENT_CONTENT,
                "Fetch the full text of one registered document.",
                json!({
                    "type": "object",
                    "properties": {"document_id": {"type": "string"}},
                    "required": ["document_id"]
                }),
            ),
            definition(
                GENERATE_DOCUMENT,
                "Render Markdown content into a Word document and return its download name. \
                 Only use it after the administrator explicitly asks for the document.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "content_markdown": {"type": "string"}
                    },
                    "required": ["title", "content_markdown"]
                }),
            ),
        ]
    }

    fn is_visible(&self, _name: &str) -> bool {
        true
    }

    async fn execute(&mut self, name: &str, input: &Value) -> Result<ToolOutput, ToolError> {
        match name {
            GET_QUALITY_ISSUES => self.get_quality_issues(parse_input(name, input)?).await,
            GET_EXISTING_DOCUMENTS => self.get_existing_documents().await,
            GET_DOCUMENT_CONTENT => self.get_document_content(parse_input(name, input)?).await,
            GENERATE_DOCUMENT => self.generate_document(parse_input(name, input)?).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn outcome(&self) -> RunOutcome {
        RunOutcome::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::Ranker;
    use crate::stores::test_support::{chunk, document};
    use crate::stores::MemoryChunkStore;

    fn issue(question: &str, no_answer: bool, feedback: Option<&str>, days_ago: i64) -> QualityIssue {
        QualityIssue {
            question: question.to_string(),
            answer: "x".repeat(300),
            is_no_answer: no_answer,
            feedback: feedback.map(str::to_string),
            created_at: Utc::now() - Duration::days(days_ago),
        }
    }

    fn tools(dir: &std::path::Path) -> AuthoringTools {
        let issues = StaticQualityIssues::new(vec![
            issue("old", true, None, 60),
            issue("unanswered", true, None, 1),
            issue("disliked", false, Some("bad"), 2),
            issue("fine", false, Some("good"), 1),
        ]);
        AuthoringTools::new(
            Arc::new(MemoryChunkStore::new(Ranker::default())),
            Arc::new(issues),
            "tenant-a",
            dir,
        )
    }

    #[tokio::test]
    async fn quality_issues_filter_by_kind_and_period() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut tools = tools(dir.path());

        let all = tools.execute(GET_QUALITY_ISSUES, &json!({})).await?;
        assert_eq!(all.content["total"], 2);
        assert_eq!(all.content["items"][0]["question"], "unanswered");
        assert_eq!(
            all.content["items"][0]["answer"].as_str().map(|a| a.chars().count()),
            Some(200)
        );

        let bad = tools
            .execute(GET_QUALITY_ISSUES, &json!({"days": 90, "issue_type": "bad"}))
            .await?;
        assert_eq!(bad.content["total"], 1);
        assert_eq!(bad.content["items"][0]["question"], "disliked");
        Ok(())
    }

    #[tokio::test]
    async fn existing_documents_include_chunk_counts() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(MemoryChunkStore::new(Ranker::default()));
        store.upsert_document(&document("doc-b", "tenant-a", false, &["hr"])).await?;
        store.upsert_document(&document("doc-a", "tenant-a", true, &[])).await?;
        store
            .replace_chunks("doc-a", &[chunk("doc-a", "tenant-a", 0, vec![1.0])])
            .await?;
        let mut tools = AuthoringTools::new(
            store,
            Arc::new(StaticQualityIssues::default()),
            "tenant-a",
            dir.path(),
        );

        let output = tools.execute(GET_EXISTING_DOCUMENTS, &Value::Null).await?;

        assert_eq!(output.content["total"], 2);
        assert_eq!(output.content["documents"][0]["id"], "doc-a");
        assert_eq!(output.content["documents"][0]["chunk_count"], 1);

        let content = tools
            .execute(GET_DOCUMENT_CONTENT, &json!({"document_id": "doc-a"}))
            .await?;
        assert_eq!(content.content["content"], "doc-a chunk 0");
        Ok(())
    }

    #[tokio::test]
    async fn generated_documents_are_written_and_offered_for_download(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let output_dir = dir.path().join("generated");
        let mut tools = tools(&output_dir);

        let output = tools
            .execute(
                GENERATE_DOCUMENT,
                &json!({"title": "Leave FAQ", "content_markdown": "# Annual leave\n- 10 days"}),
            )
            .await?;

        let filename = output.download.clone().expect("download");
        assert!(filename.starts_with("Leave FAQ_") && filename.ends_with(".docx"));
        let written = std::fs::read(output_dir.join(&filename))?;
        assert!(written.starts_with(b"PK"));
        assert_eq!(output.content["filename"], filename.as_str());
        Ok(())
    }
}
