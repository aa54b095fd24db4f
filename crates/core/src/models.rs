use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Pdf,
    WordProcessing,
    Spreadsheet,
    Presentation,
    Csv,
    Html,
    PlainText,
}

impl FileFormat {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())?
            .to_ascii_lowercase();

        match extension.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" | "doc" => Some(Self::WordProcessing),
            "xlsx" | "xls" => Some(Self::Spreadsheet),
            "pptx" | "ppt" | "key" => Some(Self::Presentation),
            "csv" => Some(Self::Csv),
            "html" | "htm" => Some(Self::Html),
            "txt" | "md" | "json" => Some(Self::PlainText),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::WordProcessing => "word_processing",
            Self::Spreadsheet => "spreadsheet",
            Self::Presentation => "presentation",
            Self::Csv => "csv",
            Self::Html => "html",
            Self::PlainText => "plain_text",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pdf" => Some(Self::Pdf),
            "word_processing" => Some(Self::WordProcessing),
            "spreadsheet" => Some(Self::Spreadsheet),
            "presentation" => Some(Self::Presentation),
            "csv" => Some(Self::Csv),
            "html" => Some(Self::Html),
            "plain_text" => Some(Self::PlainText),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    pub filename: String,
    pub format: FileFormat,
    pub category: Option<String>,
    pub is_public: bool,
    pub department_ids: Vec<String>,
    pub status: DocumentStatus,
    pub status_detail: Option<String>,
    pub external_ref: Option<String>,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A public document is visible to every department of its tenant; a
    /// restricted one only to the departments it is associated with.
    /// `None` is the administrator view and sees everything.
    pub fn visible_to(&self, department_id: Option<&str>) -> bool {
        match department_id {
            None => true,
            Some(department) => {
                self.is_public || self.department_ids.iter().any(|id| id == department)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub document_id: String,
    pub tenant_id: String,
    pub ordinal: u32,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SearchScope {
    pub tenant_id: String,
    pub department_id: Option<String>,
}

impl SearchScope {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            department_id: None,
        }
    }

    pub fn department(tenant_id: impl Into<String>, department_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            department_id: Some(department_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub document_id: String,
    pub filename: String,
    pub ordinal: u32,
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub document_id: String,
    pub filename: String,
    #[serde(default)]
    pub section: Option<String>,
    pub excerpt: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub iteration: usize,
    pub tool: String,
    pub input: Value,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentSummary {
    pub id: String,
    pub filename: String,
    pub category: Option<String>,
    pub status: DocumentStatus,
    pub updated_at: DateTime<Utc>,
    pub chunk_count: usize,
}
