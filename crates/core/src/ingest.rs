use crate::chunking::TextChunker;
use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, IngestError};
use crate::extractor::Extractor;
use crate::models::{Chunk, Document, DocumentStatus, FileFormat};
use crate::traits::ChunkStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    pub is_public: bool,
    #[serde(default)]
    pub department_ids: Vec<String>,
}

impl Visibility {
    pub fn public() -> Self {
        Self {
            is_public: true,
            department_ids: Vec::new(),
        }
    }

    pub fn departments<I, S>(department_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            is_public: false,
            department_ids: department_ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub tenant_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub visibility: Visibility,
    pub category: Option<String>,
    pub external_ref: Option<String>,
}

impl IngestRequest {
    pub fn new(tenant_id: impl Into<String>, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            filename: filename.into(),
            bytes,
            visibility: Visibility::public(),
            category: None,
            external_ref: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub document_id: String,
    pub chunk_count: usize,
}

/// Extract, chunk, embed and store one file at a time. A document only
/// becomes `Ready` once its complete chunk set is committed.
pub struct IngestionPipeline {
    store: Arc<dyn ChunkStore>,
    extractor: Extractor,
    chunker: TextChunker,
    embedder: Arc<dyn Embedder>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        extractor: Extractor,
        chunker: TextChunker,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            extractor,
            chunker,
            embedder,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub async fn ingest_document(&self, request: IngestRequest) -> Result<IngestReceipt, IngestError> {
        if request.tenant_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument("tenant id is empty".to_string()));
        }
        let format = FileFormat::from_filename(&request.filename)
            .ok_or_else(|| IngestError::UnsupportedFormat(request.filename.clone()))?;

        let existing = match &request.external_ref {
            Some(external_ref) => {
                self.store
                    .find_by_external_ref(&request.tenant_id, external_ref)
                    .await?
            }
            None => None,
        };

        let now = Utc::now();
        let document = Document {
            id: existing
                .as_ref()
                .map(|document| document.id.clone())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            tenant_id: request.tenant_id.clone(),
            filename: request.filename.clone(),
            format,
            category: request.category.clone(),
            is_public: request.visibility.is_public,
            department_ids: request.visibility.department_ids.clone(),
            status: DocumentStatus::Pending,
            status_detail: None,
            external_ref: request.external_ref.clone(),
            checksum: digest_bytes(&request.bytes),
            created_at: existing.as_ref().map_or(now, |document| document.created_at),
            updated_at: now,
        };

        // A re-synced document keeps its previous record until the new chunk
        // set is committed with it.
        if existing.is_none() {
            self.store.upsert_document(&document).await?;
        }
        self.store
            .set_status(&document.id, DocumentStatus::Processing, None)
            .await?;
        info!(
            tenant_id = %document.tenant_id,
            document_id = %document.id,
            filename = %document.filename,
            resync = existing.is_some(),
            "ingesting document"
        );

        match self.process(document.clone(), &request.bytes).await {
            Ok(chunk_count) => {
                info!(document_id = %document.id, chunks = chunk_count, "document ready");
                Ok(IngestReceipt {
                    document_id: document.id,
                    chunk_count,
                })
            }
            Err(failure) => {
                self.mark_failed(&document.id, &failure).await;
                Err(failure)
            }
        }
    }

    async fn process(&self, document: Document, bytes: &[u8]) -> Result<usize, IngestError> {
        let chunks = self.build_chunks(&document, bytes).await?;
        let ready = Document {
            status: DocumentStatus::Ready,
            updated_at: Utc::now(),
            ..document
        };
        self.store.commit_document(&ready, &chunks).await?;
        Ok(chunks.len())
    }

    async fn build_chunks(&self, document: &Document, bytes: &[u8]) -> Result<Vec<Chunk>, IngestError> {
        let text = self.extractor.extract(&document.filename, bytes).await?;
        let segments = self.chunker.chunk(&text);
        if segments.is_empty() {
            return Err(IngestError::ExtractionFailure(format!(
                "{} produced no chunks",
                document.filename
            )));
        }

        let vectors = self.embedder.embed(&segments).await?;
        if vectors.len() != segments.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: segments.len(),
                actual: vectors.len(),
            }
            .into());
        }

        Ok(segments
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(ordinal, (content, embedding))| Chunk {
                document_id: document.id.clone(),
                tenant_id: document.tenant_id.clone(),
                ordinal: ordinal as u32,
                content,
                embedding,
            })
            .collect())
    }

    // A failed document keeps no chunks, so a re-sync never leaves stale
    // content searchable under a failed status.
    async fn mark_failed(&self, document_id: &str, failure: &IngestError) {
        match failure {
            IngestError::EmbeddingService(_) => {
                error!(%document_id, error = %failure, "embedding failed, aborting ingestion")
            }
            _ => warn!(%document_id, error = %failure, "ingestion failed"),
        }

        if let Err(store_error) = self.store.replace_chunks(document_id, &[]).await {
            error!(%document_id, error = %store_error, "could not clear chunks of failed document");
        }
        let detail = failure.to_string();
        if let Err(store_error) = self
            .store
            .set_status(document_id, DocumentStatus::Failed, Some(&detail))
            .await
        {
            error!(%document_id, error = %store_error, "could not record failed status");
        }
    }

    /// Removes the document and its chunks. Unknown ids are a no-op.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool, IngestError> {
        let removed = self.store.delete_document(document_id).await?;
        info!(%document_id, removed, "delete document");
        Ok(removed)
    }
}
