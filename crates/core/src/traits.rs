use crate::error::StoreError;
use crate::models::{
    Chunk, Document, DocumentStatus, DocumentSummary, RetrievalResult, SearchScope,
};
use async_trait::async_trait;

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError>;

    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Swaps the whole chunk set of a document. Readers observe either the
    /// previous set or the new one, never a mix.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), StoreError>;

    /// Writes the document record and swaps its chunk set as one change, so
    /// new metadata never applies to old chunks or the reverse.
    async fn commit_document(&self, document: &Document, chunks: &[Chunk]) -> Result<(), StoreError>;

    /// Returns whether anything was removed. Deleting an unknown id is not an error.
    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError>;

    async fn get_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<Document>, StoreError>;

    async fn find_by_external_ref(
        &self,
        tenant_id: &str,
        external_ref: &str,
    ) -> Result<Option<Document>, StoreError>;

    /// Chunks of one document in ordinal order.
    async fn document_chunks(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Vec<Chunk>, StoreError>;

    /// Documents visible in `scope`, most recently updated first.
    async fn list_documents(
        &self,
        scope: &SearchScope,
        limit: usize,
    ) -> Result<Vec<DocumentSummary>, StoreError>;

    async fn search(
        &self,
        query_vector: &[f32],
        scope: &SearchScope,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, StoreError>;
}
