use super::{summary_order, validate_chunk_set};
use crate::error::StoreError;
use crate::models::{
    Chunk, Document, DocumentStatus, DocumentSummary, RetrievalResult, SearchScope,
};
use crate::ranking::{RankCandidate, Ranker};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredChunk {
    seq: u64,
    chunk: Chunk,
}

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<String, Document>,
    chunks: HashMap<String, Vec<StoredChunk>>,
    next_seq: u64,
}

impl Inner {
    fn swap_chunks(&mut self, document_id: &str, chunks: &[Chunk]) {
        let mut stored = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            stored.push(StoredChunk {
                seq: self.next_seq,
                chunk: chunk.clone(),
            });
            self.next_seq += 1;
        }
        self.chunks.insert(document_id.to_string(), stored);
    }
}

/// Chunk store held entirely in process memory. Search is a brute-force scan
/// over the eligible chunks, ranked by the shared [`Ranker`].
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    inner: RwLock<Inner>,
    ranker: Ranker,
}

impl MemoryChunkStore {
    pub fn new(ranker: Ranker) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            ranker,
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let document = inner
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        document.status = status;
        document.status_detail = detail.map(str::to_string);
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<(), StoreError> {
        validate_chunk_set(document_id, chunks)?;

        let mut inner = self.inner.write().await;
        if !inner.documents.contains_key(document_id) {
            return Err(StoreError::NotFound(document_id.to_string()));
        }

        inner.swap_chunks(document_id, chunks);

        debug!(document_id, chunks = chunks.len(), "replaced chunk set");
        Ok(())
    }

    async fn commit_document(&self, document: &Document, chunks: &[Chunk]) -> Result<(), StoreError> {
        validate_chunk_set(&document.id, chunks)?;

        let mut inner = self.inner.write().await;
        inner
            .documents
            .insert(document.id.clone(), document.clone());
        inner.swap_chunks(&document.id, chunks);

        debug!(document_id = %document.id, chunks = chunks.len(), "committed document");
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        inner.chunks.remove(document_id);
        Ok(inner.documents.remove(document_id).is_some())
    }

    async fn get_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .documents
            .get(document_id)
            .filter(|document| document.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_by_external_ref(
        &self,
        tenant_id: &str,
        external_ref: &str,
    ) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .documents
            .values()
            .find(|document| {
                document.tenant_id == tenant_id
                    && document.external_ref.as_deref() == Some(external_ref)
            })
            .cloned())
    }

    async fn document_chunks(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        let inner = self.inner.read().await;
        let mut chunks = inner
            .chunks
            .get(document_id)
            .map(|stored| {
                stored
                    .iter()
                    .filter(|entry| entry.chunk.tenant_id == tenant_id)
                    .map(|entry| entry.chunk.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        chunks.sort_by_key(|chunk| chunk.ordinal);
        Ok(chunks)
    }

    async fn list_documents(
        &self,
        scope: &SearchScope,
        limit: usize,
    ) -> Result<Vec<DocumentSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut summaries = inner
            .documents
            .values()
            .filter(|document| document.tenant_id == scope.tenant_id)
            .filter(|document| document.visible_to(scope.department_id.as_deref()))
            .map(|document| DocumentSummary {
                id: document.id.clone(),
                filename: document.filename.clone(),
                category: document.category.clone(),
                status: document.status,
                updated_at: document.updated_at,
                chunk_count: inner.chunks.get(&document.id).map_or(0, Vec::len),
            })
            .collect::<Vec<_>>();

        summaries.sort_by(summary_order);
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn search(
        &self,
        query_vector: &[f32],
        scope: &SearchScope,
        top_k: usize,
    ) -> Result<Vec<RetrievalResult>, StoreError> {
        let inner = self.inner.read().await;

        let mut eligible = inner
            .chunks
            .iter()
            .filter_map(|(document_id, stored)| {
                let document = inner.documents.get(document_id)?;
                let visible = document.tenant_id == scope.tenant_id
                    && document.visible_to(scope.department_id.as_deref());
                visible.then_some((document, stored))
            })
            .flat_map(|(document, stored)| {
                stored
                    .iter()
                    .filter(|entry| entry.chunk.tenant_id == scope.tenant_id)
                    .map(move |entry| (entry.seq, document, &entry.chunk))
            })
            .collect::<Vec<_>>();
        eligible.sort_by_key(|(seq, _, _)| *seq);

        let candidates = eligible.into_iter().map(|(_, document, chunk)| RankCandidate {
            document_id: chunk.document_id.clone(),
            filename: document.filename.clone(),
            ordinal: chunk.ordinal,
            content: chunk.content.clone(),
            embedding: chunk.embedding.clone(),
            updated_at: document.updated_at,
        });

        Ok(self.ranker.rank(query_vector, candidates, Utc::now(), top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::test_support::{assert_replacement_is_atomic, chunk, document};
    use std::sync::Arc;

    #[tokio::test]
    async fn search_honours_department_visibility() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryChunkStore::default();
        let public = document("public", "tenant-a", true, &[]);
        let sales = document("sales-only", "tenant-a", false, &["sales"]);
        store.upsert_document(&public).await?;
        store.upsert_document(&sales).await?;
        store
            .replace_chunks("public", &[chunk("public", "tenant-a", 0, vec![1.0, 0.0])])
            .await?;
        store
            .replace_chunks("sales-only", &[chunk("sales-only", "tenant-a", 0, vec![1.0, 0.0])])
            .await?;

        let hr = store
            .search(&[1.0, 0.0], &SearchScope::department("tenant-a", "hr"), 10)
            .await?;
        assert_eq!(hr.len(), 1);
        assert_eq!(hr[0].document_id, "public");

        let sales_view = store
            .search(&[1.0, 0.0], &SearchScope::department("tenant-a", "sales"), 10)
            .await?;
        assert_eq!(sales_view.len(), 2);

        let admin = store.search(&[0.0, 1.0], &SearchScope::tenant("tenant-a"), 10).await?;
        assert_eq!(admin.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn search_never_crosses_tenants() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryChunkStore::default();
        store
            .upsert_document(&document("other", "tenant-b", true, &[]))
            .await?;
        store
            .replace_chunks("other", &[chunk("other", "tenant-b", 0, vec![1.0])])
            .await?;

        let results = store.search(&[1.0], &SearchScope::tenant("tenant-a"), 5).await?;
        assert!(results.is_empty());
        assert!(store.get_document("tenant-a", "other").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn fewer_eligible_chunks_than_top_k() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryChunkStore::default();
        store
            .upsert_document(&document("doc", "tenant-a", true, &[]))
            .await?;
        store
            .replace_chunks(
                "doc",
                &[
                    chunk("doc", "tenant-a", 0, vec![1.0, 0.0]),
                    chunk("doc", "tenant-a", 1, vec![0.7, 0.7]),
                    chunk("doc", "tenant-a", 2, vec![0.0, 1.0]),
                ],
            )
            .await?;

        let results = store.search(&[1.0, 0.0], &SearchScope::tenant("tenant-a"), 5).await?;
        assert_eq!(results.len(), 3);
        assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
        assert_eq!(results[0].ordinal, 0);
        Ok(())
    }

    #[tokio::test]
    async fn replace_swaps_the_whole_chunk_set() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryChunkStore::default();
        store
            .upsert_document(&document("doc", "tenant-a", true, &[]))
            .await?;
        store
            .replace_chunks(
                "doc",
                &[
                    chunk("doc", "tenant-a", 0, vec![1.0]),
                    chunk("doc", "tenant-a", 1, vec![1.0]),
                ],
            )
            .await?;
        store
            .replace_chunks("doc", &[chunk("doc", "tenant-a", 0, vec![1.0])])
            .await?;

        let chunks = store.document_chunks("tenant-a", "doc").await?;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_readers_never_see_a_mixed_chunk_set(
    ) -> Result<(), Box<dyn std::error::Error>> {
        assert_replacement_is_atomic(Arc::new(MemoryChunkStore::default())).await
    }

    #[tokio::test]
    async fn commit_writes_metadata_and_chunks_together() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryChunkStore::default();
        store
            .upsert_document(&document("doc", "tenant-a", true, &[]))
            .await?;
        store
            .replace_chunks("doc", &[chunk("doc", "tenant-a", 0, vec![1.0])])
            .await?;

        let restricted = document("doc", "tenant-a", false, &["hr"]);
        store
            .commit_document(
                &restricted,
                &[
                    chunk("doc", "tenant-a", 0, vec![1.0]),
                    chunk("doc", "tenant-a", 1, vec![1.0]),
                ],
            )
            .await?;

        let sales = store
            .search(&[1.0], &SearchScope::department("tenant-a", "sales"), 10)
            .await?;
        assert!(sales.is_empty());
        assert_eq!(store.document_chunks("tenant-a", "doc").await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn gapped_ordinals_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryChunkStore::default();
        store
            .upsert_document(&document("doc", "tenant-a", true, &[]))
            .await?;
        let result = store
            .replace_chunks(
                "doc",
                &[
                    chunk("doc", "tenant-a", 0, vec![1.0]),
                    chunk("doc", "tenant-a", 2, vec![1.0]),
                ],
            )
            .await;
        assert!(matches!(result, Err(StoreError::Invalid(_))));
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryChunkStore::default();
        store
            .upsert_document(&document("doc", "tenant-a", true, &[]))
            .await?;
        store
            .replace_chunks("doc", &[chunk("doc", "tenant-a", 0, vec![1.0])])
            .await?;

        assert!(store.delete_document("doc").await?);
        assert!(!store.delete_document("doc").await?);
        assert!(store.document_chunks("tenant-a", "doc").await?.is_empty());
        Ok(())
    }
}
