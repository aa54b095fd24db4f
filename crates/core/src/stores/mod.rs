pub mod memory;
pub mod sqlite;

pub use memory::MemoryChunkStore;
pub use sqlite::SqliteChunkStore;

use crate::error::StoreError;
use crate::models::{Chunk, DocumentSummary};
use std::cmp::Ordering;

// Ordinals must run 0..n-1 in order and every chunk must belong to the
// document being replaced.
fn validate_chunk_set(document_id: &str, chunks: &[Chunk]) -> Result<(), StoreError> {
    for (position, chunk) in chunks.iter().enumerate() {
        if chunk.document_id != document_id {
            return Err(StoreError::Invalid(format!(
                "chunk {} belongs to {}, not {document_id}",
                chunk.ordinal, chunk.document_id
            )));
        }
        if chunk.ordinal as usize != position {
            return Err(StoreError::Invalid(format!(
                "chunk ordinal {} at position {position} in {document_id}",
                chunk.ordinal
            )));
        }
    }
    Ok(())
}

fn summary_order(left: &DocumentSummary, right: &DocumentSummary) -> Ordering {
    right
        .updated_at
        .cmp(&left.updated_at)
        .then_with(|| left.filename.cmp(&right.filename))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::error::StoreError;
    use crate::models::{Chunk, Document, DocumentStatus, FileFormat, SearchScope};
    use crate::traits::ChunkStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub fn document(id: &str, tenant: &str, is_public: bool, departments: &[&str]) -> Document {
        Document {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            filename: format!("{id}.pdf"),
            format: FileFormat::Pdf,
            category: None,
            is_public,
            department_ids: departments.iter().map(|id| id.to_string()).collect(),
            status: DocumentStatus::Ready,
            status_detail: None,
            external_ref: None,
            checksum: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn chunk(document_id: &str, tenant: &str, ordinal: u32, embedding: Vec<f32>) -> Chunk {
        Chunk {
            document_id: document_id.to_string(),
            tenant_id: tenant.to_string(),
            ordinal,
            content: format!("{document_id} chunk {ordinal}"),
            embedding,
        }
    }

    fn generation(label: &str, count: usize) -> Vec<Chunk> {
        (0..count)
            .map(|ordinal| Chunk {
                document_id: "doc".to_string(),
                tenant_id: "tenant-a".to_string(),
                ordinal: ordinal as u32,
                content: format!("{label}-{ordinal}"),
                embedding: vec![1.0, 0.0],
            })
            .collect()
    }

    fn sorted_contents(chunks: &[Chunk]) -> Vec<String> {
        let mut contents = chunks
            .iter()
            .map(|chunk| chunk.content.clone())
            .collect::<Vec<_>>();
        contents.sort();
        contents
    }

    /// Swaps a 3-chunk set and a 5-chunk set back and forth while a reader
    /// keeps searching and listing. Every read must see exactly one set.
    pub async fn assert_replacement_is_atomic(
        store: Arc<dyn ChunkStore>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let old = generation("old", 3);
        let new = generation("new", 5);
        store.upsert_document(&document("doc", "tenant-a", true, &[])).await?;
        store.replace_chunks("doc", &old).await?;

        let finished = Arc::new(AtomicBool::new(false));
        let reader = {
            let store = Arc::clone(&store);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                let scope = SearchScope::tenant("tenant-a");
                let mut observations = Vec::new();
                loop {
                    let chunks = store.document_chunks("tenant-a", "doc").await?;
                    observations.push(sorted_contents(&chunks));

                    let mut hits = store
                        .search(&[1.0, 0.0], &scope, 10)
                        .await?
                        .into_iter()
                        .map(|hit| hit.content)
                        .collect::<Vec<_>>();
                    hits.sort();
                    observations.push(hits);

                    if finished.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                Ok::<_, StoreError>(observations)
            })
        };

        for round in 0..40 {
            let set = if round % 2 == 0 { &new } else { &old };
            store.replace_chunks("doc", set).await?;
            tokio::task::yield_now().await;
        }
        finished.store(true, Ordering::SeqCst);

        let observations = reader.await??;
        let old = sorted_contents(&old);
        let new = sorted_contents(&new);
        assert!(!observations.is_empty());
        for observed in &observations {
            assert!(
                *observed == old || *observed == new,
                "mixed chunk sets observed: {observed:?}"
            );
        }
        Ok(())
    }
}
