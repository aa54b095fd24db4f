use crate::error::IngestError;
use crate::ingest::{digest_bytes, IngestRequest, IngestionPipeline, Visibility};
use crate::models::{DocumentStatus, FileFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// A file offered by an external source. `locator` is opaque to everything
/// but the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub external_ref: String,
    pub filename: String,
    pub locator: String,
}

#[async_trait]
pub trait ExternalFileSource: Send + Sync {
    async fn list(&self) -> Result<Vec<SourceEntry>, IngestError>;

    async fn fetch(&self, entry: &SourceEntry) -> Result<Vec<u8>, IngestError>;
}

/// Per-tenant settings for one sync call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub external_ref: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub ingested: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<SyncFailure>,
}

/// Walks a directory tree for files in a supported format.
#[derive(Debug, Clone)]
pub struct LocalFolderSource {
    root: PathBuf,
}

impl LocalFolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ExternalFileSource for LocalFolderSource {
    async fn list(&self) -> Result<Vec<SourceEntry>, IngestError> {
        if !self.root.is_dir() {
            return Err(IngestError::InvalidArgument(format!(
                "not a directory: {}",
                self.root.display()
            )));
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|item| item.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(filename) = entry.file_name().to_str() else {
                continue;
            };
            if FileFormat::from_filename(filename).is_none() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            entries.push(SourceEntry {
                external_ref: format!("folder:{relative}"),
                filename: filename.to_string(),
                locator: relative,
            });
        }

        entries.sort_by(|left, right| left.external_ref.cmp(&right.external_ref));
        Ok(entries)
    }

    async fn fetch(&self, entry: &SourceEntry) -> Result<Vec<u8>, IngestError> {
        Ok(tokio::fs::read(self.root.join(&entry.locator)).await?)
    }
}

// Returns whether the entry was (re)ingested.
async fn sync_entry(
    pipeline: &IngestionPipeline,
    config: &SourceConfig,
    source: &dyn ExternalFileSource,
    entry: &SourceEntry,
) -> Result<bool, IngestError> {
    let bytes = source.fetch(entry).await?;
    let existing = pipeline
        .store()
        .find_by_external_ref(&config.tenant_id, &entry.external_ref)
        .await?;

    let unchanged = existing.is_some_and(|document| {
        document.status == DocumentStatus::Ready && document.checksum == digest_bytes(&bytes)
    });
    if unchanged {
        return Ok(false);
    }

    pipeline
        .ingest_document(IngestRequest {
            tenant_id: config.tenant_id.clone(),
            filename: entry.filename.clone(),
            bytes,
            visibility: config.visibility.clone(),
            category: config.category.clone(),
            external_ref: Some(entry.external_ref.clone()),
        })
        .await?;
    Ok(true)
}

/// Ingests new files, re-ingests changed ones and skips files whose checksum
/// matches a ready document. One failing file never stops the sync.
pub async fn sync_source(
    pipeline: &IngestionPipeline,
    config: &SourceConfig,
    source: &dyn ExternalFileSource,
) -> Result<SyncReport, IngestError> {
    let entries = source.list().await?;
    let mut report = SyncReport::default();

    for entry in entries {
        let result = sync_entry(pipeline, config, source, &entry).await;

        match result {
            Ok(true) => report.ingested.push(entry.external_ref),
            Ok(false) => report.unchanged.push(entry.external_ref),
            Err(error) => {
                warn!(external_ref = %entry.external_ref, %error, "sync failed for file");
                report.failed.push(SyncFailure {
                    external_ref: entry.external_ref,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        tenant_id = %config.tenant_id,
        ingested = report.ingested.len(),
        unchanged = report.unchanged.len(),
        failed = report.failed.len(),
        "source sync finished"
    );
    Ok(report)
}
