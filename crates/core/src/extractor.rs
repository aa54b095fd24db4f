use crate::config::ExtractionConfig;
use crate::error::IngestError;
use crate::llm::LanguageModel;
use crate::models::FileFormat;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub mod office;
pub mod pdf;
pub mod render;
pub mod spreadsheet;
pub mod text;

pub use pdf::{LopdfDocument, PagedDocument};
pub use render::{
    DocumentConverter, LibreOfficeConverter, PageRasterizer, PdftoppmRasterizer,
};

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Turns uploaded files into Markdown-flavoured text ready for chunking.
pub struct Extractor {
    config: ExtractionConfig,
    model: Option<Arc<dyn LanguageModel>>,
    rasterizer: Arc<dyn PageRasterizer>,
    converter: Arc<dyn DocumentConverter>,
}

impl Extractor {
    pub fn new(config: ExtractionConfig) -> Self {
        let converter = Arc::new(LibreOfficeConverter::new(config.conversion_timeout));
        Self {
            config,
            model: None,
            rasterizer: Arc::new(PdftoppmRasterizer::default()),
            converter,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = rasterizer;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub async fn extract(&self, filename: &str, bytes: &[u8]) -> Result<String, IngestError> {
        let format = FileFormat::from_filename(filename)
            .ok_or_else(|| IngestError::UnsupportedFormat(filename.to_string()))?;
        let extension = extension_of(filename);

        info!(filename, format = format.as_str(), bytes = bytes.len(), "extracting");

        let text = match format {
            FileFormat::Pdf => self.extract_pdf(bytes).await?,
            FileFormat::Presentation => {
                let pdf = self.converter.convert(bytes, &extension, "pdf").await?;
                self.extract_pdf(&pdf).await?
            }
            FileFormat::WordProcessing if extension == "doc" => {
                let docx = self.converter.convert(bytes, &extension, "docx").await?;
                office::docx_to_markdown(&docx)?
            }
            FileFormat::WordProcessing => office::docx_to_markdown(bytes)?,
            FileFormat::Spreadsheet if extension == "xls" => {
                let xlsx = self.converter.convert(bytes, &extension, "xlsx").await?;
                self.extract_workbook(&office::read_workbook(&xlsx)?).await?
            }
            FileFormat::Spreadsheet => {
                self.extract_workbook(&office::read_workbook(bytes)?).await?
            }
            FileFormat::Csv => text::csv_to_markdown(bytes),
            FileFormat::Html => text::html_to_markdown(bytes)?,
            FileFormat::PlainText => text::decode_text(bytes),
        };

        if text.trim().is_empty() {
            return Err(IngestError::ExtractionFailure(format!(
                "no text could be extracted from {filename}"
            )));
        }
        Ok(text)
    }

    async fn extract_pdf(&self, bytes: &[u8]) -> Result<String, IngestError> {
        let document = LopdfDocument::load(bytes)?;
        self.extract_paginated(&document, bytes).await
    }
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records conversions and hands back canned output.
    struct CannedConverter {
        output: Vec<u8>,
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DocumentConverter for CannedConverter {
        async fn convert(
            &self,
            _bytes: &[u8],
            source_extension: &str,
            target_extension: &str,
        ) -> Result<Vec<u8>, IngestError> {
            self.calls
                .lock()
                .expect("lock")
                .push((source_extension.to_string(), target_extension.to_string()));
            Ok(self.output.clone())
        }
    }

    #[tokio::test]
    async fn unknown_extensions_are_rejected() {
        let extractor = Extractor::new(ExtractionConfig::default());
        assert!(matches!(
            extractor.extract("archive.zip", b"PK").await,
            Err(IngestError::UnsupportedFormat(_))
        ));
    }

    #[tokio::test]
    async fn blank_text_is_an_extraction_failure() {
        let extractor = Extractor::new(ExtractionConfig::default());
        assert!(matches!(
            extractor.extract("empty.txt", b" \n\t").await,
            Err(IngestError::ExtractionFailure(_))
        ));
    }

    #[tokio::test]
    async fn text_formats_are_routed_without_a_model() -> Result<(), Box<dyn std::error::Error>> {
        let extractor = Extractor::new(ExtractionConfig::default());

        let csv = extractor.extract("rates.CSV", b"city,rate\nTokyo,12000\n").await?;
        assert_eq!(csv, "| city | rate |\n| --- | --- |\n| Tokyo | 12000 |");

        let markdown = extractor.extract("notes.md", "# 規程\n本文".as_bytes()).await?;
        assert_eq!(markdown, "# 規程\n本文");
        Ok(())
    }

    #[tokio::test]
    async fn legacy_word_files_are_converted_before_parsing(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let docx = office::fixtures::zip_entries(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t>Converted body</w:t></w:r></w:p></w:body></w:document>"#,
        )]);
        let converter = Arc::new(CannedConverter {
            output: docx,
            calls: Mutex::new(Vec::new()),
        });
        let extractor =
            Extractor::new(ExtractionConfig::default()).with_converter(converter.clone());

        let text = extractor.extract("old.DOC", b"\xd0\xcf\x11\xe0").await?;

        assert_eq!(text, "Converted body");
        assert_eq!(
            converter.calls.lock().expect("lock").as_slice(),
            &[("doc".to_string(), "docx".to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn presentations_are_converted_to_pdf_and_paginated(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let converter = Arc::new(CannedConverter {
            output: pdf::fixtures::text_and_image_pdf("Quarterly travel budget")?,
            calls: Mutex::new(Vec::new()),
        });
        let extractor =
            Extractor::new(ExtractionConfig::default()).with_converter(converter.clone());

        let text = extractor.extract("deck.pptx", b"PK\x03\x04").await?;

        assert!(text.starts_with("<!-- page 1 -->"));
        assert!(text.contains("Quarterly travel budget"));
        assert!(!text.contains("<!-- page 2 -->"));
        assert_eq!(
            converter.calls.lock().expect("lock").as_slice(),
            &[("pptx".to_string(), "pdf".to_string())]
        );
        Ok(())
    }
}
