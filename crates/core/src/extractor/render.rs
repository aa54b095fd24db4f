use crate::config::{ImageEncoding, RenderTier};
use crate::error::IngestError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Rasterizes one page of a fixed-layout document.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(
        &self,
        pdf: &[u8],
        page_number: u32,
        tier: RenderTier,
    ) -> Result<Vec<u8>, IngestError>;
}

/// Converts office files between formats, e.g. a slide deck into PDF or a
/// legacy binary spreadsheet into its OOXML form.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(
        &self,
        bytes: &[u8],
        source_extension: &str,
        target_extension: &str,
    ) -> Result<Vec<u8>, IngestError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
}

/// Walks the tiers from sharpest to smallest and keeps the first encoding
/// that fits `budget`. When nothing fits, the last tier is used as is.
pub async fn render_within_budget(
    rasterizer: &dyn PageRasterizer,
    pdf: &[u8],
    page_number: u32,
    tiers: &[RenderTier],
    budget: usize,
) -> Result<RenderedPage, IngestError> {
    let mut last = None;
    for tier in tiers {
        let bytes = rasterizer.rasterize(pdf, page_number, *tier).await?;
        if bytes.len() <= budget {
            return Ok(RenderedPage {
                bytes,
                media_type: tier.encoding.media_type(),
            });
        }
        debug!(
            page = page_number,
            dpi = tier.dpi,
            kib = bytes.len() / 1024,
            "rendered page over budget, reducing"
        );
        last = Some(RenderedPage {
            bytes,
            media_type: tier.encoding.media_type(),
        });
    }

    last.ok_or_else(|| IngestError::Render("no render tiers configured".to_string()))
}

async fn run_tool(mut command: Command, timeout: Duration, tool: &str) -> Result<(), IngestError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|error| IngestError::Render(format!("failed to start {tool}: {error}")))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| IngestError::Render(format!("{tool} timed out after {timeout:?}")))??;

    if !output.status.success() {
        return Err(IngestError::Render(format!(
            "{tool} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Renders pages with poppler's `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pdftoppm"),
            timeout: Duration::from_secs(60),
        }
    }
}

impl PdftoppmRasterizer {
    fn arguments(tier: RenderTier, page_number: u32, input: &Path, prefix: &Path) -> Vec<String> {
        let mut args = match tier.encoding {
            ImageEncoding::Png => vec!["-png".to_string()],
            ImageEncoding::Jpeg { quality } => vec![
                "-jpeg".to_string(),
                "-jpegopt".to_string(),
                format!("quality={quality}"),
            ],
        };
        args.extend([
            "-r".to_string(),
            tier.dpi.to_string(),
            "-f".to_string(),
            page_number.to_string(),
            "-l".to_string(),
            page_number.to_string(),
            "-singlefile".to_string(),
            input.display().to_string(),
            prefix.display().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn rasterize(
        &self,
        pdf: &[u8],
        page_number: u32,
        tier: RenderTier,
    ) -> Result<Vec<u8>, IngestError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("input.pdf");
        tokio::fs::write(&input, pdf).await?;

        let prefix = workdir.path().join("page");
        let mut command = Command::new(&self.program);
        command.args(Self::arguments(tier, page_number, &input, &prefix));
        run_tool(command, self.timeout, "pdftoppm").await?;

        let extension = match tier.encoding {
            ImageEncoding::Png => "png",
            ImageEncoding::Jpeg { .. } => "jpg",
        };
        Ok(tokio::fs::read(prefix.with_extension(extension)).await?)
    }
}

/// Converts documents with a headless LibreOffice.
#[derive(Debug, Clone)]
pub struct LibreOfficeConverter {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl LibreOfficeConverter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("soffice"),
            timeout,
        }
    }
}

#[async_trait]
impl DocumentConverter for LibreOfficeConverter {
    async fn convert(
        &self,
        bytes: &[u8],
        source_extension: &str,
        target_extension: &str,
    ) -> Result<Vec<u8>, IngestError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join(format!("input.{source_extension}"));
        tokio::fs::write(&input, bytes).await?;

        let mut command = Command::new(&self.program);
        command
            .arg("--headless")
            .arg("--convert-to")
            .arg(target_extension)
            .arg("--outdir")
            .arg(workdir.path())
            .arg(&input);
        run_tool(command, self.timeout, "soffice").await?;

        let output = input.with_extension(target_extension);
        if !output.exists() {
            return Err(IngestError::Render(format!(
                "soffice produced no {target_extension} output"
            )));
        }
        Ok(tokio::fs::read(output).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct SizedRasterizer {
        sizes: Vec<usize>,
        calls: Mutex<Vec<RenderTier>>,
    }

    #[async_trait]
    impl PageRasterizer for SizedRasterizer {
        async fn rasterize(
            &self,
            _pdf: &[u8],
            _page_number: u32,
            tier: RenderTier,
        ) -> Result<Vec<u8>, IngestError> {
            let mut calls = self.calls.lock().expect("lock");
            let size = self.sizes[calls.len()];
            calls.push(tier);
            Ok(vec![0u8; size])
        }
    }

    #[tokio::test]
    async fn first_tier_within_budget_wins() -> Result<(), Box<dyn std::error::Error>> {
        let tiers = crate::config::ExtractionConfig::default().render_tiers;
        let rasterizer = SizedRasterizer {
            sizes: vec![500, 300, 90, 10, 5],
            calls: Mutex::new(Vec::new()),
        };

        let page = render_within_budget(&rasterizer, b"%PDF", 2, &tiers, 100).await?;

        assert_eq!(page.bytes.len(), 90);
        assert_eq!(page.media_type, "image/png");
        assert_eq!(rasterizer.calls.lock().expect("lock").len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_pages_fall_through_to_the_last_jpeg_tier(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let tiers = crate::config::ExtractionConfig::default().render_tiers;
        let rasterizer = SizedRasterizer {
            sizes: vec![500, 400, 300, 200, 150],
            calls: Mutex::new(Vec::new()),
        };

        let page = render_within_budget(&rasterizer, b"%PDF", 1, &tiers, 100).await?;

        assert_eq!(page.bytes.len(), 150);
        assert_eq!(page.media_type, "image/jpeg");
        Ok(())
    }

    #[test]
    fn jpeg_tiers_pass_quality_to_pdftoppm() {
        let args = PdftoppmRasterizer::arguments(
            RenderTier {
                dpi: 150,
                encoding: ImageEncoding::Jpeg { quality: 60 },
            },
            4,
            Path::new("in.pdf"),
            Path::new("out"),
        );
        assert_eq!(
            args,
            vec![
                "-jpeg", "-jpegopt", "quality=60", "-r", "150", "-f", "4", "-l", "4",
                "-singlefile", "in.pdf", "out"
            ]
        );
    }
}
