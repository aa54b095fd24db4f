use super::render::render_within_budget;
use super::{Extractor, PageText};
use crate::config::ExtractionConfig;
use crate::error::{IngestError, ModelError};
use crate::llm::{ContentBlock, ImageSource, Message, MessageRequest, MessageRole};
use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::{stream, StreamExt};
use lopdf::{Dictionary, Object, ObjectId};
use tracing::{info, warn};

pub(crate) const PAGE_EXTRACTION_PROMPT: &str = "Extract the content of this page as faithful, structured Markdown.\n\
Rules:\n\
- Keep the heading structure (#, ##, ###).\n\
- Convert tables to Markdown tables, reproducing every number and its row/column relationship exactly.\n\
- Describe charts and graphs as tables or lists of the data points you can read.\n\
- Describe figures and images in words.\n\
- Transcribe text verbatim.\n\
- Return only the extraction, with no preamble or commentary.";

// Nested form XObjects deeper than this are not searched for images.
const MAX_FORM_DEPTH: usize = 4;

/// A fixed-layout document whose pages can be inspected one by one.
/// Page numbers are 1-based.
pub trait PagedDocument: Send + Sync {
    fn page_count(&self) -> u32;

    fn page_text(&self, page_number: u32) -> Result<String, IngestError>;

    fn image_count(&self, page_number: u32) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    TextDense,
    Visual,
}

pub fn classify_page(text: &str, image_count: usize, config: &ExtractionConfig) -> PageClass {
    if text.trim().chars().count() >= config.text_dense_min_chars
        && image_count <= config.text_dense_max_images
    {
        PageClass::TextDense
    } else {
        PageClass::Visual
    }
}

pub struct LopdfDocument {
    document: lopdf::Document,
    pages: Vec<ObjectId>,
}

impl LopdfDocument {
    pub fn load(bytes: &[u8]) -> Result<Self, IngestError> {
        let document = lopdf::Document::load_mem(bytes)
            .map_err(|error| IngestError::PdfParse(error.to_string()))?;
        let pages = document.get_pages().into_values().collect();
        Ok(Self { document, pages })
    }

    fn resolve<'a>(&'a self, object: &'a Object) -> Option<&'a Object> {
        match object {
            Object::Reference(id) => self.document.get_object(*id).ok(),
            other => Some(other),
        }
    }

    fn resources(&self, page_id: ObjectId) -> Option<&Dictionary> {
        let mut node = self.document.get_dictionary(page_id).ok()?;
        // Resources are inheritable from the page tree.
        for _ in 0..32 {
            if let Ok(resources) = node.get(b"Resources") {
                return self.resolve(resources)?.as_dict().ok();
            }
            let parent = node.get(b"Parent").ok()?;
            node = self.resolve(parent)?.as_dict().ok()?;
        }
        None
    }

    fn count_images(&self, resources: &Dictionary, depth: usize) -> usize {
        let Some(xobjects) = resources
            .get(b"XObject")
            .ok()
            .and_then(|object| self.resolve(object))
            .and_then(|object| object.as_dict().ok())
        else {
            return 0;
        };

        let mut count = 0;
        for (_, entry) in xobjects.iter() {
            let Some(Object::Stream(stream)) = self.resolve(entry) else {
                continue;
            };
            match stream.dict.get(b"Subtype").and_then(Object::as_name) {
                Ok(b"Image") => count += 1,
                Ok(b"Form") if depth < MAX_FORM_DEPTH => {
                    if let Some(nested) = stream
                        .dict
                        .get(b"Resources")
                        .ok()
                        .and_then(|object| self.resolve(object))
                        .and_then(|object| object.as_dict().ok())
                    {
                        count += self.count_images(nested, depth + 1);
                    }
                }
                _ => {}
            }
        }
        count
    }
}

impl PagedDocument for LopdfDocument {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn page_text(&self, page_number: u32) -> Result<String, IngestError> {
        self.document
            .extract_text(&[page_number])
            .map_err(|error| IngestError::PdfParse(error.to_string()))
    }

    fn image_count(&self, page_number: u32) -> usize {
        let Some(page_id) = page_number
            .checked_sub(1)
            .and_then(|index| self.pages.get(index as usize))
        else {
            return 0;
        };
        self.resources(*page_id)
            .map(|resources| self.count_images(resources, 0))
            .unwrap_or(0)
    }
}

pub(crate) fn assemble_pages(pages: &[PageText]) -> String {
    pages
        .iter()
        .filter(|page| !page.text.trim().is_empty())
        .map(|page| format!("<!-- page {} -->\n{}", page.number, page.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

impl Extractor {
    /// Text-dense pages are read from the text layer. Visual pages go through
    /// the vision model concurrently; a failed page falls back to its text
    /// layer.
    pub async fn extract_paginated(
        &self,
        document: &dyn PagedDocument,
        pdf: &[u8],
    ) -> Result<String, IngestError> {
        let page_count = document.page_count();
        let mut pages = Vec::with_capacity(page_count as usize);
        let mut visual = Vec::new();

        for number in 1..=page_count {
            let text = document.page_text(number).unwrap_or_else(|error| {
                warn!(page = number, %error, "text layer unreadable");
                String::new()
            });
            let images = document.image_count(number);

            if classify_page(&text, images, &self.config) == PageClass::Visual {
                visual.push(number);
            }
            pages.push(PageText { number, text });
        }

        info!(
            pages = page_count,
            text_dense = page_count as usize - visual.len(),
            visual = visual.len(),
            "classified pages"
        );

        let extracted = stream::iter(visual)
            .map(|number| async move { (number, self.extract_visual_page(pdf, number).await) })
            .buffer_unordered(self.config.max_workers.max(1))
            .collect::<Vec<_>>()
            .await;

        for (number, result) in extracted {
            let slot = &mut pages[(number - 1) as usize];
            match result {
                Ok(text) if !text.trim().is_empty() => {
                    info!(page = number, "vision extraction complete");
                    slot.text = text;
                }
                Ok(_) => warn!(page = number, "vision extraction was empty, using text layer"),
                Err(error) => {
                    warn!(page = number, %error, "vision extraction failed, using text layer")
                }
            }
        }

        Ok(assemble_pages(&pages))
    }

    async fn extract_visual_page(&self, pdf: &[u8], number: u32) -> Result<String, IngestError> {
        let Some(model) = self.model.as_ref() else {
            return Err(IngestError::ExtractionFailure(
                "no vision model configured".to_string(),
            ));
        };

        let work = async {
            let rendered = render_within_budget(
                self.rasterizer.as_ref(),
                pdf,
                number,
                &self.config.render_tiers,
                self.config.image_budget_bytes,
            )
            .await?;

            let request = MessageRequest {
                messages: vec![Message {
                    role: MessageRole::User,
                    content: vec![
                        ContentBlock::Image {
                            source: ImageSource {
                                kind: "base64".to_string(),
                                media_type: rendered.media_type.to_string(),
                                data: STANDARD.encode(&rendered.bytes),
                            },
                        },
                        ContentBlock::Text {
                            text: PAGE_EXTRACTION_PROMPT.to_string(),
                        },
                    ],
                }],
                max_tokens: self.config.vision_max_tokens,
                ..MessageRequest::default()
            };

            let response = model.complete(&request).await?;
            Ok::<_, IngestError>(response.text())
        };

        tokio::time::timeout(self.config.unit_timeout, work)
            .await
            .map_err(|_| IngestError::Model(ModelError::Timeout(self.config.unit_timeout)))?
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    /// Two pages sharing inherited font resources. Page 1 carries `text`;
    /// page 2 draws an image directly and another through a form XObject.
    pub fn text_and_image_pdf(text: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let text_content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let text_stream = doc.add_object(Stream::new(dictionary! {}, text_content.encode()?));
        let text_page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => text_stream,
        });

        let pixel = || {
            Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => 1,
                    "Height" => 1,
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 8,
                },
                vec![0],
            )
        };
        let photo_id = doc.add_object(pixel());
        let logo_id = doc.add_object(pixel());
        let form_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "BBox" => vec![0.into(), 0.into(), 1.into(), 1.into()],
                "Resources" => dictionary! {
                    "XObject" => dictionary! { "Logo" => logo_id },
                },
            },
            b"/Logo Do".to_vec(),
        ));
        let image_content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![200.into(), 0.into(), 0.into(), 200.into(), 72.into(), 400.into()],
                ),
                Operation::new("Do", vec!["Photo".into()]),
                Operation::new("Do", vec!["Banner".into()]),
                Operation::new("Q", vec![]),
            ],
        };
        let image_stream = doc.add_object(Stream::new(dictionary! {}, image_content.encode()?));
        let image_page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => image_stream,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Photo" => photo_id, "Banner" => form_id },
            },
        });

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![text_page.into(), image_page.into()],
                "Count" => 2,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes)?;
        Ok(bytes)
    }
}
