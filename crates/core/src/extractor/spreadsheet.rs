use super::office::Sheet;
use super::Extractor;
use crate::error::{IngestError, ModelError};
use crate::llm::{Message, MessageRequest};
use futures_util::{stream, StreamExt};
use tracing::{info, warn};

pub(crate) const SHEET_FORMAT_PROMPT: &str = "The following is tab-separated data extracted from a spreadsheet.\n\
Reformat it as structured Markdown suited to retrieval.\n\n\
Rules:\n\
- Convert tabular data to Markdown tables.\n\
- Add headings and section structure where appropriate.\n\
- Write notes and remarks as prose.\n\
- Remove empty values and noise such as values repeated by merged cells.\n\
- Keep the meaning of the data and the relationships between values.\n\
- Return only the formatted result, with no explanation.";

/// One unit of reformatting work: a whole sheet, or one slice of a long
/// sheet with its header row repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetTask {
    pub sheet: String,
    pub part: Option<String>,
    pub tsv: String,
}

impl SheetTask {
    fn prompt_input(&self) -> String {
        let mut header = format!("=== Sheet: {} ===", self.sheet);
        if let Some(part) = &self.part {
            header.push_str(&format!(" ({part})"));
        }
        format!("{header}\n{}", self.tsv)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetPlan {
    pub contents: String,
    pub tasks: Vec<SheetTask>,
}

/// Non-empty rows as tab-separated lines. Tabs and newlines inside a cell
/// become spaces.
pub fn sheet_to_tsv(sheet: &Sheet) -> Vec<String> {
    sheet
        .rows
        .iter()
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|row| {
            row.iter()
                .map(|cell| cell.replace(['\t', '\n'], " ").replace('\r', ""))
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect()
}

pub fn plan_sheets(sheets: &[Sheet], chunk_rows: usize) -> SheetPlan {
    let chunk_rows = chunk_rows.max(1);
    let mut contents = vec!["This workbook contains the following sheets:".to_string()];
    let mut tasks = Vec::new();

    for sheet in sheets {
        let lines = sheet_to_tsv(sheet);
        contents.push(format!("- {} ({} rows)", sheet.name, lines.len()));

        let Some((header, body)) = lines.split_first() else {
            continue;
        };

        if lines.len() <= chunk_rows {
            tasks.push(SheetTask {
                sheet: sheet.name.clone(),
                part: None,
                tsv: lines.join("\n"),
            });
            continue;
        }

        for (index, slice) in body.chunks(chunk_rows).enumerate() {
            let start = index * chunk_rows;
            let mut tsv = header.clone();
            for line in slice {
                tsv.push('\n');
                tsv.push_str(line);
            }
            tasks.push(SheetTask {
                sheet: sheet.name.clone(),
                part: Some(format!(
                    "Part {}, rows {}-{}",
                    index + 1,
                    start + 2,
                    start + 1 + slice.len()
                )),
                tsv,
            });
        }
    }

    SheetPlan {
        contents: contents.join("\n"),
        tasks,
    }
}

impl Extractor {
    pub async fn extract_workbook(&self, sheets: &[Sheet]) -> Result<String, IngestError> {
        let plan = plan_sheets(sheets, self.config.sheet_chunk_rows);
        info!(
            sheets = sheets.len(),
            tasks = plan.tasks.len(),
            "planned spreadsheet reformatting"
        );

        let mut formatted = stream::iter(plan.tasks.iter().enumerate())
            .map(|(index, task)| async move { (index, self.format_sheet_task(task).await) })
            .buffer_unordered(self.config.max_workers.max(1))
            .collect::<Vec<_>>()
            .await;
        formatted.sort_by_key(|(index, _)| *index);

        let mut parts = vec![plan.contents];
        for (index, result) in formatted {
            let task = &plan.tasks[index];
            let text = match result {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => {
                    warn!(sheet = %task.sheet, part = ?task.part, "reformatting was empty, using raw rows");
                    task.tsv.clone()
                }
                Err(error) => {
                    warn!(sheet = %task.sheet, part = ?task.part, %error, "reformatting failed, using raw rows");
                    task.tsv.clone()
                }
            };
            if !text.trim().is_empty() {
                parts.push(format!("<!-- sheet: {} -->\n{}", task.sheet, text.trim()));
            }
        }

        Ok(parts.join("\n\n"))
    }

    async fn format_sheet_task(&self, task: &SheetTask) -> Result<String, IngestError> {
        let Some(model) = self.model.as_ref() else {
            return Ok(task.tsv.clone());
        };

        let request = MessageRequest {
            messages: vec![Message::user_text(format!(
                "{SHEET_FORMAT_PROMPT}\n\n{}",
                task.prompt_input()
            ))],
            max_tokens: self.config.vision_max_tokens,
            ..MessageRequest::default()
        };

        let response = tokio::time::timeout(self.config.unit_timeout, model.complete(&request))
            .await
            .map_err(|_| IngestError::Model(ModelError::Timeout(self.config.unit_timeout)))??;
        Ok(response.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;
    use crate::llm::{ContentBlock, LanguageModel, MessageResponse, StopReason};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    fn sheet(name: &str, rows: &[&[&str]]) -> Sheet {
        Sheet {
            name: name.to_string(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|cell| cell.to_string()).collect())
                .collect(),
        }
    }

    fn numbered_sheet(name: &str, data_rows: usize) -> Sheet {
        let mut rows = vec![vec!["id".to_string(), "amount".to_string()]];
        rows.extend((1..=data_rows).map(|n| vec![n.to_string(), (n * 10).to_string()]));
        Sheet {
            name: name.to_string(),
            rows,
        }
    }

    /// Finishes later tasks first and fails any slice that contains row 3.
    struct ReversingModel;

    #[async_trait]
    impl LanguageModel for ReversingModel {
        async fn complete(&self, request: &MessageRequest) -> Result<MessageResponse, ModelError> {
            let input = match &request.messages[0].content[0] {
                ContentBlock::Text { text } => text.clone(),
                _ => String::new(),
            };
            let heading = input
                .lines()
                .find(|line| line.starts_with("=== Sheet:"))
                .unwrap_or_default()
                .to_string();

            let delay = if heading.contains("Part 1") { 60 } else { 0 };
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if input.lines().any(|line| line == "3\t30") {
                return Err(ModelError::Decode("refused".to_string()));
            }
            Ok(MessageResponse {
                content: vec![ContentBlock::Text {
                    text: format!("formatted {heading}"),
                }],
                stop_reason: StopReason::EndTurn,
            })
        }
    }

    #[test]
    fn cells_are_flattened_and_blank_rows_dropped() {
        let lines = sheet_to_tsv(&sheet(
            "Costs",
            &[&["item", "note"], &["", " "], &["tax\tfree", "two\nlines"]],
        ));
        assert_eq!(lines, vec!["item\tnote", "tax free\ttwo lines"]);
    }

    #[test]
    fn long_sheets_are_split_with_the_header_repeated() {
        let plan = plan_sheets(&[numbered_sheet("Ledger", 5), sheet("Empty", &[])], 2);

        assert_eq!(
            plan.contents,
            "This workbook contains the following sheets:\n- Ledger (6 rows)\n- Empty (0 rows)"
        );
        let parts = plan
            .tasks
            .iter()
            .map(|task| task.part.clone().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(
            parts,
            vec!["Part 1, rows 2-3", "Part 2, rows 4-5", "Part 3, rows 6-6"]
        );
        assert!(plan.tasks.iter().all(|task| task.tsv.starts_with("id\tamount\n")));
        assert_eq!(plan.tasks[2].tsv, "id\tamount\n5\t50");
    }

    #[test]
    fn short_sheets_are_a_single_task() {
        let plan = plan_sheets(&[numbered_sheet("Small", 200)], 200);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].part, None);
    }

    #[tokio::test]
    async fn results_are_assembled_in_task_order_with_raw_fallback(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let config = ExtractionConfig {
            sheet_chunk_rows: 2,
            ..ExtractionConfig::default()
        };
        let extractor = Extractor::new(config).with_model(Arc::new(ReversingModel));

        let text = extractor
            .extract_workbook(&[numbered_sheet("Ledger", 4), sheet("Notes", &[&["memo"]])])
            .await?;

        let toc = text.find("- Notes (1 rows)").expect("contents");
        let first = text.find("<!-- sheet: Ledger -->\nformatted === Sheet: Ledger === (Part 1, rows 2-3)");
        let second = text.find("<!-- sheet: Ledger -->\nid\tamount\n3\t30\n4\t40");
        let notes = text.find("<!-- sheet: Notes -->\nformatted === Sheet: Notes ===");
        assert!(first.is_some() && second.is_some() && notes.is_some());
        assert!(toc < first.unwrap_or(0));
        assert!(first < second && second < notes);
        Ok(())
    }
}
