//! Native OOXML readers: word-processing documents become markdown, workbooks
//! become rows of cell text.

use super::text::markdown_table;
use crate::error::IngestError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read};

const MAX_XML_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn ooxml_error(error: impl std::fmt::Display) -> IngestError {
    IngestError::Ooxml(error.to_string())
}

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, IngestError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml_error)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Option<Vec<u8>>, IngestError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(error) => return Err(ooxml_error(error)),
    };

    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml_error)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(IngestError::Ooxml(format!("{name} exceeds size limit")));
    }
    Ok(Some(out))
}

fn require_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, IngestError> {
    read_entry(archive, name)?.ok_or_else(|| IngestError::Ooxml(format!("{name} not found")))
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.into_owned()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParagraphKind {
    Heading(usize),
    Bullet,
    Numbered,
    Body,
}

fn kind_from_style_name(name: &str) -> ParagraphKind {
    let lowered = name.to_ascii_lowercase().replace(' ', "");
    if lowered == "title" {
        return ParagraphKind::Heading(1);
    }
    if let Some(level) = lowered.strip_prefix("heading") {
        return ParagraphKind::Heading(level.parse::<usize>().unwrap_or(1).clamp(1, 6));
    }
    if lowered.starts_with("listnumber") {
        return ParagraphKind::Numbered;
    }
    if lowered.starts_with("listbullet") {
        return ParagraphKind::Bullet;
    }
    ParagraphKind::Body
}

fn parse_styles(xml: &[u8]) -> Result<HashMap<String, ParagraphKind>, IngestError> {
    let mut styles = HashMap::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(e) if e.local_name().as_ref() == b"style" => {
                current = attribute(&e, b"styleId");
            }
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"name" => {
                if let (Some(id), Some(name)) = (current.as_ref(), attribute(&e, b"val")) {
                    styles.insert(id.clone(), kind_from_style_name(&name));
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"style" => current = None,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(styles)
}

/// Maps (numId, level) to whether that list level is numbered.
fn parse_numbering(xml: &[u8]) -> Result<HashMap<(String, u32), bool>, IngestError> {
    let mut abstract_formats: HashMap<(String, u32), bool> = HashMap::new();
    let mut num_to_abstract: HashMap<String, String> = HashMap::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut abstract_id: Option<String> = None;
    let mut level: Option<u32> = None;
    let mut num_id: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"abstractNum" => abstract_id = attribute(&e, b"abstractNumId"),
                b"lvl" => level = attribute(&e, b"ilvl").and_then(|v| v.parse().ok()),
                b"numFmt" => {
                    if let (Some(id), Some(level), Some(format)) =
                        (abstract_id.as_ref(), level, attribute(&e, b"val"))
                    {
                        abstract_formats.insert((id.clone(), level), format != "bullet");
                    }
                }
                b"num" => num_id = attribute(&e, b"numId"),
                b"abstractNumId" => {
                    if let (Some(num), Some(target)) = (num_id.as_ref(), attribute(&e, b"val")) {
                        num_to_abstract.insert(num.clone(), target);
                    }
                }
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"abstractNum" => abstract_id = None,
                b"lvl" => level = None,
                b"num" => num_id = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let mut numbering = HashMap::new();
    for (num, abstract_ref) in num_to_abstract {
        for ((id, level), ordered) in &abstract_formats {
            if *id == abstract_ref {
                numbering.insert((num.clone(), *level), *ordered);
            }
        }
    }
    Ok(numbering)
}

#[derive(Debug, Default)]
struct Paragraph {
    text: String,
    style: Option<String>,
    num_id: Option<String>,
    level: u32,
}

#[derive(Debug)]
struct Block {
    text: String,
    list_item: bool,
}

struct DocxRenderer {
    styles: HashMap<String, ParagraphKind>,
    numbering: HashMap<(String, u32), bool>,
    counters: HashMap<(String, u32), usize>,
    blocks: Vec<Block>,
}

impl DocxRenderer {
    fn paragraph_kind(&self, paragraph: &Paragraph) -> ParagraphKind {
        let styled = paragraph
            .style
            .as_ref()
            .map(|id| {
                self.styles
                    .get(id)
                    .copied()
                    .unwrap_or_else(|| kind_from_style_name(id))
            })
            .unwrap_or(ParagraphKind::Body);

        match (&paragraph.num_id, styled) {
            (_, ParagraphKind::Heading(level)) => ParagraphKind::Heading(level),
            // numId 0 explicitly removes numbering
            (Some(num_id), _) if num_id != "0" => {
                let ordered = self
                    .numbering
                    .get(&(num_id.clone(), paragraph.level))
                    .copied()
                    .unwrap_or(styled == ParagraphKind::Numbered);
                if ordered {
                    ParagraphKind::Numbered
                } else {
                    ParagraphKind::Bullet
                }
            }
            (_, kind) => kind,
        }
    }

    fn push_paragraph(&mut self, paragraph: Paragraph) {
        let text = paragraph.text.trim().to_string();
        if text.is_empty() {
            return;
        }

        let indent = "  ".repeat(paragraph.level as usize);
        match self.paragraph_kind(&paragraph) {
            ParagraphKind::Heading(level) => self.blocks.push(Block {
                text: format!("{} {text}", "#".repeat(level)),
                list_item: false,
            }),
            ParagraphKind::Bullet => self.blocks.push(Block {
                text: format!("{indent}- {text}"),
                list_item: true,
            }),
            ParagraphKind::Numbered => {
                let list = paragraph.num_id.clone().unwrap_or_default();
                self.counters
                    .retain(|(id, level), _| *id != list || *level <= paragraph.level);
                let counter = self.counters.entry((list, paragraph.level)).or_insert(0);
                *counter += 1;
                self.blocks.push(Block {
                    text: format!("{indent}{}. {text}", *counter),
                    list_item: true,
                });
            }
            ParagraphKind::Body => self.blocks.push(Block {
                text,
                list_item: false,
            }),
        }
    }

    fn render(mut self, document_xml: &[u8]) -> Result<String, IngestError> {
        let mut reader = Reader::from_reader(document_xml);
        let mut buf = Vec::new();

        let mut paragraph: Option<Paragraph> = None;
        let mut in_text = false;
        let mut table_depth = 0usize;
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut row: Vec<String> = Vec::new();
        let mut cell = String::new();

        loop {
            match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"p" => paragraph = Some(Paragraph::default()),
                    b"t" => in_text = true,
                    b"tbl" => {
                        table_depth += 1;
                        if table_depth == 1 {
                            rows.clear();
                        }
                    }
                    b"tr" if table_depth == 1 => row.clear(),
                    b"tc" if table_depth == 1 => cell.clear(),
                    b"pStyle" => set_style(&mut paragraph, &e),
                    _ => {}
                },
                Event::Empty(e) => match e.local_name().as_ref() {
                    b"pStyle" => set_style(&mut paragraph, &e),
                    b"numId" => {
                        if let Some(paragraph) = paragraph.as_mut() {
                            paragraph.num_id = attribute(&e, b"val");
                        }
                    }
                    b"ilvl" => {
                        if let Some(paragraph) = paragraph.as_mut() {
                            paragraph.level =
                                attribute(&e, b"val").and_then(|v| v.parse().ok()).unwrap_or(0);
                        }
                    }
                    b"tab" => push_text(&mut paragraph, "\t"),
                    b"br" | b"cr" => push_text(&mut paragraph, "\n"),
                    _ => {}
                },
                Event::Text(e) if in_text => {
                    let text = e.unescape().map_err(ooxml_error)?;
                    push_text(&mut paragraph, &text);
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"t" => in_text = false,
                    b"p" => {
                        if let Some(finished) = paragraph.take() {
                            if table_depth > 0 {
                                let text = finished.text.split_whitespace().collect::<Vec<_>>();
                                if !text.is_empty() {
                                    if !cell.is_empty() {
                                        cell.push(' ');
                                    }
                                    cell.push_str(&text.join(" "));
                                }
                            } else {
                                self.push_paragraph(finished);
                            }
                        }
                    }
                    b"tc" if table_depth == 1 => row.push(std::mem::take(&mut cell)),
                    b"tr" if table_depth == 1 => rows.push(std::mem::take(&mut row)),
                    b"tbl" => {
                        table_depth = table_depth.saturating_sub(1);
                        if table_depth == 0 && !rows.is_empty() {
                            self.blocks.push(Block {
                                text: markdown_table(&rows),
                                list_item: false,
                            });
                            rows.clear();
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let mut out = String::new();
        let mut previous_was_list = false;
        for block in self.blocks {
            if !out.is_empty() {
                out.push_str(if previous_was_list && block.list_item {
                    "\n"
                } else {
                    "\n\n"
                });
            }
            out.push_str(&block.text);
            previous_was_list = block.list_item;
        }
        Ok(out)
    }
}

fn set_style(paragraph: &mut Option<Paragraph>, element: &BytesStart<'_>) {
    if let Some(paragraph) = paragraph.as_mut() {
        paragraph.style = attribute(element, b"val");
    }
}

fn push_text(paragraph: &mut Option<Paragraph>, text: &str) {
    if let Some(paragraph) = paragraph.as_mut() {
        paragraph.text.push_str(text);
    }
}

/// Headings, lists and tables are emitted in body order.
pub fn docx_to_markdown(bytes: &[u8]) -> Result<String, IngestError> {
    let mut archive = open_archive(bytes)?;
    let document_xml = require_entry(&mut archive, "word/document.xml")?;
    let styles = match read_entry(&mut archive, "word/styles.xml")? {
        Some(xml) => parse_styles(&xml)?,
        None => HashMap::new(),
    };
    let numbering = match read_entry(&mut archive, "word/numbering.xml")? {
        Some(xml) => parse_numbering(&xml)?,
        None => HashMap::new(),
    };

    DocxRenderer {
        styles,
        numbering,
        counters: HashMap::new(),
        blocks: Vec::new(),
    }
    .render(&document_xml)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>, IngestError> {
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut in_phonetic = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"rPh" => in_phonetic = true,
                b"t" => in_text = !in_phonetic,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(e) if in_text => current.push_str(&e.unescape().map_err(ooxml_error)?),
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => strings.push(std::mem::take(&mut current)),
                b"rPh" => in_phonetic = false,
                b"t" => in_text = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(strings)
}

fn parse_workbook_sheets(xml: &[u8]) -> Result<Vec<(String, Option<String>)>, IngestError> {
    let mut sheets = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                if let Some(name) = attribute(&e, b"name") {
                    sheets.push((name, attribute(&e, b"id")));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(sheets)
}

fn parse_relationships(xml: &[u8]) -> Result<HashMap<String, String>, IngestError> {
    let mut targets = HashMap::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attribute(&e, b"Id"), attribute(&e, b"Target"))
                {
                    let path = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("xl/{target}"),
                    };
                    targets.insert(id, path);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(targets)
}

// Column XFD, the widest a worksheet can be.
const MAX_COLUMN_INDEX: usize = 16_383;

fn column_index(cell_ref: &str) -> Result<Option<usize>, IngestError> {
    let letters = cell_ref
        .chars()
        .take_while(|ch| ch.is_ascii_alphabetic())
        .collect::<String>();
    if letters.is_empty() {
        return Ok(None);
    }
    let out_of_range = || ooxml_error(format!("cell reference {cell_ref} is beyond column XFD"));

    let mut index = 0usize;
    for byte in letters.to_ascii_uppercase().bytes() {
        index = index
            .checked_mul(26)
            .and_then(|value| value.checked_add(usize::from(byte - b'A' + 1)))
            .filter(|value| *value <= MAX_COLUMN_INDEX + 1)
            .ok_or_else(out_of_range)?;
    }
    Ok(Some(index - 1))
}

fn format_number(raw: &str) -> String {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 => {
            format!("{}", value as i64)
        }
        _ => raw.to_string(),
    }
}

fn parse_sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>, IngestError> {
    let mut rows = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut row: Vec<String> = Vec::new();
    let mut cell_ref: Option<String> = None;
    let mut cell_type: Option<String> = None;
    let mut value = String::new();
    let mut capture = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_ref = attribute(&e, b"r");
                    cell_type = attribute(&e, b"t");
                    value.clear();
                }
                b"v" | b"t" => capture = true,
                _ => {}
            },
            Event::Text(e) if capture => value.push_str(&e.unescape().map_err(ooxml_error)?),
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    let text = match cell_type.as_deref() {
                        Some("s") => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|index| shared.get(index).cloned())
                            .unwrap_or_default(),
                        Some("b") => String::from(if value.trim() == "1" { "TRUE" } else { "FALSE" }),
                        Some("inlineStr") | Some("str") | Some("e") => value.clone(),
                        _ => format_number(value.trim()),
                    };
                    let column = match cell_ref.as_deref() {
                        Some(cell_ref) => column_index(cell_ref)?,
                        None => None,
                    }
                    .unwrap_or(row.len());
                    if row.len() <= column {
                        row.resize(column + 1, String::new());
                    }
                    row[column] = text;
                }
                b"row" => {
                    while row.last().is_some_and(|cell| cell.is_empty()) {
                        row.pop();
                    }
                    rows.push(std::mem::take(&mut row));
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(rows)
}

/// Sheets in workbook order with their cell text. Formula cells carry their
/// cached values.
pub fn read_workbook(bytes: &[u8]) -> Result<Vec<Sheet>, IngestError> {
    let mut archive = open_archive(bytes)?;
    let workbook = require_entry(&mut archive, "xl/workbook.xml")?;
    let relationships = match read_entry(&mut archive, "xl/_rels/workbook.xml.rels")? {
        Some(xml) => parse_relationships(&xml)?,
        None => HashMap::new(),
    };
    let shared = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };

    let mut sheets = Vec::new();
    for (position, (name, relationship)) in parse_workbook_sheets(&workbook)?.into_iter().enumerate()
    {
        let path = relationship
            .and_then(|id| relationships.get(&id).cloned())
            .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", position + 1));
        let rows = match read_entry(&mut archive, &path)? {
            Some(xml) => parse_sheet_rows(&xml, &shared)?,
            None => Vec::new(),
        };
        sheets.push(Sheet { name, rows });
    }

    Ok(sheets)
}
