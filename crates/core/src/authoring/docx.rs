//! Minimal WordprocessingML writer for generated documents.

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/><Override PartName="/word/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml"/><Override PartName="/word/numbering.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.numbering+xml"/></Types>"#;

const PACKAGE_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#;

const DOCUMENT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/numbering" Target="numbering.xml"/></Relationships>"#;

const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:styles xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:style w:type="paragraph" w:default="1" w:styleId="Normal"><w:name w:val="Normal"/></w:style><w:style w:type="paragraph" w:styleId="Title"><w:name w:val="Title"/><w:rPr><w:b/><w:sz w:val="36"/></w:rPr></w:style><w:style w:type="paragraph" w:styleId="Heading1"><w:name w:val="heading 1"/><w:rPr><w:b/><w:sz w:val="32"/></w:rPr></w:style><w:style w:type="paragraph" w:styleId="Heading2"><w:name w:val="heading 2"/><w:rPr><w:b/><w:sz w:val="28"/></w:rPr></w:style><w:style w:type="paragraph" w:styleId="Heading3"><w:name w:val="heading 3"/><w:rPr><w:b/><w:sz w:val="24"/></w:rPr></w:style><w:style w:type="paragraph" w:styleId="ListBullet"><w:name w:val="List Bullet"/></w:style><w:style w:type="paragraph" w:styleId="ListNumber"><w:name w:val="List Number"/></w:style></w:styles>"#;

const BULLET_NUM_ID: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    Heading(usize, String),
    Bullet(String),
    Numbered(String),
    Paragraph(String),
}

fn numbered_item(line: &str) -> Option<&str> {
    let digits = line.len() - line.trim_start_matches(|ch: char| ch.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    line[digits..].strip_prefix(". ").map(str::trim)
}

fn parse_blocks(markdown: &str) -> Vec<Block> {
    markdown
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            if let Some(text) = line.strip_prefix("### ") {
                Block::Heading(3, text.trim().to_string())
            } else if let Some(text) = line.strip_prefix("## ") {
                Block::Heading(2, text.trim().to_string())
            } else if let Some(text) = line.strip_prefix("# ") {
                Block::Heading(1, text.trim().to_string())
            } else if let Some(text) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
                Block::Bullet(text.trim().to_string())
            } else if let Some(text) = numbered_item(line) {
                Block::Numbered(text.to_string())
            } else {
                Block::Paragraph(line.to_string())
            }
        })
        .collect()
}

/// `**bold**` spans become bold runs; everything else is plain.
fn runs(text: &str) -> String {
    let mut out = String::new();
    let mut rest = text;
    while let Some(start) = rest.find("**") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("**").filter(|end| *end > 0) else {
            break;
        };
        out.push_str(&run(&rest[..start], false));
        out.push_str(&run(&after[..end], true));
        rest = &after[end + 2..];
    }
    out.push_str(&run(rest, false));
    out
}

fn run(text: &str, bold: bool) -> String {
    if text.is_empty() {
        return String::new();
    }
    let properties = if bold { "<w:rPr><w:b/></w:rPr>" } else { "" };
    format!(
        r#"<w:r>{properties}<w:t xml:space="preserve">{}</w:t></w:r>"#,
        escape(text)
    )
}

fn paragraph(style: Option<&str>, num_id: Option<usize>, text: &str) -> String {
    let mut properties = String::new();
    if let Some(style) = style {
        properties.push_str(&format!(r#"<w:pStyle w:val="{style}"/>"#));
    }
    if let Some(num_id) = num_id {
        properties.push_str(&format!(
            r#"<w:numPr><w:ilvl w:val="0"/><w:numId w:val="{num_id}"/></w:numPr>"#
        ));
    }
    let properties = if properties.is_empty() {
        properties
    } else {
        format!("<w:pPr>{properties}</w:pPr>")
    };
    format!("<w:p>{properties}{}</w:p>", runs(text))
}

fn numbering_xml(numbered_lists: usize) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:numbering xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:abstractNum w:abstractNumId="0"><w:lvl w:ilvl="0"><w:start w:val="1"/><w:numFmt w:val="bullet"/><w:lvlText w:val="•"/></w:lvl></w:abstractNum><w:abstractNum w:abstractNumId="1"><w:lvl w:ilvl="0"><w:start w:val="1"/><w:numFmt w:val="decimal"/><w:lvlText w:val="%1."/></w:lvl></w:abstractNum>"#,
    );
    xml.push_str(&format!(
        r#"<w:num w:numId="{BULLET_NUM_ID}"><w:abstractNumId w:val="0"/></w:num>"#
    ));
    // Every numbered list gets its own instance so numbering restarts at 1.
    for list in 0..numbered_lists {
        xml.push_str(&format!(
            r#"<w:num w:numId="{}"><w:abstractNumId w:val="1"/><w:lvlOverride w:ilvl="0"><w:startOverride w:val="1"/></w:lvlOverride></w:num>"#,
            BULLET_NUM_ID + 1 + list
        ));
    }
    xml.push_str("</w:numbering>");
    xml
}

pub fn markdown_to_docx(title: &str, markdown: &str) -> zip::result::ZipResult<Vec<u8>> {
    let mut body = paragraph(Some("Title"), None, title.trim());
    let mut numbered_lists = 0;
    let mut in_numbered_list = false;

    for block in parse_blocks(markdown) {
        let numbered = matches!(block, Block::Numbered(_));
        if numbered && !in_numbered_list {
            numbered_lists += 1;
        }
        in_numbered_list = numbered;

        body.push_str(&match block {
            Block::Heading(level, text) => paragraph(Some(&format!("Heading{level}")), None, &text),
            Block::Bullet(text) => paragraph(Some("ListBullet"), Some(BULLET_NUM_ID), &text),
            Block::Numbered(text) => paragraph(
                Some("ListNumber"),
                Some(BULLET_NUM_ID + numbered_lists),
                &text,
            ),
            Block::Paragraph(text) => paragraph(None, None, &text),
        });
    }

    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}<w:sectPr/></w:body></w:document>"#
    );
    let numbering = numbering_xml(numbered_lists);

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in [
        ("[Content_Types].xml", CONTENT_TYPES),
        ("_rels/.rels", PACKAGE_RELS),
        ("word/_rels/document.xml.rels", DOCUMENT_RELS),
        ("word/styles.xml", STYLES),
        ("word/numbering.xml", numbering.as_str()),
        ("word/document.xml", document.as_str()),
    ] {
        writer.start_file(name, SimpleFileOptions::default())?;
        writer.write_all(content.as_bytes())?;
    }
    Ok(writer.finish()?.into_inner())
}

/// `<sanitized title>_<UTC timestamp>.docx`, keeping letters, digits, spaces,
/// hyphens and underscores of at most 50 title characters.
pub fn output_filename(title: &str, now: DateTime<Utc>) -> String {
    let safe = title
        .chars()
        .filter(|ch| ch.is_alphanumeric() || *ch == ' ' || *ch == '-' || *ch == '_')
        .take(50)
        .collect::<String>();
    let safe = safe.trim();
    let safe = if safe.is_empty() { "document" } else { safe };
    format!("{safe}_{}.docx", now.format("%Y%m%d_%H%M%S"))
}
