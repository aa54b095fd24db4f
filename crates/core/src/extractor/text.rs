use crate::error::IngestError;
use regex::Regex;
use tracing::warn;

const BOM: &str = "\u{feff}";

pub fn decode_text(bytes: &[u8]) -> String {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(error) => {
            warn!(%error, "input is not valid UTF-8, replacing invalid sequences");
            String::from_utf8_lossy(bytes).into_owned()
        }
    };

    match text.strip_prefix(BOM) {
        Some(stripped) => stripped.to_string(),
        None => text,
    }
}

/// Minimal RFC 4180 reader: quoted fields may contain separators, doubled
/// quotes and line breaks.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if quoted {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => quoted = false,
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' => quoted = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(ch),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    rows
}

pub fn escape_cell(cell: &str) -> String {
    cell.replace('|', "\\|")
        .replace("\r\n", " ")
        .replace('\n', " ")
        .trim()
        .to_string()
}

pub fn markdown_table(rows: &[Vec<String>]) -> String {
    let Some(header) = rows.first() else {
        return String::new();
    };
    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);

    let render = |row: &[String]| {
        let cells = (0..width)
            .map(|index| row.get(index).map(|cell| escape_cell(cell)).unwrap_or_default())
            .collect::<Vec<_>>();
        format!("| {} |", cells.join(" | "))
    };

    let mut lines = vec![render(header), format!("| {} |", vec!["---"; width].join(" | "))];
    lines.extend(rows[1..].iter().map(|row| render(row)));
    lines.join("\n")
}

pub fn csv_to_markdown(bytes: &[u8]) -> String {
    let rows = parse_csv(&decode_text(bytes));
    let Some((header, body)) = rows.split_first() else {
        return String::new();
    };

    let mut kept = vec![header.clone()];
    kept.extend(
        body.iter()
            .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
            .cloned(),
    );
    markdown_table(&kept)
}

pub fn html_to_markdown(bytes: &[u8]) -> Result<String, IngestError> {
    let html = decode_text(bytes);

    let body_re = Regex::new(r"(?is)<body[^>]*>(.*)</body>")?;
    let mut text = match body_re.captures(&html).and_then(|captures| captures.get(1)) {
        Some(body) => body.as_str().to_string(),
        None => html.clone(),
    };

    for pattern in [
        r"(?is)<script[^>]*>.*?</script>",
        r"(?is)<style[^>]*>.*?</style>",
        r"(?s)<!--.*?-->",
    ] {
        text = Regex::new(pattern)?.replace_all(&text, "").into_owned();
    }

    let tag_re = Regex::new(r"(?s)<[^>]+>")?;
    let heading_re = Regex::new(r"(?is)<h([1-6])[^>]*>(.*?)</h[1-6]\s*>")?;
    text = heading_re
        .replace_all(&text, |captures: &regex::Captures| {
            let level = captures[1].parse::<usize>().unwrap_or(1);
            let inner = tag_re.replace_all(&captures[2], "");
            let inner = inner.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("\n\n{} {}\n\n", "#".repeat(level), inner)
        })
        .into_owned();

    for (pattern, replacement) in [
        (r"(?i)<li[^>]*>", "\n- "),
        (r"(?i)<br\s*/?>", "\n"),
        (r"(?i)</(p|div|ul|ol|table|tr|section|article|blockquote)\s*>", "\n\n"),
        (r"(?i)</(td|th)\s*>", " "),
    ] {
        text = Regex::new(pattern)?.replace_all(&text, replacement).into_owned();
    }

    text = tag_re.replace_all(&text, "").into_owned();
    text = decode_entities(&text)?;

    let lines = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .map(|line| match line.strip_prefix("- ") {
            Some(item) if item.trim().is_empty() => String::new(),
            _ => line,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let blank_runs = Regex::new(r"\n{3,}")?;
    Ok(blank_runs.replace_all(lines.trim(), "\n\n").into_owned())
}

fn decode_entities(text: &str) -> Result<String, IngestError> {
    let entity_re = Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);")?;
    Ok(entity_re
        .replace_all(text, |captures: &regex::Captures| {
            let entity = &captures[1];
            let decoded = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned())
}
