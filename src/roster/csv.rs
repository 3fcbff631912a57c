use std::collections::BTreeMap;

use super::SheetRow;
use crate::error::CoreError;

/// Splits delimited text into rows; quoted fields may contain commas,
/// doubled quotes and line breaks.
pub(super) fn read_rows(bytes: &[u8]) -> Result<Vec<SheetRow>, CoreError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CoreError::Parse(format!("roster is not valid UTF-8: {}", e)))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut rows = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut line_no = 1usize;
    let mut row_start = 1usize;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    buf.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                '\n' => {
                    line_no += 1;
                    buf.push(ch);
                }
                _ => buf.push(ch),
            }
            continue;
        }
        match ch {
            '"' if buf.trim().is_empty() => {
                buf.clear();
                in_quotes = true;
            }
            ',' => fields.push(std::mem::take(&mut buf)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                fields.push(std::mem::take(&mut buf));
                rows.push(to_row(row_start, std::mem::take(&mut fields)));
                line_no += 1;
                row_start = line_no;
            }
            _ => buf.push(ch),
        }
    }
    if in_quotes {
        return Err(CoreError::Parse(format!(
            "unterminated quoted field starting on line {}",
            row_start
        )));
    }
    if !buf.is_empty() || !fields.is_empty() {
        fields.push(buf);
        rows.push(to_row(row_start, fields));
    }
    Ok(rows)
}

fn to_row(number: usize, fields: Vec<String>) -> SheetRow {
    SheetRow {
        number,
        cells: fields.into_iter().enumerate().collect::<BTreeMap<_, _>>(),
    }
}
