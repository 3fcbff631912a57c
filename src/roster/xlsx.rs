use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use zip::result::ZipError;
use zip::ZipArchive;

use super::{canonical_number, SheetRow};
use crate::error::CoreError;

const WORKBOOK_ENTRY: &str = "xl/workbook.xml";
const WORKBOOK_RELS_ENTRY: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS_ENTRY: &str = "xl/sharedStrings.xml";
const DEFAULT_SHEET_ENTRY: &str = "xl/worksheets/sheet1.xml";
/// Upper bound on any single decompressed part.
const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;
/// Last sheet column (`XFD`).
const MAX_COLUMNS: usize = 16_384;

type Archive<'a> = ZipArchive<Cursor<&'a [u8]>>;

/// Reads the first worksheet (workbook order) of an Office Open XML workbook.
pub(super) fn read_rows(bytes: &[u8]) -> Result<Vec<SheetRow>, CoreError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| CoreError::Parse(format!("not an xlsx workbook: {}", e)))?;

    let shared = match read_part(&mut archive, SHARED_STRINGS_ENTRY)? {
        Some(xml) => shared_strings(&xml)?,
        None => Vec::new(),
    };
    let sheet_path = first_sheet_path(&mut archive)?;
    let sheet = read_part(&mut archive, &sheet_path)?
        .ok_or_else(|| CoreError::Parse(format!("worksheet {} is missing", sheet_path)))?;
    sheet_rows(&sheet, &shared)
}

fn read_part(archive: &mut Archive<'_>, name: &str) -> Result<Option<String>, CoreError> {
    let entry = match archive.by_name(name) {
        Ok(v) => v,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(CoreError::Parse(format!("cannot read {}: {}", name, e))),
    };
    let mut text = String::new();
    entry
        .take(MAX_PART_BYTES + 1)
        .read_to_string(&mut text)
        .map_err(|e| CoreError::Parse(format!("cannot read {}: {}", name, e)))?;
    if text.len() as u64 > MAX_PART_BYTES {
        return Err(CoreError::Parse(format!("{} is too large", name)));
    }
    Ok(Some(text))
}

fn first_sheet_path(archive: &mut Archive<'_>) -> Result<String, CoreError> {
    if let Some(path) = sheet_path_from_workbook(archive)? {
        if archive.by_name(&path).is_ok() {
            return Ok(path);
        }
    }
    if archive.by_name(DEFAULT_SHEET_ENTRY).is_ok() {
        return Ok(DEFAULT_SHEET_ENTRY.to_string());
    }
    let mut sheets: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/") && n.ends_with(".xml"))
        .map(|n| n.to_string())
        .collect();
    sheets.sort();
    sheets
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::Parse("workbook has no worksheets".to_string()))
}

fn sheet_path_from_workbook(archive: &mut Archive<'_>) -> Result<Option<String>, CoreError> {
    let Some(workbook) = read_part(archive, WORKBOOK_ENTRY)? else {
        return Ok(None);
    };
    let mut rel_id = None;
    for tok in Tokens::new(&workbook) {
        if let Token::Open { name: "sheet", attrs, .. } = tok? {
            rel_id = attr(attrs, "r:id");
            break;
        }
    }
    let Some(rel_id) = rel_id else {
        return Ok(None);
    };
    let Some(rels) = read_part(archive, WORKBOOK_RELS_ENTRY)? else {
        return Ok(None);
    };
    for tok in Tokens::new(&rels) {
        if let Token::Open {
            name: "Relationship",
            attrs,
            ..
        } = tok?
        {
            if attr(attrs, "Id").as_deref() == Some(rel_id.as_str()) {
                return Ok(attr(attrs, "Target").map(|t| match t.strip_prefix('/') {
                    Some(abs) => abs.to_string(),
                    None => format!("xl/{}", t),
                }));
            }
        }
    }
    Ok(None)
}

fn shared_strings(xml: &str) -> Result<Vec<String>, CoreError> {
    let mut out = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    // Phonetic runs repeat the reading, not the value.
    let mut phonetic_depth = 0usize;
    for tok in Tokens::new(xml) {
        match tok? {
            Token::Open {
                name: "si", empty, ..
            } => {
                if empty {
                    out.push(String::new());
                } else {
                    current = Some(String::new());
                }
            }
            Token::Close { name: "si" } => out.push(current.take().unwrap_or_default()),
            Token::Open {
                name: "rPh",
                empty: false,
                ..
            } => phonetic_depth += 1,
            Token::Close { name: "rPh" } => phonetic_depth = phonetic_depth.saturating_sub(1),
            Token::Open {
                name: "t",
                empty: false,
                ..
            } => in_text = true,
            Token::Close { name: "t" } => in_text = false,
            Token::Text(t) if in_text && phonetic_depth == 0 => {
                if let Some(c) = current.as_mut() {
                    c.push_str(&t);
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

struct PendingCell {
    col: usize,
    kind: String,
    value: String,
}

fn sheet_rows(xml: &str, shared: &[String]) -> Result<Vec<SheetRow>, CoreError> {
    let mut rows = Vec::new();
    let mut row: Option<SheetRow> = None;
    let mut last_row_number = 0usize;
    let mut next_col = 0usize;
    let mut cell: Option<PendingCell> = None;
    let mut capture = false;

    for tok in Tokens::new(xml) {
        match tok? {
            Token::Open {
                name: "row",
                attrs,
                empty,
            } => {
                let number = match attr(attrs, "r").and_then(|r| r.trim().parse::<usize>().ok()) {
                    Some(n) => n,
                    None => last_row_number
                        .checked_add(1)
                        .ok_or_else(|| CoreError::Parse("row number out of range".to_string()))?,
                };
                last_row_number = number;
                next_col = 0;
                let fresh = SheetRow {
                    number,
                    cells: BTreeMap::new(),
                };
                if empty {
                    rows.push(fresh);
                } else {
                    row = Some(fresh);
                }
            }
            Token::Close { name: "row" } => {
                if let Some(r) = row.take() {
                    rows.push(r);
                }
            }
            Token::Open {
                name: "c",
                attrs,
                empty,
            } => {
                let col = match attr(attrs, "r") {
                    Some(r) => column_index(&r)?.unwrap_or(next_col),
                    None => next_col,
                };
                if col >= MAX_COLUMNS {
                    return Err(CoreError::Parse(format!("cell column {} out of range", col + 1)));
                }
                next_col = col + 1;
                if !empty {
                    cell = Some(PendingCell {
                        col,
                        kind: attr(attrs, "t").unwrap_or_else(|| "n".to_string()),
                        value: String::new(),
                    });
                }
            }
            Token::Close { name: "c" } => {
                let Some(c) = cell.take() else { continue };
                let value = resolve_cell(&c, shared)?;
                if let (Some(v), Some(r)) = (value, row.as_mut()) {
                    r.cells.insert(c.col, v);
                }
            }
            Token::Open {
                name: "v" | "t",
                empty: false,
                ..
            } if cell.is_some() => capture = true,
            Token::Close { name: "v" | "t" } => capture = false,
            Token::Text(t) if capture => {
                if let Some(c) = cell.as_mut() {
                    c.value.push_str(&t);
                }
            }
            _ => {}
        }
    }
    Ok(rows)
}

fn resolve_cell(cell: &PendingCell, shared: &[String]) -> Result<Option<String>, CoreError> {
    let raw = cell.value.as_str();
    let value = match cell.kind.as_str() {
        "s" => {
            let idx = raw.trim().parse::<usize>().map_err(|_| {
                CoreError::Parse(format!("bad shared string index {:?}", raw))
            })?;
            shared.get(idx).cloned().ok_or_else(|| {
                CoreError::Parse(format!("shared string index {} out of range", idx))
            })?
        }
        "inlineStr" | "str" => raw.to_string(),
        "b" => {
            if raw.trim() == "1" {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        "e" => return Ok(None),
        _ => canonical_number(raw),
    };
    if value.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(value))
    }
}

/// "AB12" -> 27. A reference past the last sheet column is malformed.
fn column_index(cell_ref: &str) -> Result<Option<usize>, CoreError> {
    let mut col = 0usize;
    let mut letters = 0usize;
    for ch in cell_ref.chars() {
        if !ch.is_ascii_alphabetic() {
            break;
        }
        letters += 1;
        col = col
            .checked_mul(26)
            .and_then(|c| c.checked_add(ch.to_ascii_uppercase() as usize - 'A' as usize + 1))
            .filter(|c| *c <= MAX_COLUMNS)
            .ok_or_else(|| CoreError::Parse(format!("bad cell reference {:?}", cell_ref)))?;
    }
    if letters == 0 {
        Ok(None)
    } else {
        Ok(Some(col - 1))
    }
}

enum Token<'a> {
    Open {
        name: &'a str,
        attrs: &'a str,
        empty: bool,
    },
    Close {
        name: &'a str,
    },
    Text(Cow<'a, str>),
}

/// Minimal pull scanner over the subset of XML that SpreadsheetML uses.
struct Tokens<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(src: &'a str) -> Self {
        Tokens { src, pos: 0 }
    }

    fn skip_past(&mut self, rest: &str, terminator: &str) -> Result<(), CoreError> {
        let end = rest
            .find(terminator)
            .ok_or_else(|| CoreError::Parse(format!("unterminated {:?} in xml", terminator)))?;
        self.pos += end + terminator.len();
        Ok(())
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Result<Token<'a>, CoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let src: &'a str = self.src;
            let rest = &src[self.pos..];
            if rest.is_empty() {
                return None;
            }
            if !rest.starts_with('<') {
                let end = rest.find('<').unwrap_or(rest.len());
                self.pos += end;
                return Some(unescape(&rest[..end]).map(Token::Text));
            }
            if rest.starts_with("<?") {
                if let Err(e) = self.skip_past(rest, "?>") {
                    return Some(Err(e));
                }
                continue;
            }
            if rest.starts_with("<!--") {
                if let Err(e) = self.skip_past(rest, "-->") {
                    return Some(Err(e));
                }
                continue;
            }
            if let Some(body) = rest.strip_prefix("<![CDATA[") {
                let Some(end) = body.find("]]>") else {
                    return Some(Err(CoreError::Parse("unterminated CDATA in xml".to_string())));
                };
                self.pos += "<![CDATA[".len() + end + "]]>".len();
                return Some(Ok(Token::Text(Cow::Borrowed(&body[..end]))));
            }
            if rest.starts_with("<!") {
                if let Err(e) = self.skip_past(rest, ">") {
                    return Some(Err(e));
                }
                continue;
            }

            let Some(end) = tag_end(rest) else {
                return Some(Err(CoreError::Parse("unterminated tag in xml".to_string())));
            };
            let inner = &rest[1..end];
            self.pos += end + 1;
            if let Some(name) = inner.strip_prefix('/') {
                return Some(Ok(Token::Close {
                    name: local_name(name.trim()),
                }));
            }
            let (inner, empty) = match inner.strip_suffix('/') {
                Some(v) => (v, true),
                None => (inner, false),
            };
            let name_end = inner
                .find(|c: char| c.is_whitespace())
                .unwrap_or(inner.len());
            return Some(Ok(Token::Open {
                name: local_name(&inner[..name_end]),
                attrs: &inner[name_end..],
                empty,
            }));
        }
    }
}

/// Offset of the `>` closing the tag at the start of `rest`, skipping quoted
/// attribute values.
fn tag_end(rest: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, b) in rest.bytes().enumerate() {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn attr(attrs: &str, key: &str) -> Option<String> {
    let mut rest = attrs;
    loop {
        rest = rest.trim_start();
        let eq = rest.find('=')?;
        let name = rest[..eq].trim();
        let after = rest[eq + 1..].trim_start();
        let quote = after.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let close = after[1..].find(quote)?;
        let value = &after[1..1 + close];
        if name == key || (key.contains(':') && local_name(name) == local_name(key)) {
            return unescape(value).ok().map(Cow::into_owned);
        }
        rest = &after[close + 2..];
    }
}

fn unescape(s: &str) -> Result<Cow<'_, str>, CoreError> {
    if !s.contains('&') {
        return Ok(Cow::Borrowed(s));
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let semi = tail
            .find(';')
            .ok_or_else(|| CoreError::Parse("unterminated entity in xml".to_string()))?;
        let entity = &tail[1..semi];
        let ch = match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32).ok_or_else(|| {
                    CoreError::Parse(format!("unknown xml entity &{};", entity))
                })?
            }
        };
        out.push(ch);
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn workbook(sheet_xml: &str, shared_xml: Option<&str>) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = FileOptions::default();
        zip.start_file(WORKBOOK_ENTRY, opts).expect("workbook");
        zip.write_all(
            br#"<?xml version="1.0"?><workbook xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Event Attendance" sheetId="1" r:id="rId7"/></sheets></workbook>"#,
        )
        .expect("write workbook");
        zip.start_file(WORKBOOK_RELS_ENTRY, opts).expect("rels");
        zip.write_all(
            br#"<Relationships><Relationship Id="rId7" Type="worksheet" Target="worksheets/roster.xml"/></Relationships>"#,
        )
        .expect("write rels");
        zip.start_file("xl/worksheets/roster.xml", opts)
            .expect("sheet");
        zip.write_all(sheet_xml.as_bytes()).expect("write sheet");
        if let Some(s) = shared_xml {
            zip.start_file(SHARED_STRINGS_ENTRY, opts).expect("shared");
            zip.write_all(s.as_bytes()).expect("write shared");
        }
        zip.finish().expect("finish").into_inner()
    }

    #[test]
    fn reads_shared_inline_and_numeric_cells() {
        let shared = r#"<sst><si><t>Name</t></si><si><r><t>Student</t></r><r><t xml:space="preserve"> ID</t></r></si><si><t>Karn &amp; Co</t><rPh><t>kana</t></rPh></si><si/></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
            <row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>25030175</v></c></row>
            <row r="4"><c r="B4" t="inlineStr"><is><t>0025030176</t></is></c></row>
            <row r="5"><c r="B5"><f>B2+1</f><v>2.5030177E7</v></c></row>
        </sheetData></worksheet>"#;
        let rows = read_rows(&workbook(sheet, Some(shared))).expect("rows");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].cells[&1], "Student ID");
        assert_eq!(rows[1].cells[&0], "Karn & Co");
        assert_eq!(rows[1].cells[&1], "25030175");
        assert_eq!(rows[2].number, 4);
        assert_eq!(rows[2].cells[&1], "0025030176");
        assert_eq!(rows[3].cells[&1], "25030177");
    }

    #[test]
    fn cells_without_refs_fill_left_to_right() {
        let sheet = r#"<worksheet><sheetData><row><c t="inlineStr"><is><t>ID</t></is></c><c/><c t="inlineStr"><is><t>Name</t></is></c></row></sheetData></worksheet>"#;
        let rows = read_rows(&workbook(sheet, None)).expect("rows");
        assert_eq!(rows[0].number, 1);
        assert_eq!(rows[0].cells[&0], "ID");
        assert_eq!(rows[0].cells[&2], "Name");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(read_rows(b"not a zip"), Err(CoreError::Parse(_))));
        let sheet = r#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>9</v></c></row></sheetData></worksheet>"#;
        assert!(matches!(
            read_rows(&workbook(sheet, None)),
            Err(CoreError::Parse(_))
        ));
    }

    #[test]
    fn column_refs_decode() {
        assert_eq!(column_index("A1").expect("A1"), Some(0));
        assert_eq!(column_index("Z9").expect("Z9"), Some(25));
        assert_eq!(column_index("AB12").expect("AB12"), Some(27));
        assert_eq!(column_index("XFD3").expect("XFD3"), Some(MAX_COLUMNS - 1));
        assert_eq!(column_index("12").expect("digits"), None);
    }

    #[test]
    fn oversized_cell_refs_are_parse_errors() {
        assert!(matches!(
            column_index("ZZZZZZZZZZZZZZZ1"),
            Err(CoreError::Parse(_))
        ));
        assert!(matches!(column_index("XFE1"), Err(CoreError::Parse(_))));
        let sheet = r#"<worksheet><sheetData><row r="1"><c r="ZZZZZZZZZZZZZZZ1" t="inlineStr"><is><t>ID</t></is></c></row></sheetData></worksheet>"#;
        assert!(matches!(
            read_rows(&workbook(sheet, None)),
            Err(CoreError::Parse(_))
        ));
        let sheet = r#"<worksheet><sheetData><row r="18446744073709551615"/><row/></sheetData></worksheet>"#;
        assert!(matches!(
            read_rows(&workbook(sheet, None)),
            Err(CoreError::Parse(_))
        ));
    }

    #[test]
    fn angle_brackets_inside_attribute_values_stay_in_the_tag() {
        let sheet = r#"<worksheet><sheetData><row r="1" note="a>b"><c r="A1" t="inlineStr" x='1>0'><is><t>ID</t></is></c></row><row r="2"><c r="A2" t="inlineStr"><is><t>S1</t></is></c></row></sheetData></worksheet>"#;
        let rows = read_rows(&workbook(sheet, None)).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].number, 1);
        assert_eq!(rows[0].cells[&0], "ID");
        assert_eq!(rows[1].cells[&0], "S1");
    }
}
