use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::error::CoreError;
use crate::model::RosterEntry;

mod csv;
mod xlsx;

/// Header names accepted for the identifier column, in priority order.
pub const ID_COLUMN_ALIASES: [&str; 5] = ["student id", "student_id", "id", "roll no", "roll"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterFormat {
    Csv,
    Xlsx,
}

impl RosterFormat {
    /// Declared format from an upload's file name.
    pub fn from_file_name(name: &str) -> Result<RosterFormat, CoreError> {
        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| e.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(RosterFormat::Csv),
            "xlsx" => Ok(RosterFormat::Xlsx),
            "xls" => Err(CoreError::Format(
                "legacy .xls workbooks are not supported; save as .xlsx or .csv".to_string(),
            )),
            "" => Err(CoreError::Format(format!(
                "{:?} has no file extension (expected .csv or .xlsx)",
                name
            ))),
            other => Err(CoreError::Format(format!(
                ".{} files are not supported (expected .csv or .xlsx)",
                other
            ))),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            RosterFormat::Csv => "csv",
            RosterFormat::Xlsx => "xlsx",
        }
    }
}

/// One sheet row: 1-based row number and cells keyed by 0-based column.
pub(crate) struct SheetRow {
    pub number: usize,
    pub cells: BTreeMap<usize, String>,
}

/// Extracts the identifier column from an uploaded roster. Pure transform.
pub fn parse(bytes: &[u8], format: RosterFormat) -> Result<Vec<RosterEntry>, CoreError> {
    let rows = match format {
        RosterFormat::Csv => csv::read_rows(bytes)?,
        RosterFormat::Xlsx => xlsx::read_rows(bytes)?,
    };
    extract_identifiers(rows)
}

fn extract_identifiers(rows: Vec<SheetRow>) -> Result<Vec<RosterEntry>, CoreError> {
    let mut rows = rows
        .into_iter()
        .filter(|r| r.cells.values().any(|v| !v.trim().is_empty()));
    let header = rows
        .next()
        .ok_or_else(|| CoreError::Parse("roster is empty (no header row)".to_string()))?;
    let column = find_id_column(&header.cells).ok_or_else(|| {
        let seen: Vec<&str> = header.cells.values().map(|s| s.trim()).collect();
        CoreError::Schema(format!(
            "no student id column found; expected one of {:?}, header was {:?}",
            ID_COLUMN_ALIASES, seen
        ))
    })?;

    Ok(rows
        .filter_map(|r| {
            let id = r.cells.get(&column)?.trim();
            if id.is_empty() {
                return None;
            }
            Some(RosterEntry {
                row: r.number,
                identifier: id.to_string(),
            })
        })
        .collect())
}

fn find_id_column(header: &BTreeMap<usize, String>) -> Option<usize> {
    ID_COLUMN_ALIASES.iter().find_map(|alias| {
        header
            .iter()
            .find(|(_, name)| name.trim().to_lowercase() == *alias)
            .map(|(col, _)| *col)
    })
}

/// Hex SHA-256 of the uploaded bytes, kept in the reconciliation audit log.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Canonical text for a numeric cell: whole numbers lose any exponent or
/// trailing `.0`, everything else is kept as written.
pub(crate) fn canonical_number(raw: &str) -> String {
    let t = raw.trim();
    if t.chars().all(|c| c.is_ascii_digit()) {
        return t.to_string();
    }
    match t.parse::<f64>() {
        Ok(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.007_199_254_740_992e15 => {
            format!("{:.0}", v)
        }
        _ => t.to_string(),
    }
}
