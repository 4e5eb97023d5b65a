use std::path::Path;
use tracing::{error, info};

pub const DEFAULT_COLUMN: &str = "attachmentlocation";

/// Read the non-blank cells of `column` from a CSV file with a header row.
///
/// An unreadable file or a missing column is logged and yields an empty list.
pub fn load_keys(path: &Path, column: &str) -> Vec<String> {
    match read_column(path, column) {
        Ok(keys) => {
            info!(path = %path.display(), column, count = keys.len(), "loaded keys");
            keys
        }
        Err(e) => {
            error!(path = %path.display(), column, error = %e, "could not read key list");
            Vec::new()
        }
    }
}

fn read_column(path: &Path, column: &str) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;

    let index = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == column)
        .ok_or_else(|| {
            csv::Error::from(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("column {:?} not found", column),
            ))
        })?;

    let mut keys = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(cell) = record.get(index).map(str::trim).filter(|c| !c.is_empty()) {
            keys.push(cell.to_string());
        }
    }
    Ok(keys)
}

/// Parse `WIDTHxHEIGHT`, e.g. `1024x768`.
pub fn parse_dimensions(value: &str) -> Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {:?}", value))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| format!("invalid dimension {:?}", s))
    };
    Ok((parse(w)?, parse(h)?))
}
