//! Per-client grouping of a finished job and zip packaging of the files
//! produced for each group.

use crate::spreadsheet::JobRow;
use indexmap::{IndexMap, IndexSet};
use registry::RegistryRecord;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use thiserror::Error;
use zip::CompressionMethod;
use zip::result::ZipError;
use zip::write::{SimpleFileOptions, ZipWriter};

/// Column whose first line names the client a row belongs to.
pub const CLIENT_COLUMN: &str = "Sales Order Correspondence Address";
pub const UNKNOWN_CLIENT: &str = "Unknown";

const MAX_FILE_NAME_CHARS: usize = 80;
const FALLBACK_FILE_NAME: &str = "client";

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("zip error: {0}")]
    Zip(#[from] ZipError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// First line of the client column, trimmed. Blank maps to `Unknown`.
pub fn client_key(row: &JobRow) -> String {
    let value = row.fields.get(CLIENT_COLUMN).map(String::as_str).unwrap_or("");
    let first_line = value.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        UNKNOWN_CLIENT.to_string()
    } else {
        first_line.to_string()
    }
}

/// Row indices per client, in order of first appearance.
pub fn group_by_client(rows: &[JobRow]) -> IndexMap<String, Vec<usize>> {
    let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (idx, row) in rows.iter().enumerate() {
        groups.entry(client_key(row)).or_default().push(idx);
    }
    groups
}

/// Replaces every run of characters outside `[A-Za-z0-9_-]` with a single
/// underscore and caps the length. Empty input becomes `client`.
pub fn safe_file_name(name: &str) -> String {
    let mut safe = String::with_capacity(name.len());
    for c in name.chars() {
        let keep = c.is_ascii_alphanumeric() || c == '-';
        if keep {
            safe.push(c);
        } else if !safe.ends_with('_') {
            safe.push('_');
        }
    }

    let safe: String = safe.chars().take(MAX_FILE_NAME_CHARS).collect();
    if safe.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        safe
    }
}

/// Owners across `results`, deduplicated on the exact name and address pair.
/// Error placeholders and owners with neither name nor address are skipped.
pub fn unique_owners<'a, I>(results: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = &'a RegistryRecord>,
{
    let mut owners: IndexSet<(String, String)> = IndexSet::new();
    for record in results.into_iter().filter(|r| !r.is_error()) {
        for (name, address) in record.owners() {
            if name.is_empty() && address.is_empty() {
                continue;
            }
            owners.insert((name.to_string(), address.to_string()));
        }
    }
    owners.into_iter().collect()
}

/// Hands out file names that are unique within one archive by suffixing
/// `_2`, `_3`, ... on collision.
#[derive(Default)]
pub struct UniqueNames {
    taken: HashSet<String>,
}

impl UniqueNames {
    pub fn claim(&mut self, stem: &str, extension: &str) -> String {
        let mut candidate = format!("{stem}{extension}");
        let mut n = 2;
        while !self.taken.insert(candidate.to_lowercase()) {
            candidate = format!("{stem}_{n}{extension}");
            n += 1;
        }
        candidate
    }
}

/// Deflate-compressed archive with one entry per `(path, contents)`.
pub fn zip_files(files: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>, BundleError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (path, contents) in files {
        writer.start_file(path, options)?;
        writer.write_all(&contents)?;
    }

    Ok(writer.finish()?.into_inner())
}
