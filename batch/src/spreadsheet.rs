//! Reading uploaded workbooks and writing result workbooks.

use calamine::{Data, Reader, Xlsx};
use indexmap::IndexMap;
use registry::RegistryRecord;
use rust_xlsxwriter::Workbook;
use std::io::Cursor;

/// Columns every uploaded sheet must have.
pub const REQUIRED_COLUMNS: &[&str] = &[
    "Client Account Name",
    "Client Reference",
    "Client Default Correspondence Email",
    "User Email",
    "Sales Order Link",
    "Sales Order Correspondence Address",
    "Application Number",
    "Patent Number",
    "Filing Date",
    "Applicant Names",
];

/// Column holding the identifier looked up in the register.
pub const IDENTIFIER_COLUMN: &str = "Patent Number";

/// Result columns appended after the uploaded ones, before the owner pairs.
pub const BASE_RESULT_COLUMNS: &[&str] = &[
    "StatusCode",
    "LastChangeDate",
    "Representative",
    "FilingDate",
    "GrantDate",
];

pub const DEFAULT_SHEET_NAME: &str = "Sheet1";

#[derive(thiserror::Error, Debug)]
pub enum SpreadsheetError {
    #[error("could not read workbook: {0}")]
    Read(#[from] calamine::XlsxError),
    #[error("workbook has no sheets")]
    NoSheet,
    #[error("Missing required column(s): {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("could not write workbook: {0}")]
    Write(#[from] rust_xlsxwriter::XlsxError),
    #[error("sheet is too large to write: {0}")]
    TooLarge(String),
}

/// One data row, keyed by header in sheet order.
pub type Row = IndexMap<String, String>;

/// An input row plus the identifier resolved from it.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRow {
    pub identifier: String,
    pub fields: Row,
}

impl JobRow {
    pub fn new(fields: Row) -> Self {
        let identifier = fields.get(IDENTIFIER_COLUMN).cloned().unwrap_or_default();
        JobRow { identifier, fields }
    }
}

/// A parsed upload: the first sheet of the workbook.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub sheet_name: String,
    pub headers: Vec<String>,
    pub rows: Vec<JobRow>,
}

impl Batch {
    /// Batch with only the identifier column, for callers that have no sheet.
    pub fn from_identifiers<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rows = identifiers
            .into_iter()
            .map(|id| JobRow::new(Row::from([(IDENTIFIER_COLUMN.to_string(), id.into())])))
            .collect();
        Batch {
            sheet_name: DEFAULT_SHEET_NAME.into(),
            headers: vec![IDENTIFIER_COLUMN.into()],
            rows,
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => format_number(*f),
        Data::Int(i) => i.to_string(),
        Data::DateTime(dt) => format_number(dt.as_f64()),
        other => other.to_string(),
    }
}

/// Parses the first sheet. The first row holds the headers; blank rows are
/// skipped. Fails before any row is used if a required column is missing.
pub fn parse_workbook(bytes: &[u8]) -> Result<Batch, SpreadsheetError> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(SpreadsheetError::NoSheet)?;
    let range = workbook.worksheet_range(&sheet_name)?;

    let mut sheet_rows = range.rows();
    let header_cells: Vec<String> = sheet_rows
        .next()
        .map(|cells| cells.iter().map(|c| cell_text(c).trim().to_string()).collect())
        .unwrap_or_default();

    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| !header_cells.iter().any(|h| h == *required))
        .map(|required| required.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SpreadsheetError::MissingColumns(missing));
    }

    let rows = sheet_rows
        .filter(|cells| cells.iter().any(|c| !matches!(c, Data::Empty)))
        .map(|cells| {
            let fields = header_cells
                .iter()
                .enumerate()
                .filter(|(_, header)| !header.is_empty())
                .map(|(col, header)| {
                    let value = cells.get(col).map(cell_text).unwrap_or_default();
                    (header.clone(), value)
                })
                .collect();
            JobRow::new(fields)
        })
        .collect();

    let headers = header_cells.into_iter().filter(|h| !h.is_empty()).collect();

    Ok(Batch {
        sheet_name,
        headers,
        rows,
    })
}

/// A sheet ready to be written: header row plus data rows of equal width.
#[derive(Clone, Debug, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Appends the result columns to every row. Owner columns are sized to the
/// largest owner count in `results`; rows with fewer owners are blank-filled.
///
/// `results[i]` must belong to `rows[i]`. A missing result yields blanks.
pub fn merge_results(
    name: &str,
    headers: &[String],
    rows: &[&JobRow],
    results: &[&RegistryRecord],
) -> Sheet {
    let max_owners = results.iter().map(|r| r.owner_count()).max().unwrap_or(0);

    let mut all_headers: Vec<String> = headers.to_vec();
    all_headers.extend(BASE_RESULT_COLUMNS.iter().map(|c| c.to_string()));
    for n in 1..=max_owners {
        all_headers.push(format!("Owner{n}"));
        all_headers.push(format!("Owner{n}Address"));
    }

    let empty = RegistryRecord::default();
    let merged = rows
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let result = results.get(idx).copied().unwrap_or(&empty);
            let mut values: Vec<String> = headers
                .iter()
                .map(|h| row.fields.get(h).cloned().unwrap_or_default())
                .collect();
            values.extend([
                result.status_code.clone(),
                result.last_change_date.clone(),
                result.representative.clone(),
                result.filing_date.clone(),
                result.grant_date.clone(),
            ]);

            let mut owners = result.owners();
            for _ in 0..max_owners {
                let (owner_name, owner_address) = owners.next().unwrap_or(("", ""));
                values.push(owner_name.to_string());
                values.push(owner_address.to_string());
            }
            values
        })
        .collect();

    Sheet {
        name: name.to_string(),
        headers: all_headers,
        rows: merged,
    }
}

/// Serializes `sheet` as a single-sheet xlsx file.
pub fn write_workbook(sheet: &Sheet) -> Result<Vec<u8>, SpreadsheetError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(&sheet.name)?;

    let header_row = std::iter::once(&sheet.headers);
    for (row_idx, values) in header_row.chain(sheet.rows.iter()).enumerate() {
        let row_num = u32::try_from(row_idx)
            .map_err(|_| SpreadsheetError::TooLarge(format!("{row_idx} rows")))?;
        for (col_idx, value) in values.iter().enumerate() {
            let col_num = u16::try_from(col_idx)
                .map_err(|_| SpreadsheetError::TooLarge(format!("{col_idx} columns")))?;
            if !value.is_empty() {
                worksheet.write_string(row_num, col_num, value)?;
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}
