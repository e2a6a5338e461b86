use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Prefix marking a placeholder record produced for a failed row.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// The subset of a register entry the batch output needs.
///
/// `owner_names[i]` and `owner_addresses[i]` always describe the same owner;
/// either side may be blank when the register has no value for it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRecord {
    pub status_code: String,
    pub last_change_date: String,
    pub representative: String,
    pub filing_date: String,
    pub grant_date: String,
    pub owner_names: Vec<String>,
    pub owner_addresses: Vec<String>,
}

impl RegistryRecord {
    /// Placeholder stored at the index of a row that could not be looked up.
    pub fn error(message: impl Display) -> Self {
        RegistryRecord {
            status_code: format!("{ERROR_PREFIX}{message}"),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.status_code.starts_with(ERROR_PREFIX)
    }

    pub fn owner_count(&self) -> usize {
        self.owner_names.len().max(self.owner_addresses.len())
    }

    /// Owner `(name, address)` pairs, blank-filling whichever side is shorter.
    pub fn owners(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        (0..self.owner_count()).map(|i| {
            (
                self.owner_names.get(i).map(String::as_str).unwrap_or(""),
                self.owner_addresses.get(i).map(String::as_str).unwrap_or(""),
            )
        })
    }
}
