//! Types for the PostgrestClient

use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;

use crate::error::Error;

/// Error details returned by the PostgREST API
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PostgrestApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for PostgrestApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("Code: {}", code));
        }
        if let Some(message) = &self.message {
            parts.push(format!("Message: {}", message));
        }
        if let Some(details) = &self.details {
            parts.push(format!("Details: {}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("Hint: {}", hint));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        }
    }
}

/// Map a failed PostgREST response to [`Error::Database`]
pub(crate) fn database_error(status: StatusCode, body: &str) -> Error {
    if status.is_server_error() {
        return Error::Unavailable(format!("{} (Status: {})", body.trim(), status));
    }
    match serde_json::from_str::<PostgrestApiErrorDetails>(body) {
        Ok(details) if details != PostgrestApiErrorDetails::default() => {
            Error::database(format!("{} (Status: {})", details, status))
        }
        _ => Error::database(format!("{} (Status: {})", body.trim(), status)),
    }
}
