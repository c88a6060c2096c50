//! Error taxonomy for the load and search stages.
//!
//! Only [`LoadError`] ends an invocation. [`FileError`] and [`RecordError`]
//! are recovered where they occur: the file or record is logged and skipped.

use thiserror::Error;

/// Errors that fail a whole invocation.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Missing or invalid caller input (e.g. no individual). Nothing was touched.
    #[error("{0}")]
    Config(String),

    /// Missing credentials or an unusable store definition.
    #[error("credentials error: {0}")]
    Credentials(String),

    /// The article table could not be opened or prepared.
    #[error("database connection failed: {0}")]
    Connection(String),

    /// The watermark query failed and the loader is configured to abort.
    #[error("watermark resolution failed: {0}")]
    Watermark(String),

    /// The batch store could not be listed or written.
    #[error("batch store error: {0}")]
    Store(String),

    /// The search provider request failed.
    #[error("search provider error: {0}")]
    Search(String),
}

impl LoadError {
    /// HTTP-style status for the invocation response.
    pub fn status_code(&self) -> u16 {
        match self {
            LoadError::Config(_) => 400,
            _ => 500,
        }
    }
}

/// Errors confined to one batch file.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("read failed: {0}")]
    Read(String),

    #[error("malformed batch file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("batch file is neither an array nor an object")]
    Shape,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors confined to one record inside a batch file.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record does not match the batch item layout: {0}")]
    Layout(#[from] serde_json::Error),

    #[error("record has no url")]
    MissingUrl,

    #[error("record has a missing or unparsable searched_at: {0:?}")]
    SearchedAt(Option<String>),

    #[error("record mentions no individual")]
    NoIndividual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_errors_are_client_errors() {
        assert_eq!(LoadError::Config("no name".into()).status_code(), 400);
        assert_eq!(LoadError::Credentials("x".into()).status_code(), 500);
        assert_eq!(LoadError::Connection("x".into()).status_code(), 500);
        assert_eq!(LoadError::Watermark("x".into()).status_code(), 500);
        assert_eq!(LoadError::Store("x".into()).status_code(), 500);
        assert_eq!(LoadError::Search("x".into()).status_code(), 500);
    }
}
