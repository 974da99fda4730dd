use thiserror::Error;

/// Errors that abort a unit of work.
///
/// Suppression, degeneracy and join-integrity problems are not errors; they are
/// carried as data on the scored rows (see `indicator::SuppressionReason` and
/// `history::JoinIntegrityWarning`).
#[derive(Debug, Error)]
pub enum EngineError {
    /// The loaded configuration is internally inconsistent. Every problem found is listed.
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Configuration(Vec<String>),

    /// An input table lacks columns the active configuration requires.
    #[error("indicator '{indicator}' is missing required columns: {}", .missing.join(", "))]
    Schema {
        indicator: String,
        missing: Vec<String>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The persistence collaborator failed to read or write a table.
    #[error("table store error for '{name}' ({fiscal_year}): {message}")]
    Store {
        name: String,
        fiscal_year: i32,
        message: String,
    },
}

impl EngineError {
    pub fn is_schema(&self) -> bool {
        matches!(self, EngineError::Schema { .. })
    }
}
