use thiserror::Error;

/// Problems found while turning a spreadsheet export into orders.
///
/// Rows are reported 1-based as the operator sees them in a spreadsheet
/// program, counting the skipped title rows.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("could not open workbook: {0}")]
    Workbook(String),

    #[error("workbook has no sheets")]
    NoSheet,

    #[error("header row {row} not found")]
    MissingHeader { row: usize },

    #[error("required column '{column}' is missing")]
    MissingColumn { column: String },

    #[error("row {row}, column '{column}': {message}")]
    InvalidCell {
        row: usize,
        column: String,
        message: String,
    },
}

/// Every failure an operator action can report.
#[derive(Debug, Error)]
pub enum TombolaError {
    #[error("invalid order: {0}")]
    Validation(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("no order for {name} on {date}")]
    NotFound { name: String, date: String },

    #[error("email not sent: {0}")]
    Notification(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("page rendering failed: {0}")]
    Template(String),
}

impl TombolaError {
    pub fn validation(message: impl Into<String>) -> Self {
        TombolaError::Validation(message.into())
    }
}

impl From<rust_xlsxwriter::XlsxError> for TombolaError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        TombolaError::Export(err.to_string())
    }
}

impl From<csv::Error> for TombolaError {
    fn from(err: csv::Error) -> Self {
        TombolaError::Export(err.to_string())
    }
}

pub type Result<T, E = TombolaError> = std::result::Result<T, E>;
