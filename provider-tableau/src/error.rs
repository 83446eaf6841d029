//! Error types for the Tableau provider

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Tableau provider errors
#[derive(Error, Debug)]
pub enum TableauError {
    /// REST API returned a non-success status
    #[error("Tableau API error (status {status_code}, code {code}): {message}")]
    ApiError {
        status_code: u16,
        /// Tableau's own error code, e.g. `401002`
        code: String,
        message: String,
    },

    #[error("Site not found: {0}")]
    SiteNotFound(String),

    #[error("Workbook not found: {workbook_id}")]
    WorkbookNotFound { workbook_id: String },

    /// Failed to parse API response
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for Tableau operations
pub type Result<T> = std::result::Result<T, TableauError>;

impl From<TableauError> for BridgeError {
    fn from(error: TableauError) -> Self {
        match error {
            TableauError::ApiError {
                status_code,
                code,
                message,
            } => BridgeError::from_status(status_code, format!("Tableau {}: {}", code, message)),
            TableauError::SiteNotFound(site) => {
                BridgeError::NotFound(format!("Tableau site {}", site))
            }
            TableauError::WorkbookNotFound { workbook_id } => {
                BridgeError::NotFound(format!("Tableau workbook {}", workbook_id))
            }
            TableauError::ParseError(msg) => BridgeError::InvalidData(msg),
            TableauError::BridgeError(e) => e,
        }
    }
}
