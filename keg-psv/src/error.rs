//! Error types for PSV parsing and writing

use thiserror::Error;

/// Result type for PSV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or writing PSV documents
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The document has no header line
    #[error("Document is empty")]
    EmptyDocument,

    /// The header line is malformed
    #[error("Invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// A field type specification could not be parsed
    #[error("Invalid field type: {spec}")]
    InvalidFieldType { spec: String },

    /// Two columns share a name
    #[error("Duplicate column name: {name}")]
    DuplicateColumn { name: String },

    /// A row has the wrong number of cells for the schema
    #[error("Row {row} has {actual} cells, schema has {expected}")]
    CellCountMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },

    /// A cell value does not match its column type
    #[error("Row {row}, column '{column}': invalid {type_name} value {value:?}")]
    InvalidCell {
        row: usize,
        column: String,
        type_name: &'static str,
        value: String,
    },

    /// A column was requested that the schema does not contain
    #[error("No such column: {name}")]
    NoSuchColumn { name: String },
}
