//! Error types for boundary mapping

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("path has {len} points, at least 3 are required")]
    PathTooShort { len: usize },

    #[error("path is not a 2D point sequence: {0}")]
    MalformedPath(String),

    #[error("{len} dominant points, at least 3 are required to form relative measurements")]
    TooFewDominantPoints { len: usize },

    #[error("size mismatch for {what}: expected {expected}, found {found}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid {kind} selector: {value:?}")]
    InvalidMode { kind: &'static str, value: String },

    #[error("g2o parse error: {0}")]
    G2o(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("configuration error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("configuration error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, MappingError>;
