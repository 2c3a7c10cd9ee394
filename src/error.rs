use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvoyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("missing field in response: {field}")]
    MissingField { field: String },
    #[error("cannot persist {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config error: {0}")]
    Config(String),
}

impl EnvoyError {
    pub fn missing(field: impl Into<String>) -> Self {
        EnvoyError::MissingField {
            field: field.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EnvoyError>;
