use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// A single failed fetch attempt. Every variant is retryable.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed for {url}: {source}")]
    Http { url: String, source: reqwest::Error },
    #[error("unexpected HTTP status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("anti-bot challenge not passed for {url}: {message}")]
    Challenge { url: String, message: String },
    #[error("challenge solver unavailable for {url}: {message}")]
    Solver { url: String, message: String },
    #[error("content too short for {url}: {len} bytes (need {min})")]
    ContentTooShort { url: String, len: usize, min: usize },
}

impl FetchError {
    /// Short label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Http { .. } => "http",
            FetchError::Status { .. } => "status",
            FetchError::Challenge { .. } => "challenge",
            FetchError::Solver { .. } => "solver",
            FetchError::ContentTooShort { .. } => "too_short",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unexpected document structure: {0}")]
    StructuralParse(String),
    #[error("invalid selector table entry {field} '{value}': {message}")]
    InvalidTable {
        field: &'static str,
        value: String,
        message: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(String),
    #[error("decoded payload is not UTF-8: {0}")]
    Utf8(String),
}

/// Every attempt for a URL failed; carries the last attempt's error.
#[derive(Debug, Error)]
#[error("giving up on {url} after {attempts} attempt(s): {last_error}")]
pub struct FetchFailure {
    pub url: String,
    pub attempts: u32,
    #[source]
    pub last_error: FetchError,
}
