//! Error types for Tallycast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TallyError>;

/// Maximum number of characters of an upstream response body kept in errors
pub const BODY_SNIPPET_LIMIT: usize = 300;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl TallyError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TallyError::InvalidInput(_) => 3,
            TallyError::Credential(_) => 2,
            TallyError::Fetch(FetchError::Credential(_)) => 2,
            TallyError::Fetch(_) => 1,
            TallyError::Config(_) => 1,
            TallyError::Database(_) => 1,
        }
    }

    /// True when the error means the run produced nothing at all
    pub fn is_no_content(&self) -> bool {
        matches!(self, TallyError::Fetch(FetchError::NoContent))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone)]
pub enum CredentialError {
    #[error("No credentials stored for source {0}")]
    NotFound(String),

    #[error("Encryption key not set (expected in ${0})")]
    MissingKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Credential storage failed: {0}")]
    Storage(String),
}

/// Failures raised while talking to an upstream network
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Failed to scrape page: {0}")]
    Scrape(String),

    #[error("Rate limited with status {status} after {attempts} attempts")]
    RateLimited { status: u16, attempts: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("no content found")]
    NoContent,
}

impl FetchError {
    /// Build a status error keeping only the head of the response body
    pub fn status(status: u16, body: &str) -> Self {
        FetchError::Status {
            status,
            body: truncate_body(body),
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= BODY_SNIPPET_LIMIT {
        return body.to_string();
    }
    let head: String = body.chars().take(BODY_SNIPPET_LIMIT).collect();
    format!("{}...", head)
}

impl From<CredentialError> for FetchError {
    fn from(err: CredentialError) -> Self {
        FetchError::Credential(err.to_string())
    }
}

impl From<sqlx::Error> for TallyError {
    fn from(err: sqlx::Error) -> Self {
        TallyError::Database(DbError::SqlxError(err))
    }
}
