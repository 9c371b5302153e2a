//! Error types for the mail gateway.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("MIME error: {0}")]
    Mime(#[from] MimeError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Configuration errors. These are never swallowed per message.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Got {count} active outbox configurations, expected 1")]
    ActiveOutbox { count: usize },

    #[error("{alias} is not a valid backend alias")]
    UnknownBackend { alias: String },

    #[error("use_tls/use_ssl are mutually exclusive, only set one of them")]
    TlsAndSsl,

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Blob storage errors (attachments and original messages).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Stored object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage reference: {0}")]
    InvalidRef(String),

    #[error("Invalid body encoding: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// MIME parse and serialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MimeError {
    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Failed to serialize message: {reason}")]
    Serialize { reason: String },

    #[error("Invalid transfer encoding {encoding}: {reason}")]
    TransferEncoding { encoding: String, reason: String },
}

/// Template rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Template syntax error at byte {offset}: {reason}")]
    Syntax { offset: usize, reason: String },

    #[error("Missing template variable: {0}")]
    MissingVariable(String),

    #[error("Failed to build email: {0}")]
    Build(String),
}

/// Transport-level send errors.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {host}")]
    AuthFailed { host: String },

    #[error("Send timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Delivery rejected: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Input validation errors raised by the queueing API.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: {value} is not a valid email address")]
    InvalidAddress { field: String, value: String },

    #[error("You can't specify both \"template\" and \"{0}\" arguments")]
    TemplateConflict(String),

    #[error("{0}")]
    NotAllowed(String),

    #[error("Invalid priority {0}, must be one of: low, medium, high, now")]
    InvalidPriority(String),

    #[error("Message {0} has no sender address to reply from")]
    NoReplySender(Uuid),
}

impl Error {
    /// Short variant label recorded alongside delivery failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(e) => match e {
                ConfigError::ActiveOutbox { .. } => "ActiveOutbox",
                ConfigError::UnknownBackend { .. } => "UnknownBackend",
                ConfigError::TlsAndSsl => "TlsAndSsl",
                ConfigError::InvalidValue { .. } => "InvalidValue",
            },
            Self::Database(_) => "DatabaseError",
            Self::Storage(_) => "StorageError",
            Self::Mime(_) => "MimeError",
            Self::Render(e) => match e {
                RenderError::Syntax { .. } => "TemplateSyntaxError",
                RenderError::MissingVariable(_) => "MissingVariable",
                RenderError::Build(_) => "BuildError",
            },
            Self::Send(e) => match e {
                SendError::Connect { .. } => "ConnectionError",
                SendError::AuthFailed { .. } => "AuthenticationError",
                SendError::Timeout { .. } => "Timeout",
                SendError::Rejected(_) => "Rejected",
                SendError::Transport(_) => "TransportError",
            },
            Self::Validation(_) => "ValidationError",
        }
    }
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;
