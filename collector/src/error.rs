//! Error types for the collector

use thiserror::Error;

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Process-level error type
#[derive(Error, Debug)]
pub enum CollectorError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Plugin error
    #[error("plugin '{plugin}' error: {message}")]
    Plugin { plugin: String, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Errors raised by the HTTP fetcher
///
/// Rate limiting never shows up here directly: it is retried inside the
/// fetcher and only surfaces as `RetriesExhausted` once the policy gives up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Token exchange or credential rejected
    #[error("authentication failed ({status}): {message}")]
    Authentication { status: u16, message: String },

    /// Connection, TLS or timeout failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-retryable HTTP status
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    /// Response body was not the expected JSON
    #[error("decode error: {0}")]
    Decode(String),

    /// Backoff policy gave up
    #[error("gave up after {attempts} retries: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Request could not be built (bad URL, header)
    #[error("invalid request: {0}")]
    Request(String),
}

/// Errors raised when rows are stored into the buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Row carries a column the dataset never declared
    #[error("dataset '{tag}': unknown column '{column}'")]
    UnknownColumn { tag: String, column: String },

    /// Value type disagrees with the declared column type
    #[error("dataset '{tag}': column '{column}' expects {expected}, found {found}")]
    TypeMismatch {
        tag: String,
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Dataset declares a column the buffer stamps itself
    #[error("dataset '{tag}': column '{column}' is reserved")]
    ReservedColumn { tag: String, column: String },

    /// A second, different schema was used for an existing tag
    #[error("dataset '{tag}': schema differs from the one already buffered")]
    SchemaChanged { tag: String },
}

/// Errors raised by a sink while writing a dataset
#[derive(Error, Debug)]
pub enum SinkError {
    /// Could not connect or build the connection pool
    #[error("connection error: {0}")]
    Connection(String),

    /// Namespace/schema bootstrap failed
    #[error("schema bootstrap failed: {0}")]
    Schema(String),

    /// Write statement or upload failed
    #[error("write failed: {0}")]
    Write(String),

    /// Encoding rows into the target format failed
    #[error("encode failed: {0}")]
    Encode(String),

    /// IO error (file exports)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for plugin execution
#[derive(Error, Debug)]
pub enum PluginError {
    /// Fetch failure the plugin chose to propagate
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Rows rejected by the buffer
    #[error("store failed: {0}")]
    Buffer(#[from] BufferError),

    /// A fan-out task failed
    #[error("task failed: {0}")]
    Task(String),

    /// Plugin or worker panicked
    #[error("panicked: {0}")]
    Panicked(String),

    /// Any other plugin failure
    #[error("{0}")]
    Failed(String),
}

/// Error type for alert delivery
#[derive(Error, Debug)]
pub enum AlertError {
    /// Request could not be sent
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Channel answered but refused the message
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<PluginError> for CollectorError {
    fn from(err: PluginError) -> Self {
        CollectorError::Plugin {
            plugin: "unknown".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Decode(err.to_string())
        } else if err.is_builder() {
            FetchError::Request(err.to_string())
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}
