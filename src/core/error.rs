use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Unsupported query shape: {0}")]
    UnsupportedQueryShape(String),

    #[error("Illegal view definition: {0}")]
    IllegalViewDefinition(String),

    #[error("Backend I/O error: {0}")]
    BackendIo(String),

    #[error("Feature type '{0}' not found")]
    TypeNotFound(String),

    #[error("Attribute '{1}' not found in type '{0}'")]
    AttributeNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, GeoError>;

impl<T> From<std::sync::PoisonError<T>> for GeoError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
