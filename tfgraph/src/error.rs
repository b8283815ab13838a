//! Error types for the engine
//!
//! `EngineError` covers failures at the library seam itself. Provider and
//! planning failures flow through diagnostics instead, so this enum stays
//! small.

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Provider factory failed: {0}")]
    ProviderFactory(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Graph is cyclic: {0}")]
    CyclicGraph(String),

    #[error("Graph node not found: {0}")]
    NodeNotFound(String),

    #[error("Hook failed: {0}")]
    Hook(String),

    #[error("{0}")]
    Custom(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Custom(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Custom(s.to_string())
    }
}
