//! Error types for the pipeline bridge

use thiserror::Error;

/// Errors raised while moving data into or out of a module's memory
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    #[error("Invalid address reference: {0}")]
    InvalidAddress(String),

    #[error("Memory access out of bounds at offset {offset} (length {len})")]
    MemoryAccess { offset: u64, len: usize },

    #[error("Module does not export `{0}`")]
    MissingExport(String),

    #[error("Invalid virtual filesystem path: {0}")]
    InvalidPath(String),

    #[error("Module call failed: {0}")]
    Call(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced to callers of the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to load module {path}: {reason}")]
    ModuleLoad { path: String, reason: String },

    #[error("Could not find a backend able to handle {file_name}")]
    FormatNotFound { file_name: String },

    #[error("Pipeline execution failed: {message}")]
    Execution {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BridgeError {
    pub(crate) fn module_load(path: impl Into<String>, reason: impl ToString) -> Self {
        BridgeError::ModuleLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for the marshaling error raised by unrecognized type tags
    pub fn is_unsupported_type(&self) -> bool {
        matches!(self, BridgeError::Codec(CodecError::UnsupportedType(_)))
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
