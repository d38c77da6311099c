use thiserror::Error;

/// pxeforge error types
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Build recipe failed validation
    #[error("{field}: {message}")]
    InvalidRecipe { field: String, message: String },

    /// An external command exited non-zero or could not be spawned
    #[error("command failed: {command} (exit: {})\n{output}", exit_label(.code))]
    Command {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// Package manager operation failed
    #[error("package manager error: {0}")]
    Package(String),

    /// Layer or image config construction failed
    #[error("image assembly error: {0}")]
    ImageAssembly(String),

    /// Registry push or probe failed
    #[error("registry error: {0}")]
    Registry(String),

    /// Something expected was not found (kernel, layer, file in image)
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ForgeError {
    fn from(err: serde_yaml::Error) -> Self {
        ForgeError::Serialization(err.to_string())
    }
}

impl ForgeError {
    /// Whether a registry error is worth retrying. The distribution API
    /// surfaces transient blob-session loss as BLOB_UPLOAD_UNKNOWN; every
    /// other failure is treated as final.
    pub fn is_retryable_registry_error(&self) -> bool {
        matches!(self, ForgeError::Registry(msg) if msg.contains("BLOB_UPLOAD_UNKNOWN"))
    }
}

/// Result type alias for pxeforge operations
pub type Result<T> = std::result::Result<T, ForgeError>;
