use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatGlmError {
    #[error("Failed to load model from '{path}': {reason}")]
    ModelLoadFailed { path: String, reason: String },

    #[error("Invalid generation config: {0}")]
    InvalidConfig(String),

    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Null pointer from FFI call")]
    NullPointer,

    #[error("FFI panic: {0}")]
    FfiPanic(String),

    #[error("Failed to start generation task: {0}")]
    Spawn(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ChatGlmError>;
