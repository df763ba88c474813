use thiserror::Error;

pub type GenResult<T> = Result<T, GenerationError>;

/// Failure kinds surfaced by the pipeline and the generation backends.
///
/// The variant decides retry behaviour: only `Backend` and `Http` can be
/// classified as transient, everything else is final for the current call.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Session expired or invalid: {0}")]
    Session(String),

    #[error("Submit failed: {0}")]
    Submit(String),

    #[error("Generation did not finish: {0}")]
    Timeout(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("{stage} failed: {reason}")]
    Pipeline { stage: &'static str, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GenerationError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    pub fn submit(msg: impl Into<String>) -> Self {
        Self::Submit(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    pub fn pipeline(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Pipeline {
            stage,
            reason: reason.into(),
        }
    }

    /// Session problems need a new cookie or key before anything is resubmitted.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}
