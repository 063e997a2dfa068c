use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("yt-dlp executable could not be located; provision it first")]
    ExecutableNotFound,

    #[error("failed to decode tool output: {reason}")]
    OutputDecode { reason: String, raw: String },

    #[error("downloader exited with code {code:?}")]
    ProcessExit { code: Option<i32>, output: String },

    #[error("the service is rate-limiting requests; try again later")]
    RateLimited { output: String },

    #[error("subtitle handling failed: {0}")]
    Subtitle(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tool provisioning failed: {0}")]
    Provision(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Stable machine-readable tag, persisted with failed jobs so the
    /// presentation layer can pick a targeted remediation message.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ExecutableNotFound => "executable_not_found",
            EngineError::OutputDecode { .. } => "output_decode",
            EngineError::ProcessExit { .. } => "process_exit",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::Subtitle(_) => "subtitle",
            EngineError::Json(_) => "json",
            EngineError::Database(_) => "database",
            EngineError::Io(_) => "io",
            EngineError::Provision(_) => "provision",
            EngineError::InvalidRequest(_) => "invalid_request",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
