use thiserror::Error;

/// Core error type for chatrelay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// The inbound prompt was absent or blank after normalization.
    #[error("prompt is empty")]
    EmptyPrompt,

    /// A required process-wide setting is absent. `which` names the
    /// environment variable that was expected to carry it.
    #[error("configuration missing: {which}")]
    ConfigMissing { which: String },

    #[error("upstream unavailable: {reason}")]
    UpstreamUnavailable { reason: String },

    #[error("upstream returned HTTP {code}")]
    UpstreamStatus { code: u16, excerpt: String },

    #[error("client disconnected")]
    ClientGone,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Sentence written into an already-committed response body when this
    /// error happens after the status line went out.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::ConfigMissing { which } => {
                format!("backend is not configured: {which} is not set (export it before starting the server)\n")
            }
            Self::UpstreamUnavailable { .. } => {
                "upstream request failed: could not connect to the model API\n".to_string()
            }
            Self::UpstreamStatus { code, excerpt } => {
                format!("upstream returned an error: HTTP {code}\n{excerpt}\n")
            }
            other => format!("relay error: {other}\n"),
        }
    }

    /// Short, stable label for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::EmptyPrompt => "empty_prompt",
            Self::ConfigMissing { .. } => "config_missing",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::ClientGone => "client_gone",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;
