use thiserror::Error;

/// Errors produced by the transport client and the synchronizer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("HTTP error: {0}")]
    Http(Box<reqwest::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not connected to the chat gateway")]
    NotConnected,

    #[error("Request failed ({status}): {body}")]
    Request { status: u16, body: String },

    #[error("{0}")]
    Validation(String),

    #[error("No conversation selected")]
    NoConversation,

    #[error("Conversation with {0} is blocked")]
    Blocked(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

/// Coarse classes callers use to decide how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Request,
    Validation,
    Internal,
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::WebSocket(_) | ChatError::NotConnected => ErrorKind::Connectivity,
            ChatError::Http(e) if e.is_connect() || e.is_timeout() => ErrorKind::Connectivity,
            ChatError::Http(_) | ChatError::Request { .. } => ErrorKind::Request,
            ChatError::Validation(_) | ChatError::NoConversation | ChatError::Blocked(_) => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Internal,
        }
    }

    /// Whether offering the user a retry makes sense.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connectivity | ErrorKind::Request)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation(message.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::WebSocket(Box::new(e))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Http(Box::new(e))
    }
}
