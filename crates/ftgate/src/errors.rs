use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] ftgate_tls::TlsSetupError),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("timed out waiting for the response gate")]
    GateTimeout,
    #[error("origin {addr} is unavailable: {detail}")]
    OriginUnavailable { addr: String, detail: String },
    #[error("origin switch to {addr} failed: {detail}")]
    SwitchFailed { addr: String, detail: String },
}

impl From<ftgate_core::ConfigError> for ProxyError {
    fn from(value: ftgate_core::ConfigError) -> Self {
        Self::InvalidConfig(value.to_string())
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
