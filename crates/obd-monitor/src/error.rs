#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid origin: {0}")]
    Origin(#[from] url::ParseError),

    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
