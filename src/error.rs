use thiserror::Error;


#[derive(Debug, Error)]
pub enum PayloadFormatError {
    #[error("empty payload")]
    Empty,
    #[error("payload too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("pairing with {device} failed: {reason}")]
    Pairing { device: String, reason: String },

    #[error("service discovery on {device} failed: {reason}")]
    ServiceDiscovery { device: String, reason: String },

    #[error("malformed payload: {0}")]
    PayloadFormat(#[from] PayloadFormatError),

    #[error("network error: {0}")]
    Network(String),

    #[error("backend storage error (HTTP {status})")]
    Storage { status: u16 },

    #[error("backend rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("no rows selected for export")]
    NothingSelected,

    #[error("session for {0} has no characteristic handles")]
    StaleSession(String),

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("offline queue is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_server_error() => Error::Storage { status: status.as_u16() },
            _ => Error::Network(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
