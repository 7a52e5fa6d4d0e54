use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[cfg(feature = "ingestors")]
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upstream connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid product ID")]
    InvalidProduct,

    #[error("Unsupported product: {0}")]
    UnsupportedProduct(String),

    #[error("{frame} frame missing required field '{field}'")]
    MissingField { frame: &'static str, field: &'static str },

    #[error("{frame} frame has malformed field '{field}': {value}")]
    MalformedField {
        frame: &'static str,
        field: &'static str,
        value: String,
    },
}

pub type Result<T> = std::result::Result<T, RelayError>;
