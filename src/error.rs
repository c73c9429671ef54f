use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_errors_are_boxed_and_displayed() {
        let error: AppError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(error, AppError::WebSocket(_)));
        assert!(error.to_string().starts_with("websocket error:"));
    }

    #[test]
    fn invalid_argument_keeps_message() {
        let error = AppError::InvalidArgument("symbol must be non-empty".to_string());
        assert_eq!(
            error.to_string(),
            "invalid argument: symbol must be non-empty"
        );
    }

    #[test]
    fn serializes_as_display_string() {
        let error = AppError::InvalidArgument("bad timeframe".to_string());
        let encoded = simd_json::serde::to_string(&error).expect("error should serialize");
        assert_eq!(encoded, r#""invalid argument: bad timeframe""#);
    }
}
