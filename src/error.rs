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
    #[error("json encode error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("seed load failed for {symbol}: {source}")]
    SeedLoad {
        symbol: String,
        #[source]
        source: Box<AppError>,
    },
    #[error("stream transport is not connected")]
    NotConnected,
    #[error("render sink closed")]
    SinkClosed,
}

impl AppError {
    pub fn seed_load(symbol: impl Into<String>, source: AppError) -> Self {
        Self::SeedLoad {
            symbol: symbol.into(),
            source: Box::new(source),
        }
    }
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
    fn seed_load_error_names_symbol_and_cause() {
        let error = AppError::seed_load(
            "NIFTY25JAN24000CE",
            AppError::InvalidArgument("body was not an array".to_string()),
        );
        let rendered = error.to_string();

        assert!(rendered.contains("NIFTY25JAN24000CE"));
        assert!(rendered.contains("body was not an array"));
    }

    #[test]
    fn serializes_as_display_string() {
        let encoded = serde_json::to_string(&AppError::NotConnected)
            .expect("error should serialize as a string");
        assert_eq!(encoded, "\"stream transport is not connected\"");
    }
}
