#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid payload for '{kind}': {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),
}
