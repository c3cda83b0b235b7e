use thiserror::Error;

/// Error taxonomy for the agent driver and its cross-channel failover policy.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("route resolution failed: {0}")]
    Route(String),

    #[error("agent dispatch failed: {0}")]
    Dispatch(String),

    #[error("media fetch failed: {0}")]
    Media(String),

    #[error("media sink rejected save: {0}")]
    MediaSink(String),

    #[error("outbound send failed: {0}")]
    Outbound(String),

    #[error("no active reply url for stream")]
    NoActiveReplyUrl,
}

impl DriverError {
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::Route(_) => "ROUTE_FAILED",
            DriverError::Dispatch(_) => "AGENT_DISPATCH_FAILED",
            DriverError::Media(_) => "MEDIA_FETCH_FAILED",
            DriverError::MediaSink(_) => "MEDIA_SINK_FAILED",
            DriverError::Outbound(_) => "OUTBOUND_SEND_FAILED",
            DriverError::NoActiveReplyUrl => "NO_ACTIVE_REPLY_URL",
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
