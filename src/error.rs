use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the gateway and voice clients.
///
/// Connection-internal recoveries (oversized-frame draining, single voice
/// packets failing authentication) never appear here; they are handled where
/// they occur. What does appear is either a caller mistake (`AlreadyOpen`,
/// `ShardBounds`), a protocol violation fatal to the current connection, or
/// a terminal condition such as an exhausted reconnect budget.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("websocket connection already opened")]
    AlreadyOpen,

    #[error("no websocket connection exists")]
    NotConnected,

    #[error("shard id must be less than the shard count")]
    ShardBounds,

    #[error("frame payload exceeds the {max} byte limit")]
    FrameTooLarge { max: usize },

    #[error("websocket protocol error: {0}")]
    Protocol(&'static str),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("unsupported websocket scheme: {0}")]
    BadScheme(String),

    #[error("bad websocket url: {0}")]
    BadUrl(String),

    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("voice packet failed authentication")]
    VoiceAuthentication,

    #[error("crypto failure sealing voice packet")]
    Crypto,

    #[error("rtp timestamp wrapped; voice session must be renegotiated")]
    NonceExhausted,

    #[error("reconnect budget exhausted, session is disconnected")]
    ReconnectExhausted,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether the gateway should tear down the current connection and try
    /// to resume, as opposed to reporting the error to the caller.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::FrameTooLarge { .. }
                | Error::Closed { .. }
                | Error::Io(_)
                | Error::Timeout(_)
        )
    }
}
