use serde_json::Value;

/// Client configuration. `token` is the only required value; everything
/// else has a working default for a single-shard session.
#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub intents: u64,
    pub shard_id: u32,
    pub shard_count: u32,
    /// Base URL of the REST API, used to bootstrap the gateway URL.
    pub api_base: String,
    /// Explicit gateway URL. When set, the REST bootstrap is skipped.
    pub gateway_url: Option<String>,
    /// Run event handlers inline on the read loop instead of spawning a
    /// task per event. Inline handlers preserve event order but a slow
    /// handler stalls the connection.
    pub sync_dispatch: bool,
    pub max_reconnect_attempts: u32,
    /// Initial presence sent with identify.
    pub presence: Option<Value>,
}

pub const DEFAULT_API_BASE: &str = "http://localhost:39099/api/v1";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

impl Config {
    pub fn new(token: impl Into<String>, intents: u64) -> Self {
        Self {
            token: token.into(),
            intents,
            shard_id: 0,
            shard_count: 1,
            api_base: DEFAULT_API_BASE.to_string(),
            gateway_url: None,
            sync_dispatch: false,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            presence: None,
        }
    }

    pub fn from_env() -> Self {
        let token = std::env::var("ACCORD_TOKEN").expect("ACCORD_TOKEN is required");
        let intents: u64 = std::env::var("ACCORD_INTENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(crate::gateway::intents::NONE);
        let shard_id: u32 = std::env::var("ACCORD_SHARD_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let shard_count: u32 = std::env::var("ACCORD_SHARD_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Self {
            shard_id,
            shard_count,
            api_base: std::env::var("ACCORD_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            gateway_url: std::env::var("ACCORD_GATEWAY_URL").ok(),
            sync_dispatch: std::env::var("ACCORD_SYNC_DISPATCH")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            max_reconnect_attempts: std::env::var("ACCORD_MAX_RECONNECTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            ..Self::new(token, intents)
        }
    }
}
