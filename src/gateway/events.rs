use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opcodes for gateway messages.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const STATUS_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes the gateway may send.
pub mod close_code {
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTH_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;

    /// Human-readable label for a gateway close code, for logs.
    pub fn describe(code: u16) -> &'static str {
        match code {
            UNKNOWN_ERROR => "unknown error",
            UNKNOWN_OPCODE => "unknown opcode",
            DECODE_ERROR => "decode error",
            NOT_AUTHENTICATED => "not authenticated",
            AUTH_FAILED => "authentication failed",
            ALREADY_AUTHENTICATED => "already authenticated",
            INVALID_SEQ => "invalid resume sequence",
            RATE_LIMITED => "rate limited",
            SESSION_TIMED_OUT => "session timed out",
            INVALID_SHARD => "invalid shard",
            SHARDING_REQUIRED => "sharding required",
            _ => "unrecognized close code",
        }
    }
}

/// Gateway message envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(rename = "s", skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "t", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "d", skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// HELLO (opcode 10) payload data.
#[derive(Debug, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// IDENTIFY (opcode 2) payload data.
#[derive(Debug, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub compress: bool,
    pub large_threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
    pub intents: u64,
}

#[derive(Debug, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// RESUME (opcode 6) payload data.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// READY dispatch data. Only the fields the session itself needs; the rest
/// of the payload stays available to handlers as raw data.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Voice state update dispatch data.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceState {
    pub guild_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub user_id: String,
    pub session_id: String,
}

/// Voice server update dispatch data: the credentials for a voice endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// A decoded gateway event, demultiplexed once by type tag at the dispatch
/// boundary. Events the session does not model structurally keep their raw
/// payload.
#[derive(Debug, Clone)]
pub enum Event {
    /// Synthetic: the session reached Ready over a fresh identify.
    Connect,
    /// Synthetic: the session is gone and will not reconnect on its own.
    Disconnect,
    Ready(Ready),
    Resumed,
    MessageCreate(Value),
    PresenceUpdate(Value),
    TypingStart(Value),
    VoiceStateUpdate(VoiceState),
    VoiceServerUpdate(VoiceServerUpdate),
    Unknown { event_type: String, data: Value },
}

impl Event {
    /// Resolve a dispatch payload into a typed event. Payloads that fail to
    /// decode fall back to `Unknown` rather than killing the read loop.
    pub fn parse(event_type: &str, data: Value) -> Event {
        match event_type {
            "READY" => match serde_json::from_value(data.clone()) {
                Ok(ready) => Event::Ready(ready),
                Err(_) => Event::Unknown {
                    event_type: event_type.to_string(),
                    data,
                },
            },
            "RESUMED" => Event::Resumed,
            "MESSAGE_CREATE" => Event::MessageCreate(data),
            "PRESENCE_UPDATE" => Event::PresenceUpdate(data),
            "TYPING_START" => Event::TypingStart(data),
            "VOICE_STATE_UPDATE" => match serde_json::from_value(data.clone()) {
                Ok(vs) => Event::VoiceStateUpdate(vs),
                Err(_) => Event::Unknown {
                    event_type: event_type.to_string(),
                    data,
                },
            },
            "VOICE_SERVER_UPDATE" => match serde_json::from_value(data.clone()) {
                Ok(vsu) => Event::VoiceServerUpdate(vsu),
                Err(_) => Event::Unknown {
                    event_type: event_type.to_string(),
                    data,
                },
            },
            other => Event::Unknown {
                event_type: other.to_string(),
                data,
            },
        }
    }
}

/// Presence payload sent with identify or a live status update.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusUpdate {
    pub since: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game: Option<Value>,
    pub status: String,
    pub afk: bool,
}
