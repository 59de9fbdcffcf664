use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opcodes for voice signaling messages.
pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
}

/// Voice signaling message envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub op: u8,
    #[serde(rename = "d", skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// IDENTIFY (opcode 0) payload data.
#[derive(Debug, Serialize)]
pub struct VoiceIdentify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

/// READY (opcode 2) payload data: the media endpoint parameters.
#[derive(Debug, Deserialize)]
pub struct VoiceReady {
    pub ssrc: u32,
    #[serde(default)]
    pub ip: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

/// HELLO (opcode 8) payload data. The interval historically arrives as a
/// float.
#[derive(Debug, Deserialize)]
pub struct VoiceHello {
    pub heartbeat_interval: f64,
}

/// SELECT_PROTOCOL (opcode 1) payload data, carrying the externally
/// discovered address.
#[derive(Debug, Serialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Serialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

/// SESSION_DESCRIPTION (opcode 4) payload data: negotiated mode and key.
#[derive(Debug, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

/// SPEAKING (opcode 5) payload, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speaking {
    pub speaking: bool,
    #[serde(default)]
    pub delay: u32,
    #[serde(default)]
    pub ssrc: u32,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// RESUME (opcode 7) payload data, scoped to the voice endpoint.
#[derive(Debug, Serialize)]
pub struct VoiceResume {
    pub server_id: String,
    pub session_id: String,
    pub token: String,
}
