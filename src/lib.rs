//! Client library for the accord real-time API: a gateway session over a
//! self-contained websocket transport, plus voice connections carrying
//! authenticated-encrypted media over UDP.
//!
//! The entry point is [`Session`]: configure it, register event handlers,
//! and call [`Session::open`]. Voice lives behind
//! [`Session::voice_channel_join`], which returns a [`VoiceConnection`]
//! with channels for opus frames in and decrypted packets out.

pub mod config;
pub mod error;
pub mod gateway;
pub mod rest;
pub mod voice;
pub mod ws;

pub use config::Config;
pub use error::{Error, Result};
pub use gateway::events::Event;
pub use gateway::{intents, ConnectionState, Session};
pub use rest::RestClient;
pub use voice::{VoiceConnection, VoiceConnectionState, VoicePacket};
