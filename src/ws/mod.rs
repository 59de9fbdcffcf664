//! Self-contained websocket transport: RFC 6455 frame codec plus a
//! connection type with stream-like read/write semantics and a serialized
//! write path.

pub mod conn;
pub mod frame;
pub mod handshake;

pub use conn::{WsConn, CLOSE_NORMAL, HANDSHAKE_TIMEOUT};
pub use frame::{opcode, Frame, FrameDecoder, DEFAULT_MAX_PAYLOAD_BYTES, MAX_CONTROL_PAYLOAD};
