use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// RFC 6455 frame opcodes.
pub mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;

    pub fn is_control(op: u8) -> bool {
        op >= CLOSE
    }
}

/// Default cap on a single frame payload received over a connection.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 32 << 20; // 32MB

/// Control frames carry at most 125 payload bytes and are never fragmented.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// One decoded wire frame. A logical message is one or more frames ending
/// with `fin = true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Stateful frame decoder for one connection's read side.
///
/// The only state it carries is the number of bytes left over from an
/// oversized frame: when a payload exceeds `max_payload` the decoder reports
/// [`Error::FrameTooLarge`] without consuming the payload, then drains the
/// leftover bytes at the start of the next call so the stream stays
/// byte-aligned.
#[derive(Debug)]
pub struct FrameDecoder {
    max_payload: usize,
    leftover: u64,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            leftover: 0,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Read and decode the next frame, unmasking the payload in place.
    pub async fn read_frame<R>(&mut self, r: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin,
    {
        if self.leftover > 0 {
            let mut remaining = self.leftover;
            let mut sink = [0u8; 4096];
            while remaining > 0 {
                let want = remaining.min(sink.len() as u64) as usize;
                let n = r.read(&mut sink[..want]).await?;
                if n == 0 {
                    return Err(Error::Protocol("eof while draining oversized frame"));
                }
                remaining -= n as u64;
            }
            self.leftover = 0;
        }

        let mut header = [0u8; 2];
        r.read_exact(&mut header).await?;

        let fin = header[0] & 0x80 != 0;
        if header[0] & 0x70 != 0 {
            return Err(Error::Protocol("unexpected reserved bits"));
        }
        let op = header[0] & 0x0F;
        let masked = header[1] & 0x80 != 0;
        let len7 = header[1] & 0x7F;

        if opcode::is_control(op) {
            if !fin {
                return Err(Error::Protocol("fragmented control frame"));
            }
            if len7 as usize > MAX_CONTROL_PAYLOAD {
                return Err(Error::Protocol("control frame payload too long"));
            }
        }

        let len: u64 = match len7 {
            126 => {
                let mut ext = [0u8; 2];
                r.read_exact(&mut ext).await?;
                u16::from_be_bytes(ext) as u64
            }
            127 => {
                let mut ext = [0u8; 8];
                r.read_exact(&mut ext).await?;
                let len = u64::from_be_bytes(ext);
                if len & (1 << 63) != 0 {
                    return Err(Error::Protocol("64-bit length with high bit set"));
                }
                len
            }
            n => n as u64,
        };

        let mask = if masked {
            let mut key = [0u8; 4];
            r.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        if len > self.max_payload as u64 {
            // The payload stays on the wire; the next call drains it before
            // decoding anything else.
            self.leftover = len;
            return Err(Error::FrameTooLarge {
                max: self.max_payload,
            });
        }

        let mut payload = vec![0u8; len as usize];
        r.read_exact(&mut payload).await?;
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Frame {
            fin,
            opcode: op,
            payload,
        })
    }
}

/// Encode and write one frame. `mask` must be set on client-to-server
/// connections and unset on server-to-client ones.
pub async fn write_frame<W>(
    w: &mut W,
    fin: bool,
    op: u8,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if opcode::is_control(op) {
        if !fin {
            return Err(Error::Protocol("fragmented control frame"));
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("control frame payload too long"));
        }
    }

    let mut header = Vec::with_capacity(14);
    header.push(if fin { 0x80 } else { 0x00 } | (op & 0x0F));

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    match payload.len() {
        n if n <= 125 => header.push(mask_bit | n as u8),
        n if n <= u16::MAX as usize => {
            header.push(mask_bit | 126);
            header.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            header.push(mask_bit | 127);
            header.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }

    match mask {
        Some(key) => {
            header.extend_from_slice(&key);
            let mut body = payload.to_vec();
            apply_mask(&mut body, key);
            w.write_all(&header).await?;
            w.write_all(&body).await?;
        }
        None => {
            w.write_all(&header).await?;
            w.write_all(payload).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

/// XOR a payload with its 4-byte masking key. Symmetric, so this both masks
/// and unmasks.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}

/// Build a close frame payload: 2-byte status code followed by UTF-8 reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Split a received close frame payload into its status code and reason.
pub fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}
