use std::collections::HashMap;

use data_encoding::BASE64;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "13";

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Compute the Sec-WebSocket-Accept value for a handshake key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(&hasher.finalize())
}

/// Generate a random 16-byte challenge key, base64-encoded.
pub fn generate_key() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    BASE64.encode(&raw)
}

/// Perform the client side of the upgrade handshake: write the versioned
/// upgrade request, then validate the 101 response and the accept challenge.
/// Any mismatch is a hard failure; there is no unvalidated fallback.
pub async fn client_handshake<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    origin: &str,
    protocols: &[&str],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();

    let mut request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Origin: {origin}\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {SUPPORTED_PROTOCOL_VERSION}\r\n"
    );
    if !protocols.is_empty() {
        request.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocols.join(", ")));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let (status_line, headers) = read_head(stream).await?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::HandshakeRejected("malformed status line".into()))?;
    if status != "101" {
        return Err(Error::HandshakeRejected(format!("bad status: {status_line}")));
    }
    if !header_eq(&headers, "upgrade", "websocket") {
        return Err(Error::Protocol("missing or bad upgrade"));
    }
    if !header_contains(&headers, "connection", "upgrade") {
        return Err(Error::Protocol("missing or bad connection header"));
    }
    match headers.get("sec-websocket-accept") {
        Some(got) if *got == accept_key(&key) => {}
        _ => return Err(Error::Protocol("mismatch challenge/response")),
    }

    Ok(())
}

/// Perform the server side of the upgrade handshake: read the request,
/// validate the exact upgrade invariants, and send the 101 response.
///
/// Used to terminate peer-initiated signaling connections in tests and
/// tooling; validation failures are protocol errors, never a silent
/// downgrade to a plain stream.
pub async fn server_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request_line, headers) = read_head(stream).await?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let _path = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if method != "GET" {
        return Err(Error::Protocol("bad method"));
    }
    if version != "HTTP/1.1" {
        return Err(Error::Protocol("bad http version"));
    }
    if !headers.contains_key("host") {
        return Err(Error::Protocol("missing host header"));
    }
    if !header_eq(&headers, "upgrade", "websocket") {
        return Err(Error::Protocol("missing or bad upgrade"));
    }
    if !header_contains(&headers, "connection", "upgrade") {
        return Err(Error::Protocol("missing or bad connection header"));
    }
    if headers.get("sec-websocket-version").map(String::as_str) != Some(SUPPORTED_PROTOCOL_VERSION)
    {
        return Err(Error::Protocol("missing or bad websocket version"));
    }
    let key = headers
        .get("sec-websocket-key")
        .ok_or(Error::Protocol("missing websocket key"))?;

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Read an HTTP head (request or status line plus headers) byte by byte up
/// to the blank line, without consuming anything past it.
async fn read_head<S>(stream: &mut S) -> Result<(String, HashMap<String, String>)>
where
    S: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(512);
    loop {
        let byte = stream.read_u8().await?;
        raw.push(byte);
        if raw.len() > MAX_HEADER_BYTES {
            return Err(Error::Protocol("handshake headers too large"));
        }
        if raw.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");
    let first = lines
        .next()
        .ok_or(Error::Protocol("empty handshake"))?
        .to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok((first, headers))
}

fn header_eq(headers: &HashMap<String, String>, name: &str, want: &str) -> bool {
    headers
        .get(name)
        .map(|v| v.eq_ignore_ascii_case(want))
        .unwrap_or(false)
}

fn header_contains(headers: &HashMap<String, String>, name: &str, want: &str) -> bool {
    headers
        .get(name)
        .map(|v| v.to_ascii_lowercase().contains(want))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        // Worked example from RFC 6455 section 1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn client_and_server_handshakes_interoperate() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            server_handshake(&mut server).await.unwrap();
        });
        client_handshake(&mut client, "example.test", "/gateway", "http://example.test", &[])
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn server_rejects_bad_method() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client
                .write_all(b"POST /gateway HTTP/1.1\r\nHost: x\r\n\r\n")
                .await;
        });
        let err = server_handshake(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Protocol("bad method")));
    }

    #[tokio::test]
    async fn server_rejects_missing_upgrade() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client
                .write_all(
                    b"GET /gateway HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\n\
                      Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: abc\r\n\r\n",
                )
                .await;
        });
        let err = server_handshake(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Protocol("missing or bad upgrade")));
    }

    #[tokio::test]
    async fn client_rejects_wrong_accept_key() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 2048];
            let _ = server.read(&mut buf).await;
            let _ = server
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                      Connection: Upgrade\r\nSec-WebSocket-Accept: bogus\r\n\r\n",
                )
                .await;
        });
        let err = client_handshake(&mut client, "x", "/", "http://x", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol("mismatch challenge/response")));
    }
}
