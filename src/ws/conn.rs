use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::frame::{
    self, close_payload, opcode, parse_close_payload, write_frame, Frame, FrameDecoder,
};
use super::handshake;
use crate::error::{Error, Result};

/// Bounded wait for the upgrade handshake to complete.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code sent on an orderly local close.
pub const CLOSE_NORMAL: u16 = 1000;

/// A websocket connection over one byte stream.
///
/// The write side is serialized by an async mutex: exactly one frame write is
/// in flight at a time, concurrent callers queue on the lock. The read side
/// holds its own lock around one logical read cursor; callers are expected to
/// have a single read loop per connection.
pub struct WsConn<S> {
    read: Mutex<ReadState<S>>,
    write: Mutex<WriteHalf<S>>,
    payload_type: AtomicU8,
    mask_writes: bool,
    closed: AtomicBool,
}

struct ReadState<S> {
    stream: ReadHalf<S>,
    decoder: FrameDecoder,
    /// Partially consumed data frame, for the byte-stream `read` view.
    current: Vec<u8>,
    offset: usize,
    /// Open fragmented message: opening opcode plus accumulated payload.
    /// Interleaved control frames do not disturb it.
    fragment: Option<(u8, Vec<u8>)>,
}

impl<S> WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Establish the client side of a connection over an already-connected
    /// stream: performs the upgrade handshake, then frames all writes with
    /// masking as required for client-to-server traffic.
    pub async fn client(
        mut stream: S,
        host: &str,
        path: &str,
        origin: &str,
        protocols: &[&str],
    ) -> Result<Self> {
        handshake::client_handshake(&mut stream, host, path, origin, protocols).await?;
        Ok(Self::from_stream(stream, true))
    }

    /// Accept the server side of a connection: validates the upgrade request
    /// invariants and refuses anything that is not an exact websocket
    /// handshake.
    pub async fn server(mut stream: S) -> Result<Self> {
        handshake::server_handshake(&mut stream).await?;
        Ok(Self::from_stream(stream, false))
    }

    fn from_stream(stream: S, mask_writes: bool) -> Self {
        let (read_half, write_half) = io::split(stream);
        Self {
            read: Mutex::new(ReadState {
                stream: read_half,
                decoder: FrameDecoder::new(frame::DEFAULT_MAX_PAYLOAD_BYTES),
                current: Vec::new(),
                offset: 0,
                fragment: None,
            }),
            write: Mutex::new(write_half),
            payload_type: AtomicU8::new(opcode::TEXT),
            mask_writes,
            closed: AtomicBool::new(false),
        }
    }

    /// Payload type used by [`WsConn::write`] (text by default).
    pub fn set_payload_type(&self, op: u8) {
        self.payload_type.store(op, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Read the next complete logical message, reassembling fragments and
    /// handling interleaved control frames (ping is answered, pong ignored,
    /// close ends the connection). Returns the opening opcode and payload.
    pub async fn recv_message(&self) -> Result<(u8, Vec<u8>)> {
        let mut guard = self.read.lock().await;
        let read = &mut *guard;
        loop {
            let frame = read.decoder.read_frame(&mut read.stream).await?;
            match self.handle_control(&frame).await? {
                Some(frame) => {
                    if let Some(message) = Self::assemble(&mut read.fragment, frame)? {
                        return Ok(message);
                    }
                }
                None => continue,
            }
        }
    }

    /// Byte-stream view of the read side: drains successive data frames,
    /// transparently moving to the next frame when the current one is
    /// exhausted. Fragmentation boundaries are invisible at this level.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.read.lock().await;
        let read = &mut *guard;
        loop {
            if read.offset < read.current.len() {
                let n = (read.current.len() - read.offset).min(buf.len());
                buf[..n].copy_from_slice(&read.current[read.offset..read.offset + n]);
                read.offset += n;
                return Ok(n);
            }
            let frame = read.decoder.read_frame(&mut read.stream).await?;
            if let Some(frame) = self.handle_control(&frame).await? {
                read.current = frame.payload;
                read.offset = 0;
            }
        }
    }

    /// Write one complete message as a single frame of the configured
    /// payload type.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let op = self.payload_type.load(Ordering::Relaxed);
        self.send(op, data).await?;
        Ok(data.len())
    }

    /// Write one frame with an explicit opcode. All outbound traffic funnels
    /// through the single write lock.
    pub async fn send(&self, op: u8, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        let mask = self.mask_writes.then(rand::random::<[u8; 4]>);
        let mut write = self.write.lock().await;
        write_frame(&mut *write, true, op, payload, mask).await
    }

    /// Send a close frame carrying a status code and reason, then shut the
    /// stream down. Idempotent: a second close is a no-op, not a fault.
    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let payload = close_payload(code, reason);
        let mask = self.mask_writes.then(rand::random::<[u8; 4]>);
        let mut write = self.write.lock().await;
        // The peer may already be gone; the stream still gets shut down.
        let _ = write_frame(&mut *write, true, opcode::CLOSE, &payload, mask).await;
        let _ = write.shutdown().await;
        Ok(())
    }

    /// Dispatch a control frame, returning the frame back if it is data.
    async fn handle_control(&self, frame: &Frame) -> Result<Option<Frame>> {
        match frame.opcode {
            opcode::PING => {
                let _ = self.send(opcode::PONG, &frame.payload).await;
                Ok(None)
            }
            opcode::PONG => Ok(None),
            opcode::CLOSE => {
                let (code, reason) = parse_close_payload(&frame.payload);
                if !self.closed.swap(true, Ordering::SeqCst) {
                    let mask = self.mask_writes.then(rand::random::<[u8; 4]>);
                    let mut write = self.write.lock().await;
                    let _ = write_frame(&mut *write, true, opcode::CLOSE, &frame.payload, mask)
                        .await;
                    let _ = write.shutdown().await;
                }
                Err(Error::Closed { code, reason })
            }
            _ => Ok(Some(frame.clone())),
        }
    }

    /// Fold a data frame into the fragmentation state. Returns the complete
    /// message once a fin frame lands.
    fn assemble(
        fragment: &mut Option<(u8, Vec<u8>)>,
        frame: Frame,
    ) -> Result<Option<(u8, Vec<u8>)>> {
        match (frame.opcode, fragment.take()) {
            (opcode::CONTINUATION, Some((op, mut buf))) => {
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    Ok(Some((op, buf)))
                } else {
                    *fragment = Some((op, buf));
                    Ok(None)
                }
            }
            (opcode::CONTINUATION, None) => {
                Err(Error::Protocol("continuation frame with no open message"))
            }
            (_, Some(_)) => Err(Error::Protocol("data frame inside fragmented message")),
            (op, None) => {
                if frame.fin {
                    Ok(Some((op, frame.payload)))
                } else {
                    *fragment = Some((op, frame.payload));
                    Ok(None)
                }
            }
        }
    }
}

impl WsConn<TcpStream> {
    /// Dial a `ws://` endpoint: TCP connect plus upgrade handshake, both
    /// under one bounded wait. `wss://` needs an externally established TLS
    /// stream via [`WsConn::client`]; dialing it here is a scheme error.
    pub async fn dial(url: &str, origin: &str) -> Result<Self> {
        let (host, port, path) = parse_url(url)?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            let hostport = if port == 80 {
                host.clone()
            } else {
                format!("{host}:{port}")
            };
            Self::client(stream, &hostport, &path, origin, &[]).await
        })
        .await
        .map_err(|_| Error::Timeout("websocket handshake"))?
    }
}

/// Split a `ws://host[:port]/path` url into its dial parts.
pub(crate) fn parse_url(url: &str) -> Result<(String, u16, String)> {
    let rest = match url.split_once("://") {
        Some(("ws", rest)) => rest,
        Some((scheme, _)) => return Err(Error::BadScheme(scheme.to_string())),
        None => return Err(Error::BadUrl(url.to_string())),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(Error::BadUrl(url.to_string()));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::BadUrl(url.to_string()))?;
            (host.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };
    Ok((host, port, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn pair() -> (Arc<WsConn<tokio::io::DuplexStream>>, Arc<WsConn<tokio::io::DuplexStream>>) {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { WsConn::server(server_stream).await.unwrap() });
        let client = WsConn::client(client_stream, "test", "/", "http://test", &[])
            .await
            .unwrap();
        (Arc::new(client), Arc::new(server.await.unwrap()))
    }

    #[tokio::test]
    async fn text_message_roundtrip() {
        let (client, server) = pair().await;
        client.send(opcode::TEXT, b"hello there").await.unwrap();
        let (op, payload) = server.recv_message().await.unwrap();
        assert_eq!(op, opcode::TEXT);
        assert_eq!(payload, b"hello there");

        server.send(opcode::BINARY, &[1, 2, 3]).await.unwrap();
        let (op, payload) = client.recv_message().await.unwrap();
        assert_eq!(op, opcode::BINARY);
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fragmented_message_with_interleaved_ping() {
        let (client, server) = pair().await;

        // Hand-rolled fragment sequence with a ping in the middle.
        {
            let mut write = client.write.lock().await;
            let mask = || rand::random::<[u8; 4]>();
            write_frame(&mut *write, false, opcode::TEXT, b"hel", Some(mask()))
                .await
                .unwrap();
            write_frame(&mut *write, true, opcode::PING, b"probe", Some(mask()))
                .await
                .unwrap();
            write_frame(&mut *write, true, opcode::CONTINUATION, b"lo", Some(mask()))
                .await
                .unwrap();
        }

        let (op, payload) = server.recv_message().await.unwrap();
        assert_eq!(op, opcode::TEXT);
        assert_eq!(payload, b"hello");

        // The ping was answered without disturbing the open message.
        let (op, payload) = {
            let mut guard = client.read.lock().await;
            let read = &mut *guard;
            let frame = read.decoder.read_frame(&mut read.stream).await.unwrap();
            (frame.opcode, frame.payload)
        };
        assert_eq!(op, opcode::PONG);
        assert_eq!(payload, b"probe");
    }

    #[tokio::test]
    async fn byte_stream_read_spans_frames() {
        let (client, server) = pair().await;
        client.write(b"abc").await.unwrap();
        client.write(b"defgh").await.unwrap();

        let mut buf = [0u8; 2];
        let mut collected = Vec::new();
        while collected.len() < 8 {
            let n = server.read(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"abcdefgh");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, server) = pair().await;
        client.close(CLOSE_NORMAL, "done").await.unwrap();
        client.close(CLOSE_NORMAL, "done again").await.unwrap();

        match server.recv_message().await {
            Err(Error::Closed { code, reason }) => {
                assert_eq!(code, Some(CLOSE_NORMAL));
                assert_eq!(reason, "done");
            }
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(matches!(
            client.send(opcode::TEXT, b"late").await,
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn url_parsing() {
        assert_eq!(
            parse_url("ws://example.test/gateway").unwrap(),
            ("example.test".to_string(), 80, "/gateway".to_string())
        );
        assert_eq!(
            parse_url("ws://127.0.0.1:9443").unwrap(),
            ("127.0.0.1".to_string(), 9443, "/".to_string())
        );
        assert!(matches!(
            parse_url("wss://secure.test/gateway"),
            Err(Error::BadScheme(_))
        ));
        assert!(matches!(parse_url("example.test"), Err(Error::BadUrl(_))));
    }
}
