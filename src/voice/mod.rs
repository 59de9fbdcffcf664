pub mod crypto;
pub mod events;
pub mod rtp;
pub mod udp;

pub use udp::VoicePacket;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::json;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ws::frame::opcode as frame_opcode;
use crate::ws::{WsConn, CLOSE_NORMAL};
use events::{
    SelectProtocol, SelectProtocolData, SessionDescription, Speaking, VoiceHello, VoiceIdentify,
    VoiceMessage, VoiceReady, VoiceResume,
};

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of a voice connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceConnectionState {
    Idle,
    SignalingConnect,
    UdpDiscovery,
    AwaitingSessionDescription,
    Ready,
    Speaking,
    Reconnecting,
}

/// Connection parameters handed over by the gateway session after the voice
/// state/server update pair.
#[derive(Debug, Clone)]
pub struct VoiceParams {
    pub guild_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
    pub mute: bool,
    pub deaf: bool,
}

type SpeakingHandler = dyn Fn(&Speaking) + Send + Sync;

/// A negotiated voice connection: a signaling websocket plus a UDP media
/// path with per-packet authenticated encryption.
///
/// Audio in: push pre-encoded opus frames into [`VoiceConnection::sender`];
/// a dedicated loop owns the sequence/timestamp counters, encrypts, and
/// paces one datagram per frame interval. Audio out: decrypted packets
/// arrive on the bounded channel from [`VoiceConnection::take_receiver`].
pub struct VoiceConnection {
    guild_id: String,
    channel_id: StdMutex<String>,
    user_id: String,
    session_id: String,
    token: String,
    endpoint: String,
    ssrc: u32,
    ws: StdMutex<Arc<WsConn<TcpStream>>>,
    state_tx: watch::Sender<VoiceConnectionState>,
    opus_tx: mpsc::Sender<Vec<u8>>,
    packet_rx: StdMutex<Option<mpsc::Receiver<VoicePacket>>>,
    speaking: AtomicBool,
    auth_failures: Arc<AtomicU64>,
    /// (last sent, last acked) voice heartbeat timestamps.
    heartbeats: StdMutex<(Instant, Instant)>,
    /// Terminal error held for the caller when the resume budget runs out.
    last_error: StdMutex<Option<Error>>,
    speaking_handlers: StdRwLock<Vec<Arc<SpeakingHandler>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl VoiceConnection {
    /// Negotiate a voice connection end to end: signaling identify, ready +
    /// hello, UDP address discovery, protocol selection, session
    /// description, then spawn the signaling, heartbeat, and media loops.
    pub async fn connect(params: VoiceParams, cancel: CancellationToken) -> Result<Arc<Self>> {
        let (state_tx, _) = watch::channel(VoiceConnectionState::SignalingConnect);

        let ws = Arc::new(dial_signaling(&params.endpoint).await?);
        let identify = VoiceIdentify {
            server_id: params.guild_id.clone(),
            user_id: params.user_id.clone(),
            session_id: params.session_id.clone(),
            token: params.token.clone(),
        };
        send_signal(&ws, events::opcode::IDENTIFY, json!(identify)).await?;

        // READY and HELLO arrive in either order.
        let mut ready: Option<VoiceReady> = None;
        let mut hello: Option<VoiceHello> = None;
        while ready.is_none() || hello.is_none() {
            let msg = recv_signal(&ws).await?;
            match msg.op {
                events::opcode::READY => {
                    ready = Some(serde_json::from_value(
                        msg.data.ok_or(Error::Protocol("voice ready without data"))?,
                    )?);
                }
                events::opcode::HELLO => {
                    hello = Some(serde_json::from_value(
                        msg.data.ok_or(Error::Protocol("voice hello without data"))?,
                    )?);
                }
                _ => {}
            }
        }
        let (ready, hello) = match (ready, hello) {
            (Some(ready), Some(hello)) => (ready, hello),
            _ => return Err(Error::Protocol("voice negotiation incomplete")),
        };

        if !ready.modes.is_empty() && !ready.modes.iter().any(|m| m == crypto::ENCRYPTION_MODE) {
            return Err(Error::Protocol("voice endpoint does not offer our encryption mode"));
        }

        state_tx.send_replace(VoiceConnectionState::UdpDiscovery);
        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        let media_host = match &ready.ip {
            Some(ip) => ip.clone(),
            None => endpoint_host(&params.endpoint),
        };
        udp.connect((media_host.as_str(), ready.port)).await?;
        let (external_addr, external_port) = udp::discover_external_addr(&udp, ready.ssrc).await?;

        let select = SelectProtocol {
            protocol: "udp".to_string(),
            data: SelectProtocolData {
                address: external_addr,
                port: external_port,
                mode: crypto::ENCRYPTION_MODE.to_string(),
            },
        };
        send_signal(&ws, events::opcode::SELECT_PROTOCOL, json!(select)).await?;

        state_tx.send_replace(VoiceConnectionState::AwaitingSessionDescription);
        let description: SessionDescription = loop {
            let msg = recv_signal(&ws).await?;
            if msg.op == events::opcode::SESSION_DESCRIPTION {
                break serde_json::from_value(
                    msg.data
                        .ok_or(Error::Protocol("session description without data"))?,
                )?;
            }
        };
        if description.mode != crypto::ENCRYPTION_MODE {
            return Err(Error::Protocol("voice endpoint selected an unexpected mode"));
        }
        let key: [u8; crypto::KEY_LEN] = description
            .secret_key
            .as_slice()
            .try_into()
            .map_err(|_| Error::Protocol("session description key has wrong length"))?;
        let cipher = Arc::new(crypto::PacketCipher::new(&key));

        let udp = Arc::new(udp);
        let (opus_tx, opus_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (packet_tx, packet_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let auth_failures = Arc::new(AtomicU64::new(0));
        let now = Instant::now();

        let vc = Arc::new(Self {
            guild_id: params.guild_id,
            channel_id: StdMutex::new(params.channel_id),
            user_id: params.user_id,
            session_id: params.session_id,
            token: params.token,
            endpoint: params.endpoint,
            ssrc: ready.ssrc,
            ws: StdMutex::new(Arc::clone(&ws)),
            state_tx,
            opus_tx,
            packet_rx: StdMutex::new(Some(packet_rx)),
            speaking: AtomicBool::new(false),
            auth_failures: Arc::clone(&auth_failures),
            heartbeats: StdMutex::new((now, now)),
            last_error: StdMutex::new(None),
            speaking_handlers: StdRwLock::new(Vec::new()),
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(udp::send_loop(
            Arc::clone(&udp),
            Arc::clone(&cipher),
            ready.ssrc,
            opus_rx,
            cancel.clone(),
        ));
        tokio::spawn(udp::recv_loop(
            udp,
            cipher,
            packet_tx,
            auth_failures,
            cancel.clone(),
        ));

        let hb = Arc::clone(&vc);
        let hb_cancel = cancel.clone();
        let interval_ms = (hello.heartbeat_interval as u64).max(1);
        tokio::spawn(async move {
            hb.heartbeat_loop(interval_ms, hb_cancel).await;
        });

        let sig = Arc::clone(&vc);
        tokio::spawn(async move {
            sig.signaling_loop(cancel).await;
        });

        vc.state_tx.send_replace(VoiceConnectionState::Ready);
        tracing::info!(guild_id = %vc.guild_id, ssrc = vc.ssrc, "voice connection ready");
        Ok(vc)
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn channel_id(&self) -> String {
        self.channel_id.lock().unwrap().clone()
    }

    pub(crate) fn set_channel(&self, channel_id: &str) {
        *self.channel_id.lock().unwrap() = channel_id.to_string();
        self.speaking.store(false, Ordering::SeqCst);
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn state(&self) -> VoiceConnectionState {
        *self.state_tx.borrow()
    }

    /// Bounded channel for pre-encoded opus frames. A full channel exerts
    /// backpressure on the producer.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.opus_tx.clone()
    }

    /// Take the receive side for decrypted inbound packets. Yields `None`
    /// after the first call.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<VoicePacket>> {
        self.packet_rx.lock().unwrap().take()
    }

    /// Packets dropped because they failed authentication.
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    /// The terminal error, if the connection tore itself down (for example
    /// an exhausted resume budget). Taking it clears it.
    pub fn take_error(&self) -> Option<Error> {
        self.last_error.lock().unwrap().take()
    }

    pub fn add_speaking_handler<F>(&self, handler: F)
    where
        F: Fn(&Speaking) + Send + Sync + 'static,
    {
        self.speaking_handlers.write().unwrap().push(Arc::new(handler));
    }

    /// Toggle the speaking indicator. Send true before the first audio
    /// packet of a burst and false after the last. A failed "stop speaking"
    /// is swallowed so it can never block media teardown.
    pub async fn speaking(&self, on: bool) -> Result<()> {
        let payload = json!({
            "op": events::opcode::SPEAKING,
            "d": {"speaking": on, "delay": 0, "ssrc": self.ssrc},
        });
        let ws = self.current_ws();
        match ws.send(frame_opcode::TEXT, payload.to_string().as_bytes()).await {
            Ok(()) => {
                self.speaking.store(on, Ordering::SeqCst);
                self.state_tx.send_replace(if on {
                    VoiceConnectionState::Speaking
                } else {
                    VoiceConnectionState::Ready
                });
                Ok(())
            }
            Err(err) => {
                self.speaking.store(false, Ordering::SeqCst);
                if on {
                    Err(err)
                } else {
                    tracing::debug!(%err, "stop-speaking signal lost, continuing teardown");
                    Ok(())
                }
            }
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Cancel every loop and close the signaling socket. Idempotent, and
    /// still effective when the owning session's token was cancelled
    /// first.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_speaking() {
            let _ = self.speaking(false).await;
        }
        self.cancel.cancel();
        let _ = self.current_ws().close(CLOSE_NORMAL, "disconnect").await;
        self.state_tx.send_replace(VoiceConnectionState::Idle);
        tracing::info!(guild_id = %self.guild_id, "voice connection closed");
    }

    fn current_ws(&self) -> Arc<WsConn<TcpStream>> {
        Arc::clone(&self.ws.lock().unwrap())
    }

    /// Signaling read loop with the resume discipline: on loss, reconnect to
    /// the same voice endpoint with capped backoff and a bounded attempt
    /// budget, resuming the existing session.
    async fn signaling_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let ws = self.current_ws();
            let err = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = ws.recv_message() => match msg {
                        Ok((_, payload)) => self.handle_signal(&payload),
                        Err(err) => break err,
                    },
                }
            };
            if cancel.is_cancelled() {
                return;
            }
            tracing::warn!(%err, guild_id = %self.guild_id, "voice signaling lost");
            self.state_tx.send_replace(VoiceConnectionState::Reconnecting);

            let mut wait = RECONNECT_BASE;
            let mut attempts = 0u32;
            let resumed = loop {
                if attempts >= MAX_RECONNECT_ATTEMPTS {
                    break false;
                }
                attempts += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                match self.resume_signaling().await {
                    Ok(ws) => {
                        *self.ws.lock().unwrap() = Arc::new(ws);
                        break true;
                    }
                    Err(err) => {
                        tracing::warn!(%err, attempt = attempts, "voice resume failed");
                        wait = (wait * 2).min(RECONNECT_CAP);
                    }
                }
            };

            if !resumed {
                tracing::error!(guild_id = %self.guild_id, "voice reconnect budget exhausted");
                *self.last_error.lock().unwrap() = Some(Error::ReconnectExhausted);
                cancel.cancel();
                self.state_tx.send_replace(VoiceConnectionState::Idle);
                return;
            }
            {
                let mut hb = self.heartbeats.lock().unwrap();
                let now = Instant::now();
                *hb = (now, now);
            }
            self.state_tx.send_replace(VoiceConnectionState::Ready);
            tracing::info!(guild_id = %self.guild_id, "voice signaling resumed");
        }
    }

    /// One resume attempt: fresh signaling connection, resume payload,
    /// bounded wait for the resumed ack.
    async fn resume_signaling(&self) -> Result<WsConn<TcpStream>> {
        let ws = dial_signaling(&self.endpoint).await?;
        let resume = VoiceResume {
            server_id: self.guild_id.clone(),
            session_id: self.session_id.clone(),
            token: self.token.clone(),
        };
        send_signal(&ws, events::opcode::RESUME, json!(resume)).await?;
        loop {
            let msg = recv_signal(&ws).await?;
            if msg.op == events::opcode::RESUMED {
                return Ok(ws);
            }
        }
    }

    fn handle_signal(&self, payload: &[u8]) {
        let msg: VoiceMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, "discarding undecodable voice message");
                return;
            }
        };
        match msg.op {
            events::opcode::HEARTBEAT_ACK => {
                let mut hb = self.heartbeats.lock().unwrap();
                let now = Instant::now();
                if now > hb.1 {
                    hb.1 = now;
                }
            }
            events::opcode::SPEAKING => {
                if let Some(data) = msg.data {
                    if let Ok(speaking) = serde_json::from_value::<Speaking>(data) {
                        let handlers: Vec<Arc<SpeakingHandler>> =
                            self.speaking_handlers.read().unwrap().clone();
                        for handler in handlers {
                            handler(&speaking);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Voice heartbeat: same recency-based liveness rule as the gateway,
    /// scoped to the signaling connection.
    async fn heartbeat_loop(self: Arc<Self>, interval_ms: u64, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.state() == VoiceConnectionState::Reconnecting {
                continue;
            }

            let stale = {
                let hb = self.heartbeats.lock().unwrap();
                hb.0 > hb.1
            };
            if stale {
                tracing::warn!(guild_id = %self.guild_id, "voice heartbeat ack missing");
                let _ = self.current_ws().close(CLOSE_NORMAL, "heartbeat timeout").await;
                continue;
            }

            let nonce = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let payload = json!({"op": events::opcode::HEARTBEAT, "d": nonce});
            let ws = self.current_ws();
            if let Err(err) = ws.send(frame_opcode::TEXT, payload.to_string().as_bytes()).await {
                tracing::debug!(%err, "voice heartbeat write failed");
                continue;
            }
            self.heartbeats.lock().unwrap().0 = Instant::now();
        }
    }
}

async fn dial_signaling(endpoint: &str) -> Result<WsConn<TcpStream>> {
    let url = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let host = endpoint_host(endpoint);
    WsConn::dial(&url, &format!("http://{host}")).await
}

async fn send_signal(
    ws: &WsConn<TcpStream>,
    op: u8,
    data: serde_json::Value,
) -> Result<()> {
    let payload = json!({"op": op, "d": data});
    ws.send(frame_opcode::TEXT, payload.to_string().as_bytes()).await
}

async fn recv_signal(ws: &WsConn<TcpStream>) -> Result<VoiceMessage> {
    let (_, payload) = tokio::time::timeout(NEGOTIATION_TIMEOUT, ws.recv_message())
        .await
        .map_err(|_| Error::Timeout("voice signaling"))??;
    Ok(serde_json::from_slice(&payload)?)
}

/// Bare host of a voice endpoint, with scheme, port, and path stripped.
fn endpoint_host(endpoint: &str) -> String {
    let rest = endpoint
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let rest = rest.split('/').next().unwrap_or(rest);
    match rest.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => rest.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_host_stripping() {
        assert_eq!(endpoint_host("voice.example.test"), "voice.example.test");
        assert_eq!(endpoint_host("voice.example.test:8443"), "voice.example.test");
        assert_eq!(endpoint_host("ws://voice.example.test:80/signal"), "voice.example.test");
    }
}
