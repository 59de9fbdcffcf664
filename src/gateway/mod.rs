pub mod events;
pub mod intents;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::rest::RestClient;
use crate::voice::{VoiceConnection, VoiceParams};
use crate::ws::frame::opcode as frame_opcode;
use crate::ws::{conn, WsConn, CLOSE_NORMAL};
use events::{Event, GatewayMessage, Hello, Identify, IdentifyProperties, Resume, StatusUpdate};

/// Bounded wait for the first READY after identify.
const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounded wait for the voice state/server update pair after a join request.
const VOICE_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(120);

/// Connection lifecycle of a gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Reconnecting,
    Resuming,
}

type Handler = dyn Fn(&Event) + Send + Sync;

/// Fields behind the single session-scoped lock. Event dispatch and the
/// heartbeat timer mutate these concurrently with caller-issued writes.
struct Shared {
    session_id: Option<String>,
    user_id: Option<String>,
    gateway_url: Option<String>,
    last_heartbeat_sent: Instant,
    last_heartbeat_ack: Instant,
    /// Terminal error held for the caller when the supervisor gives up.
    last_error: Option<Error>,
}

#[derive(Default)]
struct PendingVoice {
    session_tx: Option<oneshot::Sender<String>>,
    server_tx: Option<oneshot::Sender<events::VoiceServerUpdate>>,
}

/// One shard's gateway session: a resumable control-plane connection with
/// heartbeat liveness, sequence tracking, and typed event dispatch. Multiple
/// sessions are independently instantiable; nothing here is global.
pub struct Session {
    config: Config,
    rest: RestClient,
    shared: StdMutex<Shared>,
    /// Resumption cursor. Monotonically non-decreasing per session.
    sequence: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    handlers: StdRwLock<Vec<Arc<Handler>>>,
    writer_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    cancel: StdMutex<Option<CancellationToken>>,
    voice: DashMap<String, Arc<VoiceConnection>>,
    pending_voice: StdMutex<HashMap<String, PendingVoice>>,
}

impl Session {
    pub fn new(config: Config) -> Arc<Self> {
        let rest = RestClient::new(&config.api_base, &config.token);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let now = Instant::now();
        Arc::new(Self {
            config,
            rest,
            shared: StdMutex::new(Shared {
                session_id: None,
                user_id: None,
                gateway_url: None,
                last_heartbeat_sent: now,
                last_heartbeat_ack: now,
                last_error: None,
            }),
            sequence: AtomicU64::new(0),
            state_tx,
            handlers: StdRwLock::new(Vec::new()),
            writer_tx: StdMutex::new(None),
            cancel: StdMutex::new(None),
            voice: DashMap::new(),
            pending_voice: StdMutex::new(HashMap::new()),
        })
    }

    /// Register an event handler. Handlers run on the read loop when the
    /// session is configured for synchronous dispatch (ordered, but a slow
    /// handler stalls later events), otherwise each invocation is spawned.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers.write().unwrap().push(Arc::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Current resumption cursor.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().unwrap().session_id.clone()
    }

    /// The terminal error, if the session stopped on its own (for example
    /// an exhausted reconnect budget). Taking it clears it; a session
    /// closed by the caller holds none.
    pub fn take_error(&self) -> Option<Error> {
        self.shared.lock().unwrap().last_error.take()
    }

    /// Open the gateway connection: fetch (or reuse) the gateway url,
    /// perform hello/identify, then run the read, write, and heartbeat loops
    /// until [`Session::close`] or an unrecoverable failure. Returns once the
    /// session is Ready.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        if self.writer_tx.lock().unwrap().is_some() {
            return Err(Error::AlreadyOpen);
        }
        if self.config.shard_count > 0 && self.config.shard_id >= self.config.shard_count {
            return Err(Error::ShardBounds);
        }
        self.shared.lock().unwrap().last_error = None;

        let url = match self.cached_gateway_url() {
            Some(url) => url,
            None => {
                let url = match &self.config.gateway_url {
                    Some(url) => url.clone(),
                    None => self.rest.gateway_bot().await?.url,
                };
                self.shared.lock().unwrap().gateway_url = Some(url.clone());
                url
            }
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let (conn, heartbeat_interval) = self.connect_attempt(&url, false).await?;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run(conn, heartbeat_interval, cancel).await;
        });

        let mut state_rx = self.state_tx.subscribe();
        tokio::time::timeout(
            READY_TIMEOUT,
            state_rx.wait_for(|s| *s == ConnectionState::Ready),
        )
        .await
        .map_err(|_| Error::Timeout("gateway ready"))?
        .map_err(|_| Error::NotConnected)?;
        Ok(())
    }

    /// Tear the session down: cancel every loop (including attached voice
    /// connections), close the socket, and settle in Disconnected.
    pub async fn close(&self) -> Result<()> {
        let cancel = self.cancel.lock().unwrap().take();
        let cancel = cancel.ok_or(Error::NotConnected)?;
        cancel.cancel();

        let guilds: Vec<String> = self.voice.iter().map(|e| e.key().clone()).collect();
        for guild_id in guilds {
            if let Some((_, vc)) = self.voice.remove(&guild_id) {
                vc.disconnect().await;
            }
        }

        self.writer_tx.lock().unwrap().take();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        Ok(())
    }

    /// Send a live presence update.
    pub fn update_status(&self, status: StatusUpdate) -> Result<()> {
        self.enqueue(
            json!({
                "op": events::opcode::STATUS_UPDATE,
                "d": status,
            })
            .to_string(),
        )
    }

    /// Join (or move to) a voice channel in a guild and negotiate the voice
    /// connection: requests the voice state change over the gateway, waits
    /// for the state/server update pair, then hands off to voice signaling.
    pub async fn voice_channel_join(
        self: &Arc<Self>,
        guild_id: &str,
        channel_id: &str,
        mute: bool,
        deaf: bool,
    ) -> Result<Arc<VoiceConnection>> {
        if let Some(existing) = self.voice.get(guild_id) {
            let vc = Arc::clone(existing.value());
            drop(existing);
            self.send_voice_state(guild_id, Some(channel_id), mute, deaf)?;
            vc.set_channel(channel_id);
            return Ok(vc);
        }

        let (session_tx, session_rx) = oneshot::channel();
        let (server_tx, server_rx) = oneshot::channel();
        self.pending_voice.lock().unwrap().insert(
            guild_id.to_string(),
            PendingVoice {
                session_tx: Some(session_tx),
                server_tx: Some(server_tx),
            },
        );

        let result = async {
            self.send_voice_state(guild_id, Some(channel_id), mute, deaf)?;
            let voice_session_id = tokio::time::timeout(VOICE_JOIN_TIMEOUT, session_rx)
                .await
                .map_err(|_| Error::Timeout("voice state update"))?
                .map_err(|_| Error::NotConnected)?;
            let server = tokio::time::timeout(VOICE_JOIN_TIMEOUT, server_rx)
                .await
                .map_err(|_| Error::Timeout("voice server update"))?
                .map_err(|_| Error::NotConnected)?;
            Ok::<_, Error>((voice_session_id, server))
        }
        .await;
        self.pending_voice.lock().unwrap().remove(guild_id);
        let (voice_session_id, server) = result?;

        let endpoint = server
            .endpoint
            .ok_or(Error::Protocol("voice server update without endpoint"))?;
        let user_id = self
            .shared
            .lock()
            .unwrap()
            .user_id
            .clone()
            .ok_or(Error::Protocol("ready carried no user id"))?;

        let cancel = self
            .cancel
            .lock()
            .unwrap()
            .as_ref()
            .ok_or(Error::NotConnected)?
            .child_token();

        let vc = VoiceConnection::connect(
            VoiceParams {
                guild_id: guild_id.to_string(),
                channel_id: channel_id.to_string(),
                user_id,
                session_id: voice_session_id,
                token: server.token,
                endpoint,
                mute,
                deaf,
            },
            cancel,
        )
        .await?;
        self.voice.insert(guild_id.to_string(), Arc::clone(&vc));
        Ok(vc)
    }

    /// Leave the voice channel in a guild and tear down its voice connection.
    pub async fn voice_channel_leave(&self, guild_id: &str) -> Result<()> {
        self.send_voice_state(guild_id, None, false, false)?;
        if let Some((_, vc)) = self.voice.remove(guild_id) {
            vc.disconnect().await;
        }
        Ok(())
    }

    /// Ask the gateway for a guild's member list; results arrive as
    /// dispatched events. An empty query with limit 0 requests everyone.
    pub fn request_guild_members(&self, guild_id: &str, query: &str, limit: u32) -> Result<()> {
        self.enqueue(
            json!({
                "op": events::opcode::REQUEST_MEMBERS,
                "d": {"guild_id": guild_id, "query": query, "limit": limit},
            })
            .to_string(),
        )
    }

    fn send_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        mute: bool,
        deaf: bool,
    ) -> Result<()> {
        self.enqueue(
            json!({
                "op": events::opcode::VOICE_STATE_UPDATE,
                "d": {
                    "guild_id": guild_id,
                    "channel_id": channel_id,
                    "self_mute": mute,
                    "self_deaf": deaf,
                },
            })
            .to_string(),
        )
    }

    fn cached_gateway_url(&self) -> Option<String> {
        self.shared.lock().unwrap().gateway_url.clone()
    }

    /// Queue one outbound message. Everything the session emits (identify,
    /// resume, heartbeats, presence and voice state updates) goes through
    /// this single per-connection write queue; ordering is queue order.
    fn enqueue(&self, text: String) -> Result<()> {
        let guard = self.writer_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(text).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    /// Dial the gateway, consume HELLO, and send identify (or resume when a
    /// session id and cursor are held and `resume` is requested).
    async fn connect_attempt(
        &self,
        url: &str,
        resume: bool,
    ) -> Result<(Arc<WsConn<tokio::net::TcpStream>>, u64)> {
        self.state_tx.send_replace(ConnectionState::Connecting);

        let (host, _, _) = conn::parse_url(url)?;
        let origin = format!("http://{host}");
        let ws = Arc::new(WsConn::dial(url, &origin).await?);

        let (_, payload) = tokio::time::timeout(READY_TIMEOUT, ws.recv_message())
            .await
            .map_err(|_| Error::Timeout("gateway hello"))??;
        let envelope: GatewayMessage = serde_json::from_slice(&payload)?;
        if envelope.op != events::opcode::HELLO {
            return Err(Error::Protocol("expected hello"));
        }
        let hello: Hello =
            serde_json::from_value(envelope.data.ok_or(Error::Protocol("hello without data"))?)?;

        {
            let mut shared = self.shared.lock().unwrap();
            let now = Instant::now();
            shared.last_heartbeat_sent = now;
            shared.last_heartbeat_ack = now;
        }

        let resume_payload = if resume {
            self.shared.lock().unwrap().session_id.clone().map(|sid| Resume {
                token: self.config.token.clone(),
                session_id: sid,
                seq: self.sequence.load(Ordering::SeqCst),
            })
        } else {
            None
        };

        let text = match resume_payload {
            Some(resume) => {
                self.state_tx.send_replace(ConnectionState::Resuming);
                tracing::info!(seq = resume.seq, "resuming gateway session");
                json!({"op": events::opcode::RESUME, "d": resume}).to_string()
            }
            None => {
                self.state_tx.send_replace(ConnectionState::Identifying);
                json!({"op": events::opcode::IDENTIFY, "d": self.identify_payload()}).to_string()
            }
        };
        ws.send(frame_opcode::TEXT, text.as_bytes()).await?;

        Ok((ws, hello.heartbeat_interval))
    }

    fn identify_payload(&self) -> Identify {
        Identify {
            token: self.config.token.clone(),
            properties: IdentifyProperties::default(),
            compress: false,
            large_threshold: 250,
            shard: (self.config.shard_count > 1)
                .then_some([self.config.shard_id, self.config.shard_count]),
            presence: self.config.presence.clone(),
            intents: self.config.intents,
        }
    }

    /// Connection supervisor: drives one connection's loops, then walks the
    /// reconnect/resume path with capped exponential backoff until the retry
    /// budget is spent or the session is closed.
    async fn run(
        self: Arc<Self>,
        mut ws: Arc<WsConn<tokio::net::TcpStream>>,
        mut heartbeat_interval: u64,
        cancel: CancellationToken,
    ) {
        loop {
            self.run_connection(Arc::clone(&ws), heartbeat_interval, &cancel)
                .await;
            let _ = ws.close(CLOSE_NORMAL, "").await;
            self.writer_tx.lock().unwrap().take();

            if cancel.is_cancelled() {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }

            self.state_tx.send_replace(ConnectionState::Reconnecting);
            let url = match self.cached_gateway_url() {
                Some(url) => url,
                None => {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
            };

            let mut wait = RECONNECT_BASE;
            let mut attempts = 0u32;
            let next = loop {
                if attempts >= self.config.max_reconnect_attempts {
                    tracing::error!(
                        attempts,
                        "gateway reconnect budget exhausted, giving up"
                    );
                    self.shared.lock().unwrap().last_error = Some(Error::ReconnectExhausted);
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    self.dispatch(Event::Disconnect);
                    return;
                }
                attempts += 1;

                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                match self.connect_attempt(&url, true).await {
                    Ok(pair) => break pair,
                    Err(err) => {
                        tracing::warn!(%err, attempt = attempts, "gateway reconnect failed");
                        wait = (wait * 2).min(RECONNECT_CAP);
                    }
                }
            };
            ws = next.0;
            heartbeat_interval = next.1;
        }
    }

    /// Drive one live connection: a writer task draining the write queue, a
    /// heartbeat task, and the read loop inline. Returns when any of them
    /// fails or the session is cancelled.
    async fn run_connection(
        self: &Arc<Self>,
        ws: Arc<WsConn<tokio::net::TcpStream>>,
        heartbeat_interval: u64,
        cancel: &CancellationToken,
    ) {
        let conn_cancel = cancel.child_token();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.writer_tx.lock().unwrap() = Some(tx);

        let writer_ws = Arc::clone(&ws);
        let writer_cancel = conn_cancel.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(text) => {
                            if let Err(err) = writer_ws.send(frame_opcode::TEXT, text.as_bytes()).await {
                                tracing::warn!(%err, "gateway write failed");
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let hb_session = Arc::clone(self);
        let hb_cancel = conn_cancel.clone();
        let heartbeat = tokio::spawn(async move {
            hb_session.heartbeat_loop(heartbeat_interval, hb_cancel).await;
        });

        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => break,
                msg = ws.recv_message() => match msg {
                    Ok((_, payload)) => {
                        if let Err(err) = self.handle_message(&payload) {
                            tracing::warn!(%err, "gateway connection error");
                            break;
                        }
                    }
                    Err(Error::Closed { code: Some(code), reason }) => {
                        tracing::warn!(
                            code,
                            detail = events::close_code::describe(code),
                            %reason,
                            "gateway closed by remote"
                        );
                        break;
                    }
                    Err(err) => {
                        if err.is_connection_fatal() {
                            tracing::warn!(%err, "gateway read failed");
                        }
                        break;
                    }
                },
            }
        }

        conn_cancel.cancel();
        let _ = writer.await;
        let _ = heartbeat.await;
    }

    /// Periodic liveness probe. Each tick first checks that the previous
    /// heartbeat was acknowledged; a missing ack is the sole liveness signal
    /// and forces a reconnect.
    async fn heartbeat_loop(self: Arc<Self>, interval_ms: u64, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let stale = {
                let shared = self.shared.lock().unwrap();
                shared.last_heartbeat_sent > shared.last_heartbeat_ack
            };
            if stale {
                tracing::warn!("heartbeat ack missing, treating connection as stale");
                cancel.cancel();
                return;
            }

            let seq = self.sequence.load(Ordering::SeqCst);
            let d = if seq == 0 { Value::Null } else { json!(seq) };
            if self
                .enqueue(json!({"op": events::opcode::HEARTBEAT, "d": d}).to_string())
                .is_err()
            {
                return;
            }
            self.shared.lock().unwrap().last_heartbeat_sent = Instant::now();
        }
    }

    /// Demultiplex one inbound gateway message.
    fn handle_message(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let envelope: GatewayMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, "discarding undecodable gateway message");
                return Ok(());
            }
        };

        match envelope.op {
            events::opcode::DISPATCH => {
                if let Some(seq) = envelope.seq {
                    self.update_sequence(seq);
                }
                let event_type = envelope.event_type.unwrap_or_default();
                let event = Event::parse(&event_type, envelope.data.unwrap_or(Value::Null));
                self.handle_dispatch(&event);
                self.dispatch(event);
                Ok(())
            }
            events::opcode::HEARTBEAT => {
                // The remote may request an immediate beat.
                let seq = self.sequence.load(Ordering::SeqCst);
                let d = if seq == 0 { Value::Null } else { json!(seq) };
                let _ = self.enqueue(json!({"op": events::opcode::HEARTBEAT, "d": d}).to_string());
                Ok(())
            }
            events::opcode::HEARTBEAT_ACK => {
                self.record_heartbeat_ack();
                Ok(())
            }
            events::opcode::RECONNECT => Err(Error::Closed {
                code: None,
                reason: "reconnect requested by gateway".to_string(),
            }),
            events::opcode::INVALID_SESSION => {
                let resumable = envelope
                    .data
                    .as_ref()
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                tracing::info!(resumable, "gateway invalidated the session");
                if !resumable {
                    self.shared.lock().unwrap().session_id = None;
                    self.sequence.store(0, Ordering::SeqCst);
                }
                self.state_tx.send_replace(ConnectionState::Identifying);
                self.enqueue(
                    json!({"op": events::opcode::IDENTIFY, "d": self.identify_payload()})
                        .to_string(),
                )
            }
            events::opcode::HELLO => Ok(()),
            other => {
                tracing::debug!(op = other, "ignoring unknown gateway opcode");
                Ok(())
            }
        }
    }

    /// Session-internal reactions to dispatched events, before handlers see
    /// them.
    fn handle_dispatch(self: &Arc<Self>, event: &Event) {
        match event {
            Event::Ready(ready) => {
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.session_id = Some(ready.session_id.clone());
                    if ready.user_id.is_some() {
                        shared.user_id = ready.user_id.clone();
                    }
                }
                self.state_tx.send_replace(ConnectionState::Ready);
                tracing::info!(session_id = %ready.session_id, "gateway session ready");
                self.dispatch(Event::Connect);
            }
            Event::Resumed => {
                self.state_tx.send_replace(ConnectionState::Ready);
                tracing::info!("gateway session resumed");
            }
            Event::VoiceStateUpdate(vs) => {
                let ours = {
                    let shared = self.shared.lock().unwrap();
                    match &shared.user_id {
                        Some(uid) => *uid == vs.user_id,
                        None => true,
                    }
                };
                if ours {
                    let mut pending = self.pending_voice.lock().unwrap();
                    if let Some(entry) = pending.get_mut(&vs.guild_id) {
                        if let Some(tx) = entry.session_tx.take() {
                            let _ = tx.send(vs.session_id.clone());
                        }
                    }
                }
            }
            Event::VoiceServerUpdate(vsu) => {
                let mut pending = self.pending_voice.lock().unwrap();
                if let Some(entry) = pending.get_mut(&vsu.guild_id) {
                    if let Some(tx) = entry.server_tx.take() {
                        let _ = tx.send(vsu.clone());
                    }
                }
            }
            _ => {}
        }
    }

    /// Advance the resumption cursor. Never decrements.
    fn update_sequence(&self, seq: u64) {
        self.sequence.fetch_max(seq, Ordering::SeqCst);
    }

    /// Record a heartbeat acknowledgment. The stored timestamp never
    /// regresses.
    fn record_heartbeat_ack(&self) {
        let mut shared = self.shared.lock().unwrap();
        let now = Instant::now();
        if now > shared.last_heartbeat_ack {
            shared.last_heartbeat_ack = now;
        }
    }

    /// Deliver an event to every registered handler, either inline on the
    /// read loop or spawned, per the session configuration.
    fn dispatch(self: &Arc<Self>, event: Event) {
        let handlers: Vec<Arc<Handler>> = self.handlers.read().unwrap().clone();
        if self.config.sync_dispatch {
            for handler in &handlers {
                handler(&event);
            }
        } else {
            for handler in handlers {
                let event = event.clone();
                tokio::spawn(async move {
                    handler(&event);
                });
            }
        }
    }
}
