use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use cordwire_codec::{EncryptionMode, PacketSealer, SecretKey};
use cordwire_core::{Backoff, Dispatcher, Subscription};
use cordwire_models::gateway::{GatewayMessage, UpdateVoiceState};
use cordwire_models::voice::{
    voice_close_action, voice_close_reason, SelectProtocol, SessionDescription, Speaking,
    SpeakingFlags, VoiceCloseAction, VoiceHello, VoiceIdentify, VoiceReady, VoiceResume,
    VoiceServerUpdate, VoiceState, VOICE_GATEWAY_VERSION, VOICE_OP_CLIENT_DISCONNECT,
    VOICE_OP_HEARTBEAT, VOICE_OP_HEARTBEAT_ACK, VOICE_OP_HELLO, VOICE_OP_IDENTIFY,
    VOICE_OP_READY, VOICE_OP_RESUME, VOICE_OP_RESUMED, VOICE_OP_SELECT_PROTOCOL,
    VOICE_OP_SESSION_DESCRIPTION, VOICE_OP_SPEAKING,
};
use cordwire_util::{ChannelId, GuildId, UserId};
use cordwire_ws::transport::{CLOSE_NORMAL, CLOSE_RESUMABLE};
use cordwire_ws::{wire, Dialer, Frame, GatewayConn, GatewayError, GatewayHandle, WsDialer};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

use crate::config::VoiceConfig;
use crate::discovery::discover;
use crate::error::VoiceError;
use crate::sender::{Link, PacedSender, SenderStats};

const TRANSPORT: &str = "voice_ws";
const COMMAND_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceConnectionState {
    Connecting,
    Identifying,
    Discovering,
    SelectingProtocol,
    Resuming,
    Running,
    Reconnecting,
    Closed,
}

/// `wss://{endpoint}/?v=4`. Endpoints arrive without a scheme.
pub fn voice_url(endpoint: &str) -> Result<Url, VoiceError> {
    let base = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("wss://{endpoint}")
    };
    let mut url = Url::parse(&base)
        .map_err(|err| VoiceError::Protocol(format!("invalid voice endpoint {endpoint:?}: {err}")))?;
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &VOICE_GATEWAY_VERSION.to_string());
    Ok(url)
}

/// The main-gateway side a voice connection needs: who we are, and a way
/// to send op 4.
pub trait VoiceGateway: Clone + Send + Sync + 'static {
    fn user_id(&self) -> Option<UserId>;

    fn update_voice_state(
        &self,
        update: &UpdateVoiceState,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

impl VoiceGateway for GatewayHandle {
    fn user_id(&self) -> Option<UserId> {
        GatewayHandle::user_id(self)
    }

    async fn update_voice_state(&self, update: &UpdateVoiceState) -> Result<(), GatewayError> {
        GatewayHandle::update_voice_state(self, update).await
    }
}

#[derive(Debug, Default)]
struct Info {
    channel_id: Option<ChannelId>,
    ssrc: Option<u32>,
    mode: Option<EncryptionMode>,
    latency: Option<Duration>,
    failure: Option<(u16, String)>,
}

#[derive(Debug, Default)]
struct Shared {
    info: Mutex<Info>,
}

impl Shared {
    fn info(&self) -> MutexGuard<'_, Info> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
enum Command {
    Speaking(SpeakingFlags),
    Leave,
}

/// Joins voice channels through one gateway shard.
pub struct VoiceConnector<G, D = WsDialer> {
    gateway: G,
    dispatcher: Dispatcher,
    dialer: D,
    config: VoiceConfig,
    cancel: CancellationToken,
}

impl<G: VoiceGateway> VoiceConnector<G, WsDialer> {
    /// `dispatcher` must be the one the shard's gateway dispatches into.
    pub fn new(gateway: G, dispatcher: Dispatcher, config: VoiceConfig) -> Self {
        Self {
            gateway,
            dispatcher,
            dialer: WsDialer::voice(),
            config,
            cancel: CancellationToken::new(),
        }
    }
}

impl<G: VoiceGateway, D: Dialer> VoiceConnector<G, D> {
    pub fn with_dialer<E: Dialer>(self, dialer: E) -> VoiceConnector<G, E> {
        VoiceConnector {
            gateway: self.gateway,
            dispatcher: self.dispatcher,
            dialer,
            config: self.config,
            cancel: self.cancel,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Join `channel_id` and return once audio can flow.
    ///
    /// Waits up to `join_timeout` for the gateway to hand out a voice
    /// server, then up to `join_timeout` again for the voice handshake.
    pub async fn join(
        self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<VoiceConnection, VoiceError> {
        let user_id = self.gateway.user_id().ok_or(VoiceError::NotReady)?;

        // Subscribed before op 4 goes out so neither reply can slip past.
        let mut states = self.dispatcher.subscribe_filtered(move |state: &VoiceState| {
            state.guild_id == Some(guild_id) && state.user_id == user_id
        });
        let mut servers = self
            .dispatcher
            .subscribe_filtered(move |server: &VoiceServerUpdate| server.guild_id == guild_id);

        let update = UpdateVoiceState {
            guild_id,
            channel_id: Some(channel_id),
            self_mute: self.config.self_mute,
            self_deaf: self.config.self_deaf,
        };
        self.gateway.update_voice_state(&update).await?;
        tracing::info!(%guild_id, %channel_id, "joining voice channel");

        let timeout = self.config.join_timeout();
        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(VoiceError::Cancelled),
            first = tokio::time::timeout(timeout, first_events(&mut states, &mut servers)) => first,
        };
        let (state, server) = match first {
            Ok(events) => events?,
            Err(_) => {
                tracing::warn!(%guild_id, timeout_ms = self.config.join_timeout_ms, "no voice server assigned");
                return Err(VoiceError::Timeout);
            }
        };

        let cancel = self.cancel.child_token();
        let (state_tx, state_rx) = watch::channel(VoiceConnectionState::Connecting);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (frames_tx, frames_rx) = mpsc::channel(self.config.frame_queue.max(1));
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let (speaking_tx, speaking_rx) = watch::channel(false);
        let shared = Arc::new(Shared::default());
        shared.info().channel_id = state.channel_id;
        let stats = Arc::new(SenderStats::default());
        let backoff = Backoff::new(self.config.backoff_min(), Some(self.config.backoff_max()));

        let span = tracing::info_span!("voice", guild_id = %guild_id);
        let sender = PacedSender::new(frames_rx, links_rx, speaking_tx, stats.clone(), cancel.clone());
        tokio::spawn(sender.run().instrument(span.clone()));

        let runner = Runner {
            gateway: self.gateway.clone(),
            dialer: self.dialer,
            config: self.config.clone(),
            guild_id,
            user_id,
            session_id: state.session_id,
            token: server.token,
            endpoint: server.endpoint,
            states,
            servers,
            commands: commands_rx,
            state: state_tx,
            shared: shared.clone(),
            links: links_tx,
            speaking: speaking_rx,
            backoff,
            cancel: cancel.clone(),
            udp: None,
            established: false,
            nonce: 0,
        };
        let task = tokio::spawn(runner.run().instrument(span));

        let connection = VoiceConnection {
            inner: Arc::new(HandleInner {
                guild_id,
                commands: commands_tx,
                frames: frames_tx,
                state: state_rx,
                shared,
                stats,
                cancel,
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        };

        match tokio::time::timeout(timeout, connection.ready()).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(err)) => {
                connection.join().await?;
                Err(err)
            }
            Err(_) => {
                tracing::warn!(%guild_id, timeout_ms = self.config.join_timeout_ms, "voice handshake timed out");
                connection.shutdown();
                let _ = connection.join().await;
                let leave = UpdateVoiceState {
                    channel_id: None,
                    ..update
                };
                if let Err(err) = self.gateway.update_voice_state(&leave).await {
                    tracing::debug!(error = %err, "failed to leave after handshake timeout");
                }
                Err(VoiceError::Timeout)
            }
        }
    }
}

/// The first VOICE_STATE_UPDATE placing us in a channel and the first
/// VOICE_SERVER_UPDATE carrying an endpoint, in whichever order they come.
async fn first_events(
    states: &mut Subscription<VoiceState>,
    servers: &mut Subscription<VoiceServerUpdate>,
) -> Result<(VoiceState, VoiceServerUpdate), VoiceError> {
    let state = loop {
        let state = states.recv().await.ok_or(VoiceError::Closed)?;
        if state.channel_id.is_some() {
            break state;
        }
    };
    loop {
        let server = servers.recv().await.ok_or(VoiceError::Closed)?;
        if server.endpoint.is_some() {
            return Ok((state, server));
        }
        tracing::debug!("voice server not allocated yet");
    }
}

enum Outcome {
    /// Reconnect and resume, keeping UDP and keys.
    Resume,
    /// Reconnect and identify from scratch.
    Reconnect,
    /// The endpoint went away; wait for a new one.
    AwaitServer,
    /// A new endpoint arrived; identify there immediately.
    NewServer,
    /// The caller asked to leave.
    Leave,
    /// We were moved out of voice by someone else.
    Left,
    Fatal { code: u16, reason: String },
    Cancelled,
}

enum Idle {
    Elapsed,
    NewServer,
    Leave,
    Left,
    Cancelled,
}

enum Greeting {
    Hello(Duration),
    Closed { code: u16, reason: String },
}

/// UDP side of a negotiated session.
struct UdpSession {
    ssrc: u32,
    socket: Arc<UdpSocket>,
    mode: EncryptionMode,
}

struct Runner<G, D: Dialer> {
    gateway: G,
    dialer: D,
    config: VoiceConfig,
    guild_id: GuildId,
    user_id: UserId,
    session_id: String,
    token: String,
    endpoint: Option<String>,
    states: Subscription<VoiceState>,
    servers: Subscription<VoiceServerUpdate>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<VoiceConnectionState>,
    shared: Arc<Shared>,
    links: mpsc::UnboundedSender<Option<Link>>,
    speaking: watch::Receiver<bool>,
    backoff: Backoff,
    cancel: CancellationToken,
    udp: Option<UdpSession>,
    /// SessionDescription received for `udp`; resumable from here on.
    established: bool,
    nonce: u64,
}

impl<G: VoiceGateway, D: Dialer> Runner<G, D> {
    async fn run(mut self) -> Result<(), VoiceError> {
        let mut resume = false;
        let result = loop {
            let outcome = match self.connection(resume).await {
                Ok(outcome) => outcome,
                Err(VoiceError::Cancelled) => Outcome::Cancelled,
                Err(err) => {
                    tracing::warn!(error = %err, "voice connection lost");
                    self.lost()
                }
            };

            let limit = match outcome {
                Outcome::Cancelled | Outcome::Left => break Ok(()),
                Outcome::Leave => {
                    self.send_leave().await;
                    break Ok(());
                }
                Outcome::Fatal { code, reason } => {
                    tracing::error!(code, %reason, "voice server closed with fatal code");
                    self.shared.info().failure = Some((code, reason.clone()));
                    break Err(VoiceError::Fatal { code, reason });
                }
                Outcome::NewServer => {
                    self.reset_transport();
                    resume = false;
                    continue;
                }
                Outcome::AwaitServer => {
                    self.reset_transport();
                    resume = false;
                    None
                }
                Outcome::Resume if self.established => {
                    resume = true;
                    Some(self.backoff.next_delay())
                }
                Outcome::Resume | Outcome::Reconnect => {
                    self.reset_transport();
                    resume = false;
                    Some(self.backoff.next_delay())
                }
            };

            self.set_state(VoiceConnectionState::Reconnecting);
            let awaiting_server = limit.is_none();
            let limit = limit.unwrap_or_else(|| self.config.join_timeout());
            tracing::debug!(delay_ms = limit.as_millis() as u64, resume, awaiting_server, "voice reconnect pending");
            match self.idle(limit, awaiting_server).await {
                Idle::Elapsed if awaiting_server => {
                    tracing::warn!("no new voice server assigned");
                    break Err(VoiceError::Timeout);
                }
                Idle::Elapsed => {}
                Idle::NewServer => {
                    self.reset_transport();
                    resume = false;
                }
                Idle::Leave => {
                    self.send_leave().await;
                    break Ok(());
                }
                Idle::Left | Idle::Cancelled => break Ok(()),
            }
        };

        self.reset_transport();
        // Stops the sender and fails further send_opus calls.
        self.cancel.cancel();
        self.set_state(VoiceConnectionState::Closed);
        result
    }

    fn set_state(&self, state: VoiceConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "voice state");
        }
    }

    fn lost(&self) -> Outcome {
        if self.established {
            Outcome::Resume
        } else {
            Outcome::Reconnect
        }
    }

    /// Forget the UDP session. The sender stops until a new link arrives.
    fn reset_transport(&mut self) {
        if self.udp.take().is_some() {
            let _ = self.links.send(None);
        }
        self.established = false;
        let mut info = self.shared.info();
        info.ssrc = None;
        info.mode = None;
    }

    async fn send_leave(&self) {
        let leave = UpdateVoiceState {
            guild_id: self.guild_id,
            channel_id: None,
            self_mute: self.config.self_mute,
            self_deaf: self.config.self_deaf,
        };
        match self.gateway.update_voice_state(&leave).await {
            Ok(()) => tracing::info!("left voice channel"),
            Err(err) => tracing::warn!(error = %err, "failed to send voice leave"),
        }
    }

    /// Returns `true` when the update removes us from voice.
    fn on_voice_state(&mut self, state: VoiceState) -> bool {
        let Some(channel_id) = state.channel_id else {
            tracing::info!("removed from voice channel");
            return true;
        };
        let mut info = self.shared.info();
        if info.channel_id != Some(channel_id) {
            tracing::info!(%channel_id, "moved to voice channel");
            info.channel_id = Some(channel_id);
        }
        self.session_id = state.session_id;
        false
    }

    /// Record a server update. Returns `true` when it names an endpoint we
    /// should connect to now: a different one, or any one if `any` is set.
    fn on_server_update(&mut self, server: VoiceServerUpdate, any: bool) -> bool {
        let changed = server.endpoint != self.endpoint || server.token != self.token;
        self.token = server.token;
        self.endpoint = server.endpoint;
        self.endpoint.is_some() && (changed || any)
    }

    async fn idle(&mut self, limit: Duration, awaiting_server: bool) -> Idle {
        let sleep = tokio::time::sleep(limit);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Idle::Cancelled,
                Some(command) = self.commands.recv() => match command {
                    Command::Leave => return Idle::Leave,
                    Command::Speaking(_) => tracing::debug!("speaking update dropped while disconnected"),
                },
                Some(state) = self.states.recv() => {
                    if self.on_voice_state(state) {
                        return Idle::Left;
                    }
                }
                Some(server) = self.servers.recv() => {
                    if self.on_server_update(server, awaiting_server) {
                        return Idle::NewServer;
                    }
                }
                _ = &mut sleep => return Idle::Elapsed,
            }
        }
    }

    /// Drive one voice socket from dial to close.
    async fn connection(&mut self, resume: bool) -> Result<Outcome, VoiceError> {
        let Some(endpoint) = self.endpoint.clone() else {
            return Ok(Outcome::AwaitServer);
        };
        self.set_state(VoiceConnectionState::Connecting);
        let url = voice_url(&endpoint)?;
        tracing::info!(%url, resume, "connecting to voice server");

        let mut conn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Outcome::Cancelled),
            conn = self.dialer.dial(url.as_str()) => conn?,
        };

        let greeting = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                conn.close(CLOSE_NORMAL).await;
                return Ok(Outcome::Cancelled);
            }
            greeting = tokio::time::timeout(self.config.hello_timeout(), await_hello(&mut conn)) => greeting,
        };
        let interval = match greeting {
            Ok(Ok(Greeting::Hello(interval))) => interval,
            Ok(Ok(Greeting::Closed { code, reason })) => return Ok(self.on_close(code, reason)),
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::warn!(timeout_ms = self.config.hello_timeout_ms, "no Hello from voice server");
                conn.close(CLOSE_RESUMABLE).await;
                return Ok(self.lost());
            }
        };
        tracing::debug!(interval_ms = interval.as_millis() as u64, "received voice Hello");

        if resume {
            self.set_state(VoiceConnectionState::Resuming);
            let payload = VoiceResume {
                server_id: self.guild_id,
                session_id: self.session_id.clone(),
                token: self.token.clone(),
            };
            send_voice(&mut conn, VOICE_OP_RESUME, &payload).await?;
        } else {
            self.set_state(VoiceConnectionState::Identifying);
            let payload = VoiceIdentify {
                server_id: self.guild_id,
                user_id: self.user_id,
                session_id: self.session_id.clone(),
                token: self.token.clone(),
            };
            send_voice(&mut conn, VOICE_OP_IDENTIFY, &payload).await?;
        }

        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_ack: Option<u64> = None;
        let mut sent_at = Instant::now();
        let mut peer_closed = false;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Outcome::Cancelled,
                _ = heartbeat.tick() => {
                    if awaiting_ack.is_some() {
                        tracing::warn!("voice heartbeat not acknowledged, reconnecting");
                        break self.lost();
                    }
                    self.nonce += 1;
                    send_voice(&mut conn, VOICE_OP_HEARTBEAT, &self.nonce).await?;
                    awaiting_ack = Some(self.nonce);
                    sent_at = Instant::now();
                }
                frame = conn.recv() => {
                    let text = match frame {
                        Some(Ok(Frame::Text(text))) => text,
                        Some(Ok(Frame::Close { code, reason })) => {
                            peer_closed = true;
                            break self.on_close(code, reason);
                        }
                        Some(Err(GatewayError::Decode(err))) => {
                            tracing::warn!(error = %err, "undecodable voice frame, skipping");
                            continue;
                        }
                        Some(Err(GatewayError::Inflate(err))) => {
                            tracing::warn!(error = %err, "voice inflate failed, reconnecting");
                            break self.lost();
                        }
                        Some(Err(err)) => {
                            tracing::debug!(error = %err, "voice read failed");
                            peer_closed = true;
                            break self.lost();
                        }
                        None => {
                            tracing::debug!("voice stream ended");
                            peer_closed = true;
                            break self.lost();
                        }
                    };

                    let message: GatewayMessage = match serde_json::from_str(&text) {
                        Ok(message) => message,
                        Err(err) => {
                            wire::log_in(TRANSPORT, None, &text);
                            tracing::warn!(error = %err, "malformed voice payload, skipping");
                            continue;
                        }
                    };
                    wire::log_in(TRANSPORT, Some(message.op), &text);

                    match message.op {
                        VOICE_OP_READY => {
                            let ready: VoiceReady = message.data()?;
                            self.on_ready(&mut conn, ready).await?;
                        }
                        VOICE_OP_SESSION_DESCRIPTION => {
                            let description: SessionDescription = message.data()?;
                            self.on_session_description(description)?;
                        }
                        VOICE_OP_HEARTBEAT_ACK => {
                            let echoed = message.data::<u64>().ok();
                            if echoed.is_none() || echoed == awaiting_ack {
                                awaiting_ack = None;
                                let latency = sent_at.elapsed();
                                self.shared.info().latency = Some(latency);
                                tracing::trace!(latency_ms = latency.as_millis() as u64, "voice heartbeat acknowledged");
                            } else {
                                tracing::debug!(?echoed, expected = ?awaiting_ack, "stale voice heartbeat ack");
                            }
                        }
                        VOICE_OP_RESUMED => {
                            self.backoff.reset();
                            tracing::info!("voice session resumed");
                            self.set_state(VoiceConnectionState::Running);
                        }
                        VOICE_OP_HELLO => tracing::debug!("duplicate voice Hello ignored"),
                        VOICE_OP_SPEAKING | VOICE_OP_CLIENT_DISCONNECT => {
                            tracing::trace!(op = message.op, "peer voice update");
                        }
                        op => tracing::debug!(op, "unhandled voice opcode"),
                    }
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Leave => break Outcome::Leave,
                    Command::Speaking(flags) => self.send_speaking(&mut conn, flags).await?,
                },
                Ok(()) = self.speaking.changed() => {
                    let speaking = *self.speaking.borrow_and_update();
                    let flags = if speaking {
                        SpeakingFlags::MICROPHONE
                    } else {
                        SpeakingFlags::empty()
                    };
                    self.send_speaking(&mut conn, flags).await?;
                }
                Some(state) = self.states.recv() => {
                    if self.on_voice_state(state) {
                        break Outcome::Left;
                    }
                }
                Some(server) = self.servers.recv() => {
                    let allocated = server.endpoint.is_some();
                    if self.on_server_update(server, false) {
                        tracing::info!(endpoint = ?self.endpoint, "voice server changed");
                        break Outcome::NewServer;
                    }
                    if !allocated {
                        tracing::info!("voice server is being reallocated");
                        break Outcome::AwaitServer;
                    }
                }
            }
        };

        if !peer_closed {
            let code = match outcome {
                Outcome::Resume | Outcome::Reconnect => CLOSE_RESUMABLE,
                _ => CLOSE_NORMAL,
            };
            conn.close(code).await;
        }
        Ok(outcome)
    }

    fn on_close(&self, code: u16, reason: String) -> Outcome {
        match voice_close_action(code) {
            VoiceCloseAction::Fatal => Outcome::Fatal {
                code,
                reason: if reason.is_empty() {
                    voice_close_reason(code).to_string()
                } else {
                    reason
                },
            },
            VoiceCloseAction::Reconnect => {
                tracing::warn!(code, reason = voice_close_reason(code), "voice session discarded by server");
                Outcome::Reconnect
            }
            VoiceCloseAction::AwaitServer => {
                tracing::info!(code, reason = voice_close_reason(code), "voice server disconnected us");
                Outcome::AwaitServer
            }
            VoiceCloseAction::Resume => {
                tracing::debug!(code, %reason, "voice socket closed by server");
                self.lost()
            }
        }
    }

    /// Ready: discover our address over UDP and select the protocol.
    async fn on_ready<C: GatewayConn>(
        &mut self,
        conn: &mut C,
        ready: VoiceReady,
    ) -> Result<(), VoiceError> {
        tracing::info!(ssrc = ready.ssrc, ip = %ready.ip, port = ready.port, modes = ?ready.modes, "voice ready");
        let mode = EncryptionMode::select(&self.config.preferred_modes, &ready.modes).ok_or_else(|| {
            VoiceError::Protocol(format!("no supported encryption mode in {:?}", ready.modes))
        })?;
        let server: IpAddr = ready
            .ip
            .parse()
            .map_err(|_| VoiceError::Protocol(format!("invalid voice server address {:?}", ready.ip)))?;
        let bind: SocketAddr = match server {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        // A new Ready means a new UDP session.
        self.reset_transport();
        let socket = UdpSocket::bind(bind).await?;
        socket.connect((server, ready.port)).await?;

        self.set_state(VoiceConnectionState::Discovering);
        let found = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(VoiceError::Cancelled),
            found = discover(&socket, ready.ssrc, self.config.discovery_timeout()) => found?,
        };

        self.set_state(VoiceConnectionState::SelectingProtocol);
        let select = SelectProtocol::udp(found.ip.to_string(), found.port, mode.as_str());
        send_voice(conn, VOICE_OP_SELECT_PROTOCOL, &select).await?;
        tracing::debug!(ip = %found.ip, port = found.port, %mode, "selected protocol");
        self.udp = Some(UdpSession {
            ssrc: ready.ssrc,
            socket: Arc::new(socket),
            mode,
        });
        Ok(())
    }

    /// SessionDescription: hand the key to the sender and start running.
    fn on_session_description(&mut self, description: SessionDescription) -> Result<(), VoiceError> {
        let Some(udp) = self.udp.as_ref() else {
            return Err(VoiceError::Protocol("session description before ready".into()));
        };
        let mode: EncryptionMode = description.mode.parse()?;
        if mode != udp.mode {
            tracing::warn!(selected = %udp.mode, server = %mode, "server chose another encryption mode");
        }
        let key = SecretKey::try_from(description.secret_key.as_slice())?;
        let sealer = PacketSealer::new(&key, mode, udp.ssrc)?;
        let ssrc = udp.ssrc;
        let _ = self.links.send(Some(Link {
            socket: udp.socket.clone(),
            sealer,
        }));
        {
            let mut info = self.shared.info();
            info.ssrc = Some(ssrc);
            info.mode = Some(mode);
        }
        self.established = true;
        self.backoff.reset();
        tracing::info!(ssrc, %mode, "voice session established");
        self.set_state(VoiceConnectionState::Running);
        Ok(())
    }

    async fn send_speaking<C: GatewayConn>(
        &self,
        conn: &mut C,
        flags: SpeakingFlags,
    ) -> Result<(), VoiceError> {
        let Some(ssrc) = self.udp.as_ref().map(|udp| udp.ssrc) else {
            tracing::debug!("speaking update before ready ignored");
            return Ok(());
        };
        let speaking = Speaking {
            speaking: flags,
            delay: 0,
            ssrc,
            user_id: None,
        };
        send_voice(conn, VOICE_OP_SPEAKING, &speaking).await
    }
}

async fn await_hello<C: GatewayConn>(conn: &mut C) -> Result<Greeting, VoiceError> {
    loop {
        let text = match conn.recv().await {
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Close { code, reason })) => return Ok(Greeting::Closed { code, reason }),
            Some(Err(err)) => return Err(err.into()),
            None => return Err(VoiceError::Closed),
        };
        let message: GatewayMessage = serde_json::from_str(&text)?;
        wire::log_in(TRANSPORT, Some(message.op), &text);
        if message.op == VOICE_OP_HELLO {
            let hello: VoiceHello = message.data()?;
            let millis = hello.heartbeat_interval.max(1.0);
            return Ok(Greeting::Hello(Duration::from_secs_f64(millis / 1_000.0)));
        }
        tracing::debug!(op = message.op, "voice frame before Hello ignored");
    }
}

async fn send_voice<C: GatewayConn, T: Serialize>(
    conn: &mut C,
    op: u8,
    data: &T,
) -> Result<(), VoiceError> {
    let payload = serde_json::to_string(&GatewayMessage::new(op, data)?)?;
    let sensitive = matches!(op, VOICE_OP_IDENTIFY | VOICE_OP_RESUME);
    wire::log_out(TRANSPORT, op, &payload, sensitive);
    conn.send(payload).await?;
    Ok(())
}

struct HandleInner {
    guild_id: GuildId,
    commands: mpsc::Sender<Command>,
    frames: mpsc::Sender<Bytes>,
    state: watch::Receiver<VoiceConnectionState>,
    shared: Arc<Shared>,
    stats: Arc<SenderStats>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<(), VoiceError>>>>,
}

/// A joined voice channel.
#[derive(Clone)]
pub struct VoiceConnection {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConnection")
            .field("guild_id", &self.inner.guild_id)
            .field("state", &self.state())
            .field("ssrc", &self.ssrc())
            .finish_non_exhaustive()
    }
}

impl VoiceConnection {
    pub fn guild_id(&self) -> GuildId {
        self.inner.guild_id
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.inner.shared.info().channel_id
    }

    pub fn state(&self) -> VoiceConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<VoiceConnectionState> {
        self.inner.state.clone()
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.inner.shared.info().ssrc
    }

    pub fn mode(&self) -> Option<EncryptionMode> {
        self.inner.shared.info().mode
    }

    pub fn latency(&self) -> Option<Duration> {
        self.inner.shared.info().latency
    }

    pub fn sent_packets(&self) -> u64 {
        self.inner.stats.sent_packets()
    }

    pub fn dropped_packets(&self) -> u64 {
        self.inner.stats.dropped_packets()
    }

    /// Queue one Opus frame (20 ms at 48 kHz). Waits while the queue is full.
    pub async fn send_opus(&self, frame: impl Into<Bytes>) -> Result<(), VoiceError> {
        let frame = frame.into();
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(VoiceError::Cancelled),
            sent = self.inner.frames.send(frame) => sent.map_err(|_| VoiceError::Closed),
        }
    }

    /// Send op 5 with explicit flags. The sender already toggles
    /// `MICROPHONE` around audio on its own.
    pub async fn speaking(&self, flags: SpeakingFlags) -> Result<(), VoiceError> {
        self.inner
            .commands
            .send(Command::Speaking(flags))
            .await
            .map_err(|_| VoiceError::Closed)
    }

    /// Wait until audio can flow.
    pub async fn ready(&self) -> Result<(), VoiceError> {
        let mut state = self.inner.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, VoiceConnectionState::Running | VoiceConnectionState::Closed))
            .await
            .map(|s| *s);
        match reached {
            Ok(VoiceConnectionState::Running) => Ok(()),
            _ => Err(self
                .inner
                .shared
                .info()
                .failure
                .clone()
                .map_or(VoiceError::Closed, |(code, reason)| VoiceError::Fatal { code, reason })),
        }
    }

    /// Leave the channel: op 4 with a null channel, close the voice socket
    /// with 1000 and drop the UDP socket.
    pub async fn leave(&self) -> Result<(), VoiceError> {
        if self.inner.commands.send(Command::Leave).await.is_err() {
            tracing::debug!(guild_id = %self.inner.guild_id, "voice connection already closed");
        }
        self.join().await
    }

    /// Stop without sending op 4.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Wait for the connection task. Only the first caller sees its result.
    pub async fn join(&self) -> Result<(), VoiceError> {
        let task = self.inner.task.lock().await.take();
        let Some(task) = task else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(guild_id = %self.inner.guild_id, error = %err, "voice task aborted");
                Err(VoiceError::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url() {
        assert_eq!(voice_url("voice.test").unwrap().as_str(), "wss://voice.test/?v=4");
        assert_eq!(
            voice_url("us-east1.discord.media:443").unwrap().as_str(),
            "wss://us-east1.discord.media/?v=4"
        );
        assert_eq!(
            voice_url("ws://127.0.0.1:9000").unwrap().as_str(),
            "ws://127.0.0.1:9000/?v=4"
        );
    }
}
