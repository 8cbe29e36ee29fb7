use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cordwire_core::{Backoff, Dispatcher};
use cordwire_models::gateway::{
    close_action, close_reason, CloseAction, GatewayMessage, Hello, Identify,
    IdentifyProperties, RequestGuildMembers, Resume, ShardId, UpdateVoiceState, OP_DISPATCH,
    OP_HEARTBEAT, OP_HEARTBEAT_ACK, OP_HELLO, OP_IDENTIFY, OP_INVALID_SESSION,
    OP_PRESENCE_UPDATE, OP_RECONNECT, OP_REQUEST_GUILD_MEMBERS, OP_RESUME,
    OP_VOICE_STATE_UPDATE,
};
use cordwire_models::presence::UpdatePresence;
use cordwire_models::{Dispatch, Event};
use cordwire_util::UserId;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::limiter::{CommandLimiter, IdentifyLimiter};
use crate::transport::{
    Dialer, Frame, GatewayConn, WsDialer, CLOSE_NORMAL, CLOSE_RESUMABLE,
};
use crate::wire;

const TRANSPORT: &str = "gateway_ws";
/// Caller commands waiting for the connection to be writable.
const COMMAND_QUEUE: usize = 16;
/// Delay range after a non-resumable InvalidSession.
const INVALID_SESSION_DELAY_MS: std::ops::RangeInclusive<u64> = 1_000..=5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Disconnected,
    Connecting,
    Hello,
    Identifying,
    Resuming,
    Running,
    Reconnecting,
    Closing,
    /// A fatal close code was received; nothing further happens.
    Failed,
}

/// Append the query the gateway expects to a discovered or resume URL.
pub fn gateway_url(base: &str, api_version: u8, compress: bool) -> Result<Url, GatewayError> {
    let mut url = Url::parse(base)?;
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair("v", &api_version.to_string());
        query.append_pair("encoding", "json");
        if compress {
            query.append_pair("compress", "zlib-stream");
        }
    }
    Ok(url)
}

#[derive(Debug, Default)]
struct SessionInfo {
    session_id: Option<String>,
    user_id: Option<UserId>,
    latency: Option<Duration>,
    failure: Option<(u16, String)>,
}

/// State the runner publishes for handles to read.
#[derive(Debug, Default)]
struct Shared {
    sequence: AtomicU64,
    session: Mutex<SessionInfo>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, SessionInfo> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct Command {
    op: u8,
    payload: String,
}

/// Builder for one shard's gateway connection.
pub struct Gateway<D = WsDialer> {
    config: GatewayConfig,
    url: String,
    dialer: D,
    dispatcher: Dispatcher,
    identify: Arc<IdentifyLimiter>,
    cancel: CancellationToken,
}

impl Gateway<WsDialer> {
    /// `url` is the base gateway URL, usually from `GET /gateway/bot`.
    pub fn new(config: GatewayConfig, url: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            url: url.into(),
            dialer: WsDialer::gateway(),
            dispatcher,
            identify: Arc::new(IdentifyLimiter::default()),
            cancel: CancellationToken::new(),
        }
    }
}

impl<D: Dialer> Gateway<D> {
    pub fn with_dialer<E: Dialer>(self, dialer: E) -> Gateway<E> {
        Gateway {
            config: self.config,
            url: self.url,
            dialer,
            dispatcher: self.dispatcher,
            identify: self.identify,
            cancel: self.cancel,
        }
    }

    /// Share Identify pacing with the other shards of this process.
    pub fn with_identify_limiter(mut self, limiter: Arc<IdentifyLimiter>) -> Self {
        self.identify = limiter;
        self
    }

    /// Stop the gateway when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start the connection task.
    pub fn spawn(self) -> GatewayHandle {
        let shard = self.config.shard_id();
        let cancel = self.cancel.child_token();
        let (state_tx, state_rx) = watch::channel(GatewayState::Disconnected);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let shared = Arc::new(Shared::default());
        let limiter = CommandLimiter::per_minute(self.config.commands_per_minute);
        let backoff = Backoff::new(self.config.backoff_min(), self.config.backoff_max());

        let runner = Runner {
            config: self.config,
            shard,
            url: self.url,
            dialer: self.dialer,
            dispatcher: self.dispatcher,
            identify: self.identify,
            commands: commands_rx,
            state: state_tx,
            shared: shared.clone(),
            backoff,
            cancel: cancel.clone(),
            session_id: None,
            resume_url: None,
            sequence: 0,
        };
        let span = tracing::info_span!("gateway", shard = %shard);
        let task = tokio::spawn(runner.run().instrument(span));

        GatewayHandle {
            inner: Arc::new(HandleInner {
                shard,
                commands: commands_tx,
                state: state_rx,
                shared,
                limiter,
                cancel,
                task: tokio::sync::Mutex::new(Some(task)),
            }),
        }
    }
}

enum Outcome {
    Reconnect { resume: bool, delay: Option<Duration> },
    Fatal { code: u16, reason: String },
    Cancelled,
}

impl Outcome {
    const fn resume() -> Self {
        Self::Reconnect {
            resume: true,
            delay: None,
        }
    }

    const fn resume_now() -> Self {
        Self::Reconnect {
            resume: true,
            delay: Some(Duration::ZERO),
        }
    }
}

struct Runner<D: Dialer> {
    config: GatewayConfig,
    shard: ShardId,
    url: String,
    dialer: D,
    dispatcher: Dispatcher,
    identify: Arc<IdentifyLimiter>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<GatewayState>,
    shared: Arc<Shared>,
    backoff: Backoff,
    cancel: CancellationToken,
    // Written only by this task; handles read the mirror in `shared`.
    session_id: Option<String>,
    resume_url: Option<String>,
    sequence: u64,
}

impl<D: Dialer> Runner<D> {
    async fn run(mut self) -> Result<(), GatewayError> {
        let result = loop {
            let outcome = match self.connection().await {
                Ok(outcome) => outcome,
                Err(GatewayError::Fatal { code, reason }) => Outcome::Fatal { code, reason },
                Err(err) => {
                    tracing::warn!(error = %err, "gateway connection lost");
                    Outcome::resume()
                }
            };

            match outcome {
                Outcome::Cancelled => break Ok(()),
                Outcome::Fatal { code, reason } => {
                    tracing::error!(code, %reason, "gateway closed with fatal code");
                    self.shared.session().failure = Some((code, reason.clone()));
                    self.set_state(GatewayState::Failed);
                    break Err(GatewayError::Fatal { code, reason });
                }
                Outcome::Reconnect { resume, delay } => {
                    if !resume {
                        self.discard_session();
                    }
                    self.set_state(GatewayState::Reconnecting);
                    let delay = delay.unwrap_or_else(|| self.backoff.next_delay());
                    tracing::debug!(
                        delay_ms = delay.as_millis() as u64,
                        resume,
                        attempt = self.backoff.attempt(),
                        "reconnecting"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if result.is_ok() {
            self.set_state(GatewayState::Disconnected);
        }
        result
    }

    fn set_state(&self, state: GatewayState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "gateway state");
        }
    }

    fn discard_session(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.sequence = 0;
        self.shared.sequence.store(0, Ordering::Release);
        self.shared.session().session_id = None;
    }

    fn identify_payload(&self) -> Identify {
        Identify {
            token: self.config.token.clone(),
            properties: IdentifyProperties::default(),
            intents: self.config.intents,
            // zlib-stream is negotiated in the URL; payload compression stays off.
            compress: false,
            large_threshold: self.config.large_threshold,
            shard: self.config.shard,
            presence: self.config.presence.clone(),
        }
    }

    /// Drive one socket from dial to close.
    async fn connection(&mut self) -> Result<Outcome, GatewayError> {
        self.set_state(GatewayState::Connecting);
        let resuming = self.session_id.is_some();
        let base = match (&self.resume_url, resuming) {
            (Some(resume_url), true) => resume_url.as_str(),
            _ => self.url.as_str(),
        };
        let url = gateway_url(base, self.config.api_version, self.config.compress)?;
        tracing::info!(%url, resuming, "connecting to gateway");

        let mut conn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Outcome::Cancelled),
            conn = self.dialer.dial(url.as_str()) => conn?,
        };

        self.set_state(GatewayState::Hello);
        let hello = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                conn.close(CLOSE_NORMAL).await;
                return Ok(Outcome::Cancelled);
            }
            hello = tokio::time::timeout(self.config.hello_timeout(), await_hello(&mut conn)) => hello,
        };
        let interval = match hello {
            Ok(interval) => interval?,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.hello_timeout_ms,
                    "no Hello from gateway"
                );
                conn.close(CLOSE_RESUMABLE).await;
                return Ok(Outcome::resume());
            }
        };
        tracing::debug!(interval_ms = interval.as_millis() as u64, "received Hello");

        match self.session_id.clone() {
            Some(session_id) => {
                self.set_state(GatewayState::Resuming);
                let resume = Resume {
                    token: self.config.token.clone(),
                    session_id,
                    seq: self.sequence,
                };
                send_message(&mut conn, &GatewayMessage::new(OP_RESUME, &resume)?).await?;
            }
            None => {
                self.discard_session();
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        conn.close(CLOSE_NORMAL).await;
                        return Ok(Outcome::Cancelled);
                    }
                    _ = self.identify.acquire(self.shard.id) => {}
                }
                self.set_state(GatewayState::Identifying);
                let identify = GatewayMessage::new(OP_IDENTIFY, &self.identify_payload())?;
                send_message(&mut conn, &identify).await?;
            }
        }

        // The first beat lands at a random point of the first interval.
        let first = interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + first, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_ack = false;
        let mut sent_at = Instant::now();
        let mut peer_closed = false;

        let outcome = loop {
            let running = *self.state.borrow() == GatewayState::Running;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.set_state(GatewayState::Closing);
                    break Outcome::Cancelled;
                }
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        tracing::warn!("heartbeat not acknowledged, reconnecting");
                        break Outcome::resume();
                    }
                    self.heartbeat(&mut conn).await?;
                    awaiting_ack = true;
                    sent_at = Instant::now();
                }
                frame = conn.recv() => {
                    let text = match frame {
                        Some(Ok(Frame::Text(text))) => text,
                        Some(Ok(Frame::Close { code, reason })) => {
                            peer_closed = true;
                            break on_close(code, reason);
                        }
                        Some(Err(GatewayError::Decode(err))) => {
                            tracing::warn!(error = %err, "undecodable gateway frame, skipping");
                            continue;
                        }
                        Some(Err(GatewayError::Inflate(err))) => {
                            tracing::warn!(error = %err, "gateway inflate failed, reconnecting");
                            break Outcome::resume();
                        }
                        Some(Err(err)) => {
                            tracing::debug!(error = %err, "gateway read failed");
                            peer_closed = true;
                            break Outcome::resume();
                        }
                        None => {
                            tracing::debug!("gateway stream ended");
                            peer_closed = true;
                            break Outcome::resume();
                        }
                    };

                    let message: GatewayMessage = match serde_json::from_str(&text) {
                        Ok(message) => message,
                        Err(err) => {
                            wire::log_in(TRANSPORT, None, &text);
                            tracing::warn!(error = %err, "malformed gateway payload, skipping");
                            continue;
                        }
                    };
                    wire::log_in(TRANSPORT, Some(message.op), &text);

                    match message.op {
                        OP_DISPATCH => {
                            if let Some(outcome) = self.on_dispatch(message) {
                                break outcome;
                            }
                        }
                        OP_HEARTBEAT => {
                            self.heartbeat(&mut conn).await?;
                            awaiting_ack = true;
                            sent_at = Instant::now();
                        }
                        OP_HEARTBEAT_ACK => {
                            awaiting_ack = false;
                            let latency = sent_at.elapsed();
                            self.shared.session().latency = Some(latency);
                            tracing::trace!(latency_ms = latency.as_millis() as u64, "heartbeat acknowledged");
                        }
                        OP_RECONNECT => {
                            tracing::info!("gateway requested reconnect");
                            break Outcome::resume_now();
                        }
                        OP_INVALID_SESSION => {
                            let resumable = message.data::<bool>().unwrap_or(false);
                            tracing::warn!(resumable, "session invalidated");
                            if resumable {
                                break Outcome::resume_now();
                            }
                            let delay = rand::thread_rng().gen_range(INVALID_SESSION_DELAY_MS);
                            break Outcome::Reconnect {
                                resume: false,
                                delay: Some(Duration::from_millis(delay)),
                            };
                        }
                        OP_HELLO => tracing::debug!("duplicate Hello ignored"),
                        op => tracing::debug!(op, "unhandled gateway opcode"),
                    }
                }
                Some(command) = self.commands.recv(), if running => {
                    wire::log_out(TRANSPORT, command.op, &command.payload, false);
                    conn.send(command.payload).await?;
                }
            }
        };

        if !peer_closed {
            let code = match outcome {
                Outcome::Cancelled => CLOSE_NORMAL,
                _ => CLOSE_RESUMABLE,
            };
            conn.close(code).await;
        }
        Ok(outcome)
    }

    async fn heartbeat(&self, conn: &mut D::Conn) -> Result<(), GatewayError> {
        let sequence = (self.sequence > 0).then_some(self.sequence);
        send_message(conn, &GatewayMessage::heartbeat(sequence)).await
    }

    /// Apply a dispatch. Returns an outcome when the connection must end.
    fn on_dispatch(&mut self, message: GatewayMessage) -> Option<Outcome> {
        let Some(sequence) = message.s else {
            tracing::debug!(event_name = ?message.t, "dispatch without sequence ignored");
            return None;
        };
        if self.sequence > 0 {
            if sequence <= self.sequence {
                tracing::debug!(sequence, last = self.sequence, "duplicate dispatch dropped");
                return None;
            }
            if sequence > self.sequence + 1 {
                tracing::warn!(
                    expected = self.sequence + 1,
                    got = sequence,
                    "sequence gap, resuming"
                );
                return Some(Outcome::resume_now());
            }
        }

        // Published before delivery so subscribers see a consistent pair.
        self.sequence = sequence;
        self.shared.sequence.store(sequence, Ordering::Release);

        let name = message.t.unwrap_or_default();
        let event = match Event::decode(&name, message.d.unwrap_or(Value::Null)) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(event_name = %name, sequence, error = %err, "undecodable dispatch, skipping");
                return None;
            }
        };

        match &event {
            Event::Ready(ready) => {
                self.session_id = Some(ready.session_id.clone());
                self.resume_url = ready.resume_gateway_url.clone();
                {
                    let mut session = self.shared.session();
                    session.session_id = Some(ready.session_id.clone());
                    session.user_id = Some(ready.user.id);
                }
                self.backoff.reset();
                tracing::info!(
                    session_id = %ready.session_id,
                    user_id = %ready.user.id,
                    guilds = ready.guilds.len(),
                    "gateway ready"
                );
                self.set_state(GatewayState::Running);
            }
            Event::Resumed => {
                self.backoff.reset();
                tracing::info!(sequence, "session resumed");
                self.set_state(GatewayState::Running);
            }
            _ => {}
        }

        self.dispatcher.dispatch(&Dispatch {
            sequence,
            shard: self.shard,
            event,
        });
        None
    }
}

fn on_close(code: u16, reason: String) -> Outcome {
    match close_action(code) {
        CloseAction::Fatal => Outcome::Fatal {
            code,
            reason: if reason.is_empty() {
                close_reason(code).to_string()
            } else {
                reason
            },
        },
        CloseAction::Reidentify => {
            tracing::warn!(code, reason = close_reason(code), "session discarded by server");
            Outcome::Reconnect {
                resume: false,
                delay: None,
            }
        }
        CloseAction::Resume => {
            tracing::debug!(code, %reason, "gateway closed by server");
            Outcome::resume()
        }
    }
}

async fn await_hello<C: GatewayConn>(conn: &mut C) -> Result<Duration, GatewayError> {
    loop {
        let text = match conn.recv().await {
            Some(Ok(Frame::Text(text))) => text,
            Some(Ok(Frame::Close { code, reason })) => {
                return match on_close(code, reason) {
                    Outcome::Fatal { code, reason } => Err(GatewayError::Fatal { code, reason }),
                    _ => Err(GatewayError::Closed),
                };
            }
            Some(Err(err)) => return Err(err),
            None => return Err(GatewayError::Closed),
        };
        let message: GatewayMessage = serde_json::from_str(&text)?;
        wire::log_in(TRANSPORT, Some(message.op), &text);
        if message.op == OP_HELLO {
            let hello: Hello = message.data()?;
            return Ok(Duration::from_millis(hello.heartbeat_interval.max(1)));
        }
        tracing::debug!(op = message.op, "frame before Hello ignored");
    }
}

async fn send_message<C: GatewayConn>(
    conn: &mut C,
    message: &GatewayMessage,
) -> Result<(), GatewayError> {
    let payload = serde_json::to_string(message)?;
    let sensitive = matches!(message.op, OP_IDENTIFY | OP_RESUME);
    wire::log_out(TRANSPORT, message.op, &payload, sensitive);
    conn.send(payload).await
}

struct HandleInner {
    shard: ShardId,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<GatewayState>,
    shared: Arc<Shared>,
    limiter: CommandLimiter,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<(), GatewayError>>>>,
}

/// Cheap, cloneable access to a running gateway shard.
#[derive(Clone)]
pub struct GatewayHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for GatewayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHandle")
            .field("shard", &self.inner.shard)
            .field("state", &self.state())
            .field("sequence", &self.sequence())
            .finish_non_exhaustive()
    }
}

impl GatewayHandle {
    pub fn shard(&self) -> ShardId {
        self.inner.shard
    }

    pub fn state(&self) -> GatewayState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<GatewayState> {
        self.inner.state.clone()
    }

    /// Last applied dispatch sequence, `None` before the first dispatch.
    pub fn sequence(&self) -> Option<u64> {
        match self.inner.shared.sequence.load(Ordering::Acquire) {
            0 => None,
            sequence => Some(sequence),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.shared.session().session_id.clone()
    }

    /// The connected user, known once Ready arrives.
    pub fn user_id(&self) -> Option<UserId> {
        self.inner.shared.session().user_id
    }

    /// Round trip of the most recent acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.inner.shared.session().latency
    }

    fn failure(&self) -> Option<GatewayError> {
        self.inner
            .shared
            .session()
            .failure
            .clone()
            .map(|(code, reason)| GatewayError::Fatal { code, reason })
    }

    /// Wait until the shard is running. Fails if it closes or hits a fatal
    /// close code first.
    pub async fn ready(&self) -> Result<(), GatewayError> {
        let mut state = self.inner.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, GatewayState::Running | GatewayState::Failed))
            .await
            .map(|s| *s);
        match reached {
            Ok(GatewayState::Running) => Ok(()),
            _ => Err(self.failure().unwrap_or(GatewayError::Closed)),
        }
    }

    /// Queue a command for the connection.
    ///
    /// Suspends while the per-minute budget is spent or the queue is full.
    /// Commands queued while reconnecting go out once the session runs again.
    pub async fn send<T: Serialize>(&self, op: u8, data: &T) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(&GatewayMessage::new(op, data)?)?;
        if self.state() == GatewayState::Failed {
            return Err(self.failure().unwrap_or(GatewayError::Closed));
        }
        let cancel = &self.inner.cancel;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            _ = self.inner.limiter.acquire() => {}
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            sent = self.inner.commands.send(Command { op, payload }) => {
                sent.map_err(|_| GatewayError::Closed)
            }
        }
    }

    /// Op 3.
    pub async fn update_status(&self, presence: &UpdatePresence) -> Result<(), GatewayError> {
        self.send(OP_PRESENCE_UPDATE, presence).await
    }

    /// Op 4. A `None` channel leaves voice in that guild.
    pub async fn update_voice_state(&self, update: &UpdateVoiceState) -> Result<(), GatewayError> {
        self.send(OP_VOICE_STATE_UPDATE, update).await
    }

    /// Op 8. Members arrive as `GUILD_MEMBERS_CHUNK` dispatches.
    pub async fn request_guild_members(
        &self,
        request: &RequestGuildMembers,
    ) -> Result<(), GatewayError> {
        self.send(OP_REQUEST_GUILD_MEMBERS, request).await
    }

    /// Stop the shard without waiting for it.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Wait for the connection task to end and return its result. Only the
    /// first caller sees the result; later calls return `Ok(())`.
    pub async fn join(&self) -> Result<(), GatewayError> {
        let task = self.inner.task.lock().await.take();
        let Some(task) = task else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(shard = %self.inner.shard, error = %err, "gateway task aborted");
                Err(GatewayError::Closed)
            }
        }
    }

    /// Close with 1000 and wait for the task to finish.
    pub async fn close(&self) -> Result<(), GatewayError> {
        self.shutdown();
        self.join().await
    }
}
