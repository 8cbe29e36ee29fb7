use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cordwire_core::{DispatchError, Dispatcher, FromDispatch, HandlerHandle};
use cordwire_http::Client;
use cordwire_media::{VoiceConnection, VoiceConnector, VoiceError};
use cordwire_models::gateway::{RequestGuildMembers, UpdateVoiceState};
use cordwire_models::presence::UpdatePresence;
use cordwire_models::voice::VoiceState;
use cordwire_models::{Intents, ShardId};
use cordwire_util::{ChannelId, GuildId};
use cordwire_ws::limiter::IDENTIFY_INTERVAL;
use cordwire_ws::{Gateway, GatewayHandle, IdentifyLimiter};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::voice::VoiceRegistry;

/// The shards of one `open` and the token that stops them.
#[derive(Clone)]
struct Running {
    shards: Arc<[GatewayHandle]>,
    cancel: CancellationToken,
}

/// Where to connect and how many shards to run.
struct Plan {
    url: String,
    shard_count: u32,
    max_concurrency: u32,
}

/// A bot or user session: REST client, gateway shards and voice
/// connections sharing one token, one rate limiter and one dispatcher.
pub struct Session {
    token: String,
    config: SessionConfig,
    http: Client,
    dispatcher: Dispatcher,
    intents: Mutex<Intents>,
    running: Mutex<Option<Running>>,
    /// Serializes `open` and `close`.
    lifecycle: tokio::sync::Mutex<()>,
    voice: VoiceRegistry,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("intents", &self.intents())
            .field("open", &self.is_open())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(token: impl Into<String>, config: SessionConfig) -> Result<Self, SessionError> {
        let token = token.into();
        let cancel = CancellationToken::new();
        let http = Client::new(&token, config.http.clone())?.with_cancel(cancel.clone());
        Ok(Self {
            dispatcher: Dispatcher::new(config.dispatch_buffer),
            intents: Mutex::new(config.gateway.intents),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            voice: VoiceRegistry::new(),
            token,
            config,
            http,
            cancel,
        })
    }

    fn intents_mut(&self) -> MutexGuard<'_, Intents> {
        self.intents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> Option<Running> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_running(&self, running: Option<Running>) -> Option<Running> {
        let mut slot = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, running)
    }

    /// REST access. Shares rate limits with everything else the session does.
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn intents(&self) -> Intents {
        *self.intents_mut()
    }

    pub fn is_open(&self) -> bool {
        self.running().is_some()
    }

    /// Handles of the running shards, in shard order.
    pub fn shards(&self) -> Vec<GatewayHandle> {
        self.running()
            .map(|running| running.shards.to_vec())
            .unwrap_or_default()
    }

    /// The shard that carries `guild_id`.
    pub fn shard_for(&self, guild_id: GuildId) -> Result<GatewayHandle, SessionError> {
        let running = self.running().ok_or(SessionError::NotOpen)?;
        route(&running.shards, guild_id)
    }

    /// Request more intents. They are sent with the next Identify, so a
    /// running session must be reopened to pick them up.
    pub fn add_intents(&self, intents: Intents) {
        let mut current = self.intents_mut();
        *current |= intents;
        if self.is_open() {
            tracing::debug!(intents = current.bits(), "intents change applies from the next open");
        }
    }

    /// Run `handler` for every event of type `T`.
    pub fn add_handler<T, F, Fut>(&self, handler: F) -> HandlerHandle
    where
        T: FromDispatch,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.dispatcher.add_handler(handler)
    }

    /// Connect every shard and wait until all of them are running.
    ///
    /// Cancelling `cancel` tears the whole session down: shards, voice
    /// connections and in-flight REST calls.
    pub async fn open(&self, cancel: CancellationToken) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        if self.is_open() {
            return Err(SessionError::AlreadyOpen);
        }

        let run = self.cancel.child_token();
        link_cancel(cancel, self.cancel.clone(), run.clone());

        let plan = match self.plan().await {
            Ok(plan) => plan,
            Err(err) => {
                run.cancel();
                return Err(err);
            }
        };
        let limiter = Arc::new(IdentifyLimiter::new(plan.max_concurrency, IDENTIFY_INTERVAL));
        let intents = self.intents();
        tracing::info!(
            shards = plan.shard_count,
            max_concurrency = plan.max_concurrency,
            intents = intents.bits(),
            "opening session"
        );

        let shards: Arc<[GatewayHandle]> = (0..plan.shard_count)
            .map(|id| {
                let mut config = self.config.gateway.clone();
                config.token = self.token.clone();
                config.intents = intents;
                config.shard = (plan.shard_count > 1).then(|| ShardId::new(id, plan.shard_count));
                Gateway::new(config, plan.url.clone(), self.dispatcher.clone())
                    .with_identify_limiter(limiter.clone())
                    .with_cancel(run.clone())
                    .spawn()
            })
            .collect();

        for shard in shards.iter() {
            let ready = tokio::select! {
                biased;
                _ = run.cancelled() => Err(SessionError::Cancelled),
                ready = shard.ready() => ready.map_err(SessionError::from),
            };
            if let Err(err) = ready {
                tracing::warn!(shard = %shard.shard(), error = %err, "session failed to open");
                run.cancel();
                for shard in shards.iter() {
                    let _ = shard.join().await;
                }
                return Err(err);
            }
        }

        self.set_running(Some(Running {
            shards,
            cancel: run,
        }));
        tracing::info!("session open");
        Ok(())
    }

    async fn plan(&self) -> Result<Plan, SessionError> {
        let requested = self.config.shard_count.map(|n| n.max(1));
        if !self.config.http.bot {
            let info = self.http.gateway().await?;
            return Ok(Plan {
                url: info.url,
                shard_count: requested.unwrap_or(1),
                max_concurrency: 1,
            });
        }

        let bot = self.http.gateway_bot().await?;
        let limit = bot.session_start_limit;
        tracing::debug!(
            recommended_shards = bot.shards,
            remaining = limit.remaining,
            total = limit.total,
            "session start limit"
        );
        if limit.remaining == 0 {
            tracing::warn!(reset_after_ms = limit.reset_after, "session start limit exhausted");
        }
        Ok(Plan {
            url: bot.url,
            shard_count: requested.unwrap_or(bot.shards.max(1)),
            max_concurrency: limit.max_concurrency,
        })
    }

    /// Disconnect voice, close every shard with 1000 and wait for them.
    /// The session can be opened again afterwards.
    pub async fn close(&self) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.set_running(None) else {
            return Ok(());
        };

        for connection in self.voice.drain().await {
            connection.shutdown();
            if let Err(err) = connection.join().await {
                tracing::debug!(guild_id = %connection.guild_id(), error = %err, "voice connection ended with error");
            }
        }

        running.cancel.cancel();
        for shard in running.shards.iter() {
            if let Err(err) = shard.join().await {
                tracing::warn!(shard = %shard.shard(), error = %err, "shard ended with error");
            }
        }
        tracing::info!("session closed");
        Ok(())
    }

    /// Op 3 on every shard.
    pub async fn update_status(&self, presence: &UpdatePresence) -> Result<(), SessionError> {
        let running = self.running().ok_or(SessionError::NotOpen)?;
        for shard in running.shards.iter() {
            shard.update_status(presence).await?;
        }
        Ok(())
    }

    /// Op 8 on the guild's shard.
    pub async fn request_guild_members(
        &self,
        request: &RequestGuildMembers,
    ) -> Result<(), SessionError> {
        let shard = self.shard_for(request.guild_id)?;
        shard.request_guild_members(request).await?;
        Ok(())
    }

    /// The live voice connection in `guild_id`, if any.
    pub async fn voice(&self, guild_id: GuildId) -> Option<VoiceConnection> {
        self.voice.get(guild_id).await
    }

    /// Join a voice channel and wait until audio can flow.
    ///
    /// Joining the channel the guild's connection is already in returns that
    /// connection. Joining another channel in the same guild moves it.
    pub async fn join_voice(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<VoiceConnection, SessionError> {
        let running = self.running().ok_or(SessionError::NotOpen)?;
        let shard = route(&running.shards, guild_id)?;

        if let Some(existing) = self.voice.get(guild_id).await {
            if existing.channel_id() == Some(channel_id) {
                return Ok(existing);
            }
            self.move_voice(&shard, &existing, channel_id).await?;
            return Ok(existing);
        }

        let connection = VoiceConnector::new(shard, self.dispatcher.clone(), self.config.voice.clone())
            .with_cancel(running.cancel.clone())
            .join(guild_id, channel_id)
            .await?;
        self.voice.insert(connection.clone()).await;
        Ok(connection)
    }

    async fn move_voice(
        &self,
        shard: &GatewayHandle,
        connection: &VoiceConnection,
        channel_id: ChannelId,
    ) -> Result<(), SessionError> {
        let guild_id = connection.guild_id();
        let user_id = shard.user_id().ok_or(VoiceError::NotReady)?;
        let moved = self.dispatcher.wait_for(
            move |state: &VoiceState| {
                state.guild_id == Some(guild_id)
                    && state.user_id == user_id
                    && state.channel_id == Some(channel_id)
            },
            self.config.voice.join_timeout(),
        );
        let update = UpdateVoiceState {
            guild_id,
            channel_id: Some(channel_id),
            self_mute: self.config.voice.self_mute,
            self_deaf: self.config.voice.self_deaf,
        };
        shard.update_voice_state(&update).await?;
        tracing::info!(%guild_id, %channel_id, "moving voice connection");

        moved.await?;
        Ok(())
    }

    /// Leave voice in `guild_id`. A no-op when not connected there.
    pub async fn leave_voice(&self, guild_id: GuildId) -> Result<(), SessionError> {
        match self.voice.remove(guild_id).await {
            Some(connection) => Ok(connection.leave().await?),
            None => Ok(()),
        }
    }

    /// Cancel everything the session runs, including REST calls. Unlike
    /// [`close`](Self::close), the session cannot be reopened.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn route(shards: &[GatewayHandle], guild_id: GuildId) -> Result<GatewayHandle, SessionError> {
    let total = u32::try_from(shards.len()).unwrap_or(u32::MAX).max(1);
    let index = ShardId::for_guild(guild_id, total).id as usize;
    shards.get(index).cloned().ok_or(SessionError::NotOpen)
}

/// Forward the caller's cancellation to the session until this run ends.
fn link_cancel(caller: CancellationToken, session: CancellationToken, run: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => {
                tracing::debug!("session cancelled by caller");
                session.cancel();
            }
            _ = run.cancelled() => {}
        }
    });
}

impl From<DispatchError> for SessionError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Timeout => Self::Voice(VoiceError::Timeout),
            DispatchError::Closed => Self::Voice(VoiceError::Closed),
        }
    }
}
