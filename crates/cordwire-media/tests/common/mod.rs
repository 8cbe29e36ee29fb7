#![allow(dead_code)]

use cordwire_core::Dispatcher;
use cordwire_media::VoiceGateway;
use cordwire_models::gateway::UpdateVoiceState;
use cordwire_models::voice::{VoiceServerUpdate, VoiceState};
use cordwire_models::{Dispatch, Event, ShardId};
use cordwire_util::{ChannelId, GuildId, UserId};
use cordwire_ws::{Dialer, Frame, GatewayConn, GatewayError};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const GUILD: u64 = 81_384_788_765_712_384;
pub const USER: u64 = 80_351_110_224_678_912;
pub const CHANNEL: u64 = 155_101_607_195_836_416;

/// Records op 4 updates instead of sending them.
#[derive(Clone)]
pub struct FakeGateway {
    updates: mpsc::UnboundedSender<UpdateVoiceState>,
}

pub fn fake_gateway() -> (FakeGateway, mpsc::UnboundedReceiver<UpdateVoiceState>) {
    let (updates, rx) = mpsc::unbounded_channel();
    (FakeGateway { updates }, rx)
}

impl VoiceGateway for FakeGateway {
    fn user_id(&self) -> Option<UserId> {
        Some(UserId::new(USER))
    }

    async fn update_voice_state(&self, update: &UpdateVoiceState) -> Result<(), GatewayError> {
        self.updates
            .send(update.clone())
            .map_err(|_| GatewayError::Closed)
    }
}

pub fn voice_state(dispatcher: &Dispatcher, channel: Option<u64>, session_id: &str) {
    let state = VoiceState {
        guild_id: Some(GuildId::new(GUILD)),
        channel_id: channel.map(ChannelId::new),
        user_id: UserId::new(USER),
        session_id: session_id.to_string(),
        deaf: false,
        mute: false,
        self_deaf: false,
        self_mute: false,
        self_stream: false,
        self_video: false,
        suppress: false,
        member: None,
    };
    dispatcher.dispatch(&Dispatch {
        sequence: 1,
        shard: ShardId::ONE,
        event: Event::VoiceStateUpdate(state),
    });
}

pub fn voice_server(dispatcher: &Dispatcher, endpoint: Option<&str>, token: &str) {
    let update = VoiceServerUpdate {
        token: token.to_string(),
        guild_id: GuildId::new(GUILD),
        endpoint: endpoint.map(str::to_string),
    };
    dispatcher.dispatch(&Dispatch {
        sequence: 2,
        shard: ShardId::ONE,
        event: Event::VoiceServerUpdate(update),
    });
}

/// What the client wrote to a fake socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(Value),
    Close(u16),
}

pub struct FakeDialer {
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

pub fn fake_dialer() -> (FakeDialer, mpsc::UnboundedReceiver<ServerEnd>) {
    let (accepted, rx) = mpsc::unbounded_channel();
    (FakeDialer { accepted }, rx)
}

impl Dialer for FakeDialer {
    type Conn = FakeConn;

    async fn dial(&self, url: &str) -> Result<FakeConn, GatewayError> {
        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        self.accepted
            .send(ServerEnd {
                url: url.to_string(),
                to_client,
                from_client,
            })
            .map_err(|_| GatewayError::Closed)?;
        Ok(FakeConn { incoming, outgoing })
    }
}

pub struct FakeConn {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Sent>,
}

impl GatewayConn for FakeConn {
    async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        let value: Value = serde_json::from_str(&text)?;
        self.outgoing
            .send(Sent::Text(value))
            .map_err(|_| GatewayError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<Frame, GatewayError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16) {
        let _ = self.outgoing.send(Sent::Close(code));
        self.incoming.close();
    }
}

/// The voice server side of one fake socket.
pub struct ServerEnd {
    pub url: String,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Sent>,
}

impl ServerEnd {
    pub fn send(&self, value: Value) {
        let _ = self.to_client.send(Frame::Text(value.to_string()));
    }

    pub fn hello(&self, interval_ms: f64) {
        self.send(json!({"op": 8, "d": {"heartbeat_interval": interval_ms}}));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(Frame::Close {
            code,
            reason: String::new(),
        });
    }

    /// Next frame from the client, acknowledging heartbeats along the way.
    pub async fn next(&mut self) -> Option<Sent> {
        loop {
            match self.from_client.recv().await? {
                Sent::Text(value) if value["op"] == 3 => {
                    self.send(json!({"op": 6, "d": value["d"]}));
                }
                other => return Some(other),
            }
        }
    }

    pub async fn next_raw(&mut self) -> Option<Sent> {
        self.from_client.recv().await
    }

    pub async fn expect_op(&mut self, op: u64) -> anyhow::Result<Value> {
        match self.next().await {
            Some(Sent::Text(value)) if value["op"] == op => Ok(value),
            other => anyhow::bail!("expected op {op}, got {other:?}"),
        }
    }

    pub async fn expect_close(&mut self) -> anyhow::Result<u16> {
        match self.next().await {
            Some(Sent::Close(code)) => Ok(code),
            other => anyhow::bail!("expected close, got {other:?}"),
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
