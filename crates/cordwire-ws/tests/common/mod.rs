#![allow(dead_code)]

use cordwire_ws::{Dialer, Frame, GatewayConn, GatewayError};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// What the client wrote to a fake socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(Value),
    Close(u16),
}

/// Hands every dial to the test as a [`ServerEnd`].
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

/// The server side of one fake socket.
pub struct ServerEnd {
    pub url: String,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<Sent>,
}

impl ServerEnd {
    pub fn send(&self, value: Value) {
        let _ = self.to_client.send(Frame::Text(value.to_string()));
    }

    pub fn hello(&self, interval_ms: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}));
    }

    pub fn dispatch(&self, name: &str, sequence: u64, data: Value) {
        self.send(json!({"op": 0, "t": name, "s": sequence, "d": data}));
    }

    pub fn ready(&self, sequence: u64, session_id: &str, resume_url: &str) {
        self.dispatch(
            "READY",
            sequence,
            json!({
                "v": 10,
                "user": {"id": "80351110224678912", "username": "cordwire", "bot": true},
                "session_id": session_id,
                "resume_gateway_url": resume_url,
                "guilds": [],
            }),
        );
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(Frame::Close {
            code,
            reason: String::new(),
        });
    }

    /// Next frame from the client, answering heartbeats along the way.
    pub async fn next(&mut self) -> Option<Sent> {
        loop {
            match self.from_client.recv().await? {
                Sent::Text(value) if value["op"] == 1 => self.send(json!({"op": 11})),
                other => return Some(other),
            }
        }
    }

    /// Next frame from the client, heartbeats included and left unanswered.
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
