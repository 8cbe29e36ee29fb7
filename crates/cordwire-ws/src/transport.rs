use std::future::Future;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::GatewayError;
use crate::inflate::Inflater;
use crate::wire;

/// Close code a client uses when it intends to resume; 1000 and 1001 would
/// invalidate the session.
pub const CLOSE_RESUMABLE: u16 = 4000;
pub const CLOSE_NORMAL: u16 = 1000;
/// Reported when the peer closed without a status code.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Outbound frames queued ahead of the writer task.
const WRITE_QUEUE: usize = 64;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

/// One established socket as seen by a state machine.
///
/// `recv` must be cancel-safe: it is raced against timers in `select!`.
/// `None` means the stream ended without a close frame.
pub trait GatewayConn: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), GatewayError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Option<Result<Frame, GatewayError>>> + Send;

    fn close(&mut self, code: u16) -> impl Future<Output = ()> + Send;
}

/// Opens sockets. Each dial yields a fresh connection with fresh
/// decompression state.
pub trait Dialer: Send + Sync + 'static {
    type Conn: GatewayConn;

    fn dial(&self, url: &str) -> impl Future<Output = Result<Self::Conn, GatewayError>> + Send;
}

/// [`Dialer`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy)]
pub struct WsDialer {
    transport: &'static str,
}

impl WsDialer {
    pub fn gateway() -> Self {
        Self {
            transport: "gateway_ws",
        }
    }

    pub fn voice() -> Self {
        Self {
            transport: "voice_ws",
        }
    }
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::gateway()
    }
}

impl Dialer for WsDialer {
    type Conn = WsConn;

    async fn dial(&self, url: &str) -> Result<WsConn, GatewayError> {
        let (stream, response) = tokio_tungstenite::connect_async(url).await?;
        tracing::debug!(
            transport = self.transport,
            status = %response.status(),
            "websocket connected"
        );
        Ok(WsConn::new(stream, self.transport))
    }
}

/// A tungstenite socket split into a reader owned by the caller and a
/// writer task that applies queued frames in order.
pub struct WsConn {
    reader: SplitStream<WsStream>,
    writer: mpsc::Sender<Message>,
    inflater: Inflater,
    transport: &'static str,
}

impl WsConn {
    pub fn new(stream: WsStream, transport: &'static str) -> Self {
        let (sink, reader) = stream.split();
        let (writer, queue) = mpsc::channel(WRITE_QUEUE);
        tokio::spawn(write_loop(sink, queue, transport));
        Self {
            reader,
            writer,
            inflater: Inflater::new(),
            transport,
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut queue: mpsc::Receiver<Message>,
    transport: &'static str,
) {
    while let Some(message) = queue.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            tracing::debug!(transport, error = %err, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    if let Err(err) = sink.close().await {
        tracing::trace!(transport, error = %err, "websocket close after writer stop");
    }
}

impl GatewayConn for WsConn {
    async fn send(&mut self, text: String) -> Result<(), GatewayError> {
        self.writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| GatewayError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<Frame, GatewayError>> {
        loop {
            let message = match self.reader.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(err.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Message::Binary(data) => match self.inflater.push(&data) {
                    Ok(Some(text)) => return Some(Ok(Frame::Text(text))),
                    Ok(None) => continue,
                    Err(err) => return Some(Err(err)),
                },
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                    wire::log_close(self.transport, "in", code, &reason);
                    return Some(Ok(Frame::Close { code, reason }));
                }
                // Pings are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self, code: u16) {
        wire::log_close(self.transport, "out", code, "");
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if self.writer.send(Message::Close(Some(frame))).await.is_err() {
            tracing::trace!(transport = self.transport, "writer already stopped");
        }
    }
}
