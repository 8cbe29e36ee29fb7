mod common;

use std::time::Duration;

use anyhow::Context;
use cordwire_core::Dispatcher;
use cordwire_models::gateway::Ready;
use cordwire_models::Intents;
use cordwire_ws::{Gateway, GatewayConfig};
use flate2::{Compress, Compression, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

fn deflate(compress: &mut Compress, value: &Value) -> Vec<u8> {
    let text = value.to_string();
    let mut out = Vec::with_capacity(text.len() + 128);
    compress
        .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
        .expect("deflate");
    out
}

/// Plays the server side: compressed Hello, then a READY split over two
/// binary frames. Returns the close code the client sent.
async fn serve(listener: TcpListener) -> anyhow::Result<Option<u16>> {
    let (stream, _) = listener.accept().await?;
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let mut compress = Compress::new(Compression::default(), true);

    let hello = json!({"op": 10, "d": {"heartbeat_interval": 41250}});
    ws.send(Message::binary(deflate(&mut compress, &hello))).await?;

    let identify = loop {
        match ws.next().await.context("client went away")?? {
            Message::Text(text) => break serde_json::from_str::<Value>(text.as_str())?,
            _ => continue,
        }
    };
    anyhow::ensure!(identify["op"] == 2, "expected identify, got {identify}");

    // One message split over two frames; only the second ends in the sync marker.
    let ready = json!({
        "op": 0, "t": "READY", "s": 1,
        "d": {
            "v": 10,
            "user": {"id": "1", "username": "cordwire"},
            "session_id": "real-1",
            "resume_gateway_url": "wss://resume.invalid",
            "guilds": []
        }
    });
    let bytes = deflate(&mut compress, &ready);
    let (head, tail) = bytes.split_at(bytes.len() / 2);
    ws.send(Message::binary(head.to_vec())).await?;
    ws.send(Message::binary(tail.to_vec())).await?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Close(frame))) => {
                return Ok(frame.map(|f| u16::from(f.code)));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
            None => return Ok(None),
        }
    }
}

#[tokio::test]
async fn zlib_stream_gateway_over_tungstenite() -> anyhow::Result<()> {
    common::init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(serve(listener));

    let dispatcher = Dispatcher::new(16);
    let mut ready = dispatcher.subscribe::<Ready>();
    let handle = Gateway::new(
        GatewayConfig::new("Bot real", Intents::GUILDS),
        format!("ws://{addr}"),
        dispatcher.clone(),
    )
    .spawn();

    let ready = tokio::time::timeout(Duration::from_secs(5), ready.recv())
        .await?
        .context("dispatcher closed")?;
    assert_eq!(ready.session_id, "real-1");
    handle.ready().await?;
    assert_eq!(handle.sequence(), Some(1));

    handle.close().await?;
    let code = tokio::time::timeout(Duration::from_secs(5), server).await???;
    assert_eq!(code, Some(1000));
    Ok(())
}

/// Next text payload from the client, skipping heartbeats and control frames.
async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> anyhow::Result<Value> {
    loop {
        if let Message::Text(text) = ws.next().await.context("client went away")?? {
            let value: Value = serde_json::from_str(text.as_str())?;
            if value["op"] != 1 {
                return Ok(value);
            }
        }
    }
}

/// First socket: READY, then a frame the inflater cannot decode. Second
/// socket: a fresh zlib context that must receive a Resume.
async fn serve_corruption(listener: TcpListener) -> anyhow::Result<(Option<u16>, Value)> {
    let addr = listener.local_addr()?;
    let (stream, _) = listener.accept().await?;
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let mut compress = Compress::new(Compression::default(), true);

    let hello = json!({"op": 10, "d": {"heartbeat_interval": 41250}});
    ws.send(Message::binary(deflate(&mut compress, &hello))).await?;
    let identify = next_text(&mut ws).await?;
    anyhow::ensure!(identify["op"] == 2, "expected identify, got {identify}");

    let ready = json!({
        "op": 0, "t": "READY", "s": 1,
        "d": {
            "v": 10,
            "user": {"id": "1", "username": "cordwire"},
            "session_id": "corrupt-1",
            "resume_gateway_url": format!("ws://{addr}"),
            "guilds": []
        }
    });
    ws.send(Message::binary(deflate(&mut compress, &ready))).await?;
    ws.send(Message::binary(vec![0xFF, 0xFF, 0x13, 0x00, 0x00, 0xFF, 0xFF]))
        .await?;

    let code = loop {
        match ws.next().await {
            Some(Ok(Message::Close(frame))) => break frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break None,
        }
    };

    let (stream, _) = listener.accept().await?;
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let mut compress = Compress::new(Compression::default(), true);
    ws.send(Message::binary(deflate(&mut compress, &hello))).await?;
    let resume = next_text(&mut ws).await?;
    Ok((code, resume))
}

#[tokio::test]
async fn corrupt_zlib_frame_reconnects_and_resumes() -> anyhow::Result<()> {
    common::init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(serve_corruption(listener));

    let mut config = GatewayConfig::new("Bot real", Intents::GUILDS);
    config.backoff_min_ms = 10;
    config.backoff_max_ms = Some(20);
    let handle = Gateway::new(config, format!("ws://{addr}"), Dispatcher::new(16)).spawn();

    let (code, resume) = tokio::time::timeout(Duration::from_secs(5), server).await???;
    assert_eq!(code, Some(4000));
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "corrupt-1");
    assert_eq!(resume["d"]["seq"], 1);

    // The mock is gone by now, so only the shutdown itself matters.
    let _ = handle.close().await;
    Ok(())
}
