use std::time::Duration;

use cordwire_codec::rtp::{discovery_request, parse_discovery, DiscoveredAddress};
use cordwire_codec::CodecError;
use tokio::net::UdpSocket;

use crate::error::VoiceError;

const ATTEMPTS: u32 = 3;

/// Learn our externally visible address from the voice server.
///
/// `socket` must already be connected to the server. The request is resent
/// up to three times, each attempt getting a third of `timeout`.
pub async fn discover(
    socket: &UdpSocket,
    ssrc: u32,
    timeout: Duration,
) -> Result<DiscoveredAddress, VoiceError> {
    let request = discovery_request(ssrc);
    let per_attempt = timeout / ATTEMPTS;
    let mut buf = [0u8; 1500];

    for attempt in 1..=ATTEMPTS {
        socket.send(&request).await?;
        match tokio::time::timeout(per_attempt, read_response(socket, ssrc, &mut buf)).await {
            Ok(result) => {
                let found = result?;
                tracing::debug!(ssrc, ip = %found.ip, port = found.port, attempt, "ip discovery complete");
                return Ok(found);
            }
            Err(_) => tracing::debug!(ssrc, attempt, "no ip discovery response"),
        }
    }
    Err(VoiceError::Discovery(format!(
        "no response after {ATTEMPTS} attempts"
    )))
}

async fn read_response(
    socket: &UdpSocket,
    ssrc: u32,
    buf: &mut [u8],
) -> Result<DiscoveredAddress, VoiceError> {
    loop {
        let n = socket.recv(buf).await?;
        match parse_discovery(&buf[..n]) {
            Ok(found) if found.ssrc == ssrc => return Ok(found),
            Ok(found) => tracing::debug!(expected = ssrc, got = found.ssrc, "discovery reply for another ssrc"),
            // Stray RTP or keepalive traffic.
            Err(CodecError::BufferTooShort { .. }) => continue,
            Err(err) => tracing::debug!(error = %err, len = n, "ignoring non-discovery datagram"),
        }
    }
}
