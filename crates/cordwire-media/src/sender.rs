//! Paced RTP sender.
//!
//! One task per voice connection pulls Opus frames off a bounded queue every
//! 20 ms, seals them and writes them to UDP. Missed ticks are skipped, never
//! replayed. When the queue runs dry after audio, five silence frames go out
//! before the sender goes quiet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cordwire_codec::{PacketSealer, FRAME_DURATION_MS, SILENCE_FRAME, SILENCE_FRAME_COUNT};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const FRAME_DURATION: Duration = Duration::from_millis(FRAME_DURATION_MS);

#[derive(Debug, Default)]
pub struct SenderStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl SenderStats {
    pub fn sent_packets(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Packets sealed but never written because UDP stayed blocked for a
    /// whole frame or the write failed.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Where sealed packets go. Replaced whenever the voice session is
/// renegotiated; kept across resumes.
pub(crate) struct Link {
    pub socket: Arc<UdpSocket>,
    pub sealer: PacketSealer,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.socket.peer_addr().ok())
            .field("ssrc", &self.sealer.ssrc())
            .field("mode", &self.sealer.mode())
            .finish()
    }
}

pub(crate) struct PacedSender {
    frames: mpsc::Receiver<Bytes>,
    links: mpsc::UnboundedReceiver<Option<Link>>,
    link: Option<Link>,
    speaking: watch::Sender<bool>,
    stats: Arc<SenderStats>,
    cancel: CancellationToken,
    silence_left: usize,
}

impl PacedSender {
    pub fn new(
        frames: mpsc::Receiver<Bytes>,
        links: mpsc::UnboundedReceiver<Option<Link>>,
        speaking: watch::Sender<bool>,
        stats: Arc<SenderStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frames,
            links,
            link: None,
            speaking,
            stats,
            cancel,
            silence_left: 0,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.refresh_link() {
                break;
            }
            if self.link.is_none() {
                continue;
            }

            let payload = match self.frames.try_recv() {
                Ok(frame) => {
                    self.silence_left = SILENCE_FRAME_COUNT;
                    self.set_speaking(true);
                    frame
                }
                Err(mpsc::error::TryRecvError::Empty) if self.silence_left > 0 => {
                    self.silence_left -= 1;
                    Bytes::from_static(&SILENCE_FRAME)
                }
                Err(mpsc::error::TryRecvError::Empty) => continue,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            };
            self.write(&payload).await;

            if self.silence_left == 0 {
                self.set_speaking(false);
            }
        }
        self.set_speaking(false);
        tracing::debug!(
            sent = self.stats.sent_packets(),
            dropped = self.stats.dropped_packets(),
            "rtp sender stopped"
        );
    }

    /// Apply queued link changes. `false` once the connection is gone.
    fn refresh_link(&mut self) -> bool {
        loop {
            match self.links.try_recv() {
                Ok(link) => {
                    if link.is_none() {
                        self.silence_left = 0;
                        self.set_speaking(false);
                    }
                    self.link = link;
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    async fn write(&mut self, payload: &[u8]) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        // Sealing advances sequence, timestamp and nonce even if the write
        // below is dropped.
        let packet = match link.sealer.seal(payload) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(error = %err, "failed to seal rtp packet");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match tokio::time::timeout(FRAME_DURATION, link.socket.send(&packet)).await {
            Ok(Ok(_)) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(error = %err, dropped, "udp write failed, packet dropped");
            }
            Err(_) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(dropped, "udp write blocked for a frame, packet dropped");
            }
        }
    }

    fn set_speaking(&self, speaking: bool) {
        self.speaking.send_if_modified(|current| {
            let changed = *current != speaking;
            *current = speaking;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use cordwire_codec::crypto::open;
    use cordwire_codec::{EncryptionMode, SecretKey};

    use super::*;

    struct Harness {
        frames: mpsc::Sender<Bytes>,
        links: mpsc::UnboundedSender<Option<Link>>,
        speaking: watch::Receiver<bool>,
        stats: Arc<SenderStats>,
        cancel: CancellationToken,
        peer: UdpSocket,
        key: SecretKey,
    }

    async fn harness() -> anyhow::Result<Harness> {
        let peer = UdpSocket::bind("127.0.0.1:0").await?;
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect(peer.local_addr()?).await?;

        let key = SecretKey::new([3u8; 32]);
        let sealer = PacketSealer::new(&key, EncryptionMode::Lite, 0x1234)?;
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let (speaking_tx, speaking_rx) = watch::channel(false);
        let stats = Arc::new(SenderStats::default());
        let cancel = CancellationToken::new();

        links_tx.send(Some(Link {
            socket: Arc::new(socket),
            sealer,
        }))?;
        tokio::spawn(
            PacedSender::new(frames_rx, links_rx, speaking_tx, stats.clone(), cancel.clone()).run(),
        );
        Ok(Harness {
            frames: frames_tx,
            links: links_tx,
            speaking: speaking_rx,
            stats,
            cancel,
            peer,
            key,
        })
    }

    async fn next_packet(h: &Harness) -> anyhow::Result<(u16, Vec<u8>)> {
        let mut buf = [0u8; 1500];
        let n = tokio::time::timeout(Duration::from_secs(2), h.peer.recv(&mut buf)).await??;
        let (header, payload) = open(&h.key, EncryptionMode::Lite, &buf[..n])?;
        assert_eq!(header.ssrc, 0x1234);
        Ok((header.sequence, payload))
    }

    #[tokio::test]
    async fn audio_then_silence_then_quiet() -> anyhow::Result<()> {
        let mut h = harness().await?;
        h.frames.send(Bytes::from_static(&[1, 2, 3])).await?;
        h.frames.send(Bytes::from_static(&[4, 5, 6])).await?;

        assert_eq!(next_packet(&h).await?, (0, vec![1, 2, 3]));
        assert_eq!(next_packet(&h).await?, (1, vec![4, 5, 6]));
        for sequence in 2..7 {
            assert_eq!(next_packet(&h).await?, (sequence, SILENCE_FRAME.to_vec()));
        }

        h.speaking.wait_for(|speaking| !*speaking).await?;
        let mut buf = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(100), h.peer.recv(&mut buf)).await;
        assert!(quiet.is_err(), "sender kept transmitting");
        assert_eq!(h.stats.sent_packets(), 7);
        assert_eq!(h.stats.dropped_packets(), 0);

        h.cancel.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn frames_wait_for_a_link() -> anyhow::Result<()> {
        let mut h = harness().await?;
        h.links.send(None)?;
        tokio::time::sleep(FRAME_DURATION * 2).await;
        h.frames.send(Bytes::from_static(&[9])).await?;

        let mut buf = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(100), h.peer.recv(&mut buf)).await;
        assert!(quiet.is_err(), "sent without a link");
        assert!(!*h.speaking.borrow_and_update());

        h.cancel.cancel();
        Ok(())
    }
}
