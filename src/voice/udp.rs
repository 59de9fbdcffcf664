use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::crypto::PacketCipher;
use super::rtp;
use crate::error::{Error, Result};

/// Fixed size of the address discovery datagram and its reply.
pub const DISCOVERY_LEN: usize = 70;

/// Opus frame cadence: one packet every 20ms, 960 samples at 48kHz.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);
pub const SAMPLES_PER_FRAME: u32 = 960;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 2048;

/// One received, decrypted media packet.
#[derive(Debug, Clone)]
pub struct VoicePacket {
    pub ssrc: u32,
    pub sequence: u16,
    pub timestamp: u32,
    pub opus: Vec<u8>,
}

/// Send the fixed-size discovery datagram carrying our ssrc and parse the
/// reply for the externally visible address and port. Bounded wait; media
/// must not flow until the result is reported back over signaling.
pub async fn discover_external_addr(udp: &UdpSocket, ssrc: u32) -> Result<(String, u16)> {
    let mut packet = [0u8; DISCOVERY_LEN];
    packet[..4].copy_from_slice(&ssrc.to_be_bytes());
    udp.send(&packet).await?;

    let mut reply = [0u8; DISCOVERY_LEN];
    let n = tokio::time::timeout(DISCOVERY_TIMEOUT, udp.recv(&mut reply))
        .await
        .map_err(|_| Error::Timeout("udp discovery"))??;
    if n < DISCOVERY_LEN {
        return Err(Error::Protocol("short discovery reply"));
    }
    parse_discovery_reply(&reply)
}

/// Reply layout: ssrc in the first 4 bytes, then the address as a
/// nul-terminated string, with the little-endian port in the last 2 bytes.
pub fn parse_discovery_reply(reply: &[u8; DISCOVERY_LEN]) -> Result<(String, u16)> {
    let addr_bytes = &reply[4..DISCOVERY_LEN - 2];
    let end = addr_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(addr_bytes.len());
    let address = std::str::from_utf8(&addr_bytes[..end])
        .map_err(|_| Error::Protocol("discovery reply address not utf-8"))?
        .to_string();
    if address.is_empty() {
        return Err(Error::Protocol("discovery reply without address"));
    }
    let port = u16::from_le_bytes([reply[DISCOVERY_LEN - 2], reply[DISCOVERY_LEN - 1]]);
    Ok((address, port))
}

/// Media sender loop. Owns the sequence and timestamp counters exclusively;
/// no other task mutates them. Emits one datagram per opus frame at the
/// codec cadence — the remote decoder expects real-time pacing, so this is
/// not a throughput path.
pub(crate) async fn send_loop(
    udp: Arc<UdpSocket>,
    cipher: Arc<PacketCipher>,
    ssrc: u32,
    mut opus_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut sequence: u16 = 0;
    let mut timestamp: u32 = 0;
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = opus_rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let header = rtp::encode_header(sequence, timestamp, ssrc);
        match cipher.seal(&header, &frame) {
            Ok(packet) => {
                if let Err(err) = udp.send(&packet).await {
                    tracing::warn!(%err, "voice udp send failed");
                    cancel.cancel();
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(%err, "voice packet seal failed");
                cancel.cancel();
                return;
            }
        }

        sequence = sequence.wrapping_add(1);
        let (next, wrapped) = timestamp.overflowing_add(SAMPLES_PER_FRAME);
        if wrapped {
            // The nonce is derived from (sequence, timestamp, ssrc); a
            // wrapped timestamp would repeat nonces under this key. Stop and
            // force renegotiation instead.
            tracing::warn!("{}", Error::NonceExhausted);
            cancel.cancel();
            return;
        }
        timestamp = next;
    }
}

/// Media receiver loop: decrypt, drop-and-count authentication failures,
/// deliver the rest into the bounded packet channel.
pub(crate) async fn recv_loop(
    udp: Arc<UdpSocket>,
    cipher: Arc<PacketCipher>,
    packet_tx: mpsc::Sender<VoicePacket>,
    auth_failures: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            result = udp.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(%err, "voice udp recv failed");
                    cancel.cancel();
                    return;
                }
            },
        };

        match cipher.open(&buf[..n]) {
            Ok((header, opus)) => {
                let packet = VoicePacket {
                    ssrc: header.ssrc,
                    sequence: header.sequence,
                    timestamp: header.timestamp,
                    opus,
                };
                if packet_tx.send(packet).await.is_err() {
                    return;
                }
            }
            Err(_) => {
                // Never delivered; recovery is local to this packet.
                auth_failures.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("dropped voice packet failing authentication");
            }
        }
    }
}
