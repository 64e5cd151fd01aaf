use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Key, Nonce, XSalsa20Poly1305};

use crate::common::{ClientError, Result};

use super::constants::{
    DISCOVERY_PACKET_SIZE, IP_DISCOVERY_TIMEOUT_SECS, RTP_PAYLOAD_TYPE, RTP_TIMESTAMP_STEP,
    RTP_VERSION_BYTE,
};

/// Builds the 70-byte IP discovery request:
/// `type=0x0001 (2B) | length (2B) | ssrc (4B BE) | zero padding`.
pub fn discovery_packet(ssrc: u32) -> [u8; DISCOVERY_PACKET_SIZE] {
    let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
    packet[0..2].copy_from_slice(&1u16.to_be_bytes());
    packet[2..4].copy_from_slice(&(DISCOVERY_PACKET_SIZE as u16).to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Parses the discovery reply: the server echoes the ssrc and appends a
/// null-terminated IP string plus the external port as 2 bytes big-endian at
/// the very end.
pub fn parse_discovery_reply(buf: &[u8]) -> Result<(String, u16)> {
    if buf.len() < 12 {
        return Err(ClientError::Protocol(
            "IP discovery reply too short".into(),
        ));
    }
    let address_block = &buf[8..buf.len() - 2];
    let ip_end = address_block
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(address_block.len());
    let ip = std::str::from_utf8(&address_block[..ip_end])
        .map_err(|e| ClientError::Protocol(format!("IP discovery reply not ASCII: {e}")))?
        .to_string();
    if ip.is_empty() {
        return Err(ClientError::Protocol(
            "IP discovery reply missing address".into(),
        ));
    }
    let port = u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
    Ok((ip, port))
}

/// Performs UDP IP discovery against the voice server: one request datagram,
/// one echoed reply carrying our externally visible address.
pub async fn discover_ip(
    socket: &tokio::net::UdpSocket,
    addr: SocketAddr,
    ssrc: u32,
) -> Result<(String, u16)> {
    socket.send_to(&discovery_packet(ssrc), addr).await?;

    let mut buf = [0u8; 128];
    let timeout = std::time::Duration::from_secs(IP_DISCOVERY_TIMEOUT_SECS);
    match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => parse_discovery_reply(&buf[..n]),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ClientError::Transport("IP discovery timed out".into())),
    }
}

/// Frame counter state for one keyed voice transport: `sequence` wraps at
/// 2^16, `timestamp` at 2^32, each advanced exactly once per transmitted
/// frame.
///
/// The sequencer lives as long as the secret key and is shared by every
/// playback on the session. The nonce is derived from the header, so a
/// counter restart under the same key would reuse nonces; initial values
/// are randomized for the same reason.
pub struct RtpSequencer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpSequencer {
    pub fn new(ssrc: u32) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            ssrc,
            sequence: rng.r#gen(),
            timestamp: rng.r#gen(),
        }
    }

    /// Produces the 12-byte header for the next frame and advances the
    /// counters: `0x80 0x78 | seq (BE16) | timestamp (BE32) | ssrc (BE32)`.
    pub fn next_header(&mut self) -> [u8; 12] {
        let mut header = [0u8; 12];
        header[0] = RTP_VERSION_BYTE;
        header[1] = RTP_PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(RTP_TIMESTAMP_STEP);
        header
    }
}

/// Seals `payload` for transmission: nonce is the header zero-padded to 24
/// bytes, output is `header || ciphertext`.
pub fn seal(cipher: &XSalsa20Poly1305, header: &[u8; 12], payload: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; 24];
    nonce[..12].copy_from_slice(header);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| ClientError::Crypto)?;

    let mut packet = Vec::with_capacity(12 + sealed.len());
    packet.extend_from_slice(header);
    packet.extend_from_slice(&sealed);
    Ok(packet)
}

/// Inverse of [`seal`]: recovers the payload of a full packet.
pub fn open(cipher: &XSalsa20Poly1305, packet: &[u8]) -> Result<Vec<u8>> {
    if packet.len() < 12 {
        return Err(ClientError::Crypto);
    }
    let mut nonce = [0u8; 24];
    nonce[..12].copy_from_slice(&packet[..12]);

    cipher
        .decrypt(Nonce::from_slice(&nonce), &packet[12..])
        .map_err(|_| ClientError::Crypto)
}

/// Encrypting UDP transmitter for one playback. The sequencer is the
/// session's, shared across playbacks, so consecutive pipelines continue
/// the sequence instead of restarting it.
pub struct UdpBackend {
    socket: Arc<tokio::net::UdpSocket>,
    address: SocketAddr,
    cipher: XSalsa20Poly1305,
    sequencer: Arc<Mutex<RtpSequencer>>,
}

impl UdpBackend {
    pub fn new(
        socket: Arc<tokio::net::UdpSocket>,
        address: SocketAddr,
        sequencer: Arc<Mutex<RtpSequencer>>,
        secret_key: [u8; 32],
    ) -> Self {
        Self {
            socket,
            address,
            cipher: XSalsa20Poly1305::new(Key::from_slice(&secret_key)),
            sequencer,
        }
    }

    /// Seals and transmits one frame, advancing seq/timestamp exactly once.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let header = self.sequencer.lock().next_header();
        let packet = seal(&self.cipher, &header, payload)?;
        self.socket.send_to(&packet, self.address).await?;
        Ok(())
    }
}
