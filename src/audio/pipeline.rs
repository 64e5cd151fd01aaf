use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::voice::AudioReady;
use crate::voice::constants::{SILENCE_FRAME, SILENCE_FRAME_COUNT, opcode};
use crate::voice::types::VoiceGatewayMessage;
use crate::voice::udp::UdpBackend;

use super::constants::{FRAME_CHANNEL_CAPACITY, FRAME_DURATION_MS, FRAME_SIZE};
use super::transcoder::Transcoder;

/// One playback: reads PCM off the transcoder, chops it into 20 ms frames
/// and transmits them encrypted at a steady cadence.
///
/// The reader and the send loop are separate tasks joined by a bounded
/// channel, so pacing never depends on transcoder throughput: a stalling
/// transcoder starves the channel, a racing one blocks on it.
pub struct AudioPipeline {
    cancel: CancellationToken,
    transcoder: parking_lot::Mutex<Transcoder>,
    send_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AudioPipeline {
    pub(crate) fn start(
        ready: AudioReady,
        speak_tx: mpsc::UnboundedSender<VoiceGatewayMessage>,
        mut transcoder: Transcoder,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        if let Some(stdout) = transcoder.take_stdout() {
            let reader_cancel = cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = reader_cancel.cancelled() => {}
                    _ = read_frames(stdout, frame_tx) => {}
                }
            });
        }

        let backend = UdpBackend::new(
            ready.socket,
            ready.address,
            ready.sequencer,
            ready.secret_key,
        );
        let send_task = tokio::spawn(send_loop(
            backend,
            ready.ssrc,
            speak_tx,
            frame_rx,
            cancel.clone(),
        ));

        Arc::new(Self {
            cancel,
            transcoder: parking_lot::Mutex::new(transcoder),
            send_task: tokio::sync::Mutex::new(Some(send_task)),
        })
    }

    /// Tears the playback down: cancels the send task and terminates the
    /// transcoder process. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.transcoder.lock().terminate();
    }

    /// Resolves once the send loop has finished, whether by stream
    /// exhaustion or by [`stop`](Self::stop).
    pub async fn finished(&self) {
        let task = self.send_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Chops a PCM byte stream into fixed frames. The final partial frame is
/// zero-padded to full size; every frame sent downstream is exactly
/// `FRAME_SIZE` bytes.
async fn read_frames<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        let mut frame = vec![0u8; FRAME_SIZE];
        let mut filled = 0;
        while filled < FRAME_SIZE {
            match reader.read(&mut frame[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    warn!("transcoder output read error: {e}");
                    return;
                }
            }
        }
        if filled == 0 {
            return; // Clean EOF on a frame boundary.
        }
        let partial = filled < FRAME_SIZE;
        if tx.send(frame).await.is_err() || partial {
            return;
        }
    }
}

/// Transmits frames at one per 20 ms, anchored to the interval's start so
/// per-frame jitter never accumulates into drift. Toggles the speaking
/// indicator on before the first frame; on exhaustion sends a short run of
/// silence frames and toggles it off.
async fn send_loop(
    mut backend: UdpBackend,
    ssrc: u32,
    speak_tx: mpsc::UnboundedSender<VoiceGatewayMessage>,
    mut frames: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(FRAME_DURATION_MS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut speaking = false;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else {
            // Stream exhausted: drain receiver-side interpolation with
            // silence before un-keying the indicator.
            if speaking {
                for _ in 0..SILENCE_FRAME_COUNT {
                    interval.tick().await;
                    if let Err(e) = backend.send_frame(SILENCE_FRAME).await {
                        warn!("failed to send silence frame: {e}");
                        break;
                    }
                }
            }
            break;
        };

        if !speaking {
            speaking = true;
            let _ = speak_tx.send(speaking_message(ssrc, true));
        }

        interval.tick().await;
        if let Err(e) = backend.send_frame(&frame).await {
            warn!("audio transmit error: {e}");
            break;
        }
    }

    if speaking {
        let _ = speak_tx.send(speaking_message(ssrc, false));
    }
    debug!("audio send loop finished");
}

/// Op 5 on the voice socket.
fn speaking_message(ssrc: u32, on: bool) -> VoiceGatewayMessage {
    VoiceGatewayMessage::new(
        opcode::SPEAKING,
        json!({
            "speaking": if on { 1 } else { 0 },
            "delay": 0,
            "ssrc": ssrc,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::udp::{RtpSequencer, open};
    use std::io::Cursor;
    use xsalsa20poly1305::aead::KeyInit;
    use xsalsa20poly1305::{Key, XSalsa20Poly1305};

    #[tokio::test]
    async fn chunker_pads_the_final_partial_frame() {
        let pcm = vec![0xABu8; FRAME_SIZE * 2 + 100];
        let (tx, mut rx) = mpsc::channel(8);
        read_frames(Cursor::new(pcm), tx).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), FRAME_SIZE);
        assert!(first.iter().all(|b| *b == 0xAB));
        rx.recv().await.unwrap();

        let last = rx.recv().await.unwrap();
        assert_eq!(last.len(), FRAME_SIZE);
        assert!(last[..100].iter().all(|b| *b == 0xAB));
        assert!(last[100..].iter().all(|b| *b == 0));

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn chunker_emits_nothing_for_an_empty_stream() {
        let (tx, mut rx) = mpsc::channel(8);
        read_frames(Cursor::new(Vec::<u8>::new()), tx).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn chunker_exact_multiple_has_no_padding_frame() {
        let pcm = vec![1u8; FRAME_SIZE * 3];
        let (tx, mut rx) = mpsc::channel(8);
        read_frames(Cursor::new(pcm), tx).await;
        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().len(), FRAME_SIZE);
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_loop_brackets_audio_with_speaking_toggles() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let key = [7u8; 32];
        let sequencer = Arc::new(parking_lot::Mutex::new(RtpSequencer::new(0x1111)));
        let backend = UdpBackend::new(client, server_addr, sequencer, key);
        let (speak_tx, mut speak_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(8);

        let task = tokio::spawn(send_loop(
            backend,
            0x1111,
            speak_tx,
            frame_rx,
            CancellationToken::new(),
        ));

        frame_tx.send(vec![0x55u8; FRAME_SIZE]).await.unwrap();
        drop(frame_tx);
        task.await.unwrap();

        let on = speak_rx.recv().await.unwrap();
        assert_eq!(on.op, opcode::SPEAKING);
        assert_eq!(on.d["speaking"], 1);
        let off = speak_rx.recv().await.unwrap();
        assert_eq!(off.d["speaking"], 0);

        // One audio packet, then the silence run, all decryptable.
        let cipher = XSalsa20Poly1305::new(Key::from_slice(&key));
        let mut buf = [0u8; 4096];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(open(&cipher, &buf[..n]).unwrap(), vec![0x55u8; FRAME_SIZE]);
        for _ in 0..SILENCE_FRAME_COUNT {
            let n = server.recv(&mut buf).await.unwrap();
            assert_eq!(open(&cipher, &buf[..n]).unwrap(), SILENCE_FRAME);
        }
    }

    #[tokio::test]
    async fn send_loop_without_frames_never_toggles_speaking() {
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sequencer = Arc::new(parking_lot::Mutex::new(RtpSequencer::new(1)));
        let backend = UdpBackend::new(client, server.local_addr().unwrap(), sequencer, [0u8; 32]);

        let (speak_tx, mut speak_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(1);
        drop(frame_tx);

        send_loop(backend, 1, speak_tx, frame_rx, CancellationToken::new()).await;
        assert!(speak_rx.recv().await.is_none());
    }
}
