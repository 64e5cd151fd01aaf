use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use crate::common::{ClientError, Result};
use crate::config::VoiceConfig;

use super::constants::{CHANNELS, SAMPLE_RATE};

/// Source material handed to the transcoder's stdin.
pub enum TranscodeInput {
    /// Fetched over HTTP and streamed into the process as it downloads.
    Url(String),
    /// Caller-supplied byte stream (a file, another process, a test buffer).
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl TranscodeInput {
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url(url.into())
    }
}

/// External transcoder process (ffmpeg by default): arbitrary audio in on
/// stdin, fixed 48 kHz stereo s16le PCM out on stdout. The process is an
/// opaque collaborator; this type only owns its lifecycle.
pub struct Transcoder {
    child: Child,
    stdout: Option<ChildStdout>,
    feeder: Option<tokio::task::JoinHandle<()>>,
}

impl Transcoder {
    /// Spawns the process and starts feeding `input` into its stdin. PCM
    /// becomes available on [`take_stdout`](Self::take_stdout) immediately;
    /// the feed runs concurrently with consumption.
    pub fn spawn(voice: &VoiceConfig, input: TranscodeInput) -> Result<Self> {
        let mut child = Command::new(&voice.transcoder)
            .arg("-i")
            .arg("pipe:0")
            .arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg(CHANNELS.to_string())
            .arg("-b:a")
            .arg(voice.bitrate.to_string())
            .arg("pipe:1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ClientError::Protocol("transcoder spawned without a stdout pipe".into())
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ClientError::Protocol("transcoder spawned without a stdin pipe".into())
        })?;
        debug!("transcoder process started (pid {:?})", child.id());

        let feeder = tokio::spawn(feed_stdin(stdin, input));

        Ok(Self {
            child,
            stdout: Some(stdout),
            feeder: Some(feeder),
        })
    }

    /// The PCM stream. Yields `Some` exactly once.
    pub(crate) fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Terminates the process and the stdin feed. Idempotent; safe to call
    /// after the process has already exited.
    pub fn terminate(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if let Err(e) = self.child.start_kill() {
            debug!("transcoder already gone: {e}");
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Writes the source into the child's stdin, then closes it so the process
/// flushes its remaining output and exits.
async fn feed_stdin(mut stdin: tokio::process::ChildStdin, input: TranscodeInput) {
    let result = match input {
        TranscodeInput::Url(url) => feed_url(&mut stdin, &url).await,
        TranscodeInput::Reader(mut reader) => tokio::io::copy(&mut reader, &mut stdin)
            .await
            .map(|_| ())
            .map_err(ClientError::from),
    };
    if let Err(e) = result {
        warn!("transcoder input stream ended early: {e}");
    }
    let _ = stdin.shutdown().await;
}

async fn feed_url(stdin: &mut tokio::process::ChildStdin, url: &str) -> Result<()> {
    let response = reqwest::get(url).await?.error_for_status()?;
    let mut response = response;
    while let Some(chunk) = response.chunk().await? {
        stdin.write_all(&chunk).await?;
    }
    Ok(())
}
