//! Playback session driver.

use crate::buffer::{BufferConfig, BufferManager, DecodeBuffer};
use crate::capability::{
    default_codecs, select_path, Capabilities, CodecProfile, FallbackReason, PlaybackPath,
};
use crate::error::Result;
use crate::fetch::{ChunkSink, FetchOutcome, StreamFetch};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Host environment the player runs in.
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    type Buffer: DecodeBuffer;

    fn capabilities(&self) -> Capabilities;

    /// Whether a decode buffer could be opened for `codec`.
    fn is_type_supported(&self, codec: &CodecProfile) -> bool;

    /// Open a decode buffer for `codec`.
    async fn open_buffer(&self, codec: &CodecProfile) -> Result<Self::Buffer>;

    /// Play `url` with the platform's own player until it ends or `cancel`
    /// fires.
    async fn play_native(&self, url: &str, cancel: &CancellationToken) -> Result<FetchOutcome>;
}

/// What the user sees.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerStatus {
    Idle,
    Selecting,
    /// Stream requested, nothing appended yet.
    Buffering,
    Playing,
    /// Native playback in progress.
    Fallback(FallbackReason),
    /// The server ended the stream.
    Ended,
    /// Stopped by the user.
    Stopped,
    Failed(String),
}

impl std::fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Selecting => write!(f, "selecting"),
            Self::Buffering => write!(f, "buffering"),
            Self::Playing => write!(f, "playing"),
            Self::Fallback(reason) => write!(f, "native playback ({})", reason),
            Self::Ended => write!(f, "stream ended"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub stream_url: String,
    /// Acceptable codec profiles, most compatible first.
    pub codecs: Vec<CodecProfile>,
    pub buffer: BufferConfig,
    /// Pause before re-entering path selection after an end or error.
    pub retry_delay: Duration,
    /// Sessions retried after the first; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl PlayerConfig {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            codecs: default_codecs(),
            buffer: BufferConfig::default(),
            retry_delay: Duration::from_secs(2),
            max_retries: None,
        }
    }
}

/// Forwards chunks into the buffer and flips the status to `Playing` on the
/// first successful append.
struct SessionSink<'a, B> {
    manager: BufferManager<B>,
    status: &'a watch::Sender<PlayerStatus>,
    playing: bool,
}

#[async_trait]
impl<B: DecodeBuffer> ChunkSink for SessionSink<'_, B> {
    async fn accept(&mut self, chunk: Bytes) -> Result<()> {
        self.manager.append(chunk).await?;
        if !self.playing {
            self.playing = true;
            self.status.send_replace(PlayerStatus::Playing);
        }
        Ok(())
    }
}

pub struct Player<P> {
    platform: P,
    config: PlayerConfig,
    client: reqwest::Client,
    status: watch::Sender<PlayerStatus>,
}

impl<P: MediaPlatform> Player<P> {
    pub fn new(platform: P, config: PlayerConfig) -> Self {
        Self::with_client(platform, config, reqwest::Client::new())
    }

    pub fn with_client(platform: P, config: PlayerConfig, client: reqwest::Client) -> Self {
        let (status, _) = watch::channel(PlayerStatus::Idle);
        Self {
            platform,
            config,
            client,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<PlayerStatus> {
        self.status.subscribe()
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Run one session from path selection to the end of the stream.
    pub async fn run_session(&self, cancel: &CancellationToken) -> Result<FetchOutcome> {
        self.set_status(PlayerStatus::Selecting);
        let caps = self.platform.capabilities();
        let path = select_path(&caps, &self.config.codecs, |codec| {
            self.platform.is_type_supported(codec)
        });
        tracing::info!(?path, "Selected playback path");

        let buffer = match path {
            PlaybackPath::Buffered(codec) => self.open_buffer(codec).await,
            PlaybackPath::Fallback(reason) => Err(reason),
        };

        match buffer {
            Ok(buffer) => self.play_buffered(buffer, cancel).await,
            Err(reason) => {
                self.set_status(PlayerStatus::Fallback(reason));
                self.platform
                    .play_native(&self.config.stream_url, cancel)
                    .await
            }
        }
    }

    /// Open a buffer for `preferred`, then any other supported profile.
    async fn open_buffer(
        &self,
        preferred: CodecProfile,
    ) -> std::result::Result<P::Buffer, FallbackReason> {
        let candidates = std::iter::once(&preferred).chain(
            self.config
                .codecs
                .iter()
                .filter(|c| **c != preferred && self.platform.is_type_supported(c)),
        );

        for codec in candidates {
            match self.platform.open_buffer(codec).await {
                Ok(buffer) => return Ok(buffer),
                Err(e) => tracing::warn!(%codec, "Failed to open decode buffer: {}", e),
            }
        }
        Err(FallbackReason::BufferSetupFailed)
    }

    async fn play_buffered(
        &self,
        buffer: P::Buffer,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        self.set_status(PlayerStatus::Buffering);
        let fetch = StreamFetch::new(self.client.clone(), self.config.stream_url.clone());
        let mut sink = SessionSink {
            manager: BufferManager::new(buffer, self.config.buffer),
            status: &self.status,
            playing: false,
        };

        let outcome = fetch.run(&mut sink, cancel).await?;
        if outcome == FetchOutcome::Ended {
            sink.manager.finish().await;
        }
        let stats = sink.manager.stats();
        tracing::info!(
            appends = stats.appends,
            bytes = stats.bytes,
            trims = stats.trims,
            ?outcome,
            "Buffered session finished"
        );
        Ok(outcome)
    }

    /// Run sessions until cancelled or out of retries.
    ///
    /// Every retry starts again from path selection. Returns the final
    /// status.
    pub async fn run_with_retry(&self, cancel: &CancellationToken) -> PlayerStatus {
        let mut retries = 0u32;
        loop {
            let status = match self.run_session(cancel).await {
                Ok(FetchOutcome::Cancelled) => {
                    self.set_status(PlayerStatus::Stopped);
                    return PlayerStatus::Stopped;
                }
                Ok(FetchOutcome::Ended) => PlayerStatus::Ended,
                Err(e) => {
                    tracing::warn!("Playback session failed: {}", e);
                    PlayerStatus::Failed(e.to_string())
                }
            };
            self.set_status(status.clone());

            if self.config.max_retries.is_some_and(|max| retries >= max) {
                return status;
            }
            retries += 1;

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_status(PlayerStatus::Stopped);
                    return PlayerStatus::Stopped;
                }
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
            tracing::info!(attempt = retries, "Retrying playback");
        }
    }

    fn set_status(&self, status: PlayerStatus) {
        tracing::debug!(%status, "Player status");
        self.status.send_replace(status);
    }
}
