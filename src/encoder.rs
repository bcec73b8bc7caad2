//! Encoder process supervision.
//!
//! Runs the configured encoder with stdout piped into [`ingest`], and
//! relaunches it after a short delay whenever it exits, so a crashed or
//! finished encoder turns into a new stream session instead of a dead server.

use crate::broadcast::Broadcaster;
use crate::config::EncoderConfig;
use crate::ingest::{ingest, IngestSettings, IngestSummary};
use anyhow::{Context, Result};
use serde::Serialize;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of the supervised encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    /// Not running and not going to be (disabled, or supervisor finished).
    Stopped,
    Starting,
    Running,
    /// Exited; waiting out the restart delay.
    Restarting,
}

impl std::fmt::Display for EncoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Encoder state plus how many sessions have been launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncoderStatus {
    pub state: EncoderState,
    pub sessions: u64,
}

impl Default for EncoderStatus {
    fn default() -> Self {
        Self {
            state: EncoderState::Stopped,
            sessions: 0,
        }
    }
}

pub struct EncoderSupervisor {
    config: EncoderConfig,
    ingest: IngestSettings,
    broadcaster: Broadcaster,
    status: watch::Sender<EncoderStatus>,
}

impl EncoderSupervisor {
    pub fn new(config: EncoderConfig, ingest: IngestSettings, broadcaster: Broadcaster) -> Self {
        let (status, _) = watch::channel(EncoderStatus::default());
        Self {
            config,
            ingest,
            broadcaster,
            status,
        }
    }

    /// Watch the encoder status.
    pub fn status(&self) -> watch::Receiver<EncoderStatus> {
        self.status.subscribe()
    }

    /// Launch the encoder and keep relaunching it until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(program = %self.config.program, "Starting encoder supervisor");

        while !cancel.is_cancelled() {
            self.status.send_modify(|s| {
                s.state = EncoderState::Starting;
                s.sessions += 1;
            });

            match self.run_session(&cancel).await {
                Ok(Some(summary)) => {
                    tracing::info!(
                        media_segments = summary.media_segments,
                        bytes = summary.bytes_read,
                        "Encoder session ended"
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Encoder session failed: {:#}", e);
                }
            }

            self.set_state(EncoderState::Restarting);
            let delay = self.config.restart_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "Restarting encoder");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(EncoderState::Stopped);
        tracing::info!("Encoder supervisor stopped");
    }

    /// Run one encoder process to completion.
    ///
    /// Returns `Ok(None)` when cancelled.
    async fn run_session(&self, cancel: &CancellationToken) -> Result<Option<IngestSummary>> {
        let stderr = if self.config.log_stderr {
            Stdio::inherit()
        } else {
            Stdio::null()
        };

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch encoder: {}", self.config.program))?;

        let stdout = child
            .stdout
            .take()
            .context("Encoder stdout was not captured")?;

        tracing::info!(pid = child.id(), "Encoder started");
        self.set_state(EncoderState::Running);

        let outcome = tokio::select! {
            result = ingest(stdout, &self.broadcaster, self.ingest) => Some(result),
            _ = cancel.cancelled() => None,
        };

        // The pipe may close before the process exits, and a framing error
        // leaves it running; either way it must not outlive this session.
        if let Err(e) = child.start_kill() {
            tracing::debug!("Encoder already exited: {}", e);
        }
        match child.wait().await {
            Ok(status) => tracing::debug!(%status, "Encoder exited"),
            Err(e) => tracing::warn!("Failed to reap encoder: {}", e),
        }

        match outcome {
            Some(result) => Ok(Some(result.context("Encoder output ingest failed")?)),
            None => Ok(None),
        }
    }

    fn set_state(&self, state: EncoderState) {
        self.status.send_modify(|s| s.state = state);
    }
}
