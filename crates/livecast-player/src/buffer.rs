//! Decode buffer management.
//!
//! [`BufferManager`] owns the single open [`DecodeBuffer`] of a session and
//! appends received bytes into it strictly one operation at a time. It
//! recovers once from a full buffer by trimming already-played media, and
//! trims old media periodically so long sessions stay bounded.
//!
//! No removal ever reaches the current playback position.

use crate::error::{AppendError, PlayerError, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Buffered media time range in seconds, `start < end`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Platform decode buffer.
///
/// `append` and `remove` start an operation; `idle` waits until the
/// operation in flight (if any) has finished.
#[async_trait]
pub trait DecodeBuffer: Send {
    /// Wait until no append or remove is in flight.
    async fn idle(&mut self);

    /// Start appending `data`.
    async fn append(&mut self, data: Bytes) -> std::result::Result<(), AppendError>;

    /// Start removing media in `[start, end)` seconds.
    async fn remove(&mut self, start: f64, end: f64) -> std::result::Result<(), AppendError>;

    /// Span of buffered media, `None` when empty.
    fn buffered(&self) -> Option<TimeRange>;

    /// Current playback position in seconds.
    fn position(&self) -> f64;

    /// Signal that no more data will be appended.
    async fn end_of_stream(&mut self) {}
}

/// Trimming thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferConfig {
    /// Media kept behind playback when trimming to recover from a full buffer.
    pub quota_trim_margin_secs: f64,
    /// Media kept behind playback by the periodic trim.
    pub retention_secs: f64,
    /// Run the periodic trim after this many successful appends.
    pub trim_every_appends: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            quota_trim_margin_secs: 3.0,
            retention_secs: 30.0,
            trim_every_appends: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub appends: u64,
    pub bytes: u64,
    pub trims: u64,
    pub quota_recoveries: u64,
}

pub struct BufferManager<B> {
    buffer: B,
    config: BufferConfig,
    stats: BufferStats,
}

impl<B: DecodeBuffer> BufferManager<B> {
    pub fn new(buffer: B, config: BufferConfig) -> Self {
        Self {
            buffer,
            config,
            stats: BufferStats::default(),
        }
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Append the next received bytes.
    pub async fn append(&mut self, data: Bytes) -> Result<()> {
        let len = data.len() as u64;

        self.buffer.idle().await;
        match self.buffer.append(data.clone()).await {
            Ok(()) => {}
            Err(AppendError::QuotaExceeded) => self.recover_from_quota(data).await?,
            Err(e) => return Err(e.into()),
        }

        self.stats.appends += 1;
        self.stats.bytes += len;

        let every = self.config.trim_every_appends.max(1);
        if self.stats.appends % every == 0 {
            self.trim_history().await?;
        }
        Ok(())
    }

    /// Flush and mark the end of the stream.
    pub async fn finish(&mut self) {
        self.buffer.idle().await;
        self.buffer.end_of_stream().await;
    }

    async fn recover_from_quota(&mut self, data: Bytes) -> Result<()> {
        self.buffer.idle().await;

        let position = self.buffer.position();
        let Some(range) = self.buffer.buffered() else {
            return Err(PlayerError::exhausted("quota exceeded with nothing buffered"));
        };

        let trim_end = position - self.config.quota_trim_margin_secs;
        if !self.remove_behind(range.start, trim_end).await? {
            return Err(PlayerError::exhausted(format!(
                "quota exceeded with no played media to trim (position {:.2}s, buffered {:.2}s-{:.2}s)",
                position, range.start, range.end
            )));
        }
        self.buffer.idle().await;

        tracing::debug!(position, trim_end, "Retrying append after trimming");
        match self.buffer.append(data).await {
            Ok(()) => {
                self.stats.quota_recoveries += 1;
                Ok(())
            }
            Err(AppendError::QuotaExceeded) => {
                Err(PlayerError::exhausted("quota exceeded again after trimming"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop media older than the retention window behind playback.
    async fn trim_history(&mut self) -> Result<()> {
        let position = self.buffer.position();
        let Some(range) = self.buffer.buffered() else {
            return Ok(());
        };
        if position - range.start <= self.config.retention_secs {
            return Ok(());
        }

        self.buffer.idle().await;
        self.remove_behind(range.start, position - self.config.retention_secs)
            .await?;
        Ok(())
    }

    /// Remove `[start, end)` clamped to end at or before the playback
    /// position. Returns `false` when nothing was left to remove.
    async fn remove_behind(&mut self, start: f64, end: f64) -> Result<bool> {
        let end = end.min(self.buffer.position());
        if end <= start {
            return Ok(false);
        }

        self.buffer.remove(start, end).await?;
        self.stats.trims += 1;
        tracing::debug!(start, end, "Trimmed decode buffer");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBuffer;

    fn segment() -> Bytes {
        Bytes::from_static(&[0u8; 16])
    }

    #[tokio::test]
    async fn test_appends_in_order() {
        let mut manager = BufferManager::new(FakeBuffer::new(100), BufferConfig::default());
        for i in 0..5u8 {
            manager.append(Bytes::from(vec![i; 4])).await.unwrap();
        }

        let appended: Vec<u8> = manager.buffer().appended.iter().map(|b| b[0]).collect();
        assert_eq!(appended, vec![0, 1, 2, 3, 4]);
        assert_eq!(manager.stats().appends, 5);
        assert_eq!(manager.stats().bytes, 20);
        assert_eq!(manager.buffer().busy_violations, 0);
    }

    #[tokio::test]
    async fn test_quota_recovery_trims_behind_playback() {
        let config = BufferConfig {
            trim_every_appends: 1000,
            ..BufferConfig::default()
        };
        let mut manager = BufferManager::new(FakeBuffer::new(10), config);
        for _ in 0..10 {
            manager.append(segment()).await.unwrap();
        }
        manager.buffer_mut().position = 8.0;

        manager.append(segment()).await.unwrap();

        let buffer = manager.buffer();
        assert_eq!(buffer.removed, vec![(0.0, 5.0)]);
        assert_eq!(buffer.buffered(), Some(TimeRange::new(5.0, 11.0)));
        assert_eq!(buffer.position, 8.0);
        assert_eq!(manager.stats().quota_recoveries, 1);
        assert_eq!(manager.stats().appends, 11);
        assert_eq!(buffer.busy_violations, 0);
    }

    #[tokio::test]
    async fn test_quota_with_played_history_inside_margin_is_fatal() {
        let mut manager = BufferManager::new(FakeBuffer::new(4), BufferConfig::default());
        for _ in 0..4 {
            manager.append(segment()).await.unwrap();
        }
        manager.buffer_mut().position = 2.0;

        let err = manager.append(segment()).await.unwrap_err();
        assert!(matches!(err, PlayerError::BufferExhausted(_)));
        assert!(manager.buffer().removed.is_empty());
    }

    #[tokio::test]
    async fn test_second_quota_failure_is_fatal() {
        let mut manager = BufferManager::new(FakeBuffer::new(10), BufferConfig::default());
        for _ in 0..10 {
            manager.append(segment()).await.unwrap();
        }
        manager.buffer_mut().position = 9.0;
        manager.buffer_mut().always_full = true;

        let err = manager.append(segment()).await.unwrap_err();
        assert!(err.to_string().contains("again after trimming"));
        // Exactly one trim, exactly one retry.
        assert_eq!(manager.buffer().removed.len(), 1);
        assert_eq!(manager.buffer().append_attempts, 12);
    }

    #[tokio::test]
    async fn test_periodic_trim_keeps_retention_window() {
        let config = BufferConfig {
            retention_secs: 5.0,
            trim_every_appends: 4,
            ..BufferConfig::default()
        };
        let mut manager = BufferManager::new(FakeBuffer::new(1000), config);

        for i in 1..=20u32 {
            manager.buffer_mut().position = f64::from(i) - 1.0;
            manager.append(segment()).await.unwrap();
        }

        let buffer = manager.buffer();
        assert!(!buffer.removed.is_empty());
        for (start, end) in &buffer.removed {
            assert!(start < end);
        }
        let range = buffer.buffered().unwrap();
        assert!(buffer.position - range.start <= 5.0 + 1e-9);
        assert_eq!(manager.stats().trims as usize, buffer.removed.len());
    }

    #[tokio::test]
    async fn test_periodic_trim_waits_for_playback() {
        let config = BufferConfig {
            retention_secs: 5.0,
            trim_every_appends: 2,
            ..BufferConfig::default()
        };
        let mut manager = BufferManager::new(FakeBuffer::new(1000), config);
        for _ in 0..20 {
            manager.append(segment()).await.unwrap();
        }
        // Playback never started, so nothing is behind it.
        assert!(manager.buffer().removed.is_empty());
    }

    #[tokio::test]
    async fn test_never_trims_at_or_ahead_of_playback() {
        let config = BufferConfig {
            quota_trim_margin_secs: 3.0,
            retention_secs: 4.0,
            trim_every_appends: 3,
        };
        let mut manager = BufferManager::new(FakeBuffer::new(6), config);

        for i in 0..40u32 {
            manager.buffer_mut().position = f64::from(i);
            manager.append(segment()).await.unwrap();
            let buffer = manager.buffer();
            for (_, end) in &buffer.removed {
                assert!(*end <= buffer.position);
            }
        }
        assert!(manager.stats().quota_recoveries > 0);
        assert_eq!(manager.buffer().busy_violations, 0);
    }

    #[tokio::test]
    async fn test_other_append_errors_propagate() {
        let mut manager = BufferManager::new(FakeBuffer::new(10), BufferConfig::default());
        manager.buffer_mut().fail_with = Some(AppendError::Decode("bad data".into()));

        let err = manager.append(segment()).await.unwrap_err();
        assert!(matches!(err, PlayerError::Append(AppendError::Decode(_))));
    }

    #[tokio::test]
    async fn test_finish_signals_end_of_stream() {
        let mut manager = BufferManager::new(FakeBuffer::new(10), BufferConfig::default());
        manager.append(segment()).await.unwrap();
        manager.finish().await;
        assert!(manager.buffer().ended);
    }
}
