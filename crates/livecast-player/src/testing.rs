//! In-memory platform doubles for unit tests.

use crate::buffer::{DecodeBuffer, TimeRange};
use crate::capability::{default_codecs, Capabilities, CodecProfile};
use crate::error::{AppendError, PlayerError, Result};
use crate::fetch::FetchOutcome;
use crate::player::MediaPlatform;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Decode buffer where every append adds one second of media and at most
/// `capacity` seconds fit.
#[derive(Debug, Default)]
pub struct FakeBuffer {
    pub capacity: f64,
    pub start: f64,
    pub end: f64,
    pub position: f64,
    pub busy: bool,
    /// Operations started while another was in flight.
    pub busy_violations: usize,
    pub append_attempts: usize,
    pub appended: Vec<Bytes>,
    pub removed: Vec<(f64, f64)>,
    pub always_full: bool,
    pub fail_with: Option<AppendError>,
    pub ended: bool,
    pub appended_bytes: Option<Arc<AtomicUsize>>,
}

impl FakeBuffer {
    pub fn new(capacity_secs: u32) -> Self {
        Self {
            capacity: f64::from(capacity_secs),
            ..Self::default()
        }
    }
}

#[async_trait]
impl DecodeBuffer for FakeBuffer {
    async fn idle(&mut self) {
        tokio::task::yield_now().await;
        self.busy = false;
    }

    async fn append(&mut self, data: Bytes) -> std::result::Result<(), AppendError> {
        self.append_attempts += 1;
        if self.busy {
            self.busy_violations += 1;
            return Err(AppendError::Busy);
        }
        if let Some(err) = self.fail_with.clone() {
            return Err(err);
        }
        if self.always_full || (self.end - self.start) + 1.0 > self.capacity {
            return Err(AppendError::QuotaExceeded);
        }

        self.end += 1.0;
        if let Some(counter) = &self.appended_bytes {
            counter.fetch_add(data.len(), Ordering::SeqCst);
        }
        self.appended.push(data);
        self.busy = true;
        Ok(())
    }

    async fn remove(&mut self, start: f64, end: f64) -> std::result::Result<(), AppendError> {
        if self.busy {
            self.busy_violations += 1;
            return Err(AppendError::Busy);
        }
        self.removed.push((start, end));
        if start <= self.start {
            self.start = end.min(self.end);
        }
        self.busy = true;
        Ok(())
    }

    fn buffered(&self) -> Option<TimeRange> {
        (self.end > self.start).then(|| TimeRange::new(self.start, self.end))
    }

    fn position(&self) -> f64 {
        self.position
    }

    async fn end_of_stream(&mut self) {
        self.ended = true;
    }
}

/// Platform whose buffers are [`FakeBuffer`]s and whose native player
/// finishes immediately.
#[derive(Debug)]
pub struct FakePlatform {
    pub caps: Capabilities,
    pub supported: Vec<CodecProfile>,
    pub open_fails_for: Vec<CodecProfile>,
    pub opened: Arc<Mutex<Vec<CodecProfile>>>,
    pub appended_bytes: Arc<AtomicUsize>,
    pub native_plays: AtomicUsize,
    pub capability_queries: AtomicUsize,
}

impl FakePlatform {
    pub fn desktop() -> Self {
        Self {
            caps: Capabilities::full(),
            supported: default_codecs(),
            open_fails_for: Vec::new(),
            opened: Arc::new(Mutex::new(Vec::new())),
            appended_bytes: Arc::new(AtomicUsize::new(0)),
            native_plays: AtomicUsize::new(0),
            capability_queries: AtomicUsize::new(0),
        }
    }

    pub fn mobile() -> Self {
        Self {
            caps: Capabilities {
                mobile: true,
                ..Capabilities::full()
            },
            ..Self::desktop()
        }
    }
}

#[async_trait]
impl MediaPlatform for FakePlatform {
    type Buffer = FakeBuffer;

    fn capabilities(&self) -> Capabilities {
        self.capability_queries.fetch_add(1, Ordering::SeqCst);
        self.caps
    }

    fn is_type_supported(&self, codec: &CodecProfile) -> bool {
        self.supported.contains(codec)
    }

    async fn open_buffer(&self, codec: &CodecProfile) -> Result<FakeBuffer> {
        if self.open_fails_for.contains(codec) || !self.supported.contains(codec) {
            return Err(PlayerError::OpenBuffer {
                codec: codec.to_string(),
                reason: "not supported".to_string(),
            });
        }
        self.opened
            .lock()
            .map_err(|_| PlayerError::Native("poisoned".into()))?
            .push(codec.clone());
        Ok(FakeBuffer {
            capacity: 1_000_000.0,
            appended_bytes: Some(Arc::clone(&self.appended_bytes)),
            ..FakeBuffer::default()
        })
    }

    async fn play_native(&self, _url: &str, cancel: &CancellationToken) -> Result<FetchOutcome> {
        self.native_plays.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Cancelled);
        }
        Ok(FetchOutcome::Ended)
    }
}
