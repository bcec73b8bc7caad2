//! Per-viewer delivery queue.

use super::SharedSegment;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

/// Unique identifier for a connected viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a new random client ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ClientId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why the server ended a viewer's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The viewer went away or its handle was dropped.
    Disconnected,
    /// A different init segment arrived; the viewer's decoder state is stale.
    Discontinuity,
    /// The queue stayed full longer than the slow-client timeout.
    TooSlow,
    /// Server shutdown.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Discontinuity => "discontinuity",
            Self::TooSlow => "too_slow",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Outcome of offering a segment to one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queued after evicting the oldest pending segment.
    DroppedOldest,
    /// Queue has been full past the stall limit; nothing was queued.
    Stalled,
    /// Connection already closed; nothing was queued.
    Closed,
}

/// Point-in-time view of one viewer.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub id: ClientId,
    pub connected_at: DateTime<Utc>,
    pub init_generation: u64,
    pub queued: usize,
    pub delivered_segments: u64,
    pub delivered_bytes: u64,
    pub dropped_segments: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    segments: VecDeque<SharedSegment>,
    /// When the queue last became full; cleared whenever the viewer takes one.
    full_since: Option<Instant>,
}

/// Bounded drop-oldest queue feeding one viewer.
///
/// The broadcaster is the only producer and the viewer's stream the only
/// consumer. Offers never block.
#[derive(Debug)]
pub struct ClientConnection {
    id: ClientId,
    capacity: usize,
    init_generation: u64,
    connected_at: DateTime<Utc>,
    state: Mutex<QueueState>,
    notify: Notify,
    open: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    delivered_segments: AtomicU64,
    delivered_bytes: AtomicU64,
    dropped_segments: AtomicU64,
}

impl ClientConnection {
    /// Create a connection for a viewer that received the init segment of
    /// `init_generation`.
    pub fn new(capacity: usize, init_generation: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: ClientId::new(),
            capacity,
            init_generation,
            connected_at: Utc::now(),
            state: Mutex::new(QueueState {
                segments: VecDeque::with_capacity(capacity),
                full_since: None,
            }),
            notify: Notify::new(),
            open: AtomicBool::new(true),
            close_reason: Mutex::new(None),
            delivered_segments: AtomicU64::new(0),
            delivered_bytes: AtomicU64::new(0),
            dropped_segments: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn init_generation(&self) -> u64 {
        self.init_generation
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Enqueue a segment without waiting.
    ///
    /// A full queue loses its oldest entry, unless it has been full for at
    /// least `stall_limit`, in which case the offer is refused with
    /// [`Offer::Stalled`] and the caller should close the connection.
    pub fn offer(&self, segment: SharedSegment, now: Instant, stall_limit: Duration) -> Offer {
        if !self.is_open() {
            return Offer::Closed;
        }

        let outcome = {
            let mut state = self.state.lock();
            let outcome = if state.segments.len() >= self.capacity {
                let since = *state.full_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= stall_limit {
                    return Offer::Stalled;
                }
                state.segments.pop_front();
                self.dropped_segments.fetch_add(1, Ordering::Relaxed);
                Offer::DroppedOldest
            } else {
                Offer::Queued
            };
            state.segments.push_back(segment);
            if state.segments.len() >= self.capacity {
                state.full_since.get_or_insert(now);
            }
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next segment.
    ///
    /// Returns `None` once the connection is closed. Segments still queued
    /// at that point are discarded.
    pub async fn next(&self) -> Option<SharedSegment> {
        loop {
            if !self.is_open() {
                return None;
            }

            let next = {
                let mut state = self.state.lock();
                let next = state.segments.pop_front();
                if next.is_some() {
                    state.full_since = None;
                }
                next
            };

            if let Some(segment) = next {
                self.delivered_segments.fetch_add(1, Ordering::Relaxed);
                self.delivered_bytes
                    .fetch_add(segment.data.len() as u64, Ordering::Relaxed);
                return Some(segment);
            }

            self.notify.notified().await;
        }
    }

    /// Close the connection. The first reason recorded wins.
    ///
    /// Returns `true` if this call closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        self.state.lock().segments.clear();
        self.notify.notify_one();
        true
    }

    pub fn queued(&self) -> usize {
        self.state.lock().segments.len()
    }

    pub fn dropped_segments(&self) -> u64 {
        self.dropped_segments.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            id: self.id,
            connected_at: self.connected_at,
            init_generation: self.init_generation,
            queued: self.queued(),
            delivered_segments: self.delivered_segments.load(Ordering::Relaxed),
            delivered_bytes: self.delivered_bytes.load(Ordering::Relaxed),
            dropped_segments: self.dropped_segments(),
        }
    }
}
