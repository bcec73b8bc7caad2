//! Live fan-out of encoder segments to connected viewers.
//!
//! One [`Broadcaster`] is shared by the ingest task (producer) and every
//! `/stream` request (consumers). Each viewer gets its own bounded
//! [`ClientConnection`] queue, so a stalled viewer only ever loses its own
//! segments and never holds up the encoder or anyone else.

mod cache;
mod connection;

pub use cache::{CacheUpdate, CachedInit, StreamCache};
pub use connection::{ClientConnection, ClientId, ClientStats, CloseReason, Offer};

use crate::config::StreamConfig;
use dashmap::DashMap;
use livecast_media::Segment;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Segment shared between every viewer queue it was fanned out to.
pub type SharedSegment = Arc<Segment>;

/// Errors returned to a viewer trying to join the stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream not ready: no init segment after {0:?}")]
    InitTimeout(Duration),

    #[error("Server at capacity ({0} clients)")]
    AtCapacity(usize),

    #[error("Failed to build stream response: {0}")]
    Response(String),
}

/// Tunables for the fan-out.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastSettings {
    pub queue_capacity: usize,
    pub max_clients: usize,
    pub slow_client_timeout: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for BroadcastSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            max_clients: config.max_clients,
            slow_client_timeout: config.slow_client_timeout(),
        }
    }
}

/// Snapshot of the broadcaster for `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub client_count: usize,
    pub max_clients: usize,
    pub queue_capacity: usize,
    pub init_cached: bool,
    pub init_generation: u64,
    pub init_bytes: Option<usize>,
    pub segments_published: u64,
    pub bytes_published: u64,
    pub segments_dropped: u64,
    pub clients_closed_slow: u64,
    pub clients_closed_discontinuity: u64,
    pub clients: Vec<ClientStats>,
}

#[derive(Debug, Default)]
struct Counters {
    segments_published: AtomicU64,
    bytes_published: AtomicU64,
    segments_dropped: AtomicU64,
    closed_slow: AtomicU64,
    closed_discontinuity: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    clients: DashMap<ClientId, Arc<ClientConnection>>,
    /// Registry slots taken, reserved before insert so `max_clients` holds
    /// under concurrent joins.
    reserved: AtomicUsize,
    cache: StreamCache,
    settings: BroadcastSettings,
    counters: Counters,
}

/// Cheaply cloneable handle to the shared fan-out state.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    pub fn new(settings: BroadcastSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                clients: DashMap::new(),
                reserved: AtomicUsize::new(0),
                cache: StreamCache::new(),
                settings,
                counters: Counters::default(),
            }),
        }
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.inner.settings
    }

    pub fn cache(&self) -> &StreamCache {
        &self.inner.cache
    }

    /// Number of registered viewers.
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Cache a new init segment.
    ///
    /// If it differs from the cached one, every registered viewer is
    /// disconnected: their decoders were configured for the old session and
    /// cannot play what follows. Reconnecting viewers pick up the new one.
    pub fn set_init(&self, segment: Segment) -> CacheUpdate {
        let bytes = segment.len();
        let update = self.inner.cache.replace(segment);
        match update {
            CacheUpdate::First => {
                tracing::info!(bytes, "Cached init segment");
            }
            CacheUpdate::Unchanged => {
                tracing::debug!(bytes, "Encoder repeated the cached init segment");
            }
            CacheUpdate::Changed => {
                let generation = self.inner.cache.generation();
                let closed = self.disconnect_before(generation);
                tracing::warn!(
                    bytes,
                    generation,
                    closed,
                    "Init segment changed, disconnected existing clients"
                );
            }
        }
        update
    }

    /// Mark the end of an encoder session.
    ///
    /// The next session restarts its fragment sequence and decode times even
    /// when its init segment is byte-identical, so every viewer of this
    /// session is disconnected and the cached init segment is dropped.
    /// Viewers reconnecting wait for the next session's init segment.
    pub fn end_session(&self) -> usize {
        let Some(generation) = self.inner.cache.clear() else {
            return 0;
        };
        let closed = self.disconnect_before(generation + 1);
        tracing::info!(generation, closed, "Encoder session ended, disconnected clients");
        closed
    }

    /// Close viewers whose init segment is older than `generation`.
    fn disconnect_before(&self, generation: u64) -> usize {
        let stale: Vec<ClientId> = self
            .inner
            .clients
            .iter()
            .filter(|e| e.value().init_generation() < generation)
            .map(|e| *e.key())
            .collect();
        let closed = stale
            .into_iter()
            .filter(|id| self.remove(*id, CloseReason::Discontinuity))
            .count();
        self.inner
            .counters
            .closed_discontinuity
            .fetch_add(closed as u64, Ordering::Relaxed);
        closed
    }

    /// Fan a media segment out to every registered viewer.
    ///
    /// Never waits on a viewer. Returns how many viewers it was queued for.
    /// An init segment passed here is routed to [`Broadcaster::set_init`].
    pub fn publish(&self, segment: Segment) -> usize {
        if segment.is_init() {
            self.set_init(segment);
            return 0;
        }

        let counters = &self.inner.counters;
        counters.segments_published.fetch_add(1, Ordering::Relaxed);
        counters
            .bytes_published
            .fetch_add(segment.len() as u64, Ordering::Relaxed);

        let segment: SharedSegment = Arc::new(segment);
        let snapshot: Vec<Arc<ClientConnection>> = self
            .inner
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let now = Instant::now();
        let stall_limit = self.inner.settings.slow_client_timeout;
        let mut queued = 0;
        for conn in snapshot {
            match conn.offer(Arc::clone(&segment), now, stall_limit) {
                Offer::Queued => queued += 1,
                Offer::DroppedOldest => {
                    counters.segments_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(client_id = %conn.id(), "Client queue full, dropped oldest segment");
                    queued += 1;
                }
                Offer::Stalled => {
                    counters.closed_slow.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        client_id = %conn.id(),
                        dropped = conn.dropped_segments(),
                        "Client stalled past slow-client timeout, disconnecting"
                    );
                    self.remove(conn.id(), CloseReason::TooSlow);
                }
                Offer::Closed => {
                    self.unregister(conn.id());
                }
            }
        }

        tracing::trace!(sequence = segment.sequence, bytes = segment.len(), queued, "Published segment");
        queued
    }

    /// Join the stream.
    ///
    /// Waits up to `init_timeout` for the first init segment, then registers
    /// a new viewer. The returned [`Subscription`] carries the init segment
    /// the viewer must write first; media segments published after this
    /// returns are delivered through it.
    pub async fn subscribe(&self, init_timeout: Duration) -> Result<Subscription, StreamError> {
        loop {
            let init = self
                .inner
                .cache
                .wait_for_init(init_timeout)
                .await
                .ok_or(StreamError::InitTimeout(init_timeout))?;

            let max_clients = self.inner.settings.max_clients;
            let reserved = self.inner.reserved.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |taken| (taken < max_clients).then_some(taken + 1),
            );
            if reserved.is_err() {
                tracing::warn!(max_clients, "Rejecting client, server at capacity");
                return Err(StreamError::AtCapacity(max_clients));
            }

            let connection = Arc::new(ClientConnection::new(
                self.inner.settings.queue_capacity,
                init.generation,
            ));
            self.inner
                .clients
                .insert(connection.id(), Arc::clone(&connection));

            let subscription = Subscription {
                connection,
                init: init.segment,
                broadcaster: self.clone(),
            };

            // A new encoder session may have started between reading the
            // cache and registering; that viewer would pair the old init with
            // new media.
            if self.inner.cache.is_current(init.generation) {
                tracing::info!(
                    client_id = %subscription.id(),
                    clients = self.inner.clients.len(),
                    "Client connected"
                );
                return Ok(subscription);
            }
            tracing::debug!("Init segment replaced while registering, retrying");
        }
    }

    /// Close and unregister every viewer. Returns how many were closed.
    pub fn disconnect_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<ClientId> = self.inner.clients.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.remove(*id, reason))
            .count()
    }

    /// Drop `id` from the registry and free its slot.
    fn unregister(&self, id: ClientId) -> Option<Arc<ClientConnection>> {
        let (_, conn) = self.inner.clients.remove(&id)?;
        self.inner.reserved.fetch_sub(1, Ordering::AcqRel);
        Some(conn)
    }

    fn remove(&self, id: ClientId, reason: CloseReason) -> bool {
        let Some(conn) = self.unregister(id) else {
            return false;
        };
        let closed = conn.close(reason);
        let stats = conn.stats();
        tracing::info!(
            client_id = %id,
            reason = %reason,
            delivered = stats.delivered_segments,
            dropped = stats.dropped_segments,
            "Client disconnected"
        );
        closed
    }

    pub fn stats(&self) -> BroadcastStats {
        let counters = &self.inner.counters;
        let init = self.inner.cache.current();
        let mut clients: Vec<ClientStats> = self
            .inner
            .clients
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        clients.sort_by_key(|c| c.connected_at);

        BroadcastStats {
            client_count: clients.len(),
            max_clients: self.inner.settings.max_clients,
            queue_capacity: self.inner.settings.queue_capacity,
            init_cached: init.is_some(),
            init_generation: self.inner.cache.generation(),
            init_bytes: init.as_ref().map(|i| i.segment.len()),
            segments_published: counters.segments_published.load(Ordering::Relaxed),
            bytes_published: counters.bytes_published.load(Ordering::Relaxed),
            segments_dropped: counters.segments_dropped.load(Ordering::Relaxed),
            clients_closed_slow: counters.closed_slow.load(Ordering::Relaxed),
            clients_closed_discontinuity: counters.closed_discontinuity.load(Ordering::Relaxed),
            clients,
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(BroadcastSettings::default())
    }
}

/// A registered viewer's handle on the stream.
///
/// Dropping it unregisters the viewer.
#[derive(Debug)]
pub struct Subscription {
    connection: Arc<ClientConnection>,
    init: SharedSegment,
    broadcaster: Broadcaster,
}

impl Subscription {
    pub fn id(&self) -> ClientId {
        self.connection.id()
    }

    /// Init segment to send before any media segment.
    pub fn init(&self) -> &SharedSegment {
        &self.init
    }

    /// Next media segment, or `None` once the server has closed this viewer.
    pub async fn next(&self) -> Option<SharedSegment> {
        self.connection.next().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.connection.close_reason()
    }

    pub fn stats(&self) -> ClientStats {
        self.connection.stats()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster
            .remove(self.connection.id(), CloseReason::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use livecast_media::{fixtures, SegmentParser};

    const WAIT: Duration = Duration::from_millis(100);

    fn settings(queue_capacity: usize) -> BroadcastSettings {
        BroadcastSettings {
            queue_capacity,
            max_clients: 10,
            slow_client_timeout: Duration::from_secs(3600),
        }
    }

    fn init(variant: u8) -> Segment {
        SegmentParser::new()
            .feed(&fixtures::init_segment_variant(variant))
            .unwrap()
            .remove(0)
    }

    fn media(seq: u32) -> Segment {
        let mut parser = SegmentParser::new();
        let mut bytes = fixtures::init_segment();
        bytes.extend_from_slice(&fixtures::media_segment(seq, 32));
        parser.feed(&bytes).unwrap().remove(1)
    }

    fn pending(sub: &Subscription) -> Vec<u32> {
        let mut out = Vec::new();
        while sub.stats().queued > 0 {
            let seg = sub.next().now_or_never().flatten().unwrap();
            out.push(seg.fragment_sequence().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_late_joiner_gets_init_and_only_new_segments() {
        let broadcaster = Broadcaster::new(settings(16));
        broadcaster.set_init(init(0));

        let early = broadcaster.subscribe(WAIT).await.unwrap();
        for seq in 1..=5 {
            broadcaster.publish(media(seq));
        }
        let late = broadcaster.subscribe(WAIT).await.unwrap();
        for seq in 6..=10 {
            broadcaster.publish(media(seq));
        }

        assert!(early.init().is_init());
        assert!(late.init().is_init());
        assert_eq!(pending(&early), (1..=10).collect::<Vec<_>>());
        assert_eq!(pending(&late), (6..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stalled_viewer_drops_oldest() {
        let broadcaster = Broadcaster::new(settings(3));
        broadcaster.set_init(init(0));
        let sub = broadcaster.subscribe(WAIT).await.unwrap();

        for seq in 1..=6 {
            assert_eq!(broadcaster.publish(media(seq)), 1);
        }

        assert_eq!(sub.stats().dropped_segments, 3);
        assert_eq!(broadcaster.stats().segments_dropped, 3);
        assert_eq!(pending(&sub), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_slow_viewer_does_not_affect_fast_one() {
        let broadcaster = Broadcaster::new(settings(2));
        broadcaster.set_init(init(0));
        let slow = broadcaster.subscribe(WAIT).await.unwrap();
        let fast = broadcaster.subscribe(WAIT).await.unwrap();

        let mut received = Vec::new();
        for seq in 1..=50 {
            broadcaster.publish(media(seq));
            let seg = fast.next().await.unwrap();
            received.push(seg.fragment_sequence().unwrap());
        }

        assert_eq!(received, (1..=50).collect::<Vec<_>>());
        assert_eq!(fast.stats().dropped_segments, 0);
        assert_eq!(slow.stats().dropped_segments, 48);
        assert_eq!(pending(&slow), vec![49, 50]);
    }

    #[tokio::test]
    async fn test_no_viewers_is_fine() {
        let broadcaster = Broadcaster::new(settings(4));
        broadcaster.set_init(init(0));
        assert_eq!(broadcaster.publish(media(1)), 0);
        assert_eq!(broadcaster.stats().segments_published, 1);
    }

    #[tokio::test]
    async fn test_subscribe_times_out_without_init() {
        let broadcaster = Broadcaster::new(settings(4));
        let err = broadcaster
            .subscribe(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::InitTimeout(_)));
        assert_eq!(broadcaster.client_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_waits_for_first_init() {
        let broadcaster = Broadcaster::new(settings(4));
        let pending_sub = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.subscribe(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broadcaster.set_init(init(0));

        let sub = pending_sub.await.unwrap().unwrap();
        assert_eq!(sub.stats().init_generation, 1);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let broadcaster = Broadcaster::new(BroadcastSettings {
            max_clients: 2,
            ..settings(4)
        });
        broadcaster.set_init(init(0));

        let a = broadcaster.subscribe(WAIT).await.unwrap();
        let _b = broadcaster.subscribe(WAIT).await.unwrap();
        let err = broadcaster.subscribe(WAIT).await.unwrap_err();
        assert!(matches!(err, StreamError::AtCapacity(2)));

        drop(a);
        assert!(broadcaster.subscribe(WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let broadcaster = Broadcaster::new(settings(4));
        broadcaster.set_init(init(0));
        let sub = broadcaster.subscribe(WAIT).await.unwrap();
        assert_eq!(broadcaster.client_count(), 1);

        drop(sub);
        assert_eq!(broadcaster.client_count(), 0);
        assert_eq!(broadcaster.publish(media(1)), 0);
    }

    #[tokio::test]
    async fn test_changed_init_disconnects_viewers() {
        let broadcaster = Broadcaster::new(settings(4));
        broadcaster.set_init(init(0));
        let sub = broadcaster.subscribe(WAIT).await.unwrap();
        broadcaster.publish(media(1));

        assert_eq!(broadcaster.set_init(init(1)), CacheUpdate::Changed);

        assert!(sub.next().await.is_none());
        assert_eq!(sub.close_reason(), Some(CloseReason::Discontinuity));
        assert_eq!(broadcaster.client_count(), 0);
        assert_eq!(broadcaster.stats().clients_closed_discontinuity, 1);

        let rejoined = broadcaster.subscribe(WAIT).await.unwrap();
        assert_eq!(
            rejoined.init().data.as_ref(),
            fixtures::init_segment_variant(1).as_slice()
        );
    }

    #[tokio::test]
    async fn test_identical_init_keeps_viewers() {
        let broadcaster = Broadcaster::new(settings(4));
        broadcaster.set_init(init(0));
        let sub = broadcaster.subscribe(WAIT).await.unwrap();

        assert_eq!(broadcaster.set_init(init(0)), CacheUpdate::Unchanged);
        broadcaster.publish(media(1));

        assert_eq!(pending(&sub), vec![1]);
        assert_eq!(broadcaster.client_count(), 1);
    }

    #[tokio::test]
    async fn test_session_end_disconnects_even_with_identical_init() {
        let broadcaster = Broadcaster::new(settings(8));
        broadcaster.set_init(init(0));
        let sub = broadcaster.subscribe(WAIT).await.unwrap();
        broadcaster.publish(media(1));

        assert_eq!(broadcaster.end_session(), 1);
        assert!(sub.next().await.is_none());
        assert_eq!(sub.close_reason(), Some(CloseReason::Discontinuity));
        assert!(!broadcaster.stats().init_cached);
        assert_eq!(broadcaster.stats().clients_closed_discontinuity, 1);

        // Nobody can join until the next session sends its init segment.
        assert!(matches!(
            broadcaster.subscribe(Duration::from_millis(20)).await,
            Err(StreamError::InitTimeout(_))
        ));

        assert_eq!(broadcaster.set_init(init(0)), CacheUpdate::First);
        let rejoined = broadcaster.subscribe(WAIT).await.unwrap();
        assert_eq!(rejoined.stats().init_generation, 2);
        broadcaster.publish(media(1));
        assert_eq!(pending(&rejoined), vec![1]);
    }

    #[tokio::test]
    async fn test_session_end_without_init_is_noop() {
        let broadcaster = Broadcaster::new(settings(4));
        assert_eq!(broadcaster.end_session(), 0);
        assert_eq!(broadcaster.stats().init_generation, 0);
    }

    #[tokio::test]
    async fn test_viewer_on_current_init_survives_discontinuity_sweep() {
        let broadcaster = Broadcaster::new(settings(4));
        broadcaster.set_init(init(0));
        let old = broadcaster.subscribe(WAIT).await.unwrap();

        broadcaster.set_init(init(1));
        let current = broadcaster.subscribe(WAIT).await.unwrap();
        assert_eq!(old.close_reason(), Some(CloseReason::Discontinuity));

        // A sweep for generation 2 must leave generation-2 viewers alone.
        assert_eq!(broadcaster.disconnect_before(2), 0);
        assert!(current.close_reason().is_none());
        assert_eq!(broadcaster.client_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_slots_are_released() {
        let broadcaster = Broadcaster::new(BroadcastSettings {
            max_clients: 1,
            slow_client_timeout: Duration::ZERO,
            ..settings(1)
        });
        broadcaster.set_init(init(0));

        // Slow-client removal frees the slot.
        let slow = broadcaster.subscribe(WAIT).await.unwrap();
        broadcaster.publish(media(1));
        broadcaster.publish(media(2));
        assert_eq!(slow.close_reason(), Some(CloseReason::TooSlow));
        let next = broadcaster.subscribe(WAIT).await.unwrap();

        // Discontinuity frees it too.
        broadcaster.end_session();
        broadcaster.set_init(init(0));
        let third = broadcaster.subscribe(WAIT).await.unwrap();
        assert_eq!(broadcaster.client_count(), 1);

        // Handles of removed viewers must not free the slot a second time.
        drop(slow);
        drop(next);
        assert!(matches!(
            broadcaster.subscribe(WAIT).await,
            Err(StreamError::AtCapacity(1))
        ));
        drop(third);
    }

    #[tokio::test]
    async fn test_slow_viewer_is_disconnected_after_timeout() {
        let broadcaster = Broadcaster::new(BroadcastSettings {
            slow_client_timeout: Duration::ZERO,
            ..settings(1)
        });
        broadcaster.set_init(init(0));
        let sub = broadcaster.subscribe(WAIT).await.unwrap();

        assert_eq!(broadcaster.publish(media(1)), 1);
        assert_eq!(broadcaster.publish(media(2)), 0);

        assert_eq!(sub.close_reason(), Some(CloseReason::TooSlow));
        assert!(sub.next().await.is_none());
        assert_eq!(broadcaster.stats().clients_closed_slow, 1);
    }

    #[tokio::test]
    async fn test_publish_init_routes_to_cache() {
        let broadcaster = Broadcaster::new(settings(4));
        assert_eq!(broadcaster.publish(init(0)), 0);
        assert!(broadcaster.stats().init_cached);
        assert_eq!(broadcaster.stats().segments_published, 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_every_stream() {
        let broadcaster = Broadcaster::new(settings(4));
        broadcaster.set_init(init(0));
        let a = broadcaster.subscribe(WAIT).await.unwrap();
        let b = broadcaster.subscribe(WAIT).await.unwrap();

        assert_eq!(broadcaster.disconnect_all(CloseReason::Shutdown), 2);
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            StreamError::AtCapacity(100).to_string(),
            "Server at capacity (100 clients)"
        );
        assert!(StreamError::InitTimeout(Duration::from_secs(10))
            .to_string()
            .starts_with("Stream not ready"));
    }
}
