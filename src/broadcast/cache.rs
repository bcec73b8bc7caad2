//! Single-slot cache for the current encoder session's init segment.
//!
//! Every viewer needs the init segment before any media segment makes sense,
//! and the encoder emits it exactly once per session. The cache keeps the
//! latest one and lets late joiners wait for it to appear.

use super::SharedSegment;
use livecast_media::Segment;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Init segment together with the generation it was stored under.
#[derive(Debug, Clone)]
pub struct CachedInit {
    pub segment: SharedSegment,
    /// Bumped every time an init segment is stored for a new session or
    /// replaced by different bytes.
    pub generation: u64,
}

/// Result of storing an init segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// Nothing was cached before (first session, or the previous one ended).
    First,
    /// Same bytes as the cached segment; existing viewers can keep decoding.
    Unchanged,
    /// Different bytes; anything decoded against the old one is now invalid.
    Changed,
}

#[derive(Debug, Default)]
struct Slot {
    init: Option<CachedInit>,
    /// Last generation handed out; never goes backwards.
    generation: u64,
}

#[derive(Debug)]
pub struct StreamCache {
    slot: watch::Sender<Slot>,
}

impl StreamCache {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(Slot::default());
        Self { slot }
    }

    /// Store `segment` as the current init segment.
    pub fn replace(&self, segment: Segment) -> CacheUpdate {
        let mut update = CacheUpdate::Unchanged;
        self.slot.send_if_modified(|slot| {
            update = match &slot.init {
                Some(cached) if cached.segment.data == segment.data => return false,
                Some(_) => CacheUpdate::Changed,
                None => CacheUpdate::First,
            };
            slot.generation += 1;
            slot.init = Some(CachedInit {
                segment: Arc::new(segment),
                generation: slot.generation,
            });
            true
        });
        update
    }

    /// Forget the cached init segment because its encoder session ended.
    ///
    /// Returns the generation that was cleared, `None` if nothing was cached.
    /// Viewers joining afterwards wait for the next session's init segment.
    pub fn clear(&self) -> Option<u64> {
        let mut cleared = None;
        self.slot.send_if_modified(|slot| {
            cleared = slot.init.take().map(|c| c.generation);
            cleared.is_some()
        });
        cleared
    }

    /// Current init segment, if the running encoder session has produced one.
    pub fn current(&self) -> Option<CachedInit> {
        self.slot.borrow().init.clone()
    }

    /// Latest generation handed out, 0 before the first init segment.
    pub fn generation(&self) -> u64 {
        self.slot.borrow().generation
    }

    /// Whether `generation` is the one currently cached.
    pub fn is_current(&self, generation: u64) -> bool {
        self.slot
            .borrow()
            .init
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    /// Wait up to `timeout` for an init segment to be cached.
    pub async fn wait_for_init(&self, timeout: Duration) -> Option<CachedInit> {
        let mut rx = self.slot.subscribe();
        let waited =
            tokio::time::timeout(timeout, rx.wait_for(|slot| slot.init.is_some())).await;
        match waited {
            Ok(Ok(slot)) => slot.init.clone(),
            _ => None,
        }
    }
}

impl Default for StreamCache {
    fn default() -> Self {
        Self::new()
    }
}
