//! Hot cache: latest snapshot per game plus per-game fan-out
//!
//! Each game owns a slot holding its current snapshot behind `ArcSwapOption`
//! (readers never see a half-written value) and a list of bounded subscriber
//! channels. Publishing never waits: a subscriber whose buffer is full is
//! disconnected, everyone else keeps receiving.

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::models::Snapshot;

// ============================================================================
// Slots
// ============================================================================

struct CachedSnapshot {
    snapshot: Arc<Snapshot>,
    stored_at: Instant,
}

struct SubscriberHandle {
    id: u64,
    tx: mpsc::Sender<Arc<Snapshot>>,
    overflowed: Arc<AtomicBool>,
}

struct GameSlot {
    current: ArcSwapOption<CachedSnapshot>,
    subscribers: Mutex<Vec<SubscriberHandle>>,
}

impl GameSlot {
    fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

/// Receiving end of a game's fan-out. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<Snapshot>>,
    slot: Arc<GameSlot>,
    overflowed: Arc<AtomicBool>,
}

impl Subscription {
    /// Next snapshot; `None` once the subscriber has been disconnected.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Snapshot>> {
        self.rx.try_recv().ok()
    }

    /// True if the cache dropped this subscriber for falling behind.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.subscribers.lock().retain(|s| s.id != self.id);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub games: usize,
    pub subscribers: usize,
    pub puts: u64,
    pub overflow_disconnects: u64,
    pub expired: u64,
}

// ============================================================================
// HotCache
// ============================================================================

pub struct HotCache {
    slots: RwLock<HashMap<String, Arc<GameSlot>>>,
    ttl: Option<Duration>,
    subscriber_buffer: usize,
    next_id: AtomicU64,
    puts: AtomicU64,
    overflow_disconnects: AtomicU64,
    expired: AtomicU64,
}

impl HotCache {
    pub fn new(ttl: Option<Duration>, subscriber_buffer: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::with_capacity(64)),
            ttl,
            subscriber_buffer: subscriber_buffer.max(1),
            next_id: AtomicU64::new(1),
            puts: AtomicU64::new(0),
            overflow_disconnects: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    fn slot(&self, gid: &str) -> Arc<GameSlot> {
        if let Some(slot) = self.slots.read().get(gid) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(gid.to_string())
            .or_insert_with(|| Arc::new(GameSlot::new()))
            .clone()
    }

    fn is_fresh(&self, cached: &CachedSnapshot) -> bool {
        self.ttl.map_or(true, |ttl| cached.stored_at.elapsed() < ttl)
    }

    /// Replace the game's snapshot and publish it. Returns how many
    /// subscribers received it.
    ///
    /// Callers serialize puts per game; delivery order follows call order.
    pub fn put(&self, snapshot: Snapshot) -> usize {
        let gid = snapshot.gid.clone();
        let snapshot = Arc::new(snapshot);
        let slot = self.slot(&gid);
        slot.current.store(Some(Arc::new(CachedSnapshot {
            snapshot: snapshot.clone(),
            stored_at: Instant::now(),
        })));
        self.puts.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = slot.subscribers.lock();
        if subscribers.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        subscribers.retain(|sub| match sub.tx.try_send(snapshot.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                sub.overflowed.store(true, Ordering::Release);
                self.overflow_disconnects.fetch_add(1, Ordering::Relaxed);
                warn!(gid = %gid, subscriber = sub.id, "Subscriber buffer full, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Current snapshot unless missing or expired.
    pub fn get(&self, gid: &str) -> Option<Arc<Snapshot>> {
        let slot = self.slots.read().get(gid).cloned()?;
        let cached = slot.current.load_full()?;
        self.is_fresh(&cached).then(|| cached.snapshot.clone())
    }

    pub fn subscribe(&self, gid: &str) -> Subscription {
        let slot = self.slot(gid);
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let overflowed = Arc::new(AtomicBool::new(false));
        slot.subscribers.lock().push(SubscriberHandle {
            id,
            tx,
            overflowed: overflowed.clone(),
        });
        debug!(gid = %gid, subscriber = id, "Hot cache subscriber added");
        Subscription {
            id,
            rx,
            slot,
            overflowed,
        }
    }

    pub fn subscriber_count(&self, gid: &str) -> usize {
        self.slots
            .read()
            .get(gid)
            .map_or(0, |slot| slot.subscribers.lock().len())
    }

    /// Clear expired snapshots. Slots stay so live subscriptions are unaffected.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let mut removed = 0;
        for slot in self.slots.read().values() {
            let current = slot.current.load_full();
            let expired = current
                .as_ref()
                .is_some_and(|cached| cached.stored_at.elapsed() >= ttl);
            if expired {
                // A concurrent put wins over the sweep.
                slot.current.compare_and_swap(&current, None);
                removed += 1;
            }
        }
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Periodic TTL sweep. Runs until the process exits.
    pub async fn run_sweeper(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = self.sweep_expired();
            if removed > 0 {
                info!("🧹 Hot cache swept {} expired snapshots", removed);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let slots = self.slots.read();
        CacheStats {
            games: slots
                .values()
                .filter(|s| s.current.load_full().is_some())
                .count(),
            subscribers: slots.values().map(|s| s.subscribers.lock().len()).sum(),
            puts: self.puts.load(Ordering::Relaxed),
            overflow_disconnects: self.overflow_disconnects.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}
