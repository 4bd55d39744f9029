// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Instance slot registry.
//!
//! Several client instances may start in the same place at the same time,
//! sharing one key-value store. Each needs a small stable integer to stamp
//! onto its name (`alice(2)`) so siblings stay distinguishable on the wire.
//! The store is the only shared arbiter between the instances: slots are
//! claimed with an optimistic read-modify-write verified after the fact,
//! which is sufficient because the contention window is short and the number
//! of siblings is small.
//!
//! Layout in the store:
//! - `tabs` — JSON array of live slot numbers,
//! - `slot:<n>` — millisecond heartbeat timestamp per slot
//!   (`tabpoll_<n>` is accepted as a legacy fallback),
//!
//! A slot whose heartbeat is missing, malformed, or older than
//! `tabs.timeout` seconds is evicted by the next instance to start.

use std::sync::Arc;

use rtchat_config::TabsConfig;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::{error::Error, store::KeyValueStore};

const TABS_KEY: &str = "tabs";
const MAX_RETRIES: u32 = 10;

fn slot_key(slot: u32) -> String {
    format!("slot:{slot}")
}

fn legacy_slot_key(slot: u32) -> String {
    format!("tabpoll_{slot}")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn read_tabs(store: &dyn KeyValueStore) -> Vec<u32> {
    store
        .get(TABS_KEY)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn write_tabs(store: &dyn KeyValueStore, tabs: &[u32]) -> Result<(), Error> {
    let raw = serde_json::to_string(tabs).map_err(|e| Error::Store(e.to_string()))?;
    store.set(TABS_KEY, &raw)
}

/// Heartbeat timestamp for `slot`, preferring the current key over the
/// legacy one.
fn heartbeat_ms(store: &dyn KeyValueStore, slot: u32) -> Option<i64> {
    store
        .get(&slot_key(slot))
        .or_else(|| store.get(&legacy_slot_key(slot)))
        .and_then(|raw| raw.parse().ok())
}

/// A claimed instance slot. Heartbeats run until [`release`](Self::release)
/// or drop.
pub struct InstanceRegistry {
    store: Arc<dyn KeyValueStore>,
    slot: u32,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

impl InstanceRegistry {
    /// Claim the smallest free slot.
    ///
    /// Stale siblings are evicted first; then up to [`MAX_RETRIES`] attempts
    /// append a candidate to the list and verify it landed exactly once.
    pub fn acquire(store: Arc<dyn KeyValueStore>, config: &TabsConfig) -> Result<Self, Error> {
        evict_stale(store.as_ref(), config.timeout);

        for attempt in 0..MAX_RETRIES {
            let mut tabs = read_tabs(store.as_ref());
            let candidate = first_gap(&tabs);
            tabs.push(candidate);
            write_tabs(store.as_ref(), &tabs)?;

            // Verify no concurrently starting sibling claimed the same number.
            let seen = read_tabs(store.as_ref());
            if seen.iter().filter(|&&s| s == candidate).count() == 1 {
                store.set(&slot_key(candidate), &now_ms().to_string())?;
                debug!(slot = candidate, attempt, "instance slot acquired");
                return Ok(Self {
                    store,
                    slot: candidate,
                    heartbeat: None,
                });
            }

            // Collision: withdraw our append and retry.
            let mut seen = seen;
            if let Some(pos) = seen.iter().rposition(|&s| s == candidate) {
                seen.remove(pos);
                write_tabs(store.as_ref(), &seen)?;
            }
        }

        Err(Error::InstanceAcquisitionFailed(MAX_RETRIES))
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Start the periodic heartbeat refresh. Must be called from within a
    /// tokio runtime; calling it twice is a no-op.
    pub fn start_heartbeat(&mut self, config: &TabsConfig) {
        if self.heartbeat.is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = slot_key(self.slot);
        let period = Duration::from_millis(config.poll_interval.max(1));
        self.heartbeat = Some(tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = store.set(&key, &now_ms().to_string()) {
                    warn!("heartbeat refresh failed: {e}");
                }
            }
        }));
    }

    /// Remove this instance from the shared list and stop the heartbeat.
    pub fn release(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        let mut tabs = read_tabs(self.store.as_ref());
        if let Some(pos) = tabs.iter().position(|&s| s == self.slot) {
            tabs.remove(pos);
            if let Err(e) = write_tabs(self.store.as_ref(), &tabs) {
                warn!("slot release failed: {e}");
            }
        }
        let _ = self.store.remove(&slot_key(self.slot));
        let _ = self.store.remove(&legacy_slot_key(self.slot));
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        self.release();
    }
}

/// Smallest non-negative integer not present in `tabs`.
fn first_gap(tabs: &[u32]) -> u32 {
    let mut sorted: Vec<u32> = tabs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut expected = 0;
    for slot in sorted {
        if slot != expected {
            break;
        }
        expected += 1;
    }
    expected
}

/// Drop every listed slot whose heartbeat is missing, malformed, or older
/// than `timeout_secs`.
fn evict_stale(store: &dyn KeyValueStore, timeout_secs: u64) {
    let tabs = read_tabs(store);
    if tabs.is_empty() {
        return;
    }
    let cutoff = now_ms() - (timeout_secs as i64) * 1000;
    let (live, stale): (Vec<u32>, Vec<u32>) = tabs
        .into_iter()
        .partition(|&slot| heartbeat_ms(store, slot).is_some_and(|ts| ts >= cutoff));
    if stale.is_empty() {
        return;
    }
    debug!(?stale, "evicting stale instance slots");
    for slot in &stale {
        let _ = store.remove(&slot_key(*slot));
        let _ = store.remove(&legacy_slot_key(*slot));
    }
    if let Err(e) = write_tabs(store, &live) {
        warn!("stale eviction write failed: {e}");
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
