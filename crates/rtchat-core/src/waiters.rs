// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Deferred results.
//!
//! Every "answer arrives later" situation in the client — question
//! correlation, parked sends, call setup — is backed by one of two
//! primitives: a [`OneShot`] that an event resolves at most once, or a
//! [`CorrelationTable`] of pending one-shots keyed by id. Both deliver
//! failure by resolving with an error, and cancellation by being dropped,
//! so a session teardown cancels everything it owns for free.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::oneshot;

use crate::error::Error;

/// Sender half of a single deferred result.
///
/// Resolving twice is a no-op; dropping unresolved cancels the waiting
/// receiver.
#[derive(Debug)]
pub struct OneShot<T> {
    tx: Option<oneshot::Sender<T>>,
}

impl<T> OneShot<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Resolve with `value`. Returns false when already resolved or the
    /// receiver is gone.
    pub fn resolve(&mut self, value: T) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

/// Pending deferred results keyed by correlation id.
#[derive(Debug)]
pub struct CorrelationTable<K, T> {
    pending: HashMap<K, oneshot::Sender<Result<T, Error>>>,
}

impl<K: Eq + Hash, T> CorrelationTable<K, T> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Register a new id and hand back the receiver the caller awaits.
    pub fn register(&mut self, id: K) -> oneshot::Receiver<Result<T, Error>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        rx
    }

    /// Resolve `id` with a value. Returns false for unknown ids.
    pub fn resolve(&mut self, id: &K, value: T) -> bool {
        match self.pending.remove(id) {
            Some(tx) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Resolve `id` with an error.
    pub fn fail(&mut self, id: &K, err: Error) -> bool {
        match self.pending.remove(id) {
            Some(tx) => tx.send(Err(err)).is_ok(),
            None => false,
        }
    }

    /// Fail every pending entry, leaving the table empty.
    pub fn fail_all(&mut self, err: impl Fn() -> Error) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(err()));
        }
    }

    pub fn contains(&self, id: &K) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<K: Eq + Hash, T> Default for CorrelationTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oneshot_resolves_once() {
        let (mut slot, rx) = OneShot::new();
        assert!(!slot.is_resolved());
        assert!(slot.resolve(7));
        assert!(slot.is_resolved());
        assert!(!slot.resolve(8), "second resolve must be a no-op");
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropping_oneshot_cancels_receiver() {
        let (slot, rx) = OneShot::<u32>::new();
        drop(slot);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn table_resolves_by_id() {
        let mut table: CorrelationTable<u64, String> = CorrelationTable::new();
        let rx1 = table.register(1);
        let rx2 = table.register(2);
        assert_eq!(table.len(), 2);

        assert!(table.resolve(&2, "two".into()));
        assert!(!table.resolve(&9, "nine".into()), "unknown id");
        assert_eq!(rx2.await.unwrap().unwrap(), "two");

        assert!(table.fail(&1, Error::Shutdown));
        assert!(matches!(rx1.await.unwrap(), Err(Error::Shutdown)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_drains_table() {
        let mut table: CorrelationTable<u64, ()> = CorrelationTable::new();
        let rx1 = table.register(1);
        let rx2 = table.register(2);
        table.fail_all(|| Error::ChannelClosed("question".into()));
        assert!(table.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(Error::ChannelClosed(_))));
        assert!(matches!(rx2.await.unwrap(), Err(Error::ChannelClosed(_))));
    }
}
