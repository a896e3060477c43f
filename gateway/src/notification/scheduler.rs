//! Bounded two-class notification queue.
//!
//! Producers (block parser, mempool checker, recovery sweep) call
//! [`NotificationScheduler::add`]; dispatch workers pull batches with
//! [`NotificationScheduler::take`]. Items for hosts the latency tracker
//! considers slow go to their own channel, so a slow subscriber only ever
//! occupies the slow workers.
//!
//! ## Design
//!
//! - Each channel is a `parking_lot::Mutex<VecDeque>` plus a
//!   `tokio::sync::Notify`. A waiting consumer registers with `Notify`
//!   before it inspects the queue, so an `add` that lands between the check
//!   and the wait still wakes it.
//! - The overall bound is an atomic reservation taken before the push, so
//!   concurrent producers can never overshoot it.
//! - A notification key stays registered from `add` until the worker calls
//!   `complete`, so the sweep cannot queue a row that is already in flight.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

use super::latency::{host_of, HostLatencyTracker};
use crate::config::NotificationConfig;
use crate::storage::{NotificationData, NotificationKey};

#[derive(Default)]
struct Channel {
    queue: Mutex<VecDeque<NotificationData>>,
    ready: Notify,
}

pub struct NotificationScheduler {
    fast: Channel,
    slow: Channel,
    pending: AtomicUsize,
    in_flight: DashMap<NotificationKey, ()>,
    latency: Arc<HostLatencyTracker>,
    max_total: usize,
    max_slow: usize,
    batch_size: usize,
}

impl NotificationScheduler {
    pub fn new(config: &NotificationConfig, latency: Arc<HostLatencyTracker>) -> Self {
        Self {
            fast: Channel::default(),
            slow: Channel::default(),
            pending: AtomicUsize::new(0),
            in_flight: DashMap::new(),
            latency,
            max_total: config.max_notification_queue_size,
            max_slow: config.max_slow_notification_size,
            batch_size: config.max_notifications_in_batch.max(1),
        }
    }

    pub fn latency(&self) -> &Arc<HostLatencyTracker> {
        &self.latency
    }

    /// Queue `item` for `host`. Never blocks.
    ///
    /// Returns `false` when the target channel or the overall queue is
    /// full, or when the same notification is already queued or being
    /// delivered. A rejected item is picked up again by the recovery sweep.
    pub fn add(&self, item: NotificationData, host: &str) -> bool {
        let key = item.key();
        match self.in_flight.entry(key) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(v) => {
                v.insert(());
            }
        }

        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_total).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            self.in_flight.remove(&key);
            return false;
        }

        let slow = self.latency.is_slow(host);
        let channel = if slow { &self.slow } else { &self.fast };
        {
            let mut queue = channel.queue.lock();
            if slow && queue.len() >= self.max_slow {
                drop(queue);
                self.pending.fetch_sub(1, Ordering::AcqRel);
                self.in_flight.remove(&key);
                return false;
            }
            queue.push_back(item);
        }
        channel.ready.notify_one();
        true
    }

    /// [`add`](Self::add) routed by the item's own callback host.
    pub fn enqueue(&self, item: NotificationData) -> bool {
        let host = host_of(&item.callback.url).to_string();
        self.add(item, &host)
    }

    /// Wait for up to `batch_size` items from one channel.
    ///
    /// Returns `None` once `shutdown` turns `true` or its sender is gone;
    /// never an empty batch.
    pub async fn take(
        &self,
        want_slow: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Vec<NotificationData>> {
        let channel = if want_slow { &self.slow } else { &self.fast };
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let notified = channel.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, more) = {
                let mut queue = channel.queue.lock();
                let n = queue.len().min(self.batch_size);
                let batch: Vec<_> = queue.drain(..n).collect();
                (batch, !queue.is_empty())
            };
            if !batch.is_empty() {
                self.pending.fetch_sub(batch.len(), Ordering::AcqRel);
                if more {
                    // Hand the remainder to another waiting worker.
                    channel.ready.notify_one();
                }
                return Some(batch);
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Release a delivered (or failed) notification's key.
    pub fn complete(&self, key: &NotificationKey) {
        self.in_flight.remove(key);
    }

    /// Items queued in both channels.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slow_len(&self) -> usize {
        self.slow.queue.lock().len()
    }

    pub fn fast_len(&self) -> usize {
        self.fast.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash256;
    use crate::storage::{CallbackTarget, NotificationKind};
    use std::collections::HashSet;
    use std::time::Duration;

    fn item(tx_id: u64) -> NotificationData {
        NotificationData {
            kind: NotificationKind::MerkleProof,
            tx_id,
            tx_hash: Hash256::ZERO,
            block_id: Some(1),
            block_hash: None,
            block_height: None,
            ds_tx_hash: None,
            ds_tx_payload: None,
            merkle_branch: None,
            callback: CallbackTarget::new("http://host/cb"),
            error_count: 0,
        }
    }

    fn scheduler(max_total: usize, max_slow: usize, batch: usize) -> NotificationScheduler {
        let config = NotificationConfig {
            max_notification_queue_size: max_total,
            max_slow_notification_size: max_slow,
            max_notifications_in_batch: batch,
            ..Default::default()
        };
        let latency = Arc::new(HostLatencyTracker::new(5, 100));
        latency.add_execution_time("slow-host", 10_000);
        NotificationScheduler::new(&config, latency)
    }

    #[test]
    fn add_respects_overall_bound() {
        let s = scheduler(3, 1, 10);
        assert!(s.add(item(1), "fast-host"));
        assert!(s.add(item(2), "fast-host"));
        assert!(s.add(item(3), "fast-host"));
        assert!(!s.add(item(4), "fast-host"));
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn slow_channel_has_its_own_bound() {
        let s = scheduler(10, 1, 10);
        assert!(s.add(item(1), "slow-host"));
        assert!(!s.add(item(2), "slow-host"));
        assert!(s.add(item(3), "fast-host"));
        assert_eq!((s.slow_len(), s.fast_len()), (1, 1));
    }

    #[test]
    fn duplicate_key_is_rejected_until_complete() {
        let s = scheduler(10, 5, 10);
        assert!(s.add(item(1), "fast-host"));
        assert!(!s.add(item(1), "fast-host"));
        s.complete(&item(1).key());
        assert!(s.add(item(1), "fast-host"));
    }

    #[tokio::test]
    async fn take_returns_at_most_batch_size() {
        let s = scheduler(10, 5, 2);
        for i in 0..3 {
            s.add(item(i), "fast-host");
        }
        let (_tx, mut rx) = watch::channel(false);
        assert_eq!(s.take(false, &mut rx).await.unwrap().len(), 2);
        assert_eq!(s.take(false, &mut rx).await.unwrap().len(), 1);
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn take_wakes_on_add() {
        let s = Arc::new(scheduler(10, 5, 10));
        let (_tx, mut rx) = watch::channel(false);
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.take(false, &mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(s.add(item(7), "fast-host"));
        let batch = waiter.await.unwrap().unwrap();
        assert_eq!(batch[0].tx_id, 7);
    }

    #[tokio::test]
    async fn take_unblocks_on_shutdown() {
        let s = Arc::new(scheduler(10, 5, 10));
        let (tx, mut rx) = watch::channel(false);
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.take(true, &mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_consumers_never_share_an_item() {
        let s = Arc::new(scheduler(1000, 10, 7));
        let (tx, rx) = watch::channel(false);

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                let mut rx = rx.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while let Some(batch) = s.take(false, &mut rx).await {
                        got.extend(batch.into_iter().map(|n| n.tx_id));
                    }
                    got
                })
            })
            .collect();

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let s = s.clone();
                tokio::spawn(async move {
                    for i in 0..100u64 {
                        assert!(s.add(item(p * 1000 + i), "fast-host"));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for p in producers {
            p.await.unwrap();
        }
        while !s.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();

        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.await.unwrap());
        }
        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(all.len(), 400);
        assert_eq!(unique.len(), 400);
    }
}
