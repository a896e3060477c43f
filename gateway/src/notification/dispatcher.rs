//! Callback delivery workers and the recovery sweep.
//!
//! Fast workers and slow workers pull batches from their channel of the
//! [`NotificationScheduler`], deliver each item through the
//! [`CallbackTransport`], feed the elapsed time back into the latency
//! tracker and record the outcome in the store. The sweep periodically
//! re-queues every unsent row that still has retries left, which is how
//! items rejected by a full queue (or lost to a restart) get delivered.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::envelope::{CallbackMessage, SignedEnvelope};
use super::latency::host_of;
use super::scheduler::NotificationScheduler;
use crate::config::NotificationConfig;
use crate::crypto::CallbackSigner;
use crate::storage::{CallbackTarget, NotificationData, StoreResult, TxStore};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("callback timed out")]
    Timeout,

    #[error("callback endpoint answered HTTP {0}")]
    Status(u16),

    #[error("callback transport error: {0}")]
    Transport(String),

    #[error("could not encode callback: {0}")]
    Encoding(String),
}

/// Delivers one envelope body to a subscriber.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn deliver(&self, target: &CallbackTarget, body: &str) -> Result<(), CallbackError>;
}

pub struct NotificationDispatcher {
    store: Arc<dyn TxStore>,
    scheduler: Arc<NotificationScheduler>,
    transport: Arc<dyn CallbackTransport>,
    signer: CallbackSigner,
    config: NotificationConfig,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn TxStore>,
        scheduler: Arc<NotificationScheduler>,
        transport: Arc<dyn CallbackTransport>,
        signer: CallbackSigner,
        config: NotificationConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            transport,
            signer,
            config,
        }
    }

    /// Spawn every worker and the sweep. All exit once `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for (slow, count) in [
            (false, self.config.instant_notification_workers),
            (true, self.config.slow_notification_workers),
        ] {
            for _ in 0..count {
                let this = Arc::clone(self);
                let rx = shutdown.clone();
                handles.push(tokio::spawn(async move { this.worker(slow, rx).await }));
            }
        }
        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.run_sweep(shutdown).await }));
        handles
    }

    async fn worker(&self, slow: bool, mut shutdown: watch::Receiver<bool>) {
        while let Some(batch) = self.scheduler.take(slow, &mut shutdown).await {
            for item in batch {
                self.deliver(item, slow).await;
            }
        }
        debug!(slow, "notification worker stopped");
    }

    /// Deliver one notification and record the outcome. Returns whether the
    /// subscriber accepted it.
    pub async fn deliver(&self, item: NotificationData, slow: bool) -> bool {
        let key = item.key();
        let host = host_of(&item.callback.url).to_string();
        let timeout = Duration::from_millis(if slow {
            self.config.slow_host_timeout_ms
        } else {
            self.config.fast_host_timeout_ms
        });

        let started = Instant::now();
        let result = match self.envelope(&item) {
            Ok(body) => match tokio::time::timeout(timeout, self.transport.deliver(&item.callback, &body)).await {
                Ok(r) => r,
                Err(_) => Err(CallbackError::Timeout),
            },
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.scheduler.latency().add_execution_time(&host, elapsed_ms);

        let delivered = result.is_ok();
        let recorded = match result {
            Ok(()) => {
                debug!(kind = %item.kind, tx = %item.tx_hash, host = %host, elapsed_ms, "callback delivered");
                self.store.set_notification_send_date(&key, Utc::now())
            }
            Err(e) => {
                let errors = item.error_count + 1;
                warn!(kind = %item.kind, tx = %item.tx_hash, host = %host, errors, error = %e, "callback failed");
                self.store.set_notification_error(&key, &e.to_string(), errors)
            }
        };
        if let Err(e) = recorded {
            warn!(tx = %item.tx_hash, error = %e, "could not record callback outcome");
        }
        self.scheduler.complete(&key);
        delivered
    }

    fn envelope(&self, item: &NotificationData) -> Result<String, CallbackError> {
        let message = CallbackMessage::from_notification(item, &self.signer.public_key_hex(), Utc::now());
        SignedEnvelope::sign(&message, &self.signer)
            .and_then(|env| env.to_json())
            .map_err(|e| CallbackError::Encoding(e.to_string()))
    }

    /// Queue every unsent row with retries left. Returns how many were
    /// accepted by the scheduler.
    pub fn sweep(&self) -> StoreResult<usize> {
        let retry_limit = self.config.notifications_retry_count;
        let page = self.config.sweep_page_size.max(1);
        let mut queued = 0;

        let mut offer = |items: Vec<NotificationData>| {
            for item in items {
                if item.error_count < retry_limit && self.scheduler.enqueue(item) {
                    queued += 1;
                }
            }
        };

        let mut skip = 0;
        loop {
            let rows = self.store.get_txs_to_send_merkle_proof_notifications(skip, page)?;
            let n = rows.len();
            offer(rows);
            if n < page {
                break;
            }
            skip += n;
        }
        offer(self.store.get_txs_to_send_block_ds_notifications()?);
        offer(self.store.get_txs_to_send_mempool_ds_notifications()?);
        Ok(queued)
    }

    async fn run_sweep(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.notification_interval_sec.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep() {
                        Ok(0) => {}
                        Ok(n) => info!(queued = n, "notification sweep queued pending callbacks"),
                        Err(e) => warn!(error = %e, "notification sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("notification sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::verify_hex;
    use crate::crypto::Hash256;
    use crate::notification::HostLatencyTracker;
    use crate::storage::{GatewayDb, NewBlock, NewTx};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        bodies: Mutex<Vec<(String, String)>>,
        fail: bool,
        delay_ms: u64,
    }

    #[async_trait]
    impl CallbackTransport for Recorder {
        async fn deliver(&self, target: &CallbackTarget, body: &str) -> Result<(), CallbackError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                return Err(CallbackError::Status(500));
            }
            self.bodies.lock().push((target.url.clone(), body.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        db: GatewayDb,
        scheduler: Arc<NotificationScheduler>,
        dispatcher: Arc<NotificationDispatcher>,
        transport: Arc<Recorder>,
    }

    fn fixture(transport: Recorder, config: NotificationConfig) -> Fixture {
        let db = GatewayDb::open_temporary().unwrap();
        let latency = Arc::new(HostLatencyTracker::new(config.saved_execution_times, config.slow_host_threshold_ms));
        let scheduler = Arc::new(NotificationScheduler::new(&config, latency));
        let transport = Arc::new(transport);
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::new(db.clone()),
            scheduler.clone(),
            transport.clone(),
            CallbackSigner::generate(),
            config,
        ));
        Fixture {
            db,
            scheduler,
            dispatcher,
            transport,
        }
    }

    /// One tracked tx mined in one active block: one pending merkle proof.
    fn seed_merkle_proof(db: &GatewayDb) {
        let mut tx = NewTx::submitted(Hash256([1; 32]), vec![1], Utc::now());
        tx.merkle_proof = true;
        tx.callback = Some(CallbackTarget::new("http://subscriber.test/cb"));
        let tx_id = db.insert_or_update_txs(&[tx], false, false).unwrap()[0];
        let block_id = db
            .insert_or_update_block(&NewBlock {
                hash: Hash256([2; 32]),
                prev_hash: Hash256::ZERO,
                height: 1,
                on_active_chain: true,
                block_time: Utc::now(),
            })
            .unwrap();
        db.insert_tx_block(tx_id, block_id, None).unwrap();
    }

    #[tokio::test]
    async fn successful_delivery_marks_row_sent() {
        let f = fixture(Recorder::default(), NotificationConfig::default());
        seed_merkle_proof(&f.db);

        let item = f.db.get_txs_to_send_merkle_proof_notifications(0, 10).unwrap().remove(0);
        assert!(f.dispatcher.deliver(item, false).await);

        assert!(f.db.get_txs_to_send_merkle_proof_notifications(0, 10).unwrap().is_empty());
        let (url, body) = f.transport.bodies.lock()[0].clone();
        assert_eq!(url, "http://subscriber.test/cb");
        let env: SignedEnvelope = serde_json::from_str(&body).unwrap();
        assert!(verify_hex(&env.public_key, env.payload.as_bytes(), &env.signature).unwrap());
    }

    #[tokio::test]
    async fn failure_increments_error_count() {
        let f = fixture(
            Recorder {
                fail: true,
                ..Default::default()
            },
            NotificationConfig::default(),
        );
        seed_merkle_proof(&f.db);

        let item = f.db.get_txs_to_send_merkle_proof_notifications(0, 10).unwrap().remove(0);
        assert!(!f.dispatcher.deliver(item, false).await);

        let pending = f.db.get_txs_to_send_merkle_proof_notifications(0, 10).unwrap();
        assert_eq!(pending[0].error_count, 1);
    }

    #[tokio::test]
    async fn slow_delivery_times_out_and_marks_host_slow() {
        let config = NotificationConfig {
            fast_host_timeout_ms: 20,
            slow_host_threshold_ms: 10,
            ..Default::default()
        };
        let f = fixture(
            Recorder {
                delay_ms: 200,
                ..Default::default()
            },
            config,
        );
        seed_merkle_proof(&f.db);

        let item = f.db.get_txs_to_send_merkle_proof_notifications(0, 10).unwrap().remove(0);
        assert!(!f.dispatcher.deliver(item, false).await);
        assert!(f.scheduler.latency().is_slow("subscriber.test"));
    }

    #[tokio::test]
    async fn sweep_skips_exhausted_rows_and_in_flight_items() {
        let config = NotificationConfig {
            notifications_retry_count: 2,
            ..Default::default()
        };
        let f = fixture(Recorder::default(), config);
        seed_merkle_proof(&f.db);

        assert_eq!(f.dispatcher.sweep().unwrap(), 1);
        // Already queued: the second sweep does not duplicate it.
        assert_eq!(f.dispatcher.sweep().unwrap(), 0);
        assert_eq!(f.scheduler.len(), 1);

        let key = f.db.get_txs_to_send_merkle_proof_notifications(0, 10).unwrap()[0].key();
        f.db.set_notification_error(&key, "boom", 2).unwrap();
        f.scheduler.complete(&key);
        assert_eq!(f.dispatcher.sweep().unwrap(), 0);
    }

    #[tokio::test]
    async fn workers_drain_queue_and_stop_on_shutdown() {
        let f = fixture(Recorder::default(), NotificationConfig::default());
        seed_merkle_proof(&f.db);
        let (tx, rx) = watch::channel(false);

        let handles = f.dispatcher.spawn(rx);
        f.dispatcher.sweep().unwrap();
        for _ in 0..100 {
            if !f.transport.bodies.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.transport.bodies.lock().len(), 1);

        tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap();
        }
    }
}
