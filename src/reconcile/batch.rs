//! Batch Reconciliation Driver
//!
//! Sequential, throttled sweep of many addresses through the `Reconciler`.
//! One ledger call is in flight at a time. In-flight state lives in a
//! caller-owned `BatchRun`, so independent runs never share counters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use super::reconciler::Reconciler;
use crate::config::BatchConfig;
use crate::error::ReferralResult;
use crate::models::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Sweep,
    RetryFailed,
}

/// Running tally of one batch run, published after every address.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub run_id: Uuid,
    pub mode: BatchMode,
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub changed: usize,
    /// 1-based index of the batch being worked on.
    pub current_batch: usize,
    pub total_batches: usize,
    pub failed_addresses: Vec<Address>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub estimated_remaining_ms: Option<u64>,
    /// Stopped early on request; unprocessed addresses were left alone.
    pub stopped: bool,
    pub finished: bool,
}

impl BatchProgress {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            mode: BatchMode::Sweep,
            total: 0,
            processed: 0,
            success: 0,
            failed: 0,
            changed: 0,
            current_batch: 0,
            total_batches: 0,
            failed_addresses: Vec::new(),
            started_at: Utc::now(),
            elapsed_ms: 0,
            estimated_remaining_ms: None,
            stopped: false,
            finished: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }
}

/// Cooperative stop signal, honoured between batches.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Owner of one run's progress. Create one per run.
pub struct BatchRun {
    progress: BatchProgress,
    tx: watch::Sender<BatchProgress>,
    stop: Arc<AtomicBool>,
    started: Instant,
}

impl BatchRun {
    pub fn new() -> Self {
        let progress = BatchProgress::new(Uuid::new_v4());
        let (tx, _) = watch::channel(progress.clone());
        Self {
            progress,
            tx,
            stop: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.progress.run_id
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.tx.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
        }
    }

    pub fn progress(&self) -> &BatchProgress {
        &self.progress
    }

    /// Start from fresh counters; the run id survives a reused `BatchRun`.
    fn begin(&mut self, mode: BatchMode, total: usize, batch_size: usize) {
        self.started = Instant::now();
        self.progress = BatchProgress::new(self.progress.run_id);
        self.progress.mode = mode;
        self.progress.total = total;
        self.progress.total_batches = total.div_ceil(batch_size);
        self.publish();
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn publish(&mut self) {
        let elapsed = self.started.elapsed();
        self.progress.elapsed_ms = elapsed.as_millis() as u64;
        self.progress.estimated_remaining_ms = if self.progress.processed == 0 {
            None
        } else {
            let per_item = elapsed.as_millis() / self.progress.processed as u128;
            Some((per_item * self.progress.remaining() as u128) as u64)
        };
        self.tx.send_replace(self.progress.clone());
    }
}

impl Default for BatchRun {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct BatchDriver {
    reconciler: Reconciler,
    config: BatchConfig,
}

impl BatchDriver {
    pub fn new(reconciler: Reconciler, config: BatchConfig) -> Self {
        Self { reconciler, config }
    }

    /// Regular sweep with the configured intra/inter batch pauses.
    pub async fn run(&self, addresses: Vec<Address>, run: &mut BatchRun) -> BatchProgress {
        self.execute(
            BatchMode::Sweep,
            addresses,
            self.config.intra_batch_pause(),
            self.config.inter_batch_pause(),
            run,
        )
        .await
    }

    /// Re-run only the given failed addresses with the longer retry pause.
    pub async fn retry_failed(&self, addresses: Vec<Address>, run: &mut BatchRun) -> BatchProgress {
        let pause = self.config.retry_pause();
        self.execute(BatchMode::RetryFailed, addresses, pause, pause, run)
            .await
    }

    /// Retry pass fed from the store's persisted failure queue. Only
    /// retryable failures are ever queued.
    pub async fn retry_recorded(&self, run: &mut BatchRun) -> ReferralResult<BatchProgress> {
        let addresses = self.reconciler.store().failed_addresses()?;
        Ok(self.retry_failed(addresses, run).await)
    }

    async fn execute(
        &self,
        mode: BatchMode,
        addresses: Vec<Address>,
        item_pause: Duration,
        batch_pause: Duration,
        run: &mut BatchRun,
    ) -> BatchProgress {
        let mut seen = HashSet::with_capacity(addresses.len());
        let addresses: Vec<Address> = addresses
            .into_iter()
            .filter(|a| seen.insert(a.clone()))
            .collect();

        let batch_size = self.config.batch_size.max(1);
        run.begin(mode, addresses.len(), batch_size);
        let reader = self.reconciler.reader();
        info!(
            run_id = %run.run_id(),
            ?mode,
            total = addresses.len(),
            batches = run.progress.total_batches,
            source = reader.source_name(),
            max_read_ms = reader.max_read_time().as_millis() as u64,
            "🚀 Batch reconciliation started"
        );

        let batches: Vec<&[Address]> = addresses.chunks(batch_size).collect();
        let batch_count = batches.len();

        for (batch_idx, batch) in batches.into_iter().enumerate() {
            if run.stop_requested() {
                info!(
                    run_id = %run.run_id(),
                    processed = run.progress.processed,
                    remaining = run.progress.remaining(),
                    "🛑 Batch reconciliation stopped"
                );
                run.progress.stopped = true;
                break;
            }

            run.progress.current_batch = batch_idx + 1;
            for (item_idx, address) in batch.iter().enumerate() {
                self.process_one(address, run).await;
                if item_idx + 1 < batch.len() && !item_pause.is_zero() {
                    sleep(item_pause).await;
                }
            }

            info!(
                run_id = %run.run_id(),
                batch = batch_idx + 1,
                of = batch_count,
                processed = run.progress.processed,
                success = run.progress.success,
                failed = run.progress.failed,
                "Batch complete"
            );

            if batch_idx + 1 < batch_count && !batch_pause.is_zero() {
                sleep(batch_pause).await;
            }
        }

        run.progress.finished = true;
        run.publish();

        let p = &run.progress;
        info!(
            run_id = %p.run_id,
            processed = p.processed,
            success = p.success,
            failed = p.failed,
            changed = p.changed,
            elapsed_ms = p.elapsed_ms,
            stopped = p.stopped,
            "✅ Batch reconciliation finished"
        );
        run.progress.clone()
    }

    async fn process_one(&self, address: &Address, run: &mut BatchRun) {
        let store = self.reconciler.store();
        match self.reconciler.reconcile(address).await {
            Ok(outcome) => {
                run.progress.success += 1;
                if outcome.changed() {
                    run.progress.changed += 1;
                }
                if let Err(e) = store.clear_failure(address) {
                    warn!(%address, error = %e, "Could not clear failure record");
                }
            }
            Err(e) => {
                warn!(run_id = %run.run_id(), %address, kind = e.kind(), error = %e, "Reconcile failed");
                run.progress.failed += 1;
                run.progress.failed_addresses.push(address.clone());
                let queued = if e.is_retryable() {
                    store.record_failure(address, &e)
                } else {
                    store.clear_failure(address).map(|_| ())
                };
                if let Err(store_err) = queued {
                    warn!(%address, error = %store_err, "Could not update failure record");
                }
            }
        }
        run.progress.processed += 1;
        run.publish();
    }
}
