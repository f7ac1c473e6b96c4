//! Asynchronous write pipeline.
//!
//! Request telemetry is persisted off the request path: producers enqueue
//! jobs onto a bounded channel and a single consumer task applies them in
//! order. Overflow drops the newest job (the `try_send` that failed),
//! counted and logged.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::WRITE_QUEUE_CAP;
use crate::store::{RequestRecord, apply_job};

#[derive(Debug)]
pub enum WriteJob {
    /// Persist a completed (or aborted) request record, optionally with its
    /// captured payload blob.
    Record {
        record: RequestRecord,
        payload: Option<Value>,
    },
    /// Touch an account that served a response: last_used, request counters,
    /// and the session counter for session-tracking providers.
    AccountServed {
        account_id: Uuid,
        now: u64,
        tracks_session: bool,
    },
    /// Touch an inbound API key that authenticated a request.
    KeyUsed { key_id: String, now: u64 },
}

/// One log line per this interval when the queue is overflowing.
const DROP_LOG_INTERVAL_MS: u64 = 10_000;

pub struct WriteQueue {
    tx: Mutex<Option<mpsc::Sender<WriteJob>>>,
    dropped: AtomicU64,
    last_drop_log: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteQueue {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(WRITE_QUEUE_CAP);

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = apply_job(&job).await {
                    // Best-effort: write failures never block request completion.
                    warn!("Write job failed: {e}");
                }
            }
            debug!("Write queue drained");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
            last_drop_log: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a job without blocking. On a full (or already closed) queue
    /// the job is dropped, the drop counter incremented, and the overflow
    /// logged at most once per `DROP_LOG_INTERVAL_MS`.
    pub fn enqueue(&self, job: WriteJob, now: u64) {
        let sent = {
            let guard = self.tx.lock().expect("write queue sender lock");
            match guard.as_ref() {
                Some(tx) => tx.try_send(job).is_ok(),
                None => false,
            }
        };

        if !sent {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let last = self.last_drop_log.load(Ordering::Relaxed);
            if now.saturating_sub(last) >= DROP_LOG_INTERVAL_MS
                && self
                    .last_drop_log
                    .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                warn!("Write queue full; dropped {total} jobs so far");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the consumer to drain the remaining
    /// jobs, bounded by `timeout`. Called once on graceful shutdown; jobs
    /// enqueued afterwards are counted as dropped.
    pub async fn shutdown(&self, timeout: Duration) {
        let tx = self.tx.lock().expect("write queue sender lock").take();
        drop(tx);

        let handle = self.handle.lock().expect("write queue handle lock").take();
        if let Some(handle) = handle
            && tokio::time::timeout(timeout, handle).await.is_err()
        {
            warn!("Write queue drain timed out; remaining jobs abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RequestRecord;

    #[tokio::test]
    async fn test_enqueue_after_shutdown_counts_drops() {
        let queue = WriteQueue::spawn();
        assert_eq!(queue.dropped_count(), 0);

        queue.shutdown(Duration::from_secs(1)).await;

        queue.enqueue(
            WriteJob::KeyUsed {
                key_id: "k".into(),
                now: 1,
            },
            1,
        );
        queue.enqueue(
            WriteJob::Record {
                record: RequestRecord::new("POST", "/v1/messages"),
                payload: None,
            },
            2,
        );
        assert_eq!(queue.dropped_count(), 2);
    }
}
