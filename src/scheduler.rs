//! Interval manager for the background loops. Tracks last-run time and run
//! count per job, prevents reentry for `max_concurrent = 1` jobs, replaces
//! registrations that reuse an id, and stops everything on shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::store::now_millis;

pub type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Entry {
    handle: JoinHandle<()>,
    last_run: Arc<AtomicU64>,
    run_count: Arc<AtomicU64>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntervalStats {
    pub id: String,
    pub last_run: Option<u64>,
    pub run_count: u64,
}

/// Token returned by `register`; hand it back to `unregister` to stop the
/// loop early.
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    pub id: String,
}

#[derive(Default)]
pub struct IntervalManager {
    entries: Mutex<HashMap<String, Entry>>,
}

impl IntervalManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recurring job. A second registration under the same id
    /// replaces (stops) the first. `max_concurrent = 1` awaits the callback
    /// inline so a slow run can never overlap the next one.
    pub fn register(
        &self,
        id: &str,
        callback: JobFn,
        interval_ms: u64,
        immediate: bool,
        max_concurrent: usize,
    ) -> RegistrationHandle {
        let last_run = Arc::new(AtomicU64::new(0));
        let run_count = Arc::new(AtomicU64::new(0));

        let task_last_run = Arc::clone(&last_run);
        let task_run_count = Arc::clone(&run_count);
        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms.max(1));
            let start = if immediate {
                tokio::time::Instant::now()
            } else {
                tokio::time::Instant::now() + period
            };
            let mut ticker = time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                task_last_run.store(now_millis(), Ordering::Relaxed);
                task_run_count.fetch_add(1, Ordering::Relaxed);
                if max_concurrent == 1 {
                    callback().await;
                } else {
                    tokio::spawn(callback());
                }
            }
        });

        let mut entries = self.entries.lock().expect("interval manager lock");
        if let Some(old) = entries.insert(
            id.to_string(),
            Entry {
                handle,
                last_run,
                run_count,
            },
        ) {
            debug!("Replacing interval registration {id}");
            old.handle.abort();
        }

        RegistrationHandle { id: id.to_string() }
    }

    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        let mut entries = self.entries.lock().expect("interval manager lock");
        match entries.remove(&handle.id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> Vec<IntervalStats> {
        let entries = self.entries.lock().expect("interval manager lock");
        let mut stats: Vec<IntervalStats> = entries
            .iter()
            .map(|(id, entry)| {
                let last = entry.last_run.load(Ordering::Relaxed);
                IntervalStats {
                    id: id.clone(),
                    last_run: (last > 0).then_some(last),
                    run_count: entry.run_count.load(Ordering::Relaxed),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    /// Stop all loops. Pending callbacks are not awaited.
    pub fn shutdown(&self) {
        let mut entries = self.entries.lock().expect("interval manager lock");
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_job(counter: Arc<AtomicU32>) -> JobFn {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_and_interval_firing() {
        let manager = IntervalManager::new();
        let counter = Arc::new(AtomicU32::new(0));
        manager.register("job", counting_job(Arc::clone(&counter)), 1000, true, 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_replaces() {
        let manager = IntervalManager::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        manager.register("job", counting_job(Arc::clone(&first)), 1000, false, 1);
        manager.register("job", counting_job(Arc::clone(&second)), 1000, false, 1);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert!(second.load(Ordering::SeqCst) >= 3);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_stops_loop() {
        let manager = IntervalManager::new();
        let counter = Arc::new(AtomicU32::new(0));
        let handle = manager.register("job", counting_job(Arc::clone(&counter)), 1000, false, 1);

        assert!(manager.unregister(&handle));
        assert!(!manager.unregister(&handle));

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reentry_for_slow_callbacks() {
        let manager = IntervalManager::new();
        let running = Arc::new(AtomicU32::new(0));
        let overlapped = Arc::new(AtomicU32::new(0));

        let job_running = Arc::clone(&running);
        let job_overlapped = Arc::clone(&overlapped);
        let job: JobFn = Arc::new(move || {
            let running = Arc::clone(&job_running);
            let overlapped = Arc::clone(&job_overlapped);
            Box::pin(async move {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                // Slower than the interval
                tokio::time::sleep(Duration::from_millis(2500)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
        });
        manager.register("slow", job, 1000, true, 1);

        tokio::time::sleep(Duration::from_millis(8000)).await;
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
        manager.shutdown();
    }
}
