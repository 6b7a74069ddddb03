//! Scheduler (C10, §4.10): periodically triggers scans for enabled jobs.
//! Grounded in the teacher's `backup_scheduler.rs` tick-loop idiom
//! (per-job mutex, interval-driven rescheduling), generalized from a single
//! fixed interval to a binary-heap-ordered `next_scan` schedule with a
//! global concurrent-scan cap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{EngineError, Result};
use crate::models::job::{self, Job};
use crate::scanner::Scanner;

const TICK_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduleEntry {
    next_scan: DateTime<Utc>,
    job_id: String,
}

impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.next_scan.cmp(&self.next_scan)
    }
}
impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub scheduled_jobs: usize,
    pub scans_run: u64,
    pub scans_failed: u64,
}

struct Inner {
    heap: BinaryHeap<Reverse<ScheduleEntry>>,
    job_locks: HashMap<String, Arc<Mutex<()>>>,
    stats: SchedulerStats,
}

pub struct Scheduler {
    pool: Pool<SqliteConnectionManager>,
    scanner: Arc<Scanner>,
    inner: Mutex<Inner>,
    scan_semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    on_scan_complete: Box<dyn Fn(&Job) + Send + Sync>,
}

impl Scheduler {
    pub fn new(
        pool: Pool<SqliteConnectionManager>,
        scanner: Arc<Scanner>,
        scan_concurrent_max: usize,
        on_scan_complete: impl Fn(&Job) + Send + Sync + 'static,
    ) -> Self {
        Self {
            pool,
            scanner,
            inner: Mutex::new(Inner { heap: BinaryHeap::new(), job_locks: HashMap::new(), stats: SchedulerStats::default() }),
            scan_semaphore: Arc::new(Semaphore::new(scan_concurrent_max)),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            on_scan_complete: Box::new(on_scan_complete),
        }
    }

    fn compute_next_scan(job: &Job) -> DateTime<Utc> {
        let interval = chrono::Duration::minutes(job.scan_interval_minutes as i64);
        match &job.last_scan_at {
            Some(ts) => {
                let last = DateTime::parse_from_rfc3339(ts).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now());
                std::cmp::max(Utc::now(), last + interval)
            }
            None => Utc::now(),
        }
    }

    /// §4.10 `start`: load enabled jobs, seed the heap, spin the tick loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let conn = self.pool.get().map_err(|e| EngineError::System(e.to_string()))?;
            let jobs = job::find_all_enabled(&conn).map_err(EngineError::from)?;
            let mut inner = self.inner.lock().await;
            for job in jobs {
                inner.heap.push(Reverse(ScheduleEntry { next_scan: Self::compute_next_scan(&job), job_id: job.id.clone() }));
                inner.job_locks.entry(job.id).or_insert_with(|| Arc::new(Mutex::new(())));
            }
            inner.stats.scheduled_jobs = inner.heap.len();
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => this.run_due_jobs().await,
                }
            }
        });
        *self.handle.lock().await = Some(handle);
        Ok(())
    }

    async fn run_due_jobs(self: &Arc<Self>) {
        let now = Utc::now();
        let due: Vec<String> = {
            let mut inner = self.inner.lock().await;
            let mut due = Vec::new();
            while let Some(Reverse(entry)) = inner.heap.peek() {
                if entry.next_scan > now {
                    break;
                }
                let Reverse(entry) = inner.heap.pop().unwrap();
                due.push(entry.job_id);
            }
            due
        };

        for job_id in due {
            let this = Arc::clone(self);
            let permit = Arc::clone(&self.scan_semaphore);
            tokio::spawn(async move {
                let _permit = match permit.try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        // No capacity right now; requeue immediately-due.
                        this.reschedule_now(&job_id).await;
                        return;
                    }
                };
                this.run_one(&job_id).await;
            });
        }
    }

    async fn reschedule_now(self: &Arc<Self>, job_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.heap.push(Reverse(ScheduleEntry { next_scan: Utc::now(), job_id: job_id.to_string() }));
    }

    async fn run_one(self: &Arc<Self>, job_id: &str) {
        let lock = {
            let mut inner = self.inner.lock().await;
            Arc::clone(inner.job_locks.entry(job_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        let Ok(_guard) = lock.try_lock() else {
            warn!(job_id, "scan already in progress, skipping reentrant tick");
            return;
        };

        let conn = match self.pool.get() {
            Ok(c) => c,
            Err(e) => {
                error!(job_id, error = %e, "failed to acquire db connection for scan");
                return;
            }
        };
        let job = match job::find_by_id(&conn, job_id) {
            Ok(Some(j)) if j.enabled => j,
            Ok(_) => return,
            Err(e) => {
                error!(job_id, error = %e, "failed to load job for scan");
                return;
            }
        };
        drop(conn);

        let result = self.scanner.compare(&job, &job.auto_queue);
        let mut inner = self.inner.lock().await;
        match result {
            Ok(_) => {
                inner.stats.scans_run += 1;
                (self.on_scan_complete)(&job);
            }
            Err(e) => {
                inner.stats.scans_failed += 1;
                error!(job_id, error = %e, "scan failed");
            }
        }

        if let Ok(conn) = self.pool.get() {
            let _ = job::set_last_scan_at(&conn, job_id, &Utc::now().to_rfc3339());
        }
        inner.heap.push(Reverse(ScheduleEntry { next_scan: Self::compute_next_scan(&job), job_id: job_id.to_string() }));
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    pub async fn jobs(&self) -> Vec<String> {
        self.inner.lock().await.heap.iter().map(|Reverse(e)| e.job_id.clone()).collect()
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.inner.lock().await.stats.clone()
    }

    /// Job upsert: drop any existing heap entry for this job and reschedule
    /// (or remove entirely when `enabled=false`).
    pub async fn upsert_job(&self, job: &Job) {
        let mut inner = self.inner.lock().await;
        inner.heap.retain(|Reverse(e)| e.job_id != job.id);
        if job.enabled {
            inner.heap.push(Reverse(ScheduleEntry { next_scan: Self::compute_next_scan(job), job_id: job.id.clone() }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_entry_orders_earliest_first_via_reverse() {
        let mut heap = BinaryHeap::new();
        let now = Utc::now();
        heap.push(Reverse(ScheduleEntry { next_scan: now + chrono::Duration::seconds(10), job_id: "b".into() }));
        heap.push(Reverse(ScheduleEntry { next_scan: now, job_id: "a".into() }));
        let Reverse(first) = heap.pop().unwrap();
        assert_eq!(first.job_id, "a");
    }
}
