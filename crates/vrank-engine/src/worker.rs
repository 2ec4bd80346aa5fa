//! Background execution of queued reconciliation batches.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use vrank_core::{JobId, RankResult};
use vrank_queue::{classify, decide_retry, RetryDecision};
use vrank_storage::Storage;

use crate::reconcile::ReconcileReport;
use crate::util::now_unix;
use crate::{Engine, WorkerConfig};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { job_id: JobId, report: ReconcileReport },
    Retrying { job_id: JobId, after_secs: u64 },
    DeadLettered { job_id: JobId, reason: String },
}

/// Leases and runs jobs one at a time.
pub struct Worker<S> {
    engine: Arc<Engine<S>>,
    worker_id: String,
    lease_secs: i64,
}

impl<S: Storage> Worker<S> {
    pub fn new(engine: Arc<Engine<S>>, worker_id: impl Into<String>) -> Self {
        Self {
            engine,
            worker_id: worker_id.into(),
            lease_secs: 60,
        }
    }

    pub fn with_lease_secs(mut self, lease_secs: i64) -> Self {
        self.lease_secs = lease_secs;
        self
    }

    /// Runs the oldest visible job, if any. Failures are recorded on the job
    /// (rescheduled or dead-lettered) rather than returned; only queue I/O
    /// errors surface here.
    pub fn run_once(&self) -> RankResult<Option<JobOutcome>> {
        let store = self.engine.store();
        let now = now_unix();
        let Some(job) = store.try_acquire_lease(&self.worker_id, now, self.lease_secs)? else {
            return Ok(None);
        };
        let attempt = job.attempts + 1;

        let outcome = match self.engine.run_job(&job) {
            Ok(report) => {
                store.complete(&job.id, &self.worker_id)?;
                info!(job = %job.id, kind = %job.kind, users = job.users.len(), added = report.added, removed = report.removed, "job completed");
                JobOutcome::Completed { job_id: job.id, report }
            }
            Err(err) => match decide_retry(classify(&err), attempt, job.max_attempts) {
                RetryDecision::RetryAfterSecs(after_secs) => {
                    warn!(job = %job.id, attempt, after_secs, "job failed, retrying: {err}");
                    store.reschedule(&job.id, &self.worker_id, now + after_secs as i64, &err.to_string())?;
                    JobOutcome::Retrying {
                        job_id: job.id,
                        after_secs,
                    }
                }
                RetryDecision::DeadLetter { reason } => {
                    error!(job = %job.id, attempt, %reason, "job dead-lettered: {err}");
                    store.dead_letter(&job.id, &self.worker_id, &format!("{reason}: {err}"))?;
                    JobOutcome::DeadLettered { job_id: job.id, reason }
                }
            },
        };
        Ok(Some(outcome))
    }

    /// Runs jobs until none is visible. Returns how many were processed.
    pub fn drain(&self) -> RankResult<usize> {
        let mut processed = 0;
        while self.run_once()?.is_some() {
            processed += 1;
        }
        if processed > 0 {
            debug!(worker = %self.worker_id, processed, "queue drained");
        }
        Ok(processed)
    }
}

/// A set of tokio tasks that poll the queue and drain it on a blocking
/// thread each tick.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<S: Storage + 'static>(engine: Arc<Engine<S>>, cfg: &WorkerConfig, worker_id: &str) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let poll = Duration::from_millis(cfg.poll_interval_ms.max(1));
        let handles = (0..cfg.threads.max(1))
            .map(|i| {
                let worker = Arc::new(
                    Worker::new(Arc::clone(&engine), format!("{worker_id}-{i}")).with_lease_secs(cfg.lease_secs),
                );
                let mut rx = rx.clone();
                tokio::spawn(async move {
                    let mut tick = interval(poll);
                    loop {
                        tokio::select! {
                            _ = tick.tick() => {}
                            _ = rx.changed() => break,
                        }
                        let w = Arc::clone(&worker);
                        match tokio::task::spawn_blocking(move || w.drain()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!("worker tick error: {e:?}"),
                            Err(e) => warn!("worker task failed: {e:?}"),
                        }
                    }
                })
            })
            .collect();
        info!(threads = cfg.threads.max(1), "worker pool started");
        Self { shutdown, handles }
    }

    /// Signals every worker and waits for the in-flight drains to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for h in self.handles {
            let _ = h.await;
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use vrank_core::*;
    use vrank_storage::{Directory, InMemoryStorage, JobQueue, RankList, RankStore};

    use super::*;
    use crate::test_support::*;
    use crate::EngineConfig;

    #[test]
    fn drain_runs_queued_grant_jobs() {
        let engine = Arc::new(engine_with(|s| s.with_group(group("crew", &["c1", "c2"]))));
        create(&engine, task("t1", "a"));
        assert_eq!(grant(&engine, "crew", "task-view-all", true), 1);

        let worker = Worker::new(Arc::clone(&engine), "w");
        assert_eq!(worker.drain().unwrap(), 1);
        assert_eq!(ids(&engine, "c1", ItemKind::Task), vec!["t1"]);
        assert!(engine.store().pending_jobs().unwrap().is_empty());
        assert!(worker.run_once().unwrap().is_none());
    }

    #[test]
    fn revocation_job_empties_lists() {
        let engine = Arc::new(engine_with(|s| s.with_group(group("crew", &["c1"]))));
        create(&engine, task("t1", "a"));
        create(&engine, task("t2", "a"));
        grant(&engine, "crew", "task-view-all", true);
        let worker = Worker::new(Arc::clone(&engine), "w");
        worker.drain().unwrap();
        assert_eq!(ids(&engine, "c1", ItemKind::Task).len(), 2);

        grant(&engine, "crew", "task-view-all", false);
        worker.drain().unwrap();
        assert!(ids(&engine, "c1", ItemKind::Task).is_empty());
    }

    /// Delegates to memory but fails organisation loads while armed.
    struct FlakyStore {
        inner: InMemoryStorage,
        failing: AtomicBool,
    }

    impl RankStore for FlakyStore {
        fn with_list<T, F>(&self, key: &ListKey, f: F) -> RankResult<T>
        where
            F: FnOnce(&mut dyn RankList) -> RankResult<T>,
        {
            self.inner.with_list(key, f)
        }

        fn entries(&self, key: &ListKey) -> RankResult<Vec<RankEntry>> {
            self.inner.entries(key)
        }

        fn holders(&self, item: &ItemRef) -> RankResult<BTreeSet<UserId>> {
            self.inner.holders(item)
        }

        fn list_keys(&self) -> RankResult<Vec<ListKey>> {
            self.inner.list_keys()
        }
    }

    impl Directory for FlakyStore {
        fn load_org(&self, org_id: &OrgId) -> RankResult<OrgSnapshot> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RankError::Backend(anyhow::anyhow!("connection reset")));
            }
            self.inner.load_org(org_id)
        }

        fn item(&self, item: &ItemRef) -> RankResult<Option<WorkItem>> {
            self.inner.item(item)
        }

        fn record(&self, event: &Event) -> RankResult<()> {
            self.inner.record(event)
        }
    }

    impl JobQueue for FlakyStore {
        fn enqueue(&self, job: ReconcileJob) -> RankResult<bool> {
            self.inner.enqueue(job)
        }

        fn try_acquire_lease(&self, worker_id: &str, now_unix: i64, ttl_secs: i64) -> RankResult<Option<ReconcileJob>> {
            self.inner.try_acquire_lease(worker_id, now_unix, ttl_secs)
        }

        fn complete(&self, job_id: &JobId, worker_id: &str) -> RankResult<()> {
            self.inner.complete(job_id, worker_id)
        }

        fn reschedule(&self, job_id: &JobId, worker_id: &str, visible_at_unix: i64, error: &str) -> RankResult<()> {
            self.inner.reschedule(job_id, worker_id, visible_at_unix, error)
        }

        fn dead_letter(&self, job_id: &JobId, worker_id: &str, reason: &str) -> RankResult<()> {
            self.inner.dead_letter(job_id, worker_id, reason)
        }

        fn pending_jobs(&self) -> RankResult<Vec<ReconcileJob>> {
            self.inner.pending_jobs()
        }

        fn dead_jobs(&self) -> RankResult<Vec<ReconcileJob>> {
            self.inner.dead_jobs()
        }
    }

    fn flaky_engine(max_attempts: u32) -> Arc<Engine<FlakyStore>> {
        let store = FlakyStore {
            inner: InMemoryStorage::new(),
            failing: AtomicBool::new(false),
        };
        let cfg = EngineConfig {
            max_attempts,
            ..Default::default()
        };
        let engine = Arc::new(Engine::new(Arc::new(store), cfg));
        seed_org(&engine, |s| s.with_group(group("crew", &["c1"])));
        create(&engine, task("t1", "a"));
        grant(&engine, "crew", "task-view-all", true);
        engine.store().failing.store(true, Ordering::SeqCst);
        engine
    }

    #[test]
    fn backend_failure_is_rescheduled_with_backoff() {
        let engine = flaky_engine(3);
        let worker = Worker::new(Arc::clone(&engine), "w");
        match worker.run_once().unwrap() {
            Some(JobOutcome::Retrying { after_secs, .. }) => assert_eq!(after_secs, 5),
            other => panic!("unexpected {other:?}"),
        }
        // not visible again until the backoff elapses
        assert!(worker.run_once().unwrap().is_none());
        let pending = engine.store().pending_jobs().unwrap();
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap_or("").contains("connection reset"));
    }

    #[test]
    fn last_attempt_is_dead_lettered() {
        let engine = flaky_engine(1);
        let worker = Worker::new(Arc::clone(&engine), "w");
        assert!(matches!(worker.run_once().unwrap(), Some(JobOutcome::DeadLettered { .. })));
        assert!(engine.store().pending_jobs().unwrap().is_empty());
        assert_eq!(engine.store().dead_jobs().unwrap().len(), 1);
        assert!(ids(&engine, "c1", ItemKind::Task).is_empty());
    }

    #[tokio::test]
    async fn pool_drains_and_shuts_down() {
        let engine = Arc::new(engine_with(|s| s.with_group(group("crew", &["c1", "c2", "c3"]))));
        create(&engine, task("t1", "a"));
        grant(&engine, "crew", "task-view-all", true);

        let cfg = WorkerConfig {
            threads: 2,
            poll_interval_ms: 10,
            ..Default::default()
        };
        let pool = WorkerPool::spawn(Arc::clone(&engine), &cfg, "test");
        for _ in 0..200 {
            if engine.store().pending_jobs().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;
        for u in ["c1", "c2", "c3"] {
            assert_eq!(ids(&engine, u, ItemKind::Task), vec!["t1"]);
        }
    }
}
