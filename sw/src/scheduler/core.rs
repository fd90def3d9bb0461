//! The scheduler control loop
//!
//! One loop per run. Each tick: decide completion, hand runnable tasks to
//! idle workers (in worker_num order, via the store's atomic claim), and
//! reclaim tasks from workers whose heartbeat lapsed. The loop never
//! assigns directly; every mutation is a store transaction, so crash
//! recovery is just reading the store again.

use std::time::Duration;

use eyre::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use swarmstore::{RunStats, RunStatus, StoreError, WorkerStatus};

use crate::SharedStore;

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick interval
    pub poll_interval: Duration,

    /// Heartbeat age after which a worker counts as stale
    pub stale_threshold: Duration,
}

/// Why the scheduler returned
#[derive(Debug, Clone)]
pub enum SchedulerOutcome {
    /// Every task reached a terminal status
    Completed(RunStats),

    /// The run was stopped externally; in-flight work was re-enqueued
    Stopped(RunStats),
}

impl SchedulerOutcome {
    pub fn stats(&self) -> &RunStats {
        match self {
            Self::Completed(stats) | Self::Stopped(stats) => stats,
        }
    }
}

/// Run the scheduler until the run completes or is stopped
pub async fn run_scheduler(
    store: SharedStore,
    run_id: &str,
    config: SchedulerConfig,
    mut stop: watch::Receiver<bool>,
) -> Result<SchedulerOutcome> {
    info!(%run_id, "Scheduler starting");

    loop {
        let tick = {
            let mut locked = store.lock().await;
            tick(&mut locked, run_id, &config)
        };

        match tick {
            Ok(Some(outcome)) => {
                info!(%run_id, ?outcome, "Scheduler finished");
                return Ok(outcome);
            }
            Ok(None) => {}
            // Contention is backpressure: skip the tick and retry
            Err(e) if e.is_contention() => {
                debug!(%run_id, "Store contention, retrying next tick");
            }
            Err(e) => return Err(e.into()),
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = crate::stop_signalled(&mut stop) => {
                info!(%run_id, "Stop signal received, stopping run");
                store.lock().await.set_run_status(run_id, RunStatus::Stopped)?;
            }
        }
    }
}

/// One scheduler tick. Returns Some(outcome) when the loop should end.
fn tick(
    store: &mut swarmstore::Store,
    run_id: &str,
    config: &SchedulerConfig,
) -> Result<Option<SchedulerOutcome>, StoreError> {
    let run = store.get_run(run_id)?;
    let stats = store.aggregate_stats(run_id)?;

    if run.status == RunStatus::Stopped {
        return Ok(Some(SchedulerOutcome::Stopped(stats)));
    }

    if stats.all_terminal() {
        return Ok(Some(SchedulerOutcome::Completed(stats)));
    }

    // Hand runnable tasks to idle workers, lowest worker_num first
    if stats.pending > 0 {
        for worker in store.list_workers(run_id)? {
            if worker.status != WorkerStatus::Idle {
                continue;
            }
            match store.claim_next_task(run_id, &worker.worker_id, &[]) {
                Ok(Some(claimed)) => {
                    debug!(
                        worker_num = worker.worker_num,
                        task_id = claimed.task_id,
                        priority = claimed.priority,
                        "Assigned task to worker"
                    );
                }
                // Nothing runnable for any worker right now
                Ok(None) => break,
                Err(e) if e.is_contention() => break,
                Err(e) => return Err(e),
            }
        }
    }

    // Reclaim tasks from workers that stopped heartbeating
    for stale in store.find_stale_workers(run_id, config.stale_threshold)? {
        warn!(
            worker_num = stale.worker_num,
            worker_id = %stale.worker_id,
            task = ?stale.current_task_id,
            "Worker went stale, reassigning its task"
        );
        store.reassign_worker_task(&stale.worker_id)?;
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use swarmstore::{NewRun, SourceKind, Store, TaskStatus};
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            stale_threshold: Duration::from_secs(60),
        }
    }

    fn setup(dir: &TempDir) -> (SharedStore, String) {
        let mut store = Store::open(dir.path().join("swarm.db")).unwrap();
        let run = store
            .start_run(NewRun {
                project_name: "demo".into(),
                source_kind: SourceKind::Prompt,
                source_path: None,
                source_hash: "h".into(),
                worker_count: 2,
            })
            .unwrap();
        (Arc::new(Mutex::new(store)), run.run_id)
    }

    #[tokio::test]
    async fn test_zero_tasks_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let (store, run_id) = setup(&dir);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let outcome = run_scheduler(store, &run_id, test_config(), stop_rx).await.unwrap();
        assert!(matches!(outcome, SchedulerOutcome::Completed(stats) if stats.total == 0));
    }

    #[tokio::test]
    async fn test_assigns_to_idle_workers_in_num_order() {
        let dir = TempDir::new().unwrap();
        let (store, run_id) = setup(&dir);

        let (w1, w2, t1) = {
            let mut locked = store.lock().await;
            let w1 = locked.register_worker(&run_id, 1, 1, "swarm/w1", "/tmp/w1").unwrap();
            let w2 = locked.register_worker(&run_id, 2, 1, "swarm/w2", "/tmp/w2").unwrap();
            locked.set_worker_status(&w1, WorkerStatus::Idle, None).unwrap();
            locked.set_worker_status(&w2, WorkerStatus::Idle, None).unwrap();
            let t1 = locked.add_task(&run_id, "the only task", 1, &[], None).unwrap();
            (w1, w2, t1)
        };

        let scheduler = tokio::spawn({
            let store = store.clone();
            let run_id = run_id.clone();
            let (_tx, rx) = watch::channel(false);
            async move { run_scheduler(store, &run_id, test_config(), rx).await }
        });

        // Wait for the assignment, then finish the task so the loop exits
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let locked = store.lock().await;
                let task = locked.get_task(t1).unwrap();
                if task.status == TaskStatus::InProgress {
                    // Lowest worker_num claims first
                    assert_eq!(task.assigned_worker.as_deref(), Some(w1.as_str()));
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "assignment never happened");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        store.lock().await.complete_task(t1, &[]).unwrap();

        let outcome = scheduler.await.unwrap().unwrap();
        assert!(matches!(outcome, SchedulerOutcome::Completed(stats) if stats.completed == 1));
        // Second worker never got anything
        let locked = store.lock().await;
        assert_eq!(locked.get_worker(&w2).unwrap().status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_stale_worker_reassigned_within_poll_interval() {
        let dir = TempDir::new().unwrap();
        let (store, run_id) = setup(&dir);

        let t1 = {
            let mut locked = store.lock().await;
            let w1 = locked.register_worker(&run_id, 1, 1, "swarm/w1", "/tmp/w1").unwrap();
            locked.set_worker_status(&w1, WorkerStatus::Idle, None).unwrap();
            let t1 = locked
                .add_task(&run_id, "interrupted work", 1, &["a/*".to_string()], None)
                .unwrap();
            locked.claim_next_task(&run_id, &w1, &[]).unwrap().unwrap();
            t1
        };

        let config = SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            stale_threshold: Duration::from_millis(1),
        };
        let scheduler = tokio::spawn({
            let store = store.clone();
            let run_id = run_id.clone();
            let (_tx, rx) = watch::channel(false);
            async move { run_scheduler(store, &run_id, config, rx).await }
        });

        // The silent worker loses its task within a poll interval or two
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let locked = store.lock().await;
                let task = locked.get_task(t1).unwrap();
                if task.status == TaskStatus::Pending && task.attempt_count == 1 {
                    assert!(locked.list_locks(&run_id).unwrap().is_empty());
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "reassignment never happened");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Let a replacement worker finish the run
        {
            let mut locked = store.lock().await;
            let w2 = locked.register_worker(&run_id, 2, 1, "swarm/w2", "/tmp/w2").unwrap();
            locked.set_worker_status(&w2, WorkerStatus::Idle, None).unwrap();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let locked = store.lock().await;
                if locked.get_task(t1).unwrap().status == TaskStatus::InProgress {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "reclaim never happened");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        store.lock().await.complete_task(t1, &[]).unwrap();

        let outcome = scheduler.await.unwrap().unwrap();
        assert!(matches!(outcome, SchedulerOutcome::Completed(stats) if stats.completed == 1));
    }

    #[tokio::test]
    async fn test_stop_signal_stops_the_run() {
        let dir = TempDir::new().unwrap();
        let (store, run_id) = setup(&dir);
        {
            let mut locked = store.lock().await;
            locked.add_task(&run_id, "never started", 1, &[], None).unwrap();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = tokio::spawn({
            let store = store.clone();
            let run_id = run_id.clone();
            async move { run_scheduler(store, &run_id, test_config(), stop_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SchedulerOutcome::Stopped(_)));
        assert_eq!(
            store.lock().await.get_run(&run_id).unwrap().status,
            RunStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_external_stop_via_store_status() {
        let dir = TempDir::new().unwrap();
        let (store, run_id) = setup(&dir);
        {
            let mut locked = store.lock().await;
            locked.add_task(&run_id, "never started", 1, &[], None).unwrap();
        }

        let scheduler = tokio::spawn({
            let store = store.clone();
            let run_id = run_id.clone();
            let (_tx, rx) = watch::channel(false);
            async move { run_scheduler(store, &run_id, test_config(), rx).await }
        });

        // Another process (swarm stop) flips the run status in the store
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.lock().await.set_run_status(&run_id, RunStatus::Stopped).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), scheduler)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SchedulerOutcome::Stopped(_)));
    }
}
