//! Worker heartbeat ticker
//!
//! A background task refreshes the worker's liveness timestamp every
//! heartbeat period until cooperatively cancelled. A worker that stops
//! ticking (crash, SIGKILL, host death) goes stale and the scheduler
//! reclaims its task.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::SharedStore;

/// Handle to a running heartbeat ticker
pub struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Cancel the ticker and wait for it to wind down
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Start ticking heartbeats for a worker
pub fn spawn_heartbeat(store: SharedStore, worker_id: String, period: Duration) -> HeartbeatHandle {
    debug!(%worker_id, period_ms = period.as_millis() as u64, "spawn_heartbeat: called");
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = store.lock().await.heartbeat(&worker_id);
                    if let Err(e) = result {
                        warn!(%worker_id, error = %e, "Heartbeat write failed");
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        debug!(%worker_id, "Heartbeat ticker cancelled");
                        break;
                    }
                }
            }
        }
    });

    HeartbeatHandle { stop_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use swarmstore::{NewRun, SourceKind, Store};
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_heartbeat_refreshes_until_stopped() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(dir.path().join("swarm.db")).unwrap();
        let run = store
            .start_run(NewRun {
                project_name: "demo".into(),
                source_kind: SourceKind::Prompt,
                source_path: None,
                source_hash: "h".into(),
                worker_count: 1,
            })
            .unwrap();
        let worker_id = store.register_worker(&run.run_id, 1, 1, "swarm/w1", "/tmp/w1").unwrap();
        let before = store.get_worker(&worker_id).unwrap().last_heartbeat_at;

        let shared: SharedStore = Arc::new(Mutex::new(store));
        let handle = spawn_heartbeat(shared.clone(), worker_id.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.stop().await;

        let after = shared.lock().await.get_worker(&worker_id).unwrap().last_heartbeat_at;
        assert!(after > before);

        // No more ticks after stop
        let frozen = shared.lock().await.get_worker(&worker_id).unwrap().last_heartbeat_at;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let still = shared.lock().await.get_worker(&worker_id).unwrap().last_heartbeat_at;
        assert_eq!(frozen, still);
    }
}
