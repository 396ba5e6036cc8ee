//! Worker: one transport session, one serial executor, load accounting.
//!
//! A worker owns its transport exclusively. Tasks enter its private FIFO
//! at placement time and are invoked strictly in order; completions are
//! posted to the result registry. Accounting (load, in-flight set,
//! last activity) lives behind one per-worker mutex which is only ever
//! taken after the pool lock, never across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::registry::ResultRegistry;
use super::task::{Lane, Task, TaskOutcome};
use crate::error::TransportError;
use crate::transport::{Liveness, ToolTransport};

/// Partition a worker currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Standby,
    Active,
    Retiring,
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The worker is retiring or not yet activated.
    NotAccepting,
    /// The executor is gone; the task was rewound.
    Dead,
}

struct Accounting {
    phase: WorkerPhase,
    lane: Lane,
    load: u64,
    in_flight: HashMap<Uuid, Task>,
    last_activity: Instant,
    /// Cleared when the executor hits an unrecoverable transport error.
    healthy: bool,
}

/// Point-in-time view used by placement and stats.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSnapshot {
    pub phase: WorkerPhase,
    pub lane: Lane,
    pub load: u64,
    pub in_flight: usize,
    pub last_activity: Instant,
    pub healthy: bool,
}

pub struct Worker {
    id: Uuid,
    state: Arc<Mutex<Accounting>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    live: Liveness,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Wire a transport to a fresh executor and return the worker.
    pub fn spawn(
        transport: Box<dyn ToolTransport>,
        registry: Arc<ResultRegistry>,
        phase: WorkerPhase,
        lane: Lane,
    ) -> Arc<Self> {
        let id = Uuid::new_v4();
        let live = transport.liveness();
        let state = Arc::new(Mutex::new(Accounting {
            phase,
            lane,
            load: 0,
            in_flight: HashMap::new(),
            last_activity: Instant::now(),
            healthy: true,
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(executor_loop(
            id,
            transport,
            rx,
            Arc::clone(&state),
            registry,
        ));

        tracing::debug!(worker_id = %id, lane = %lane, ?phase, "worker spawned");

        Arc::new(Self {
            id,
            state,
            tx: Mutex::new(Some(tx)),
            live,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Transport liveness and no unrecoverable executor error.
    pub fn alive(&self) -> bool {
        self.live.is_up() && self.state.lock().expect("worker lock").healthy
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let acc = self.state.lock().expect("worker lock");
        WorkerSnapshot {
            phase: acc.phase,
            lane: acc.lane,
            load: acc.load,
            in_flight: acc.in_flight.len(),
            last_activity: acc.last_activity,
            healthy: acc.healthy,
        }
    }

    /// Bind a task: increment load, record it in flight, append to the
    /// FIFO. All-or-nothing; a refusal leaves no trace.
    ///
    /// Caller holds the pool lock, making the pick-and-bind atomic with
    /// respect to competing submits.
    pub fn bind(&self, task: &Task) -> Result<(), EnqueueError> {
        let mut acc = self.state.lock().expect("worker lock");
        if acc.phase != WorkerPhase::Active || !acc.healthy || !self.live.is_up() {
            return Err(EnqueueError::NotAccepting);
        }
        acc.load += u64::from(task.weight);
        acc.in_flight.insert(task.id, task.clone());
        drop(acc);

        let sent = match self.tx.lock().expect("sender lock").as_ref() {
            Some(tx) => tx.send(task.clone()).is_ok(),
            None => false,
        };
        if !sent {
            // Rewind: the executor is gone, the pick must be retried.
            let mut acc = self.state.lock().expect("worker lock");
            if acc.in_flight.remove(&task.id).is_some() {
                acc.load -= u64::from(task.weight);
            }
            return Err(EnqueueError::Dead);
        }
        Ok(())
    }

    /// Metadata flip between standby and active. No transport work.
    pub fn set_phase(&self, phase: WorkerPhase, lane: Lane) {
        let mut acc = self.state.lock().expect("worker lock");
        acc.phase = phase;
        acc.lane = lane;
        acc.last_activity = Instant::now();
    }

    /// Refuse new placements; the FIFO keeps draining if the transport
    /// still works.
    pub fn retire(&self) {
        self.state.lock().expect("worker lock").phase = WorkerPhase::Retiring;
    }

    /// Claim every not-yet-completed task for salvage and zero the
    /// accounting. The worker is left retiring; completions that race
    /// this claim are dropped by the executor.
    pub fn drain_in_flight(&self) -> Vec<Task> {
        let mut acc = self.state.lock().expect("worker lock");
        acc.phase = WorkerPhase::Retiring;
        acc.load = 0;
        acc.in_flight.drain().map(|(_, task)| task).collect()
    }

    /// Close the FIFO so the executor exits once drained.
    pub fn seal(&self) {
        self.tx.lock().expect("sender lock").take();
    }

    /// Hard-stop the executor. Used for dead transports and for
    /// stragglers at shutdown; the graceful path is `seal` + join.
    pub fn abort(&self) {
        self.live.down();
        if let Some(handle) = self.handle.lock().expect("handle lock").take() {
            handle.abort();
        }
    }

    /// Wait for the sealed executor to finish its FIFO, up to `grace`;
    /// abort past the deadline. Returns true when it drained cleanly.
    pub async fn join(&self, grace: std::time::Duration) -> bool {
        let handle = self.handle.lock().expect("handle lock").take();
        match handle {
            Some(handle) => match tokio::time::timeout(grace, handle).await {
                Ok(_) => true,
                Err(_) => {
                    self.abort();
                    false
                }
            },
            None => true,
        }
    }
}

/// The worker's serial executor: pull, invoke, post, account.
async fn executor_loop(
    worker_id: Uuid,
    mut transport: Box<dyn ToolTransport>,
    mut rx: mpsc::UnboundedReceiver<Task>,
    state: Arc<Mutex<Accounting>>,
    registry: Arc<ResultRegistry>,
) {
    while let Some(task) = rx.recv().await {
        // Salvage may have claimed the task while it sat in the FIFO.
        let claimed = state
            .lock()
            .expect("worker lock")
            .in_flight
            .contains_key(&task.id);
        if !claimed {
            tracing::trace!(worker_id = %worker_id, task_id = %task.id, "skipping salvaged task");
            continue;
        }

        let invoked = transport.invoke(&task.tool, &task.args).await;
        let (outcome, fatal) = match invoked {
            Ok(value) => (TaskOutcome::Ok(value), false),
            Err(TransportError::Tool { message }) => (TaskOutcome::ToolFailed { message }, false),
            Err(err @ TransportError::Closed { .. }) | Err(err @ TransportError::Decode { .. }) => (
                TaskOutcome::TransportFailed {
                    reason: err.to_string(),
                },
                true,
            ),
        };

        // Claim, post, then decrement, all under the worker lock so a
        // concurrent salvage sees either the task in flight or its load
        // already released, never a half-accounted state.
        {
            let mut acc = state.lock().expect("worker lock");
            if let Some(done) = acc.in_flight.remove(&task.id) {
                registry.resolve(task.id, outcome);
                acc.load -= u64::from(done.weight);
                acc.last_activity = Instant::now();
            } else {
                tracing::debug!(
                    worker_id = %worker_id,
                    task_id = %task.id,
                    "completion raced salvage; outcome dropped"
                );
            }
        }

        if fatal {
            // Park instead of failing the queued tasks: they stay in the
            // in-flight set for the supervisor to salvage.
            state.lock().expect("worker lock").healthy = false;
            tracing::warn!(worker_id = %worker_id, "transport failed; executor parked for salvage");
            break;
        }
    }

    transport.close().await;
    tracing::debug!(worker_id = %worker_id, "executor exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcTransport;
    use std::time::Duration;

    fn echo_transport() -> InProcTransport {
        InProcTransport::new(Arc::new(|tool, args| {
            Ok(serde_json::json!({ "tool": tool, "args": args }))
        }))
    }

    fn task(weight: u32) -> Task {
        Task::new("echo", serde_json::json!({}), weight, Lane::Normal)
    }

    #[tokio::test]
    async fn completes_in_fifo_order_and_releases_load() {
        let registry = Arc::new(ResultRegistry::new());
        let worker = Worker::spawn(
            Box::new(echo_transport()),
            Arc::clone(&registry),
            WorkerPhase::Active,
            Lane::Normal,
        );

        let first = task(3);
        let second = task(4);
        for t in [&first, &second] {
            assert!(registry.insert(t.id));
            worker.bind(t).expect("bind");
        }
        assert_eq!(worker.snapshot().load, 7);
        assert_eq!(worker.snapshot().in_flight, 2);

        for t in [&first, &second] {
            let outcome = registry
                .wait(t.id, Some(Duration::from_secs(1)))
                .await
                .expect("outcome");
            assert!(matches!(outcome, TaskOutcome::Ok(_)));
        }
        assert_eq!(worker.snapshot().load, 0);
        assert_eq!(worker.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn standby_and_retiring_refuse_binds() {
        let registry = Arc::new(ResultRegistry::new());
        let worker = Worker::spawn(
            Box::new(echo_transport()),
            registry,
            WorkerPhase::Standby,
            Lane::Normal,
        );
        assert_eq!(worker.bind(&task(1)), Err(EnqueueError::NotAccepting));

        worker.set_phase(WorkerPhase::Active, Lane::Normal);
        worker.retire();
        assert_eq!(worker.bind(&task(1)), Err(EnqueueError::NotAccepting));
    }

    #[tokio::test]
    async fn tool_error_is_a_completion_not_a_fault() {
        let registry = Arc::new(ResultRegistry::new());
        let transport = InProcTransport::new(Arc::new(|_, _| {
            Err(crate::error::TransportError::Tool {
                message: "no such tool".to_string(),
            })
        }));
        let worker = Worker::spawn(
            Box::new(transport),
            Arc::clone(&registry),
            WorkerPhase::Active,
            Lane::Normal,
        );

        let t = task(2);
        assert!(registry.insert(t.id));
        worker.bind(&t).expect("bind");
        let outcome = registry
            .wait(t.id, Some(Duration::from_secs(1)))
            .await
            .expect("outcome");
        assert!(matches!(outcome, TaskOutcome::ToolFailed { .. }));
        // The session is still healthy and accepts more work.
        assert!(worker.alive());
        assert_eq!(worker.snapshot().load, 0);
    }

    #[tokio::test]
    async fn transport_death_parks_executor_and_keeps_queue_salvageable() {
        let registry = Arc::new(ResultRegistry::new());
        let transport = echo_transport().with_latency(Duration::from_millis(50));
        let kill = transport.kill_switch();
        let worker = Worker::spawn(
            Box::new(transport),
            Arc::clone(&registry),
            WorkerPhase::Active,
            Lane::Normal,
        );

        let doomed = task(1);
        let queued = task(1);
        for t in [&doomed, &queued] {
            assert!(registry.insert(t.id));
            worker.bind(t).expect("bind");
        }
        kill.down();

        // The in-call task fails; the queued one is never touched.
        let outcome = registry
            .wait(doomed.id, Some(Duration::from_secs(1)))
            .await
            .expect("outcome");
        assert!(matches!(outcome, TaskOutcome::TransportFailed { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!worker.alive());
        let salvaged = worker.drain_in_flight();
        assert_eq!(salvaged.len(), 1);
        assert_eq!(salvaged[0].id, queued.id);
        assert_eq!(worker.snapshot().load, 0);
    }

    #[tokio::test]
    async fn seal_drains_then_exits() {
        let registry = Arc::new(ResultRegistry::new());
        let worker = Worker::spawn(
            Box::new(echo_transport()),
            Arc::clone(&registry),
            WorkerPhase::Active,
            Lane::Normal,
        );
        let t = task(1);
        assert!(registry.insert(t.id));
        worker.bind(&t).expect("bind");
        worker.seal();
        assert!(worker.join(Duration::from_secs(1)).await);
        assert!(registry.poll(t.id).is_ok());
    }
}
