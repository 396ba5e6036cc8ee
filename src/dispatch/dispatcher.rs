//! Dispatcher façade: lifecycle, submission, result retrieval, stats.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::pool::{PlaceError, WorkerPool};
use super::registry::ResultRegistry;
use super::supervisor::Supervisor;
use super::task::{Lane, Task, TaskOptions, TaskOutcome};
use crate::config::{DispatcherConfig, WeightTable};
use crate::error::DispatchError;
use crate::transport::TransportFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Point-in-time view of one active worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: Uuid,
    pub lane: Lane,
    pub load: u64,
    pub in_flight: usize,
    pub idle_seconds: f64,
}

/// Aggregate dispatcher statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub active_count: usize,
    pub standby_count: usize,
    pub avg_load_pct: f64,
    pub per_worker: Vec<WorkerStats>,
    /// Tasks admitted and not yet consumed by a reader.
    pub queue_depth: usize,
    pub generated_at: DateTime<Utc>,
}

struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The public face of the dispatch subsystem.
///
/// An explicit value owned by the caller; everything it reaches — pool,
/// workers, transports — is torn down by `stop`.
pub struct Dispatcher {
    config: DispatcherConfig,
    weights: WeightTable,
    registry: Arc<ResultRegistry>,
    pool: Arc<WorkerPool>,
    lifecycle: Mutex<Lifecycle>,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        weights: WeightTable,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let registry = Arc::new(ResultRegistry::new());
        let pool = Arc::new(WorkerPool::new(
            config.clone(),
            factory,
            Arc::clone(&registry),
        ));
        Self {
            config,
            weights,
            registry,
            pool,
            lifecycle: Mutex::new(Lifecycle::Idle),
            supervisor: Mutex::new(None),
        }
    }

    /// Bring up the initial worker complement and the supervisor.
    ///
    /// Idempotent while running; fails once stopped.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Stopped => return Err(DispatchError::Stopped),
            Lifecycle::Idle => {}
        }

        self.pool
            .start_initial()
            .await
            .map_err(|e| DispatchError::PlacementFailed {
                reason: format!("initial worker complement failed: {e}"),
            })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = Supervisor::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.registry),
            self.config.clone(),
        );
        let handle = tokio::spawn(supervisor.run(shutdown_rx));
        *self.supervisor.lock().await = Some(SupervisorHandle { shutdown, handle });

        *lifecycle = Lifecycle::Running;
        tracing::info!("dispatcher started");
        Ok(())
    }

    /// Drain, close, and invalidate further calls. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            return;
        }
        let was_running = *lifecycle == Lifecycle::Running;
        *lifecycle = Lifecycle::Stopped;
        drop(lifecycle);

        if !was_running {
            return;
        }

        if let Some(SupervisorHandle { shutdown, handle }) = self.supervisor.lock().await.take() {
            let _ = shutdown.send(true);
            let _ = handle.await;
        }

        // Give in-flight work the grace window, then force-close and
        // fail whatever never completed.
        self.pool.shutdown(self.config.shutdown_grace).await;
        self.registry.fail_all(|| TaskOutcome::Stopped);
        tracing::info!("dispatcher stopped");
    }

    /// Admit a task: weigh it, pick its lane, bind it to a worker, and
    /// return the id its result will be keyed by.
    ///
    /// Never blocks on tool execution; may briefly block connecting a
    /// fresh worker when the standby reserve is empty.
    pub async fn submit(
        &self,
        tool: &str,
        args: serde_json::Value,
        options: TaskOptions,
    ) -> Result<Uuid, DispatchError> {
        self.ensure_running().await?;

        let weight = match options.weight_override {
            Some(0) => {
                return Err(DispatchError::PlacementFailed {
                    reason: "weight_override must be positive".to_string(),
                });
            }
            Some(weight) => weight,
            None => self.weights.weight_for(tool),
        };
        let lane = if options.priority {
            Lane::Priority
        } else {
            Lane::Normal
        };
        let task = Task::new(tool, args, weight, lane);

        if !self.registry.insert(task.id) {
            return Err(DispatchError::PlacementFailed {
                reason: "admission saturated: too many unconsumed results".to_string(),
            });
        }

        match self.pool.place(&task).await {
            Ok(worker_id) => {
                tracing::debug!(
                    task_id = %task.id,
                    worker_id = %worker_id,
                    tool,
                    weight,
                    lane = %lane,
                    "task placed"
                );
                Ok(task.id)
            }
            Err(e) => {
                self.registry.discard(task.id);
                Err(match e {
                    PlaceError::Exhausted => DispatchError::PlacementFailed {
                        reason: "placement raced retiring workers twice".to_string(),
                    },
                    PlaceError::Connect(err) => DispatchError::PlacementFailed {
                        reason: format!("no worker available: {err}"),
                    },
                })
            }
        }
    }

    /// Retrieve a task's outcome.
    ///
    /// Non-blocking reads surface `Pending` as a distinguished error; a
    /// blocking read waits until the slot turns terminal or `timeout`
    /// expires. Expiry leaves the slot in place, so a later call can
    /// still collect the result. A terminal observation removes the
    /// slot: at most one caller ever sees it.
    pub async fn get_result(
        &self,
        id: Uuid,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, DispatchError> {
        self.ensure_running().await?;

        let outcome = if block {
            self.registry.wait(id, timeout).await?
        } else {
            self.registry.poll(id)?
        };

        match outcome {
            TaskOutcome::Ok(value) => Ok(value),
            TaskOutcome::ToolFailed { message } => Err(DispatchError::ToolFailed { message }),
            TaskOutcome::TransportFailed { reason } => {
                Err(DispatchError::TransportFailed { reason })
            }
            TaskOutcome::SalvageFailed => Err(DispatchError::SalvageFailed { id }),
            TaskOutcome::Stopped => Err(DispatchError::Stopped),
        }
    }

    /// Drop the slot of a task whose result no longer matters.
    pub async fn discard(&self, id: Uuid) -> Result<(), DispatchError> {
        self.ensure_running().await?;
        if self.registry.discard(id) {
            Ok(())
        } else {
            Err(DispatchError::UnknownTask { id })
        }
    }

    /// Current pool and queue shape.
    pub async fn stats(&self) -> DispatcherStats {
        let (snapshots, avg_load_pct) = self.pool.load_report().await;
        let per_worker = snapshots
            .into_iter()
            .map(|(id, s)| WorkerStats {
                id,
                lane: s.lane,
                load: s.load,
                in_flight: s.in_flight,
                idle_seconds: s.last_activity.elapsed().as_secs_f64(),
            })
            .collect::<Vec<_>>();
        DispatcherStats {
            active_count: per_worker.len(),
            standby_count: self.pool.standby_count().await,
            avg_load_pct,
            per_worker,
            queue_depth: self.registry.depth(),
            generated_at: Utc::now(),
        }
    }

    async fn ensure_running(&self) -> Result<(), DispatchError> {
        match *self.lifecycle.lock().await {
            Lifecycle::Running => Ok(()),
            Lifecycle::Idle | Lifecycle::Stopped => Err(DispatchError::Stopped),
        }
    }
}
