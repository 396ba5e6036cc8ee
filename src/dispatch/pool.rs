//! Elastic worker pool: partitions, placement, activation, refill.
//!
//! The pool lock guards the partition vectors and is held only for set
//! operations and the pick-and-bind step; transport connects and task
//! invocations always happen outside it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::registry::ResultRegistry;
use super::task::{Lane, Task};
use super::worker::{Worker, WorkerPhase, WorkerSnapshot};
use crate::config::DispatcherConfig;
use crate::error::TransportError;
use crate::transport::TransportFactory;

/// Why a placement could not be completed.
#[derive(Debug)]
pub enum PlaceError {
    /// Two successive attempts raced into dying workers.
    Exhausted,
    /// A fresh worker could not be connected.
    Connect(TransportError),
}

impl std::fmt::Display for PlaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaceError::Exhausted => write!(f, "two placement attempts hit dying workers"),
            PlaceError::Connect(e) => write!(f, "could not connect a fresh worker: {e}"),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    active_normal: Vec<Arc<Worker>>,
    active_priority: Vec<Arc<Worker>>,
    standby: Vec<Arc<Worker>>,
    retiring: Vec<Arc<Worker>>,
}

impl PoolInner {
    fn lane(&self, lane: Lane) -> &Vec<Arc<Worker>> {
        match lane {
            Lane::Normal => &self.active_normal,
            Lane::Priority => &self.active_priority,
        }
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut Vec<Arc<Worker>> {
        match lane {
            Lane::Normal => &mut self.active_normal,
            Lane::Priority => &mut self.active_priority,
        }
    }
}

pub struct WorkerPool {
    config: DispatcherConfig,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<ResultRegistry>,
    inner: Mutex<PoolInner>,
    refilling: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: DispatcherConfig,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<ResultRegistry>,
    ) -> Self {
        Self {
            config,
            factory,
            registry,
            inner: Mutex::new(PoolInner::default()),
            refilling: AtomicBool::new(false),
        }
    }

    pub fn lane_min(&self, lane: Lane) -> usize {
        match lane {
            Lane::Normal => self.config.min_active,
            Lane::Priority => self.config.priority_min_active,
        }
    }

    pub fn lane_max(&self, lane: Lane) -> usize {
        match lane {
            Lane::Normal => self.config.max_active,
            Lane::Priority => self.config.priority_max_active,
        }
    }

    /// Connect and activate the initial complement: per-lane minimums
    /// plus the standby reserve, all concurrently.
    pub async fn start_initial(&self) -> Result<(), TransportError> {
        let normals = (0..self.lane_min(Lane::Normal))
            .map(|_| self.spawn_worker(WorkerPhase::Active, Lane::Normal));
        let priorities = (0..self.lane_min(Lane::Priority))
            .map(|_| self.spawn_worker(WorkerPhase::Active, Lane::Priority));
        let standbys =
            (0..self.config.standby_count).map(|_| self.spawn_worker(WorkerPhase::Standby, Lane::Normal));

        let (normals, priorities, standbys) = tokio::join!(
            join_all(normals),
            join_all(priorities),
            join_all(standbys)
        );

        let mut inner = self.inner.lock().await;
        for worker in normals {
            inner.active_normal.push(worker?);
        }
        for worker in priorities {
            inner.active_priority.push(worker?);
        }
        for worker in standbys {
            inner.standby.push(worker?);
        }
        tracing::info!(
            normal = inner.active_normal.len(),
            priority = inner.active_priority.len(),
            standby = inner.standby.len(),
            "worker pool started"
        );
        Ok(())
    }

    /// Place a task: weighted least-load pick with overflow to standby,
    /// bound atomically under the pool lock. One retry when a bind races
    /// a dying worker.
    pub async fn place(self: &Arc<Self>, task: &Task) -> Result<Uuid, PlaceError> {
        for attempt in 0..2u8 {
            {
                let inner = self.inner.lock().await;
                if let Some(worker) = pick_locked(
                    &inner,
                    task.lane,
                    self.config.max_load_per_worker,
                    self.lane_max(task.lane),
                ) {
                    if worker.bind(task).is_ok() {
                        return Ok(worker.id());
                    }
                    tracing::debug!(
                        task_id = %task.id,
                        attempt,
                        "bind raced a dying worker; retrying placement"
                    );
                    continue;
                }
            }
            // No eligible active worker: pull one from standby, or
            // connect a fresh session (outside the pool lock).
            match self.activate_standby(task.lane).await {
                Ok(worker) => {
                    if worker.bind(task).is_ok() {
                        return Ok(worker.id());
                    }
                    tracing::debug!(task_id = %task.id, attempt, "activated worker died underfoot");
                }
                Err(e) => return Err(PlaceError::Connect(e)),
            }
        }
        Err(PlaceError::Exhausted)
    }

    /// Move one standby worker into the given lane, connecting a fresh
    /// one synchronously when the reserve is empty. Either way an
    /// asynchronous refill is scheduled.
    pub async fn activate_standby(self: &Arc<Self>, lane: Lane) -> Result<Arc<Worker>, TransportError> {
        let from_reserve = {
            let mut inner = self.inner.lock().await;
            match inner.standby.pop() {
                Some(worker) => {
                    worker.set_phase(WorkerPhase::Active, lane);
                    inner.lane_mut(lane).push(Arc::clone(&worker));
                    Some(worker)
                }
                None => None,
            }
        };

        let worker = match from_reserve {
            Some(worker) => {
                tracing::debug!(worker_id = %worker.id(), lane = %lane, "standby worker activated");
                worker
            }
            None => {
                let worker = self.spawn_worker(WorkerPhase::Active, lane).await?;
                self.inner.lock().await.lane_mut(lane).push(Arc::clone(&worker));
                tracing::info!(worker_id = %worker.id(), lane = %lane, "fresh worker connected under load");
                worker
            }
        };
        self.schedule_refill();
        Ok(worker)
    }

    /// Demote an idle active worker back to the reserve. Metadata flip
    /// only; the transport stays open.
    pub async fn demote_to_standby(&self, lane: Lane, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let worker = {
            let workers = inner.lane_mut(lane);
            let Some(pos) = workers.iter().position(|w| w.id() == id) else {
                return false;
            };
            // Re-check under the lock: a placement may have bound work
            // since the supervisor sampled this worker.
            let snapshot = workers[pos].snapshot();
            if snapshot.load > 0 || snapshot.in_flight > 0 {
                return false;
            }
            workers.remove(pos)
        };
        worker.set_phase(WorkerPhase::Standby, lane);
        inner.standby.push(worker);
        true
    }

    /// Pull a dead worker out of every partition and mark it retiring.
    /// The caller owns salvage and destruction.
    pub async fn remove(&self, id: Uuid) -> Option<Arc<Worker>> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        for set in [
            &mut inner.active_normal,
            &mut inner.active_priority,
            &mut inner.standby,
        ] {
            if let Some(pos) = set.iter().position(|w| w.id() == id) {
                let worker = set.remove(pos);
                worker.retire();
                inner.retiring.push(Arc::clone(&worker));
                return Some(worker);
            }
        }
        None
    }

    /// Forget a retiring worker once it has been destroyed.
    pub async fn forget_retired(&self, id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner.retiring.retain(|w| w.id() != id);
    }

    /// Top the standby reserve back up to its configured size in the
    /// background. Coalesces concurrent requests.
    pub fn schedule_refill(self: &Arc<Self>) {
        if self.refilling.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.refill_standby().await {
                tracing::warn!("standby refill failed: {}", e);
            }
            pool.refilling.store(false, Ordering::Release);
        });
    }

    /// Create workers until the reserve holds `standby_count` again.
    pub async fn refill_standby(&self) -> Result<(), TransportError> {
        let deficit = {
            let inner = self.inner.lock().await;
            self.config.standby_count.saturating_sub(inner.standby.len())
        };
        if deficit == 0 {
            return Ok(());
        }
        let spawned = join_all(
            (0..deficit).map(|_| self.spawn_worker(WorkerPhase::Standby, Lane::Normal)),
        )
        .await;
        let mut inner = self.inner.lock().await;
        for worker in spawned {
            inner.standby.push(worker?);
        }
        tracing::debug!(standby = inner.standby.len(), "standby reserve refilled");
        Ok(())
    }

    /// Snapshot of one lane's active workers, for probing outside the
    /// pool lock.
    pub async fn actives(&self, lane: Lane) -> Vec<Arc<Worker>> {
        self.inner.lock().await.lane(lane).clone()
    }

    pub async fn standbys(&self) -> Vec<Arc<Worker>> {
        self.inner.lock().await.standby.clone()
    }

    pub async fn active_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.active_normal.len() + inner.active_priority.len()
    }

    pub async fn standby_count(&self) -> usize {
        self.inner.lock().await.standby.len()
    }

    /// Per-worker snapshots of the active partitions plus the average
    /// load percentage placement operates on.
    pub async fn load_report(&self) -> (Vec<(Uuid, WorkerSnapshot)>, f64) {
        let inner = self.inner.lock().await;
        let snapshots: Vec<(Uuid, WorkerSnapshot)> = inner
            .active_normal
            .iter()
            .chain(inner.active_priority.iter())
            .map(|w| (w.id(), w.snapshot()))
            .collect();
        let avg = average_load_pct(
            snapshots.iter().map(|(_, s)| s.load),
            self.config.max_load_per_worker,
        );
        (snapshots, avg)
    }

    /// Average load over one lane only, for scale decisions.
    pub async fn lane_load_pct(&self, lane: Lane) -> f64 {
        let inner = self.inner.lock().await;
        average_load_pct(
            inner.lane(lane).iter().map(|w| w.snapshot().load),
            self.config.max_load_per_worker,
        )
    }

    /// Retire everything, drain FIFOs up to `grace`, then force-close
    /// stragglers. After this no worker holds a live transport.
    pub async fn shutdown(&self, grace: std::time::Duration) {
        let workers: Vec<Arc<Worker>> = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            inner
                .active_normal
                .drain(..)
                .chain(inner.active_priority.drain(..))
                .chain(inner.standby.drain(..))
                .chain(inner.retiring.drain(..))
                .collect()
        };
        for worker in &workers {
            worker.retire();
            worker.seal();
        }
        let drained = join_all(workers.iter().map(|w| w.join(grace))).await;
        let forced = drained.iter().filter(|ok| !**ok).count();
        tracing::info!(
            workers = workers.len(),
            forced,
            "worker pool shut down"
        );
    }

    async fn spawn_worker(
        &self,
        phase: WorkerPhase,
        lane: Lane,
    ) -> Result<Arc<Worker>, TransportError> {
        let transport = self.factory.connect().await?;
        Ok(Worker::spawn(
            transport,
            Arc::clone(&self.registry),
            phase,
            lane,
        ))
    }
}

/// Least-load scan of one lane. Ties break on fewest in-flight, then
/// oldest last-activity. Workers at or above the ceiling are skipped;
/// when the lane is already at its size limit the ceiling turns soft and
/// the least-loaded healthy worker wins anyway.
fn pick_locked(
    inner: &PoolInner,
    lane: Lane,
    max_load: u32,
    lane_max: usize,
) -> Option<Arc<Worker>> {
    let workers = inner.lane(lane);
    let candidates: Vec<(Arc<Worker>, WorkerSnapshot)> = workers
        .iter()
        .filter(|w| w.alive())
        .map(|w| (Arc::clone(w), w.snapshot()))
        .filter(|(_, s)| s.phase == WorkerPhase::Active)
        .collect();

    let below_ceiling = candidates
        .iter()
        .filter(|(_, s)| s.load < u64::from(max_load))
        .min_by(|(_, a), (_, b)| {
            (a.load, a.in_flight, a.last_activity).cmp(&(b.load, b.in_flight, b.last_activity))
        })
        .map(|(w, _)| Arc::clone(w));

    if below_ceiling.is_some() {
        return below_ceiling;
    }
    if workers.len() >= lane_max {
        // Saturated lane at its size limit: the ceiling is soft.
        return candidates
            .iter()
            .min_by(|(_, a), (_, b)| {
                (a.load, a.in_flight, a.last_activity).cmp(&(b.load, b.in_flight, b.last_activity))
            })
            .map(|(w, _)| Arc::clone(w));
    }
    None
}

fn average_load_pct(loads: impl Iterator<Item = u64>, max_load: u32) -> f64 {
    let mut total: u64 = 0;
    let mut count: u64 = 0;
    for load in loads {
        total += load;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    total as f64 / (count as f64 * f64::from(max_load)) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcTransportFactory;
    use std::time::Duration;

    // Slow sessions keep bound loads stable for the assertions below.
    fn pool(config: DispatcherConfig) -> Arc<WorkerPool> {
        let factory = Arc::new(
            InProcTransportFactory::constant(serde_json::json!("ok"))
                .with_latency(Duration::from_secs(30)),
        );
        Arc::new(WorkerPool::new(
            config,
            factory,
            Arc::new(ResultRegistry::new()),
        ))
    }

    fn config(min_active: usize) -> DispatcherConfig {
        DispatcherConfig {
            min_active,
            max_active: min_active.max(4),
            standby_count: 0,
            priority_min_active: 0,
            ..DispatcherConfig::default()
        }
    }

    async fn bind_weight(pool: &Arc<WorkerPool>, weight: u32) -> Uuid {
        let task = Task::new("stall", serde_json::json!({}), weight, Lane::Normal);
        pool.registry.insert(task.id);
        pool.place(&task).await.expect("place")
    }

    #[tokio::test]
    async fn least_load_wins() {
        let pool = pool(config(3));
        pool.start_initial().await.expect("start");

        let first = bind_weight(&pool, 30).await;
        let second = bind_weight(&pool, 45).await;
        let third = bind_weight(&pool, 25).await;
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_ne!(first, third);

        // Loads now [30, 45, 25]: a weight-5 task must land on the 25.
        let host = bind_weight(&pool, 5).await;
        assert_eq!(host, third);
        let report = pool.load_report().await.0;
        let snapshot = report.iter().find(|(id, _)| *id == host).expect("host");
        assert_eq!(snapshot.1.load, 30);
        assert_eq!(snapshot.1.in_flight, 2);
    }

    #[tokio::test]
    async fn overflow_connects_fresh_worker() {
        let mut cfg = config(1);
        cfg.max_load_per_worker = 10;
        let pool = pool(cfg);
        pool.start_initial().await.expect("start");
        assert_eq!(pool.active_count().await, 1);

        let _ = bind_weight(&pool, 10).await;
        // First worker is at its ceiling; the next placement must grow
        // the lane rather than queue behind it.
        let second_host = bind_weight(&pool, 1).await;
        assert_eq!(pool.active_count().await, 2);
        let report = pool.load_report().await.0;
        assert!(report.iter().any(|(id, s)| *id == second_host && s.load >= 1));
    }

    #[tokio::test]
    async fn soft_ceiling_at_lane_limit() {
        let cfg = DispatcherConfig {
            min_active: 1,
            max_active: 1,
            standby_count: 0,
            priority_min_active: 0,
            max_load_per_worker: 5,
            ..DispatcherConfig::default()
        };
        let pool = pool(cfg);
        pool.start_initial().await.expect("start");

        let first = bind_weight(&pool, 5).await;
        // Lane is at max_active and the only worker is at the ceiling;
        // the ceiling goes soft instead of failing the placement.
        let second = bind_weight(&pool, 1).await;
        assert_eq!(first, second);
        assert_eq!(pool.active_count().await, 1);
    }

    #[tokio::test]
    async fn demote_skips_busy_workers() {
        let pool = pool(config(2));
        pool.start_initial().await.expect("start");
        let loaded = bind_weight(&pool, 50).await;

        // A loaded worker must survive a demote attempt.
        let demoted = pool.demote_to_standby(Lane::Normal, loaded).await;
        if demoted {
            // Only possible if the task already completed and released
            // its load, in which case the demotion was legitimate.
            let report = pool.load_report().await.0;
            assert!(report.iter().all(|(id, _)| *id != loaded));
        }

        // An idle worker demotes cleanly.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = pool.load_report().await.0;
        if let Some((idle, _)) = report.iter().find(|(_, s)| s.load == 0) {
            assert!(pool.demote_to_standby(Lane::Normal, *idle).await);
            assert_eq!(pool.standby_count().await, 1);
        }
    }

    #[tokio::test]
    async fn shutdown_closes_every_worker() {
        let mut cfg = config(2);
        cfg.standby_count = 2;
        let pool = pool(cfg);
        pool.start_initial().await.expect("start");
        assert_eq!(pool.standby_count().await, 2);

        pool.shutdown(Duration::from_millis(500)).await;
        assert_eq!(pool.active_count().await, 0);
        assert_eq!(pool.standby_count().await, 0);
    }
}
