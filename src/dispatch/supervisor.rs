//! Supervisor: periodic health, elasticity, and salvage loop.
//!
//! One tick runs, in order: health probe (with salvage of dead actives),
//! lane minimum top-up, scale-up on sustained load, scale-down of
//! prolonged idlers, standby refill. Lane sizing is independent; the
//! normal lane's decisions never touch priority workers.

use std::sync::Arc;

use tokio::sync::watch;

use super::pool::WorkerPool;
use super::registry::ResultRegistry;
use super::task::{Lane, TaskOutcome};
use super::worker::Worker;
use crate::config::DispatcherConfig;

const LANES: [Lane; 2] = [Lane::Normal, Lane::Priority];

pub struct Supervisor {
    pool: Arc<WorkerPool>,
    registry: Arc<ResultRegistry>,
    config: DispatcherConfig,
}

impl Supervisor {
    pub fn new(
        pool: Arc<WorkerPool>,
        registry: Arc<ResultRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            config,
        }
    }

    /// Tick until the shutdown flag flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.supervisor_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so a tick
        // never races the pool's initial spawn.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("supervisor stopped");
    }

    /// One full pass. Public so tests can drive it without timers.
    pub async fn tick(&self) {
        self.probe_health().await;
        self.top_up_minimums().await;
        self.scale_up().await;
        self.scale_down().await;
        self.pool.schedule_refill();
    }

    /// Probe every worker. Dead actives are salvaged; dead standbys are
    /// destroyed quietly and the reserve refilled.
    async fn probe_health(&self) {
        for lane in LANES {
            for worker in self.pool.actives(lane).await {
                if !worker.alive() {
                    self.salvage(worker).await;
                }
            }
        }
        for worker in self.pool.standbys().await {
            if !worker.alive() {
                tracing::info!(worker_id = %worker.id(), "dead standby worker destroyed");
                if let Some(worker) = self.pool.remove(worker.id()).await {
                    self.destroy(worker).await;
                }
            }
        }
    }

    /// Re-place a dead worker's in-flight tasks, then destroy it.
    ///
    /// Each task is re-placed at most once across its lifetime; a task
    /// that already survived one host death is failed terminally.
    async fn salvage(&self, worker: Arc<Worker>) {
        let Some(worker) = self.pool.remove(worker.id()).await else {
            return;
        };
        let tasks = worker.drain_in_flight();
        tracing::warn!(
            worker_id = %worker.id(),
            orphaned = tasks.len(),
            "worker transport dead; salvaging in-flight tasks"
        );

        for mut task in tasks {
            if task.salvaged {
                tracing::warn!(task_id = %task.id, "second host death; salvage failed");
                self.registry.resolve(task.id, TaskOutcome::SalvageFailed);
                continue;
            }
            task.salvaged = true;
            match self.pool.place(&task).await {
                Ok(host) => {
                    tracing::info!(task_id = %task.id, worker_id = %host, "task re-placed");
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, "re-placement failed: {}", e);
                    self.registry.resolve(task.id, TaskOutcome::SalvageFailed);
                }
            }
        }

        self.destroy(worker).await;
    }

    /// Keep each lane at its configured minimum even after deaths.
    async fn top_up_minimums(&self) {
        for lane in LANES {
            loop {
                let have = self.pool.actives(lane).await.len();
                if have >= self.pool.lane_min(lane) {
                    break;
                }
                match self.pool.activate_standby(lane).await {
                    Ok(worker) => {
                        tracing::info!(worker_id = %worker.id(), lane = %lane, "lane topped up to minimum");
                    }
                    Err(e) => {
                        tracing::warn!(lane = %lane, "lane top-up failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Activate a standby when a lane's average load crosses the
    /// threshold and the lane has headroom.
    async fn scale_up(&self) {
        for lane in LANES {
            let actives = self.pool.actives(lane).await.len();
            if actives == 0 || actives >= self.pool.lane_max(lane) {
                continue;
            }
            let load_pct = self.pool.lane_load_pct(lane).await;
            if load_pct >= f64::from(self.config.scale_up_pct) {
                match self.pool.activate_standby(lane).await {
                    Ok(worker) => {
                        tracing::info!(
                            worker_id = %worker.id(),
                            lane = %lane,
                            load_pct,
                            "scaled up under load"
                        );
                    }
                    Err(e) => tracing::warn!(lane = %lane, "scale-up failed: {}", e),
                }
            }
        }
    }

    /// Demote workers that have sat at zero load past the idle timeout,
    /// never going below the lane minimum.
    async fn scale_down(&self) {
        for lane in LANES {
            let minimum = self.pool.lane_min(lane);
            for worker in self.pool.actives(lane).await {
                if self.pool.actives(lane).await.len() <= minimum {
                    break;
                }
                let snapshot = worker.snapshot();
                if snapshot.load == 0
                    && snapshot.in_flight == 0
                    && snapshot.last_activity.elapsed() >= self.config.scale_down_idle
                    && self.pool.demote_to_standby(lane, worker.id()).await
                {
                    tracing::info!(worker_id = %worker.id(), lane = %lane, "idle worker demoted to standby");
                }
            }
        }
    }

    /// Close out a worker that has already been pulled from its
    /// partition.
    async fn destroy(&self, worker: Arc<Worker>) {
        worker.seal();
        worker.abort();
        self.pool.forget_retired(worker.id()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::task::Task;
    use crate::error::TransportError;
    use crate::transport::{
        InProcTransport, Liveness, ToolTransport, TransportFactory,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Factory that remembers each session's kill switch so tests can
    /// fault-inject specific workers.
    struct RecordingFactory {
        latency: Option<Duration>,
        switches: Mutex<Vec<Liveness>>,
    }

    impl RecordingFactory {
        fn new(latency: Option<Duration>) -> Self {
            Self {
                latency,
                switches: Mutex::new(Vec::new()),
            }
        }

        fn kill(&self, index: usize) {
            self.switches.lock().expect("switches")[index].down();
        }
    }

    #[async_trait]
    impl TransportFactory for RecordingFactory {
        async fn connect(&self) -> Result<Box<dyn ToolTransport>, TransportError> {
            let mut session = InProcTransport::new(Arc::new(|_, _| Ok(serde_json::json!("ok"))));
            if let Some(latency) = self.latency {
                session = session.with_latency(latency);
            }
            self.switches
                .lock()
                .expect("switches")
                .push(session.kill_switch());
            Ok(Box::new(session))
        }
    }

    fn harness(
        config: DispatcherConfig,
        factory: Arc<RecordingFactory>,
    ) -> (Supervisor, Arc<WorkerPool>, Arc<ResultRegistry>) {
        let registry = Arc::new(ResultRegistry::new());
        let pool = Arc::new(WorkerPool::new(
            config.clone(),
            factory,
            Arc::clone(&registry),
        ));
        let supervisor = Supervisor::new(Arc::clone(&pool), Arc::clone(&registry), config);
        (supervisor, pool, registry)
    }

    fn base_config() -> DispatcherConfig {
        DispatcherConfig {
            min_active: 2,
            max_active: 4,
            standby_count: 0,
            priority_min_active: 0,
            priority_max_active: 0,
            ..DispatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn dead_worker_tasks_move_to_survivor() {
        let factory = Arc::new(RecordingFactory::new(Some(Duration::from_millis(100))));
        let (supervisor, pool, registry) = harness(base_config(), Arc::clone(&factory));
        pool.start_initial().await.expect("start");

        // Pin the survivor with a heavy first bind, then stack two
        // tasks onto the doomed worker.
        let blocker = Task::new("blk", serde_json::json!({}), 40, Lane::Normal);
        registry.insert(blocker.id);
        let survivor = pool.place(&blocker).await.expect("place");

        let t1 = Task::new("a", serde_json::json!({}), 1, Lane::Normal);
        let t2 = Task::new("b", serde_json::json!({}), 1, Lane::Normal);
        registry.insert(t1.id);
        registry.insert(t2.id);
        let doomed = pool.place(&t1).await.expect("place");
        assert_ne!(doomed, survivor);
        assert_eq!(pool.place(&t2).await.expect("place"), doomed);

        // Kill the doomed worker's session: index 0/1 order is creation
        // order, so find it by elimination.
        let report = pool.load_report().await.0;
        let doomed_index = report.iter().position(|(id, _)| *id == doomed).expect("doomed");
        factory.kill(doomed_index);

        supervisor.tick().await;

        // Both tasks now live on the survivor; nothing salvage-failed.
        let report = pool.load_report().await.0;
        assert!(report.iter().all(|(id, _)| *id != doomed));
        for id in [t1.id, t2.id] {
            match registry.wait(id, Some(Duration::from_secs(2))).await {
                Ok(TaskOutcome::Ok(v)) => assert_eq!(v, serde_json::json!("ok")),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn second_death_is_terminal() {
        let factory = Arc::new(RecordingFactory::new(Some(Duration::from_millis(100))));
        let (supervisor, pool, registry) = harness(
            DispatcherConfig {
                min_active: 1,
                ..base_config()
            },
            Arc::clone(&factory),
        );
        pool.start_initial().await.expect("start");

        let task = Task::new("a", serde_json::json!({}), 1, Lane::Normal);
        registry.insert(task.id);
        pool.place(&task).await.expect("place");

        factory.kill(0);
        supervisor.tick().await;
        // Re-placed onto a fresh worker (session index 1); kill it too.
        factory.kill(1);
        supervisor.tick().await;

        match registry.wait(task.id, Some(Duration::from_secs(2))).await {
            Ok(TaskOutcome::SalvageFailed) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scale_up_on_sustained_load() {
        let factory = Arc::new(RecordingFactory::new(Some(Duration::from_secs(30))));
        let mut config = base_config();
        config.min_active = 2;
        config.max_active = 3;
        config.max_load_per_worker = 10;
        let (supervisor, pool, registry) = harness(config, factory);
        pool.start_initial().await.expect("start");

        // 17 weight-1 tasks over two workers: 85% average.
        for _ in 0..17 {
            let task = Task::new("x", serde_json::json!({}), 1, Lane::Normal);
            registry.insert(task.id);
            pool.place(&task).await.expect("place");
        }
        supervisor.tick().await;
        assert_eq!(pool.actives(Lane::Normal).await.len(), 3);

        // Capped at max_active even if load stays high.
        supervisor.tick().await;
        assert_eq!(pool.actives(Lane::Normal).await.len(), 3);
    }

    #[tokio::test]
    async fn scale_down_respects_minimum() {
        let factory = Arc::new(RecordingFactory::new(None));
        let mut config = base_config();
        config.min_active = 1;
        config.max_active = 4;
        config.scale_down_idle = Duration::from_millis(10);
        let (supervisor, pool, _registry) = harness(config, factory);
        pool.start_initial().await.expect("start");
        pool.activate_standby(Lane::Normal).await.expect("grow");
        pool.activate_standby(Lane::Normal).await.expect("grow");
        assert_eq!(pool.actives(Lane::Normal).await.len(), 3);

        tokio::time::sleep(Duration::from_millis(30)).await;
        supervisor.tick().await;
        assert_eq!(pool.actives(Lane::Normal).await.len(), 1);
        assert!(pool.standby_count().await >= 2);
    }

    #[tokio::test]
    async fn dead_standby_is_replaced() {
        let factory = Arc::new(RecordingFactory::new(None));
        let mut config = base_config();
        config.min_active = 1;
        config.standby_count = 1;
        let (supervisor, pool, _registry) = harness(config, factory);
        pool.start_initial().await.expect("start");
        assert_eq!(pool.standby_count().await, 1);

        // Session order: active first, then standby.
        let standbys = pool.standbys().await;
        assert_eq!(standbys.len(), 1);
        standbys[0].abort();

        supervisor.tick().await;
        // Give the background refill a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.standby_count().await, 1);
        assert!(pool.standbys().await[0].alive());
    }
}
