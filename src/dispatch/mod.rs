//! Weighted-load task dispatch over an elastic worker pool.
//!
//! Producers submit weighted tool tasks through the `Dispatcher` façade;
//! placement binds each task to the least-loaded worker of its lane,
//! overflowing into the standby reserve under pressure. A supervisor
//! loop probes worker health, salvages the in-flight work of dead
//! transports, and grows or shrinks the pool around the load.

pub mod dispatcher;
pub mod pool;
pub mod registry;
pub mod supervisor;
pub mod task;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherStats, WorkerStats};
pub use task::{Lane, TaskOptions};
