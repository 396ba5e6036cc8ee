//! mcpool: weighted-load tool-task dispatcher with an elastic pool of
//! worker sessions.
//!
//! Each worker owns a single-duplex transport to an external
//! tool-execution process and runs its tasks strictly in order; the
//! dispatcher multiplexes any number of producers onto the pool with
//! least-load placement, priority lanes, standby burst capacity, and
//! salvage of work stranded on dead transports.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcpool::{Dispatcher, DispatcherConfig, TaskOptions, WeightTable};
//! use mcpool::transport::StdioTransportFactory;
//!
//! # async fn run() -> Result<(), mcpool::Error> {
//! let config = DispatcherConfig::default();
//! let weights = WeightTable::uniform(1)?;
//! let factory = Arc::new(StdioTransportFactory::new("tool-server", vec![]));
//!
//! let dispatcher = Dispatcher::new(config, weights, factory);
//! dispatcher.start().await?;
//!
//! let id = dispatcher
//!     .submit("add", serde_json::json!({"a": 1, "b": 2}), TaskOptions::default())
//!     .await?;
//! let sum = dispatcher
//!     .get_result(id, true, Some(std::time::Duration::from_secs(5)))
//!     .await?;
//! assert_eq!(sum, serde_json::json!(3));
//!
//! dispatcher.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod transport;

pub use config::{DispatcherConfig, WeightTable};
pub use dispatch::{Dispatcher, DispatcherStats, Lane, TaskOptions, WorkerStats};
pub use error::{ConfigError, DispatchError, Error, TransportError};
