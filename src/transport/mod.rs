//! Transport seam to external tool-execution processes.
//!
//! A session is strictly single-duplex: at most one outstanding request
//! at a time, enforced by `invoke` taking `&mut self`. The owning worker
//! serializes callers; sessions never retry and never interpret tool
//! semantics.

mod inproc;
mod stdio;

pub use inproc::{InProcHandler, InProcTransport, InProcTransportFactory};
pub use stdio::{StdioTransport, StdioTransportFactory};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::TransportError;

/// Shared liveness flag for one session.
///
/// The session downs it on IO failure, peer EOF, or process exit; the
/// supervisor reads it without touching the session itself.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn up() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn down(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One bidirectional message channel to an external tool process.
#[async_trait]
pub trait ToolTransport: Send + 'static {
    /// Send one call and block until its single response arrives or the
    /// session fails. Callers must not overlap invocations.
    async fn invoke(
        &mut self,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;

    /// Clone of the session's liveness flag, cheap to poll.
    fn liveness(&self) -> Liveness;

    /// Non-blocking liveness probe.
    fn alive(&self) -> bool {
        self.liveness().is_up()
    }

    /// Tear the session down. Idempotent.
    async fn close(&mut self);
}

/// Opens fresh sessions for the pool when it creates workers.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn ToolTransport>, TransportError>;
}
