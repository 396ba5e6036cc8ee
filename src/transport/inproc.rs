//! In-process transport session.
//!
//! Runs tool calls through a handler closure instead of a child
//! process. This is the fault-injection seam the dispatcher tests are
//! written against, and a convenient embedding point for hosts that run
//! their tools in-process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Liveness, ToolTransport, TransportFactory};
use crate::error::TransportError;

/// Handler signature: tool name + args → result or transport error.
pub type InProcHandler = Arc<
    dyn Fn(&str, &serde_json::Value) -> Result<serde_json::Value, TransportError> + Send + Sync,
>;

/// An in-process session around a handler closure.
pub struct InProcTransport {
    handler: InProcHandler,
    latency: Option<Duration>,
    live: Liveness,
}

impl InProcTransport {
    pub fn new(handler: InProcHandler) -> Self {
        Self {
            handler,
            latency: None,
            live: Liveness::up(),
        }
    }

    /// Sleep this long inside every `invoke`, to simulate slow tools.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Simulate the backing process dying out from under the session.
    pub fn kill_switch(&self) -> Liveness {
        self.live.clone()
    }
}

#[async_trait]
impl ToolTransport for InProcTransport {
    async fn invoke(
        &mut self,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        if !self.live.is_up() {
            return Err(TransportError::Closed {
                reason: "session killed".to_string(),
            });
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.live.is_up() {
            return Err(TransportError::Closed {
                reason: "session killed mid-call".to_string(),
            });
        }
        (self.handler)(tool, args)
    }

    fn liveness(&self) -> Liveness {
        self.live.clone()
    }

    async fn close(&mut self) {
        self.live.down();
    }
}

/// Factory handing out `InProcTransport` sessions sharing one handler.
#[derive(Clone)]
pub struct InProcTransportFactory {
    handler: InProcHandler,
    latency: Option<Duration>,
}

impl InProcTransportFactory {
    pub fn new(handler: InProcHandler) -> Self {
        Self {
            handler,
            latency: None,
        }
    }

    /// Every session answers every tool with the same JSON value.
    pub fn constant(value: serde_json::Value) -> Self {
        Self::new(Arc::new(move |_, _| Ok(value.clone())))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl TransportFactory for InProcTransportFactory {
    async fn connect(&self) -> Result<Box<dyn ToolTransport>, TransportError> {
        let mut transport = InProcTransport::new(self.handler.clone());
        if let Some(latency) = self.latency {
            transport = transport.with_latency(latency);
        }
        Ok(Box::new(transport))
    }
}
