//! Task and outcome types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Disjoint worker partition reserved for a priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Normal,
    Priority,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Normal => write!(f, "normal"),
            Lane::Priority => write!(f, "priority"),
        }
    }
}

/// Caller-facing submit options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Route to the priority lane.
    pub priority: bool,
    /// Use this weight instead of the weight-table lookup.
    pub weight_override: Option<u32>,
}

/// A placed unit of work. Immutable except for the salvage marker.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub tool: String,
    pub args: serde_json::Value,
    pub weight: u32,
    pub lane: Lane,
    /// Set when the task has been re-placed once after a host death;
    /// a second death is terminal.
    pub salvaged: bool,
}

impl Task {
    pub fn new(tool: impl Into<String>, args: serde_json::Value, weight: u32, lane: Lane) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            args,
            weight,
            lane,
            salvaged: false,
        }
    }
}

/// Terminal completion states a result slot can reach.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The tool returned a value.
    Ok(serde_json::Value),
    /// The tool reported a structured failure; a valid completion.
    ToolFailed { message: String },
    /// The host transport died mid-call and the call was lost.
    TransportFailed { reason: String },
    /// The replacement host died too.
    SalvageFailed,
    /// The dispatcher stopped before completion.
    Stopped,
}
