use crate::{
    catalog::CapabilityKind,
    target::Target,
};
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::path::PathBuf;
use strum::Display;

pub const TOOL_NAME: &str = "cluster-diag";

#[derive(Debug, Clone, Copy, Display, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Failed,
    Skipped,
    /// The final attempt ran out of time. Aggregated as a failure.
    TimedOut,
}

impl CallStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

/// The result of one query against one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallOutcome {
    pub query: String,
    pub kind: CapabilityKind,
    pub critical: bool,
    pub status: CallStatus,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Relative to the run directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl CallOutcome {
    pub fn skipped(query: &str, kind: CapabilityKind, critical: bool, reason: impl Into<String>) -> Self {
        Self {
            query: query.to_string(),
            kind,
            critical,
            status: CallStatus::Skipped,
            attempts: 0,
            duration_ms: 0,
            detail: Some(reason.into()),
            output: None,
            http_status: None,
            exit_code: None,
            sha1: None,
            size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Display, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Partial,
    Failed,
}

impl NodeStatus {
    /// Failed iff a critical call failed, Partial iff only non-critical calls failed.
    pub fn from_outcomes(outcomes: &[CallOutcome]) -> Self {
        let mut status = Self::Success;
        for outcome in outcomes.iter().filter(|o| o.status.is_failure()) {
            if outcome.critical {
                return Self::Failed;
            }
            status = Self::Partial;
        }
        status
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeResult {
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub status: NodeStatus,
    /// Set when the target was never collected, e.g. the run was cancelled first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    pub outcomes: Vec<CallOutcome>,
}

impl NodeResult {
    pub fn new(target: Target, version: Option<String>, outcomes: Vec<CallOutcome>) -> Self {
        Self {
            target,
            version,
            status: NodeStatus::from_outcomes(&outcomes),
            skipped_reason: None,
            outcomes,
        }
    }

    /// Whether the target answered its bootstrap query at all, whatever the answer was.
    pub fn reached(&self) -> bool {
        self.outcomes.first().is_some_and(|bootstrap| bootstrap.http_status.is_some())
    }
}

/// Ordered so that the worst status compares greatest.
#[derive(Debug, Clone, Copy, Display, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
    /// No target could be reached, nothing was collected.
    Fatal,
}

impl From<NodeStatus> for RunStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Success => Self::Success,
            NodeStatus::Partial => Self::Partial,
            NodeStatus::Failed => Self::Failed,
        }
    }
}

impl RunStatus {
    /// Worst status across nodes. A run without nodes is Fatal.
    pub fn aggregate(nodes: &[NodeResult]) -> Self {
        nodes
            .iter()
            .map(|node| Self::from(node.status))
            .max()
            .unwrap_or(Self::Fatal)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub nodes: usize,
    pub calls: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn of(nodes: &[NodeResult]) -> Self {
        let mut summary = Self {
            nodes: nodes.len(),
            ..Self::default()
        };
        for outcome in nodes.iter().flat_map(|node| &node.outcomes) {
            summary.calls += 1;
            match outcome.status {
                CallStatus::Success => summary.succeeded += 1,
                CallStatus::Failed => summary.failed += 1,
                CallStatus::TimedOut => summary.timed_out += 1,
                CallStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

/// Everything a run produced. Written last into the run directory as `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunManifest {
    pub tool: String,
    pub tool_version: String,
    pub component: String,
    pub mode: String,
    pub seeds: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub nodes: Vec<NodeResult>,
    pub summary: RunSummary,
}

impl RunManifest {
    pub fn new(component: &str, mode: &str, seeds: Vec<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            tool: TOOL_NAME.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            component: component.to_string(),
            mode: mode.to_string(),
            seeds,
            started_at,
            finished_at: started_at,
            status: RunStatus::Fatal,
            cancelled: false,
            fatal_error: None,
            nodes: Vec::new(),
            summary: RunSummary::default(),
        }
    }

    /// Freezes the node results and derives the overall status.
    pub fn finish(mut self, nodes: Vec<NodeResult>, cancelled: bool) -> Self {
        self.finished_at = Utc::now();
        self.status = RunStatus::aggregate(&nodes);
        self.summary = RunSummary::of(&nodes);
        self.cancelled = cancelled;
        self.nodes = nodes;
        self
    }

    pub fn fatal(mut self, reason: impl Into<String>) -> Self {
        self.finished_at = Utc::now();
        self.status = RunStatus::Fatal;
        self.fatal_error = Some(reason.into());
        self.nodes = Vec::new();
        self.summary = RunSummary::default();
        self
    }
}
