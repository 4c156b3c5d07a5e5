//! Disruption events and raw queue messages
//!
//! A [`QueueMessage`] is what the poller pulls off the queue. The classifier turns
//! its body into zero or more [`DisruptionEvent`]s, a closed set of variants that
//! the dispatcher matches exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// EC2 instance state as reported by state-change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Instance is pending
    Pending,
    /// Instance is running
    Running,
    /// Instance is stopping
    Stopping,
    /// Instance is stopped
    Stopped,
    /// Instance is shutting down
    ShuttingDown,
    /// Instance is terminated
    Terminated,
}

impl InstanceState {
    /// Parse from the state string used in EC2 notifications
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "shutting-down" => Some(Self::ShuttingDown),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Wire name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }

    /// Whether the state means the instance is leaving (or has left)
    pub fn is_disruptive(&self) -> bool {
        matches!(
            self,
            Self::Stopping | Self::Stopped | Self::ShuttingDown | Self::Terminated
        )
    }

    /// Whether the instance is already gone or about to be, so no grace applies
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of disruption a notification announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisruptionKind {
    /// Scheduled maintenance (AWS Health scheduled change)
    ScheduledChange,
    /// Spot capacity is being reclaimed (~2 minutes warning)
    SpotInterruption,
    /// Advisory: the instance is at elevated risk of interruption
    RebalanceRecommendation,
    /// Instance moved to a new lifecycle state
    StateChange(InstanceState),
}

impl DisruptionKind {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::ScheduledChange => "scheduled_change",
            Self::SpotInterruption => "spot_interruption",
            Self::RebalanceRecommendation => "rebalance_recommendation",
            Self::StateChange(_) => "state_change",
        }
    }
}

impl fmt::Display for DisruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChange(state) => write!(f, "state_change({state})"),
            other => f.write_str(other.label()),
        }
    }
}

/// A typed disruption notification for exactly one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisruptionEvent {
    /// What is happening to the instance
    pub kind: DisruptionKind,
    /// Cloud-assigned instance ID (never empty)
    pub instance_id: String,
    /// When the provider emitted the notification
    pub event_time: DateTime<Utc>,
    /// Notification ID from the envelope, when present
    pub notification_id: Option<String>,
    /// Action announced by a spot interruption (`terminate`, `stop`, `hibernate`)
    pub instance_action: Option<String>,
}

impl DisruptionEvent {
    /// Create an event
    pub fn new(kind: DisruptionKind, instance_id: impl Into<String>, event_time: DateTime<Utc>) -> Self {
        Self {
            kind,
            instance_id: instance_id.into(),
            event_time,
            notification_id: None,
            instance_action: None,
        }
    }

    /// Attach the envelope's notification ID
    pub fn with_notification_id(mut self, id: impl Into<String>) -> Self {
        self.notification_id = Some(id.into());
        self
    }

    /// Attach the spot interruption action
    pub fn with_instance_action(mut self, action: impl Into<String>) -> Self {
        self.instance_action = Some(action.into());
        self
    }
}

/// A raw message received from the notification queue
///
/// Held only for the processing cycle that received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue-assigned message ID
    pub id: String,
    /// Handle used to delete this delivery of the message
    pub receipt_handle: String,
    /// Message body (EventBridge JSON envelope)
    pub body: String,
    /// How many times the queue has delivered this message (1 on first delivery)
    pub receive_count: u32,
}

impl QueueMessage {
    /// Create a message on its first delivery
    pub fn new(id: impl Into<String>, receipt_handle: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            receive_count: 1,
        }
    }
}
