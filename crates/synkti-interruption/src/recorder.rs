//! Node events for disruption outcomes
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! dispatch that produced it.

use crate::event::{DisruptionKind, InstanceState};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use std::fmt;
use tracing::warn;

/// Reporting component on published events
pub const CONTROLLER_NAME: &str = "synkti-interruption";

/// Action recorded on every event
const ACTION: &str = "HandleInterruption";

/// Event reasons, one per disruption outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventReason {
    /// Scheduled maintenance will take the instance down
    InstanceUnhealthy,
    /// Spot capacity is being reclaimed
    InstanceSpotInterrupted,
    /// Instance is at elevated interruption risk
    InstanceRebalanceRecommendation,
    /// Instance is stopping or stopped
    InstanceStopping,
    /// Instance is shutting down or terminated
    InstanceTerminating,
}

impl EventReason {
    /// Reason for a disruption kind
    pub fn for_kind(kind: DisruptionKind) -> Self {
        match kind {
            DisruptionKind::ScheduledChange => Self::InstanceUnhealthy,
            DisruptionKind::SpotInterruption => Self::InstanceSpotInterrupted,
            DisruptionKind::RebalanceRecommendation => Self::InstanceRebalanceRecommendation,
            DisruptionKind::StateChange(state) if state.is_terminal() => Self::InstanceTerminating,
            DisruptionKind::StateChange(_) => Self::InstanceStopping,
        }
    }

    /// Reason string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceUnhealthy => "InstanceUnhealthy",
            Self::InstanceSpotInterrupted => "InstanceSpotInterrupted",
            Self::InstanceRebalanceRecommendation => "InstanceRebalanceRecommendation",
            Self::InstanceStopping => "InstanceStopping",
            Self::InstanceTerminating => "InstanceTerminating",
        }
    }

    /// Every reason except the advisory rebalance is a warning
    pub fn event_type(&self) -> EventType {
        match self {
            Self::InstanceRebalanceRecommendation => EventType::Normal,
            _ => EventType::Warning,
        }
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event attached to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptionEvent {
    /// Reason
    pub reason: EventReason,
    /// Human-readable note
    pub note: String,
}

impl InterruptionEvent {
    /// Event for a disruption kind on an instance
    pub fn for_disruption(kind: DisruptionKind, instance_id: &str) -> Self {
        let note = match kind {
            DisruptionKind::ScheduledChange => {
                format!("Instance {instance_id} has scheduled maintenance; node is being drained")
            }
            DisruptionKind::SpotInterruption => {
                format!("Spot instance {instance_id} is being reclaimed; node is being drained")
            }
            DisruptionKind::RebalanceRecommendation => {
                format!("Instance {instance_id} received a rebalance recommendation")
            }
            DisruptionKind::StateChange(state @ (InstanceState::ShuttingDown | InstanceState::Terminated)) => {
                format!("Instance {instance_id} is {state}; node is being removed")
            }
            DisruptionKind::StateChange(state) => {
                format!("Instance {instance_id} is {state}; node is being drained")
            }
        };
        Self {
            reason: EventReason::for_kind(kind),
            note,
        }
    }
}

/// Publishes node events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on `node`; never fails
    async fn publish(&self, node: &Node, event: InterruptionEvent);
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as [`CONTROLLER_NAME`]
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

fn node_reference(node: &Node) -> ObjectReference {
    node.object_ref(&())
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, node: &Node, event: InterruptionEvent) {
        let reason = event.reason;
        let ev = Event {
            type_: reason.event_type(),
            reason: reason.as_str().to_string(),
            note: Some(event.note),
            action: ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, &node_reference(node)).await {
            warn!(
                reason = %reason,
                node = ?node.metadata.name,
                error = %e,
                "Failed to publish node event"
            );
        }
    }
}
