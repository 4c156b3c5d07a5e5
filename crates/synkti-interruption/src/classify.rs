//! Message classification
//!
//! Decodes the EventBridge envelope delivered through the queue and routes it by
//! `source` + `detail-type` to one of the known notification kinds.
//!
//! ## Envelope
//!
//! ```json
//! {
//!   "version": "0",
//!   "id": "7bf73129-1428-4cd3-a780-95db273d1602",
//!   "detail-type": "EC2 Spot Instance Interruption Warning",
//!   "source": "aws.ec2",
//!   "time": "2024-01-17T10:28:00Z",
//!   "region": "us-east-1",
//!   "detail": { "instance-id": "i-1234567890abcdef0", "instance-action": "terminate" }
//! }
//! ```
//!
//! Classification is pure: no I/O, never panics, and anything that does not match
//! the expected shape comes back as [`Classification::Invalid`]. The caller still
//! deletes invalid messages so a poison message cannot stall the queue.
//!
//! A missing or unparsable `time` does not invalidate a message; the event is
//! stamped with the time it was received instead.

use crate::event::{DisruptionEvent, DisruptionKind, InstanceState};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// `source` of EC2 notifications
pub const SOURCE_EC2: &str = "aws.ec2";
/// `source` of AWS Health notifications
pub const SOURCE_HEALTH: &str = "aws.health";

/// `detail-type` of AWS Health events
pub const DETAIL_TYPE_HEALTH: &str = "AWS Health Event";
/// `detail-type` of spot interruption warnings
pub const DETAIL_TYPE_SPOT_INTERRUPTION: &str = "EC2 Spot Instance Interruption Warning";
/// `detail-type` of rebalance recommendations
pub const DETAIL_TYPE_REBALANCE: &str = "EC2 Instance Rebalance Recommendation";
/// `detail-type` of instance state changes
pub const DETAIL_TYPE_STATE_CHANGE: &str = "EC2 Instance State-change Notification";

/// Outcome of classifying one message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// One or more actionable events, each for exactly one instance
    Events(Vec<DisruptionEvent>),
    /// Well-formed notification this controller does not act on
    Ignored(String),
    /// Body does not match the expected envelope
    Invalid(String),
}

impl Classification {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Events(_) => "actionable",
            Self::Ignored(_) => "ignored",
            Self::Invalid(_) => "invalid",
        }
    }

    /// The events, if the message was actionable
    pub fn events(&self) -> &[DisruptionEvent] {
        match self {
            Self::Events(events) => events,
            _ => &[],
        }
    }
}

/// Notification kinds routed by `source` + `detail-type`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotificationKind {
    Health,
    SpotInterruption,
    Rebalance,
    StateChange,
}

impl NotificationKind {
    fn route(source: &str, detail_type: &str) -> Option<Self> {
        match (source, detail_type) {
            (SOURCE_HEALTH, DETAIL_TYPE_HEALTH) => Some(Self::Health),
            (SOURCE_EC2, DETAIL_TYPE_SPOT_INTERRUPTION) => Some(Self::SpotInterruption),
            (SOURCE_EC2, DETAIL_TYPE_REBALANCE) => Some(Self::Rebalance),
            (SOURCE_EC2, DETAIL_TYPE_STATE_CHANGE) => Some(Self::StateChange),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<String>,
    source: String,
    #[serde(rename = "detail-type")]
    detail_type: String,
    #[serde(default)]
    time: Option<String>,
    detail: Value,
}

#[derive(Debug, Deserialize)]
struct InstanceDetail {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "instance-action", default)]
    instance_action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateChangeDetail {
    #[serde(rename = "instance-id")]
    instance_id: String,
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthDetail {
    service: String,
    event_type_category: String,
    #[serde(default)]
    affected_entities: Vec<AffectedEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AffectedEntity {
    entity_value: String,
}

/// Classify a raw message body, stamping untimed events with the current time
pub fn classify(body: &str) -> Classification {
    classify_at(body, Utc::now())
}

/// Classify a raw message body received at `received_at`
pub fn classify_at(body: &str, received_at: DateTime<Utc>) -> Classification {
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => return Classification::Invalid(format!("malformed envelope: {e}")),
    };

    let event_time = envelope
        .time
        .as_deref()
        .and_then(|time| DateTime::parse_from_rfc3339(time).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(received_at);

    let Some(kind) = NotificationKind::route(&envelope.source, &envelope.detail_type) else {
        return Classification::Ignored(format!(
            "unsupported notification {}/{}",
            envelope.source, envelope.detail_type
        ));
    };

    let make = |kind: DisruptionKind, instance_id: String| {
        let event = DisruptionEvent::new(kind, instance_id, event_time);
        match &envelope.id {
            Some(id) => event.with_notification_id(id.clone()),
            None => event,
        }
    };

    match kind {
        NotificationKind::Health => {
            let detail: HealthDetail = match serde_json::from_value(envelope.detail.clone()) {
                Ok(d) => d,
                Err(e) => return Classification::Invalid(format!("malformed health detail: {e}")),
            };
            if detail.service != "EC2" || detail.event_type_category != "scheduledChange" {
                return Classification::Ignored(format!(
                    "health event {}/{} is not an EC2 scheduled change",
                    detail.service, detail.event_type_category
                ));
            }
            let events: Vec<_> = detail
                .affected_entities
                .into_iter()
                .map(|entity| entity.entity_value)
                .filter(|id| !id.is_empty())
                .map(|id| make(DisruptionKind::ScheduledChange, id))
                .collect();
            if events.is_empty() {
                return Classification::Invalid("scheduled change without affected instances".to_string());
            }
            Classification::Events(events)
        }
        NotificationKind::SpotInterruption | NotificationKind::Rebalance => {
            let detail: InstanceDetail = match serde_json::from_value(envelope.detail.clone()) {
                Ok(d) => d,
                Err(e) => return Classification::Invalid(format!("malformed instance detail: {e}")),
            };
            if detail.instance_id.is_empty() {
                return Classification::Invalid("empty instance-id".to_string());
            }
            if kind == NotificationKind::SpotInterruption {
                let mut event = make(DisruptionKind::SpotInterruption, detail.instance_id);
                if let Some(action) = detail.instance_action {
                    event = event.with_instance_action(action);
                }
                Classification::Events(vec![event])
            } else {
                Classification::Events(vec![make(
                    DisruptionKind::RebalanceRecommendation,
                    detail.instance_id,
                )])
            }
        }
        NotificationKind::StateChange => {
            let detail: StateChangeDetail = match serde_json::from_value(envelope.detail.clone()) {
                Ok(d) => d,
                Err(e) => return Classification::Invalid(format!("malformed state-change detail: {e}")),
            };
            if detail.instance_id.is_empty() {
                return Classification::Invalid("empty instance-id".to_string());
            }
            match InstanceState::parse(&detail.state) {
                Some(state) if state.is_disruptive() => Classification::Events(vec![make(
                    DisruptionKind::StateChange(state),
                    detail.instance_id,
                )]),
                Some(state) => Classification::Ignored(format!("instance state {state} is not disruptive")),
                None => Classification::Ignored(format!("unrecognized instance state {:?}", detail.state)),
            }
        }
    }
}
