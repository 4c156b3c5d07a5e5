//! Action dispatch
//!
//! Decides and executes the node-side remediation for one correlated event.
//!
//! ```text
//! ScheduledChange          cordon ── drain (maintenance grace)
//! SpotInterruption         mark offering unavailable ── cordon ── drain (spot grace)
//! RebalanceRecommendation  event only
//! StateChange{stopping|stopped}              cordon ── drain (spot grace)
//! StateChange{shutting-down|terminated}      cordon ── drain (no grace)
//! ```
//!
//! Every step is idempotent. The node event is published only when a step changed
//! the node, so a redelivered notification is a silent no-op. Rebalance events
//! mutate nothing and are always published.

use crate::cache::{OfferingKey, UnavailableOfferings};
use crate::error::{InterruptionError, Result};
use crate::event::{DisruptionEvent, DisruptionKind};
use crate::metrics;
use crate::node::{CAPACITY_TYPE_SPOT, DrainRequest, NodeClient, offering_labels};
use crate::recorder::{EventPublisher, InterruptionEvent};
use crate::retry::{RetryConfig, retry_transient};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default drain grace for spot interruptions (115s to leave 5s buffer before AWS termination)
pub const DEFAULT_SPOT_DRAIN_GRACE_SECS: u64 = 115;

/// Default drain grace for scheduled maintenance
pub const DEFAULT_MAINTENANCE_DRAIN_GRACE_SECS: u64 = 600;

/// Drain grace per disruption class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainGrace {
    /// Spot reclamation and instances that are stopping
    pub spot: Duration,
    /// Scheduled maintenance
    pub maintenance: Duration,
}

impl Default for DrainGrace {
    fn default() -> Self {
        Self {
            spot: Duration::from_secs(DEFAULT_SPOT_DRAIN_GRACE_SECS),
            maintenance: Duration::from_secs(DEFAULT_MAINTENANCE_DRAIN_GRACE_SECS),
        }
    }
}

/// What to do for one disruption kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationPlan {
    /// Publish the event, touch nothing
    Advisory,
    /// Cordon, then drain with the given grace
    CordonAndDrain {
        /// Drain grace
        grace: Duration,
        /// Whether the node's offering goes into the unavailable-offerings cache
        mark_unavailable: bool,
    },
    /// Nothing to do
    None,
}

impl RemediationPlan {
    /// Plan for a disruption kind
    pub fn for_kind(kind: DisruptionKind, grace: &DrainGrace) -> Self {
        match kind {
            DisruptionKind::ScheduledChange => Self::CordonAndDrain {
                grace: grace.maintenance,
                mark_unavailable: false,
            },
            DisruptionKind::SpotInterruption => Self::CordonAndDrain {
                grace: grace.spot,
                mark_unavailable: true,
            },
            DisruptionKind::RebalanceRecommendation => Self::Advisory,
            DisruptionKind::StateChange(state) if state.is_terminal() => Self::CordonAndDrain {
                grace: Duration::ZERO,
                mark_unavailable: false,
            },
            DisruptionKind::StateChange(state) if state.is_disruptive() => Self::CordonAndDrain {
                grace: grace.spot,
                mark_unavailable: false,
            },
            DisruptionKind::StateChange(_) => Self::None,
        }
    }
}

/// Result of dispatching one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The node changed (and an event was published)
    Remediated {
        /// Cordon changed the node
        cordoned: bool,
        /// Drain request changed the node
        drained: bool,
    },
    /// Advisory event published, node untouched
    Advisory,
    /// Everything was already in place
    Unchanged,
    /// The node disappeared before it could be remediated
    NodeGone,
}

/// Executes remediation plans against nodes
pub struct Dispatcher {
    nodes: Arc<dyn NodeClient>,
    events: Arc<dyn EventPublisher>,
    cache: Arc<UnavailableOfferings>,
    grace: DrainGrace,
    retry: RetryConfig,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        nodes: Arc<dyn NodeClient>,
        events: Arc<dyn EventPublisher>,
        cache: Arc<UnavailableOfferings>,
        grace: DrainGrace,
        retry: RetryConfig,
    ) -> Self {
        Self {
            nodes,
            events,
            cache,
            grace,
            retry,
        }
    }

    /// Remediate `node` for `event`
    pub async fn dispatch(
        &self,
        event: &DisruptionEvent,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let name = node.name_any();
        let kind = event.kind;

        match RemediationPlan::for_kind(kind, &self.grace) {
            RemediationPlan::None => Ok(DispatchOutcome::Unchanged),
            RemediationPlan::Advisory => {
                info!(
                    node = %name,
                    instance_id = %event.instance_id,
                    kind = %kind,
                    "Rebalance recommended for node"
                );
                self.publish(node, event).await;
                Ok(DispatchOutcome::Advisory)
            }
            RemediationPlan::CordonAndDrain {
                grace,
                mark_unavailable,
            } => {
                if mark_unavailable {
                    self.mark_unavailable(node, event);
                }

                match self.cordon_and_drain(&name, kind, grace, cancel).await {
                    Ok((false, false)) => {
                        debug!(node = %name, kind = %kind, "Node already remediated");
                        Ok(DispatchOutcome::Unchanged)
                    }
                    Ok((cordoned, drained)) => {
                        info!(
                            node = %name,
                            instance_id = %event.instance_id,
                            kind = %kind,
                            cordoned,
                            drained,
                            grace_secs = grace.as_secs(),
                            "Remediated node"
                        );
                        self.publish(node, event).await;
                        Ok(DispatchOutcome::Remediated { cordoned, drained })
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(node = %name, "Node vanished during remediation");
                        Ok(DispatchOutcome::NodeGone)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn cordon_and_drain(
        &self,
        name: &str,
        kind: DisruptionKind,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<(bool, bool)> {
        let cordoned = retry_transient(&self.retry, "cordon_node", cancel, || self.nodes.cordon(name)).await?;
        if cordoned {
            metrics::record_action(kind.label(), "cordon");
        }

        let request = DrainRequest::new(grace, kind.label());
        let drained = retry_transient(&self.retry, "drain_node", cancel, || {
            self.nodes.request_drain(name, &request)
        })
        .await?;
        if drained {
            metrics::record_action(kind.label(), "drain");
        }

        Ok((cordoned, drained))
    }

    fn mark_unavailable(&self, node: &Node, event: &DisruptionEvent) {
        let (instance_type, zone, capacity_type) = offering_labels(node);
        let (Some(instance_type), Some(zone)) = (instance_type, zone) else {
            warn!(
                node = %node.name_any(),
                instance_id = %event.instance_id,
                "Node lacks instance-type or zone label; offering not cached"
            );
            return;
        };
        let key = OfferingKey::new(
            instance_type,
            zone,
            capacity_type.unwrap_or(CAPACITY_TYPE_SPOT),
        );
        info!(offering = %key, instance_id = %event.instance_id, "Offering marked unavailable");
        self.cache.mark(key);
        metrics::record_action(event.kind.label(), "mark_unavailable");
    }

    async fn publish(&self, node: &Node, event: &DisruptionEvent) {
        self.events
            .publish(node, InterruptionEvent::for_disruption(event.kind, &event.instance_id))
            .await;
        metrics::record_action(event.kind.label(), "event");
    }
}

/// Error raised when a dispatch is abandoned on shutdown
pub fn is_cancellation(err: &InterruptionError) -> bool {
    matches!(err, InterruptionError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::InstanceState;
    use crate::recorder::EventReason;
    use crate::testing::{FakeNodes, ManualClock, RecordingPublisher, offering_node};
    use chrono::Utc;

    struct Harness {
        nodes: Arc<FakeNodes>,
        events: Arc<RecordingPublisher>,
        cache: Arc<UnavailableOfferings>,
        dispatcher: Dispatcher,
    }

    fn harness(nodes: Vec<Node>) -> Harness {
        let nodes = Arc::new(FakeNodes::new(nodes));
        let events = Arc::new(RecordingPublisher::default());
        let cache = Arc::new(UnavailableOfferings::new(
            Duration::from_secs(1800),
            Arc::new(ManualClock::default()),
        ));
        let dispatcher = Dispatcher::new(
            nodes.clone(),
            events.clone(),
            cache.clone(),
            DrainGrace::default(),
            RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
        );
        Harness {
            nodes,
            events,
            cache,
            dispatcher,
        }
    }

    fn event(kind: DisruptionKind) -> DisruptionEvent {
        DisruptionEvent::new(kind, "i-0123", Utc::now())
    }

    fn n1() -> Node {
        offering_node("n1", "i-0123", "m5.large", "us-west-2a", Some("spot"))
    }

    #[test]
    fn test_plans() {
        let grace = DrainGrace::default();
        assert_eq!(
            RemediationPlan::for_kind(DisruptionKind::RebalanceRecommendation, &grace),
            RemediationPlan::Advisory
        );
        assert_eq!(
            RemediationPlan::for_kind(DisruptionKind::SpotInterruption, &grace),
            RemediationPlan::CordonAndDrain {
                grace: Duration::from_secs(115),
                mark_unavailable: true
            }
        );
        assert_eq!(
            RemediationPlan::for_kind(DisruptionKind::ScheduledChange, &grace),
            RemediationPlan::CordonAndDrain {
                grace: Duration::from_secs(600),
                mark_unavailable: false
            }
        );
        assert_eq!(
            RemediationPlan::for_kind(DisruptionKind::StateChange(InstanceState::Terminated), &grace),
            RemediationPlan::CordonAndDrain {
                grace: Duration::ZERO,
                mark_unavailable: false
            }
        );
        assert_eq!(
            RemediationPlan::for_kind(DisruptionKind::StateChange(InstanceState::Running), &grace),
            RemediationPlan::None
        );
    }

    #[tokio::test]
    async fn test_spot_interruption_cordons_drains_and_caches() {
        let h = harness(vec![n1()]);
        let token = CancellationToken::new();

        let outcome = h
            .dispatcher
            .dispatch(&event(DisruptionKind::SpotInterruption), &n1(), &token)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Remediated {
                cordoned: true,
                drained: true
            }
        );
        assert!(h.nodes.is_cordoned("n1"));
        assert!(h.nodes.is_deleting("n1"));
        assert_eq!(h.nodes.drain_grace("n1"), Some(115));
        assert!(h.cache.is_unavailable("m5.large", "us-west-2a", "spot"));
        assert_eq!(h.events.reasons_for("n1"), vec![EventReason::InstanceSpotInterrupted]);
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_is_a_no_op() {
        let h = harness(vec![n1()]);
        let token = CancellationToken::new();
        let spot = event(DisruptionKind::SpotInterruption);

        h.dispatcher.dispatch(&spot, &n1(), &token).await.unwrap();
        let second = h.dispatcher.dispatch(&spot, &n1(), &token).await.unwrap();

        assert_eq!(second, DispatchOutcome::Unchanged);
        assert_eq!(h.nodes.cordon_changes(), 1);
        assert_eq!(h.nodes.drain_changes(), 1);
        assert_eq!(h.events.len(), 1);
    }

    #[tokio::test]
    async fn test_rebalance_is_advisory() {
        let h = harness(vec![n1()]);
        let token = CancellationToken::new();
        let rebalance = event(DisruptionKind::RebalanceRecommendation);

        assert_eq!(
            h.dispatcher.dispatch(&rebalance, &n1(), &token).await.unwrap(),
            DispatchOutcome::Advisory
        );
        h.dispatcher.dispatch(&rebalance, &n1(), &token).await.unwrap();

        assert!(!h.nodes.is_cordoned("n1"));
        assert_eq!(h.nodes.cordon_calls(), 0);
        assert_eq!(h.events.len(), 2);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_terminated_drains_without_grace() {
        let h = harness(vec![n1()]);
        let token = CancellationToken::new();

        h.dispatcher
            .dispatch(&event(DisruptionKind::StateChange(InstanceState::Terminated)), &n1(), &token)
            .await
            .unwrap();

        assert!(h.nodes.is_cordoned("n1"));
        assert_eq!(h.nodes.drain_grace("n1"), Some(0));
        assert_eq!(h.events.reasons_for("n1"), vec![EventReason::InstanceTerminating]);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_spot_without_capacity_label_defaults_to_spot() {
        let node = offering_node("n1", "i-0123", "c5.xlarge", "us-east-1b", None);
        let h = harness(vec![node.clone()]);
        let token = CancellationToken::new();

        h.dispatcher
            .dispatch(&event(DisruptionKind::SpotInterruption), &node, &token)
            .await
            .unwrap();
        assert!(h.cache.is_unavailable("c5.xlarge", "us-east-1b", "spot"));
    }

    #[tokio::test]
    async fn test_transient_cordon_failure_is_retried() {
        let h = harness(vec![n1()]);
        let token = CancellationToken::new();
        h.nodes.fail_cordon("n1", 2, || InterruptionError::Timeout(Duration::from_secs(1)));

        let outcome = h
            .dispatcher
            .dispatch(&event(DisruptionKind::ScheduledChange), &n1(), &token)
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Remediated { .. }));
        assert_eq!(h.nodes.cordon_calls(), 3);
        assert_eq!(h.events.reasons_for("n1"), vec![EventReason::InstanceUnhealthy]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_error_without_event() {
        let h = harness(vec![n1()]);
        let token = CancellationToken::new();
        h.nodes.fail_cordon("n1", 10, || InterruptionError::Timeout(Duration::from_secs(1)));

        let result = h
            .dispatcher
            .dispatch(&event(DisruptionKind::ScheduledChange), &n1(), &token)
            .await;

        assert!(result.unwrap_err().is_transient());
        assert!(h.events.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_node_is_not_an_error() {
        let h = harness(vec![]);
        let token = CancellationToken::new();

        let outcome = h
            .dispatcher
            .dispatch(&event(DisruptionKind::SpotInterruption), &n1(), &token)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::NodeGone);
        assert!(h.events.is_empty());
    }
}
