//! Cluster node access
//!
//! The dispatcher mutates nodes only through [`NodeClient`]. Both mutations are
//! idempotent and report whether they changed anything, which is what keeps
//! duplicate deliveries free of side effects.
//!
//! ## Cordon
//!
//! `spec.unschedulable = true` plus the `synkti.io/disrupted:NoSchedule` taint.
//! The patch carries the node's `resourceVersion`, so a concurrent writer makes it
//! fail with a conflict (retried) instead of silently dropping their taints.
//!
//! ## Drain
//!
//! The node is annotated with the drain grace and disruption reason, then deleted
//! through the standard API path (background propagation, default grace). The
//! cluster's node termination path reads the annotations and evicts workloads.
//!
//! Owner references are not inspected. Background propagation leaves cleanup of
//! the node's owners and dependents to the garbage collector; the owners are only
//! logged.

use crate::error::{InterruptionError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Instance type label
pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
/// Availability zone label
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
/// Capacity type label (`spot` / `on-demand`)
pub const LABEL_CAPACITY_TYPE: &str = "synkti.io/capacity-type";

/// Taint key added when a node is cordoned for a disruption
pub const DISRUPTED_TAINT_KEY: &str = "synkti.io/disrupted";
/// Effect of the disruption taint
pub const DISRUPTED_TAINT_EFFECT: &str = "NoSchedule";

/// Annotation carrying the drain grace in seconds
pub const ANNOTATION_DRAIN_GRACE: &str = "synkti.io/drain-grace-seconds";
/// Annotation carrying the disruption that triggered the drain
pub const ANNOTATION_DISRUPTION_REASON: &str = "synkti.io/disruption-reason";

/// Field manager for node patches
pub const FIELD_MANAGER: &str = "synkti-interruption";

/// Capacity type label value for spot nodes
pub const CAPACITY_TYPE_SPOT: &str = "spot";

/// Parameters of a drain request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainRequest {
    /// Time workloads get before eviction is forced (zero: no grace)
    pub grace: Duration,
    /// Disruption label recorded on the node
    pub reason: String,
}

impl DrainRequest {
    /// Create a request
    pub fn new(grace: Duration, reason: impl Into<String>) -> Self {
        Self {
            grace,
            reason: reason.into(),
        }
    }
}

/// Operations on cluster nodes
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// All nodes in the cluster
    async fn list(&self) -> Result<Vec<Node>>;

    /// Cordon a node, returning whether it changed
    async fn cordon(&self, name: &str) -> Result<bool>;

    /// Request a drain, returning whether anything changed
    async fn request_drain(&self, name: &str, request: &DrainRequest) -> Result<bool>;
}

fn is_disruption_taint(taint: &Taint) -> bool {
    taint.key == DISRUPTED_TAINT_KEY && taint.effect == DISRUPTED_TAINT_EFFECT
}

/// Whether the node is unschedulable and carries the disruption taint
pub fn is_cordoned(node: &Node) -> bool {
    let Some(spec) = &node.spec else {
        return false;
    };
    spec.unschedulable == Some(true)
        && spec
            .taints
            .as_ref()
            .is_some_and(|taints| taints.iter().any(is_disruption_taint))
}

/// Merge patch that cordons the node, `None` if it already is
pub fn cordon_patch(node: &Node) -> Option<Value> {
    if is_cordoned(node) {
        return None;
    }

    let mut taints = node
        .spec
        .as_ref()
        .and_then(|spec| spec.taints.clone())
        .unwrap_or_default();
    if !taints.iter().any(is_disruption_taint) {
        taints.push(Taint {
            key: DISRUPTED_TAINT_KEY.to_string(),
            effect: DISRUPTED_TAINT_EFFECT.to_string(),
            ..Default::default()
        });
    }

    Some(json!({
        "metadata": { "resourceVersion": node.metadata.resource_version },
        "spec": { "unschedulable": true, "taints": taints },
    }))
}

/// Whether the node already has a deletion timestamp
pub fn is_deleting(node: &Node) -> bool {
    node.metadata.deletion_timestamp.is_some()
}

/// Drain annotations to write, `None` if the node already carries them
///
/// An existing grace that is tighter than the request is kept.
pub fn drain_annotations(node: &Node, request: &DrainRequest) -> Option<BTreeMap<String, String>> {
    let annotations = node.annotations();
    let existing_grace = annotations
        .get(ANNOTATION_DRAIN_GRACE)
        .and_then(|g| g.parse::<u64>().ok());
    let requested = request.grace.as_secs();

    let (grace, reason) = match existing_grace {
        Some(existing) if existing <= requested => (
            existing,
            annotations
                .get(ANNOTATION_DISRUPTION_REASON)
                .cloned()
                .unwrap_or_else(|| request.reason.clone()),
        ),
        _ => (requested, request.reason.clone()),
    };

    let desired = BTreeMap::from([
        (ANNOTATION_DRAIN_GRACE.to_string(), grace.to_string()),
        (ANNOTATION_DISRUPTION_REASON.to_string(), reason),
    ]);
    let unchanged = desired.iter().all(|(k, v)| annotations.get(k) == Some(v));
    if unchanged { None } else { Some(desired) }
}

/// Labels that identify the node's offering
pub fn offering_labels(node: &Node) -> (Option<&str>, Option<&str>, Option<&str>) {
    let labels = node.labels();
    (
        labels.get(LABEL_INSTANCE_TYPE).map(String::as_str),
        labels.get(LABEL_ZONE).map(String::as_str),
        labels.get(LABEL_CAPACITY_TYPE).map(String::as_str),
    )
}

/// Owners of the node as `Kind/name`
pub fn owner_summary(node: &Node) -> Vec<String> {
    node.owner_references()
        .iter()
        .map(|owner| format!("{}/{}", owner.kind, owner.name))
        .collect()
}

/// Kubernetes-backed node client
pub struct KubeNodeClient {
    api: Api<Node>,
}

impl KubeNodeClient {
    /// Create a node client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    async fn get(&self, name: &str) -> Result<Node> {
        self.api
            .get_opt(name)
            .await?
            .ok_or_else(|| InterruptionError::NodeNotFound(name.to_string()))
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn cordon(&self, name: &str) -> Result<bool> {
        let node = self.get(name).await?;
        let Some(patch) = cordon_patch(&node) else {
            debug!(node = %name, "Node already cordoned");
            return Ok(false);
        };

        self.api
            .patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await?;
        info!(node = %name, "Cordoned node");
        Ok(true)
    }

    async fn request_drain(&self, name: &str, request: &DrainRequest) -> Result<bool> {
        let node = self.get(name).await?;
        let mut changed = false;

        if let Some(annotations) = drain_annotations(&node, request) {
            let patch = json!({ "metadata": { "annotations": annotations } });
            self.api
                .patch(name, &Self::patch_params(), &Patch::Merge(&patch))
                .await?;
            changed = true;
        }

        if is_deleting(&node) {
            debug!(node = %name, "Node already terminating");
            return Ok(changed);
        }

        debug!(node = %name, owners = ?owner_summary(&node), "Deleting node");
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(
                    node = %name,
                    grace_secs = request.grace.as_secs(),
                    reason = %request.reason,
                    "Requested node drain"
                );
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(changed),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::node;

    #[test]
    fn test_cordon_patch_adds_taint_and_keeps_existing() {
        let mut n = node("n1", "aws:///us-west-2a/i-1");
        n.spec.get_or_insert_with(Default::default).taints = Some(vec![Taint {
            key: "dedicated".to_string(),
            effect: "NoExecute".to_string(),
            value: Some("gpu".to_string()),
            ..Default::default()
        }]);

        let patch = cordon_patch(&n).unwrap();
        assert_eq!(patch["spec"]["unschedulable"], true);
        let taints = patch["spec"]["taints"].as_array().unwrap();
        assert_eq!(taints.len(), 2);
        assert_eq!(taints[0]["key"], "dedicated");
        assert_eq!(taints[1]["key"], DISRUPTED_TAINT_KEY);
        assert_eq!(taints[1]["effect"], DISRUPTED_TAINT_EFFECT);
    }

    #[test]
    fn test_cordoned_node_needs_no_patch() {
        let mut n = node("n1", "aws:///us-west-2a/i-1");
        let spec = n.spec.get_or_insert_with(Default::default);
        spec.unschedulable = Some(true);
        spec.taints = Some(vec![Taint {
            key: DISRUPTED_TAINT_KEY.to_string(),
            effect: DISRUPTED_TAINT_EFFECT.to_string(),
            ..Default::default()
        }]);
        assert!(is_cordoned(&n));
        assert!(cordon_patch(&n).is_none());
    }

    #[test]
    fn test_unschedulable_without_taint_is_not_cordoned() {
        let mut n = node("n1", "aws:///us-west-2a/i-1");
        n.spec.get_or_insert_with(Default::default).unschedulable = Some(true);
        assert!(!is_cordoned(&n));
        let patch = cordon_patch(&n).unwrap();
        assert_eq!(patch["spec"]["taints"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_drain_annotations_keep_tighter_grace() {
        let mut n = node("n1", "aws:///us-west-2a/i-1");
        let first = DrainRequest::new(Duration::from_secs(115), "spot_interruption");
        let annotations = drain_annotations(&n, &first).unwrap();
        assert_eq!(annotations[ANNOTATION_DRAIN_GRACE], "115");
        n.metadata.annotations = Some(annotations);

        assert!(drain_annotations(&n, &first).is_none());

        let looser = DrainRequest::new(Duration::from_secs(600), "scheduled_change");
        assert!(drain_annotations(&n, &looser).is_none());

        let tighter = DrainRequest::new(Duration::ZERO, "state_change");
        let annotations = drain_annotations(&n, &tighter).unwrap();
        assert_eq!(annotations[ANNOTATION_DRAIN_GRACE], "0");
        assert_eq!(annotations[ANNOTATION_DISRUPTION_REASON], "state_change");
    }

    #[test]
    fn test_offering_labels() {
        let n = crate::testing::offering_node("n1", "i-1", "m5.large", "us-west-2a", Some("spot"));
        assert_eq!(
            offering_labels(&n),
            (Some("m5.large"), Some("us-west-2a"), Some("spot"))
        );
    }

    #[test]
    fn test_owner_summary() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

        let mut n = node("n1", "aws:///us-west-2a/i-1");
        assert!(owner_summary(&n).is_empty());

        n.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "karpenter.sh/v1".to_string(),
            kind: "NodeClaim".to_string(),
            name: "default-x7k2p".to_string(),
            uid: "0b9a6c1e-5f0d-4a7e-9a55-1d2c3b4a5f60".to_string(),
            ..Default::default()
        }]);
        assert_eq!(owner_summary(&n), vec!["NodeClaim/default-x7k2p".to_string()]);
    }
}
