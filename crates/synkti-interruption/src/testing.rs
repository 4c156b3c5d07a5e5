//! In-memory collaborators for tests

use crate::clock::Clock;
use crate::error::{InterruptionError, Result};
use crate::event::QueueMessage;
use crate::node::{
    self, ANNOTATION_DRAIN_GRACE, DISRUPTED_TAINT_EFFECT, DISRUPTED_TAINT_KEY, DrainRequest,
    LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_ZONE, NodeClient,
};
use crate::queue::{QueueAttributes, QueueClient, QueueInfo};
use crate::recorder::{EventPublisher, EventReason, InterruptionEvent};
use crate::rules::{EventRule, EventRuleClient};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 1, 17, 10, 0, 0).unwrap()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += chrono::Duration::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Notification bodies as EventBridge delivers them
pub mod messages {
    use serde_json::json;

    const TIME: &str = "2024-01-17T10:28:00Z";

    pub fn spot_interruption(instance_id: &str) -> String {
        json!({
            "version": "0",
            "id": format!("spot-{instance_id}"),
            "detail-type": "EC2 Spot Instance Interruption Warning",
            "source": "aws.ec2",
            "account": "123456789012",
            "time": TIME,
            "region": "us-west-2",
            "resources": [format!("arn:aws:ec2:us-west-2a:instance/{instance_id}")],
            "detail": { "instance-id": instance_id, "instance-action": "terminate" }
        })
        .to_string()
    }

    pub fn rebalance_recommendation(instance_id: &str) -> String {
        json!({
            "version": "0",
            "id": format!("rebalance-{instance_id}"),
            "detail-type": "EC2 Instance Rebalance Recommendation",
            "source": "aws.ec2",
            "account": "123456789012",
            "time": TIME,
            "region": "us-west-2",
            "detail": { "instance-id": instance_id }
        })
        .to_string()
    }

    pub fn state_change(instance_id: &str, state: &str) -> String {
        json!({
            "version": "0",
            "id": format!("state-{instance_id}-{state}"),
            "detail-type": "EC2 Instance State-change Notification",
            "source": "aws.ec2",
            "account": "123456789012",
            "time": TIME,
            "region": "us-west-2",
            "detail": { "instance-id": instance_id, "state": state }
        })
        .to_string()
    }

    pub fn scheduled_change(instance_id: &str) -> String {
        scheduled_change_for(&[instance_id])
    }

    pub fn scheduled_change_for(instance_ids: &[&str]) -> String {
        let entities: Vec<_> = instance_ids
            .iter()
            .map(|id| json!({ "entityValue": id }))
            .collect();
        json!({
            "version": "0",
            "id": format!("health-{}", instance_ids.join("-")),
            "detail-type": "AWS Health Event",
            "source": "aws.health",
            "account": "123456789012",
            "time": TIME,
            "region": "us-west-2",
            "detail": {
                "eventArn": "arn:aws:health:us-west-2::event/EC2/EC2_INSTANCE_RETIREMENT_SCHEDULED/1",
                "service": "EC2",
                "eventTypeCode": "AWS_EC2_INSTANCE_RETIREMENT_SCHEDULED",
                "eventTypeCategory": "scheduledChange",
                "affectedEntities": entities
            }
        })
        .to_string()
    }
}

/// Node with a provider ID and nothing else
pub fn node(name: &str, provider_id: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            provider_id: Some(provider_id.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Node for an EC2 instance carrying the offering labels
pub fn offering_node(
    name: &str,
    instance_id: &str,
    instance_type: &str,
    zone: &str,
    capacity_type: Option<&str>,
) -> Node {
    let mut n = node(name, &format!("aws:///{zone}/{instance_id}"));
    let mut labels = BTreeMap::from([
        (LABEL_INSTANCE_TYPE.to_string(), instance_type.to_string()),
        (LABEL_ZONE.to_string(), zone.to_string()),
    ]);
    if let Some(capacity_type) = capacity_type {
        labels.insert(LABEL_CAPACITY_TYPE.to_string(), capacity_type.to_string());
    }
    n.metadata.labels = Some(labels);
    n
}

// ============================================================================
// Queue
// ============================================================================

struct StoredMessage {
    message: QueueMessage,
    visible: bool,
}

#[derive(Default)]
struct QueueState {
    exists: bool,
    attributes: QueueAttributes,
    messages: Vec<StoredMessage>,
    next_id: u64,
    create_calls: usize,
    receive_calls: usize,
    deleted: usize,
    receive_failures: HashMap<usize, InterruptionError>,
}

/// In-memory queue with SQS-like visibility
///
/// Received messages stay invisible until deleted or [`FakeQueue::redeliver`].
pub struct FakeQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl FakeQueue {
    /// Queue that does not exist yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Queue that already exists
    pub fn existing(name: impl Into<String>) -> Self {
        let queue = Self::new(name);
        queue.state.lock().exists = true;
        queue
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            url: format!("https://sqs.us-west-2.amazonaws.com/123456789012/{}", self.name),
            arn: format!("arn:aws:sqs:us-west-2:123456789012:{}", self.name),
        }
    }

    /// Enqueue a body, returning the message ID
    pub fn push(&self, body: impl Into<String>) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("msg-{}", state.next_id);
        state.messages.push(StoredMessage {
            message: QueueMessage {
                id: id.clone(),
                receipt_handle: String::new(),
                body: body.into(),
                receive_count: 0,
            },
            visible: true,
        });
        id
    }

    /// Messages still in the queue (visible or in flight)
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make in-flight messages visible again
    pub fn redeliver(&self) {
        for stored in self.state.lock().messages.iter_mut() {
            stored.visible = true;
        }
    }

    pub fn deleted_count(&self) -> usize {
        self.state.lock().deleted
    }

    pub fn receive_calls(&self) -> usize {
        self.state.lock().receive_calls
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    pub fn exists(&self) -> bool {
        self.state.lock().exists
    }

    /// Drop the queue behind the controller's back
    pub fn remove(&self) {
        let mut state = self.state.lock();
        state.exists = false;
        state.attributes.clear();
        state.messages.clear();
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.state.lock().attributes.get(key).cloned()
    }

    pub fn set_attribute(&self, key: &str, value: &str) {
        self.state
            .lock()
            .attributes
            .insert(key.to_string(), value.to_string());
    }

    pub fn attributes_snapshot(&self) -> QueueAttributes {
        self.state.lock().attributes.clone()
    }

    /// Fail the receive with the given 1-based call number
    pub fn fail_receive(&self, call: usize, err: InterruptionError) {
        self.state.lock().receive_failures.insert(call, err);
    }
}

#[async_trait]
impl QueueClient for FakeQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn queue_info(&self) -> Result<Option<QueueInfo>> {
        Ok(self.exists().then(|| self.info()))
    }

    async fn ensure_queue(
        &self,
        attributes: &QueueAttributes,
        _tags: &BTreeMap<String, String>,
    ) -> Result<QueueInfo> {
        let mut state = self.state.lock();
        if !state.exists {
            state.exists = true;
            state.create_calls += 1;
            state.attributes = attributes.clone();
        }
        Ok(self.info())
    }

    async fn attributes(&self) -> Result<QueueAttributes> {
        let state = self.state.lock();
        if !state.exists {
            return Err(InterruptionError::QueueMissing(self.name.clone()));
        }
        Ok(state.attributes.clone())
    }

    async fn set_attributes(&self, attributes: &QueueAttributes) -> Result<()> {
        let mut state = self.state.lock();
        if !state.exists {
            return Err(InterruptionError::QueueMissing(self.name.clone()));
        }
        state.attributes.extend(attributes.clone());
        Ok(())
    }

    async fn delete_queue(&self) -> Result<()> {
        self.remove();
        Ok(())
    }

    async fn receive(&self, max_messages: i32, _wait: Duration) -> Result<Vec<QueueMessage>> {
        let mut state = self.state.lock();
        state.receive_calls += 1;
        let call = state.receive_calls;
        if let Some(err) = state.receive_failures.remove(&call) {
            return Err(err);
        }
        if !state.exists {
            return Err(InterruptionError::QueueMissing(self.name.clone()));
        }

        let mut received = Vec::new();
        for stored in state.messages.iter_mut().filter(|m| m.visible) {
            if received.len() >= max_messages.max(0) as usize {
                break;
            }
            stored.visible = false;
            stored.message.receive_count += 1;
            stored.message.receipt_handle =
                format!("{}#{}", stored.message.id, stored.message.receive_count);
            received.push(stored.message.clone());
        }
        Ok(received)
    }

    async fn delete_message(&self, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.exists {
            return Err(InterruptionError::QueueMissing(self.name.clone()));
        }
        let before = state.messages.len();
        state
            .messages
            .retain(|m| m.message.receipt_handle != receipt_handle);
        if state.messages.len() < before {
            state.deleted += 1;
        }
        Ok(())
    }
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Default)]
struct RulesState {
    rules: BTreeMap<String, (EventRule, BTreeMap<String, String>)>,
    put_rule_failures: VecDeque<InterruptionError>,
}

/// In-memory event bus rules
#[derive(Default)]
pub struct FakeRules {
    state: Mutex<RulesState>,
}

impl FakeRules {
    pub fn rule_names(&self) -> Vec<String> {
        self.state.lock().rules.keys().cloned().collect()
    }

    pub fn target(&self, rule: &str, target_id: &str) -> Option<String> {
        self.state
            .lock()
            .rules
            .get(rule)
            .and_then(|(_, targets)| targets.get(target_id).cloned())
    }

    pub fn target_count(&self) -> usize {
        self.state
            .lock()
            .rules
            .values()
            .map(|(_, targets)| targets.len())
            .sum()
    }

    pub fn fail_next_put_rule(&self, err: InterruptionError) {
        self.state.lock().put_rule_failures.push_back(err);
    }
}

#[async_trait]
impl EventRuleClient for FakeRules {
    async fn put_rule(&self, rule: &EventRule) -> Result<String> {
        let mut state = self.state.lock();
        if let Some(err) = state.put_rule_failures.pop_front() {
            return Err(err);
        }
        let targets = state
            .rules
            .remove(&rule.name)
            .map(|(_, targets)| targets)
            .unwrap_or_default();
        state.rules.insert(rule.name.clone(), (rule.clone(), targets));
        Ok(format!("arn:aws:events:us-west-2:123456789012:rule/{}", rule.name))
    }

    async fn put_target(&self, rule_name: &str, target_id: &str, target_arn: &str) -> Result<()> {
        let mut state = self.state.lock();
        let (_, targets) = state
            .rules
            .get_mut(rule_name)
            .ok_or_else(|| InterruptionError::infrastructure(format!("rule {rule_name} missing")))?;
        targets.insert(target_id.to_string(), target_arn.to_string());
        Ok(())
    }

    async fn delete_rule(&self, rule_name: &str, _target_ids: &[&str]) -> Result<()> {
        self.state.lock().rules.remove(rule_name);
        Ok(())
    }
}

// ============================================================================
// Nodes
// ============================================================================

type ErrorFactory = Box<dyn Fn() -> InterruptionError + Send>;

#[derive(Default)]
struct NodesState {
    nodes: BTreeMap<String, Node>,
    deleting: HashSet<String>,
    cordon_calls: usize,
    cordon_changes: usize,
    drain_changes: usize,
    cordon_failures: HashMap<String, (usize, ErrorFactory)>,
    list_failures: VecDeque<InterruptionError>,
}

/// In-memory node store applying the same cordon/drain rules as the real client
#[derive(Default)]
pub struct FakeNodes {
    state: Mutex<NodesState>,
}

impl FakeNodes {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock();
            for n in nodes {
                state.nodes.insert(n.name_any(), n);
            }
        }
        fake
    }

    pub fn is_cordoned(&self, name: &str) -> bool {
        self.state.lock().nodes.get(name).is_some_and(node::is_cordoned)
    }

    pub fn is_deleting(&self, name: &str) -> bool {
        self.state.lock().deleting.contains(name)
    }

    pub fn drain_grace(&self, name: &str) -> Option<u64> {
        self.state
            .lock()
            .nodes
            .get(name)
            .and_then(|n| n.annotations().get(ANNOTATION_DRAIN_GRACE).cloned())
            .and_then(|g| g.parse().ok())
    }

    /// Cordon calls, including no-ops and failures
    pub fn cordon_calls(&self) -> usize {
        self.state.lock().cordon_calls
    }

    /// Cordon calls that changed a node
    pub fn cordon_changes(&self) -> usize {
        self.state.lock().cordon_changes
    }

    /// Drain requests that changed a node
    pub fn drain_changes(&self) -> usize {
        self.state.lock().drain_changes
    }

    /// Fail the next `times` cordons of `name`
    pub fn fail_cordon(
        &self,
        name: &str,
        times: usize,
        err: impl Fn() -> InterruptionError + Send + 'static,
    ) {
        self.state
            .lock()
            .cordon_failures
            .insert(name.to_string(), (times, Box::new(err)));
    }

    pub fn fail_next_list(&self, err: InterruptionError) {
        self.state.lock().list_failures.push_back(err);
    }
}

#[async_trait]
impl NodeClient for FakeNodes {
    async fn list(&self) -> Result<Vec<Node>> {
        let mut state = self.state.lock();
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        Ok(state.nodes.values().cloned().collect())
    }

    async fn cordon(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.cordon_calls += 1;

        if let Some((remaining, err)) = state.cordon_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err());
            }
        }

        let n = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| InterruptionError::NodeNotFound(name.to_string()))?;
        if node::cordon_patch(n).is_none() {
            return Ok(false);
        }

        let spec = n.spec.get_or_insert_with(Default::default);
        spec.unschedulable = Some(true);
        let taints = spec.taints.get_or_insert_with(Vec::new);
        if !taints.iter().any(|t| t.key == DISRUPTED_TAINT_KEY) {
            taints.push(Taint {
                key: DISRUPTED_TAINT_KEY.to_string(),
                effect: DISRUPTED_TAINT_EFFECT.to_string(),
                ..Default::default()
            });
        }
        state.cordon_changes += 1;
        Ok(true)
    }

    async fn request_drain(&self, name: &str, request: &DrainRequest) -> Result<bool> {
        let mut state = self.state.lock();
        let NodesState { nodes, deleting, .. } = &mut *state;
        let n = nodes
            .get_mut(name)
            .ok_or_else(|| InterruptionError::NodeNotFound(name.to_string()))?;

        let mut changed = false;
        if let Some(annotations) = node::drain_annotations(n, request) {
            n.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(annotations);
            changed = true;
        }
        if deleting.insert(name.to_string()) {
            changed = true;
        }

        if changed {
            state.drain_changes += 1;
        }
        Ok(changed)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Publisher that records every event
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, InterruptionEvent)>>,
}

impl RecordingPublisher {
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reasons_for(&self, node: &str) -> Vec<EventReason> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name == node)
            .map(|(_, event)| event.reason)
            .collect()
    }

    pub fn count(&self, reason: EventReason) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(_, event)| event.reason == reason)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, node: &Node, event: InterruptionEvent) {
        self.events.lock().push((node.name_any(), event));
    }
}
