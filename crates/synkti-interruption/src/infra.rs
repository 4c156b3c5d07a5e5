//! Delivery infrastructure reconciler
//!
//! Keeps the pipe from the event bus to the controller alive: one SQS queue and
//! four EventBridge rules per cluster, all named deterministically from the
//! cluster name.
//!
//! ## Create
//!
//! 1. Ensure the queue exists (created with retention, encryption and redrive)
//! 2. Diff the queue attributes we own against the desired ones and set only the
//!    differences (the send policy needs the queue ARN, so it always lands here
//!    on first creation)
//! 3. Upsert every rule and point it at the queue
//!
//! Every step converges, so a partial failure is repaired by calling
//! [`InfrastructureReconciler::create_infrastructure`] again.
//!
//! ## Delete
//!
//! Rules first (so nothing publishes into a vanishing queue), then the queue.
//! Resources that are already gone count as deleted.

use crate::config::ControllerSettings;
use crate::error::Result;
use crate::queue::{
    ATTR_MESSAGE_RETENTION_PERIOD, ATTR_POLICY, ATTR_REDRIVE_POLICY, ATTR_SQS_MANAGED_SSE,
    QueueAttributes, QueueClient, QueueInfo,
};
use crate::rules::{EventRule, EventRuleClient, QUEUE_TARGET_ID, interruption_rules};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// SQS queue name limit
const MAX_QUEUE_NAME_LEN: usize = 80;
/// EventBridge rule name limit
const MAX_RULE_NAME_LEN: usize = 64;

/// Tag carrying the owning cluster
pub const CLUSTER_TAG: &str = "synkti.io/cluster";
/// Tag marking resources this controller manages
pub const MANAGED_BY_TAG: &str = "synkti.io/managed-by";
/// Value of [`MANAGED_BY_TAG`]
pub const MANAGED_BY: &str = "synkti-interruption";

/// Deterministic resource names for one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfrastructureNames {
    /// SQS queue name
    pub queue: String,
    /// Prefix of every rule name
    pub rule_prefix: String,
}

impl InfrastructureNames {
    /// Names derived from the cluster name
    pub fn for_cluster(cluster_name: &str) -> Self {
        let cluster = sanitize(cluster_name);
        let longest_suffix = crate::rules::RuleKind::ALL
            .iter()
            .map(|kind| kind.name_suffix().len())
            .max()
            .unwrap_or_default();

        let mut queue = format!("synkti-{cluster}-interruption");
        queue.truncate(MAX_QUEUE_NAME_LEN);

        let mut rule_prefix = format!("synkti-{cluster}");
        rule_prefix.truncate(MAX_RULE_NAME_LEN - longest_suffix - 1);

        Self { queue, rule_prefix }
    }

    /// Names for the given settings, honoring a queue name override
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        let mut names = Self::for_cluster(&settings.cluster_name);
        if let Some(queue) = &settings.queue_name {
            names.queue = queue.clone();
        }
        names
    }
}

/// Keep characters valid in both queue and rule names
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Queue policy letting the event bus publish to the queue
pub fn queue_policy(queue_arn: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Id": "EC2InterruptionPolicy",
        "Statement": [{
            "Sid": "EventBridgeSendMessage",
            "Effect": "Allow",
            "Principal": {
                "Service": ["events.amazonaws.com", "sqs.amazonaws.com"]
            },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
        }]
    })
}

/// Attributes set only in place; JSON-valued ones compare structurally
fn attribute_matches(key: &str, desired: &str, current: Option<&String>) -> bool {
    let Some(current) = current else {
        return false;
    };
    if key == ATTR_POLICY || key == ATTR_REDRIVE_POLICY {
        let parsed = (
            serde_json::from_str::<Value>(desired),
            serde_json::from_str::<Value>(current),
        );
        if let (Ok(a), Ok(b)) = parsed {
            return a == b;
        }
    }
    desired == current
}

/// The subset of `desired` that differs from `current`
pub fn attributes_to_update(desired: &QueueAttributes, current: &QueueAttributes) -> QueueAttributes {
    desired
        .iter()
        .filter(|(k, v)| !attribute_matches(k, v, current.get(*k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// What a create pass found and changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfrastructureStatus {
    /// The queue
    pub queue: QueueInfo,
    /// Rule names, in creation order
    pub rules: Vec<String>,
    /// Attributes that had to be set
    pub updated_attributes: Vec<String>,
}

/// Creates, repairs and deletes the queue and rules of one cluster
pub struct InfrastructureReconciler {
    queue: Arc<dyn QueueClient>,
    rules: Arc<dyn EventRuleClient>,
    rule_prefix: String,
    tags: BTreeMap<String, String>,
    message_retention_secs: u64,
    dead_letter: Option<(String, u32)>,
}

impl InfrastructureReconciler {
    /// Create a reconciler for the cluster described by `settings`
    pub fn new(
        queue: Arc<dyn QueueClient>,
        rules: Arc<dyn EventRuleClient>,
        settings: &ControllerSettings,
    ) -> Self {
        let names = InfrastructureNames::from_settings(settings);
        let tags = BTreeMap::from([
            (CLUSTER_TAG.to_string(), settings.cluster_name.clone()),
            (MANAGED_BY_TAG.to_string(), MANAGED_BY.to_string()),
        ]);
        Self {
            queue,
            rules,
            rule_prefix: names.rule_prefix,
            tags,
            message_retention_secs: settings.message_retention.as_secs(),
            dead_letter: settings
                .dead_letter_queue_arn
                .clone()
                .map(|arn| (arn, settings.dead_letter_max_receives)),
        }
    }

    /// The rules this reconciler owns
    pub fn rules(&self) -> Vec<EventRule> {
        interruption_rules(&self.rule_prefix, &self.tags)
    }

    /// Attributes the queue is created with (everything except the ARN-bound policy)
    fn creation_attributes(&self) -> QueueAttributes {
        let mut attributes = QueueAttributes::from([
            (
                ATTR_MESSAGE_RETENTION_PERIOD.to_string(),
                self.message_retention_secs.to_string(),
            ),
            (ATTR_SQS_MANAGED_SSE.to_string(), "true".to_string()),
        ]);
        if let Some((arn, max_receives)) = &self.dead_letter {
            attributes.insert(
                ATTR_REDRIVE_POLICY.to_string(),
                json!({ "deadLetterTargetArn": arn, "maxReceiveCount": max_receives }).to_string(),
            );
        }
        attributes
    }

    /// Every attribute this reconciler owns, for a queue with the given ARN
    pub fn desired_attributes(&self, queue_arn: &str) -> QueueAttributes {
        let mut attributes = self.creation_attributes();
        attributes.insert(ATTR_POLICY.to_string(), queue_policy(queue_arn).to_string());
        attributes
    }

    /// Ensure the queue and rules exist and are configured
    pub async fn create_infrastructure(&self) -> Result<InfrastructureStatus> {
        let queue = self
            .queue
            .ensure_queue(&self.creation_attributes(), &self.tags)
            .await?;

        let current = self.queue.attributes().await?;
        let updates = attributes_to_update(&self.desired_attributes(&queue.arn), &current);
        let updated_attributes: Vec<String> = updates.keys().cloned().collect();
        if !updates.is_empty() {
            info!(
                queue = %self.queue.queue_name(),
                attributes = ?updated_attributes,
                "Updating queue attributes"
            );
            self.queue.set_attributes(&updates).await?;
        }

        let mut rule_names = Vec::new();
        for rule in self.rules() {
            self.rules.put_rule(&rule).await?;
            self.rules
                .put_target(&rule.name, QUEUE_TARGET_ID, &queue.arn)
                .await?;
            debug!(rule = %rule.name, queue = %queue.arn, "Rule targets queue");
            rule_names.push(rule.name);
        }

        info!(
            queue = %self.queue.queue_name(),
            rules = rule_names.len(),
            "Interruption infrastructure reconciled"
        );

        Ok(InfrastructureStatus {
            queue,
            rules: rule_names,
            updated_attributes,
        })
    }

    /// Delete the rules and queue; absent resources count as deleted
    pub async fn delete_infrastructure(&self) -> Result<()> {
        for rule in self.rules() {
            self.rules.delete_rule(&rule.name, &[QUEUE_TARGET_ID]).await?;
        }
        self.queue.delete_queue().await?;
        info!(queue = %self.queue.queue_name(), "Interruption infrastructure deleted");
        Ok(())
    }
}
