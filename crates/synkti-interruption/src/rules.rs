//! Event routing rules
//!
//! Four EventBridge rules forward the provider's disruption notifications to the
//! interruption queue. Each matches one notification kind the classifier routes
//! on; the patterns are built from the same `source`/`detail-type` constants.

use crate::classify::{
    DETAIL_TYPE_HEALTH, DETAIL_TYPE_REBALANCE, DETAIL_TYPE_SPOT_INTERRUPTION,
    DETAIL_TYPE_STATE_CHANGE, SOURCE_EC2, SOURCE_HEALTH,
};
use crate::error::{AwsService, InterruptionError, Result};
use async_trait::async_trait;
use aws_sdk_eventbridge::Client as EventBridgeClient;
use aws_sdk_eventbridge::types::{RuleState, Tag, Target};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Target ID used for the queue target on every rule
pub const QUEUE_TARGET_ID: &str = "1";

/// Notification kinds that get a routing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// AWS Health scheduled changes for EC2
    ScheduledChange,
    /// Spot interruption warnings
    SpotInterruption,
    /// Rebalance recommendations
    Rebalance,
    /// Instance state changes
    StateChange,
}

impl RuleKind {
    /// Every kind, in creation order
    pub const ALL: [RuleKind; 4] = [
        RuleKind::ScheduledChange,
        RuleKind::SpotInterruption,
        RuleKind::Rebalance,
        RuleKind::StateChange,
    ];

    /// Suffix appended to the cluster prefix to form the rule name
    pub fn name_suffix(&self) -> &'static str {
        match self {
            Self::ScheduledChange => "ScheduledChangeRule",
            Self::SpotInterruption => "SpotInterruptionRule",
            Self::Rebalance => "RebalanceRule",
            Self::StateChange => "InstanceStateChangeRule",
        }
    }

    /// EventBridge event pattern matched by the rule
    pub fn pattern(&self) -> Value {
        match self {
            Self::ScheduledChange => json!({
                "source": [SOURCE_HEALTH],
                "detail-type": [DETAIL_TYPE_HEALTH],
                "detail": {
                    "service": ["EC2"],
                    "eventTypeCategory": ["scheduledChange"],
                },
            }),
            Self::SpotInterruption => json!({
                "source": [SOURCE_EC2],
                "detail-type": [DETAIL_TYPE_SPOT_INTERRUPTION],
            }),
            Self::Rebalance => json!({
                "source": [SOURCE_EC2],
                "detail-type": [DETAIL_TYPE_REBALANCE],
            }),
            Self::StateChange => json!({
                "source": [SOURCE_EC2],
                "detail-type": [DETAIL_TYPE_STATE_CHANGE],
            }),
        }
    }
}

/// A routing rule owned by one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct EventRule {
    /// Rule name, `<prefix>-<Kind>Rule`
    pub name: String,
    /// Notification kind the rule forwards
    pub kind: RuleKind,
    /// Event pattern
    pub pattern: Value,
    /// Resource tags
    pub tags: BTreeMap<String, String>,
}

impl EventRule {
    /// Build the rule of `kind` for a naming prefix
    pub fn new(prefix: &str, kind: RuleKind, tags: BTreeMap<String, String>) -> Self {
        Self {
            name: format!("{prefix}-{}", kind.name_suffix()),
            kind,
            pattern: kind.pattern(),
            tags,
        }
    }
}

/// The full rule set for a naming prefix
pub fn interruption_rules(prefix: &str, tags: &BTreeMap<String, String>) -> Vec<EventRule> {
    RuleKind::ALL
        .iter()
        .map(|kind| EventRule::new(prefix, *kind, tags.clone()))
        .collect()
}

/// Operations on event-bus rules
#[async_trait]
pub trait EventRuleClient: Send + Sync {
    /// Create or update a rule, returning its ARN
    async fn put_rule(&self, rule: &EventRule) -> Result<String>;

    /// Point a rule at a target (upsert by target ID)
    async fn put_target(&self, rule_name: &str, target_id: &str, target_arn: &str) -> Result<()>;

    /// Remove a rule's targets and the rule itself; an absent rule is success
    async fn delete_rule(&self, rule_name: &str, target_ids: &[&str]) -> Result<()>;
}

/// EventBridge-backed rule client
pub struct EventBridgeRules {
    client: EventBridgeClient,
}

impl EventBridgeRules {
    /// Create a new rule client
    pub fn new(client: EventBridgeClient) -> Self {
        Self { client }
    }

    /// Create from AWS config
    pub fn from_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(EventBridgeClient::new(config))
    }
}

fn build_error(what: &str, err: impl std::fmt::Display) -> InterruptionError {
    InterruptionError::infrastructure(format!("invalid {what}: {err}"))
}

#[async_trait]
impl EventRuleClient for EventBridgeRules {
    async fn put_rule(&self, rule: &EventRule) -> Result<String> {
        let tags = rule
            .tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| build_error("rule tag", e))?;

        let output = self
            .client
            .put_rule()
            .name(&rule.name)
            .event_pattern(rule.pattern.to_string())
            .state(RuleState::Enabled)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| InterruptionError::from_aws(AwsService::EventBridge, "PutRule", e))?;

        debug!(rule = %rule.name, "Put event rule");
        Ok(output.rule_arn().unwrap_or_default().to_string())
    }

    async fn put_target(&self, rule_name: &str, target_id: &str, target_arn: &str) -> Result<()> {
        let target = Target::builder()
            .id(target_id)
            .arn(target_arn)
            .build()
            .map_err(|e| build_error("rule target", e))?;

        let output = self
            .client
            .put_targets()
            .rule(rule_name)
            .targets(target)
            .send()
            .await
            .map_err(|e| InterruptionError::from_aws(AwsService::EventBridge, "PutTargets", e))?;

        if output.failed_entry_count() > 0 {
            let reasons: Vec<_> = output
                .failed_entries()
                .iter()
                .map(|entry| {
                    format!(
                        "{}: {}",
                        entry.error_code().unwrap_or("unknown"),
                        entry.error_message().unwrap_or_default()
                    )
                })
                .collect();
            return Err(InterruptionError::infrastructure(format!(
                "failed to target rule {rule_name}: {}",
                reasons.join("; ")
            )));
        }

        debug!(rule = %rule_name, target = %target_arn, "Put event rule target");
        Ok(())
    }

    async fn delete_rule(&self, rule_name: &str, target_ids: &[&str]) -> Result<()> {
        if !target_ids.is_empty() {
            let removed = self
                .client
                .remove_targets()
                .rule(rule_name)
                .set_ids(Some(target_ids.iter().map(|id| id.to_string()).collect()))
                .send()
                .await
                .map_err(|e| InterruptionError::from_aws(AwsService::EventBridge, "RemoveTargets", e));
            match removed {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(rule = %rule_name, "Rule already absent");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        match self
            .client
            .delete_rule()
            .name(rule_name)
            .send()
            .await
            .map_err(|e| InterruptionError::from_aws(AwsService::EventBridge, "DeleteRule", e))
        {
            Ok(_) => {
                info!(rule = %rule_name, "Deleted event rule");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
