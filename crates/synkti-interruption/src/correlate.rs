//! Node correlation
//!
//! Maps an instance ID to the node whose provider ID encodes it. Provider IDs
//! look like `aws:///us-west-2a/i-0123456789abcdef0`; the instance ID is the last
//! path segment.
//!
//! The index is rebuilt from one node listing per tick. Each instance ID maps to
//! at most one node, so correlation is injective within a tick.

use crate::event::DisruptionEvent;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::warn;

/// Extract the instance ID from a provider ID
///
/// Returns `None` for IDs that do not end in an EC2 instance ID.
pub fn instance_id_from_provider_id(provider_id: &str) -> Option<&str> {
    let (_, rest) = provider_id.split_once("://")?;
    let id = rest.rsplit('/').next()?;
    if id.starts_with("i-") && id.len() > 2 {
        Some(id)
    } else {
        None
    }
}

/// Instance ID -> node lookup for one tick
#[derive(Debug, Default)]
pub struct NodeIndex {
    by_instance: HashMap<String, Node>,
}

impl NodeIndex {
    /// Index the given nodes
    ///
    /// Nodes without a parsable provider ID are skipped. If two nodes claim the
    /// same instance the lexicographically smaller name wins.
    pub fn build(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut by_instance: HashMap<String, Node> = HashMap::new();

        for node in nodes {
            let Some(instance_id) = node
                .spec
                .as_ref()
                .and_then(|spec| spec.provider_id.as_deref())
                .and_then(instance_id_from_provider_id)
                .map(str::to_string)
            else {
                continue;
            };

            match by_instance.entry(instance_id) {
                Entry::Vacant(slot) => {
                    slot.insert(node);
                }
                Entry::Occupied(mut slot) => {
                    warn!(
                        instance_id = %slot.key(),
                        first = %slot.get().name_any(),
                        second = %node.name_any(),
                        "Two nodes share one instance ID"
                    );
                    if node.name_any() < slot.get().name_any() {
                        slot.insert(node);
                    }
                }
            }
        }

        Self { by_instance }
    }

    /// Node for an instance ID
    pub fn get(&self, instance_id: &str) -> Option<&Node> {
        self.by_instance.get(instance_id)
    }

    /// Node for an event's instance
    pub fn correlate(&self, event: &DisruptionEvent) -> Option<&Node> {
        self.get(&event.instance_id)
    }

    /// Number of indexed nodes
    pub fn len(&self) -> usize {
        self.by_instance.len()
    }

    /// Whether no node was indexed
    pub fn is_empty(&self) -> bool {
        self.by_instance.is_empty()
    }
}
