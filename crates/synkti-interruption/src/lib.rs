//! Synkti Interruption - EC2 disruption handling for Kubernetes nodes
//!
//! Consumes EC2 disruption notices from an SQS queue fed by EventBridge rules and
//! turns them into node actions:
//! - Spot interruption warnings (cordon, drain, mark offering unavailable)
//! - Scheduled maintenance (cordon, drain)
//! - Rebalance recommendations (event only)
//! - Instance state changes (cordon, drain)
//!
//! The controller also owns its delivery infrastructure: it creates the queue and
//! rules at startup and repairs them when they drift.
//!
//! Binary: synkti-interruption

pub mod cache;
pub mod classify;
pub mod clock;
pub mod config;
pub mod controller;
pub mod correlate;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod infra;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod recorder;
pub mod retry;
pub mod rules;

#[cfg(test)]
mod testing;

pub use cache::{OfferingKey, UnavailableOfferings};
pub use classify::{Classification, classify, classify_at};
pub use clock::{Clock, SharedClock, SystemClock, system_clock};
pub use config::{ControllerArgs, ControllerSettings};
pub use controller::{ControllerPhase, InterruptionController, TickSummary};
pub use correlate::NodeIndex;
pub use dispatch::{DispatchOutcome, Dispatcher, DrainGrace};
pub use error::{InterruptionError, Result};
pub use event::{DisruptionEvent, DisruptionKind, InstanceState, QueueMessage};
pub use infra::{InfrastructureNames, InfrastructureReconciler, InfrastructureStatus};
pub use node::{KubeNodeClient, NodeClient};
pub use queue::{QueueClient, SqsQueue};
pub use recorder::{EventPublisher, KubeEventPublisher};
pub use retry::RetryConfig;
pub use rules::{EventBridgeRules, EventRuleClient};
