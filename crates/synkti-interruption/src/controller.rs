//! Interruption controller
//!
//! Wires poller, classifier, correlator and dispatcher into one loop.
//!
//! ## Tick
//!
//! ```text
//! Idle ─▶ Polling ─▶ Classifying ─▶ Correlating ─▶ Dispatching ─▶ Idle
//! ```
//!
//! 1. **Polling**: receive a batch (long-poll). While batches come back full,
//!    keep receiving without waiting, up to `max_batches_per_tick` receives
//! 2. **Classifying**: decode every body
//! 3. **Correlating**: list nodes once and index them by instance ID
//! 4. **Dispatching**: remediate each message on a bounded worker fan-out and
//!    retire it from the queue
//!
//! ## Failure isolation
//!
//! A failure only affects its own message. Invalid, ignored and unmatched
//! messages are deleted. A message whose remediation failed after retries stays
//! for redelivery unless the queue has already delivered it
//! `max_receive_attempts` times, in which case it is deleted anyway. Work
//! abandoned on shutdown is never deleted.

use crate::cache::UnavailableOfferings;
use crate::classify::{Classification, classify_at};
use crate::clock::SharedClock;
use crate::config::ControllerSettings;
use crate::correlate::NodeIndex;
use crate::dispatch::{DispatchOutcome, Dispatcher, DrainGrace, is_cancellation};
use crate::error::{InterruptionError, Result};
use crate::event::QueueMessage;
use crate::infra::InfrastructureReconciler;
use crate::metrics::{self, TickTimer};
use crate::node::NodeClient;
use crate::queue::QueueClient;
use crate::recorder::EventPublisher;
use crate::retry::retry_transient;
use crate::rules::EventRuleClient;
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Where the controller is within a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerPhase {
    /// Between ticks
    Idle,
    /// Receiving from the queue
    Polling,
    /// Decoding message bodies
    Classifying,
    /// Matching events to nodes
    Correlating,
    /// Remediating nodes
    Dispatching,
}

impl fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Classifying => "classifying",
            Self::Correlating => "correlating",
            Self::Dispatching => "dispatching",
        };
        f.write_str(s)
    }
}

/// Per-tick message counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    /// Messages received
    pub received: usize,
    /// Messages whose events reached a node
    pub dispatched: usize,
    /// Well-formed messages with nothing to act on
    pub ignored: usize,
    /// Malformed messages
    pub invalid: usize,
    /// Actionable messages with no matching node
    pub unmatched: usize,
    /// Messages whose remediation failed
    pub failed: usize,
    /// Messages deleted from the queue
    pub deleted: usize,
    /// Messages left for redelivery
    pub retained: usize,
}

impl TickSummary {
    fn absorb(&mut self, result: &MessageResult) {
        match result.disposition {
            Disposition::Dispatched => self.dispatched += 1,
            Disposition::Ignored => self.ignored += 1,
            Disposition::Invalid => self.invalid += 1,
            Disposition::Unmatched => self.unmatched += 1,
            Disposition::Failed => self.failed += 1,
        }
        if result.deleted {
            self.deleted += 1;
        } else {
            self.retained += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Dispatched,
    Ignored,
    Invalid,
    Unmatched,
    Failed,
}

#[derive(Debug)]
struct MessageResult {
    disposition: Disposition,
    deleted: bool,
}

/// Delete decision for a message whose remediation failed
fn should_delete_failed(err: &InterruptionError, receive_count: u32, max_receive_attempts: u32) -> bool {
    if is_cancellation(err) {
        return false;
    }
    !err.is_transient() || receive_count >= max_receive_attempts
}

/// Error that decides the fate of a message with several failed instances
///
/// Transient wins over terminal so the message is redelivered.
fn more_severe(current: Option<InterruptionError>, next: InterruptionError) -> InterruptionError {
    match current {
        Some(current) if current.is_transient() || !next.is_transient() => current,
        _ => next,
    }
}

/// The interruption controller
pub struct InterruptionController {
    settings: ControllerSettings,
    queue: Arc<dyn QueueClient>,
    nodes: Arc<dyn NodeClient>,
    cache: Arc<UnavailableOfferings>,
    dispatcher: Dispatcher,
    infrastructure: Option<InfrastructureReconciler>,
    clock: SharedClock,
    phase: watch::Sender<ControllerPhase>,
    ticks: AtomicU64,
    repair_requested: AtomicBool,
}

impl InterruptionController {
    /// Create a controller from its collaborators
    pub fn new(
        settings: ControllerSettings,
        queue: Arc<dyn QueueClient>,
        rules: Arc<dyn EventRuleClient>,
        nodes: Arc<dyn NodeClient>,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
    ) -> Self {
        let cache = Arc::new(UnavailableOfferings::new(settings.cache_ttl, clock.clone()));
        let dispatcher = Dispatcher::new(
            nodes.clone(),
            events,
            cache.clone(),
            DrainGrace {
                spot: settings.spot_drain_grace,
                maintenance: settings.maintenance_drain_grace,
            },
            settings.retry.clone(),
        );
        let infrastructure = settings
            .manage_infrastructure
            .then(|| InfrastructureReconciler::new(queue.clone(), rules, &settings));
        let (phase, _) = watch::channel(ControllerPhase::Idle);

        Self {
            settings,
            queue,
            nodes,
            cache,
            dispatcher,
            infrastructure,
            clock,
            phase,
            ticks: AtomicU64::new(0),
            repair_requested: AtomicBool::new(false),
        }
    }

    /// Unavailable-offerings cache fed by this controller
    pub fn unavailable_offerings(&self) -> Arc<UnavailableOfferings> {
        Arc::clone(&self.cache)
    }

    /// Watch the current phase
    pub fn phase(&self) -> watch::Receiver<ControllerPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: ControllerPhase) {
        self.phase.send_replace(phase);
    }

    /// Run until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if !self.settings.interruption_handling {
            info!("Interruption handling disabled");
            return Ok(());
        }

        info!(
            queue = %self.queue.queue_name(),
            workers = self.settings.workers,
            batch_size = self.settings.batch_size,
            "Starting interruption controller"
        );

        let sweeper = self
            .cache
            .spawn_sweeper(self.settings.cache_cleanup_interval, cancel.child_token());

        self.reconcile_infrastructure().await;

        let mut resync = tokio::time::interval(self.settings.infra_resync);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        resync.tick().await;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            let span = info_span!("interruption_tick", tick);
            match self.reconcile_once(&cancel).instrument(span).await {
                Ok(summary) if summary.received > 0 => {
                    info!(
                        tick,
                        received = summary.received,
                        dispatched = summary.dispatched,
                        ignored = summary.ignored,
                        invalid = summary.invalid,
                        unmatched = summary.unmatched,
                        failed = summary.failed,
                        retained = summary.retained,
                        "Processed interruption messages"
                    );
                }
                Ok(_) => {}
                Err(InterruptionError::Cancelled) => break,
                Err(e) => {
                    error!(tick, error = %e, "Interruption tick failed");
                }
            }

            if self.repair_requested.swap(false, Ordering::Relaxed) {
                self.reconcile_infrastructure().await;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync.tick(), if self.infrastructure.is_some() => {
                    self.reconcile_infrastructure().await;
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        self.set_phase(ControllerPhase::Idle);
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Cache sweeper task failed");
        }
        info!("Interruption controller stopped");
        Ok(())
    }

    /// Create or repair the delivery infrastructure, logging failures
    async fn reconcile_infrastructure(&self) {
        let Some(infrastructure) = &self.infrastructure else {
            return;
        };
        match infrastructure.create_infrastructure().await {
            Ok(status) if !status.updated_attributes.is_empty() => {
                info!(attributes = ?status.updated_attributes, "Repaired queue configuration");
            }
            Ok(_) => debug!("Interruption infrastructure up to date"),
            Err(e) => {
                metrics::record_failure("infrastructure", e.kind());
                error!(error = %e, "Failed to reconcile interruption infrastructure");
            }
        }
    }

    /// Receive, classify, correlate and dispatch one batch
    pub async fn reconcile_once(&self, cancel: &CancellationToken) -> Result<TickSummary> {
        let timer = TickTimer::start();
        let result = self.tick(cancel).await;
        self.set_phase(ControllerPhase::Idle);
        timer.finish(if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn tick(&self, cancel: &CancellationToken) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        self.set_phase(ControllerPhase::Polling);
        let messages = self.poll(cancel).await?;
        summary.received = messages.len();
        if messages.is_empty() {
            return Ok(summary);
        }
        metrics::MESSAGES_RECEIVED.add(messages.len() as u64, &[]);

        self.set_phase(ControllerPhase::Classifying);
        let received_at = self.clock.now();
        let classified: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let classification = classify_at(&message.body, received_at);
                metrics::record_classification(classification.label());
                (message, classification)
            })
            .collect();

        self.set_phase(ControllerPhase::Correlating);
        let index = if classified.iter().any(|(_, c)| matches!(c, Classification::Events(_))) {
            match retry_transient(&self.settings.retry, "list_nodes", cancel, || self.nodes.list()).await {
                Ok(nodes) => Some(Arc::new(NodeIndex::build(nodes))),
                Err(InterruptionError::Cancelled) => return Err(InterruptionError::Cancelled),
                Err(e) => {
                    metrics::record_failure("list_nodes", e.kind());
                    warn!(error = %e, "Failed to list nodes; actionable messages will be retried");
                    None
                }
            }
        } else {
            None
        };

        self.set_phase(ControllerPhase::Dispatching);
        let results: Vec<MessageResult> = futures::stream::iter(classified)
            .map(|(message, classification)| {
                let index = index.clone();
                async move { self.process(message, classification, index.as_deref(), cancel).await }
            })
            .buffer_unordered(self.settings.workers.max(1))
            .collect()
            .await;

        for result in &results {
            summary.absorb(result);
        }

        if cancel.is_cancelled() {
            return Err(InterruptionError::Cancelled);
        }
        Ok(summary)
    }

    /// Receive up to `max_batches_per_tick` batches
    async fn poll(&self, cancel: &CancellationToken) -> Result<Vec<QueueMessage>> {
        let batch_size = self.settings.batch_size;
        let mut messages = Vec::new();
        let mut wait = self.settings.wait;

        for _ in 0..self.settings.max_batches_per_tick.max(1) {
            let batch = match retry_transient(&self.settings.retry, "receive_messages", cancel, || {
                self.queue.receive(batch_size, wait)
            })
            .await
            {
                Ok(batch) => batch,
                Err(e) if messages.is_empty() => {
                    if matches!(e, InterruptionError::QueueMissing(_)) {
                        warn!(queue = %self.queue.queue_name(), "Interruption queue missing; scheduling repair");
                        self.repair_requested.store(true, Ordering::Relaxed);
                    }
                    if !is_cancellation(&e) {
                        metrics::record_failure("receive", e.kind());
                    }
                    return Err(e);
                }
                // Keep what was already received; the next tick retries
                Err(e) => {
                    warn!(error = %e, "Follow-up receive failed");
                    break;
                }
            };

            let full = batch.len() >= batch_size as usize;
            debug!(count = batch.len(), "Received messages");
            messages.extend(batch);
            if !full {
                break;
            }
            wait = Duration::ZERO;
        }

        Ok(messages)
    }

    async fn process(
        &self,
        message: QueueMessage,
        classification: Classification,
        index: Option<&NodeIndex>,
        cancel: &CancellationToken,
    ) -> MessageResult {
        let disposition = match classification {
            Classification::Invalid(reason) => {
                debug!(message_id = %message.id, reason = %reason, "Dropping invalid message");
                Ok(Disposition::Invalid)
            }
            Classification::Ignored(reason) => {
                debug!(message_id = %message.id, reason = %reason, "Ignoring message");
                Ok(Disposition::Ignored)
            }
            // Node listing failed this tick; the next delivery gets another chance
            Classification::Events(_) if index.is_none() => {
                let delete = message.receive_count >= self.settings.max_receive_attempts;
                let deleted = delete && self.delete(&message, cancel).await;
                return MessageResult {
                    disposition: Disposition::Failed,
                    deleted,
                };
            }
            Classification::Events(events) => match index {
                Some(index) => self.dispatch_events(&message, &events, index, cancel).await,
                None => Ok(Disposition::Unmatched),
            },
        };

        let (disposition, delete) = match disposition {
            Ok(disposition) => (disposition, true),
            Err(e) => {
                let delete = should_delete_failed(&e, message.receive_count, self.settings.max_receive_attempts);
                if !is_cancellation(&e) {
                    metrics::record_failure("dispatch", e.kind());
                    if delete {
                        error!(
                            message_id = %message.id,
                            receive_count = message.receive_count,
                            error = %e,
                            "Giving up on interruption message"
                        );
                    } else {
                        warn!(
                            message_id = %message.id,
                            receive_count = message.receive_count,
                            error = %e,
                            "Interruption message will be redelivered"
                        );
                    }
                }
                (Disposition::Failed, delete)
            }
        };

        let deleted = delete && self.delete(&message, cancel).await;
        MessageResult { disposition, deleted }
    }

    async fn dispatch_events(
        &self,
        message: &QueueMessage,
        events: &[crate::event::DisruptionEvent],
        index: &NodeIndex,
        cancel: &CancellationToken,
    ) -> Result<Disposition> {
        let mut reached_node = false;
        let mut failure: Option<InterruptionError> = None;
        for event in events {
            let Some(node) = index.correlate(event) else {
                debug!(
                    message_id = %message.id,
                    instance_id = %event.instance_id,
                    kind = %event.kind,
                    "No node for instance"
                );
                continue;
            };
            match self.dispatcher.dispatch(event, node, cancel).await {
                Ok(DispatchOutcome::NodeGone) => {}
                Ok(_) => reached_node = true,
                Err(e) if is_cancellation(&e) => return Err(e),
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        instance_id = %event.instance_id,
                        kind = %event.kind,
                        error = %e,
                        "Remediation failed for instance"
                    );
                    failure = Some(more_severe(failure, e));
                }
            }
        }

        // Every instance was attempted; a transient failure keeps the message
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(if reached_node {
            Disposition::Dispatched
        } else {
            Disposition::Unmatched
        })
    }

    async fn delete(&self, message: &QueueMessage, cancel: &CancellationToken) -> bool {
        let deleted = retry_transient(&self.settings.retry, "delete_message", cancel, || {
            self.queue.delete_message(&message.receipt_handle)
        })
        .await;
        match deleted {
            Ok(()) => {
                metrics::MESSAGES_DELETED.add(1, &[]);
                true
            }
            Err(e) => {
                if !is_cancellation(&e) {
                    metrics::record_failure("delete", e.kind());
                    warn!(message_id = %message.id, error = %e, "Failed to delete message");
                }
                false
            }
        }
    }
}
