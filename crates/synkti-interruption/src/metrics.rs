//! OpenTelemetry instruments for interruption handling
//!
//! All instruments hang off one global meter. Without an exporter installed they
//! are no-ops, so library code records unconditionally.

use once_cell::sync::Lazy;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("synkti_interruption"));

/// Messages received from the notification queue
pub static MESSAGES_RECEIVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("synkti_interruption_messages_received_total")
        .with_description("Messages received from the interruption queue")
        .with_unit("{messages}")
        .build()
});

/// Messages deleted from the notification queue
pub static MESSAGES_DELETED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("synkti_interruption_messages_deleted_total")
        .with_description("Messages deleted from the interruption queue")
        .with_unit("{messages}")
        .build()
});

/// Messages by classification outcome
///
/// Labels:
/// - `classification`: actionable, ignored, invalid
pub static MESSAGES_CLASSIFIED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("synkti_interruption_messages_classified_total")
        .with_description("Messages by classification outcome")
        .with_unit("{messages}")
        .build()
});

/// Remediation actions performed
///
/// Labels:
/// - `kind`: disruption kind
/// - `action`: cordon, drain, mark_unavailable, event
pub static ACTIONS_PERFORMED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("synkti_interruption_actions_total")
        .with_description("Node remediation actions performed")
        .with_unit("{actions}")
        .build()
});

/// Operations that failed after retries were exhausted
///
/// Labels:
/// - `operation`: receive, delete, dispatch, infrastructure
/// - `error_type`: error kind
pub static OPERATION_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("synkti_interruption_operation_failures_total")
        .with_description("Operations that failed after retries")
        .with_unit("{errors}")
        .build()
});

/// Duration of one controller tick
pub static TICK_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("synkti_interruption_tick_duration_seconds")
        .with_description("Duration of one interruption-processing tick in seconds")
        .with_unit("s")
        .build()
});

/// Record one classification outcome
pub fn record_classification(label: &'static str) {
    MESSAGES_CLASSIFIED.add(1, &[KeyValue::new("classification", label)]);
}

/// Record one remediation action
pub fn record_action(kind: &'static str, action: &'static str) {
    ACTIONS_PERFORMED.add(
        1,
        &[KeyValue::new("kind", kind), KeyValue::new("action", action)],
    );
}

/// Record a failure that survived retries
pub fn record_failure(operation: &'static str, error_type: &'static str) {
    OPERATION_FAILURES.add(
        1,
        &[
            KeyValue::new("operation", operation),
            KeyValue::new("error_type", error_type),
        ],
    );
}

/// Times one tick
pub struct TickTimer {
    start: std::time::Instant,
}

impl TickTimer {
    /// Start timing
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record the elapsed time with the tick result
    pub fn finish(self, result: &'static str) {
        TICK_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result)],
        );
    }
}
