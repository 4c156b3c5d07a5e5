//! Error types for the interruption controller

use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Interruption controller result type
pub type Result<T> = std::result::Result<T, InterruptionError>;

/// AWS services the controller talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsService {
    /// Simple Queue Service (notification queue)
    Sqs,
    /// EventBridge (routing rules)
    EventBridge,
}

impl fmt::Display for AwsService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqs => f.write_str("sqs"),
            Self::EventBridge => f.write_str("eventbridge"),
        }
    }
}

/// Service error codes AWS uses for throttling and server-side faults
const TRANSIENT_AWS_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalError",
    "InternalFailure",
    "InternalException",
    "KMS.ThrottlingException",
];

/// Service error codes meaning the addressed resource does not exist
const NOT_FOUND_AWS_CODES: &[&str] = &[
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
    "ResourceNotFoundException",
];

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default()
}

/// Errors that can occur in the interruption controller
#[derive(Error, Debug)]
pub enum InterruptionError {
    /// AWS SDK error (SQS or EventBridge)
    #[error("AWS {service} {operation} failed{}: {message}", code_suffix(.code))]
    Aws {
        /// Service that returned the error
        service: AwsService,
        /// Operation name, e.g. `ReceiveMessage`
        operation: &'static str,
        /// Service error code, when the service returned one
        code: Option<String>,
        /// Rendered error chain
        message: String,
        /// Whether retrying may succeed
        transient: bool,
    },

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Node not found in the cluster
    #[error("Node {0} not found")]
    NodeNotFound(String),

    /// Queue does not exist (infrastructure drift)
    #[error("Queue {0} does not exist")]
    QueueMissing(String),

    /// Infrastructure reconciliation error
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Controller shutdown interrupted the operation
    #[error("Operation cancelled by controller shutdown")]
    Cancelled,
}

impl InterruptionError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an infrastructure error
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// Convert from an AWS SDK error, classifying it as transient or not
    pub fn from_aws<E, R>(service: AwsService, operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: fmt::Debug,
    {
        let code = err.code().map(str::to_string);
        let transient = match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
            SdkError::ServiceError(_) => code
                .as_deref()
                .map(|c| TRANSIENT_AWS_CODES.contains(&c))
                .unwrap_or(false),
            _ => false,
        };

        Self::Aws {
            service,
            operation,
            code,
            message: DisplayErrorContext(&err).to_string(),
            transient,
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Aws { transient, .. } => *transient,
            Self::Kube(kube::Error::Api(ae)) => matches!(ae.code, 409 | 429 | 500..=599),
            Self::Kube(kube::Error::SerdeError(_)) => false,
            Self::Kube(_) => true,
            Self::Timeout(_) => true,
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether the error says the addressed resource is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Aws { code, .. } => code
                .as_deref()
                .map(|c| NOT_FOUND_AWS_CODES.contains(&c))
                .unwrap_or(false),
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            Self::NodeNotFound(_) | Self::QueueMissing(_) => true,
            _ => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Aws { .. } => "aws",
            Self::Kube(_) => "kube",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
            Self::NodeNotFound(_) => "node_not_found",
            Self::QueueMissing(_) => "queue_missing",
            Self::Infrastructure(_) => "infrastructure",
            Self::Config(_) => "config",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}
