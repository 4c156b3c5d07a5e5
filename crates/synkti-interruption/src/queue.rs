//! Notification queue client
//!
//! [`QueueClient`] is the seam the poller and the infrastructure reconciler use;
//! [`SqsQueue`] implements it on SQS.
//!
//! ## Queue URL caching
//!
//! SQS addresses queues by URL, which is resolved from the queue name once and
//! cached. When SQS reports the queue missing the cache is dropped and the call
//! fails with [`InterruptionError::QueueMissing`], which the controller treats as
//! infrastructure drift.

use crate::error::{AwsService, InterruptionError, Result};
use crate::event::QueueMessage;
use async_trait::async_trait;
use aws_sdk_sqs::Client as SqsClient;
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `MessageRetentionPeriod` queue attribute
pub const ATTR_MESSAGE_RETENTION_PERIOD: &str = "MessageRetentionPeriod";
/// `Policy` queue attribute
pub const ATTR_POLICY: &str = "Policy";
/// `SqsManagedSseEnabled` queue attribute
pub const ATTR_SQS_MANAGED_SSE: &str = "SqsManagedSseEnabled";
/// `RedrivePolicy` queue attribute
pub const ATTR_REDRIVE_POLICY: &str = "RedrivePolicy";
/// `QueueArn` queue attribute (read-only)
pub const ATTR_QUEUE_ARN: &str = "QueueArn";

/// Queue attribute map, keyed by SQS attribute name
pub type QueueAttributes = BTreeMap<String, String>;

/// Address of an existing queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Queue URL
    pub url: String,
    /// Queue ARN
    pub arn: String,
}

/// Operations on the notification queue
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Name of the queue this client addresses
    fn queue_name(&self) -> &str;

    /// URL and ARN of the queue, `None` when it does not exist
    async fn queue_info(&self) -> Result<Option<QueueInfo>>;

    /// Create the queue if absent; existing queues are returned untouched
    async fn ensure_queue(
        &self,
        attributes: &QueueAttributes,
        tags: &BTreeMap<String, String>,
    ) -> Result<QueueInfo>;

    /// Current queue attributes
    async fn attributes(&self) -> Result<QueueAttributes>;

    /// Set the given attributes in place, leaving others unchanged
    async fn set_attributes(&self, attributes: &QueueAttributes) -> Result<()>;

    /// Delete the queue; an absent queue is success
    async fn delete_queue(&self) -> Result<()>;

    /// Receive up to `max_messages`, long-polling for at most `wait`
    async fn receive(&self, max_messages: i32, wait: Duration) -> Result<Vec<QueueMessage>>;

    /// Delete one delivery of a message
    async fn delete_message(&self, receipt_handle: &str) -> Result<()>;
}

/// SQS-backed queue client
pub struct SqsQueue {
    client: SqsClient,
    name: String,
    url: RwLock<Option<String>>,
}

impl SqsQueue {
    /// Create a client for the named queue
    pub fn new(client: SqsClient, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            url: RwLock::new(None),
        }
    }

    /// Create from AWS config
    pub fn from_config(config: &aws_config::SdkConfig, name: impl Into<String>) -> Self {
        Self::new(SqsClient::new(config), name)
    }

    fn fail<E, R>(&self, operation: &'static str, err: SdkError<E, R>) -> InterruptionError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug,
    {
        let err = InterruptionError::from_aws(AwsService::Sqs, operation, err);
        if err.is_not_found() {
            self.url.write().take();
            return InterruptionError::QueueMissing(self.name.clone());
        }
        err
    }

    /// Resolve (and cache) the queue URL, `None` when the queue does not exist
    async fn lookup_url(&self) -> Result<Option<String>> {
        let cached = self.url.read().clone();
        if cached.is_some() {
            return Ok(cached);
        }

        match self.client.get_queue_url().queue_name(&self.name).send().await {
            Ok(output) => {
                let url = output.queue_url().map(str::to_string);
                if let Some(url) = &url {
                    debug!(queue = %self.name, url = %url, "Resolved queue URL");
                    *self.url.write() = Some(url.clone());
                }
                Ok(url)
            }
            Err(e) => match self.fail("GetQueueUrl", e) {
                InterruptionError::QueueMissing(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn url(&self) -> Result<String> {
        self.lookup_url()
            .await?
            .ok_or_else(|| InterruptionError::QueueMissing(self.name.clone()))
    }

    async fn arn(&self, url: &str) -> Result<String> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| self.fail("GetQueueAttributes", e))?;

        output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| InterruptionError::infrastructure(format!("queue {} has no ARN", self.name)))
    }
}

fn to_sdk_attributes(attributes: &QueueAttributes) -> HashMap<QueueAttributeName, String> {
    attributes
        .iter()
        .map(|(k, v)| (QueueAttributeName::from(k.as_str()), v.clone()))
        .collect()
}

#[async_trait]
impl QueueClient for SqsQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn queue_info(&self) -> Result<Option<QueueInfo>> {
        let Some(url) = self.lookup_url().await? else {
            return Ok(None);
        };
        let arn = self.arn(&url).await?;
        Ok(Some(QueueInfo { url, arn }))
    }

    async fn ensure_queue(
        &self,
        attributes: &QueueAttributes,
        tags: &BTreeMap<String, String>,
    ) -> Result<QueueInfo> {
        if let Some(info) = self.queue_info().await? {
            return Ok(info);
        }

        info!(queue = %self.name, "Creating interruption queue");
        let created = self
            .client
            .create_queue()
            .queue_name(&self.name)
            .set_attributes(Some(to_sdk_attributes(attributes)))
            .set_tags(Some(tags.clone().into_iter().collect()))
            .send()
            .await;

        match created {
            Ok(output) => {
                if let Some(url) = output.queue_url() {
                    *self.url.write() = Some(url.to_string());
                }
            }
            // Lost a race with another creator; the queue exists now
            Err(e) if matches!(e.code(), Some("QueueAlreadyExists" | "QueueNameExists")) => {
                warn!(queue = %self.name, "Queue was created concurrently");
            }
            Err(e) => return Err(self.fail("CreateQueue", e)),
        }

        let url = self.url().await?;
        let arn = self.arn(&url).await?;
        Ok(QueueInfo { url, arn })
    }

    async fn attributes(&self) -> Result<QueueAttributes> {
        let url = self.url().await?;
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(QueueAttributeName::All)
            .send()
            .await
            .map_err(|e| self.fail("GetQueueAttributes", e))?;

        Ok(output
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_attributes(&self, attributes: &QueueAttributes) -> Result<()> {
        if attributes.is_empty() {
            return Ok(());
        }
        let url = self.url().await?;
        self.client
            .set_queue_attributes()
            .queue_url(url)
            .set_attributes(Some(to_sdk_attributes(attributes)))
            .send()
            .await
            .map_err(|e| self.fail("SetQueueAttributes", e))?;
        Ok(())
    }

    async fn delete_queue(&self) -> Result<()> {
        let Some(url) = self.lookup_url().await? else {
            debug!(queue = %self.name, "Queue already absent");
            return Ok(());
        };

        match self.client.delete_queue().queue_url(url).send().await {
            Ok(_) => {
                self.url.write().take();
                info!(queue = %self.name, "Deleted interruption queue");
                Ok(())
            }
            Err(e) => match self.fail("DeleteQueue", e) {
                InterruptionError::QueueMissing(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn receive(&self, max_messages: i32, wait: Duration) -> Result<Vec<QueueMessage>> {
        let url = self.url().await?;
        let output = self
            .client
            .receive_message()
            .queue_url(url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| self.fail("ReceiveMessage", e))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                let Some(receipt_handle) = m.receipt_handle() else {
                    warn!(message_id = ?m.message_id(), "Received message without receipt handle");
                    return None;
                };
                let receive_count = m
                    .attributes()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(1);
                Some(QueueMessage {
                    id: m.message_id().unwrap_or_default().to_string(),
                    receipt_handle: receipt_handle.to_string(),
                    body: m.body().unwrap_or_default().to_string(),
                    receive_count,
                })
            })
            .collect();

        Ok(messages)
    }

    async fn delete_message(&self, receipt_handle: &str) -> Result<()> {
        let url = self.url().await?;
        self.client
            .delete_message()
            .queue_url(url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| self.fail("DeleteMessage", e))?;
        Ok(())
    }
}
