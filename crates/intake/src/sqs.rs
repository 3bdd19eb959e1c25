//! SQS long-poll consumer
//!
//! A single loop receives messages, forwards each decoded descriptor into
//! the intake channel and deletes the message once it has been handed over.
//! Malformed messages are logged and deleted so they do not come back.
//! Receive errors are retried with exponential backoff.

use crate::{parse_descriptor, Backoff, IntakeError, IntakeResult, QueueConfig};
use aws_config::BehaviorVersion;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::Client;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use video_track_common::TaskDescriptor;

/// Pull-based queue transport
pub struct SqsQueuePoller {
    client: Client,
    queue_url: String,
    config: QueueConfig,
}

impl SqsQueuePoller {
    /// Build a poller from the default AWS credential chain
    pub async fn new(config: QueueConfig) -> IntakeResult<Self> {
        let queue_url = config
            .queue_url
            .clone()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| IntakeError::InvalidConfig("queue_url is not set".to_string()))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        info!("Polling SQS queue {}", queue_url);

        Ok(Self {
            client: Client::new(&sdk_config),
            queue_url,
            config,
        })
    }

    #[must_use]
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Poll until the intake channel closes
    pub async fn run(self, intake: mpsc::Sender<TaskDescriptor>) -> IntakeResult<()> {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        );

        while !intake.is_closed() {
            match self.poll_once(&intake).await {
                Ok(count) => {
                    if count > 0 {
                        debug!("Forwarded {} queue messages", count);
                    }
                    backoff.reset();
                }
                Err(IntakeError::ChannelClosed) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("{}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        info!("Intake channel closed, SQS poller stopping");
        Ok(())
    }

    /// One receive call; returns how many descriptors were forwarded
    pub async fn poll_once(&self, intake: &mpsc::Sender<TaskDescriptor>) -> IntakeResult<usize> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.config.max_messages)
            .wait_time_seconds(self.config.wait_time_secs)
            .send()
            .await
            .map_err(|e| IntakeError::Transport(format!("receive failed: {e}")))?;

        let mut forwarded = 0;
        for message in output.messages() {
            let body = message.body().unwrap_or_default();
            match parse_descriptor(body) {
                Ok(descriptor) => {
                    debug!("Queue message for task {}", descriptor.task_id);
                    intake
                        .send(descriptor)
                        .await
                        .map_err(|_| IntakeError::ChannelClosed)?;
                    forwarded += 1;
                }
                Err(e) => {
                    warn!(
                        "Dropping queue message {}: {}",
                        message.message_id().unwrap_or("<no id>"),
                        e
                    );
                }
            }

            if let Some(receipt) = message.receipt_handle() {
                self.client
                    .delete_message()
                    .queue_url(&self.queue_url)
                    .receipt_handle(receipt)
                    .send()
                    .await
                    .map_err(|e| IntakeError::Transport(format!("delete failed: {e}")))?;
            }
        }

        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_queue_url() {
        let config = QueueConfig {
            queue_url: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            SqsQueuePoller::new(config).await,
            Err(IntakeError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires an SQS endpoint at localhost:4566"]
    async fn test_forward_message_from_local_queue() {
        if std::net::TcpStream::connect("127.0.0.1:4566").is_err() {
            return;
        }

        let config = QueueConfig {
            queue_url: Some("http://localhost:4566/000000000000/video-track-tasks".to_string()),
            endpoint: Some("http://localhost:4566".to_string()),
            wait_time_secs: 1,
            ..Default::default()
        };
        let poller = SqsQueuePoller::new(config).await.unwrap();
        poller
            .client
            .send_message()
            .queue_url(poller.queue_url())
            .message_body(r#"{"taskId":"Q1","bucket":"uploads","key":"Q1/input/clip.mp4"}"#)
            .send()
            .await
            .unwrap();

        let (sender, mut receiver) = mpsc::channel(4);
        let mut forwarded = 0;
        for _ in 0..5 {
            forwarded += poller.poll_once(&sender).await.unwrap();
            if forwarded > 0 {
                break;
            }
        }
        assert_eq!(forwarded, 1);
        assert_eq!(receiver.recv().await.unwrap().task_id, "Q1");
    }
}
