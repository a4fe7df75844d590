//! Outbound task notifications.
//!
//! The engine pushes a [`TransferEvent`] at every lifecycle step. Delivery is
//! fire-and-forget: a failing sink is logged and never fails the operation
//! that produced the event.

use crate::tracker::ProgressSnapshot;
use async_trait::async_trait;
use depot_core::TaskId;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event pushed to a task's owner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferEvent {
    Initialized,
    Checking,
    QuickUpload {
        file_id: Uuid,
    },
    ReadyToUpload {
        upload_id: String,
    },
    Progress(ProgressSnapshot),
    Paused,
    Resumed {
        completed_indices: Vec<u32>,
    },
    Merging,
    Complete {
        file_id: Uuid,
    },
    Canceled,
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_index: Option<u32>,
    },
}

impl TransferEvent {
    /// The serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferEvent::Initialized => "initialized",
            TransferEvent::Checking => "checking",
            TransferEvent::QuickUpload { .. } => "quick_upload",
            TransferEvent::ReadyToUpload { .. } => "ready_to_upload",
            TransferEvent::Progress(_) => "progress",
            TransferEvent::Paused => "paused",
            TransferEvent::Resumed { .. } => "resumed",
            TransferEvent::Merging => "merging",
            TransferEvent::Complete { .. } => "complete",
            TransferEvent::Canceled => "canceled",
            TransferEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Push transport for task events.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(
        &self,
        user_id: &str,
        task_id: TaskId,
        event: TransferEvent,
    ) -> Result<(), NotifyError>;
}

/// Engine-side handle that swallows delivery failures.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub async fn send(&self, user_id: &str, task_id: TaskId, event: TransferEvent) {
        let kind = event.kind();
        match self.sink.notify(user_id, task_id, event).await {
            Ok(()) => tracing::trace!(task_id = %task_id, kind, "Event delivered"),
            Err(e) => {
                tracing::warn!(task_id = %task_id, kind, error = %e, "Failed to deliver event")
            }
        }
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn notify(&self, _: &str, _: TaskId, _: TransferEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Logs each event's wire form.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(
        &self,
        user_id: &str,
        task_id: TaskId,
        event: TransferEvent,
    ) -> Result<(), NotifyError> {
        let payload =
            serde_json::to_string(&event).map_err(|e| NotifyError::Delivery(e.to_string()))?;
        tracing::info!(user_id, task_id = %task_id, event = %payload, "Transfer event");
        Ok(())
    }
}

/// One delivered event with its addressing.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub user_id: String,
    pub task_id: TaskId,
    pub event: TransferEvent,
}

/// Fans events out over a tokio broadcast channel.
///
/// Having no subscribers is not an error. Slow subscribers lose the oldest
/// events rather than holding up the engine.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Events addressed to one user, skipping over any lag.
    pub fn subscribe_user(
        &self,
        user_id: impl Into<String>,
    ) -> Pin<Box<dyn Stream<Item = Notification> + Send>> {
        let user_id = user_id.into();
        let mut rx = self.tx.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(notification) if notification.user_id == user_id => {
                        yield notification;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn notify(
        &self,
        user_id: &str,
        task_id: TaskId,
        event: TransferEvent,
    ) -> Result<(), NotifyError> {
        // Err only means nobody is listening right now.
        let _ = self.tx.send(Notification {
            user_id: user_id.to_string(),
            task_id,
            event,
        });
        Ok(())
    }
}
