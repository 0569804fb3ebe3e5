use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Result, UrsaError};
use crate::store::{Priority, Workset, WorksetState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Completed,
    Failed,
    Retrying,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Started => "started",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorksetEvent {
    pub workset_id: String,
    pub event_type: EventType,
    pub state: WorksetState,
    pub priority: Priority,
    pub customer_id: Option<String>,
    pub cluster_name: Option<String>,
    pub error_details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WorksetEvent {
    pub fn from_workset(event_type: EventType, workset: &Workset) -> Self {
        Self {
            workset_id: workset.workset_id.clone(),
            event_type,
            state: workset.state,
            priority: workset.priority,
            customer_id: workset.customer_id.clone(),
            cluster_name: None,
            error_details: workset.error_details.clone(),
            timestamp: workset.updated_at,
        }
    }

    pub fn on_cluster(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = Some(cluster_name.into());
        self
    }
}

/// Receives lifecycle events. Delivery is best effort: the processor logs
/// a failed notify and carries on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &WorksetEvent) -> Result<()>;
}

/// Writes each event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, event: &WorksetEvent) -> Result<()> {
        match event.event_type {
            EventType::Failed => tracing::warn!(
                workset_id = %event.workset_id,
                event = %event.event_type,
                state = %event.state,
                error = event.error_details.as_deref().unwrap_or(""),
                "Workset event"
            ),
            _ => tracing::info!(
                workset_id = %event.workset_id,
                event = %event.event_type,
                state = %event.state,
                cluster = event.cluster_name.as_deref().unwrap_or(""),
                "Workset event"
            ),
        }
        Ok(())
    }
}

/// Forwards events into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<WorksetEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<WorksetEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WorksetEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, event: &WorksetEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| UrsaError::Internal("notification receiver dropped".to_string()))
    }
}

/// Delivers to every inner sink, reporting the first failure.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn notify(&self, event: &WorksetEvent) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
