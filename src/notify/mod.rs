//! Notification events emitted by the watchers.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationEventType {
    AgentStarted,
    WaitingApproval,
    PhaseCompleted,
    AgentCompleted,
    AgentFailed,
    PrMerged,
    PrClosed,
    PrChecksPassed,
    PrChecksFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub event_type: NotificationEventType,
    pub feature_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_run_id: Option<String>,
    pub feature_name: String,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        event_type: NotificationEventType,
        feature_id: impl Into<String>,
        feature_name: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            event_type,
            feature_id: feature_id.into(),
            agent_run_id: None,
            feature_name: feature_name.into(),
            message: message.into(),
            severity,
            phase_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.agent_run_id = Some(run_id.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase_name = Some(phase.into());
        self
    }
}

/// Destination for notification events.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: &NotificationEvent) -> Result<()>;
}

/// Fans events out to every subscriber of a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<NotificationEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn emit(&self, event: &NotificationEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Collects events in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn take(&self) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

impl NotificationSink for MemorySink {
    fn emit(&self, event: &NotificationEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("notification sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> NotificationEvent {
        NotificationEvent::new(
            NotificationEventType::PrChecksFailed,
            "f-1",
            "Login",
            "CI failed",
            Severity::Error,
        )
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let json = serde_json::to_value(event().with_run("run-1")).unwrap();
        assert_eq!(json["eventType"], "PrChecksFailed");
        assert_eq!(json["featureId"], "f-1");
        assert_eq!(json["agentRunId"], "run-1");
        assert_eq!(json["severity"], "error");
        assert!(json.get("phaseName").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        sink.emit(&event()).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, NotificationEventType::PrChecksFailed);
    }

    #[test]
    fn test_broadcast_without_subscribers_is_ok() {
        let sink = BroadcastSink::new(4);
        assert!(sink.emit(&event()).is_ok());
    }

    #[test]
    fn test_memory_sink_take_drains() {
        let sink = MemorySink::new();
        sink.emit(&event()).unwrap();
        assert_eq!(sink.take().len(), 1);
        assert!(sink.events().is_empty());
    }
}
