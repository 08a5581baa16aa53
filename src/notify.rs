use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::LifecycleEvent;
use crate::observability;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("notifier unavailable")]
    Unavailable,
}

/// Outbound channel for appointment lifecycle events (email, SMS, ...).
/// Best-effort: a failure is logged and counted by the hub, never surfaced.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError>;
}

/// Writes each event to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
        info!(
            appointment = %event.appointment_id,
            professional = %event.professional_id,
            old_status = event.old_status.map(|s| s.as_str()).unwrap_or("-"),
            new_status = event.new_status.as_str(),
            "appointment lifecycle event"
        );
        Ok(())
    }
}

/// Fans committed lifecycle events out to per-professional subscribers and
/// to every registered [`Notifier`].
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<LifecycleEvent>>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Subscribe to one professional's events. Creates the channel if needed.
    pub fn subscribe(&self, professional_id: Ulid) -> broadcast::Receiver<LifecycleEvent> {
        self.channels
            .entry(professional_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Dispatch without waiting. Each notifier runs on its own task.
    /// Must be called after the change is committed.
    pub fn send(&self, event: LifecycleEvent) {
        for notifier in &self.notifiers {
            let notifier = Arc::clone(notifier);
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&event).await {
                    warn!(
                        notifier = notifier.name(),
                        appointment = %event.appointment_id,
                        error = %e,
                        "notification dropped"
                    );
                    metrics::counter!(observability::NOTIFY_FAILURES_TOTAL, "notifier" => notifier.name())
                        .increment(1);
                }
            });
        }
        if let Some(sender) = self.channels.get(&event.professional_id) {
            let _ = sender.send(event);
        }
    }

    pub fn remove(&self, professional_id: &Ulid) {
        self.channels.remove(professional_id);
    }
}
