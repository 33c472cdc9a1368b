//! Spoof alert dispatch.
//!
//! The engine hands alerts to an injected [`AlertDispatcher`] and never waits
//! on delivery. The daemon's dispatcher queues alerts for a delivery task that
//! fans each one out to every registered supervisor as a D-Bus signal.

use crate::config::Supervisor;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use turnstile_core::SpoofAlert;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("alert queue is full")]
    QueueFull,
    #[error("alert delivery task has stopped")]
    Closed,
}

/// Fire-and-forget sink for spoof alerts.
pub trait AlertDispatcher: Send + Sync {
    fn dispatch(&self, alert: SpoofAlert) -> Result<(), AlertError>;
}

/// Queues alerts on a bounded channel without blocking the scan path.
pub struct QueuedAlertDispatcher {
    tx: mpsc::Sender<SpoofAlert>,
}

impl QueuedAlertDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SpoofAlert>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AlertDispatcher for QueuedAlertDispatcher {
    fn dispatch(&self, alert: SpoofAlert) -> Result<(), AlertError> {
        self.tx.try_send(alert).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AlertError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AlertError::Closed,
        })
    }
}

/// Final hop for one alert to one supervisor.
pub trait AlertSink {
    fn deliver(
        &self,
        supervisor: &Supervisor,
        alert: &SpoofAlert,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Drain the alert queue until every sender is dropped.
///
/// Failures are logged per supervisor and never retried.
pub async fn run_delivery<S: AlertSink>(
    mut rx: mpsc::Receiver<SpoofAlert>,
    supervisors: Vec<Supervisor>,
    sink: S,
) {
    if supervisors.is_empty() {
        tracing::warn!("no supervisors registered; spoof alerts will only be logged");
    }
    while let Some(alert) = rx.recv().await {
        tracing::warn!(
            subject = %alert.subject_id,
            device = alert.device_id.as_deref().unwrap_or("-"),
            at = %alert.detected_at,
            "spoof attempt detected"
        );
        for supervisor in &supervisors {
            if let Err(err) = sink.deliver(supervisor, &alert).await {
                tracing::warn!(
                    supervisor = %supervisor.name,
                    error = %err,
                    "spoof alert delivery failed"
                );
            }
        }
    }
    tracing::info!("alert delivery task exiting");
}
