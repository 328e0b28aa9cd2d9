//! Fire-and-forget notifications (emergency bypasses, processing errors).
//!
//! Publishers never block: `NotifierHandle` pushes onto a bounded channel
//! drained by a background thread, and a full channel drops the event and
//! counts it, like a backpressured push hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::EngineResult;
use crate::ids::SessionId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    EmergencyBypassed {
        session_id: SessionId,
        seq: u64,
        category: String,
        confidence: f64,
        timestamp: DateTime<Utc>,
        action: String,
    },
    ProcessingError {
        session_id: SessionId,
        seq: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl NotificationEvent {
    pub fn emergency_bypassed(
        session_id: SessionId,
        seq: u64,
        category: String,
        confidence: f64,
    ) -> Self {
        Self::EmergencyBypassed {
            session_id,
            seq,
            category,
            confidence,
            timestamp: Utc::now(),
            action: "bypassed".to_string(),
        }
    }

    pub fn processing_error(session_id: SessionId, seq: u64, error: impl ToString) -> Self {
        Self::ProcessingError {
            session_id,
            seq,
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmergencyBypassed { .. } => "emergency_bypassed",
            Self::ProcessingError { .. } => "processing_error",
        }
    }

    pub fn to_json(&self) -> Result<String, NotifyError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Where events end up (webhook, message bus, log...). May block.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Writes each event as a JSON log line.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let json = event.to_json()?;
        info!(kind = event.kind(), event = %json, "notification");
        Ok(())
    }
}

/// Non-blocking side used by the engine.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: NotificationEvent);

    /// Events lost to backpressure.
    fn dropped(&self) -> u64 {
        0
    }
}

pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: NotificationEvent) {}
}

/// Keeps every event in memory; handy for embedding and tests.
#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<NotificationEvent>>,
}

impl MemoryPublisher {
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn take(&self) -> Vec<NotificationEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventPublisher for MemoryPublisher {
    fn publish(&self, event: NotificationEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Clone)]
pub struct NotifierHandle {
    tx: Sender<NotificationEvent>,
    dropped: Arc<AtomicU64>,
}

impl NotifierHandle {
    /// Spawn the delivery thread. It exits when the last handle is dropped.
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> EngineResult<Self> {
        let (tx, rx) = bounded::<NotificationEvent>(capacity.max(1));
        thread::Builder::new()
            .name("anc-notifier".into())
            .spawn(move || {
                for event in rx.iter() {
                    if let Err(e) = sink.deliver(&event) {
                        warn!(kind = event.kind(), error = %e, "notification delivery failed");
                    }
                }
                debug!("notifier exiting");
            })?;
        Ok(Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl EventPublisher for NotifierHandle {
    fn publish(&self, event: NotificationEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(ev)) | Err(TrySendError::Disconnected(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = ev.kind(), "notification queue unavailable; dropping");
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
