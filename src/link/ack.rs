use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

/// Status recorded by the transport when a frame is written successfully.
pub const STATUS_SENT: &str = "sent";
/// Status reported by the remote receiver once a message reached it.
pub const STATUS_DELIVERED: &str = "delivered";

/// Last-known delivery status for one message id.
#[derive(Debug, Clone, Serialize)]
pub struct AckRecord {
    pub status: String,
    pub observed_at: DateTime<Utc>,
    /// Whatever else the peer reported alongside the status (rssi, snr, ...),
    /// kept opaque for display.
    pub details: Value,
}

/// Concurrent map from message id to its most recent delivery status.
///
/// Written by the transport worker, read by the alert manager and status
/// callers. Last write wins; an ACK supersedes an ACK.
#[derive(Clone, Default)]
pub struct AckTracker {
    inner: Arc<RwLock<HashMap<i64, AckRecord>>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, message_id: i64, status: &str, details: Value) {
        let record = AckRecord {
            status: status.to_string(),
            observed_at: Utc::now(),
            details,
        };
        self.inner.write().await.insert(message_id, record);
    }

    pub async fn get(&self, message_id: i64) -> Option<AckRecord> {
        self.inner.read().await.get(&message_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
