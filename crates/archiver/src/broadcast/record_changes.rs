//! Record status change notifier for live UI subscribers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pipeline::model::RecordStatus;

/// One record status transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    pub record_id: i64,
    /// `None` when the record was just created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<RecordStatus>,
    pub to: RecordStatus,
    pub at: DateTime<Utc>,
}

/// Fans record transitions out to every current subscriber.
///
/// Delivery is best-effort: sending with no subscribers is fine, new
/// subscribers only see future changes, and a subscriber that falls more
/// than `capacity` messages behind loses the oldest ones
/// (`RecvError::Lagged`) and should re-read state.
#[derive(Clone)]
pub struct RecordChangeNotifier {
    sender: Arc<broadcast::Sender<RecordChange>>,
}

impl RecordChangeNotifier {
    /// Creates a new notifier with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn notify(&self, change: RecordChange) {
        log::debug!(
            "Record {} changed {} -> {}",
            change.record_id,
            change.from.map(|s| s.as_str()).unwrap_or("-"),
            change.to
        );
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RecordChangeNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}
