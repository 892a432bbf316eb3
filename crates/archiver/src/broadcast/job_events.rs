//! Job availability events for idle workers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pipeline::model::JobKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job of `kind` became pending (new or re-queued).
    Enqueued { kind: JobKind, job_id: i64 },
}

impl JobEvent {
    pub fn kind(&self) -> JobKind {
        match self {
            JobEvent::Enqueued { kind, .. } => *kind,
        }
    }
}

/// Broadcasts [`JobEvent`]s. Workers use them to cut their idle backoff
/// short; missing one only delays a worker until its next poll.
#[derive(Clone)]
pub struct JobEventNotifier {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn enqueued(&self, kind: JobKind, job_id: i64) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(JobEvent::Enqueued { kind, job_id });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueued_reaches_subscriber() {
        let notifier = JobEventNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.enqueued(JobKind::EmbedRecord, 12);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), JobKind::EmbedRecord);
        assert_eq!(
            event,
            JobEvent::Enqueued {
                kind: JobKind::EmbedRecord,
                job_id: 12
            }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(JobEvent::Enqueued {
            kind: JobKind::OcrPage,
            job_id: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "enqueued");
        assert_eq!(json["kind"], "ocr_page");
    }
}
