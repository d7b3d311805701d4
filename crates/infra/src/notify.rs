//! Completion notifications.
//!
//! Published by the worker after a run reaches a terminal state. Delivery is
//! lossy: slow subscribers miss messages and nobody waits on them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use pricekeep_core::{JobId, JobRecord, JobStatus, JobType};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletion {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    /// Set on failures: whether the handler considered the error transient.
    pub retryable: Option<bool>,
}

impl JobCompletion {
    pub fn from_record(record: &JobRecord, retryable: Option<bool>) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type,
            status: record.status,
            finished_at: record.finished_at,
            result_summary: record.result_summary.clone(),
            error_message: record.error_message.clone(),
            retryable,
        }
    }
}

pub trait CompletionNotifier: Send + Sync {
    fn notify(&self, completion: JobCompletion);
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<JobCompletion>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobCompletion> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl CompletionNotifier for BroadcastNotifier {
    fn notify(&self, completion: JobCompletion) {
        // No subscribers is fine.
        let _ = self.tx.send(completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_completions() {
        let notifier = BroadcastNotifier::default();
        let mut rx = notifier.subscribe();

        let mut record = JobRecord::pending(JobId::new(), JobType::EmailSend, Utc::now(), None);
        record.start(Utc::now()).unwrap();
        record.succeed(Utc::now(), "sent").unwrap();
        notifier.notify(JobCompletion::from_record(&record, None));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.job_id, record.id);
        assert_eq!(got.status, JobStatus::Succeeded);

        let json = serde_json::to_value(&got).unwrap();
        assert_eq!(json["type"], "email_send");
        assert_eq!(json["resultSummary"], "sent");
    }

    #[test]
    fn notify_without_subscribers_is_a_no_op() {
        let notifier = BroadcastNotifier::new(1);
        let record = JobRecord::pending(JobId::new(), JobType::Backup, Utc::now(), None);
        notifier.notify(JobCompletion::from_record(&record, Some(true)));
    }
}
