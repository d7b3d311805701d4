//! In-memory job queue for tests/dev and the single-process mode.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use pricekeep_core::{JobRequest, JobType};

use crate::envelope::{Delivery, QueuedJob};
use crate::queue::{JobQueue, QueueError};

#[derive(Debug, Default)]
struct Lane {
    ready: VecDeque<(QueuedJob, u32)>,
    in_flight: HashMap<String, (QueuedJob, u32)>,
}

/// In-memory queue with one FIFO lane per job type.
///
/// - No IO, nothing survives the process
/// - Unacked deliveries stay in flight until [`requeue_unacked`](Self::requeue_unacked)
/// - `receive` parks on a per-type [`Notify`] instead of polling
#[derive(Debug)]
pub struct InMemoryJobQueue {
    lanes: Mutex<HashMap<JobType, Lane>>,
    signals: HashMap<JobType, Notify>,
    closed: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs waiting to be handed out.
    pub fn len(&self, job_type: JobType) -> usize {
        self.lanes
            .lock()
            .map(|lanes| lanes.get(&job_type).map_or(0, |l| l.ready.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, job_type: JobType) -> bool {
        self.len(job_type) == 0
    }

    /// Deliveries handed out but not yet acked.
    pub fn in_flight(&self, job_type: JobType) -> usize {
        self.lanes
            .lock()
            .map(|lanes| lanes.get(&job_type).map_or(0, |l| l.in_flight.len()))
            .unwrap_or(0)
    }

    /// Put every unacked delivery of `job_type` back at the head of its lane,
    /// as a broker does when a consumer restarts.
    pub fn requeue_unacked(&self, job_type: JobType) -> Result<usize, QueueError> {
        let mut lanes = self.lock()?;
        let lane = lanes.entry(job_type).or_default();

        let mut pending: Vec<(QueuedJob, u32)> = lane.in_flight.drain().map(|(_, v)| v).collect();
        pending.sort_by_key(|(job, _)| job.id);
        let count = pending.len();
        for entry in pending.into_iter().rev() {
            lane.ready.push_front(entry);
        }
        drop(lanes);

        for _ in 0..count {
            self.signal(job_type).notify_one();
        }
        Ok(count)
    }

    /// Stop handing out jobs; pending and future `receive` calls return [`QueueError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for signal in self.signals.values() {
            signal.notify_waiters();
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<JobType, Lane>>, QueueError> {
        self.lanes
            .lock()
            .map_err(|_| QueueError::Unavailable("in-memory queue lock poisoned".to_string()))
    }

    fn signal(&self, job_type: JobType) -> &Notify {
        // Every JobType has a signal; see Default.
        &self.signals[&job_type]
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            signals: JobType::ALL.into_iter().map(|t| (t, Notify::new())).collect(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, request: JobRequest) -> Result<QueuedJob, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let job = QueuedJob::assign(request);
        {
            let mut lanes = self.lock()?;
            lanes
                .entry(job.job_type)
                .or_default()
                .ready
                .push_back((job.clone(), 1));
        }
        self.signal(job.job_type).notify_one();

        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "job queued");
        Ok(job)
    }

    async fn receive(&self, job_type: JobType) -> Result<Delivery, QueueError> {
        loop {
            let notified = self.signal(job_type).notified();

            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }

            {
                let mut lanes = self.lock()?;
                let lane = lanes.entry(job_type).or_default();
                if let Some((job, attempt)) = lane.ready.pop_front() {
                    let receipt = job.id.to_string();
                    lane.in_flight.insert(receipt.clone(), (job.clone(), attempt + 1));
                    return Ok(Delivery {
                        job,
                        receipt,
                        attempt,
                    });
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut lanes = self.lock()?;
        if let Some(lane) = lanes.get_mut(&delivery.job.job_type) {
            lane.in_flight.remove(&delivery.receipt);
        }
        Ok(())
    }
}
