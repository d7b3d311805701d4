//! Per-type worker loop.
//!
//! One [`Worker`] consumes one job type. For each delivery it:
//!
//! 1. records the job as `Pending` (idempotent on the job id)
//! 2. acks and skips redeliveries of jobs that already finished
//! 3. waits on the concurrency guard until no other run of its type is active
//! 4. resets progress, runs the handler, and forwards its progress updates
//!    while renewing the record lease and the queue entry on a ticker
//! 5. writes the terminal record and progress, acks, and notifies
//!
//! There are no retries of the job itself: a failure is recorded once and the
//! delivery is acked. Writing the terminal record is retried until it lands,
//! so a finished run is never left `Running`. A delivery is only left un-acked
//! when shutdown interrupts the guard wait or the terminal write, in which
//! case the broker hands it out again.
//!
//! A redelivery of a job whose run is still alive elsewhere waits on the guard
//! like any other job and is acked once that run finishes.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use pricekeep_core::{
    DomainError, ExecutionError, JobId, JobPayload, JobRecord, JobStatus, JobType, ProgressSnapshot,
};
use pricekeep_queue::{Delivery, JobQueue, QueueError};

use super::handler::JobHandler;
use super::reporter::ProgressForwarder;
use super::store::{JobRecordStore, JobStoreError, StartOutcome};
use crate::notify::{CompletionNotifier, JobCompletion};
use crate::progress::ProgressStore;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Wait between concurrency-guard checks while another run is active.
    pub guard_retry_interval: Duration,
    /// Pause after a queue or store error before receiving again.
    pub error_backoff: Duration,
    /// Upper bound on flushing a finished run's progress updates.
    pub drain_timeout: Duration,
    /// A running record without a heartbeat for this long counts as abandoned.
    pub lease: Duration,
    /// How often a run renews its lease and touches its queue entry.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            guard_retry_interval: Duration::from_millis(1000),
            error_backoff: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
            lease: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerSettings {
    pub fn with_guard_retry_interval(mut self, interval: Duration) -> Self {
        self.guard_retry_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Set the lease and heartbeat at a quarter of it.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self.heartbeat_interval = lease / 4;
        self
    }
}

/// Result of waiting on the concurrency guard.
enum Guard {
    Acquired(JobRecord),
    /// The record turned terminal while waiting (its live run finished elsewhere).
    Finished(JobRecord),
    Interrupted,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Succeeded,
    Failed(ExecutionError),
    /// Redelivery of a job that had already reached this terminal status.
    Skipped(JobStatus),
    /// Shutdown arrived before the run could start or be recorded; the
    /// delivery was not acked.
    Deferred,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Record(#[from] DomainError),
}

/// Handle to control and join a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    job_type: JobType,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop receiving and wait for an in-flight run to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(worker = self.job_type.as_str(), error = %e, "worker task ended abnormally");
        }
    }
}

pub struct Worker {
    job_type: JobType,
    handler: Arc<dyn JobHandler>,
    queue: Arc<dyn JobQueue>,
    records: Arc<dyn JobRecordStore>,
    progress: Arc<dyn ProgressStore>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        handler: Arc<dyn JobHandler>,
        queue: Arc<dyn JobQueue>,
        records: Arc<dyn JobRecordStore>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            job_type: handler.job_type(),
            handler,
            queue,
            records,
            progress,
            notifier: None,
            settings: WorkerSettings::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Tie this worker to an external shutdown signal (e.g. one token per process).
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn spawn(self) -> WorkerHandle {
        let job_type = self.job_type;
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(self.run());
        WorkerHandle {
            job_type,
            shutdown,
            join,
        }
    }

    /// Receive and process deliveries until shutdown or queue closure.
    pub async fn run(self) {
        let worker = self.job_type.as_str();
        info!(worker, "worker started");

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.queue.receive(self.job_type) => received,
            };

            match received {
                Ok(delivery) => {
                    if let Err(e) = self.process(delivery).await {
                        error!(worker, error = %e, "failed to process delivery");
                        if !self.pause(self.settings.error_backoff).await {
                            break;
                        }
                    }
                }
                Err(QueueError::Closed) => break,
                Err(e) => {
                    warn!(worker, error = %e, "queue receive failed");
                    if !self.pause(self.settings.error_backoff).await {
                        break;
                    }
                }
            }
        }

        info!(worker, "worker stopped");
    }

    /// Run one delivery through the full lifecycle.
    pub async fn process(&self, delivery: Delivery) -> Result<ProcessOutcome, WorkerError> {
        let span = info_span!(
            "job",
            job_id = %delivery.id(),
            job_type = %delivery.job.job_type,
            attempt = delivery.attempt
        );
        self.process_inner(delivery).instrument(span).await
    }

    async fn process_inner(&self, delivery: Delivery) -> Result<ProcessOutcome, WorkerError> {
        let id = delivery.id();

        if delivery.job.job_type != self.job_type {
            error!(expected = %self.job_type, "delivery routed to the wrong worker; dropping it");
            self.queue.ack(&delivery).await?;
            return Ok(ProcessOutcome::Failed(ExecutionError::fatal(
                "job delivered to a worker of another type",
            )));
        }

        let summary = JobPayload::parse(self.job_type, &delivery.job.payload)
            .ok()
            .map(|p| p.summary());
        let record = self
            .records
            .ensure_pending(JobRecord::pending(id, self.job_type, Utc::now(), summary))
            .await?;

        if record.status.is_terminal() {
            info!(status = %record.status, "job already finished; acking redelivery");
            self.queue.ack(&delivery).await?;
            return Ok(ProcessOutcome::Skipped(record.status));
        }

        let mut record = match self.acquire_guard(id).await? {
            Guard::Acquired(record) => record,
            Guard::Finished(record) => {
                info!(status = %record.status, "job finished on another worker; acking redelivery");
                self.queue.ack(&delivery).await?;
                return Ok(ProcessOutcome::Skipped(record.status));
            }
            Guard::Interrupted => {
                info!("shutdown while waiting for the concurrency guard; leaving job queued");
                return Ok(ProcessOutcome::Deferred);
            }
        };

        let started_at = record.started_at.unwrap_or_else(Utc::now);
        if let Err(e) = self
            .progress
            .set(id, ProgressSnapshot::preparing(id, self.job_type, started_at))
            .await
        {
            warn!(error = %e, "failed to reset progress");
        }

        info!("job started");
        let result = self.execute(id, &delivery).await;

        let finished_at = Utc::now();
        let (outcome, retryable) = match result {
            Ok(output) => {
                record.succeed(finished_at, output.summary)?;
                let info = (!output.info.is_empty()).then_some(output.info);
                self.write_terminal_progress(id, |snap| snap.complete(finished_at, info))
                    .await;
                (ProcessOutcome::Succeeded, None)
            }
            Err(err) => {
                record.fail(finished_at, err.reason.clone())?;
                let reason = err.reason.clone();
                self.write_terminal_progress(id, |snap| snap.fail(finished_at, reason))
                    .await;
                let retryable = err.retryable;
                (ProcessOutcome::Failed(err), Some(retryable))
            }
        };

        if !self.finish_record(&record).await? {
            info!("shutdown before the terminal record was written; leaving job queued");
            return Ok(ProcessOutcome::Deferred);
        }
        self.queue.ack(&delivery).await?;

        let duration_ms = record.duration().map(|d| d.num_milliseconds()).unwrap_or(0);
        match &outcome {
            ProcessOutcome::Failed(err) => warn!(
                duration_ms,
                retryable = err.retryable,
                error = %err.reason,
                "job failed"
            ),
            _ => info!(duration_ms, "job succeeded"),
        }

        if let Some(notifier) = &self.notifier {
            notifier.notify(JobCompletion::from_record(&record, retryable));
        }

        Ok(outcome)
    }

    /// Loop on the concurrency guard until this run owns it.
    async fn acquire_guard(&self, id: JobId) -> Result<Guard, WorkerError> {
        loop {
            let outcome = self
                .records
                .try_start(id, self.job_type, Utc::now(), self.settings.lease)
                .await?;
            match outcome {
                StartOutcome::Started(record) => return Ok(Guard::Acquired(record)),
                StartOutcome::Resumed(record) => {
                    warn!("job was abandoned by an earlier worker; running it again");
                    return Ok(Guard::Acquired(record));
                }
                StartOutcome::Finished(record) => return Ok(Guard::Finished(record)),
                StartOutcome::Busy { running } if running == Some(id) => {
                    debug!("job is still running on another worker; waiting");
                }
                StartOutcome::Busy { running } => {
                    debug!(
                        running = ?running.map(|r| r.to_string()),
                        "another run of this type is active; waiting"
                    );
                }
            }
            if !self.pause(self.settings.guard_retry_interval).await {
                return Ok(Guard::Interrupted);
            }
        }
    }

    /// Persist the terminal record, retrying storage errors until shutdown.
    /// Returns `false` when shutdown came first.
    async fn finish_record(&self, record: &JobRecord) -> Result<bool, WorkerError> {
        loop {
            match self.records.finish(record).await {
                Ok(()) => return Ok(true),
                Err(JobStoreError::Storage(e)) => {
                    warn!(error = %e, "failed to write terminal record; retrying");
                    if !self.pause(self.settings.error_backoff).await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run the handler on its own task so a panic becomes an ordinary failure.
    ///
    /// While it runs, the record lease and the queue entry are renewed every
    /// `heartbeat_interval`.
    async fn execute(
        &self,
        id: JobId,
        delivery: &Delivery,
    ) -> Result<super::handler::JobOutput, ExecutionError> {
        let (reporter, forwarder) = ProgressForwarder::spawn(id, self.progress.clone());
        let handler = self.handler.clone();
        let payload = delivery.job.payload.clone();

        let mut task = tokio::spawn(async move { handler.execute(&payload, &reporter).await });
        let period = self.settings.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                _ = ticker.tick() => self.heartbeat(id, delivery).await,
            }
        };
        forwarder.drain(self.settings.drain_timeout).await;

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ExecutionError::fatal(format!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(ExecutionError::fatal(format!("handler task failed: {e}"))),
        }
    }

    async fn heartbeat(&self, id: JobId, delivery: &Delivery) {
        match self.records.heartbeat(id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => warn!("record is no longer running; lease not renewed"),
            Err(e) => warn!(error = %e, "failed to renew record lease"),
        }
        if let Err(e) = self.queue.touch(delivery).await {
            warn!(error = %e, "failed to touch queue entry");
        }
    }

    async fn write_terminal_progress(&self, id: JobId, finish: impl FnOnce(&mut ProgressSnapshot)) {
        let mut snapshot = match self.progress.get(id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!("progress view belongs to a newer run; skipping terminal progress");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read progress");
                return;
            }
        };
        finish(&mut snapshot);
        if let Err(e) = self.progress.set(id, snapshot).await {
            warn!(error = %e, "failed to write terminal progress");
        }
    }

    /// Sleep unless shutdown comes first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;
    use pricekeep_core::{JobRequest, JsonMap, ProgressStatus};
    use pricekeep_queue::InMemoryJobQueue;
    use tokio::sync::Notify;

    use crate::jobs::handler::JobOutput;
    use crate::jobs::reporter::ProgressReporter;
    use crate::jobs::store::{InMemoryJobRecordStore, RecordFilter};
    use crate::progress::KeyedProgressStore;

    struct Scripted {
        result: Result<JobOutput, ExecutionError>,
    }

    #[async_trait]
    impl JobHandler for Scripted {
        fn job_type(&self) -> JobType {
            JobType::Backup
        }

        async fn execute(
            &self,
            _payload: &JsonMap,
            report: &ProgressReporter,
        ) -> Result<JobOutput, ExecutionError> {
            report.running(50, "halfway");
            self.result.clone()
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        fn job_type(&self) -> JobType {
            JobType::Backup
        }

        async fn execute(
            &self,
            _payload: &JsonMap,
            _report: &ProgressReporter,
        ) -> Result<JobOutput, ExecutionError> {
            panic!("disk on fire")
        }
    }

    /// Parks until released.
    struct Parked {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for Parked {
        fn job_type(&self) -> JobType {
            JobType::Backup
        }

        async fn execute(
            &self,
            _payload: &JsonMap,
            _report: &ProgressReporter,
        ) -> Result<JobOutput, ExecutionError> {
            self.release.notified().await;
            Ok(JobOutput::new("released"))
        }
    }

    /// Fails the first `failures` terminal writes with a storage error.
    struct FlakyFinish {
        inner: Arc<InMemoryJobRecordStore>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobRecordStore for FlakyFinish {
        async fn ensure_pending(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
            self.inner.ensure_pending(record).await
        }

        async fn try_start(
            &self,
            id: JobId,
            job_type: JobType,
            at: DateTime<Utc>,
            lease: Duration,
        ) -> Result<StartOutcome, JobStoreError> {
            self.inner.try_start(id, job_type, at, lease).await
        }

        async fn heartbeat(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
            self.inner.heartbeat(id, at).await
        }

        async fn finish(&self, record: &JobRecord) -> Result<(), JobStoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(JobStoreError::Storage("connection reset".to_string()));
            }
            self.inner.finish(record).await
        }

        async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
            self.inner.get(id).await
        }

        async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.list(filter).await
        }
    }

    struct Fixture {
        queue: Arc<InMemoryJobQueue>,
        records: Arc<InMemoryJobRecordStore>,
        progress: Arc<KeyedProgressStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                queue: Arc::new(InMemoryJobQueue::new()),
                records: InMemoryJobRecordStore::arc(),
                progress: Arc::new(KeyedProgressStore::new()),
            }
        }

        fn worker(&self, handler: impl JobHandler + 'static) -> Worker {
            Worker::new(
                Arc::new(handler),
                self.queue.clone(),
                self.records.clone(),
                self.progress.clone(),
            )
        }

        async fn deliver(&self) -> Delivery {
            self.queue
                .push(JobRequest::new(JobType::Backup, JsonMap::new()))
                .await
                .unwrap();
            self.queue.receive(JobType::Backup).await.unwrap()
        }
    }

    #[tokio::test]
    async fn success_writes_terminal_record_and_progress() {
        let fx = Fixture::new();
        let worker = fx.worker(Scripted {
            result: Ok(JobOutput::new("3 tables").with_info("tables", 3)),
        });
        let delivery = fx.deliver().await;
        let id = delivery.id();

        assert_eq!(worker.process(delivery).await.unwrap(), ProcessOutcome::Succeeded);

        let record = fx.records.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.result_summary.as_deref(), Some("3 tables"));
        assert_eq!(record.payload_summary.as_deref(), Some("full backup"));
        assert!(record.finished_at >= record.started_at);

        let snap = fx.progress.get(id).await.unwrap().unwrap();
        assert_eq!(snap.status, ProgressStatus::Completed);
        assert_eq!(snap.percent, 100);
        assert_eq!(snap.result_info.unwrap()["tables"], 3);
        assert_eq!(fx.queue.in_flight(JobType::Backup), 0);
    }

    #[tokio::test]
    async fn failure_is_recorded_not_retried() {
        let fx = Fixture::new();
        let worker = fx.worker(Scripted {
            result: Err(ExecutionError::retryable("storage offline")),
        });
        let delivery = fx.deliver().await;
        let id = delivery.id();

        let outcome = worker.process(delivery).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Failed(ExecutionError::retryable("storage offline"))
        );

        let record = fx.records.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("storage offline"));

        let snap = fx.progress.get(id).await.unwrap().unwrap();
        assert_eq!(snap.status, ProgressStatus::Error);
        assert_eq!(snap.percent, 50);
        assert!(fx.queue.is_empty(JobType::Backup));
        assert_eq!(fx.queue.in_flight(JobType::Backup), 0);
    }

    #[tokio::test]
    async fn handler_panic_becomes_a_fatal_failure() {
        let fx = Fixture::new();
        let worker = fx.worker(Panicking);
        let delivery = fx.deliver().await;
        let id = delivery.id();

        match worker.process(delivery).await.unwrap() {
            ProcessOutcome::Failed(err) => {
                assert!(!err.retryable);
                assert!(err.reason.contains("disk on fire"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let record = fx.records.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn redelivery_of_finished_job_is_skipped() {
        let fx = Fixture::new();
        let worker = fx.worker(Scripted {
            result: Ok(JobOutput::new("done")),
        });
        let delivery = fx.deliver().await;
        let id = delivery.id();

        worker.process(delivery.clone()).await.unwrap();
        let before = fx.records.get(id).await.unwrap().unwrap();

        assert_eq!(
            worker.process(delivery).await.unwrap(),
            ProcessOutcome::Skipped(JobStatus::Succeeded)
        );
        assert_eq!(fx.records.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn shutdown_during_guard_wait_defers_the_delivery() {
        let fx = Fixture::new();

        // Occupy the guard with a run that never finishes.
        let blocker = JobRecord::pending(JobId::new(), JobType::Backup, Utc::now(), None);
        fx.records.ensure_pending(blocker.clone()).await.unwrap();
        fx.records
            .try_start(blocker.id, JobType::Backup, Utc::now(), Duration::from_secs(60))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let worker = fx
            .worker(Scripted {
                result: Ok(JobOutput::new("never")),
            })
            .with_settings(
                WorkerSettings::default().with_guard_retry_interval(Duration::from_millis(10)),
            )
            .with_shutdown(shutdown.clone());
        let delivery = fx.deliver().await;
        let id = delivery.id();

        let task = tokio::spawn(async move { worker.process(delivery).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        assert_eq!(task.await.unwrap().unwrap(), ProcessOutcome::Deferred);
        assert_eq!(
            fx.records.get(id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(fx.queue.in_flight(JobType::Backup), 1);
    }

    #[tokio::test]
    async fn terminal_record_write_is_retried_until_it_lands() {
        let fx = Fixture::new();
        let records = Arc::new(FlakyFinish {
            inner: fx.records.clone(),
            failures: AtomicU32::new(2),
        });
        let worker = Worker::new(
            Arc::new(Scripted {
                result: Ok(JobOutput::new("3 tables")),
            }),
            fx.queue.clone(),
            records.clone(),
            fx.progress.clone(),
        )
        .with_settings(WorkerSettings::default().with_error_backoff(Duration::from_millis(5)));
        let delivery = fx.deliver().await;
        let id = delivery.id();

        assert_eq!(worker.process(delivery).await.unwrap(), ProcessOutcome::Succeeded);
        assert_eq!(records.failures.load(Ordering::SeqCst), 0);
        assert_eq!(
            fx.records.get(id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(fx.queue.in_flight(JobType::Backup), 0);
    }

    #[tokio::test]
    async fn shutdown_during_terminal_write_retry_leaves_the_delivery_unacked() {
        let fx = Fixture::new();
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            Arc::new(Scripted {
                result: Ok(JobOutput::new("ok")),
            }),
            fx.queue.clone(),
            Arc::new(FlakyFinish {
                inner: fx.records.clone(),
                failures: AtomicU32::new(u32::MAX),
            }),
            fx.progress.clone(),
        )
        .with_settings(WorkerSettings::default().with_error_backoff(Duration::from_millis(5)))
        .with_shutdown(shutdown.clone());
        let delivery = fx.deliver().await;

        let task = tokio::spawn(async move { worker.process(delivery).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        assert_eq!(task.await.unwrap().unwrap(), ProcessOutcome::Deferred);
        assert_eq!(fx.queue.in_flight(JobType::Backup), 1);
    }

    #[tokio::test]
    async fn long_run_keeps_its_lease_alive() {
        let fx = Fixture::new();
        let release = Arc::new(Notify::new());
        let lease = Duration::from_millis(80);
        let worker = fx
            .worker(Parked {
                release: release.clone(),
            })
            .with_settings(WorkerSettings::default().with_lease(lease));
        let delivery = fx.deliver().await;
        let id = delivery.id();

        let task = tokio::spawn(async move { worker.process(delivery).await });

        // Well past the lease, yet the run still holds the guard for itself.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            fx.records
                .try_start(id, JobType::Backup, Utc::now(), lease)
                .await
                .unwrap(),
            StartOutcome::Busy { running: Some(id) }
        );

        release.notify_one();
        assert_eq!(task.await.unwrap().unwrap(), ProcessOutcome::Succeeded);
    }

    #[tokio::test]
    async fn spawned_worker_stops_on_shutdown() {
        let fx = Fixture::new();
        let handle = fx
            .worker(Scripted {
                result: Ok(JobOutput::new("ok")),
            })
            .spawn();
        assert_eq!(handle.job_type(), JobType::Backup);

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }
}
