//! The job store: durable jobs, queue entries, counters and topics behind
//! one set of operations that are safe under concurrent callers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use pusher_core::{
    Counter, Job, JobId, JobStatus, PartitionKey, Priority, QueueEntry, RetryPolicy, StoreEvent,
    Topic, TopicError, Worker, validate_payload_type,
};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use crate::repositories::{
    CounterRepository, JobFilter, JobPage, JobRepository, QueueRepository, TopicRepository,
};
use crate::{Database, DbConfig, DbError, connect, init_schema};

const EVENT_CAPACITY: usize = 256;

/// Timing policy applied by the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Floor for the delay before a failed job is re-queued.
    pub min_retry_delay: Duration,
    /// How long a successful job is kept before purging.
    pub success_ttl: Duration,
    /// How long a failed job is kept before purging.
    pub failure_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            min_retry_delay: Duration::from_secs(5),
            success_ttl: Duration::from_secs(24 * 60 * 60),
            failure_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// What `done_job` did with a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    Succeeded,
    /// The job is pending again and re-enters its partition after `delay`.
    RetryScheduled { delay: Duration },
    Failed,
    /// The job was erased or already terminal; nothing was written.
    Discarded,
}

/// A job together with its place in the queue.
#[derive(Debug, Clone)]
pub struct JobDetail {
    pub job: Job,
    /// Present while the job is pending or running.
    pub entry: Option<QueueEntry>,
    /// Unclaimed entries ahead of this job in its partition.
    pub waiting: u64,
}

/// Durable job and topic store.
///
/// Clones share the connection, the event channel and the write lock.
#[derive(Clone)]
pub struct JobStore {
    topics: TopicRepository,
    jobs: JobRepository,
    queue: QueueRepository,
    counters: CounterRepository,
    events: broadcast::Sender<StoreEvent>,
    write_lock: Arc<Mutex<()>>,
    /// Running jobs an operator asked to cancel, until their attempt completes.
    abort_requests: Arc<Mutex<HashSet<JobId>>>,
    config: StoreConfig,
}

impl JobStore {
    /// Connect using `db_config`, then open the store.
    pub async fn connect(db_config: &DbConfig, config: StoreConfig) -> Result<Self, DbError> {
        let db = connect(db_config).await?;
        Self::open(db, config).await
    }

    /// Ensure the schema and run restart recovery before handing out the store.
    pub async fn open(db: Database, config: StoreConfig) -> Result<Self, DbError> {
        init_schema(&db).await?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            topics: TopicRepository::new(db.clone()),
            jobs: JobRepository::new(db.clone()),
            queue: QueueRepository::new(db.clone()),
            counters: CounterRepository::new(db),
            events,
            write_lock: Arc::new(Mutex::new(())),
            abort_requests: Arc::new(Mutex::new(HashSet::new())),
            config,
        };

        store.recover().await?;
        Ok(store)
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        debug!("{}", event.description());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ---- jobs ----

    /// Enqueue a job and return its ID.
    ///
    /// The partition's sequence is allocated first; the job and its queue
    /// entry are only written once that succeeded.
    pub async fn append_job(
        &self,
        payload: impl Into<Vec<u8>>,
        topic: &str,
        priority: u8,
        payload_type: Option<String>,
        no_retry: bool,
    ) -> Result<JobId, DbError> {
        let priority = Priority::try_from(priority)?;
        if topic.trim().is_empty() {
            return Err(TopicError::EmptyName.into());
        }
        if let Some(payload_type) = &payload_type {
            validate_payload_type(payload_type)?;
        }

        let job = Job::new(topic, payload)
            .with_priority(priority)
            .with_payload_type(payload_type)
            .with_no_retry(no_retry);
        let partition = job.partition();

        let guard = self.write_lock.lock().await;
        let seq = self.counters.allocate(&partition).await?;
        let entry = QueueEntry {
            job_id: job.id,
            partition: partition.to_string(),
            topic: job.topic.clone(),
            priority,
            seq,
            working: false,
        };
        self.jobs.create_with_entry(&job, &entry).await?;
        drop(guard);

        info!("Enqueued job {} in {} at seq {}", job.id, partition, seq);
        self.emit(StoreEvent::QueueChanged {
            partition: Some(partition),
        });

        Ok(job.id)
    }

    /// Claim the next job of a topic, marking it running.
    ///
    /// Partitions are scanned in priority order 0, 1, 2 and each is drained
    /// lowest sequence first. Stale entries are dropped along the way.
    pub async fn next_job(&self, topic: &str) -> Result<Option<Job>, DbError> {
        let guard = self.write_lock.lock().await;

        for partition in PartitionKey::all_for(topic) {
            while let Some(candidate) = self.queue.first_unclaimed(&partition).await? {
                let Some(entry) = self.queue.claim(candidate.job_id).await? else {
                    continue;
                };
                self.counters.mark_running(&partition, entry.seq).await?;

                match self.jobs.get(entry.job_id).await? {
                    Some(mut job) if job.status == JobStatus::Pending => {
                        job.status = JobStatus::Running;
                        self.jobs.replace(&job).await?;
                        drop(guard);

                        debug!("Claimed job {} from {} at seq {}", job.id, partition, entry.seq);
                        self.emit(StoreEvent::QueueChanged {
                            partition: Some(partition),
                        });
                        return Ok(Some(job));
                    }
                    stale => {
                        warn!(
                            "Discarding stale queue entry {} in {} (job {})",
                            entry.seq,
                            partition,
                            stale.map(|j| j.status.as_str()).unwrap_or("missing")
                        );
                        self.queue.delete(entry.job_id).await?;
                        self.counters.advance_done(&partition, entry.seq).await?;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Record the worker a claimed job was dispatched to.
    pub async fn assign_job(&self, job_id: JobId, worker: &Worker) -> Result<Option<Job>, DbError> {
        let _guard = self.write_lock.lock().await;

        let Some(mut job) = self.jobs.get(job_id).await? else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.worker = Some(worker.clone());
        self.jobs.replace(&job).await?;

        Ok(Some(job))
    }

    /// Give a job's queue entry a fresh sequence and make it claimable.
    ///
    /// Returns false when the job has no entry any more (aborted meanwhile).
    pub async fn retry_job(
        &self,
        job_id: JobId,
        partition: &PartitionKey,
    ) -> Result<bool, DbError> {
        let guard = self.write_lock.lock().await;

        if self.queue.get(job_id).await?.is_none() {
            return Ok(false);
        }
        let seq = self.counters.allocate(partition).await?;
        self.queue.requeue(job_id, seq).await?;
        drop(guard);

        info!("Re-queued job {} in {} at seq {}", job_id, partition, seq);
        self.emit(StoreEvent::QueueChanged {
            partition: Some(partition.clone()),
        });

        Ok(true)
    }

    /// Persist the result of a finished attempt.
    ///
    /// `job` carries the captured output. On a retryable failure the job is
    /// set back to pending and re-queued by a timer after
    /// `max(min_retry_delay, policy.backoff)`; the timer does not survive a
    /// restart, recovery picks the job up instead.
    pub async fn done_job(
        &self,
        job: &Job,
        policy: &RetryPolicy,
        is_success: bool,
        no_retry: bool,
    ) -> Result<DoneOutcome, DbError> {
        let guard = self.write_lock.lock().await;
        self.abort_requests.lock().await.remove(&job.id);

        let Some(mut stored) = self.jobs.get(job.id).await? else {
            debug!("Job {} finished after it was erased", job.id);
            return Ok(DoneOutcome::Discarded);
        };
        if stored.status.is_terminal() {
            debug!("Job {} finished after it became {}", job.id, stored.status);
            return Ok(DoneOutcome::Discarded);
        }

        stored.output = job.output.clone();
        stored.content_type = job.content_type.clone();
        stored.content_encoding = job.content_encoding.clone();
        if job.worker.is_some() {
            stored.worker = job.worker.clone();
        }

        let partition = stored.partition();
        let entry = self.queue.get(job.id).await?;

        let outcome = if is_success {
            stored.status = JobStatus::Success;
            stored.expire = expiry(self.config.success_ttl);
            DoneOutcome::Succeeded
        } else if !no_retry && !stored.no_retry && stored.retried < policy.retries {
            stored.retried += 1;
            stored.status = JobStatus::Pending;
            stored.expire = None;
            DoneOutcome::RetryScheduled {
                delay: self.config.min_retry_delay.max(policy.backoff),
            }
        } else {
            stored.status = JobStatus::Failure;
            stored.expire = expiry(self.config.failure_ttl);
            DoneOutcome::Failed
        };

        self.jobs.replace(&stored).await?;
        if !matches!(outcome, DoneOutcome::RetryScheduled { .. }) {
            self.queue.delete(job.id).await?;
        }
        if let Some(entry) = &entry {
            self.counters.advance_done(&partition, entry.seq).await?;
        }
        drop(guard);

        match outcome {
            DoneOutcome::RetryScheduled { delay } => {
                info!(
                    "Job {} failed, retry {}/{} in {:?}",
                    stored.id, stored.retried, policy.retries, delay
                );
                self.schedule_retry(stored.id, partition.clone(), delay);
            }
            _ => info!("Job {} finished: {}", stored.id, stored.status),
        }

        self.emit(StoreEvent::QueueChanged {
            partition: Some(partition),
        });

        Ok(outcome)
    }

    fn schedule_retry(&self, job_id: JobId, partition: PartitionKey, delay: Duration) {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match store.retry_job(job_id, &partition).await {
                Ok(true) => {}
                Ok(false) => debug!("Job {} left the queue before its retry", job_id),
                Err(e) => error!("Failed to re-queue job {}: {}", job_id, e),
            }
        });
    }

    /// Cancel a job.
    ///
    /// A pending job fails at once; with `erase` every trace is deleted. A
    /// running job is left to the scheduler, which is signalled to cancel the
    /// call and fail it. Returns false for unknown or already finished jobs.
    pub async fn abort_job(&self, job_id: JobId, erase: bool) -> Result<bool, DbError> {
        let guard = self.write_lock.lock().await;

        let Some(mut job) = self.jobs.get(job_id).await? else {
            return Ok(false);
        };
        let partition = job.partition();

        if erase {
            let entry = self.queue.get(job_id).await?;
            self.jobs.delete_with_entry(job_id).await?;
            if job.status == JobStatus::Running {
                self.abort_requests.lock().await.insert(job_id);
            }
            if let Some(entry) = entry {
                self.counters.advance_done(&partition, entry.seq).await?;
            }
            drop(guard);

            info!("Erased job {}", job_id);
            self.emit(StoreEvent::JobAborted { job_id });
            self.emit(StoreEvent::QueueChanged {
                partition: Some(partition),
            });
            return Ok(true);
        }

        match job.status {
            JobStatus::Pending => {
                job.status = JobStatus::Failure;
                job.expire = expiry(self.config.failure_ttl);
                self.jobs.replace(&job).await?;
                if let Some(entry) = self.queue.delete(job_id).await? {
                    self.counters.advance_done(&partition, entry.seq).await?;
                }
                drop(guard);

                info!("Aborted pending job {}", job_id);
                self.emit(StoreEvent::QueueChanged {
                    partition: Some(partition),
                });
                Ok(true)
            }
            JobStatus::Running => {
                self.abort_requests.lock().await.insert(job_id);
                drop(guard);
                info!("Abort requested for running job {}", job_id);
                self.emit(StoreEvent::JobAborted { job_id });
                Ok(true)
            }
            JobStatus::Success | JobStatus::Failure => Ok(false),
        }
    }

    /// Running jobs whose cancellation was requested and whose attempt has
    /// not completed yet.
    pub async fn pending_aborts(&self) -> HashSet<JobId> {
        self.abort_requests.lock().await.clone()
    }

    /// Release every claim left over from a previous run.
    ///
    /// Returns the number of queue entries made claimable again.
    pub async fn recover(&self) -> Result<usize, DbError> {
        let guard = self.write_lock.lock().await;
        self.abort_requests.lock().await.clear();
        let released = self.queue.release_all().await?;
        let reset = self.jobs.reset_running().await?;
        drop(guard);

        if !released.is_empty() || reset > 0 {
            info!(
                "Recovered {} claimed queue entries and {} running jobs",
                released.len(),
                reset
            );
            self.emit(StoreEvent::QueueChanged { partition: None });
        }

        Ok(released.len())
    }

    /// Delete terminal jobs whose expiry is at or before `now`.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let _guard = self.write_lock.lock().await;
        let purged = self.jobs.purge_expired(now).await?;
        if purged > 0 {
            info!("Purged {} expired jobs", purged);
        }
        Ok(purged)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, DbError> {
        self.jobs.get(job_id).await
    }

    /// A job with its queue entry and the number of jobs waiting ahead of it.
    pub async fn get_detail(&self, job_id: JobId) -> Result<Option<JobDetail>, DbError> {
        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(None);
        };
        let entry = self.queue.get(job_id).await?;
        let waiting = match &entry {
            Some(entry) => self.queue.count_ahead(&job.partition(), entry.seq).await?,
            None => 0,
        };

        Ok(Some(JobDetail {
            job,
            entry,
            waiting,
        }))
    }

    /// Page through jobs, newest first. `page` is zero-based.
    pub async fn get_jobs(
        &self,
        filter: &JobFilter,
        page: usize,
        page_size: usize,
    ) -> Result<JobPage, DbError> {
        self.jobs.list(filter, page, page_size).await
    }

    /// Active queue entries of a topic by priority, then sequence.
    pub async fn get_queue(&self, topic: &str) -> Result<Vec<QueueEntry>, DbError> {
        self.queue.list_for_topic(topic).await
    }

    pub async fn get_counter(&self, partition: &PartitionKey) -> Result<Option<Counter>, DbError> {
        self.counters.get(partition).await
    }

    pub async fn all_counters(&self) -> Result<Vec<Counter>, DbError> {
        self.counters.list().await
    }

    // ---- topics ----

    /// Validate and store a topic, replacing any previous configuration.
    pub async fn save_topic(&self, mut topic: Topic) -> Result<(), DbError> {
        topic.validate()?;
        topic.name = topic.name.trim().to_string();
        for worker in &mut topic.workers {
            worker.url = worker.url.trim().to_string();
        }

        let guard = self.write_lock.lock().await;
        self.topics.save(&topic).await?;
        drop(guard);

        info!("Saved topic {} with {} workers", topic.name, topic.workers.len());
        self.emit(StoreEvent::TopicChanged { topic: topic.name });
        Ok(())
    }

    /// Remove a topic if none of its partitions hold active jobs.
    ///
    /// Counters are kept so sequences are never reused.
    pub async fn remove_topic(&self, name: &str) -> Result<bool, DbError> {
        let guard = self.write_lock.lock().await;

        let active = self.queue.count_for_topic(name).await?;
        if active > 0 {
            debug!("Refusing to remove topic {} with {} active jobs", name, active);
            return Ok(false);
        }
        let removed = self.topics.delete(name).await?;
        drop(guard);

        if removed {
            info!("Removed topic {}", name);
            self.emit(StoreEvent::TopicChanged {
                topic: name.to_string(),
            });
        }
        Ok(removed)
    }

    pub async fn get_topic(&self, name: &str) -> Result<Option<Topic>, DbError> {
        self.topics.get(name).await
    }

    pub async fn all_topics(&self) -> Result<Vec<Topic>, DbError> {
        self.topics.list().await
    }
}

fn expiry(ttl: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
}
