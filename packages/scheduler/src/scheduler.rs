//! Scheduler actor: mirrors topics, tracks worker load and drives dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use db::JobStore;
use pusher_core::{Job, JobId, RetryPolicy, SchedulerEvent, StoreEvent, Topic, Worker};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::dispatch::{self, Attempt, DispatchError};
use crate::messages::{SchedulerMessage, WorkerActivity};
use crate::output::OutputBuffer;

/// A worker of a topic; the unit capacity is tracked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub topic: String,
    pub url: String,
}

#[derive(Debug, Default)]
struct WorkerLoad {
    active: u32,
    jobs: HashSet<JobId>,
}

/// Where and how a claimed job is sent.
struct Target {
    slot: SlotKey,
    worker: Worker,
    policy: RetryPolicy,
    timeout: Duration,
}

/// An in-flight job.
struct LiveJob {
    job: Job,
    slot: SlotKey,
    policy: RetryPolicy,
    output: Arc<OutputBuffer>,
    /// Dropped or fired exactly once.
    cancel: Option<oneshot::Sender<()>>,
}

/// Keeps at most one `Reconcile` message queued.
#[derive(Default)]
struct ReconcileGate(AtomicBool);

impl ReconcileGate {
    fn request(&self, actor: &ActorRef<SchedulerMessage>) {
        if !self.0.swap(true, Ordering::AcqRel)
            && actor.send_message(SchedulerMessage::Reconcile).is_err()
        {
            self.0.store(false, Ordering::Release);
        }
    }

    fn begin(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Arguments for starting the scheduler.
pub struct SchedulerArgs {
    pub store: JobStore,
    pub config: SchedulerConfig,
    pub events: broadcast::Sender<SchedulerEvent>,
}

/// State for the scheduler actor.
pub struct SchedulerState {
    store: JobStore,
    config: SchedulerConfig,
    client: reqwest::Client,
    /// Topic mirror, replaced wholesale on reload.
    topics: HashMap<String, Topic>,
    slots: HashMap<SlotKey, WorkerLoad>,
    live: HashMap<JobId, LiveJob>,
    /// Output of recently finished jobs, kept for late readers, tagged with
    /// the generation of the completion that stored it.
    finished: HashMap<JobId, (u64, Arc<OutputBuffer>)>,
    generation: u64,
    events: broadcast::Sender<SchedulerEvent>,
    gate: Arc<ReconcileGate>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerState {
    fn idle_slots(&self) -> Vec<(SlotKey, u32)> {
        let mut idle = Vec::new();
        for topic in self.topics.values() {
            for worker in &topic.workers {
                let slot = SlotKey {
                    topic: topic.name.clone(),
                    url: worker.url.clone(),
                };
                let active = self.slots.get(&slot).map(|l| l.active).unwrap_or(0);
                let free = worker.concurrency.saturating_sub(active);
                if free > 0 {
                    idle.push((slot, free));
                }
            }
        }
        idle
    }

    fn worker(&self, slot: &SlotKey) -> Option<(&Topic, &Worker)> {
        let topic = self.topics.get(&slot.topic)?;
        let worker = topic.workers.iter().find(|w| w.url == slot.url)?;
        Some((topic, worker))
    }

    /// Everything a dispatch to `slot` needs, resolved before a job is claimed.
    fn target(&self, slot: &SlotKey) -> Option<Target> {
        let (topic, worker) = self.worker(slot)?;
        Some(Target {
            slot: slot.clone(),
            worker: worker.clone(),
            policy: topic.retry_policy(),
            timeout: self.config.min_timeout.max(topic.timeout()),
        })
    }

    fn activity(&self) -> Vec<WorkerActivity> {
        let mut activity: Vec<WorkerActivity> = self
            .slots
            .iter()
            .map(|(slot, load)| {
                let mut jobs: Vec<JobId> = load.jobs.iter().copied().collect();
                jobs.sort();
                WorkerActivity {
                    topic: slot.topic.clone(),
                    url: slot.url.clone(),
                    concurrency: self
                        .worker(slot)
                        .map(|(_, w)| w.concurrency)
                        .unwrap_or(0),
                    active: load.active,
                    jobs,
                }
            })
            .collect();
        activity.sort_by(|a, b| (&a.topic, &a.url).cmp(&(&b.topic, &b.url)));
        activity
    }
}

/// Scheduler actor.
pub struct Scheduler;

impl Scheduler {
    async fn reload_topics(&self, state: &mut SchedulerState) -> Result<(), ActorProcessingErr> {
        let topics = state.store.all_topics().await?;

        state.topics = topics
            .into_iter()
            .map(|topic| (topic.name.clone(), topic))
            .collect();

        let configured: HashSet<SlotKey> = state
            .topics
            .values()
            .flat_map(|topic| {
                topic.workers.iter().map(|w| SlotKey {
                    topic: topic.name.clone(),
                    url: w.url.clone(),
                })
            })
            .collect();

        // Removed workers keep their entry until their jobs drain.
        state
            .slots
            .retain(|slot, load| load.active > 0 || configured.contains(slot));
        for slot in configured {
            state.slots.entry(slot).or_default();
        }

        info!(
            "Loaded {} topics with {} workers",
            state.topics.len(),
            state.slots.len()
        );
        Ok(())
    }

    /// Claim jobs for idle capacity, one job per slot per round, until no
    /// slot can claim more.
    async fn reconcile(&self, myself: &ActorRef<SchedulerMessage>, state: &mut SchedulerState) {
        let mut idle = state.idle_slots();
        idle.shuffle(&mut rand::rng());

        let mut dispatched = 0usize;
        while !idle.is_empty() {
            let mut next_round = Vec::with_capacity(idle.len());

            for (slot, free) in idle {
                let Some(target) = state.target(&slot) else {
                    continue;
                };
                match state.store.next_job(&slot.topic).await {
                    Ok(Some(job)) => {
                        self.dispatch(myself, state, target, job).await;
                        dispatched += 1;
                        if free > 1 {
                            next_round.push((slot, free - 1));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("Failed to claim a job for {}: {}", slot.topic, e),
                }
            }

            idle = next_round;
        }

        if dispatched > 0 {
            debug!("Reconcile dispatched {} jobs", dispatched);
            let _ = state
                .events
                .send(SchedulerEvent::WorkingChanged { job_id: None });
        }
    }

    async fn dispatch(
        &self,
        myself: &ActorRef<SchedulerMessage>,
        state: &mut SchedulerState,
        target: Target,
        job: Job,
    ) {
        let Target {
            slot,
            worker,
            policy,
            timeout,
        } = target;

        let job = match state.store.assign_job(job.id, &worker).await {
            Ok(Some(assigned)) => assigned,
            Ok(None) => {
                debug!("Job {} was erased before dispatch", job.id);
                return;
            }
            Err(e) => {
                error!("Failed to record worker for job {}: {}", job.id, e);
                Job {
                    worker: Some(worker.clone()),
                    ..job
                }
            }
        };

        let load = state.slots.entry(slot.clone()).or_default();
        load.active += 1;
        load.jobs.insert(job.id);

        let output = Arc::new(OutputBuffer::new());
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let attempt = Attempt {
            job: job.clone(),
            worker,
            retry_limit: policy.retries,
            timeout,
            tail_bytes: state.config.tail_bytes,
            output: output.clone(),
        };

        info!("Dispatching job {} to {}", job.id, slot.url);
        state.live.insert(
            job.id,
            LiveJob {
                job,
                slot,
                policy,
                output,
                cancel: Some(cancel_tx),
            },
        );

        let client = state.client.clone();
        let myself = myself.clone();
        tokio::spawn(async move {
            let job_id = attempt.job.id;
            let result = dispatch::run(client, attempt, cancel_rx).await;
            let (success, no_retry) = match result {
                Ok(success) => (success, false),
                Err(DispatchError::Aborted) => (false, true),
                Err(e) => {
                    warn!("Job {} failed: {}", job_id, e);
                    (false, false)
                }
            };
            // Fails only once the scheduler stopped; recovery handles the job.
            let _ = myself.send_message(SchedulerMessage::JobFinished {
                job_id,
                success,
                no_retry,
            });
        });
    }

    async fn finish(
        &self,
        myself: &ActorRef<SchedulerMessage>,
        state: &mut SchedulerState,
        job_id: JobId,
        success: bool,
        no_retry: bool,
    ) {
        let Some(live) = state.live.remove(&job_id) else {
            debug!("Ignoring late completion of job {}", job_id);
            return;
        };

        if let Some(load) = state.slots.get_mut(&live.slot) {
            load.active = load.active.saturating_sub(1);
            load.jobs.remove(&job_id);
        }

        live.output.end();
        let mut job = live.job;
        job.output = live.output.snapshot().to_vec();
        if let Some(head) = live.output.head() {
            job.content_type = Some(head.content_type);
            job.content_encoding = Some(head.content_encoding);
        }

        match state.store.done_job(&job, &live.policy, success, no_retry).await {
            Ok(outcome) => debug!("Job {} completed: {:?}", job_id, outcome),
            Err(e) => error!("Failed to record completion of job {}: {}", job_id, e),
        }

        // A retried job finishes once per attempt; only the latest snapshot counts.
        state.generation += 1;
        let generation = state.generation;
        state.finished.insert(job_id, (generation, live.output));
        let retention = state.config.retention;
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let _ = myself_clone.send_message(SchedulerMessage::ForgetFinished {
                job_id,
                generation,
            });
        });

        let _ = state.events.send(SchedulerEvent::WorkingChanged {
            job_id: Some(job_id),
        });
        state.gate.request(myself);
    }
}

/// Fire a live job's cancel signal. False if the job is not in flight or
/// was already cancelled.
fn cancel_live(state: &mut SchedulerState, job_id: JobId) -> bool {
    let cancelled = state
        .live
        .get_mut(&job_id)
        .and_then(|live| live.cancel.take())
        .is_some_and(|cancel| cancel.send(()).is_ok());
    if cancelled {
        info!("Aborting job {}", job_id);
    }
    cancelled
}

impl Actor for Scheduler {
    type Msg = SchedulerMessage;
    type State = SchedulerState;
    type Arguments = SchedulerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting dispatch scheduler");

        let client = reqwest::Client::builder().gzip(true).build()?;
        let gate = Arc::new(ReconcileGate::default());
        let mut tasks = Vec::new();

        // Forward store notifications into the mailbox
        let mut store_events = args.store.subscribe();
        let myself_clone = myself.clone();
        let pump_gate = gate.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let message = match store_events.recv().await {
                    Ok(StoreEvent::QueueChanged { .. }) => {
                        pump_gate.request(&myself_clone);
                        continue;
                    }
                    Ok(StoreEvent::TopicChanged { .. }) => SchedulerMessage::ReloadTopics,
                    Ok(StoreEvent::JobAborted { .. }) => SchedulerMessage::SyncAborts,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Scheduler missed {} store events, resyncing", missed);
                        if myself_clone
                            .send_message(SchedulerMessage::ReloadTopics)
                            .is_err()
                        {
                            break;
                        }
                        SchedulerMessage::SyncAborts
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if myself_clone.send_message(message).is_err() {
                    break;
                }
            }
        }));

        // Start periodic tick
        let myself_clone = myself.clone();
        let interval = args.config.housekeeping_interval;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself_clone.send_message(SchedulerMessage::Tick).is_err() {
                    break;
                }
            }
        }));

        let mut state = SchedulerState {
            store: args.store,
            config: args.config,
            client,
            topics: HashMap::new(),
            slots: HashMap::new(),
            live: HashMap::new(),
            finished: HashMap::new(),
            generation: 0,
            events: args.events,
            gate,
            tasks,
        };

        self.reload_topics(&mut state).await?;
        state.gate.request(&myself);

        Ok(state)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for task in state.tasks.drain(..) {
            task.abort();
        }
        // Dropping the cancel senders ends every outstanding call.
        let abandoned = state.live.len();
        state.live.clear();
        info!("Scheduler stopped, abandoned {} in-flight jobs", abandoned);
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SchedulerMessage::Reconcile => {
                state.gate.begin();
                self.reconcile(&myself, state).await;
            }

            SchedulerMessage::ReloadTopics => {
                if let Err(e) = self.reload_topics(state).await {
                    error!("Failed to reload topics: {}", e);
                }
                state.gate.request(&myself);
            }

            SchedulerMessage::JobFinished {
                job_id,
                success,
                no_retry,
            } => {
                self.finish(&myself, state, job_id, success, no_retry).await;
            }

            SchedulerMessage::Abort { job_id, reply } => {
                let _ = reply.send(cancel_live(state, job_id));
            }

            SchedulerMessage::SyncAborts => {
                let requested = state.store.pending_aborts().await;
                let live: Vec<JobId> = state
                    .live
                    .keys()
                    .filter(|id| requested.contains(*id))
                    .copied()
                    .collect();
                for job_id in live {
                    cancel_live(state, job_id);
                }
            }

            SchedulerMessage::OutputStream { job_id, reply } => {
                let stream = state
                    .live
                    .get(&job_id)
                    .map(|live| &live.output)
                    .or_else(|| state.finished.get(&job_id).map(|(_, output)| output))
                    .map(|output| output.subscribe());
                let _ = reply.send(stream);
            }

            SchedulerMessage::Working { reply } => {
                let _ = reply.send(state.activity());
            }

            SchedulerMessage::ForgetFinished { job_id, generation } => {
                if state
                    .finished
                    .get(&job_id)
                    .is_some_and(|(stored, _)| *stored == generation)
                {
                    state.finished.remove(&job_id);
                }
            }

            SchedulerMessage::Tick => {
                if let Err(e) = state.store.purge_expired(Utc::now()).await {
                    warn!("Failed to purge expired jobs: {}", e);
                }
                state.gate.request(&myself);
            }

            SchedulerMessage::Shutdown => {
                tracing::info!("Shutting down scheduler");
                myself.stop(None);
                return Ok(());
            }
        }

        Ok(())
    }
}
