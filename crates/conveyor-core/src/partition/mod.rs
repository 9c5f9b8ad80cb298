//! Partition actor: a single-writer command processor per partition.
//!
//! All job-state mutation for one partition happens on its own task, fed by
//! an mpsc mailbox. Concurrency exists across partitions only. The actor
//! multiplexes three wake sources:
//! - mailbox commands,
//! - the earliest pending timer (activation deadline, failure backoff, or
//!   parked poll expiry),
//! - a coarse tick that purges dead demand and re-offers work to streams
//!   whose credit was replenished.

mod command;
mod longpoll;
mod matcher;
mod state;
mod streams;

pub(crate) use command::PartitionCommand;
pub(crate) use longpoll::PollDemand;
pub(crate) use streams::StreamRegistration;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::domain::{JobKey, JobState, JobType, PartitionId};
use crate::engine::EngineConfig;
use crate::error::EngineError;

use self::longpoll::LongPollQueue;
use self::state::PartitionState;
use self::streams::StreamRegistry;

pub(crate) struct PartitionHandle {
    pub id: PartitionId,
    pub tx: mpsc::Sender<PartitionCommand>,
}

pub(crate) fn spawn(
    id: PartitionId,
    config: Arc<EngineConfig>,
) -> (PartitionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let join = tokio::spawn(async move {
        Partition::new(id, config, rx).run().await;
    });
    (PartitionHandle { id, tx }, join)
}

struct Partition {
    state: PartitionState,
    longpoll: LongPollQueue,
    streams: StreamRegistry,
    config: Arc<EngineConfig>,
    rx: mpsc::Receiver<PartitionCommand>,
}

impl Partition {
    fn new(
        id: PartitionId,
        config: Arc<EngineConfig>,
        rx: mpsc::Receiver<PartitionCommand>,
    ) -> Self {
        Self {
            state: PartitionState::new(id),
            longpoll: LongPollQueue::new(),
            streams: StreamRegistry::new(),
            config,
            rx,
        }
    }

    async fn run(mut self) {
        let id = self.state.partition_id;
        tracing::debug!(partition = %id, "partition started");
        let mut tick = time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let wake_at = next_wake(self.state.next_timer(), self.longpoll.next_expiry());
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        None | Some(PartitionCommand::Shutdown) => break,
                        Some(cmd) => self.handle(cmd),
                    }
                }
                _ = time::sleep_until(wake_at) => self.on_timer(),
                _ = tick.tick() => self.on_tick(),
            }
        }
        tracing::debug!(partition = %id, "partition stopped");
    }

    fn handle(&mut self, cmd: PartitionCommand) {
        let now = Instant::now();
        match cmd {
            PartitionCommand::CreateJob { spec, reply } => {
                let key = self.state.create_job(spec, now);
                let job_type = self.state.jobs[&key].job_type.clone();
                tracing::debug!(job = %key, job_type = %job_type, "job created");
                let _ = reply.send(key);
                self.on_jobs_available(&job_type, now);
            }
            PartitionCommand::CancelJob { key, reply } => {
                let result = self.with_job(key, |record| record.cancel(now));
                let _ = reply.send(result);
            }
            PartitionCommand::Activate { demand } => {
                self.activate(demand, now);
            }
            PartitionCommand::CompleteJob { key, variables, reply } => {
                let result = self.with_job(key, |record| record.complete(variables, now));
                let _ = reply.send(result);
            }
            PartitionCommand::FailJob { key, retries, error_message, backoff, reply } => {
                let result = self.with_job(key, |record| {
                    record.fail(retries, error_message, backoff, now)
                });
                if result.is_ok() {
                    self.after_fail(key, now);
                }
                let _ = reply.send(result);
            }
            PartitionCommand::ThrowError { key, error_code, error_message, reply } => {
                let result = self.with_job(key, |record| {
                    record.throw_error(error_code, error_message, now)
                });
                let _ = reply.send(result);
            }
            PartitionCommand::UpdateRetries { key, retries, reply } => {
                let was_failed = self
                    .state
                    .jobs
                    .get(&key)
                    .is_some_and(|r| r.state == JobState::Failed);
                let result = self.with_job(key, |record| record.update_retries(retries, now));
                if result.is_ok() && was_failed {
                    // Failed -> Created: the job is available again.
                    let job_type = self.state.jobs[&key].job_type.clone();
                    self.state.requeue(key);
                    self.on_jobs_available(&job_type, now);
                }
                let _ = reply.send(result);
            }
            PartitionCommand::UpdateTimeout { key, timeout, reply } => {
                let deadline = now + timeout;
                let result = self.with_job(key, |record| record.update_deadline(deadline, now));
                if result.is_ok() {
                    self.state.schedule_deadline(key, deadline);
                }
                let _ = reply.send(result);
            }
            PartitionCommand::YieldJob { key } => {
                if let Some(job_type) = self.state.yield_job(key, now) {
                    self.on_jobs_available(&job_type, now);
                }
            }
            PartitionCommand::OpenStream { registration } => {
                let job_type = registration.job_type.clone();
                tracing::debug!(
                    partition = %self.state.partition_id,
                    stream = %registration.id,
                    job_type = %job_type,
                    "stream opened"
                );
                self.streams.register(registration);
                self.on_jobs_available(&job_type, now);
            }
            PartitionCommand::CloseStream { id } => {
                self.streams.close(id);
            }
            PartitionCommand::Counts { reply } => {
                let _ = reply.send(self.state.counts());
            }
            PartitionCommand::Shutdown => {} // handled in run()
        }
    }

    /// Apply a transition to one job; missing keys are `NotFound`.
    fn with_job(
        &mut self,
        key: JobKey,
        f: impl FnOnce(&mut crate::domain::JobRecord) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        match self.state.jobs.get_mut(&key) {
            Some(record) => f(record),
            None => Err(EngineError::NotFound(key)),
        }
    }

    /// Post-fail bookkeeping: a job back in `Created` is either immediately
    /// available or parked behind its backoff timer.
    fn after_fail(&mut self, key: JobKey, now: Instant) {
        let Some(record) = self.state.jobs.get(&key) else {
            return;
        };
        if record.state != JobState::Created {
            return; // retries exhausted, parked in Failed
        }
        let job_type = record.job_type.clone();
        match record.backoff_until {
            Some(until) => self.state.schedule_backoff(key, until),
            None => {
                self.state.requeue(key);
                self.on_jobs_available(&job_type, now);
            }
        }
    }

    /// Serve pull demand: match what we can now, park the rest until expiry.
    fn activate(&mut self, mut demand: PollDemand, now: Instant) {
        let jobs = matcher::match_jobs(&mut self.state, &demand.as_match(), now);
        let got = jobs.len();
        let blocking = demand.expires_at > now;
        let mut dead = false;
        if got > 0 || !blocking {
            // Non-blocking requests always get an answer, even an empty one,
            // so the merge layer can count responses.
            match demand.sink.try_send(jobs) {
                Ok(()) => demand.capacity -= got,
                Err(TrySendError::Full(jobs)) => {
                    for job in jobs {
                        self.state.yield_job(job.key, now);
                    }
                }
                Err(TrySendError::Closed(jobs)) => {
                    for job in jobs {
                        self.state.yield_job(job.key, now);
                    }
                    dead = true;
                }
            }
        }
        if blocking && !dead && demand.capacity > 0 {
            self.longpoll.park(demand);
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        let woken = self.state.fire_due_timers(now);
        self.longpoll.expire_due(now);
        for job_type in woken {
            self.on_jobs_available(&job_type, now);
        }
    }

    /// Coarse periodic sweep: purge dead parked demand and re-offer available
    /// work (a stream whose consumer drained its channel signals no one, so
    /// the tick is what resumes pushing).
    fn on_tick(&mut self) {
        let now = Instant::now();
        self.state.purge_terminal();
        self.longpoll.expire_due(now);
        let types: Vec<JobType> = self
            .state
            .created
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(job_type, _)| job_type.clone())
            .collect();
        for job_type in types {
            self.on_jobs_available(&job_type, now);
        }
    }

    /// Availability signal for one type: streams take precedence, parked
    /// pollers get the rest.
    fn on_jobs_available(&mut self, job_type: &JobType, now: Instant) {
        if self.streams.has_streams(job_type) {
            self.streams
                .push_available(&mut self.state, self.config.default_job_timeout, job_type, now);
        }
        self.longpoll.wake(&mut self.state, job_type, now);
    }
}

fn next_wake(a: Option<Instant>, b: Option<Instant>) -> Instant {
    let far = Instant::now() + time::Duration::from_secs(24 * 60 * 60);
    match (a, b) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => far,
    }
}
