use std::cmp::min;
use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, WorkerCheckpoint};
use crate::events::{DasEvent, EventPublisher};
use crate::queue::{Job, JobKind, PriorityStack};
use crate::worker::{SampleResult, SampleStatus};

/// In-memory bookkeeping of sampling progress.
///
/// Owned by the coordinator loop; external readers take short-lived
/// snapshots through [`CoordinatorState::stats`] and
/// [`CoordinatorState::checkpoint`].
pub(crate) struct CoordinatorState {
    sampling_range: u64,

    /// Next height to be backfilled. Everything below it was handed to a
    /// worker already.
    next: u64,
    /// Upper bound of the backfill region. Heights above it up to
    /// `network_head` are covered by the priority stack.
    catchup_head: u64,
    /// The greatest height announced so far.
    network_head: u64,

    priority: PriorityStack,
    in_flight: HashMap<u64, InFlight>,
    failed: BTreeMap<u64, u16>,

    next_job_id: u64,
    catch_up: watch::Sender<bool>,
    event_pub: EventPublisher,
}

struct InFlight {
    job: Job,
    /// Next height within the job that has not been attempted yet.
    current: u64,
}

/// A job handed out to a worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Dispatch {
    pub(crate) id: u64,
    pub(crate) job: Job,
}

/// Deep-copied snapshot of the sampling progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SamplingStats {
    /// All heights up to this one were proven sampled or recorded as failed.
    pub sampled_chain_head: u64,
    /// The greatest height that was handed out for backfill.
    pub catch_up_head: u64,
    /// The greatest height known to the coordinator.
    pub network_head: u64,
    /// Failure counters carried over from previous runs and accrued in this
    /// one.
    pub failed: BTreeMap<u64, u16>,
    /// Ranges currently being sampled.
    pub workers: Vec<WorkerStats>,
    /// Amount of workers currently running.
    pub concurrency: usize,
    /// Whether all known heights have been sampled and the workers are idle.
    pub catch_up_done: bool,
}

/// Progress of a single running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub kind: WorkerKind,
    pub from: u64,
    pub to: u64,
    pub current: u64,
}

/// What a running worker is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Catchup,
    Priority,
    Retry,
}

impl From<JobKind> for WorkerKind {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::Catchup => WorkerKind::Catchup,
            JobKind::Priority => WorkerKind::Priority,
            JobKind::Retry => WorkerKind::Retry,
        }
    }
}

impl CoordinatorState {
    pub(crate) fn new(
        sampling_range: u64,
        priority_queue_size: usize,
        event_pub: EventPublisher,
    ) -> (CoordinatorState, watch::Receiver<bool>) {
        let (catch_up, catch_up_rx) = watch::channel(false);

        let state = CoordinatorState {
            sampling_range,
            next: 1,
            catchup_head: 1,
            network_head: 1,
            priority: PriorityStack::new(priority_queue_size),
            in_flight: HashMap::new(),
            failed: BTreeMap::new(),
            next_job_id: 0,
            catch_up,
            event_pub,
        };

        (state, catch_up_rx)
    }

    /// Initialises the state from a checkpoint of a previous run.
    ///
    /// Interrupted ranges are re-queued from their last unattempted height
    /// and previously failed heights get a single retry, both served before
    /// fresh backfill.
    pub(crate) fn resume(&mut self, checkpoint: Checkpoint) {
        self.next = checkpoint.sample_from;
        self.catchup_head = checkpoint.network_head;
        self.network_head = checkpoint.network_head;
        self.failed = checkpoint.failed;

        for &height in self.failed.keys() {
            self.priority.push(Job::retry(height));
        }

        for wc in checkpoint.workers {
            // Heights below the checkpointed SampleFrom are authoritatively
            // done, no matter what the worker entry claims.
            let from = wc.current.max(checkpoint.sample_from);
            if from <= wc.to {
                self.priority.push(Job::catchup(from, wc.to));
            }
        }

        self.check_done();
    }

    /// Incorporates a newly announced network head.
    ///
    /// The heights between the previously known head and `height` are pushed
    /// onto the priority stack so they get sampled before any backfill.
    pub(crate) fn update_head(&mut self, height: u64) -> bool {
        if height <= self.network_head {
            debug!(
                "received head height {height}, lower or equal to the known head {}",
                self.network_head
            );
            return false;
        }

        self.priority
            .push_stack(self.network_head + 1, height, self.sampling_range);
        self.network_head = height;

        // new heights re-open the catch-up condition
        self.catch_up.send_if_modified(|done| {
            let was_done = *done;
            *done = false;
            was_done
        });

        true
    }

    /// Selects the next job: priority stack first, then backfill.
    pub(crate) fn next_job(&mut self) -> Option<Dispatch> {
        self.advance_catchup_head();

        let job = if let Some(job) = self.priority.pop() {
            job
        } else if self.next <= self.catchup_head {
            let to = min(self.next + self.sampling_range - 1, self.catchup_head);
            let job = Job::catchup(self.next, to);
            self.next = to + 1;
            job
        } else {
            return None;
        };

        let id = self.next_job_id;
        self.next_job_id += 1;
        self.in_flight.insert(id, InFlight { job, current: job.from });

        debug!("dispatching job {job}");
        self.event_pub.send(DasEvent::SamplingStarted {
            from: job.from,
            to: job.to,
        });

        Some(Dispatch { id, job })
    }

    /// Incorporates a per-height result reported by a worker.
    pub(crate) fn handle_result(&mut self, res: SampleResult) {
        let Some(entry) = self.in_flight.get_mut(&res.job_id) else {
            debug!("result for unknown job {}", res.job_id);
            return;
        };

        match res.status {
            SampleStatus::Sampled => {
                entry.current = res.height + 1;
                self.failed.remove(&res.height);
            }
            SampleStatus::Failed => {
                entry.current = res.height + 1;
                let count = self.failed.entry(res.height).or_insert(0);
                *count = count.saturating_add(1);
            }
            SampleStatus::Aborted => {
                // The job stays in flight so it lands in the final
                // checkpoint and is resumed on the next start.
                entry.current = res.height;
                return;
            }
        }

        if entry.current > entry.job.to {
            let entry = self.in_flight.remove(&res.job_id).expect("entry exists");
            debug!("job {} finished", entry.job);
        }

        self.check_done();
    }

    /// Fires the catch-up signal once every known height has been dispatched
    /// and all workers went idle.
    fn check_done(&mut self) {
        self.advance_catchup_head();

        if self.next > self.catchup_head
            && self.in_flight.is_empty()
            && self.priority.is_empty()
            && !*self.catch_up.borrow()
        {
            info!("caught up with the network head {}", self.network_head);
            self.event_pub.send(DasEvent::CaughtUp {
                network_head: self.network_head,
            });
            self.catch_up.send_replace(true);
        }
    }

    /// Skips the backfill pointer over `(catchup_head, network_head]` once
    /// the priority stack has drained.
    ///
    /// That region is covered by priority jobs from the moment it appears,
    /// so with the stack empty every height in it was already handed out
    /// and backfill must not visit it again.
    fn advance_catchup_head(&mut self) {
        if self.priority.is_empty()
            && self.next > self.catchup_head
            && self.catchup_head < self.network_head
        {
            self.catchup_head = self.network_head;
            self.next = self.next.max(self.network_head + 1);
        }
    }

    /// The smallest height not yet proven sampled.
    ///
    /// Derived rather than tracked: backfill covered everything below
    /// `next`, so the low-water mark is `next` unless a running worker is
    /// still below it. Retry jobs are excluded, their heights are accounted
    /// for by the failed map.
    fn sample_from(&self) -> u64 {
        self.in_flight
            .values()
            .filter(|entry| entry.job.kind != JobKind::Retry)
            .map(|entry| entry.current)
            .fold(self.next, min)
    }

    pub(crate) fn stats(&self) -> SamplingStats {
        let mut workers = self
            .in_flight
            .values()
            .map(|entry| WorkerStats {
                kind: entry.job.kind.into(),
                from: entry.job.from,
                to: entry.job.to,
                current: entry.current,
            })
            .collect::<Vec<_>>();
        workers.sort_unstable_by_key(|w| w.from);

        SamplingStats {
            sampled_chain_head: self.sample_from() - 1,
            catch_up_head: self.next - 1,
            network_head: self.network_head,
            failed: self.failed.clone(),
            workers,
            concurrency: self.in_flight.len(),
            catch_up_done: *self.catch_up.borrow(),
        }
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let mut workers = self
            .in_flight
            .values()
            .filter(|entry| entry.job.kind != JobKind::Retry)
            .map(|entry| WorkerCheckpoint {
                from: entry.job.from,
                to: entry.job.to,
                current: entry.current,
            })
            .collect::<Vec<_>>();
        workers.sort_unstable_by_key(|w| w.from);

        Checkpoint {
            sample_from: self.sample_from(),
            network_head: self.network_head,
            failed: self.failed.clone(),
            workers,
        }
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}
