//! The sampling coordinator: a single-owner scheduling loop that keeps a
//! bounded pool of workers busy sampling block heights.
//!
//! The loop draws work from two sources. Newly announced heights are pushed
//! onto a bounded priority stack and always win over historical backfill,
//! which walks the contiguous range between the checkpointed low-water mark
//! and the network head known at startup. Workers report a result for every
//! height they attempt; failures are recorded and retried on the next start
//! instead of stalling the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::checkpoint::Checkpoint;
use crate::events::EventPublisher;
use crate::executor::{spawn, JoinHandle};
use crate::header::{DasHeader, HeaderGetter};
use crate::state::{CoordinatorState, SamplingStats};
use crate::worker::{SampleFn, SampleResult, Worker};

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1);

type Result<T, E = CoordinatorError> = std::result::Result<T, E>;

/// Representation of the errors that can occur in the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The coordinator loop did not release the sampling state in time.
    #[error("Sampling state is unavailable")]
    CheckpointUnavailable,

    /// Waiting for the coordinator to stop was interrupted.
    #[error("Sampling coordinator force quit")]
    ForceQuit,
}

/// Arguments used to configure the coordinator.
pub(crate) struct CoordinatorArgs<H>
where
    H: DasHeader,
{
    /// Resolver of heights to headers.
    pub(crate) getter: Arc<dyn HeaderGetter<H>>,
    /// The sampling operation itself.
    pub(crate) sample_fn: SampleFn<H>,
    /// Event publisher.
    pub(crate) event_pub: EventPublisher,
    /// Maximum amount of heights per job.
    pub(crate) sampling_range: u64,
    /// Maximum amount of concurrently running workers.
    pub(crate) concurrency_limit: usize,
    /// Capacity of the priority stack.
    pub(crate) priority_queue_size: usize,
}

/// Handle to the coordinator loop.
pub(crate) struct SamplingCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
    discovery: watch::Sender<u64>,
    catch_up: watch::Receiver<bool>,
    join_handle: JoinHandle,
}

impl SamplingCoordinator {
    /// Starts the coordinator loop, resuming from `checkpoint`.
    pub(crate) fn start<H>(
        args: CoordinatorArgs<H>,
        checkpoint: Checkpoint,
        cancellation_token: CancellationToken,
    ) -> SamplingCoordinator
    where
        H: DasHeader,
    {
        let (state, catch_up) = CoordinatorState::new(
            args.sampling_range,
            args.priority_queue_size,
            args.event_pub.clone(),
        );
        let state = Arc::new(Mutex::new(state));

        let (discovery, discovery_rx) = watch::channel(checkpoint.network_head);
        let (results_tx, results_rx) = mpsc::channel(args.concurrency_limit.max(1));

        let mut runner = Runner {
            state: state.clone(),
            getter: args.getter,
            sample_fn: args.sample_fn,
            event_pub: args.event_pub,
            concurrency_limit: args.concurrency_limit,
            discovery: discovery_rx,
            discovery_closed: false,
            results_tx,
            results_rx,
            cancellation_token,
            workers: Vec::new(),
        };

        let join_handle = spawn(async move { runner.run(checkpoint).await });

        SamplingCoordinator {
            state,
            discovery,
            catch_up,
            join_handle,
        }
    }

    /// Notifies the coordinator of a newly observed network head.
    ///
    /// Never blocks; concurrent announcements are coalesced on their
    /// maximum, which is safe because a later head subsumes every
    /// earlier one.
    pub(crate) fn listen(&self, height: u64) {
        self.discovery.send_if_modified(|head| {
            if height > *head {
                *head = height;
                true
            } else {
                false
            }
        });
    }

    /// Snapshot of the current progress as a checkpoint.
    pub(crate) async fn checkpoint(&self) -> Result<Checkpoint> {
        let state = timeout(SNAPSHOT_TIMEOUT, self.state.lock())
            .await
            .map_err(|_| CoordinatorError::CheckpointUnavailable)?;
        Ok(state.checkpoint())
    }

    /// Snapshot of the current progress metrics.
    pub(crate) async fn stats(&self) -> Result<SamplingStats> {
        let state = timeout(SNAPSHOT_TIMEOUT, self.state.lock())
            .await
            .map_err(|_| CoordinatorError::CheckpointUnavailable)?;
        Ok(state.stats())
    }

    /// Resolves when every known height has been dispatched and all workers
    /// went idle. Re-arms itself when a new head is announced afterwards.
    pub(crate) async fn wait_catch_up(&self) {
        let mut catch_up = self.catch_up.clone();
        // the channel outlives the loop, so this cannot fail
        let _ = catch_up.wait_for(|done| *done).await;
    }

    /// Waits until the loop and all its workers have fully stopped.
    pub(crate) async fn join(&self) {
        self.join_handle.join().await;
    }

    /// Like [`SamplingCoordinator::join`], but gives up when `ctx` fires.
    pub(crate) async fn wait(&self, ctx: &CancellationToken) -> Result<()> {
        select! {
            biased;
            _ = self.join_handle.join() => Ok(()),
            _ = ctx.cancelled() => Err(CoordinatorError::ForceQuit),
        }
    }
}

/// The loop itself; sole owner of job scheduling.
struct Runner<H>
where
    H: DasHeader,
{
    state: Arc<Mutex<CoordinatorState>>,
    getter: Arc<dyn HeaderGetter<H>>,
    sample_fn: SampleFn<H>,
    event_pub: EventPublisher,
    concurrency_limit: usize,
    discovery: watch::Receiver<u64>,
    discovery_closed: bool,
    results_tx: mpsc::Sender<SampleResult>,
    results_rx: mpsc::Receiver<SampleResult>,
    cancellation_token: CancellationToken,
    workers: Vec<JoinHandle>,
}

impl<H> Runner<H>
where
    H: DasHeader,
{
    async fn run(&mut self, checkpoint: Checkpoint) {
        debug!("starting sampling coordinator from {checkpoint}");
        self.state.lock().await.resume(checkpoint);

        loop {
            self.schedule().await;

            select! {
                _ = self.cancellation_token.cancelled() => {
                    break;
                }
                res = self.discovery.changed(), if !self.discovery_closed => {
                    match res {
                        Ok(()) => {
                            let head = *self.discovery.borrow_and_update();
                            self.state.lock().await.update_head(head);
                        }
                        Err(_) => self.discovery_closed = true,
                    }
                }
                Some(res) = self.results_rx.recv() => {
                    self.state.lock().await.handle_result(res);
                }
            }
        }

        self.drain().await;
        debug!("sampling coordinator stopped");
    }

    /// Hands out jobs until the worker pool is saturated or no work is left.
    async fn schedule(&mut self) {
        self.workers.retain(|worker| !worker.is_finished());

        let mut state = self.state.lock().await;

        while state.in_flight_len() < self.concurrency_limit {
            let Some(dispatch) = state.next_job() else {
                break;
            };

            let worker = Worker {
                job_id: dispatch.id,
                job: dispatch.job,
                getter: self.getter.clone(),
                sample_fn: self.sample_fn.clone(),
                results: self.results_tx.clone(),
                event_pub: self.event_pub.clone(),
                cancellation_token: self.cancellation_token.clone(),
            };

            self.workers.push(spawn(worker.run()));
        }
    }

    /// Consumes the remaining results while the workers wind down, so the
    /// final checkpoint sees their last attempted heights.
    async fn drain(&mut self) {
        let workers = std::mem::take(&mut self.workers);

        let all_stopped = async {
            for worker in &workers {
                worker.join().await;
            }
        };
        tokio::pin!(all_stopped);

        loop {
            select! {
                biased;
                Some(res) = self.results_rx.recv() => {
                    self.state.lock().await.handle_result(res);
                }
                _ = &mut all_stopped => break,
            }
        }

        while let Ok(res) = self.results_rx.try_recv() {
            self.state.lock().await.handle_result(res);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        lock_middleware, once_middleware, order_middleware, sample_fn, CheckOrder, MockSampler,
        SampleLock, StubGetter, TestHeader,
    };
    use crate::events::EventChannel;
    use std::collections::BTreeMap;
    use tokio::time::sleep;

    const TEST_TIMEOUT: Duration = Duration::from_secs(60);

    fn start_coordinator(
        sampler: &Arc<MockSampler>,
        sample_fn: SampleFn<TestHeader>,
        sampling_range: u64,
        concurrency_limit: usize,
    ) -> (SamplingCoordinator, CancellationToken) {
        let token = CancellationToken::new();
        let coordinator = SamplingCoordinator::start(
            CoordinatorArgs {
                getter: Arc::new(StubGetter),
                sample_fn,
                event_pub: EventChannel::new().publisher(),
                sampling_range,
                concurrency_limit,
                priority_queue_size: 64,
            },
            sampler.checkpoint(),
            token.clone(),
        );
        (coordinator, token)
    }

    async fn stop_and_checkpoint(
        coordinator: SamplingCoordinator,
        token: CancellationToken,
    ) -> Checkpoint {
        token.cancel();
        timeout(TEST_TIMEOUT, coordinator.join())
            .await
            .expect("coordinator did not stop");
        coordinator.checkpoint().await.unwrap()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(TEST_TIMEOUT, async {
            while !condition() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn samples_whole_range_exactly_once() {
        let sampler = MockSampler::new(1, 500, &[]);
        let (coordinator, token) =
            start_coordinator(&sampler, once_middleware(sample_fn(&sampler)), 10, 10);

        timeout(TEST_TIMEOUT, sampler.finished()).await.unwrap();
        timeout(TEST_TIMEOUT, coordinator.wait_catch_up())
            .await
            .unwrap();

        let stats = coordinator.stats().await.unwrap();
        assert!(stats.failed.is_empty(), "failed list should be empty");
        assert!(stats.catch_up_done);

        let cp = stop_and_checkpoint(coordinator, token).await;
        assert_eq!(cp, sampler.final_checkpoint());
    }

    #[tokio::test]
    async fn discovered_heights_are_sampled() {
        let sampler = MockSampler::new(1, 500, &[]);
        let (coordinator, token) =
            start_coordinator(&sampler, once_middleware(sample_fn(&sampler)), 10, 10);

        sleep(Duration::from_millis(50)).await;

        for height in 500..700u64 {
            sampler.discover(&coordinator, height);
        }

        timeout(TEST_TIMEOUT, sampler.finished()).await.unwrap();
        timeout(TEST_TIMEOUT, coordinator.wait_catch_up())
            .await
            .unwrap();

        let cp = stop_and_checkpoint(coordinator, token).await;
        assert_eq!(cp.sample_from, 700);
        assert_eq!(cp, sampler.final_checkpoint());
    }

    #[tokio::test]
    async fn prioritizes_newly_discovered_over_known() {
        let sampling_range = 4;
        let sampler = MockSampler::new(1, 10, &[]);

        // hold the worker on the first height so nothing completes before
        // the discovery arrives
        let lock = SampleLock::new(1, 1);

        // the worker picks up one backfill job before the discovery, then
        // the freshly announced buckets from the top of the stack, then the
        // remaining backfill
        let order = CheckOrder::new();
        order.add_interval(1, 4);
        order.add_stacks(11, 20, sampling_range);
        order.add_interval(5, 10);

        let (coordinator, token) = start_coordinator(
            &sampler,
            lock_middleware(&lock, order_middleware(&order, sample_fn(&sampler))),
            sampling_range,
            1,
        );

        // wait for the worker to pick up the first job
        sleep(Duration::from_millis(50)).await;

        sampler.discover(&coordinator, 20);

        // the locked worker has not sampled anything yet
        assert_eq!(sampler.sampled_amount(), 0);

        lock.release(&[1]);

        timeout(TEST_TIMEOUT, sampler.finished()).await.unwrap();
        timeout(TEST_TIMEOUT, coordinator.wait_catch_up())
            .await
            .unwrap();

        assert!(order.is_drained());

        let stats = coordinator.stats().await.unwrap();
        assert!(stats.failed.is_empty(), "failed list should be empty");

        let cp = stop_and_checkpoint(coordinator, token).await;
        assert_eq!(cp, sampler.final_checkpoint());
    }

    #[tokio::test]
    async fn discovery_is_accepted_while_all_workers_are_blocked() {
        let sampler = MockSampler::new(1, 20, &[]);

        // block every height before the coordinator starts
        let lock = SampleLock::new(1, 20);

        let (coordinator, token) =
            start_coordinator(&sampler, lock_middleware(&lock, sample_fn(&sampler)), 20, 10);

        sleep(Duration::from_millis(50)).await;

        let discovered = 21;
        lock.add(&[discovered]);
        sampler.discover(&coordinator, discovered);

        assert_eq!(sampler.sampled_amount(), 0);

        // the new head went through even though every worker is stuck
        timeout(TEST_TIMEOUT, async {
            while coordinator.stats().await.unwrap().network_head != discovered {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("discovery was not accepted");

        lock.release_all(&[discovered]);

        eventually(|| sampler.done_amount() == 20).await;
        assert!(!sampler.height_is_done(discovered));

        lock.release_all(&[]);

        timeout(TEST_TIMEOUT, sampler.finished()).await.unwrap();
        timeout(TEST_TIMEOUT, coordinator.wait_catch_up())
            .await
            .unwrap();

        let cp = stop_and_checkpoint(coordinator, token).await;
        assert_eq!(cp, sampler.final_checkpoint());
    }

    #[tokio::test]
    async fn failed_heights_are_stored() {
        let born_to_fail = [4, 8, 15, 16, 23, 42];
        let sampler = MockSampler::new(1, 500, &born_to_fail);

        let (coordinator, token) =
            start_coordinator(&sampler, once_middleware(sample_fn(&sampler)), 10, 10);

        timeout(TEST_TIMEOUT, coordinator.wait_catch_up())
            .await
            .unwrap();

        let cp = stop_and_checkpoint(coordinator, token).await;

        let mut expected = sampler.final_checkpoint();
        for height in born_to_fail {
            expected.failed.insert(height, 1);
        }
        assert_eq!(cp, expected);
    }

    #[tokio::test]
    async fn failed_heights_retry_on_restart() {
        let failed_last_run =
            BTreeMap::from([(4, 1), (8, 2), (15, 1), (16, 1), (23, 1), (42, 1), (49, 1)]);
        let sampler = MockSampler::resumed(50, 500, failed_last_run, &[16]);

        let (coordinator, token) =
            start_coordinator(&sampler, once_middleware(sample_fn(&sampler)), 10, 10);

        timeout(TEST_TIMEOUT, sampler.finished()).await.unwrap();
        timeout(TEST_TIMEOUT, coordinator.wait_catch_up())
            .await
            .unwrap();

        let cp = stop_and_checkpoint(coordinator, token).await;

        // 16 failed again, everything else got resampled and cleared
        let mut expected = sampler.final_checkpoint();
        expected.failed = BTreeMap::from([(16, 2)]);
        assert_eq!(cp, expected);
    }

    #[tokio::test]
    async fn concurrency_limit_is_enforced() {
        let sampler = MockSampler::new(1, 100, &[]);
        let lock = SampleLock::new(1, 100);

        let (coordinator, token) =
            start_coordinator(&sampler, lock_middleware(&lock, sample_fn(&sampler)), 10, 3);

        timeout(TEST_TIMEOUT, async {
            while coordinator.stats().await.unwrap().concurrency != 3 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker pool was not saturated");

        let stats = coordinator.stats().await.unwrap();
        assert_eq!(stats.workers.len(), 3);
        assert!(stats.workers.iter().all(|w| w.to - w.from + 1 <= 10));

        lock.release_all(&[]);

        timeout(TEST_TIMEOUT, coordinator.wait_catch_up())
            .await
            .unwrap();

        let stats = coordinator.stats().await.unwrap();
        assert_eq!(stats.concurrency, 0);

        token.cancel();
        timeout(TEST_TIMEOUT, coordinator.join()).await.unwrap();
    }

    #[tokio::test]
    async fn caught_up_checkpoint_signals_immediately() {
        let sampler = MockSampler::resumed(501, 500, BTreeMap::new(), &[]);
        let (coordinator, token) = start_coordinator(&sampler, sample_fn(&sampler), 10, 10);

        timeout(TEST_TIMEOUT, coordinator.wait_catch_up())
            .await
            .unwrap();
        assert_eq!(sampler.sampled_amount(), 0);
        assert!(coordinator.stats().await.unwrap().catch_up_done);

        let cp = stop_and_checkpoint(coordinator, token).await;
        assert_eq!(cp, sampler.checkpoint());
    }

    #[tokio::test]
    async fn interrupted_job_lands_in_checkpoint() {
        let sampler = MockSampler::new(1, 10, &[]);
        let lock = SampleLock::new(3, 3);

        let (coordinator, token) =
            start_coordinator(&sampler, lock_middleware(&lock, sample_fn(&sampler)), 10, 1);

        eventually(|| sampler.done_amount() == 2).await;

        let cp = stop_and_checkpoint(coordinator, token).await;
        assert_eq!(cp.sample_from, 3);
        assert_eq!(cp.workers.len(), 1);
        assert_eq!(cp.workers[0].from, 1);
        assert_eq!(cp.workers[0].to, 10);
        assert_eq!(cp.workers[0].current, 3);
    }

    #[tokio::test]
    async fn wait_force_quits_on_cancelled_context() {
        let sampler = MockSampler::new(1, 10, &[]);
        let lock = SampleLock::new(1, 10);

        let (coordinator, token) =
            start_coordinator(&sampler, lock_middleware(&lock, sample_fn(&sampler)), 10, 1);

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(
            coordinator.wait(&ctx).await,
            Err(CoordinatorError::ForceQuit)
        ));

        lock.release_all(&[]);
        token.cancel();
        timeout(TEST_TIMEOUT, coordinator.join()).await.unwrap();
    }
}
