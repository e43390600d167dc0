//! Component responsible for data availability sampling of block headers
//! announced on the network.
//!
//! The `Daser` continuously selects block heights and hands them to a
//! bounded pool of workers which run the external sampling operation on
//! each height. Every height between the genesis height and the network
//! head is eventually sampled at least once, with newly announced heights
//! taking priority over historical backfill. Failures are recorded and
//! retried on the next start, and progress is checkpointed periodically so
//! restarts do not re-sample what is already proven available.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::availability::Availability;
use crate::checkpoint::Checkpoint;
use crate::coordinator::{CoordinatorArgs, CoordinatorError, SamplingCoordinator};
use crate::events::{EventChannel, EventSubscriber};
use crate::executor::JoinHandle;
use crate::header::{DasHeader, HeaderGetter};
use crate::state::SamplingStats;
use crate::store::{spawn_background_store, CheckpointStore, StoreError};
use crate::subscriber::{spawn_forwarder, HeaderSubscriber, SubscriberError};
use crate::worker::SampleFn;

type Result<T, E = DaserError> = std::result::Result<T, E>;

const DEFAULT_SAMPLING_RANGE: u64 = 100;
const DEFAULT_CONCURRENCY_LIMIT: usize = 16;
const DEFAULT_BG_STORE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_PRIORITY_QUEUE_SIZE: usize = 64;
const DEFAULT_GENESIS_HEIGHT: u64 = 1;

/// Representation of all the errors that can occur when interacting with
/// the [`Daser`].
#[derive(Debug, thiserror::Error)]
pub enum DaserError {
    /// The component is already running.
    #[error("DASer already started")]
    AlreadyStarted,

    /// The component is not running.
    #[error("DASer is not running")]
    NotRunning,

    /// A configured parameter is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An error propagated from the sampling coordinator.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// An error propagated from the [`CheckpointStore`].
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An error propagated from the header subscriber.
    #[error(transparent)]
    Subscriber(#[from] SubscriberError),
}

/// Tunables of the sampling scheduler.
#[derive(Debug, Clone)]
pub struct DaserParams {
    sampling_range: u64,
    concurrency_limit: usize,
    bg_store_interval: Duration,
    priority_queue_size: usize,
    genesis_height: u64,
}

impl Default for DaserParams {
    fn default() -> Self {
        DaserParams {
            sampling_range: DEFAULT_SAMPLING_RANGE,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            bg_store_interval: DEFAULT_BG_STORE_INTERVAL,
            priority_queue_size: DEFAULT_PRIORITY_QUEUE_SIZE,
            genesis_height: DEFAULT_GENESIS_HEIGHT,
        }
    }
}

impl DaserParams {
    /// Maximum amount of heights per job.
    pub fn with_sampling_range(mut self, sampling_range: u64) -> Self {
        self.sampling_range = sampling_range;
        self
    }

    /// Maximum amount of workers running in parallel.
    pub fn with_concurrency_limit(mut self, concurrency_limit: usize) -> Self {
        self.concurrency_limit = concurrency_limit;
        self
    }

    /// How often the progress is snapshotted into the [`CheckpointStore`].
    pub fn with_bg_store_interval(mut self, bg_store_interval: Duration) -> Self {
        self.bg_store_interval = bg_store_interval;
        self
    }

    /// Capacity of the priority queue of newly announced heights.
    pub fn with_priority_queue_size(mut self, priority_queue_size: usize) -> Self {
        self.priority_queue_size = priority_queue_size;
        self
    }

    /// The smallest height that can be sampled.
    pub fn with_genesis_height(mut self, genesis_height: u64) -> Self {
        self.genesis_height = genesis_height;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.bg_store_interval.is_zero() {
            return Err(DaserError::InvalidConfig(
                "bg_store_interval must be positive".into(),
            ));
        }
        if self.sampling_range == 0 {
            return Err(DaserError::InvalidConfig(
                "sampling_range must be positive".into(),
            ));
        }
        if self.concurrency_limit == 0 {
            return Err(DaserError::InvalidConfig(
                "concurrency_limit must be positive".into(),
            ));
        }
        if self.genesis_height == 0 {
            return Err(DaserError::InvalidConfig(
                "genesis_height must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Arguments used to configure the [`Daser`].
pub struct DaserArgs<H>
where
    H: DasHeader,
{
    /// The sampling operation run for every header.
    pub availability: Arc<dyn Availability<H>>,
    /// Source of new network head announcements.
    pub subscriber: Arc<dyn HeaderSubscriber<H>>,
    /// Resolver of past headers.
    pub getter: Arc<dyn HeaderGetter<H>>,
    /// Storage for the sampling checkpoint.
    pub store: Arc<dyn CheckpointStore>,
    /// Scheduler tunables.
    pub params: DaserParams,
}

/// Component scheduling data availability sampling over block heights.
pub struct Daser<H>
where
    H: DasHeader,
{
    params: DaserParams,
    availability: Arc<dyn Availability<H>>,
    subscriber: Arc<dyn HeaderSubscriber<H>>,
    getter: Arc<dyn HeaderGetter<H>>,
    store: Arc<dyn CheckpointStore>,
    events: EventChannel,
    running: Mutex<Option<Running>>,
}

struct Running {
    coordinator: Arc<SamplingCoordinator>,
    cancellation_token: CancellationToken,
    subscriber_handle: JoinHandle,
    store_handle: JoinHandle,
}

impl<H> Daser<H>
where
    H: DasHeader,
{
    /// Creates a new [`Daser`] without starting it.
    pub fn new(args: DaserArgs<H>) -> Result<Daser<H>> {
        args.params.validate()?;

        Ok(Daser {
            params: args.params,
            availability: args.availability,
            subscriber: args.subscriber,
            getter: args.getter,
            store: args.store,
            events: EventChannel::new(),
            running: Mutex::new(None),
        })
    }

    /// Returns a new subscriber to the sampling events.
    pub fn event_subscriber(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    /// Subscribes to head announcements and starts the sampling routine
    /// from the stored checkpoint.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DaserError::AlreadyStarted);
        }

        let subscription = self.subscriber.subscribe().await?;

        let checkpoint = match self.store.load().await {
            Ok(checkpoint) => checkpoint,
            Err(StoreError::NotFound) => {
                warn!(
                    "checkpoint not found, initializing sampling from height {}",
                    self.params.genesis_height
                );

                let mut checkpoint = Checkpoint::initial(self.params.genesis_height);

                // Best effort head probe. If it fails the subscriber will
                // deliver a head once the node is connected.
                if let Ok(head) = self.getter.head().await {
                    checkpoint.network_head = checkpoint.network_head.max(head.height());
                }

                checkpoint
            }
            Err(e) => return Err(e.into()),
        };

        info!("starting sampling from checkpoint: {checkpoint}");

        let cancellation_token = CancellationToken::new();

        let availability = self.availability.clone();
        let sample_fn: SampleFn<H> = Arc::new(move |header: H| {
            let availability = availability.clone();
            async move { availability.shares_available(&header).await }.boxed()
        });

        let coordinator = Arc::new(SamplingCoordinator::start(
            CoordinatorArgs {
                getter: self.getter.clone(),
                sample_fn,
                event_pub: self.events.publisher(),
                sampling_range: self.params.sampling_range,
                concurrency_limit: self.params.concurrency_limit,
                priority_queue_size: self.params.priority_queue_size,
            },
            checkpoint,
            cancellation_token.child_token(),
        ));

        let subscriber_handle = {
            let coordinator = coordinator.clone();
            spawn_forwarder(
                subscription,
                move |height| coordinator.listen(height),
                cancellation_token.child_token(),
            )
        };

        let store_handle = spawn_background_store(
            self.store.clone(),
            coordinator.clone(),
            self.params.bg_store_interval,
            cancellation_token.child_token(),
        );

        *running = Some(Running {
            coordinator,
            cancellation_token,
            subscriber_handle,
            store_handle,
        });

        Ok(())
    }

    /// Stops sampling, waits for the workers to wind down and stores the
    /// final checkpoint.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.take() else {
            return Ok(());
        };

        // Store a checkpoint right away, without waiting for the workers to
        // finish their current heights.
        match running.coordinator.checkpoint().await {
            Ok(checkpoint) => {
                if let Err(e) = self.store.store(&checkpoint).await {
                    error!("storing checkpoint failed: {e}");
                }
            }
            Err(e) => error!("sampling coordinator checkpoint is unavailable: {e}"),
        }

        running.cancellation_token.cancel();
        running.coordinator.join().await;
        running.subscriber_handle.join().await;
        running.store_handle.join().await;

        // All workers have quiesced, store the definitive progress.
        let checkpoint = running.coordinator.checkpoint().await?;
        self.store.store(&checkpoint).await?;

        debug!("DASer stopped at checkpoint: {checkpoint}");
        Ok(())
    }

    /// Blocks until the sampling routine has fully stopped or `ctx` fires,
    /// whichever comes first.
    pub async fn wait(&self, ctx: &CancellationToken) -> Result<()> {
        let coordinator = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .ok_or(DaserError::NotRunning)?
                .coordinator
                .clone()
        };

        Ok(coordinator.wait(ctx).await?)
    }

    /// Resolves once every known height has been sampled and the workers
    /// went idle. Re-arms itself when a new head is announced afterwards.
    pub async fn wait_catch_up(&self) -> Result<()> {
        let coordinator = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .ok_or(DaserError::NotRunning)?
                .coordinator
                .clone()
        };

        coordinator.wait_catch_up().await;
        Ok(())
    }

    /// Returns the current sampling progress metrics.
    pub async fn sampling_stats(&self) -> Result<SamplingStats> {
        let coordinator = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .ok_or(DaserError::NotRunning)?
                .coordinator
                .clone()
        };

        Ok(coordinator.stats().await?)
    }
}

impl<H> Drop for Daser<H>
where
    H: DasHeader,
{
    fn drop(&mut self) {
        if let Ok(running) = self.running.try_lock() {
            if let Some(running) = running.as_ref() {
                running.cancellation_token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCheckpointStore;
    use crate::test_utils::{MockSampler, StubGetter, TestSubscriber};
    use std::collections::BTreeMap;
    use tokio::time::{sleep, timeout};

    const TEST_TIMEOUT: Duration = Duration::from_secs(60);

    fn new_daser(
        sampler: &Arc<MockSampler>,
        store: Arc<dyn CheckpointStore>,
        subscriber: Arc<TestSubscriber>,
    ) -> Daser<crate::test_utils::TestHeader> {
        Daser::new(DaserArgs {
            availability: sampler.clone(),
            subscriber,
            getter: Arc::new(StubGetter),
            store,
            params: DaserParams::default()
                .with_sampling_range(10)
                .with_concurrency_limit(4)
                .with_bg_store_interval(Duration::from_millis(50)),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_invalid_params() {
        let sampler = MockSampler::new(1, 10, &[]);

        let res = Daser::new(DaserArgs {
            availability: sampler.clone(),
            subscriber: Arc::new(TestSubscriber::new()),
            getter: Arc::new(StubGetter),
            store: Arc::new(InMemoryCheckpointStore::new()),
            params: DaserParams::default().with_bg_store_interval(Duration::ZERO),
        });

        assert!(matches!(res, Err(DaserError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn rejects_double_start() {
        let sampler = MockSampler::new(1, 10, &[]);
        let subscriber = Arc::new(TestSubscriber::new());
        let daser = new_daser(&sampler, Arc::new(InMemoryCheckpointStore::new()), subscriber);

        daser.start().await.unwrap();
        assert!(matches!(daser.start().await, Err(DaserError::AlreadyStarted)));

        daser.stop().await.unwrap();
        // stopping twice is fine
        daser.stop().await.unwrap();
    }

    #[tokio::test]
    async fn samples_announced_heads_and_persists_progress() {
        let sampler = MockSampler::new(1, 1, &[]);
        let store = Arc::new(InMemoryCheckpointStore::new());
        let subscriber = Arc::new(TestSubscriber::new());
        let daser = new_daser(&sampler, store.clone(), subscriber.clone());

        let mut events = daser.event_subscriber();

        daser.start().await.unwrap();

        for height in [20, 45] {
            sampler.announce(height);
            subscriber.announce(height);
        }

        timeout(TEST_TIMEOUT, sampler.finished()).await.unwrap();
        timeout(TEST_TIMEOUT, async {
            loop {
                let stats = daser.sampling_stats().await.unwrap();
                if stats.catch_up_done && stats.network_head == 45 {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        daser.stop().await.unwrap();

        let stored = store.load().await.unwrap();
        assert_eq!(stored.sample_from, 46);
        assert_eq!(stored.network_head, 45);
        assert!(stored.failed.is_empty());
        assert!(stored.workers.is_empty());

        // the event stream saw the catch-up
        let mut caught_up = false;
        while let Ok(info) = events.try_recv() {
            if matches!(info.event, crate::events::DasEvent::CaughtUp { .. }) {
                caught_up = true;
            }
        }
        assert!(caught_up);
    }

    #[tokio::test]
    async fn restart_does_not_resample_finished_heights() {
        let sampler = MockSampler::new(1, 30, &[]);
        let store = Arc::new(InMemoryCheckpointStore::new());

        let subscriber = Arc::new(TestSubscriber::new());
        let daser = new_daser(&sampler, store.clone(), subscriber.clone());
        daser.start().await.unwrap();
        subscriber.announce(30);

        timeout(TEST_TIMEOUT, sampler.finished()).await.unwrap();
        timeout(TEST_TIMEOUT, async {
            loop {
                let stats = daser.sampling_stats().await.unwrap();
                if stats.catch_up_done && stats.network_head == 30 {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        daser.stop().await.unwrap();
        assert_eq!(store.load().await.unwrap().sample_from, 31);

        let sampled_before = sampler.sampled_amount();

        // second run resumes from the stored checkpoint and stays idle
        let subscriber = Arc::new(TestSubscriber::new());
        let daser = new_daser(&sampler, store.clone(), subscriber);
        daser.start().await.unwrap();

        timeout(TEST_TIMEOUT, daser.wait_catch_up()).await.unwrap().unwrap();

        daser.stop().await.unwrap();
        assert_eq!(sampler.sampled_amount(), sampled_before);
    }

    #[tokio::test]
    async fn background_store_persists_during_run() {
        let failed_last_run = BTreeMap::from([(3, 1)]);
        let sampler = MockSampler::resumed(11, 10, failed_last_run.clone(), &[3]);
        let store = Arc::new(InMemoryCheckpointStore::new());
        store
            .store(&Checkpoint {
                sample_from: 11,
                network_head: 10,
                failed: failed_last_run,
                workers: Vec::new(),
            })
            .await
            .unwrap();

        let subscriber = Arc::new(TestSubscriber::new());
        let daser = new_daser(&sampler, store.clone(), subscriber);
        daser.start().await.unwrap();

        // the retry of height 3 fails again and the background driver picks
        // it up without a stop
        timeout(TEST_TIMEOUT, async {
            loop {
                if let Ok(cp) = store.load().await {
                    if cp.failed.get(&3) == Some(&2) {
                        break;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        daser.stop().await.unwrap();
    }

    #[tokio::test]
    async fn wait_requires_running_daser() {
        let sampler = MockSampler::new(1, 10, &[]);
        let subscriber = Arc::new(TestSubscriber::new());
        let daser = new_daser(
            &sampler,
            Arc::new(InMemoryCheckpointStore::new()),
            subscriber,
        );

        let ctx = CancellationToken::new();
        assert!(matches!(
            daser.wait(&ctx).await,
            Err(DaserError::NotRunning)
        ));
    }
}
