//! Mock collaborators for exercising the sampling scheduler.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};

use crate::availability::{Availability, SamplingError};
use crate::checkpoint::Checkpoint;
use crate::coordinator::SamplingCoordinator;
use crate::header::{DasHeader, GetterError, HeaderGetter};
use crate::subscriber::{
    BoxedHeaderSubscription, HeaderSubscriber, HeaderSubscription, SubscriberError,
};
use crate::worker::SampleFn;

/// A minimal header carrying nothing but its height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestHeader {
    pub height: u64,
}

impl DasHeader for TestHeader {
    fn height(&self) -> u64 {
        self.height
    }
}

/// Getter that resolves any height instantly.
pub struct StubGetter;

#[async_trait]
impl HeaderGetter<TestHeader> for StubGetter {
    async fn head(&self) -> Result<TestHeader, GetterError> {
        Err(GetterError::NotFound)
    }

    async fn get_by_height(&self, height: u64) -> Result<TestHeader, GetterError> {
        Ok(TestHeader { height })
    }
}

/// Records which heights were sampled and verifies they stay in the
/// expected window.
pub struct MockSampler {
    inner: Mutex<MockSamplerInner>,
    finished: watch::Sender<bool>,
}

struct MockSamplerInner {
    sample_from: u64,
    network_head: u64,
    known_failed: BTreeMap<u64, u16>,
    born_to_fail: HashSet<u64>,
    done: HashMap<u64, usize>,
}

impl MockSampler {
    pub fn new(sample_from: u64, network_head: u64, born_to_fail: &[u64]) -> Arc<MockSampler> {
        MockSampler::resumed(sample_from, network_head, BTreeMap::new(), born_to_fail)
    }

    /// A sampler whose checkpoint carries failures from a previous run.
    /// Heights in `failed` are accepted even when they fall below
    /// `sample_from`.
    pub fn resumed(
        sample_from: u64,
        network_head: u64,
        failed: BTreeMap<u64, u16>,
        born_to_fail: &[u64],
    ) -> Arc<MockSampler> {
        let (finished, _) = watch::channel(false);

        Arc::new(MockSampler {
            inner: Mutex::new(MockSamplerInner {
                sample_from,
                network_head,
                known_failed: failed,
                born_to_fail: born_to_fail.iter().copied().collect(),
                done: HashMap::new(),
            }),
            finished,
        })
    }

    fn sample(&self, height: u64) -> Result<(), SamplingError> {
        let mut inner = self.inner.lock().unwrap();

        *inner.done.entry(height).or_insert(0) += 1;

        let expected = inner.network_head.saturating_sub(inner.sample_from) as usize;
        if inner.done.len() > expected {
            self.finished.send_replace(true);
        }

        if inner.born_to_fail.contains(&height) {
            return Err(SamplingError::Transient("born to fail".into()));
        }

        if (height < inner.sample_from || height > inner.network_head)
            && !inner.known_failed.contains_key(&height)
        {
            return Err(SamplingError::Transient(format!(
                "height {height} out of range {}..{}",
                inner.sample_from, inner.network_head
            )));
        }

        Ok(())
    }

    /// Raises the head the sampler accepts heights up to, re-opening the
    /// finished signal when it was already closed.
    pub fn announce(&self, height: u64) {
        let mut inner = self.inner.lock().unwrap();

        if height > inner.network_head {
            inner.network_head = height;
            self.finished.send_replace(false);
        }
    }

    /// Announces `height` to both the sampler and the coordinator.
    pub(crate) fn discover(&self, coordinator: &SamplingCoordinator, height: u64) {
        self.announce(height);
        coordinator.listen(height);
    }

    /// Resolves when every height of the expected range was sampled.
    pub async fn finished(&self) {
        let mut rx = self.finished.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn sampled_amount(&self) -> usize {
        self.inner.lock().unwrap().done.len()
    }

    pub fn done_amount(&self) -> usize {
        self.sampled_amount()
    }

    pub fn height_is_done(&self, height: u64) -> bool {
        self.inner.lock().unwrap().done.contains_key(&height)
    }

    /// Checkpoint the scheduler starts from.
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        let inner = self.inner.lock().unwrap();

        Checkpoint {
            sample_from: inner.sample_from,
            network_head: inner.network_head,
            failed: inner.known_failed.clone(),
            workers: Vec::new(),
        }
    }

    /// Checkpoint expected after a full catch-up with no failures.
    pub(crate) fn final_checkpoint(&self) -> Checkpoint {
        let inner = self.inner.lock().unwrap();

        Checkpoint {
            sample_from: inner.network_head + 1,
            network_head: inner.network_head,
            failed: BTreeMap::new(),
            workers: Vec::new(),
        }
    }
}

/// The mock's sampling operation as a plain function object, ready to be
/// wrapped by the middleware below.
pub(crate) fn sample_fn(sampler: &Arc<MockSampler>) -> SampleFn<TestHeader> {
    let sampler = sampler.clone();

    Arc::new(move |header: TestHeader| {
        let sampler = sampler.clone();
        futures::future::ready(sampler.sample(header.height)).boxed()
    })
}

#[async_trait]
impl Availability<TestHeader> for MockSampler {
    async fn shares_available(&self, header: &TestHeader) -> Result<(), SamplingError> {
        self.sample(header.height)
    }
}

/// Errors when a height is sampled a second time.
pub(crate) fn once_middleware(out: SampleFn<TestHeader>) -> SampleFn<TestHeader> {
    let seen = Arc::new(Mutex::new(HashMap::<u64, usize>::new()));

    Arc::new(move |header: TestHeader| {
        let seen = seen.clone();
        let out = out.clone();

        async move {
            {
                let mut seen = seen.lock().unwrap();
                let count = seen.entry(header.height).or_insert(0);
                *count += 1;

                if *count > 1 {
                    return Err(SamplingError::Transient(format!(
                        "height {} sampled more than once",
                        header.height
                    )));
                }
            }

            out(header).await
        }
        .boxed()
    })
}

/// Verifies that heights are sampled in an expected order.
pub(crate) struct CheckOrder {
    queue: Mutex<VecDeque<u64>>,
}

impl CheckOrder {
    pub(crate) fn new() -> Arc<CheckOrder> {
        Arc::new(CheckOrder {
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn add_interval(&self, from: u64, to: u64) {
        let mut queue = self.queue.lock().unwrap();
        queue.extend(from..=to);
    }

    /// Expects `[from..to]` split into `bucket`-sized chunks served highest
    /// chunk first, heights within a chunk ascending.
    pub(crate) fn add_stacks(&self, from: u64, to: u64, bucket: u64) {
        let mut chunks = Vec::new();
        let mut start = from;

        while start <= to {
            let end = (start + bucket - 1).min(to);
            chunks.push(start..=end);
            start = end + 1;
        }

        let mut queue = self.queue.lock().unwrap();
        for chunk in chunks.into_iter().rev() {
            queue.extend(chunk);
        }
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    fn check(&self, height: u64) -> Result<(), SamplingError> {
        let mut queue = self.queue.lock().unwrap();

        if let Some(&expected) = queue.front() {
            if expected != height {
                return Err(SamplingError::Transient(format!(
                    "expected height {expected}, got {height}"
                )));
            }
            queue.pop_front();
        }

        Ok(())
    }
}

pub(crate) fn order_middleware(
    order: &Arc<CheckOrder>,
    out: SampleFn<TestHeader>,
) -> SampleFn<TestHeader> {
    let order = order.clone();

    Arc::new(move |header: TestHeader| {
        let order = order.clone();
        let out = out.clone();

        async move {
            order.check(header.height)?;
            out(header).await
        }
        .boxed()
    })
}

/// Blocks sampling of chosen heights until they are released.
pub(crate) struct SampleLock {
    blocked: Mutex<HashMap<u64, watch::Sender<bool>>>,
}

impl SampleLock {
    pub(crate) fn new(from: u64, to: u64) -> Arc<SampleLock> {
        let lock = Arc::new(SampleLock {
            blocked: Mutex::new(HashMap::new()),
        });
        lock.add(&(from..=to).collect::<Vec<_>>());
        lock
    }

    pub(crate) fn add(&self, heights: &[u64]) {
        let mut blocked = self.blocked.lock().unwrap();
        for &height in heights {
            let (tx, _) = watch::channel(false);
            blocked.insert(height, tx);
        }
    }

    pub(crate) fn release(&self, heights: &[u64]) {
        let mut blocked = self.blocked.lock().unwrap();
        for height in heights {
            if let Some(tx) = blocked.remove(height) {
                let _ = tx.send(true);
            }
        }
    }

    pub(crate) fn release_all(&self, except: &[u64]) {
        let mut blocked = self.blocked.lock().unwrap();
        let released = blocked
            .keys()
            .copied()
            .filter(|height| !except.contains(height))
            .collect::<Vec<_>>();

        for height in released {
            if let Some(tx) = blocked.remove(&height) {
                let _ = tx.send(true);
            }
        }
    }

    fn waiter(&self, height: u64) -> Option<watch::Receiver<bool>> {
        self.blocked
            .lock()
            .unwrap()
            .get(&height)
            .map(|tx| tx.subscribe())
    }
}

pub(crate) fn lock_middleware(
    lock: &Arc<SampleLock>,
    out: SampleFn<TestHeader>,
) -> SampleFn<TestHeader> {
    let lock = lock.clone();

    Arc::new(move |header: TestHeader| {
        let lock = lock.clone();
        let out = out.clone();

        async move {
            if let Some(mut waiter) = lock.waiter(header.height) {
                // released either by a send or by dropping the sender
                let _ = waiter.wait_for(|released| *released).await;
            }

            out(header).await
        }
        .boxed()
    })
}

/// Subscriber fed manually from tests.
pub struct TestSubscriber {
    tx: mpsc::UnboundedSender<u64>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl TestSubscriber {
    pub fn new() -> TestSubscriber {
        let (tx, rx) = mpsc::unbounded_channel();
        TestSubscriber {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn announce(&self, height: u64) {
        let _ = self.tx.send(height);
    }
}

impl Default for TestSubscriber {
    fn default() -> Self {
        TestSubscriber::new()
    }
}

#[async_trait]
impl HeaderSubscriber<TestHeader> for TestSubscriber {
    async fn subscribe(&self) -> Result<BoxedHeaderSubscription<TestHeader>, SubscriberError> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SubscriberError("already subscribed".into()))?;

        Ok(Box::new(TestSubscription { rx }))
    }
}

struct TestSubscription {
    rx: mpsc::UnboundedReceiver<u64>,
}

#[async_trait]
impl HeaderSubscription<TestHeader> for TestSubscription {
    async fn next_head(&mut self) -> Option<TestHeader> {
        self.rx.recv().await.map(|height| TestHeader { height })
    }
}
