use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::future::BoxFuture;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::availability::SamplingError;
use crate::events::{DasEvent, EventPublisher};
use crate::header::{DasHeader, HeaderGetter};
use crate::queue::Job;

const MAX_GET_RETRIES: usize = 4;
const GET_BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(2);

/// Type-erased sampling operation.
///
/// Wrapping the [`Availability`] call in a plain function object keeps the
/// scheduler oblivious to what sampling actually does and lets tests stack
/// behaviours on top of it by composition.
///
/// [`Availability`]: crate::availability::Availability
pub(crate) type SampleFn<H> =
    Arc<dyn Fn(H) -> BoxFuture<'static, Result<(), SamplingError>> + Send + Sync>;

/// Per-height outcome reported back to the coordinator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SampleResult {
    pub(crate) job_id: u64,
    pub(crate) height: u64,
    pub(crate) status: SampleStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleStatus {
    Sampled,
    Failed,
    /// Shutdown interrupted the job; `height` is the first height that was
    /// not attempted.
    Aborted,
}

/// Samples every height of a single job, in ascending order.
pub(crate) struct Worker<H>
where
    H: DasHeader,
{
    pub(crate) job_id: u64,
    pub(crate) job: Job,
    pub(crate) getter: Arc<dyn HeaderGetter<H>>,
    pub(crate) sample_fn: SampleFn<H>,
    pub(crate) results: mpsc::Sender<SampleResult>,
    pub(crate) event_pub: EventPublisher,
    pub(crate) cancellation_token: CancellationToken,
}

impl<H> Worker<H>
where
    H: DasHeader,
{
    pub(crate) async fn run(self) {
        debug!("worker started on job {}", self.job);

        for height in self.job.from..=self.job.to {
            if self.cancellation_token.is_cancelled() {
                self.report(height, SampleStatus::Aborted).await;
                return;
            }

            let header = select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    self.report(height, SampleStatus::Aborted).await;
                    return;
                }
                header = self.get_header(height) => header,
            };

            let Some(header) = header else {
                self.report(height, SampleStatus::Failed).await;
                continue;
            };

            let now = Instant::now();

            let res = select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    self.report(height, SampleStatus::Aborted).await;
                    return;
                }
                res = (self.sample_fn)(header) => res,
            };

            let status = match res {
                Ok(()) => {
                    self.event_pub.send(DasEvent::SamplingFinished {
                        height,
                        accepted: true,
                        took: now.elapsed(),
                    });
                    SampleStatus::Sampled
                }
                Err(SamplingError::Cancelled) => {
                    self.report(height, SampleStatus::Aborted).await;
                    return;
                }
                Err(e) => {
                    warn!("sampling of height {height} failed: {e}");
                    self.event_pub.send(DasEvent::SamplingFinished {
                        height,
                        accepted: false,
                        took: now.elapsed(),
                    });
                    SampleStatus::Failed
                }
            };

            self.report(height, status).await;
        }

        debug!("worker finished job {}", self.job);
    }

    /// Resolves the header for `height`, retrying with backoff.
    ///
    /// Returns `None` once the attempts are exhausted; the height is then
    /// recorded as failed and picked up again on the next start.
    async fn get_header(&self, height: u64) -> Option<H> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_max_interval(GET_BACKOFF_MAX_INTERVAL)
            .with_max_elapsed_time(None)
            .build();

        for attempt in 1..=MAX_GET_RETRIES {
            match self.getter.get_by_height(height).await {
                Ok(header) => return Some(header),
                Err(e) if attempt < MAX_GET_RETRIES => {
                    debug!("header {height} lookup failed on attempt {attempt}: {e}");
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(GET_BACKOFF_MAX_INTERVAL);
                    sleep(delay).await;
                }
                Err(e) => {
                    warn!("header {height} could not be resolved: {e}");
                }
            }
        }

        None
    }

    async fn report(&self, height: u64, status: SampleStatus) {
        // Failing to deliver means the coordinator is gone and the
        // checkpoint with it, nothing left to do.
        let _ = self
            .results
            .send(SampleResult {
                job_id: self.job_id,
                height,
                status,
            })
            .await;
    }
}
