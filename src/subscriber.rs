use async_trait::async_trait;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::{spawn, JoinHandle};
use crate::header::DasHeader;

/// Source of network head announcements.
#[async_trait]
pub trait HeaderSubscriber<H>: Send + Sync
where
    H: DasHeader,
{
    /// Starts a new subscription to head announcements.
    async fn subscribe(&self) -> Result<BoxedHeaderSubscription<H>, SubscriberError>;
}

pub type BoxedHeaderSubscription<H> = Box<dyn HeaderSubscription<H>>;

/// A lazy sequence of headers announced on the network.
#[async_trait]
pub trait HeaderSubscription<H>: Send
where
    H: DasHeader,
{
    /// Returns the next announced header, or `None` when the feed ends.
    async fn next_head(&mut self) -> Option<H>;
}

#[derive(Debug, thiserror::Error)]
#[error("Header subscription failed: {0}")]
pub struct SubscriberError(pub String);

/// Forwards announced heights to the coordinator until the feed ends or the
/// token fires.
///
/// The shim only emits; it holds a plain callback instead of the
/// coordinator itself.
pub(crate) fn spawn_forwarder<H, F>(
    mut subscription: BoxedHeaderSubscription<H>,
    listen: F,
    cancellation_token: CancellationToken,
) -> JoinHandle
where
    H: DasHeader,
    F: Fn(u64) + Send + 'static,
{
    spawn(async move {
        loop {
            select! {
                _ = cancellation_token.cancelled() => break,
                head = subscription.next_head() => {
                    match head {
                        Some(header) => listen(header.height()),
                        None => {
                            debug!("header subscription ended");
                            break;
                        }
                    }
                }
            }
        }

        debug!("subscriber stopped");
    })
}
