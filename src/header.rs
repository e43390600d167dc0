use async_trait::async_trait;

type Result<T, E = GetterError> = std::result::Result<T, E>;

/// A block header as seen by the sampling scheduler.
///
/// The scheduler treats headers as opaque handles; only the height matters
/// for bookkeeping. The actual header contents are consumed by the
/// [`Availability`] implementation.
///
/// [`Availability`]: crate::availability::Availability
pub trait DasHeader: Send + Sync + 'static {
    /// Height of the block this header belongs to.
    fn height(&self) -> u64;
}

/// Resolver of historical headers.
#[async_trait]
pub trait HeaderGetter<H>: Send + Sync
where
    H: DasHeader,
{
    /// Returns the header of the current network head.
    ///
    /// Used only at startup to seed the sampling target when no checkpoint
    /// exists yet.
    async fn head(&self) -> Result<H>;

    /// Returns the header of the given height.
    ///
    /// Must eventually succeed for any height at or below the network head.
    async fn get_by_height(&self, height: u64) -> Result<H>;
}

/// Representation of the errors that a [`HeaderGetter`] can produce.
#[derive(Debug, thiserror::Error)]
pub enum GetterError {
    /// Header does not exist (yet) in the backing source.
    #[error("Header not found")]
    NotFound,

    /// A transient failure; the lookup may succeed when retried.
    #[error("Header lookup failed: {0}")]
    Transient(String),
}
