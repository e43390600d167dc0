use async_trait::async_trait;

use crate::header::DasHeader;

/// The data availability check performed for a single header.
///
/// Implementations assert that enough erasure-coded shares of the block are
/// retrievable from the network. How that is done (share selection, proof
/// verification, fraud handling) is entirely up to the implementation; the
/// scheduler only consumes the error contract.
#[async_trait]
pub trait Availability<H>: Send + Sync
where
    H: DasHeader,
{
    /// Verifies that shares of the block committed to by `header` are
    /// available.
    async fn shares_available(&self, header: &H) -> Result<(), SamplingError>;
}

/// Representation of the errors a sampling operation can produce.
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    /// Sampling was interrupted by shutdown.
    ///
    /// The only error kind that propagates; the interrupted height is
    /// re-attempted on the next start instead of being recorded as failed.
    #[error("Sampling cancelled")]
    Cancelled,

    /// The block data was found to be invalid.
    #[error("Byzantine data: {0}")]
    Byzantine(String),

    /// Shares could not be retrieved.
    #[error("Sampling failed: {0}")]
    Transient(String),
}
