use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, TableDefinition};
use tokio::select;
use tokio::sync::RwLock;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::checkpoint::Checkpoint;
use crate::coordinator::SamplingCoordinator;
use crate::executor::{spawn, JoinHandle};

const CHECKPOINT_KEY: &str = "checkpoint";
const CHECKPOINT_TABLE: TableDefinition<'static, &str, &[u8]> =
    TableDefinition::new("DAS.CHECKPOINT");

type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Persistent storage for the sampling checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the last stored checkpoint.
    async fn load(&self) -> Result<Checkpoint>;

    /// Persists the checkpoint, replacing any previous one.
    async fn store(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Representation of the errors that can occur in a [`CheckpointStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No checkpoint was stored yet; sampling starts from genesis.
    #[error("Checkpoint not found")]
    NotFound,

    /// Stored blob could not be parsed or written.
    #[error("Stored checkpoint data in inconsistent state: {0}")]
    StoredDataError(String),

    /// The backing storage failed.
    #[error("Persistent storage reported unrecoverable error: {0}")]
    BackingStoreError(String),

    /// A blocking storage task failed to run to completion.
    #[error("Received error from executor: {0}")]
    ExecutorError(String),

    /// The backing storage could not be opened.
    #[error("Error opening store: {0}")]
    OpenFailed(String),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::BackingStoreError(e.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::BackingStoreError(e.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::BackingStoreError(e.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::BackingStoreError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::ExecutorError(e.to_string())
    }
}

/// A non-persistent in-memory [`CheckpointStore`].
///
/// Keeps the serialised blob rather than the value, so loads exercise the
/// same parsing path as the persistent stores.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    blob: RwLock<Option<Vec<u8>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> InMemoryCheckpointStore {
        InMemoryCheckpointStore::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self) -> Result<Checkpoint> {
        let blob = self.blob.read().await;
        let bytes = blob.as_deref().ok_or(StoreError::NotFound)?;
        serde_json::from_slice(bytes).map_err(|e| StoreError::StoredDataError(e.to_string()))
    }

    async fn store(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)
            .map_err(|e| StoreError::StoredDataError(e.to_string()))?;
        *self.blob.write().await = Some(bytes);
        Ok(())
    }
}

/// A [`CheckpointStore`] backed by a [`redb`] database.
#[derive(Debug)]
pub struct RedbCheckpointStore {
    db: Arc<Database>,
}

impl RedbCheckpointStore {
    /// Opens a persistent store at `path`, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<RedbCheckpointStore> {
        let path = path.as_ref().to_owned();

        let db = spawn_blocking(|| Database::create(path))
            .await?
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;

        RedbCheckpointStore::new(Arc::new(db)).await
    }

    /// Opens an in-memory store, mainly for tests.
    pub async fn in_memory() -> Result<RedbCheckpointStore> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;

        RedbCheckpointStore::new(Arc::new(db)).await
    }

    /// Creates a store over an already opened [`redb::Database`].
    pub async fn new(db: Arc<Database>) -> Result<RedbCheckpointStore> {
        let store = RedbCheckpointStore { db };

        // make sure the table exists so loads don't have to care
        store
            .write_tx(|tx| {
                tx.open_table(CHECKPOINT_TABLE)?;
                Ok(())
            })
            .await?;

        Ok(store)
    }

    async fn read_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut redb::ReadTransaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();

        spawn_blocking(move || {
            let mut tx = db.begin_read()?;
            f(&mut tx)
        })
        .await?
    }

    /// Runs `f` inside a write transaction, committing when it succeeds and
    /// rolling the transaction back when it fails.
    async fn write_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut redb::WriteTransaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();

        spawn_blocking(move || {
            let mut tx = db.begin_write()?;
            let res = f(&mut tx);

            if res.is_ok() {
                tx.commit()?;
            } else {
                tx.abort()?;
            }

            res
        })
        .await?
    }
}

#[async_trait]
impl CheckpointStore for RedbCheckpointStore {
    async fn load(&self) -> Result<Checkpoint> {
        let bytes = self
            .read_tx(|tx| {
                let table = tx.open_table(CHECKPOINT_TABLE)?;
                let blob = table
                    .get(CHECKPOINT_KEY)?
                    .map(|guard| guard.value().to_vec());
                Ok(blob)
            })
            .await?
            .ok_or(StoreError::NotFound)?;

        serde_json::from_slice(&bytes).map_err(|e| StoreError::StoredDataError(e.to_string()))
    }

    async fn store(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)
            .map_err(|e| StoreError::StoredDataError(e.to_string()))?;

        self.write_tx(move |tx| {
            let mut table = tx.open_table(CHECKPOINT_TABLE)?;
            table.insert(CHECKPOINT_KEY, &bytes[..])?;
            Ok(())
        })
        .await
    }
}

/// Periodically snapshots the coordinator progress into the store, so a
/// crash only loses at most one interval worth of sampling.
pub(crate) fn spawn_background_store(
    store: Arc<dyn CheckpointStore>,
    coordinator: Arc<SamplingCoordinator>,
    interval: Duration,
    cancellation_token: CancellationToken,
) -> JoinHandle {
    spawn(async move {
        let mut interval = tokio::time::interval(interval);
        // in tokio the first tick returns immediately, consume it
        interval.tick().await;

        let mut last_stored: Option<Checkpoint> = None;

        loop {
            select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let checkpoint = match coordinator.checkpoint().await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    error!("sampling coordinator checkpoint is unavailable: {e}");
                    continue;
                }
            };

            if last_stored.as_ref() == Some(&checkpoint) {
                continue;
            }

            match store.store(&checkpoint).await {
                Ok(()) => {
                    debug!("stored checkpoint: {checkpoint}");
                    last_stored = Some(checkpoint);
                }
                Err(e) => error!("storing checkpoint failed: {e}"),
            }
        }

        debug!("background checkpoint store stopped");
    })
}
