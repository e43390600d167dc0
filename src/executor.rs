use std::fmt::{self, Debug};
use std::future::Future;

use tokio_util::sync::CancellationToken;

/// Naive `JoinHandle` implementation.
///
/// Unlike [`tokio::task::JoinHandle`] it can be awaited multiple times
/// and from multiple places.
pub(crate) struct JoinHandle(CancellationToken);

impl JoinHandle {
    /// Await for the handle to return.
    pub(crate) async fn join(&self) {
        self.0.cancelled().await;
    }

    /// Returns true if the task has run to completion.
    pub(crate) fn is_finished(&self) -> bool {
        self.0.is_cancelled()
    }
}

impl Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JoinHandle { .. }")
    }
}

/// Spawn a future on the tokio executor.
#[track_caller]
pub(crate) fn spawn<F>(future: F) -> JoinHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();

    tokio::spawn(async move {
        let _guard = guard;
        future.await;
    });

    JoinHandle(token)
}
