//! Conflict-handling reconcile wrapper
//!
//! Optimistic-concurrency conflicts are expected whenever two writers touch
//! the same object (typically status). A pass that failed only because of
//! conflicts is requeued quietly after a short delay instead of being
//! reported as an error, which would log a failure and trigger the runtime's
//! error backoff.

use std::future::Future;
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::debug;

use crate::Error;

/// Await a reconcile future, turning pure conflicts into a requeue.
///
/// "Pure" means every distinct cause is a conflict, see
/// [`Error::is_pure_conflict`]. Any other error is returned unchanged.
pub async fn handle_conflicts<F>(reconcile: F, requeue_after: Duration) -> Result<Action, Error>
where
    F: Future<Output = Result<Action, Error>>,
{
    match reconcile.await {
        Err(e) if e.is_pure_conflict() => {
            debug!(error = %e, requeue_secs = requeue_after.as_secs(), "conflict during reconcile, requeueing");
            Ok(Action::requeue(requeue_after))
        }
        other => other,
    }
}
