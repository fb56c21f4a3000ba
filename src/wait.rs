//! Suspension primitives shared by every unit.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The scope's token fired before the wait resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Which side of a [`first_of`] race won.
#[derive(Debug, PartialEq)]
pub enum Resolved<T> {
    Signal(T),
    Ceiling,
}

/// Sleep for `duration` unless `token` is cancelled first.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Await `signal`, giving up after `ceiling`. Cancellation wins ties.
pub async fn first_of<F>(
    ceiling: Duration,
    signal: F,
    token: &CancellationToken,
) -> Result<Resolved<F::Output>, Cancelled>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        value = signal => Ok(Resolved::Signal(value)),
        _ = tokio::time::sleep(ceiling) => Ok(Resolved::Ceiling),
    }
}
