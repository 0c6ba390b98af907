//! Single-use readiness latch.
//!
//! The request task resolves it once the session terminal exists; the main
//! session flow awaits it before any I/O starts. Both halves are consumed on
//! use, so the latch fires at most once and is awaited at most once.

use tokio::sync::oneshot;

/// Why a waiter did not receive a value.
#[derive(Debug, thiserror::Error)]
pub enum NotReady<E> {
    /// The resolving side reported a failure.
    #[error("{0}")]
    Failed(E),
    /// The resolving side went away without resolving.
    #[error("latch dropped before it was resolved")]
    Abandoned,
}

/// Resolving half of the latch.
pub struct ReadySignal<T, E> {
    tx: oneshot::Sender<Result<T, E>>,
}

impl<T, E> ReadySignal<T, E> {
    /// Hand `value` to the waiter. Returns false if the waiter is gone, in
    /// which case `value` is dropped.
    pub fn ready(self, value: T) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    /// Wake the waiter with a failure.
    pub fn fail(self, err: E) {
        let _ = self.tx.send(Err(err));
    }
}

/// Waiting half of the latch.
pub struct ReadyWaiter<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> ReadyWaiter<T, E> {
    pub async fn wait(self) -> Result<T, NotReady<E>> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(NotReady::Failed(err)),
            Err(_) => Err(NotReady::Abandoned),
        }
    }
}

pub fn latch<T, E>() -> (ReadySignal<T, E>, ReadyWaiter<T, E>) {
    let (tx, rx) = oneshot::channel();
    (ReadySignal { tx }, ReadyWaiter { rx })
}
