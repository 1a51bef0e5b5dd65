//! One-shot readiness signal.
//!
//! Initialization runs once; every consumption call awaits its outcome. The signal is
//! resolved exactly once, to either ready or the initialization error, and waiters that
//! arrive afterwards see the stored outcome immediately.

use crate::error::BucketError;
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum State {
    Pending,
    Ready,
    Failed(BucketError),
}

/// Receiving side, cloned into every limiter handle.
#[derive(Debug, Clone)]
pub struct Readiness {
    rx: watch::Receiver<State>,
}

/// Sending side, owned by the initialization task.
#[derive(Debug)]
pub struct ReadinessSignal {
    tx: watch::Sender<State>,
}

/// Create a linked signal/readiness pair in the pending state.
pub fn channel() -> (ReadinessSignal, Readiness) {
    let (tx, rx) = watch::channel(State::Pending);
    (ReadinessSignal { tx }, Readiness { rx })
}

impl ReadinessSignal {
    /// Release all waiters with the initialization outcome. Consumes the signal so it
    /// can only fire once.
    pub fn resolve(self, outcome: Result<(), BucketError>) {
        let state = match outcome {
            Ok(()) => State::Ready,
            Err(e) => State::Failed(e),
        };
        // `send_replace` succeeds even when no receiver is alive.
        self.tx.send_replace(state);
    }
}

impl Drop for ReadinessSignal {
    fn drop(&mut self) {
        // An init task that panicked or was aborted must not leave waiters hanging.
        self.tx.send_if_modified(|state| {
            if matches!(state, State::Pending) {
                *state = State::Failed(BucketError::InitializationAborted);
                true
            } else {
                false
            }
        });
    }
}

impl Readiness {
    /// Wait until initialization has finished.
    ///
    /// Returns `Err(BucketError::Initialization(..))` if it failed.
    pub async fn wait(&self) -> Result<(), BucketError> {
        let mut rx = self.rx.clone();
        let outcome = rx.wait_for(|s| !matches!(s, State::Pending)).await.map(|s| (*s).clone());
        let state = match outcome {
            Ok(state) => state,
            // Sender gone; whatever it left behind is final.
            Err(_) => rx.borrow().clone(),
        };
        match state {
            State::Ready => Ok(()),
            State::Failed(e) => Err(BucketError::Initialization(Box::new(e))),
            State::Pending => {
                Err(BucketError::Initialization(Box::new(BucketError::InitializationAborted)))
            }
        }
    }

    /// Non-blocking check.
    pub fn is_ready(&self) -> bool {
        matches!(*self.rx.borrow(), State::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn waiters_are_released_on_ready() {
        let (signal, readiness) = channel();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let r = readiness.clone();
                tokio::spawn(async move { r.wait().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!readiness.is_ready());
        signal.resolve(Ok(()));
        for w in futures::future::join_all(waiters).await {
            assert!(w.unwrap().is_ok());
        }
        assert!(readiness.is_ready());
        assert!(readiness.wait().await.is_ok(), "late waiters see the stored outcome");
    }

    #[tokio::test]
    async fn waiters_receive_the_init_error() {
        let (signal, readiness) = channel();
        let waiter = {
            let r = readiness.clone();
            tokio::spawn(async move { r.wait().await })
        };
        signal.resolve(Err(BucketError::InvalidConfig("boom".into())));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_initialization());
        assert!(err.to_string().contains("boom"));
        assert!(readiness.wait().await.is_err());
    }

    #[tokio::test]
    async fn dropped_signal_fails_waiters() {
        let (signal, readiness) = channel();
        drop(signal);
        let err = readiness.wait().await.unwrap_err();
        assert!(err.is_initialization());
    }
}
