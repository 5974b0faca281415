//! Cancellation signalling
//!
//! A [`CancelSource`] owns the cancelled flag; [`CancelToken`]s observe it.
//! Tokens are cheap to clone and can be linked, so a consumer-supplied signal
//! and an observer's internal source abort the same fetch: the token fires
//! when any linked source does.

use tokio::sync::watch;

/// Owning side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            channels: vec![self.tx.subscribe()],
        }
    }

    pub fn cancel(&self) {
        // send_replace reaches receivers even when none were subscribed yet
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side; fires when any linked source cancels.
#[derive(Debug, Clone)]
pub struct CancelToken {
    channels: Vec<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        Self { channels: vec![] }
    }

    /// Merge another token's sources into this one.
    pub fn link(mut self, other: CancelToken) -> Self {
        self.channels.extend(other.channels);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.channels.iter().any(|rx| *rx.borrow())
    }

    /// Resolves when any linked source cancels. Pends forever on a
    /// never-token or when every source was dropped without cancelling.
    pub async fn cancelled(&self) {
        let waits = self
            .channels
            .iter()
            .map(|rx| {
                let mut rx = rx.clone();
                Box::pin(async move {
                    loop {
                        if *rx.borrow() {
                            return;
                        }
                        if rx.changed().await.is_err() {
                            // Source dropped uncancelled; this branch can
                            // never fire.
                            futures::future::pending::<()>().await;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        if waits.is_empty() {
            futures::future::pending::<()>().await;
        } else {
            futures::future::select_all(waits).await;
        }
    }
}
