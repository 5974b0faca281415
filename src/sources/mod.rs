//! Focus and online event sources
//!
//! Observable boolean lifecycles. The library never detects platform focus or
//! connectivity itself; platform adapters drive the setters and every
//! observer subscribed to the watch channel reacts to the edges.

use std::sync::Arc;

use tokio::sync::watch;

/// Observable connectivity state. Defaults to online.
#[derive(Clone, Debug)]
pub struct OnlineSource {
    tx: Arc<watch::Sender<bool>>,
}

impl OnlineSource {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Drive the state; subscribers only wake on actual edges.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for OnlineSource {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Observable window-focus state. Defaults to focused.
#[derive(Clone, Debug)]
pub struct FocusSource {
    tx: Arc<watch::Sender<bool>>,
}

impl FocusSource {
    pub fn new(initially_focused: bool) -> Self {
        let (tx, _) = watch::channel(initially_focused);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_focused(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_focused(&self, focused: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != focused;
            *current = focused;
            changed
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for FocusSource {
    fn default() -> Self {
        Self::new(true)
    }
}
