//! Fan-out of swap updates to listeners.
//!
//! Every registered swap id owns a [`Broadcast`] any number of consumers can attach to until the
//! final update was delivered. A global broadcast receives every update regardless of id.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, Weak,
    },
};

use crate::swap::SwapUpdate;

struct BroadcastState<T> {
    next_key: u64,
    senders: Vec<(u64, Sender<T>)>,
    closed: bool,
}

/// A channel with any number of receivers.
pub struct Broadcast<T> {
    state: Arc<Mutex<BroadcastState<T>>>,
}

/// Detaches one receiver from its [`Broadcast`].
pub struct Unsubscribe<T> {
    state: Weak<Mutex<BroadcastState<T>>>,
    key: u64,
}

impl<T> Unsubscribe<T> {
    /// Stops delivery to the receiver this handle was created with. Its channel ends.
    pub fn unsubscribe(self) {
        if let Some(state) = self.state.upgrade() {
            if let Ok(mut state) = state.lock() {
                state.senders.retain(|(key, _)| *key != self.key);
            }
        }
    }
}

impl<T: Clone> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Broadcast<T> {
    /// Creates a broadcast without receivers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BroadcastState {
                next_key: 0,
                senders: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Attaches a new receiver. Receivers of a closed broadcast end immediately.
    pub fn subscribe(&self) -> (Receiver<T>, Unsubscribe<T>) {
        let (tx, rx) = mpsc::channel();
        let mut key = 0;
        if let Ok(mut state) = self.state.lock() {
            if !state.closed {
                key = state.next_key;
                state.next_key += 1;
                state.senders.push((key, tx));
            }
        }
        (
            rx,
            Unsubscribe {
                state: Arc::downgrade(&self.state),
                key,
            },
        )
    }

    /// Delivers `value` to every receiver and prunes dropped ones.
    pub fn send(&self, value: T) {
        if let Ok(mut state) = self.state.lock() {
            state
                .senders
                .retain(|(_, sender)| sender.send(value.clone()).is_ok());
        }
    }

    /// Ends every receiver. Later subscriptions end immediately.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.senders.clear();
        }
    }
}

/// Per swap and global listeners.
#[derive(Default)]
pub struct Registry {
    listeners: Mutex<HashMap<String, Broadcast<SwapUpdate>>>,
    global: Broadcast<SwapUpdate>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a listener for every id that has none yet.
    pub fn register(&self, ids: &[String]) {
        if let Ok(mut listeners) = self.listeners.lock() {
            for id in ids {
                listeners.entry(id.clone()).or_default();
            }
        }
    }

    /// Whether `id` has an open listener.
    pub fn is_registered(&self, id: &str) -> bool {
        self.listeners
            .lock()
            .map(|listeners| listeners.contains_key(id))
            .unwrap_or(false)
    }

    /// Updates of swap `id`. `None` when the swap is not registered or already final.
    pub fn updates_for(&self, id: &str) -> Option<(Receiver<SwapUpdate>, Unsubscribe<SwapUpdate>)> {
        let listeners = self.listeners.lock().ok()?;
        listeners.get(id).map(Broadcast::subscribe)
    }

    /// Updates of every swap.
    pub fn global_updates(&self) -> (Receiver<SwapUpdate>, Unsubscribe<SwapUpdate>) {
        self.global.subscribe()
    }

    /// Delivers `update` globally and to the listeners of `id`. A final update closes and removes
    /// the listener of `id`.
    pub fn send(&self, id: &str, update: SwapUpdate) {
        let is_final = update.is_final;
        self.global.send(update.clone());

        let Ok(mut listeners) = self.listeners.lock() else {
            return;
        };
        match listeners.get(id) {
            Some(listener) => {
                listener.send(update);
                log::debug!("Sent update for swap {id}");
                if is_final {
                    listener.close();
                    listeners.remove(id);
                    log::debug!("Removed listener of swap {id}");
                }
            }
            None => log::debug!("No listener for swap {id}"),
        }
    }

    /// Closes every listener, the global one included.
    pub fn close(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            for (_, listener) in listeners.drain() {
                listener.close();
            }
        }
        self.global.close();
        log::debug!("Closed all event listeners");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{records::tests::reverse_swap, SomeSwap, SwapState};

    fn update(is_final: bool) -> SwapUpdate {
        SwapUpdate {
            swap: SomeSwap::Reverse(reverse_swap("x")),
            is_final,
        }
    }

    #[test]
    fn test_listener_lifecycle() {
        let registry = Registry::new();
        registry.register(&["x".to_string()]);
        let (updates, _unsubscribe) = registry.updates_for("x").unwrap();
        let (global, _) = registry.global_updates();

        registry.send("x", update(false));
        registry.send("x", update(true));
        registry.send("x", update(false));

        assert_eq!(updates.iter().count(), 2);
        assert!(!registry.is_registered("x"));
        assert!(registry.updates_for("x").is_none());
        assert_eq!(global.try_iter().count(), 3);
    }

    #[test]
    fn test_unsubscribe_keeps_others() {
        let registry = Registry::new();
        registry.register(&["x".to_string()]);
        let (first, unsubscribe) = registry.updates_for("x").unwrap();
        let (second, _keep) = registry.updates_for("x").unwrap();
        unsubscribe.unsubscribe();

        let mut swap = reverse_swap("x");
        swap.state = SwapState::Error;
        registry.send("x", SwapUpdate::from(SomeSwap::Reverse(swap)));

        assert!(first.recv().is_err());
        assert_eq!(second.try_recv().unwrap().swap.state(), SwapState::Error);
    }

    #[test]
    fn test_close_ends_receivers() {
        let registry = Registry::new();
        registry.register(&["x".to_string(), "y".to_string()]);
        let (updates, _) = registry.updates_for("y").unwrap();
        let (global, _) = registry.global_updates();
        registry.close();
        assert!(updates.recv().is_err());
        assert!(global.recv().is_err());
        assert!(registry.global_updates().0.recv().is_err());
    }
}
