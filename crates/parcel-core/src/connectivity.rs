//! Observer lists and network connectivity
//!
//! Listeners are owned by the component that notifies them. Notification
//! iterates over a copy of the list so a listener may add or remove listeners
//! from inside its callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

/// A list of shared observers mutated only through `add`/`remove`
pub struct ObserverList<L: ?Sized> {
    observers: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ObserverList<L> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Adds an observer; adding the same `Arc` twice is a no-op
    pub fn add(&self, observer: Arc<L>) {
        let mut observers = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !observers.iter().any(|o| same_observer(o, &observer)) {
            observers.push(observer);
        }
    }

    /// Removes an observer previously added with the same `Arc`
    pub fn remove(&self, observer: &Arc<L>) {
        let mut observers = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.retain(|o| !same_observer(o, observer));
    }

    /// Copy of the current observers
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for every observer, over a copy of the list
    pub fn notify(&self, mut f: impl FnMut(&L)) {
        for observer in self.snapshot() {
            f(&observer);
        }
    }
}

impl<L: ?Sized> Default for ObserverList<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> std::fmt::Debug for ObserverList<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList").field("len", &self.len()).finish()
    }
}

// Compares data pointers only; vtable pointers of the same object may differ.
fn same_observer<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Receives connectivity transitions
pub trait NetworkConnectivityListener: Send + Sync {
    fn on_network_connectivity_status_changed(&self, connected: bool);
}

/// Tracks whether the network is reachable and notifies listeners on change
#[derive(Debug)]
pub struct NetworkConnectivityService {
    connected: AtomicBool,
    listeners: ObserverList<dyn NetworkConnectivityListener>,
}

impl NetworkConnectivityService {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            listeners: ObserverList::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Records the current status, notifying listeners only on a transition
    pub fn set_connected(&self, connected: bool) {
        let previous = self.connected.swap(connected, Ordering::SeqCst);
        if previous != connected {
            debug!(connected, "Network connectivity changed");
            self.listeners
                .notify(|l| l.on_network_connectivity_status_changed(connected));
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn NetworkConnectivityListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn NetworkConnectivityListener>) {
        self.listeners.remove(listener);
    }
}

impl Default for NetworkConnectivityService {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<bool>>,
    }

    impl NetworkConnectivityListener for Recorder {
        fn on_network_connectivity_status_changed(&self, connected: bool) {
            self.seen.lock().unwrap().push(connected);
        }
    }

    #[test]
    fn test_notifies_only_on_transition() {
        let service = NetworkConnectivityService::new(true);
        let recorder = Arc::new(Recorder::default());
        service.add_listener(recorder.clone());

        service.set_connected(true);
        service.set_connected(false);
        service.set_connected(false);
        service.set_connected(true);

        assert_eq!(*recorder.seen.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn test_add_is_idempotent_and_remove_works() {
        let service = NetworkConnectivityService::default();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn NetworkConnectivityListener> = recorder.clone();
        service.add_listener(listener.clone());
        service.add_listener(listener.clone());
        assert_eq!(service.listeners.len(), 1);

        service.remove_listener(&listener);
        service.set_connected(false);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_mutation_during_notify() {
        let list: Arc<ObserverList<dyn Fn() + Send + Sync>> = Arc::new(ObserverList::new());
        let extra: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let to_add = extra.clone();
        let inner = list.clone();
        list.add(Arc::new(move || inner.add(to_add.clone())));

        list.notify(|f| f());
        assert_eq!(list.len(), 2);
        list.remove(&extra);
        assert_eq!(list.len(), 1);
    }
}
