//! Connectivity tracking.
//!
//! The platform reports every connectivity change through
//! [`NetworkMonitor::report`]. The monitor keeps a single "is connected"
//! flag and broadcasts transitions to its subscribers. Repeated reports of
//! the same connectivity only refresh the link quality.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

/// Cellular radio generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellularGeneration {
    /// 2G.
    G2,
    /// 3G.
    G3,
    /// 4G / LTE.
    G4,
    /// 5G.
    G5,
}

/// Kind of active network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// No link.
    None,
    /// Wi-Fi.
    Wifi,
    /// Wired.
    Ethernet,
    /// Mobile data, with the generation when the platform knows it.
    Cellular(Option<CellularGeneration>),
    /// Anything else (VPN, bluetooth tethering...).
    Other,
}

/// Coarse link quality used to tune retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    /// Wi-Fi, wired, 4G and better.
    High,
    /// 3G.
    Medium,
    /// 2G.
    Low,
    /// No usable connection.
    Offline,
}

/// A connectivity report from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    /// A link is up.
    pub is_connected: bool,
    /// The internet is reachable over that link.
    pub is_internet_reachable: bool,
    /// Link kind.
    pub kind: ConnectionKind,
}

impl NetworkState {
    /// A reachable Wi-Fi connection.
    pub fn online() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
            kind: ConnectionKind::Wifi,
        }
    }

    /// No connection at all.
    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: false,
            kind: ConnectionKind::None,
        }
    }

    /// A reachable cellular connection.
    pub fn cellular(generation: CellularGeneration) -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
            kind: ConnectionKind::Cellular(Some(generation)),
        }
    }

    /// Returns true if requests can reach the backend.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }

    /// Derives the link quality.
    pub fn quality(&self) -> NetworkQuality {
        if !self.is_online() {
            return NetworkQuality::Offline;
        }
        match self.kind {
            ConnectionKind::Cellular(Some(CellularGeneration::G2)) => NetworkQuality::Low,
            ConnectionKind::Cellular(Some(CellularGeneration::G3)) => NetworkQuality::Medium,
            _ => NetworkQuality::High,
        }
    }
}

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

struct Shared {
    /// Serializes reports so transitions reach subscribers in order.
    reporting: Mutex<()>,
    connected: AtomicBool,
    quality: RwLock<NetworkQuality>,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
}

/// Observes connectivity and notifies subscribers of transitions.
///
/// Cloning is cheap; clones share the same state and subscribers.
#[derive(Clone)]
pub struct NetworkMonitor {
    shared: Arc<Shared>,
}

impl NetworkMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(initial: NetworkState) -> Self {
        Self {
            shared: Arc::new(Shared {
                reporting: Mutex::new(()),
                connected: AtomicBool::new(initial.is_online()),
                quality: RwLock::new(initial.quality()),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a monitor that starts online.
    pub fn online() -> Self {
        Self::new(NetworkState::online())
    }

    /// Creates a monitor that starts offline.
    pub fn offline() -> Self {
        Self::new(NetworkState::offline())
    }

    /// Point-in-time connectivity check.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Current link quality.
    pub fn quality(&self) -> NetworkQuality {
        *self.shared.quality.read()
    }

    /// Records a connectivity report from the platform.
    ///
    /// Subscribers are called, on the reporting thread, only when the
    /// connected flag actually changes. Concurrent reports are applied one
    /// at a time, so subscribers see transitions in the order the flag
    /// took them. Subscribers must not report from their callback.
    pub fn report(&self, state: NetworkState) {
        let _reporting = self.shared.reporting.lock();
        let online = state.is_online();
        *self.shared.quality.write() = state.quality();
        let was_online = self.shared.connected.swap(online, Ordering::SeqCst);

        if was_online != online {
            tracing::debug!(online, "connectivity changed");
            self.notify(online);
        }
    }

    /// Shorthand for reporting a plain online/offline state.
    pub fn set_connected(&self, connected: bool) {
        self.report(if connected {
            NetworkState::online()
        } else {
            NetworkState::offline()
        });
    }

    /// Registers a callback for connectivity transitions.
    ///
    /// The callback stays registered until the returned subscription is
    /// dropped or [`Subscription::unsubscribe`] is called.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.shared.listeners.write().push((id, Arc::new(callback)));
        Subscription {
            monitor: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.listeners.read().len()
    }

    /// Waits until the device is online or `timeout` elapses.
    ///
    /// Returns true if connectivity is available.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        if self.is_connected() {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _subscription = self.subscribe(move |online| {
            if online {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(());
                }
            }
        });

        // Reconnected between the first check and subscribing.
        if self.is_connected() {
            return true;
        }

        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    fn notify(&self, online: bool) {
        // Snapshot so callbacks may subscribe or unsubscribe.
        let listeners: Vec<Listener> = self
            .shared
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(online);
        }
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("connected", &self.is_connected())
            .field("quality", &self.quality())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Handle for a connectivity subscription.
#[derive(Debug)]
pub struct Subscription {
    monitor: Weak<Shared>,
    id: u64,
}

impl Subscription {
    /// Removes the callback.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.monitor.upgrade() {
            shared.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}
