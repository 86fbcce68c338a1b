//! Published signals: connection state, discovered and paired peers (latest value),
//! and error notifications (fire-and-forget, not replayed to late subscribers).

use std::sync::Mutex;

use bluechat_core::{PeerDevice, PeerDirectory};
use tokio::sync::{broadcast, watch};

const ERROR_CHANNEL_CAPACITY: usize = 32;

/// Notification sent when a link changes for a peer outside the paired set.
pub const NON_PAIRED_PEER: &str = "Cannot connect to a non-paired device";

/// Owns the peer directory and every signal observers subscribe to. All updates
/// replace the whole value.
pub struct EventSurface {
    directory: Mutex<PeerDirectory>,
    connected: watch::Sender<bool>,
    discovered: watch::Sender<Vec<PeerDevice>>,
    paired: watch::Sender<Vec<PeerDevice>>,
    errors: broadcast::Sender<String>,
}

impl EventSurface {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        let (discovered, _) = watch::channel(Vec::new());
        let (paired, _) = watch::channel(Vec::new());
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            directory: Mutex::new(PeerDirectory::new()),
            connected,
            discovered,
            paired,
            errors,
        }
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn subscribe_discovered(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.discovered.subscribe()
    }

    pub fn subscribe_paired(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.paired.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn discovered(&self) -> Vec<PeerDevice> {
        self.discovered.borrow().clone()
    }

    pub fn paired(&self) -> Vec<PeerDevice> {
        self.paired.borrow().clone()
    }

    fn with_directory<R>(&self, f: impl FnOnce(&mut PeerDirectory) -> R) -> R {
        let mut dir = match self.directory.lock() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut dir)
    }

    /// Found-device notification. Publishes only when the list changed.
    pub fn record_discovered(&self, device: PeerDevice) -> bool {
        let snapshot = self.with_directory(|dir| {
            dir.record_discovered(device)
                .then(|| dir.discovered().to_vec())
        });
        match snapshot {
            Some(list) => {
                tracing::debug!(peers = list.len(), "discovered peers updated");
                self.discovered.send_replace(list);
                true
            }
            None => false,
        }
    }

    pub fn replace_paired(&self, devices: Vec<PeerDevice>) {
        let list = self.with_directory(|dir| {
            dir.replace_paired(devices);
            dir.paired().to_vec()
        });
        self.paired.send_replace(list);
    }

    pub fn is_paired(&self, address: &str) -> bool {
        self.with_directory(|dir| dir.is_paired(address))
    }

    /// Link to `peer` came up or went down. Only paired peers move the connection
    /// state; anything else is reported on the error stream.
    pub fn on_link_state_changed(&self, peer: &PeerDevice, connected: bool) {
        if self.is_paired(&peer.address) {
            self.connected.send_replace(connected);
        } else {
            tracing::debug!(peer = %peer.address, connected, "link change for non-paired peer");
            self.notify_error(NON_PAIRED_PEER);
        }
    }

    /// Fire-and-forget; dropped when nobody listens.
    pub fn notify_error(&self, message: impl Into<String>) {
        let _ = self.errors.send(message.into());
    }
}

impl Default for EventSurface {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str) -> PeerDevice {
        PeerDevice::new(None, addr)
    }

    #[test]
    fn discovered_signal_deduplicates() {
        let surface = EventSurface::new();
        let rx = surface.subscribe_discovered();
        assert!(surface.record_discovered(peer("a:1")));
        assert!(!surface.record_discovered(peer("a:1")));
        assert!(surface.record_discovered(peer("b:1")));
        assert_eq!(rx.borrow().len(), 2);
    }

    #[test]
    fn paired_signal_replaced() {
        let surface = EventSurface::new();
        let rx = surface.subscribe_paired();
        surface.replace_paired(vec![peer("a:1"), peer("b:1")]);
        surface.replace_paired(vec![peer("c:1")]);
        assert_eq!(*rx.borrow(), vec![peer("c:1")]);
    }

    #[test]
    fn paired_link_moves_connection_state() {
        let surface = EventSurface::new();
        surface.replace_paired(vec![peer("a:1")]);
        surface.on_link_state_changed(&peer("a:1"), true);
        assert!(surface.is_connected());
        surface.on_link_state_changed(&peer("a:1"), false);
        assert!(!surface.is_connected());
    }

    #[tokio::test]
    async fn non_paired_link_reports_error_and_keeps_state() {
        let surface = EventSurface::new();
        let mut errors = surface.subscribe_errors();
        surface.on_link_state_changed(&peer("x:1"), true);
        assert!(!surface.is_connected());
        assert_eq!(errors.recv().await.unwrap(), NON_PAIRED_PEER);
    }

    #[tokio::test]
    async fn errors_not_replayed_to_late_subscribers() {
        let surface = EventSurface::new();
        surface.notify_error("early");
        let mut late = surface.subscribe_errors();
        surface.notify_error("late");
        assert_eq!(late.recv().await.unwrap(), "late");
    }
}
