//! Peer directory: paired (bonded) and discovered peers, kept as independent lists.

use crate::protocol::PeerDevice;

/// Two independent projections of known peers. Connecting to a peer does not move
/// it between lists.
#[derive(Debug, Default, Clone)]
pub struct PeerDirectory {
    paired: Vec<PeerDevice>,
    discovered: Vec<PeerDevice>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a found device unless its address is already listed. Returns true if added.
    pub fn record_discovered(&mut self, device: PeerDevice) -> bool {
        if self.discovered.contains(&device) {
            return false;
        }
        self.discovered.push(device);
        true
    }

    /// Replace the paired list wholesale with the registry's current bonded devices.
    pub fn replace_paired(&mut self, devices: impl IntoIterator<Item = PeerDevice>) {
        let mut paired: Vec<PeerDevice> = Vec::new();
        for d in devices {
            if !paired.contains(&d) {
                paired.push(d);
            }
        }
        self.paired = paired;
    }

    pub fn is_paired(&self, address: &str) -> bool {
        self.paired.iter().any(|p| p.address == address)
    }

    /// Discovered peers in arrival order.
    pub fn discovered(&self) -> &[PeerDevice] {
        &self.discovered
    }

    pub fn paired(&self) -> &[PeerDevice] {
        &self.paired
    }
}
