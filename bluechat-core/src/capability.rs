//! Capability gates: `Scan` for discovery, `Connect` for sockets, send and paired refresh.

use std::sync::atomic::{AtomicBool, Ordering};

/// Coarse runtime authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Scan,
    Connect,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Scan => f.write_str("scan"),
            Capability::Connect => f.write_str("connect"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} permission denied")]
pub struct PermissionDenied(pub Capability);

/// Granted capabilities. Shared between the host's I/O tasks and its UI; each flag is replaced atomically.
#[derive(Debug)]
pub struct Capabilities {
    scan: AtomicBool,
    connect: AtomicBool,
}

impl Capabilities {
    pub fn new(scan: bool, connect: bool) -> Self {
        Self {
            scan: AtomicBool::new(scan),
            connect: AtomicBool::new(connect),
        }
    }

    pub fn all() -> Self {
        Self::new(true, true)
    }

    fn flag(&self, cap: Capability) -> &AtomicBool {
        match cap {
            Capability::Scan => &self.scan,
            Capability::Connect => &self.connect,
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.flag(cap).load(Ordering::Acquire)
    }

    /// Guard composed at the top of every gated operation.
    pub fn require(&self, cap: Capability) -> Result<(), PermissionDenied> {
        if self.has(cap) {
            Ok(())
        } else {
            Err(PermissionDenied(cap))
        }
    }

    pub fn grant(&self, cap: Capability) {
        self.flag(cap).store(true, Ordering::Release);
    }

    pub fn revoke(&self, cap: Capability) {
        self.flag(cap).store(false, Ordering::Release);
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_reports_missing_capability() {
        let caps = Capabilities::new(true, false);
        assert!(caps.require(Capability::Scan).is_ok());
        assert_eq!(
            caps.require(Capability::Connect),
            Err(PermissionDenied(Capability::Connect))
        );
    }

    #[test]
    fn grant_and_revoke() {
        let caps = Capabilities::all();
        caps.revoke(Capability::Scan);
        assert!(!caps.has(Capability::Scan));
        caps.grant(Capability::Scan);
        assert!(caps.has(Capability::Scan));
    }

    #[test]
    fn denied_message_names_capability() {
        assert_eq!(
            PermissionDenied(Capability::Connect).to_string(),
            "connect permission denied"
        );
    }
}
