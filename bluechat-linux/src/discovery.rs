//! LAN discovery standing in for radio inquiry: scanners multicast probes,
//! discoverable nodes answer with an announce, announces become found-device
//! notifications in the peer directory.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluechat_core::wire::{decode_frame, encode_frame};
use bluechat_core::{Capabilities, Capability, DiscoveryPacket, PeerDevice};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::events::EventSurface;

/// Probe interval while a scan window is open.
const PROBE_INTERVAL: Duration = Duration::from_secs(2);
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub service: Uuid,
    pub group: Ipv4Addr,
    pub port: u16,
    /// Transport port put in announces.
    pub transport_port: u16,
    pub name: Option<String>,
    pub scan_window: Duration,
    pub discoverable: bool,
}

impl DiscoverySettings {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            service: cfg.service_id()?,
            group: cfg.discovery_group()?,
            port: cfg.discovery_port,
            transport_port: cfg.transport_port,
            name: cfg.device_name.clone(),
            scan_window: Duration::from_secs(cfg.scan_window_secs),
            discoverable: cfg.discoverable,
        })
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(self.group.into(), self.port)
    }
}

/// Aborts its task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Interest in found-device notifications. Holds the scan socket; dropping it stops
/// delivering notifications.
pub struct FoundDeviceSubscription {
    socket: Arc<UdpSocket>,
    _listener: TaskGuard,
}

#[derive(Default)]
struct DiscoveryState {
    subscription: Option<FoundDeviceSubscription>,
    scan: Option<TaskGuard>,
    responder: Option<TaskGuard>,
}

/// Discovery trigger. `start`/`stop` are gated on `Scan`, paired refresh on `Connect`.
pub struct Discovery {
    settings: DiscoverySettings,
    caps: Arc<Capabilities>,
    surface: Arc<EventSurface>,
    registry: Vec<PeerDevice>,
    nonce: [u8; 16],
    state: Mutex<DiscoveryState>,
}

impl Discovery {
    pub fn new(
        settings: DiscoverySettings,
        caps: Arc<Capabilities>,
        surface: Arc<EventSurface>,
        registry: Vec<PeerDevice>,
    ) -> Self {
        Self {
            settings,
            caps,
            surface,
            registry,
            nonce: Uuid::new_v4().into_bytes(),
            state: Mutex::new(DiscoveryState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DiscoveryState) -> R) -> R {
        let mut st = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut st)
    }

    /// Replace the paired list with the bonded-device registry. Silent no-op without `Connect`.
    pub fn refresh_paired(&self) {
        if self.caps.require(Capability::Connect).is_err() {
            tracing::debug!("paired refresh skipped: connect permission missing");
            return;
        }
        self.surface.replace_paired(self.registry.clone());
    }

    /// Start scanning: re-register the found-device subscription (the previous one is
    /// released, never duplicated), refresh paired peers, and probe for one scan window.
    pub async fn start(&self) -> std::io::Result<()> {
        if self.caps.require(Capability::Scan).is_err() {
            tracing::debug!("discovery start skipped: scan permission missing");
            return Ok(());
        }
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        socket.set_multicast_ttl_v4(1)?;
        let listener = tokio::spawn(listen_loop(
            socket.clone(),
            self.settings.service,
            self.nonce,
            self.surface.clone(),
        ));
        let subscription = FoundDeviceSubscription {
            socket: socket.clone(),
            _listener: TaskGuard(listener),
        };

        self.refresh_paired();

        let probe = tokio::spawn(probe_loop(
            socket,
            self.settings.group_addr(),
            self.settings.service,
            self.nonce,
            self.settings.scan_window,
        ));
        self.with_state(|st| {
            st.subscription = Some(subscription);
            st.scan = Some(TaskGuard(probe));
        });
        tracing::info!(group = %self.settings.group_addr(), "discovery started");
        Ok(())
    }

    /// Cancel the scan. The found-device subscription stays registered.
    pub fn stop(&self) {
        if self.caps.require(Capability::Scan).is_err() {
            return;
        }
        if self.with_state(|st| st.scan.take()).is_some() {
            tracing::info!("discovery stopped");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.with_state(|st| st.scan.as_ref().is_some_and(|t| !t.0.is_finished()))
    }

    pub fn has_subscription(&self) -> bool {
        self.with_state(|st| st.subscription.is_some())
    }

    /// Local address of the current scan socket, if subscribed.
    pub fn scan_addr(&self) -> Option<SocketAddr> {
        self.with_state(|st| {
            st.subscription
                .as_ref()
                .and_then(|s| s.socket.local_addr().ok())
        })
    }

    /// Answer other devices' probes on the discovery port.
    pub async fn start_responder(&self) -> std::io::Result<()> {
        if !self.settings.discoverable {
            return Ok(());
        }
        let socket = make_multicast_socket(self.settings.group, self.settings.port)?;
        let task = tokio::spawn(respond_loop(Arc::new(socket), self.settings.clone(), self.nonce));
        self.with_state(|st| st.responder = Some(TaskGuard(task)));
        tracing::info!(port = self.settings.port, "discoverable");
        Ok(())
    }

    /// Drop the scan, the found-device subscription and the responder.
    pub fn release(&self) {
        let old = self.with_state(std::mem::take);
        drop(old);
    }
}

fn make_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn probe_loop(
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    service: Uuid,
    nonce: [u8; 16],
    window: Duration,
) {
    let frame = match encode_frame(&DiscoveryPacket::Probe {
        service: service.into_bytes(),
        nonce,
    }) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "cannot encode probe");
            return;
        }
    };
    let deadline = tokio::time::Instant::now() + window;
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::debug!(error = %e, %dest, "probe send failed");
        }
        if tokio::time::Instant::now() + PROBE_INTERVAL > deadline {
            break;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
    tracing::debug!("scan window closed");
}

async fn listen_loop(
    socket: Arc<UdpSocket>,
    service: Uuid,
    nonce: [u8; 16],
    surface: Arc<EventSurface>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                tracing::debug!(error = %e, "scan socket closed");
                return;
            }
        };
        let Ok((packet, _)) = decode_frame::<DiscoveryPacket>(&buf[..n]) else {
            continue;
        };
        if let Some(device) = announced_device(&packet, from, service, nonce) {
            if surface.record_discovered(device.clone()) {
                tracing::info!(peer = %device.address, name = ?device.name, "found device");
            }
        }
    }
}

async fn respond_loop(socket: Arc<UdpSocket>, settings: DiscoverySettings, own_nonce: [u8; 16]) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                tracing::debug!(error = %e, "responder socket closed");
                return;
            }
        };
        let Ok((packet, _)) = decode_frame::<DiscoveryPacket>(&buf[..n]) else {
            continue;
        };
        let Some(reply) = answer_probe(&packet, &settings, own_nonce) else {
            continue;
        };
        match encode_frame(&reply) {
            Ok(frame) => {
                if let Err(e) = socket.send_to(&frame, from).await {
                    tracing::debug!(error = %e, %from, "announce send failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "cannot encode announce"),
        }
    }
}

/// Announce for a probe of our service from another node; `None` for anything else.
fn answer_probe(
    packet: &DiscoveryPacket,
    settings: &DiscoverySettings,
    own_nonce: [u8; 16],
) -> Option<DiscoveryPacket> {
    match packet {
        DiscoveryPacket::Probe { service, nonce }
            if *service == settings.service.into_bytes() && *nonce != own_nonce =>
        {
            Some(DiscoveryPacket::Announce {
                service: *service,
                nonce: *nonce,
                name: settings.name.clone(),
                listen_port: settings.transport_port,
            })
        }
        _ => None,
    }
}

/// Found device for an announce answering our own probe.
fn announced_device(
    packet: &DiscoveryPacket,
    from: SocketAddr,
    expected_service: Uuid,
    own_nonce: [u8; 16],
) -> Option<PeerDevice> {
    match packet {
        DiscoveryPacket::Announce {
            service,
            nonce,
            name,
            listen_port,
        } if *service == expected_service.into_bytes() && *nonce == own_nonce => Some(
            PeerDevice::new(name.clone(), SocketAddr::new(from.ip(), *listen_port).to_string()),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluechat_core::SERVICE_UUID;

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            service: SERVICE_UUID,
            group: "239.255.60.61".parse().unwrap(),
            port: 0,
            transport_port: 47100,
            name: Some("desk".into()),
            scan_window: Duration::from_secs(1),
            discoverable: true,
        }
    }

    fn discovery(caps: Capabilities, registry: Vec<PeerDevice>) -> (Discovery, Arc<EventSurface>) {
        let surface = Arc::new(EventSurface::new());
        let d = Discovery::new(settings(), Arc::new(caps), surface.clone(), registry);
        (d, surface)
    }

    #[test]
    fn answers_foreign_probe_for_our_service() {
        let probe = DiscoveryPacket::Probe {
            service: SERVICE_UUID.into_bytes(),
            nonce: [9; 16],
        };
        let reply = answer_probe(&probe, &settings(), [1; 16]).unwrap();
        assert_eq!(
            reply,
            DiscoveryPacket::Announce {
                service: SERVICE_UUID.into_bytes(),
                nonce: [9; 16],
                name: Some("desk".into()),
                listen_port: 47100,
            }
        );
    }

    #[test]
    fn ignores_own_probe_and_other_services() {
        let own = DiscoveryPacket::Probe {
            service: SERVICE_UUID.into_bytes(),
            nonce: [1; 16],
        };
        assert!(answer_probe(&own, &settings(), [1; 16]).is_none());
        let other = DiscoveryPacket::Probe {
            service: [0; 16],
            nonce: [9; 16],
        };
        assert!(answer_probe(&other, &settings(), [1; 16]).is_none());
    }

    #[test]
    fn announce_maps_to_sender_ip_and_listen_port() {
        let announce = DiscoveryPacket::Announce {
            service: SERVICE_UUID.into_bytes(),
            nonce: [1; 16],
            name: None,
            listen_port: 47100,
        };
        let from: SocketAddr = "192.168.0.5:47101".parse().unwrap();
        let dev = announced_device(&announce, from, SERVICE_UUID, [1; 16]).unwrap();
        assert_eq!(dev.address, "192.168.0.5:47100");
        assert!(announced_device(&announce, from, SERVICE_UUID, [2; 16]).is_none());
    }

    #[tokio::test]
    async fn start_without_scan_permission_is_noop() {
        let (d, surface) = discovery(
            Capabilities::new(false, true),
            vec![PeerDevice::new(None, "10.0.0.1:47100")],
        );
        d.start().await.unwrap();
        assert!(!d.has_subscription());
        assert!(!d.is_scanning());
        assert!(surface.paired().is_empty());
    }

    #[tokio::test]
    async fn start_refreshes_paired_and_stop_keeps_subscription() {
        let (d, surface) = discovery(
            Capabilities::all(),
            vec![PeerDevice::new(Some("phone".into()), "10.0.0.1:47100")],
        );
        d.start().await.unwrap();
        assert_eq!(surface.paired().len(), 1);
        assert!(d.has_subscription());
        let first = d.scan_addr();

        d.stop();
        assert!(!d.is_scanning());
        assert!(d.has_subscription());

        // Restarting replaces the subscription instead of adding a second one.
        d.start().await.unwrap();
        assert!(d.has_subscription());
        assert_ne!(d.scan_addr(), first);

        d.release();
        assert!(!d.has_subscription());
    }

    #[test]
    fn refresh_paired_needs_connect() {
        let (d, surface) = discovery(
            Capabilities::new(true, false),
            vec![PeerDevice::new(None, "10.0.0.1:47100")],
        );
        d.refresh_paired();
        assert!(surface.paired().is_empty());
    }

    #[tokio::test]
    async fn probe_and_announce_over_loopback() {
        let responder = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let scanner = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let surface = Arc::new(EventSurface::new());
        let nonce = [4; 16];

        let _r = TaskGuard(tokio::spawn(respond_loop(responder.clone(), settings(), [5; 16])));
        let _l = TaskGuard(tokio::spawn(listen_loop(
            scanner.clone(),
            SERVICE_UUID,
            nonce,
            surface.clone(),
        )));

        let mut discovered = surface.subscribe_discovered();
        let dest = responder.local_addr().unwrap();
        let _p = TaskGuard(tokio::spawn(probe_loop(
            scanner,
            dest,
            SERVICE_UUID,
            nonce,
            Duration::from_secs(1),
        )));

        tokio::time::timeout(Duration::from_secs(5), discovered.changed())
            .await
            .unwrap()
            .unwrap();
        let list = discovered.borrow().clone();
        assert_eq!(list, vec![PeerDevice::new(None, "127.0.0.1:47100")]);
        assert_eq!(list[0].name.as_deref(), Some("desk"));
    }
}
