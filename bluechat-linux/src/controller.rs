//! Controller: the one object presentation code talks to. Verbs go to discovery and
//! the session manager; observers subscribe to the event surface.

use std::sync::Arc;

use bluechat_core::{Capabilities, Capability, Message, PeerDevice, SessionState};
use tokio::sync::{broadcast, watch};

use crate::config::{Config, ConfigError};
use crate::discovery::{Discovery, DiscoverySettings};
use crate::events::EventSurface;
use crate::session::{ConnectionEvents, SessionError, SessionManager, SessionSettings};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("discovery responder: {0}")]
    Responder(std::io::Error),
}

pub struct ChatController {
    caps: Arc<Capabilities>,
    surface: Arc<EventSurface>,
    discovery: Arc<Discovery>,
    session: SessionManager,
}

impl ChatController {
    /// Build from config, load the paired list and, if discoverable, start answering scans.
    /// Must run inside a tokio runtime.
    pub async fn start(cfg: &Config) -> Result<Self, ControllerError> {
        cfg.validate()?;
        let caps = Arc::new(cfg.capabilities());
        let surface = Arc::new(EventSurface::new());
        let discovery = Arc::new(Discovery::new(
            DiscoverySettings::from_config(cfg)?,
            caps.clone(),
            surface.clone(),
            cfg.paired_devices(),
        ));
        let session = SessionManager::new(
            SessionSettings::from_config(cfg)?,
            caps.clone(),
            surface.clone(),
            discovery.clone(),
        );
        discovery.refresh_paired();
        discovery
            .start_responder()
            .await
            .map_err(ControllerError::Responder)?;
        Ok(Self {
            caps,
            surface,
            discovery,
            session,
        })
    }

    pub async fn start_discovery(&self) -> std::io::Result<()> {
        self.discovery.start().await
    }

    pub fn stop_discovery(&self) {
        self.discovery.stop();
    }

    pub async fn start_server(&self) -> Result<ConnectionEvents, SessionError> {
        self.session.start_server().await
    }

    pub async fn connect_to(&self, peer: &PeerDevice) -> Result<ConnectionEvents, SessionError> {
        self.session.connect_to(peer).await
    }

    pub async fn try_send_message(&self, text: &str) -> Result<Option<Message>, SessionError> {
        self.session.try_send_message(text).await
    }

    pub async fn close_connection(&self) {
        self.session.close_connection().await;
    }

    /// Drop every registration and close the connection.
    pub async fn release(&self) {
        self.discovery.release();
        self.session.close_connection().await;
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn listening_addr(&self) -> Option<std::net::SocketAddr> {
        self.session.listening_addr()
    }

    pub fn local_name(&self) -> &str {
        self.session.sender_name()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn grant(&self, cap: Capability) {
        self.caps.grant(cap);
    }

    pub fn revoke(&self, cap: Capability) {
        self.caps.revoke(cap);
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.surface.subscribe_connected()
    }

    pub fn subscribe_discovered(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.surface.subscribe_discovered()
    }

    pub fn subscribe_paired(&self) -> watch::Receiver<Vec<PeerDevice>> {
        self.surface.subscribe_paired()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.surface.subscribe_errors()
    }
}

impl Drop for ChatController {
    fn drop(&mut self) {
        self.discovery.release();
        self.session.abort_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CapabilityConfig, PairedPeer};
    use bluechat_core::{ConnectionEvent, FrameFormat};
    use std::time::Duration;

    fn config(name: &str) -> Config {
        Config {
            device_name: Some(name.into()),
            bind_host: "127.0.0.1".into(),
            transport_port: 0,
            discoverable: false,
            ..Config::default()
        }
    }

    async fn next(events: &mut ConnectionEvents) -> Option<ConnectionEvent> {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn rejects_malformed_service_uuid() {
        let cfg = Config {
            service_uuid: "2f441ce1-zzzz".into(),
            ..config("a")
        };
        assert!(matches!(
            ChatController::start(&cfg).await,
            Err(ControllerError::Config(ConfigError::InvalidServiceId(..)))
        ));
    }

    #[tokio::test]
    async fn paired_list_published_on_start() {
        let cfg = Config {
            paired: vec![PairedPeer {
                name: Some("phone".into()),
                address: "10.0.0.2:47100".into(),
            }],
            ..config("a")
        };
        let c = ChatController::start(&cfg).await.unwrap();
        let paired = c.subscribe_paired();
        assert_eq!(paired.borrow().len(), 1);
        assert_eq!(paired.borrow()[0].name.as_deref(), Some("phone"));
    }

    #[tokio::test]
    async fn chat_roundtrip_length_prefixed() {
        let server = ChatController::start(&Config {
            framing: FrameFormat::LengthPrefixed,
            ..config("server")
        })
        .await
        .unwrap();
        let client = ChatController::start(&Config {
            framing: FrameFormat::LengthPrefixed,
            ..config("cli#ent")
        })
        .await
        .unwrap();

        let mut server_events = server.start_server().await.unwrap();
        let addr = server.listening_addr().unwrap();
        let mut client_events = client
            .connect_to(&PeerDevice::new(None, addr.to_string()))
            .await
            .unwrap();
        assert_eq!(next(&mut server_events).await, Some(ConnectionEvent::Established));
        assert_eq!(next(&mut client_events).await, Some(ConnectionEvent::Established));

        client.try_send_message("a # in the body").await.unwrap().unwrap();
        match next(&mut server_events).await {
            Some(ConnectionEvent::MessageReceived(m)) => {
                assert_eq!(m.sender_name, "cli#ent");
                assert_eq!(m.body, "a # in the body");
            }
            other => panic!("expected message, got {other:?}"),
        }

        let reply = server.try_send_message("ack").await.unwrap().unwrap();
        assert_eq!(reply.sender_name, "server");
        match next(&mut client_events).await {
            Some(ConnectionEvent::MessageReceived(m)) => assert_eq!(m.body, "ack"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_without_connect_capability_is_absent() {
        let c = ChatController::start(&Config {
            capabilities: CapabilityConfig {
                scan: true,
                connect: false,
            },
            ..config("a")
        })
        .await
        .unwrap();
        assert!(c.try_send_message("hi").await.unwrap().is_none());
        assert!(matches!(
            c.start_server().await,
            Err(SessionError::PermissionDenied(_))
        ));
        assert!(c.subscribe_paired().borrow().is_empty());
    }

    #[tokio::test]
    async fn release_is_safe_when_idle() {
        let c = ChatController::start(&config("a")).await.unwrap();
        c.release().await;
        c.release().await;
        assert!(c.session_state().is_idle());
        assert_eq!(c.local_name(), "a");
    }

    #[tokio::test]
    async fn revoking_connect_mid_session_stops_sends() {
        let server = ChatController::start(&config("server")).await.unwrap();
        let client = ChatController::start(&config("client")).await.unwrap();
        let mut server_events = server.start_server().await.unwrap();
        let addr = server.listening_addr().unwrap();
        let mut client_events = client
            .connect_to(&PeerDevice::new(None, addr.to_string()))
            .await
            .unwrap();
        assert_eq!(next(&mut client_events).await, Some(ConnectionEvent::Established));
        assert_eq!(next(&mut server_events).await, Some(ConnectionEvent::Established));

        client.revoke(Capability::Connect);
        assert!(!client.capabilities().has(Capability::Connect));
        assert!(client.try_send_message("dropped").await.unwrap().is_none());
        // The session itself stays up.
        assert!(client.session_state().is_active());

        client.grant(Capability::Connect);
        client.try_send_message("back").await.unwrap().unwrap();
        match next(&mut server_events).await {
            Some(ConnectionEvent::MessageReceived(m)) => assert_eq!(m.body, "back"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unnamed_device_sends_as_unknown() {
        let c = ChatController::start(&Config {
            device_name: None,
            ..config("unused")
        })
        .await
        .unwrap();
        assert_eq!(c.local_name(), bluechat_core::UNKNOWN_DEVICE_NAME);
    }
}
