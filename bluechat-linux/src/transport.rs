//! Stream transport: TCP listen/connect plus the hello that stands in for the
//! radio's service-record lookup (protocol version + service UUID + advertised port and name).

use std::net::SocketAddr;
use std::time::Duration;

use bluechat_core::{PeerDevice, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

const HELLO_HEADER_SIZE: usize = 1 + 16 + 2 + 1; // version + service + listen_port + name_len
const MAX_NAME_LEN: usize = u8::MAX as usize;
/// Upper bound on connect + hello; a silent peer must not hold the session in Connecting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What each side tells the other right after the stream opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub service: Uuid,
    pub listen_port: u16,
    pub name: Option<String>,
}

impl Hello {
    fn to_bytes(&self) -> Vec<u8> {
        let full = self.name.as_deref().unwrap_or("");
        let name = &full.as_bytes()[..floor_char_boundary(full, MAX_NAME_LEN)];
        let mut out = Vec::with_capacity(HELLO_HEADER_SIZE + name.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(self.service.as_bytes());
        out.extend_from_slice(&self.listen_port.to_le_bytes());
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out
    }

    /// The peer this hello came from, seen at `remote`.
    pub fn peer_device(&self, remote: SocketAddr) -> PeerDevice {
        PeerDevice::new(
            self.name.clone(),
            SocketAddr::new(remote.ip(), self.listen_port).to_string(),
        )
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut i = max;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("peer offers service {0}, expected {1}")]
    WrongService(Uuid, Uuid),
    #[error("handshake timed out")]
    Timeout,
}

async fn read_hello<S: AsyncRead + Unpin>(stream: &mut S, expected: Uuid) -> Result<Hello, HandshakeError> {
    let mut header = [0u8; HELLO_HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    if header[0] != PROTOCOL_VERSION {
        return Err(HandshakeError::Version(header[0]));
    }
    let mut service = [0u8; 16];
    service.copy_from_slice(&header[1..17]);
    let service = Uuid::from_bytes(service);
    if service != expected {
        return Err(HandshakeError::WrongService(service, expected));
    }
    let listen_port = u16::from_le_bytes([header[17], header[18]]);
    let name_len = header[19] as usize;
    let mut name = vec![0u8; name_len];
    stream.read_exact(&mut name).await?;
    let name = if name.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&name).into_owned())
    };
    Ok(Hello {
        service,
        listen_port,
        name,
    })
}

async fn write_hello<S: AsyncWrite + Unpin>(stream: &mut S, hello: &Hello) -> Result<(), HandshakeError> {
    stream.write_all(&hello.to_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Server side: read the client's hello, check the service, answer with ours.
pub async fn handshake_accept<S>(stream: &mut S, local: &Hello) -> Result<Hello, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = read_hello(stream, local.service).await?;
    write_hello(stream, local).await?;
    Ok(remote)
}

/// Client side: send our hello first, then read and check the server's.
pub async fn handshake_connect<S>(stream: &mut S, local: &Hello) -> Result<Hello, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_hello(stream, local).await?;
    read_hello(stream, local.service).await
}

/// Open the listening endpoint.
pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((host, port)).await
}

/// Open an outbound stream to `address` (`host:port`) and run the client hello.
pub async fn connect(address: &str, local: &Hello) -> Result<(TcpStream, Hello), HandshakeError> {
    let fut = async {
        let mut stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let remote = handshake_connect(&mut stream, local).await?;
        Ok::<_, HandshakeError>((stream, remote))
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Run the server hello on an accepted stream, bounded by the handshake timeout.
pub async fn accept_hello(stream: &mut TcpStream, local: &Hello) -> Result<Hello, HandshakeError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_accept(stream, local))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}
