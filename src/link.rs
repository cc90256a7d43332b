use crate::packet::{CmdPacket, PACKET_DATA_SIZE};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::debug;

/// Top-level accept wait. Timing out here is routine; the loop just spins
/// again so the task stays responsive.
pub const ACCEPT_TIMEOUT_MS: u64 = 10_000;
/// Per-connection read wait. Expiry means the peer has nothing more
/// pending and the connection can be closed.
pub const READ_TIMEOUT_MS: u64 = 50;
pub const SEND_TIMEOUT_MS: u64 = 50;

// Transport-level ports answered by the built-in service handler.
pub const PORT_PING: u8 = 1;
pub const PORT_UPTIME: u8 = 6;

const FRAME_HEADER_LEN: usize = 3;

/// Listening socket handing out packet connections with a bounded wait.
#[derive(Debug)]
pub struct PacketListener {
    inner: TcpListener,
}

impl PacketListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept with a bounded wait. `Ok(None)` is a timeout, which is
    /// normal, not an error.
    pub async fn accept(&self) -> io::Result<Option<PacketConn>> {
        match timeout(Duration::from_millis(ACCEPT_TIMEOUT_MS), self.inner.accept()).await {
            Err(_) => Ok(None),
            Ok(Ok((stream, peer))) => Ok(Some(PacketConn { stream, peer })),
            Ok(Err(e)) => Err(e),
        }
    }
}

/// One transport connection. Session state lives for one
/// accept/read/close cycle and is never shared between tasks.
#[derive(Debug)]
pub struct PacketConn {
    stream: TcpStream,
    peer: SocketAddr,
}

impl PacketConn {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Read one packet with the short bounded wait used by the server
    /// loops. `None` means nothing more is pending (timeout, clean close,
    /// or an unreadable frame) and the caller should close the connection.
    pub async fn read_packet(&mut self) -> Option<CmdPacket> {
        self.read_packet_timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .await
    }

    /// Same as [`read_packet`](Self::read_packet) with a caller-chosen
    /// wait; ground clients allow their reply a longer round trip.
    pub async fn read_packet_timeout(&mut self, wait: Duration) -> Option<CmdPacket> {
        match timeout(wait, self.read_frame()).await {
            Err(_) => None,
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => {
                debug!(peer = %self.peer, error = %e, "dropping unreadable frame");
                None
            }
        }
    }

    async fn read_frame(&mut self) -> io::Result<Option<CmdPacket>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let dst_port = header[0];
        let len = u16::from_le_bytes([header[1], header[2]]) as usize;
        if len > PACKET_DATA_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length exceeds packet capacity",
            ));
        }
        let mut data = [0u8; PACKET_DATA_SIZE];
        self.stream.read_exact(&mut data[..len]).await?;
        // Length already validated against capacity.
        Ok(CmdPacket::from_bytes(dst_port, &data[..len]).ok())
    }

    /// Send one packet. Consumes the packet in success and failure alike:
    /// ownership passes to the transport the moment send is attempted.
    pub async fn send_packet(&mut self, packet: CmdPacket) -> io::Result<()> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0] = packet.dst_port();
        header[1..3].copy_from_slice(&(packet.len() as u16).to_le_bytes());

        timeout(Duration::from_millis(SEND_TIMEOUT_MS), async {
            self.stream.write_all(&header).await?;
            self.stream.write_all(packet.as_bytes()).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "packet send timed out"))?
    }
}

/// The transport's own service handler, the delegation target for packets
/// no registered queue claims: echoes ping, reports uptime, drops the
/// rest. Mirrors the small management surface a transport stack answers
/// on its reserved ports.
pub async fn builtin_service_reply(conn: &mut PacketConn, packet: CmdPacket, uptime_secs: u32) {
    match packet.dst_port() {
        PORT_PING => {
            if let Err(e) = conn.send_packet(packet).await {
                debug!(peer = %conn.peer_addr(), error = %e, "ping echo failed");
            }
        }
        PORT_UPTIME => {
            let reply = match CmdPacket::from_bytes(PORT_UPTIME, &uptime_secs.to_le_bytes()) {
                Ok(reply) => reply,
                Err(_) => return,
            };
            if let Err(e) = conn.send_packet(reply).await {
                debug!(peer = %conn.peer_addr(), error = %e, "uptime reply failed");
            }
        }
        port => {
            debug!(port, "no service bound to port, packet dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let listener = PacketListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut conn = PacketConn::connect(addr).await.unwrap();
            let packet = CmdPacket::request(9, 3, &[1, 2, 3]).unwrap();
            conn.send_packet(packet).await.unwrap();
            conn
        });

        let mut server_conn = listener.accept().await.unwrap().unwrap();
        let packet = server_conn
            .read_packet_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(packet.dst_port(), 9);
        assert_eq!(packet.as_bytes(), &[3, 1, 2, 3]);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_times_out_when_idle() {
        let listener = PacketListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = PacketConn::connect(addr).await.unwrap();
        let mut server_conn = listener.accept().await.unwrap().unwrap();
        assert!(server_conn.read_packet().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let listener = PacketListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut server_conn = listener.accept().await.unwrap().unwrap();

        // Header claims more data than a packet can hold.
        let bad_len = (PACKET_DATA_SIZE as u16 + 1).to_le_bytes();
        raw.write_all(&[9, bad_len[0], bad_len[1]]).await.unwrap();
        raw.flush().await.unwrap();

        assert!(server_conn
            .read_packet_timeout(Duration::from_secs(1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_builtin_ping_echo() {
        let listener = PacketListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = PacketConn::connect(addr).await.unwrap();
        let mut server_conn = listener.accept().await.unwrap().unwrap();

        let ping = CmdPacket::from_bytes(PORT_PING, &[0x55, 0xAA]).unwrap();
        client.send_packet(ping).await.unwrap();

        let packet = server_conn
            .read_packet_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        builtin_service_reply(&mut server_conn, packet, 42).await;

        let echo = client
            .read_packet_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(echo.dst_port(), PORT_PING);
        assert_eq!(echo.as_bytes(), &[0x55, 0xAA]);
    }
}
