//! Outbound transport: UDP broadcast for discovery, one-shot TCP connections
//! for everything addressed to a single agent.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::protocol::{encode, Envelope};

/// An envelope received from the network, with the address it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub envelope: Envelope,
    pub source: SocketAddr,
}

/// Sending half of the mesh transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connectionless broadcast to every node on the discovery port.
    async fn broadcast(&self, envelope: &Envelope) -> Result<()>;

    /// Connection-oriented delivery to one agent's advertised endpoint.
    async fn send_to(&self, addr: SocketAddr, envelope: &Envelope) -> Result<()>;
}

/// Real network transport.
pub struct NetTransport {
    udp: UdpSocket,
    broadcast_target: SocketAddr,
    max_payload: usize,
    io_timeout: Duration,
}

impl NetTransport {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let broadcast_ip: IpAddr = settings.broadcast_address.parse().map_err(|e| {
            Error::Config(format!(
                "Invalid broadcastAddress '{}': {}",
                settings.broadcast_address, e
            ))
        })?;

        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        udp.set_broadcast(true)?;

        Ok(Self {
            udp,
            broadcast_target: SocketAddr::new(broadcast_ip, settings.discovery_port),
            max_payload: settings.max_payload_bytes,
            io_timeout: settings.io_timeout(),
        })
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn broadcast(&self, envelope: &Envelope) -> Result<()> {
        let frame = encode(envelope, self.max_payload)?;
        let sent = self
            .udp
            .send_to(&frame, self.broadcast_target)
            .await
            .map_err(Error::transport)?;
        tracing::trace!(
            bytes = sent,
            target = %self.broadcast_target,
            "Broadcast {}",
            envelope.message_type
        );
        Ok(())
    }

    async fn send_to(&self, addr: SocketAddr, envelope: &Envelope) -> Result<()> {
        let frame = encode(envelope, self.max_payload)?;

        let deliver = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(&frame).await?;
            stream.shutdown().await
        };

        match tokio::time::timeout(self.io_timeout, deliver).await {
            Ok(Ok(())) => {
                tracing::trace!(%addr, "Sent {} to {}", envelope.message_type, envelope.recipient_id);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Transport(format!("{}: {}", addr, e))),
            Err(_) => Err(Error::Transport(format!(
                "{}: timed out after {}ms",
                addr,
                self.io_timeout.as_millis()
            ))),
        }
    }
}
