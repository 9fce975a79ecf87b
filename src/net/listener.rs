//! Inbound side of the mesh transport.
//!
//! The listener owns the discovery UDP socket and the unicast TCP listener.
//! Every decoded envelope is forwarded onto a channel for the dispatcher;
//! frames that fail to decode are logged and dropped here, so the rest of the
//! node never sees them.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::transport::Inbound;
use crate::config::Settings;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::decode;

pub struct Listener {
    udp: UdpSocket,
    tcp: TcpListener,
    max_payload: usize,
    max_frame: usize,
    io_timeout: Duration,
}

impl Listener {
    /// Bind the discovery and unicast sockets. Failure to bind the unicast
    /// listener is fatal: without it the node cannot be reached.
    ///
    /// When another node on this host already owns the discovery port, an
    /// ephemeral port is used instead. Peers still answer our broadcasts over
    /// unicast, so discovery keeps working in one direction.
    pub async fn bind(settings: &Settings) -> Result<Self> {
        let udp_addr = format!("{}:{}", settings.bind_address, settings.discovery_port);
        let udp = match UdpSocket::bind(&udp_addr).await {
            Ok(udp) => udp,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(
                    "Discovery port {} in use, not listening for broadcasts",
                    settings.discovery_port
                );
                let fallback = format!("{}:0", settings.bind_address);
                UdpSocket::bind(&fallback)
                    .await
                    .map_err(|e| Error::Transport(format!("bind {}: {}", fallback, e)))?
            }
            Err(e) => return Err(Error::Transport(format!("bind {}: {}", udp_addr, e))),
        };

        let tcp_addr = format!("{}:{}", settings.bind_address, settings.listen_port);
        let tcp = TcpListener::bind(&tcp_addr)
            .await
            .map_err(|e| Error::Transport(format!("bind {}: {}", tcp_addr, e)))?;

        Ok(Self {
            udp,
            tcp,
            max_payload: settings.max_payload_bytes,
            max_frame: settings.max_frame_bytes(),
            io_timeout: settings.io_timeout(),
        })
    }

    /// Port the unicast listener actually bound to.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.tcp.local_addr()?.port())
    }

    /// Run until cancelled, forwarding decoded envelopes to `tx`. Each
    /// accepted connection is read on a task spawned on `tasks`.
    pub async fn run(
        self,
        tx: mpsc::Sender<Inbound>,
        cancel: CancellationToken,
        tasks: TaskTracker,
    ) {
        let mut buf = vec![0u8; self.max_frame];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Listener shutting down");
                    break;
                }
                result = self.udp.recv_from(&mut buf) => {
                    match result {
                        Ok((len, source)) => {
                            if let Some(inbound) = self.decode_frame(&buf[..len], source) {
                                if tx.send(inbound).await.is_err() {
                                    debug!("Inbox closed, listener stopping");
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!("Discovery receive error: {}", e),
                    }
                }
                result = self.tcp.accept() => {
                    match result {
                        Ok((stream, source)) => {
                            let tx = tx.clone();
                            let max_payload = self.max_payload;
                            let max_frame = self.max_frame;
                            let io_timeout = self.io_timeout;
                            tasks.spawn(async move {
                                match read_frame(stream, max_frame, io_timeout).await {
                                    Ok(bytes) => match decode(&bytes, max_payload) {
                                        Ok(envelope) => {
                                            if tx.send(Inbound { envelope, source }).await.is_err() {
                                                debug!(%source, "Inbox closed, dropping envelope");
                                            }
                                        }
                                        Err(e) => log_dropped(source, &e),
                                    },
                                    Err(e) => debug!(%source, "Connection dropped: {}", e),
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
            }
        }
    }

    fn decode_frame(&self, bytes: &[u8], source: SocketAddr) -> Option<Inbound> {
        if bytes.len() >= self.max_frame {
            log_dropped(source, &ProtocolError::FrameTooLarge { max: self.max_frame });
            return None;
        }
        match decode(bytes, self.max_payload) {
            Ok(envelope) => Some(Inbound { envelope, source }),
            Err(e) => {
                log_dropped(source, &e);
                None
            }
        }
    }
}

/// Read one envelope: everything up to EOF, bounded in size and time.
async fn read_frame(stream: TcpStream, max_frame: usize, io_timeout: Duration) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut limited = stream.take(max_frame as u64 + 1);

    match tokio::time::timeout(io_timeout, limited.read_to_end(&mut bytes)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(Error::Transport("read timed out".to_string())),
    }

    if bytes.len() > max_frame {
        return Err(ProtocolError::FrameTooLarge { max: max_frame }.into());
    }
    Ok(bytes)
}

fn log_dropped(source: SocketAddr, e: &ProtocolError) {
    warn!(%source, "Dropping envelope: {}", e);
}
