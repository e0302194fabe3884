//! UDP transport: one envelope per datagram.
//!
//! [`UdpTransport`] binds a socket, runs exactly one background receive
//! loop, and exposes best-effort sends. Each received datagram is decoded
//! into an [`Envelope`], stamped with the observed source address, and
//! forwarded into an mpsc channel — the single-consumer stream a node
//! runtime drains. Undecodable datagrams are logged and dropped; the
//! loop only exits when the transport is stopped.
//!
//! Sends never block the receive loop. A serialized envelope above the
//! safety ceiling is still transmitted (with a warning) because UDP
//! itself enforces the hard limit; a short pacing delay follows any
//! large payload so back-to-back bursts are less likely to be dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::FiltraError;
use crate::message::Envelope;

// ── Constants ────────────────────────────────────────────────────

/// Safety ceiling for one serialized envelope, comfortably under the
/// practical UDP maximum of ~65,507 bytes.
pub const MAX_DATAGRAM_BYTES: usize = 60_000;

/// Payloads above this size get a pacing delay after the send.
pub const PACING_THRESHOLD_BYTES: usize = 10_000;

/// Pacing delay applied after any large send.
const PACING_DELAY: Duration = Duration::from_millis(50);

/// Receive buffer, sized for the largest possible datagram.
const RECV_BUFFER_BYTES: usize = 65_536;

/// Depth of the inbound channel between the receive loop and the node.
const INBOUND_CHANNEL_DEPTH: usize = 256;

// ── Inbound ──────────────────────────────────────────────────────

/// One received envelope together with its observed source address.
#[derive(Debug)]
pub struct Inbound {
    pub envelope: Envelope,
    pub from: SocketAddr,
}

// ── TransportSender ──────────────────────────────────────────────

/// Cheap cloneable handle for sending envelopes through a bound socket.
///
/// Held by outbound loops and spawned work so sends keep originating
/// from the node's listening port.
#[derive(Debug, Clone)]
pub struct TransportSender {
    socket: Arc<UdpSocket>,
}

impl TransportSender {
    /// Serialize and transmit one envelope as a single datagram.
    ///
    /// Returns `true` on success. All failure modes are logged here;
    /// callers treat `false` as "message lost" and continue. Sends are
    /// best-effort and work whether or not the receive loop is running.
    pub async fn send(&self, envelope: &Envelope, ip: &str, port: u16) -> bool {
        let data = match envelope.encode() {
            Ok(d) => d,
            Err(e) => {
                error!("failed to serialize {} envelope: {e}", envelope.kind);
                return false;
            }
        };

        if data.len() > MAX_DATAGRAM_BYTES {
            warn!(
                "datagram of {} bytes exceeds the {MAX_DATAGRAM_BYTES}-byte safety \
                 ceiling; attempting transmission anyway",
                data.len(),
            );
        }

        let target: SocketAddr = match format!("{ip}:{port}").parse() {
            Ok(a) => a,
            Err(e) => {
                error!("invalid target address {ip}:{port}: {e}");
                return false;
            }
        };

        if let Err(e) = self.socket.send_to(&data, target).await {
            error!("failed to send {} to {target}: {e}", envelope.kind);
            return false;
        }

        // Back-to-back large datagrams risk loss; give the stack a moment.
        if data.len() > PACING_THRESHOLD_BYTES {
            tokio::time::sleep(PACING_DELAY).await;
        }

        true
    }
}

// ── UdpTransport ─────────────────────────────────────────────────

/// A bound UDP endpoint with a background receive loop.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    recv_task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind `0.0.0.0:port` (`port` 0 selects an ephemeral port).
    pub async fn bind(port: u16) -> Result<Self, FiltraError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .await
            .map_err(|source| FiltraError::Bind { port, source })?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            running: Arc::new(AtomicBool::new(false)),
            recv_task: None,
        })
    }

    /// The port this transport is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// A cloneable send handle backed by the same socket.
    pub fn sender(&self) -> TransportSender {
        TransportSender {
            socket: Arc::clone(&self.socket),
        }
    }

    /// Serialize and transmit one envelope. See [`TransportSender::send`].
    pub async fn send(&self, envelope: &Envelope, ip: &str, port: u16) -> bool {
        self.sender().send(envelope, ip, port).await
    }

    /// Start the receive loop and return the inbound channel.
    ///
    /// For each datagram, the loop decodes an [`Envelope`], overwrites
    /// its `sender_ip` / `sender_port` with the observed source, and
    /// forwards it. Decode failures drop the datagram and continue.
    pub fn start(&mut self) -> mpsc::Receiver<Inbound> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);
        self.running.store(true, Ordering::SeqCst);

        let socket = Arc::clone(&self.socket);
        let running = Arc::clone(&self.running);
        let local = self.local_addr;

        self.recv_task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_BYTES];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        if !running.load(Ordering::SeqCst) {
                            break; // deliberate stop
                        }
                        error!("receive error on {local}: {e}");
                        continue;
                    }
                };

                match Envelope::decode(&buf[..len]) {
                    Ok(mut envelope) => {
                        envelope.sender_ip = from.ip().to_string();
                        envelope.sender_port = from.port();
                        debug!(
                            "received {} ({len} bytes) from {from}",
                            envelope.kind,
                        );
                        if tx.send(Inbound { envelope, from }).await.is_err() {
                            break; // consumer gone
                        }
                    }
                    Err(e) => {
                        warn!("dropping undecodable datagram ({len} bytes) from {from}: {e}");
                    }
                }
            }
        }));

        info!("listening on {}", self.local_addr);
        rx
    }

    /// Cancel the receive loop. Idempotent.
    ///
    /// The endpoint is released once the last [`TransportSender`] clone
    /// is dropped.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.recv_task.take() {
            task.abort();
            info!("stopped listening on {}", self.local_addr);
        }
    }

    /// Whether the receive loop has been started and not stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use std::time::Duration;

    #[tokio::test]
    async fn envelope_roundtrip_over_localhost() {
        let sender = UdpTransport::bind(0).await.unwrap();
        let mut receiver = UdpTransport::bind(0).await.unwrap();
        let port = receiver.local_port();
        let mut rx = receiver.start();

        let env = Envelope::new(MessageKind::FilterRequest, vec![1, 2, 3]);
        assert!(sender.send(&env, "127.0.0.1", port).await);

        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");

        assert_eq!(inbound.envelope.kind, MessageKind::FilterRequest);
        assert_eq!(inbound.envelope.payload, vec![1, 2, 3]);
        // Sender address is stamped from the datagram source.
        assert_eq!(inbound.envelope.sender_ip, "127.0.0.1");
        assert_eq!(inbound.envelope.sender_port, sender.local_port());
    }

    #[tokio::test]
    async fn undecodable_datagram_is_dropped_and_loop_continues() {
        let mut receiver = UdpTransport::bind(0).await.unwrap();
        let port = receiver.local_port();
        let mut rx = receiver.start();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"garbage", ("127.0.0.1", port)).await.unwrap();

        let sender = UdpTransport::bind(0).await.unwrap();
        let env = Envelope::new(MessageKind::Ack, crate::message::ACK_PAYLOAD.to_vec());
        assert!(sender.send(&env, "127.0.0.1", port).await);

        // Only the valid envelope comes through.
        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(inbound.envelope.kind, MessageKind::Ack);
    }

    #[tokio::test]
    async fn send_to_bad_address_returns_false() {
        let sender = UdpTransport::bind(0).await.unwrap();
        let env = Envelope::new(MessageKind::Ack, Vec::new());
        assert!(!sender.send(&env, "not-an-ip", 1).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut transport = UdpTransport::bind(0).await.unwrap();
        let _rx = transport.start();
        transport.stop();
        transport.stop();
        assert!(!transport.is_running());
    }
}
