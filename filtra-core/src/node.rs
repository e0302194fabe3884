//! Node runtime: one transport, one role handler, two loops.
//!
//! A [`Node`] owns a bound [`UdpTransport`] and a [`RoleHandler`]. On
//! start it spawns an inbound loop (single consumer of the transport's
//! receive channel, invoking the handler one envelope at a time) and an
//! outbound loop (draining an mpsc of [`Outgoing`] messages through the
//! transport). Handlers and spawned work send by queueing on the
//! outbound channel, so every datagram leaves from the node's own
//! listening port.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::FiltraError;
use crate::message::Envelope;
use crate::transport::UdpTransport;

/// Depth of the outbound queue between handlers and the send loop.
const OUTBOUND_CHANNEL_DEPTH: usize = 256;

// ── Outgoing ─────────────────────────────────────────────────────

/// One envelope queued for transmission to `ip:port`.
#[derive(Debug)]
pub struct Outgoing {
    pub envelope: Envelope,
    pub ip: String,
    pub port: u16,
}

/// Handle for queueing sends; cloneable into spawned work.
pub type OutboundSender = mpsc::Sender<Outgoing>;

// ── RoleHandler ──────────────────────────────────────────────────

/// Per-role message logic driven by the node's inbound loop.
///
/// The handler is the sole owner of its state; the runtime calls it
/// from exactly one task, so implementations need no internal locking.
#[async_trait]
pub trait RoleHandler: Send + 'static {
    /// Role name used in log lines.
    fn role(&self) -> &'static str;

    /// Called once with the actual bound port, before any traffic.
    /// Relevant when binding port 0.
    fn on_bound(&mut self, _port: u16) {}

    /// Messages to send immediately after startup (e.g. a worker's
    /// registration). Default: none.
    fn greeting(&mut self) -> Vec<Outgoing> {
        Vec::new()
    }

    /// Process one inbound envelope. Sends go through `out`.
    async fn handle(&mut self, envelope: Envelope, from: SocketAddr, out: &OutboundSender);
}

// ── Node ─────────────────────────────────────────────────────────

/// A running protocol participant: transport plus role handler.
pub struct Node<H: RoleHandler> {
    transport: UdpTransport,
    handler: Option<H>,
    outbound_tx: OutboundSender,
    outbound_rx: Option<mpsc::Receiver<Outgoing>>,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl<H: RoleHandler> Node<H> {
    /// Bind the node's socket (`port` 0 selects an ephemeral port) and
    /// tell the handler where it landed.
    pub async fn bind(mut handler: H, port: u16) -> Result<Self, FiltraError> {
        let transport = UdpTransport::bind(port).await?;
        handler.on_bound(transport.local_port());

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_DEPTH);
        Ok(Self {
            transport,
            handler: Some(handler),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            tasks: Vec::new(),
            started: false,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.transport.local_port()
    }

    /// A handle for queueing sends from outside the handler (e.g. a
    /// client pushing staged requests).
    pub fn outbound(&self) -> OutboundSender {
        self.outbound_tx.clone()
    }

    /// Spawn the inbound and outbound loops. A node is not restartable:
    /// calling `start` twice is a logged no-op.
    pub async fn start(&mut self) {
        if self.started {
            warn!("node is already running, ignoring start");
            return;
        }
        let (Some(mut handler), Some(mut outbound_rx)) =
            (self.handler.take(), self.outbound_rx.take())
        else {
            warn!("node was already stopped, ignoring start");
            return;
        };
        self.started = true;

        let role = handler.role();
        info!("starting {role} node on port {}", self.local_port());

        let sender = self.transport.sender();
        self.tasks.push(tokio::spawn(async move {
            while let Some(out) = outbound_rx.recv().await {
                sender.send(&out.envelope, &out.ip, out.port).await;
            }
        }));

        let mut inbound = self.transport.start();
        let out = self.outbound_tx.clone();
        for msg in handler.greeting() {
            if out.send(msg).await.is_err() {
                warn!("outbound loop gone before greeting was queued");
            }
        }
        self.tasks.push(tokio::spawn(async move {
            while let Some(recv) = inbound.recv().await {
                handler.handle(recv.envelope, recv.from, &out).await;
            }
            info!("{role} inbound loop finished");
        }));
    }

    /// Stop both loops and the transport. Stopping a node that is not
    /// running is a logged no-op.
    pub fn stop(&mut self) {
        if !self.started {
            warn!("node is not running, ignoring stop");
            return;
        }
        self.started = false;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.transport.stop();
        info!("node on port {} stopped", self.local_port());
    }

    pub fn is_running(&self) -> bool {
        self.started
    }
}

impl<H: RoleHandler> Drop for Node<H> {
    fn drop(&mut self) {
        if self.started {
            self.stop();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ACK_PAYLOAD, MessageKind};
    use std::time::Duration;

    /// Replies to every inbound envelope with an Ack to its source.
    struct EchoHandler {
        bound_port: u16,
    }

    #[async_trait]
    impl RoleHandler for EchoHandler {
        fn role(&self) -> &'static str {
            "echo"
        }

        fn on_bound(&mut self, port: u16) {
            self.bound_port = port;
        }

        async fn handle(&mut self, _envelope: Envelope, from: SocketAddr, out: &OutboundSender) {
            let reply = Outgoing {
                envelope: Envelope::new(MessageKind::Ack, ACK_PAYLOAD.to_vec()),
                ip: from.ip().to_string(),
                port: from.port(),
            };
            let _ = out.send(reply).await;
        }
    }

    #[tokio::test]
    async fn handler_learns_bound_port_and_replies() {
        let mut node = Node::bind(EchoHandler { bound_port: 0 }, 0).await.unwrap();
        let node_port = node.local_port();
        assert_ne!(node_port, 0);
        node.start().await;

        let mut probe = UdpTransport::bind(0).await.unwrap();
        let mut rx = probe.start();
        let env = Envelope::new(MessageKind::FilterRequest, vec![1]);
        assert!(probe.send(&env, "127.0.0.1", node_port).await);

        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(inbound.envelope.kind, MessageKind::Ack);
        // The reply originates from the node's listening port.
        assert_eq!(inbound.from.port(), node_port);
    }

    #[tokio::test]
    async fn start_twice_is_a_noop() {
        let mut node = Node::bind(EchoHandler { bound_port: 0 }, 0).await.unwrap();
        node.start().await;
        node.start().await;
        assert!(node.is_running());
        node.stop();
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let mut node = Node::bind(EchoHandler { bound_port: 0 }, 0).await.unwrap();
        node.stop();
        assert!(!node.is_running());
    }
}
