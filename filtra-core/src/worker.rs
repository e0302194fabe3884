//! Worker role: registers with the dispatcher, filters images, and
//! returns the results.
//!
//! Filtering is CPU-bound and runs on the blocking thread pool, so a
//! large image never stalls the inbound loop; a worker keeps accepting
//! datagrams while it processes. The dispatcher's one-task-per-worker
//! accounting is its own concern, not enforced here.

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::filter::DEFAULT_WINDOW;
use crate::message::{Envelope, ImageTask, MessageKind, WorkerAnnounce};
use crate::node::{OutboundSender, Outgoing, RoleHandler};
use crate::pipeline;

/// Worker-side handler state.
pub struct Worker {
    dispatcher_ip: String,
    dispatcher_port: u16,
    /// Address advertised in the registration; the dispatcher sends
    /// tasks and the Ack here.
    advertised_ip: String,
    listen_port: u16,
    window: usize,
}

impl Worker {
    pub fn new(dispatcher_ip: impl Into<String>, dispatcher_port: u16) -> Self {
        Self {
            dispatcher_ip: dispatcher_ip.into(),
            dispatcher_port,
            advertised_ip: "127.0.0.1".into(),
            listen_port: 0,
            window: DEFAULT_WINDOW,
        }
    }

    /// Override the IP announced to the dispatcher (defaults to
    /// loopback for single-machine runs).
    pub fn with_advertised_ip(mut self, ip: impl Into<String>) -> Self {
        self.advertised_ip = ip.into();
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    fn on_request(&self, envelope: &Envelope, out: &OutboundSender) {
        let task = match ImageTask::decode(&envelope.payload) {
            Ok(t) => t,
            Err(e) => {
                error!("malformed filter request: {e}");
                return;
            }
        };

        info!(
            "filtering {} ({} KB, {}x{})",
            task.filename,
            task.image_bytes.len() / 1024,
            task.width,
            task.height,
        );

        let out = out.clone();
        let (ip, port) = (self.dispatcher_ip.clone(), self.dispatcher_port);
        let listen_port = self.listen_port;
        let window = self.window;

        // The filter runs on the blocking pool; the response is queued
        // from the spawned task once it completes.
        tokio::spawn(async move {
            let bytes = task.image_bytes.clone();
            let result =
                tokio::task::spawn_blocking(move || pipeline::process_image(&bytes, window)).await;

            let processed = match result {
                Ok(Ok(p)) => p,
                Ok(Err(e)) => {
                    error!("failed to process {}: {e}", task.filename);
                    return;
                }
                Err(e) => {
                    error!("filter task for {} panicked: {e}", task.filename);
                    return;
                }
            };

            info!("finished {} ({} KB result)", task.filename, processed.len() / 1024);

            let mut response = task;
            response.image_bytes = processed;
            response.origin_worker_port = listen_port;

            let payload = match response.encode() {
                Ok(p) => p,
                Err(e) => {
                    error!("failed to serialize result for {}: {e}", response.filename);
                    return;
                }
            };
            let outgoing = Outgoing {
                envelope: Envelope::new(MessageKind::FilterResponse, payload),
                ip,
                port,
            };
            if out.send(outgoing).await.is_err() {
                warn!("outbound loop gone, dropping result for {}", response.filename);
            }
        });
    }
}

#[async_trait]
impl RoleHandler for Worker {
    fn role(&self) -> &'static str {
        "worker"
    }

    fn on_bound(&mut self, port: u16) {
        self.listen_port = port;
    }

    fn greeting(&mut self) -> Vec<Outgoing> {
        let announce = WorkerAnnounce {
            ip: self.advertised_ip.clone(),
            port: self.listen_port,
        };
        let payload = match announce.encode() {
            Ok(p) => p,
            Err(e) => {
                error!("failed to serialize registration: {e}");
                return Vec::new();
            }
        };
        info!(
            "registering {}:{} with dispatcher {}:{}",
            announce.ip, announce.port, self.dispatcher_ip, self.dispatcher_port,
        );
        vec![Outgoing {
            envelope: Envelope::new(MessageKind::WorkerRegister, payload),
            ip: self.dispatcher_ip.clone(),
            port: self.dispatcher_port,
        }]
    }

    async fn handle(&mut self, envelope: Envelope, from: SocketAddr, out: &OutboundSender) {
        match envelope.kind {
            MessageKind::FilterRequest => self.on_request(&envelope, out),
            MessageKind::Ack => info!("registration confirmed by {from}"),
            kind => debug!("ignoring {kind} from {from}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::from_fn(4, 4, |x, y| {
            image::Rgb([(x * 60) as u8, (y * 60) as u8, 200])
        });
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn from_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn greeting_announces_listen_port() {
        let mut worker = Worker::new("127.0.0.1", 9000);
        worker.on_bound(9101);

        let msgs = worker.greeting();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].envelope.kind, MessageKind::WorkerRegister);
        assert_eq!(msgs[0].ip, "127.0.0.1");
        assert_eq!(msgs[0].port, 9000);

        let announce = WorkerAnnounce::decode(&msgs[0].envelope.payload).unwrap();
        assert_eq!(announce.port, 9101);
    }

    #[tokio::test]
    async fn request_produces_response_with_origin_port() {
        let mut worker = Worker::new("127.0.0.1", 9000).with_window(3);
        worker.on_bound(9101);
        let (tx, mut rx) = mpsc::channel(8);

        let task = ImageTask::new(tiny_png(), "tiny.png", 4, 4, "png");
        let task_id = task.task_id.clone();
        let env = Envelope::new(MessageKind::FilterRequest, task.encode().unwrap());

        worker.handle(env, from_addr(), &tx).await;

        let outgoing = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");

        assert_eq!(outgoing.envelope.kind, MessageKind::FilterResponse);
        assert_eq!(outgoing.port, 9000);

        let response = ImageTask::decode(&outgoing.envelope.payload).unwrap();
        assert_eq!(response.task_id, task_id);
        assert_eq!(response.origin_worker_port, 9101);
        assert!(image::load_from_memory(&response.image_bytes).is_ok());
    }

    #[tokio::test]
    async fn undecodable_image_fails_silently() {
        let mut worker = Worker::new("127.0.0.1", 9000);
        worker.on_bound(9101);
        let (tx, mut rx) = mpsc::channel(8);

        let task = ImageTask::new(b"not an image".to_vec(), "bad.png", 4, 4, "png");
        let env = Envelope::new(MessageKind::FilterRequest, task.encode().unwrap());
        worker.handle(env, from_addr(), &tx).await;

        // No response is ever produced.
        let res = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(res.is_err());
    }
}
