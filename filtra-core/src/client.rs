//! Client role: submits images for filtering and collects the results.
//!
//! The client stages all its requests up front, minting one `task_id`
//! per image, and matches responses back against its pending table.
//! Completed images are pushed into an mpsc channel so the caller can
//! await them without sharing the handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::FiltraError;
use crate::message::{Envelope, ImageTask, MessageKind};
use crate::node::{OutboundSender, Outgoing, RoleHandler};

/// Depth of the completed-results channel.
const RESULTS_CHANNEL_DEPTH: usize = 64;

// ── Loaded / processed images ────────────────────────────────────

/// An image read from disk, ready to stage.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// A filtered image returned by the system.
#[derive(Debug)]
pub struct ProcessedImage {
    pub filename: String,
    pub image_bytes: Vec<u8>,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct PendingSubmission {
    filename: String,
    sent_at: Instant,
}

// ── Client ───────────────────────────────────────────────────────

/// Client-side handler state.
pub struct Client {
    dispatcher_ip: String,
    dispatcher_port: u16,
    listen_port: u16,
    pending: HashMap<String, PendingSubmission>,
    completed_tx: mpsc::Sender<ProcessedImage>,
}

impl Client {
    /// Returns the handler and the channel its completed results will
    /// arrive on.
    pub fn new(
        dispatcher_ip: impl Into<String>,
        dispatcher_port: u16,
    ) -> (Self, mpsc::Receiver<ProcessedImage>) {
        let (completed_tx, completed_rx) = mpsc::channel(RESULTS_CHANNEL_DEPTH);
        (
            Self {
                dispatcher_ip: dispatcher_ip.into(),
                dispatcher_port,
                listen_port: 0,
                pending: HashMap::new(),
                completed_tx,
            },
            completed_rx,
        )
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Read every decodable image in `dir`. Unreadable or non-image
    /// files are logged and skipped.
    pub fn load_images(dir: &Path) -> Result<Vec<LoadedImage>, FiltraError> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        let mut images = Vec::new();
        for path in entries {
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!("skipping unreadable file {}: {e}", path.display());
                    continue;
                }
            };
            let (format, width, height) = match image::load_from_memory(&bytes) {
                Ok(img) => {
                    let format = image::guess_format(&bytes)
                        .map(|f| format!("{f:?}").to_lowercase())
                        .unwrap_or_else(|_| "unknown".into());
                    (format, img.width(), img.height())
                }
                Err(e) => {
                    warn!("skipping {filename}, not a decodable image: {e}");
                    continue;
                }
            };
            debug!("loaded {filename} ({width}x{height}, {} KB)", bytes.len() / 1024);
            images.push(LoadedImage {
                bytes,
                filename,
                width,
                height,
                format,
            });
        }
        info!("loaded {} images from {}", images.len(), dir.display());
        Ok(images)
    }

    /// Mint a task per image, record it as pending, and return the
    /// request messages addressed to the dispatcher. Call before the
    /// node consumes the handler.
    pub fn stage(&mut self, images: Vec<LoadedImage>) -> Vec<Outgoing> {
        let mut out = Vec::with_capacity(images.len());
        for img in images {
            let task = ImageTask::new(img.bytes, img.filename, img.width, img.height, img.format);
            info!("submitting {} as task {}", task.filename, task.task_id);
            self.pending.insert(
                task.task_id.clone(),
                PendingSubmission {
                    filename: task.filename.clone(),
                    sent_at: Instant::now(),
                },
            );
            let payload = match task.encode() {
                Ok(p) => p,
                Err(e) => {
                    error!("failed to serialize task for {}: {e}", task.filename);
                    self.pending.remove(&task.task_id);
                    continue;
                }
            };
            out.push(Outgoing {
                envelope: Envelope::new(MessageKind::FilterRequest, payload)
                    .with_sender("127.0.0.1", self.listen_port),
                ip: self.dispatcher_ip.clone(),
                port: self.dispatcher_port,
            });
        }
        out
    }

    async fn on_response(&mut self, envelope: &Envelope) {
        let task = match ImageTask::decode(&envelope.payload) {
            Ok(t) => t,
            Err(e) => {
                error!("malformed filter response: {e}");
                return;
            }
        };

        let Some(pending) = self.pending.remove(&task.task_id) else {
            error!("result for unknown task {}, dropping", task.task_id);
            return;
        };

        let elapsed = pending.sent_at.elapsed();
        info!(
            "received {} ({} KB) after {:.2}s, {} still pending",
            pending.filename,
            task.image_bytes.len() / 1024,
            elapsed.as_secs_f64(),
            self.pending.len(),
        );

        let processed = ProcessedImage {
            filename: pending.filename,
            image_bytes: task.image_bytes,
            elapsed,
        };
        if self.completed_tx.send(processed).await.is_err() {
            warn!("results channel closed, dropping completed image");
        }
    }
}

#[async_trait]
impl RoleHandler for Client {
    fn role(&self) -> &'static str {
        "client"
    }

    fn on_bound(&mut self, port: u16) {
        self.listen_port = port;
    }

    async fn handle(&mut self, envelope: Envelope, from: SocketAddr, _out: &OutboundSender) {
        match envelope.kind {
            MessageKind::FilterResponse => self.on_response(&envelope).await,
            kind => debug!("ignoring {kind} from {from}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
