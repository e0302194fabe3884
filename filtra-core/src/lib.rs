//! # filtra-core
//!
//! Core library for the filtra distributed image-filtering system.
//!
//! This crate contains:
//! - **Wire protocol**: `Envelope`, `MessageKind`, `ImageTask`,
//!   `WorkerAnnounce` — JSON over UDP, binary fields base64-encoded
//! - **Transport**: `UdpTransport` with a background receive loop and
//!   best-effort datagram sends
//! - **Filter**: median filter over a checked RGB `PixelBuffer`
//! - **Pipeline**: size-adaptive JPEG re-encode toward the datagram
//!   byte budget
//! - **Dispatcher**: worker registry, round-robin assignment, FIFO
//!   backlog, request/response correlation
//! - **Node**: the runtime driving a `RoleHandler` (dispatcher, worker,
//!   or client) over one transport
//! - **Error**: `FiltraError` — typed, `thiserror`-based error hierarchy

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod message;
pub mod node;
pub mod pipeline;
pub mod transport;
pub mod worker;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use client::{Client, LoadedImage, ProcessedImage};
pub use dispatcher::{Dispatcher, WorkerKey, WorkerRecord, WorkerState};
pub use error::FiltraError;
pub use filter::{DEFAULT_WINDOW, PixelBuffer, apply_median_filter, median_filter};
pub use message::{ACK_PAYLOAD, Envelope, ImageTask, MessageKind, WorkerAnnounce};
pub use node::{Node, OutboundSender, Outgoing, RoleHandler};
pub use pipeline::{MAX_RESCUE_ATTEMPTS, TARGET_PAYLOAD_BYTES, process_image};
pub use transport::{Inbound, MAX_DATAGRAM_BYTES, TransportSender, UdpTransport};
pub use worker::Worker;
