//! Dispatcher scheduling: worker registry, round-robin assignment,
//! FIFO backlog, and request/response correlation.
//!
//! All state is owned by the [`Dispatcher`] value and mutated only from
//! the node runtime's single inbound stream, so selection, busy-flag
//! toggling, and backlog draining are observed as one logical step per
//! message. Workers are never removed: a worker that dies mid-task stays
//! `busy` forever and its correlation entry is orphaned — there is no
//! timeout or recovery path.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message::{ACK_PAYLOAD, Envelope, ImageTask, MessageKind, WorkerAnnounce};
use crate::node::{OutboundSender, Outgoing, RoleHandler};

// ── WorkerKey ────────────────────────────────────────────────────

/// The `(ip, port)` pair identifying a registered worker. The sole
/// identity used for dedup, busy-state, and round-robin lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub ip: String,
    pub port: u16,
}

impl WorkerKey {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// ── Records ──────────────────────────────────────────────────────

/// A registered worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub ip: String,
    pub port: u16,
    pub registered_at: Instant,
}

impl WorkerRecord {
    fn key(&self) -> WorkerKey {
        WorkerKey::new(self.ip.clone(), self.port)
    }
}

/// Per-worker scheduling state. Created at first registration, never
/// removed.
#[derive(Debug, Default)]
pub struct WorkerState {
    pub busy: bool,
    /// Counted at dispatch time, not at completion.
    pub tasks_completed: u64,
    pub total_processing_seconds: f64,
}

/// Who is waiting for a given `task_id`, recorded on request arrival
/// and consumed on the matching response.
#[derive(Debug, Clone)]
pub struct ClientRequestInfo {
    pub client_ip: String,
    pub client_port: u16,
    /// Reset when the task is handed to a worker, so the measured
    /// interval covers the worker leg.
    pub request_time: Instant,
    pub filename: String,
}

/// A task waiting in the FIFO backlog for a free worker.
#[derive(Debug)]
pub struct PendingTask {
    pub envelope: Envelope,
    pub task_id: String,
    pub filename: String,
    pub client_info: ClientRequestInfo,
}

// ── Dispatcher ───────────────────────────────────────────────────

/// The scheduler, driven entirely by inbound envelopes.
pub struct Dispatcher {
    registry: Vec<WorkerRecord>,
    states: HashMap<WorkerKey, WorkerState>,
    backlog: VecDeque<PendingTask>,
    /// Correlation table: `task_id` -> waiting client.
    pending: HashMap<String, ClientRequestInfo>,
    rr_cursor: usize,
    tasks_received: u64,
    tasks_completed: u64,
    first_task_at: Option<Instant>,
    last_task_at: Option<Instant>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            registry: Vec::new(),
            states: HashMap::new(),
            backlog: VecDeque::new(),
            pending: HashMap::new(),
            rr_cursor: 0,
            tasks_received: 0,
            tasks_completed: 0,
            first_task_at: None,
            last_task_at: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    pub fn backlog_depth(&self) -> usize {
        self.backlog.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_busy(&self, key: &WorkerKey) -> bool {
        self.states.get(key).is_some_and(|s| s.busy)
    }

    pub fn worker_state(&self, key: &WorkerKey) -> Option<&WorkerState> {
        self.states.get(key)
    }

    fn free_count(&self) -> usize {
        self.states.values().filter(|s| !s.busy).count()
    }

    // ── Message entry point ──────────────────────────────────────

    /// Process one inbound envelope; the returned sends are the only
    /// side effects.
    pub fn process(&mut self, envelope: &Envelope, from: SocketAddr) -> Vec<Outgoing> {
        let mut out = Vec::new();
        match envelope.kind {
            MessageKind::WorkerRegister => self.on_register(envelope, &mut out),
            MessageKind::FilterRequest => self.on_request(envelope, from, &mut out),
            MessageKind::FilterResponse => self.on_response(envelope, from, &mut out),
            MessageKind::Ack => debug!("ignoring stray Ack from {from}"),
        }
        out
    }

    // ── Registration ─────────────────────────────────────────────

    fn on_register(&mut self, envelope: &Envelope, out: &mut Vec<Outgoing>) {
        let announce = match WorkerAnnounce::decode(&envelope.payload) {
            Ok(a) => a,
            Err(e) => {
                error!("malformed registration payload: {e}");
                return;
            }
        };
        let key = WorkerKey::new(announce.ip.clone(), announce.port);

        if self.states.contains_key(&key) {
            info!("worker {key} already registered, ignoring duplicate");
        } else {
            self.registry.push(WorkerRecord {
                worker_id: Uuid::new_v4().to_string(),
                ip: announce.ip.clone(),
                port: announce.port,
                registered_at: Instant::now(),
            });
            self.states.insert(key.clone(), WorkerState::default());
            info!("registered worker {key} ({} total)", self.registry.len());
            self.drain_backlog(out);
        }

        // Confirm regardless of dedup outcome, to the claimed address.
        out.push(Outgoing {
            envelope: Envelope::new(MessageKind::Ack, ACK_PAYLOAD.to_vec()),
            ip: announce.ip,
            port: announce.port,
        });
    }

    // ── Client request ───────────────────────────────────────────

    fn on_request(&mut self, envelope: &Envelope, from: SocketAddr, out: &mut Vec<Outgoing>) {
        if self.registry.is_empty() {
            warn!("no workers registered, dropping filter request from {from}");
            return;
        }

        let task = match ImageTask::decode(&envelope.payload) {
            Ok(t) => t,
            Err(e) => {
                error!("malformed filter request from {from}: {e}");
                return;
            }
        };

        self.tasks_received += 1;
        if self.first_task_at.is_none() {
            self.first_task_at = Some(Instant::now());
        }

        info!(
            "task #{} {} ({} KB) from {from}, {}/{} workers free",
            self.tasks_received,
            task.filename,
            task.image_bytes.len() / 1024,
            self.free_count(),
            self.registry.len(),
        );

        let client_info = ClientRequestInfo {
            client_ip: from.ip().to_string(),
            client_port: envelope.sender_port,
            request_time: Instant::now(),
            filename: task.filename.clone(),
        };
        self.pending
            .insert(task.task_id.clone(), client_info.clone());

        // Fresh envelope around the same payload for the worker leg.
        let pending_task = PendingTask {
            envelope: Envelope::new(MessageKind::FilterRequest, envelope.payload.clone()),
            task_id: task.task_id,
            filename: task.filename,
            client_info,
        };

        match self.select_free_worker() {
            Some(idx) => self.assign(pending_task, idx, out),
            None => {
                self.backlog.push_back(pending_task);
                warn!(
                    "all workers busy, task queued at backlog position {}",
                    self.backlog.len(),
                );
            }
        }
    }

    // ── Round-robin selection ────────────────────────────────────

    /// Scan at most `registry_len` entries starting at the cursor and
    /// return the index of the first free worker, advancing the cursor
    /// to one past the selection.
    fn select_free_worker(&mut self) -> Option<usize> {
        let len = self.registry.len();
        for i in 0..len {
            let idx = (self.rr_cursor + i) % len;
            let key = self.registry[idx].key();
            if self.states.get(&key).is_some_and(|s| !s.busy) {
                self.rr_cursor = (idx + 1) % len;
                debug!("round-robin selected worker {key}");
                return Some(idx);
            }
        }
        None
    }

    // ── Assignment ───────────────────────────────────────────────

    fn assign(&mut self, task: PendingTask, idx: usize, out: &mut Vec<Outgoing>) {
        let record = &self.registry[idx];
        let key = record.key();
        let (ip, port) = (record.ip.clone(), record.port);

        if let Some(state) = self.states.get_mut(&key) {
            state.busy = true;
            state.tasks_completed += 1;
            info!(
                "task {} -> worker #{} ({key}), {} tasks so far",
                task.filename,
                idx + 1,
                state.tasks_completed,
            );
        }

        // Restart the clock: processing time measures the worker leg.
        if let Some(info) = self.pending.get_mut(&task.task_id) {
            info.request_time = Instant::now();
        }

        out.push(Outgoing {
            envelope: task.envelope,
            ip,
            port,
        });
    }

    // ── Worker response ──────────────────────────────────────────

    fn on_response(&mut self, envelope: &Envelope, from: SocketAddr, out: &mut Vec<Outgoing>) {
        let task = match ImageTask::decode(&envelope.payload) {
            Ok(t) => t,
            Err(e) => {
                error!("malformed filter response from {from}: {e}");
                return;
            }
        };

        // The datagram's source port may be ephemeral; trust the port
        // the worker reported in the payload.
        let key = WorkerKey::new(from.ip().to_string(), task.origin_worker_port);

        self.tasks_completed += 1;
        self.last_task_at = Some(Instant::now());

        info!(
            "result for {} ({} KB) from worker {key}",
            task.filename,
            envelope.payload.len() / 1024,
        );

        if let Some(info) = self.pending.get(&task.task_id) {
            let elapsed = info.request_time.elapsed().as_secs_f64();
            if let Some(state) = self.states.get_mut(&key) {
                state.total_processing_seconds += elapsed;
            }
            debug!("processing time {elapsed:.2}s for {}", task.filename);
        }

        match self.states.get_mut(&key) {
            Some(state) => {
                state.busy = false;
                info!("worker {key} is free again");
            }
            None => warn!("response from unknown worker {key}"),
        }

        match self.pending.remove(&task.task_id) {
            Some(info) => {
                out.push(Outgoing {
                    envelope: Envelope::new(MessageKind::FilterResponse, envelope.payload.clone()),
                    ip: info.client_ip,
                    port: info.client_port,
                });
                info!(
                    "forwarded result to client, {}/{} tasks complete",
                    self.tasks_completed, self.tasks_received,
                );
            }
            None => error!("no waiting client for task {}, dropping result", task.task_id),
        }

        if self.tasks_completed == self.tasks_received && self.tasks_received > 0 {
            self.log_summary();
        }

        self.drain_backlog(out);
    }

    // ── Backlog drain ────────────────────────────────────────────

    fn drain_backlog(&mut self, out: &mut Vec<Outgoing>) {
        while !self.backlog.is_empty() {
            let Some(idx) = self.select_free_worker() else {
                warn!(
                    "{} queued tasks waiting, no free workers",
                    self.backlog.len(),
                );
                break;
            };
            let Some(task) = self.backlog.pop_front() else {
                break;
            };
            info!(
                "dequeued {} ({} still queued)",
                task.filename,
                self.backlog.len(),
            );
            self.assign(task, idx, out);
        }
    }

    // ── Statistics ───────────────────────────────────────────────

    fn log_summary(&self) {
        let total_seconds = match (self.first_task_at, self.last_task_at) {
            (Some(first), Some(last)) => last.duration_since(first).as_secs_f64(),
            _ => 0.0,
        };

        info!(
            "all tasks complete: {} tasks across {} workers in {total_seconds:.2}s \
             ({:.2}s/task average)",
            self.tasks_completed,
            self.registry.len(),
            total_seconds / self.tasks_completed.max(1) as f64,
        );

        for (i, record) in self.registry.iter().enumerate() {
            let Some(state) = self.states.get(&record.key()) else {
                continue;
            };
            let share = if self.tasks_completed > 0 {
                state.tasks_completed as f64 * 100.0 / self.tasks_completed as f64
            } else {
                0.0
            };
            let average = if state.tasks_completed > 0 {
                state.total_processing_seconds / state.tasks_completed as f64
            } else {
                0.0
            };
            info!(
                "worker #{} ({}): {} tasks ({share:.1}%), {:.2}s total, {average:.2}s/task",
                i + 1,
                record.key(),
                state.tasks_completed,
                state.total_processing_seconds,
            );
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ── RoleHandler ──────────────────────────────────────────────────

#[async_trait]
impl RoleHandler for Dispatcher {
    fn role(&self) -> &'static str {
        "dispatcher"
    }

    async fn handle(&mut self, envelope: Envelope, from: SocketAddr, out: &OutboundSender) {
        for outgoing in self.process(&envelope, from) {
            if out.send(outgoing).await.is_err() {
                warn!("outbound channel closed, dropping send");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
