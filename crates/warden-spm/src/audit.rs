//! Audit event log
//!
//! Records control-plane requests and their responses so connections,
//! replies, and terminations can be reconstructed after the fact. The
//! gateway in `runtime` filters out data-plane traffic (vector reads and
//! writes, wait polling) before it reaches this log.

use serde::{Deserialize, Serialize};

/// Unique event ID (monotonic per log).
pub type EventId = u64;

/// One recorded manager event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Client the event is attributed to. Negative ids are non-secure
    /// callers.
    pub client: i32,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    /// Event type (request, response, or fault)
    pub kind: AuditKind,
}

/// Type of audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuditKind {
    /// A request entering the manager
    Request {
        /// Operation name
        op: String,
        /// Salient argument: handle bits, service id, signal bits, or
        /// target partition, depending on the operation
        arg: u64,
    },
    /// The manager's answer to a request
    Response {
        /// ID of the request this responds to
        request_id: EventId,
        /// Result code (negative = error status)
        result: i64,
    },
    /// The caller was fatally terminated instead of receiving a result
    Fault,
}

/// Maximum number of events to keep in memory
const MAX_AUDIT_EVENTS: usize = 10000;

/// Bounded manager event log for auditing.
///
/// Events are append-only with monotonic IDs; once capacity is exceeded
/// the oldest entries are dropped.
pub struct AuditLog {
    /// Event entries (append-only)
    events: Vec<AuditEvent>,
    /// Next event ID to assign
    next_id: EventId,
}

impl AuditLog {
    /// Create a new empty log.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
        }
    }

    /// Log a request.
    ///
    /// Returns the event ID for correlating with the response.
    pub fn log_request(&mut self, client: i32, op: &str, arg: u64, timestamp: u64) -> EventId {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(AuditEvent {
            id,
            client,
            timestamp,
            kind: AuditKind::Request {
                op: op.to_string(),
                arg,
            },
        });

        self.trim_if_needed();
        id
    }

    /// Log a response to a previously logged request.
    pub fn log_response(&mut self, client: i32, request_id: EventId, result: i64, timestamp: u64) {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(AuditEvent {
            id,
            client,
            timestamp,
            kind: AuditKind::Response { request_id, result },
        });

        self.trim_if_needed();
    }

    /// Log a fatal termination charged to `client`.
    pub fn log_fault(&mut self, client: i32, timestamp: u64) {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(AuditEvent {
            id,
            client,
            timestamp,
            kind: AuditKind::Fault,
        });

        self.trim_if_needed();
    }

    /// Get all events.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Get events in a sequence range.
    pub fn get_range(&self, start_id: EventId, end_id: EventId) -> Vec<&AuditEvent> {
        self.events
            .iter()
            .filter(|e| e.id >= start_id && e.id < end_id)
            .collect()
    }

    /// Get the most recent N events.
    pub fn get_recent(&self, count: usize) -> Vec<&AuditEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Get the number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the next event ID.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Trim old events if exceeding max capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > MAX_AUDIT_EVENTS {
            let drain_count = self.events.len() - MAX_AUDIT_EVENTS;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
