//! Core manager types
//!
//! This module contains the fundamental types used throughout the partition
//! manager core. All types here are pure data - no behavior that depends on
//! the hosting platform.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use warden_ipc::{Handle, SignalSet, MAX_IOVEC};

use crate::iovec::{InVec, OutVec, VecAccess};
use crate::policy::FaultMode;

/// Partition identifier. Positive in the secure world; a partition acting
/// as a client presents its own id as the client id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub i32);

/// Service identifier (32-bit SID from the manifest).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub u32);

/// Internal connection identifier, never recycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// Internal message identifier, never recycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

/// Ticket identifying a suspended client awaiting a service reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompletionTicket(pub u64);

/// Client identity as seen by services. Negative ids are reserved for
/// non-secure callers; positive ids are partition ids.
pub type ClientId = i32;

/// Returns true when the client id belongs to the non-secure world.
pub fn is_nonsecure(client: ClientId) -> bool {
    client < 0
}

/// How a service negotiates version compatibility at connect time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionPolicy {
    /// Requested version must equal the provided version.
    Strict,
    /// Requested version must not exceed the provided version.
    Relaxed,
}

impl VersionPolicy {
    /// Check a client-requested version against the service's provided one.
    pub fn accepts(&self, provided: u32, requested: u32) -> bool {
        match self {
            VersionPolicy::Strict => requested == provided,
            VersionPolicy::Relaxed => requested <= provided,
        }
    }
}

/// Interrupt completion model for a bound interrupt line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrqHandling {
    /// First-level handling: the partition acknowledges with `reset_signal`.
    FirstLevel,
    /// Second-level handling: the partition acknowledges with `eoi`,
    /// which also re-enables the line.
    SecondLevel,
}

/// Partition run state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Schedulable; not parked in `wait`.
    Ready,
    /// Parked in a blocking `wait` until a masked signal asserts.
    Waiting(u32),
    /// Fatally terminated; never resumes.
    Dead,
}

/// An interrupt line bound to a partition signal bit.
#[derive(Clone, Debug, PartialEq)]
pub struct IrqLine {
    /// Platform interrupt line number.
    pub line: u32,
    /// Signal bit slot within the partition's irq range (0..4).
    pub slot: u32,
    /// Completion model.
    pub handling: IrqHandling,
    /// Whether deliveries are currently accepted.
    pub enabled: bool,
}

/// Per-partition resource tracking
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PartitionMetrics {
    /// Requests issued as a client (connect, call, close)
    pub calls_issued: u64,
    /// Messages retrieved via `get`
    pub messages_handled: u64,
    /// Replies sent
    pub replies_sent: u64,
    /// Fatal terminations charged to this partition
    pub faults: u64,
    /// Time of last activity (nanos since boot)
    pub last_active_ns: u64,
}

/// Secure partition descriptor
#[derive(Debug, PartialEq)]
pub struct Partition {
    /// Partition ID
    pub id: PartitionId,
    /// Partition name
    pub name: String,
    /// Error disposition for fatal statuses charged to this partition
    pub fault_mode: FaultMode,
    /// Currently asserted signal bits
    pub signals: SignalSet,
    /// Signal bits this partition can ever observe (doorbell plus owned
    /// service and irq slots)
    pub valid_signals: SignalSet,
    /// Current run state
    pub run_state: RunState,
    /// Bound interrupt lines
    pub irqs: Vec<IrqLine>,
    /// Detailed metrics for this partition
    pub metrics: PartitionMetrics,
    /// Service signal slots handed out so far
    pub service_slots: u32,
}

impl Partition {
    /// Look up a bound interrupt line by platform line number.
    pub fn irq_line(&self, line: u32) -> Option<&IrqLine> {
        self.irqs.iter().find(|irq| irq.line == line)
    }

    /// Mutable lookup of a bound interrupt line.
    pub fn irq_line_mut(&mut self, line: u32) -> Option<&mut IrqLine> {
        self.irqs.iter_mut().find(|irq| irq.line == line)
    }

    /// Find the bound line whose signal slot matches the given irq bit slot.
    pub fn irq_by_slot(&self, slot: u32) -> Option<&IrqLine> {
        self.irqs.iter().find(|irq| irq.slot == slot)
    }

    /// Mutable variant of [`Partition::irq_by_slot`].
    pub fn irq_by_slot_mut(&mut self, slot: u32) -> Option<&mut IrqLine> {
        self.irqs.iter_mut().find(|irq| irq.slot == slot)
    }

    /// Returns true unless the partition has been fatally terminated.
    pub fn is_alive(&self) -> bool {
        self.run_state != RunState::Dead
    }
}

/// Per-service tracking
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceMetrics {
    /// Messages currently queued and undelivered
    pub queue_depth: usize,
    /// Total messages ever queued to this service
    pub total_messages: u64,
    /// High water mark (max queue depth seen)
    pub queue_high_water: usize,
}

/// Service descriptor, static apart from the delivery queue.
#[derive(Debug, PartialEq)]
pub struct Service {
    /// Service ID
    pub sid: ServiceId,
    /// Service name
    pub name: String,
    /// Owning partition
    pub partition: PartitionId,
    /// Provided version
    pub version: u32,
    /// Version negotiation policy
    pub policy: VersionPolicy,
    /// Whether connect/close are accepted for this service
    pub connection_based: bool,
    /// Stateless handle table index, if the service is stateless
    pub stateless_index: Option<u8>,
    /// Whether non-secure clients may reach this service
    pub ns_accessible: bool,
    /// Whether the service accepts zero-copy vector mapping
    pub mm_iovec: bool,
    /// Signal bit slot within the owning partition's service range (0..24)
    pub signal_slot: u32,
    /// Queue of undelivered messages
    pub pending: VecDeque<MessageId>,
    /// Metrics
    pub metrics: ServiceMetrics,
}

impl Service {
    /// The signal bit this service asserts in its owning partition.
    pub fn signal(&self) -> SignalSet {
        // Slot assignment is bounds checked at registration time.
        SignalSet::service(self.signal_slot).unwrap_or(SignalSet::empty())
    }

    /// Enqueue a message for delivery.
    pub fn enqueue(&mut self, id: MessageId) {
        self.pending.push_back(id);
        self.metrics.queue_depth = self.pending.len();
        self.metrics.total_messages += 1;
        if self.metrics.queue_depth > self.metrics.queue_high_water {
            self.metrics.queue_high_water = self.metrics.queue_depth;
        }
    }

    /// Dequeue the oldest undelivered message.
    pub fn dequeue(&mut self) -> Option<MessageId> {
        let id = self.pending.pop_front();
        self.metrics.queue_depth = self.pending.len();
        id
    }

    /// Return a just-dequeued message to the head of the queue. Does not
    /// count as a new arrival.
    pub fn requeue(&mut self, id: MessageId) {
        self.pending.push_front(id);
        self.metrics.queue_depth = self.pending.len();
    }
}

/// Connection lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Connect message queued; the service has not replied yet.
    Pending,
    /// Established and quiescent; the client may call or close.
    Idle,
    /// A call is in flight; further calls and close are refused.
    Active,
    /// Disconnect message queued; destroyed when the service completes it.
    Closing,
}

/// A client's established (or establishing) session with a service.
#[derive(Debug, PartialEq)]
pub struct Connection {
    /// Connection ID
    pub id: ConnectionId,
    /// Target service
    pub service: ServiceId,
    /// Owning client
    pub client: ClientId,
    /// Version negotiated at connect time
    pub version: u32,
    /// Service-managed reverse handle, echoed on later messages
    pub rhandle: u64,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Registry handle held by the client while Idle or Active
    pub client_handle: Option<Handle>,
}

/// An in-flight request from a client to a service.
#[derive(Debug, PartialEq)]
pub struct SpmMessage {
    /// Message ID
    pub id: MessageId,
    /// Message kind (connect, call with request type, disconnect)
    pub kind: warden_ipc::MessageKind,
    /// Originating client
    pub client: ClientId,
    /// Target service
    pub service: ServiceId,
    /// Backing connection, if any (stateless calls have none)
    pub connection: Option<ConnectionId>,
    /// Reverse handle captured when the message was created
    pub rhandle: u64,
    /// Input vectors (calls only)
    pub invecs: [InVec; MAX_IOVEC],
    /// Output vectors (calls only)
    pub outvecs: [OutVec; MAX_IOVEC],
    /// Per-slot access tracking
    pub access: VecAccess,
    /// Completion ticket for the suspended client (absent for disconnect)
    pub ticket: Option<CompletionTicket>,
    /// Registry handle held by the serving partition once delivered
    pub service_handle: Option<Handle>,
}

impl SpmMessage {
    /// Returns true once the message has been handed out via `get`.
    pub fn is_delivered(&self) -> bool {
        self.service_handle.is_some()
    }

    /// Declared input vector sizes, zero for unused slots.
    pub fn in_sizes(&self) -> [usize; MAX_IOVEC] {
        let mut sizes = [0usize; MAX_IOVEC];
        for (i, iv) in self.invecs.iter().enumerate() {
            sizes[i] = iv.total();
        }
        sizes
    }

    /// Declared output vector capacities, zero for unused slots.
    pub fn out_sizes(&self) -> [usize; MAX_IOVEC] {
        let mut sizes = [0usize; MAX_IOVEC];
        for (i, ov) in self.outvecs.iter().enumerate() {
            sizes[i] = ov.capacity();
        }
        sizes
    }
}

/// System-wide metrics
#[derive(Clone, Debug)]
pub struct SpmMetrics {
    /// Partition count
    pub partition_count: usize,
    /// Service count
    pub service_count: usize,
    /// Live connections
    pub connection_count: usize,
    /// Messages in flight (queued or delivered)
    pub message_count: usize,
    /// Live registry handles
    pub handle_count: usize,
    /// Total messages queued since boot
    pub total_messages: u64,
}
