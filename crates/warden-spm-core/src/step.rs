//! Pure step function - the heart of the verification target
//!
//! This module contains the pure `step(state, request) -> (state', outcome)`
//! function. All state transformations happen here - no platform calls, no
//! I/O, no blocking.
//!
//! # Design
//!
//! The step function takes:
//! - Current manager state
//! - The caller's client id
//! - One protocol request
//! - Current timestamp
//!
//! And returns:
//! - Updated state (via mutation)
//! - An outcome for the caller
//! - Effects the hosting runtime must apply (wake a parked partition,
//!   fulfill a suspended client)
//!
//! Blocking is modeled, never performed: a request that must suspend
//! returns [`Outcome::WouldBlock`] or [`Outcome::Suspended`], and a later
//! step that satisfies it emits the matching [`Effect`]. This keeps every
//! transition deterministic and testable without threads.
//!
//! Every status produced here flows through [`classified`], the single
//! gate deciding between returning the status and terminating the caller.

use alloc::vec;
use alloc::vec::Vec;

use warden_ipc::{
    CallControl, Handle, MessageInfo, MessageKind, SignalSet, Status, Timeout, FRAMEWORK_VERSION,
    MAX_IOVEC, VERSION_NONE,
};

use crate::handle::HandleTarget;
use crate::iovec::{InVec, OutVec, VecAccess};
use crate::policy::{disposition, Disposition};
use crate::state::SpmState;
use crate::types::{
    is_nonsecure, ClientId, CompletionTicket, Connection, ConnectionState, IrqHandling, MessageId,
    PartitionId, RunState, ServiceId, SpmMessage,
};

// ============================================================================
// Request definitions
// ============================================================================

/// Protocol request variants - every operation a client or partition can
/// submit to the manager.
#[derive(Clone, Debug)]
pub enum Request {
    /// Query the protocol version implemented by the manager.
    FrameworkVersion,

    /// Query a service's version, 0 when absent or unauthorized.
    ServiceVersion { sid: ServiceId },

    /// Establish a connection to a connection-based service.
    Connect { sid: ServiceId, version: u32 },

    /// Issue a request on a connection or stateless handle. The caller
    /// suspends until the service replies.
    Call {
        handle: Handle,
        control: CallControl,
        invecs: Vec<Vec<u8>>,
        outvec_capacities: Vec<usize>,
    },

    /// Tear down an idle connection. Fire-and-forget.
    Close { handle: Handle },

    /// Collect asserted signals, optionally suspending until one arrives.
    Wait { mask: SignalSet, timeout: Timeout },

    /// Claim the oldest queued message behind one asserted service signal.
    Get { signal: SignalSet },

    /// Copy bytes out of an input vector.
    Read {
        handle: Handle,
        invec_idx: usize,
        max_bytes: usize,
    },

    /// Discard bytes from an input vector.
    Skip {
        handle: Handle,
        invec_idx: usize,
        num_bytes: usize,
    },

    /// Append bytes to an output vector.
    Write {
        handle: Handle,
        outvec_idx: usize,
        data: Vec<u8>,
    },

    /// Complete a delivered message and resume its client.
    Reply { handle: Handle, status: Status },

    /// Store a reverse handle on the message's connection, echoed on
    /// later deliveries.
    SetRhandle { handle: Handle, rhandle: u64 },

    /// Map an input vector for zero-copy consumption.
    MapInvec { handle: Handle, invec_idx: usize },

    /// Unmap a mapped input vector, retiring the slot.
    UnmapInvec { handle: Handle, invec_idx: usize },

    /// Map an output vector, receiving a writable buffer of its capacity.
    MapOutvec { handle: Handle, outvec_idx: usize },

    /// Unmap a mapped output vector, committing `len` bytes of `data`.
    UnmapOutvec {
        handle: Handle,
        outvec_idx: usize,
        len: usize,
        data: Vec<u8>,
    },

    /// Raise another partition's doorbell signal.
    Notify { partition: PartitionId },

    /// Clear the caller's doorbell signal.
    Clear,

    /// Enable deliveries on an owned interrupt signal.
    IrqEnable { signal: SignalSet },

    /// Disable deliveries on an owned interrupt signal. Returns the
    /// previous enable state.
    IrqDisable { signal: SignalSet },

    /// Acknowledge a first-level interrupt signal.
    ResetSignal { signal: SignalSet },

    /// Acknowledge a second-level interrupt signal, re-enabling the line.
    Eoi { signal: SignalSet },

    /// Unconditionally terminate the calling execution context.
    Panic,
}

impl Request {
    /// Stable operation name, used by the hosting runtime's audit log.
    pub fn name(&self) -> &'static str {
        match self {
            Request::FrameworkVersion => "framework_version",
            Request::ServiceVersion { .. } => "service_version",
            Request::Connect { .. } => "connect",
            Request::Call { .. } => "call",
            Request::Close { .. } => "close",
            Request::Wait { .. } => "wait",
            Request::Get { .. } => "get",
            Request::Read { .. } => "read",
            Request::Skip { .. } => "skip",
            Request::Write { .. } => "write",
            Request::Reply { .. } => "reply",
            Request::SetRhandle { .. } => "set_rhandle",
            Request::MapInvec { .. } => "map_invec",
            Request::UnmapInvec { .. } => "unmap_invec",
            Request::MapOutvec { .. } => "map_outvec",
            Request::UnmapOutvec { .. } => "unmap_outvec",
            Request::Notify { .. } => "notify",
            Request::Clear => "clear",
            Request::IrqEnable { .. } => "irq_enable",
            Request::IrqDisable { .. } => "irq_disable",
            Request::ResetSignal { .. } => "reset_signal",
            Request::Eoi { .. } => "eoi",
            Request::Panic => "panic",
        }
    }
}

// ============================================================================
// Outcomes and effects
// ============================================================================

/// What one step hands back to its caller.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Operation finished with a status.
    Complete(Status),
    /// Operation finished with a numeric value (versions, skip counts,
    /// previous interrupt enable state).
    Value(u64),
    /// Bytes produced for the caller (read, map_invec).
    Bytes(Vec<u8>),
    /// Writable buffer handed out by map_outvec.
    OutBuffer(Vec<u8>),
    /// Asserted subset collected by wait.
    Signals(SignalSet),
    /// A message descriptor claimed by get.
    Delivered(MessageInfo),
    /// The caller suspends until the ticket completes.
    Suspended(CompletionTicket),
    /// The caller suspends until a masked signal asserts.
    WouldBlock,
    /// The caller is terminated and never observes a value.
    Terminated,
}

/// Everything a resumed client learns from a service reply.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    /// Status chosen by the service (or by the manager on abandonment).
    pub status: Status,
    /// Connection handle delivered by a successful connect, null otherwise.
    pub handle: Handle,
    /// Final content of each output vector.
    pub outvecs: [Vec<u8>; MAX_IOVEC],
    /// When set, the resumed client must be terminated instead of
    /// observing the status.
    pub fatal: bool,
}

impl Completion {
    /// A completion carrying nothing but a status.
    pub fn status_only(status: Status) -> Self {
        Self {
            status,
            handle: Handle::NULL,
            outvecs: Default::default(),
            fatal: false,
        }
    }
}

/// Runtime directives emitted alongside an outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// A parked partition's wait mask matched; unpark it.
    Wake(PartitionId),
    /// A suspended client's request finished; deliver the completion.
    Complete(CompletionTicket, Completion),
}

/// Result of a step operation
pub struct StepResult {
    /// The outcome for the caller
    pub outcome: Outcome,
    /// Effects the runtime must apply
    pub effects: Vec<Effect>,
}

// ============================================================================
// The pure step function - THE verification target
// ============================================================================

/// Execute a protocol request on the manager state.
///
/// This is the pure state machine function. It:
/// - Takes the current state and one request
/// - Updates the state (via mutation)
/// - Returns the outcome and effects
///
/// # Properties (Verification Targets)
///
/// 1. **Deterministic**: Same state + request always produces same result
/// 2. **No side effects**: Only mutates the provided state
/// 3. **Single classification authority**: every fatal/recoverable decision
///    goes through the policy module, never around it
pub fn step(state: &mut SpmState, caller: ClientId, request: Request, timestamp: u64) -> StepResult {
    // Update metrics
    state.update_caller_metrics(caller, timestamp);

    match request {
        Request::FrameworkVersion => StepResult {
            outcome: Outcome::Value(FRAMEWORK_VERSION as u64),
            effects: vec![],
        },

        Request::ServiceVersion { sid } => step_service_version(state, caller, sid),
        Request::Connect { sid, version } => step_connect(state, caller, sid, version),
        Request::Call {
            handle,
            control,
            invecs,
            outvec_capacities,
        } => step_call(state, caller, handle, control, invecs, outvec_capacities),
        Request::Close { handle } => step_close(state, caller, handle),
        Request::Wait { mask, timeout } => step_wait(state, caller, mask, timeout),
        Request::Get { signal } => step_get(state, caller, signal),
        Request::Read {
            handle,
            invec_idx,
            max_bytes,
        } => step_read(state, caller, handle, invec_idx, max_bytes),
        Request::Skip {
            handle,
            invec_idx,
            num_bytes,
        } => step_skip(state, caller, handle, invec_idx, num_bytes),
        Request::Write {
            handle,
            outvec_idx,
            data,
        } => step_write(state, caller, handle, outvec_idx, data),
        Request::Reply { handle, status } => step_reply(state, caller, handle, status),
        Request::SetRhandle { handle, rhandle } => step_set_rhandle(state, caller, handle, rhandle),
        Request::MapInvec { handle, invec_idx } => step_map_invec(state, caller, handle, invec_idx),
        Request::UnmapInvec { handle, invec_idx } => {
            step_unmap_invec(state, caller, handle, invec_idx)
        }
        Request::MapOutvec { handle, outvec_idx } => {
            step_map_outvec(state, caller, handle, outvec_idx)
        }
        Request::UnmapOutvec {
            handle,
            outvec_idx,
            len,
            data,
        } => step_unmap_outvec(state, caller, handle, outvec_idx, len, data),
        Request::Notify { partition } => step_notify(state, caller, partition),
        Request::Clear => step_clear(state, caller),
        Request::IrqEnable { signal } => step_irq_enable(state, caller, signal),
        Request::IrqDisable { signal } => step_irq_disable(state, caller, signal),
        Request::ResetSignal { signal } => step_reset_signal(state, caller, signal),
        Request::Eoi { signal } => step_eoi(state, caller, signal),
        Request::Panic => step_panic(state, caller),
    }
}

/// Deliver a hardware interrupt to the partition owning `line`.
///
/// Not a caller request: the hosting runtime invokes this from its
/// interrupt plumbing. Returns whether the signal was actually asserted
/// (a disabled line swallows the delivery) plus any wake effects.
pub fn post_irq(
    state: &mut SpmState,
    partition: PartitionId,
    line: u32,
) -> Result<IrqDelivery, IrqPostError> {
    let slot = {
        let part = state
            .partitions
            .get_mut(&partition)
            .ok_or(IrqPostError::UnknownPartition)?;
        let alive = part.is_alive();
        let irq = part
            .irq_line_mut(line)
            .ok_or(IrqPostError::UnknownLine)?;
        if !alive || !irq.enabled {
            return Ok(IrqDelivery {
                delivered: false,
                effects: vec![],
            });
        }
        // Second-level lines mask themselves until the handler signals eoi.
        if irq.handling == IrqHandling::SecondLevel {
            irq.enabled = false;
        }
        irq.slot
    };
    let mut effects = Vec::new();
    if let Some(bit) = SignalSet::irq(slot) {
        assert_signal(state, partition, bit, &mut effects);
    }
    Ok(IrqDelivery {
        delivered: true,
        effects,
    })
}

/// Result of delivering one hardware interrupt.
#[derive(Clone, Debug, PartialEq)]
pub struct IrqDelivery {
    /// Whether the signal was asserted (false when the line is disabled
    /// or the partition is dead).
    pub delivered: bool,
    /// Wake effects for the runtime.
    pub effects: Vec<Effect>,
}

/// Interrupt delivery errors. These indicate runtime wiring bugs, not
/// partition misbehavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqPostError {
    /// No such partition.
    UnknownPartition,
    /// The partition does not own that line.
    UnknownLine,
}

// ============================================================================
// Classification and termination
// ============================================================================

/// Route a status through the error classification policy.
///
/// This is the only place a step can turn into a termination. Statuses a
/// service chooses in `reply` are payload, not operation results, and are
/// delivered through [`Completion`] instead, with the one exception of a
/// programmer-error reply to a call (handled in [`step_reply`]).
fn classified(state: &mut SpmState, caller: ClientId, status: Status) -> StepResult {
    match disposition(status, state.fault_mode_of(caller)) {
        Disposition::Deliver(s) => StepResult {
            outcome: Outcome::Complete(s),
            effects: vec![],
        },
        Disposition::Terminate => {
            let effects = terminate_partition(state, PartitionId(caller));
            StepResult {
                outcome: Outcome::Terminated,
                effects,
            }
        }
    }
}

/// Charge a violation detected outside the state machine to `caller`.
///
/// The hosting runtime validates client memory ranges against the
/// platform before any vector bytes are trusted; a rejected range is a
/// protocol violation exactly like a malformed request, and it takes the
/// same path through the classification policy.
pub fn charge_fault(state: &mut SpmState, caller: ClientId, status: Status) -> StepResult {
    classified(state, caller, status)
}

/// Mark a partition dead and abandon the work it can no longer do.
///
/// Undelivered and delivered-but-unreplied messages to its services are
/// destroyed; their suspended clients resume with `GENERIC_ERROR` rather
/// than inheriting the dead partition's fault. Connections the partition
/// held as a client stay in the tables until their next transition notices
/// the owner is gone.
fn terminate_partition(state: &mut SpmState, pid: PartitionId) -> Vec<Effect> {
    let mut effects = Vec::new();
    match state.partitions.get_mut(&pid) {
        Some(part) if part.is_alive() => {
            part.run_state = RunState::Dead;
            part.signals = SignalSet::empty();
            part.metrics.faults += 1;
        }
        _ => return effects,
    }

    let owned: Vec<ServiceId> = state
        .services
        .values()
        .filter(|s| s.partition == pid)
        .map(|s| s.sid)
        .collect();
    for sid in owned {
        let mut doomed: Vec<MessageId> = Vec::new();
        if let Some(svc) = state.services.get_mut(&sid) {
            while let Some(mid) = svc.dequeue() {
                doomed.push(mid);
            }
        }
        doomed.extend(
            state
                .messages
                .values()
                .filter(|m| m.service == sid && m.is_delivered())
                .map(|m| m.id),
        );
        for mid in doomed {
            abandon_message(state, mid, pid, &mut effects);
        }
    }
    effects
}

/// Destroy one message owed by a dead partition, resuming its client.
fn abandon_message(
    state: &mut SpmState,
    mid: MessageId,
    server: PartitionId,
    effects: &mut Vec<Effect>,
) {
    let msg = match state.messages.remove(&mid) {
        Some(m) => m,
        None => return,
    };
    if let Some(h) = msg.service_handle {
        let _ = state.handles.release(h, server.0);
    }
    if let Some(cid) = msg.connection {
        match msg.kind {
            // The connection never reached the client; erase it.
            MessageKind::Connect => {
                state.connections.remove(&cid);
            }
            // The client still holds the handle; park the connection in
            // idle so a later close can reclaim it.
            MessageKind::Call(_) => {
                if let Some(conn) = state.connections.get_mut(&cid) {
                    conn.state = ConnectionState::Idle;
                }
            }
            // The client already let go.
            MessageKind::Disconnect => {
                state.connections.remove(&cid);
            }
        }
    }
    if let Some(ticket) = msg.ticket {
        effects.push(Effect::Complete(
            ticket,
            Completion::status_only(Status::GENERIC_ERROR),
        ));
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Assert signal bits on a partition, waking it when a blocked wait is
/// satisfied.
fn assert_signal(
    state: &mut SpmState,
    pid: PartitionId,
    signal: SignalSet,
    effects: &mut Vec<Effect>,
) {
    let part = match state.partitions.get_mut(&pid) {
        Some(p) => p,
        None => return,
    };
    part.signals |= signal;
    if let RunState::Waiting(mask) = part.run_state {
        if part.signals.bits() & mask != 0 {
            part.run_state = RunState::Ready;
            effects.push(Effect::Wake(pid));
        }
    }
}

/// Clear signal bits on a partition.
fn clear_signal(state: &mut SpmState, pid: PartitionId, signal: SignalSet) {
    if let Some(part) = state.partitions.get_mut(&pid) {
        part.signals.remove(signal);
    }
}

/// Insert a message, queue it to its service, and raise the service's
/// signal on the owning partition.
fn enqueue_message(state: &mut SpmState, msg: SpmMessage, effects: &mut Vec<Effect>) {
    let mid = msg.id;
    let sid = msg.service;
    state.messages.insert(mid, msg);
    let (owner, signal) = match state.services.get_mut(&sid) {
        Some(svc) => {
            svc.enqueue(mid);
            (svc.partition, svc.signal())
        }
        None => return,
    };
    assert_signal(state, owner, signal, effects);
}

/// The caller's partition id, provided the caller is a live partition.
fn caller_partition(state: &SpmState, caller: ClientId) -> Option<PartitionId> {
    if caller <= 0 {
        return None;
    }
    let pid = PartitionId(caller);
    match state.partitions.get(&pid) {
        Some(p) if p.is_alive() => Some(pid),
        _ => None,
    }
}

/// Count a client-side request against the caller's metrics.
fn note_client_request(state: &mut SpmState, caller: ClientId) {
    if caller > 0 {
        if let Some(p) = state.partitions.get_mut(&PartitionId(caller)) {
            p.metrics.calls_issued += 1;
        }
    }
}

/// Whether a service's owning partition can still process messages.
fn service_partition_alive(state: &SpmState, sid: ServiceId) -> bool {
    state
        .services
        .get(&sid)
        .and_then(|s| state.partitions.get(&s.partition))
        .map(|p| p.is_alive())
        .unwrap_or(false)
}

/// Resolve a message handle for the calling partition.
fn resolve_message(state: &SpmState, caller: ClientId, handle: Handle) -> Option<MessageId> {
    caller_partition(state, caller)?;
    match state.handles.resolve(handle, caller) {
        Ok(entry) => match entry.target {
            HandleTarget::Message(mid) => Some(mid),
            HandleTarget::Connection(_) => None,
        },
        Err(_) => None,
    }
}

/// Whether zero-copy mapping is available for the message's service.
fn mapping_allowed(state: &SpmState, mid: MessageId) -> bool {
    if !cfg!(feature = "mm-iovec") {
        return false;
    }
    state
        .messages
        .get(&mid)
        .and_then(|m| state.services.get(&m.service))
        .map(|s| s.mm_iovec)
        .unwrap_or(false)
}

// ============================================================================
// Client operation handlers
// ============================================================================

fn step_service_version(state: &mut SpmState, caller: ClientId, sid: ServiceId) -> StepResult {
    let version = match state.services.get(&sid) {
        Some(svc) if !(is_nonsecure(caller) && !svc.ns_accessible) => svc.version,
        // Absent and unauthorized are indistinguishable on purpose.
        _ => VERSION_NONE,
    };
    StepResult {
        outcome: Outcome::Value(version as u64),
        effects: vec![],
    }
}

fn step_connect(state: &mut SpmState, caller: ClientId, sid: ServiceId, version: u32) -> StepResult {
    note_client_request(state, caller);
    if !cfg!(feature = "connection-api") {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    match state.services.get(&sid) {
        Some(svc) => {
            if !svc.connection_based
                || (is_nonsecure(caller) && !svc.ns_accessible)
                || !svc.policy.accepts(svc.version, version)
            {
                return classified(state, caller, Status::PROGRAMMER_ERROR);
            }
        }
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    }
    if !service_partition_alive(state, sid) {
        return StepResult {
            outcome: Outcome::Complete(Status::GENERIC_ERROR),
            effects: vec![],
        };
    }

    let cid = state.alloc_connection_id();
    let mid = state.alloc_message_id();
    let ticket = state.alloc_ticket();
    state.connections.insert(
        cid,
        Connection {
            id: cid,
            service: sid,
            client: caller,
            version,
            rhandle: 0,
            state: ConnectionState::Pending,
            client_handle: None,
        },
    );
    let msg = SpmMessage {
        id: mid,
        kind: MessageKind::Connect,
        client: caller,
        service: sid,
        connection: Some(cid),
        rhandle: 0,
        invecs: Default::default(),
        outvecs: Default::default(),
        access: VecAccess::new(),
        ticket: Some(ticket),
        service_handle: None,
    };
    let mut effects = Vec::new();
    enqueue_message(state, msg, &mut effects);
    StepResult {
        outcome: Outcome::Suspended(ticket),
        effects,
    }
}

fn step_call(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    control: CallControl,
    invecs: Vec<Vec<u8>>,
    outvec_capacities: Vec<usize>,
) -> StepResult {
    note_client_request(state, caller);
    if !control.is_valid()
        || invecs.len() != control.invec_count as usize
        || outvec_capacities.len() != control.outvec_count as usize
    {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }

    let (sid, connection, rhandle) = if handle.is_stateless() {
        let sid = match state
            .stateless
            .get(handle.index() as usize)
            .copied()
            .flatten()
        {
            Some(sid) => sid,
            None => return classified(state, caller, Status::PROGRAMMER_ERROR),
        };
        match state.services.get(&sid) {
            Some(svc) => {
                if (is_nonsecure(caller) && !svc.ns_accessible)
                    || !svc
                        .policy
                        .accepts(svc.version, handle.stateless_version() as u32)
                {
                    return classified(state, caller, Status::PROGRAMMER_ERROR);
                }
            }
            None => return classified(state, caller, Status::PROGRAMMER_ERROR),
        }
        (sid, None, 0)
    } else {
        let cid = match state.handles.resolve(handle, caller) {
            Ok(entry) => match entry.target {
                HandleTarget::Connection(cid) => cid,
                HandleTarget::Message(_) => {
                    return classified(state, caller, Status::PROGRAMMER_ERROR)
                }
            },
            Err(_) => return classified(state, caller, Status::PROGRAMMER_ERROR),
        };
        let conn = match state.connections.get(&cid) {
            Some(c) => c,
            None => return classified(state, caller, Status::PROGRAMMER_ERROR),
        };
        match conn.state {
            ConnectionState::Idle => {}
            // Per-connection serialization: one in-flight call at a time.
            ConnectionState::Active => {
                return classified(state, caller, Status::CONNECTION_BUSY)
            }
            _ => return classified(state, caller, Status::PROGRAMMER_ERROR),
        }
        (conn.service, Some(cid), conn.rhandle)
    };

    if !service_partition_alive(state, sid) {
        return StepResult {
            outcome: Outcome::Complete(Status::GENERIC_ERROR),
            effects: vec![],
        };
    }

    if let Some(cid) = connection {
        if let Some(conn) = state.connections.get_mut(&cid) {
            conn.state = ConnectionState::Active;
        }
    }

    let mid = state.alloc_message_id();
    let ticket = state.alloc_ticket();
    let mut ivs: [InVec; MAX_IOVEC] = Default::default();
    for (i, data) in invecs.into_iter().enumerate() {
        ivs[i] = InVec::new(data);
    }
    let mut ovs: [OutVec; MAX_IOVEC] = Default::default();
    for (i, capacity) in outvec_capacities.into_iter().enumerate() {
        ovs[i] = OutVec::new(capacity);
    }
    let msg = SpmMessage {
        id: mid,
        kind: MessageKind::Call(control.request),
        client: caller,
        service: sid,
        connection,
        rhandle,
        invecs: ivs,
        outvecs: ovs,
        access: VecAccess::new(),
        ticket: Some(ticket),
        service_handle: None,
    };
    let mut effects = Vec::new();
    enqueue_message(state, msg, &mut effects);
    StepResult {
        outcome: Outcome::Suspended(ticket),
        effects,
    }
}

fn step_close(state: &mut SpmState, caller: ClientId, handle: Handle) -> StepResult {
    note_client_request(state, caller);
    if !cfg!(feature = "connection-api") {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    // Closing the null handle is a permitted no-op.
    if handle.is_null() {
        return StepResult {
            outcome: Outcome::Complete(Status::SUCCESS),
            effects: vec![],
        };
    }
    if handle.is_stateless() {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let cid = match state.handles.resolve(handle, caller) {
        Ok(entry) => match entry.target {
            HandleTarget::Connection(cid) => cid,
            HandleTarget::Message(_) => return classified(state, caller, Status::PROGRAMMER_ERROR),
        },
        Err(_) => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    match state.connections.get(&cid).map(|c| c.state) {
        Some(ConnectionState::Idle) => {}
        // Close must not interrupt an in-flight call; the connection is
        // left exactly as it was.
        _ => return classified(state, caller, Status::PROGRAMMER_ERROR),
    }

    let _ = state.handles.release(handle, caller);
    let (sid, rhandle) = match state.connections.get_mut(&cid) {
        Some(conn) => {
            conn.client_handle = None;
            (conn.service, conn.rhandle)
        }
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };

    if !service_partition_alive(state, sid) {
        // Nobody is left to observe the disconnect.
        state.connections.remove(&cid);
        return StepResult {
            outcome: Outcome::Complete(Status::SUCCESS),
            effects: vec![],
        };
    }
    if let Some(conn) = state.connections.get_mut(&cid) {
        conn.state = ConnectionState::Closing;
    }

    let mid = state.alloc_message_id();
    let msg = SpmMessage {
        id: mid,
        kind: MessageKind::Disconnect,
        client: caller,
        service: sid,
        connection: Some(cid),
        rhandle,
        invecs: Default::default(),
        outvecs: Default::default(),
        access: VecAccess::new(),
        // Fire-and-forget: the closer never waits for the service.
        ticket: None,
        service_handle: None,
    };
    let mut effects = Vec::new();
    enqueue_message(state, msg, &mut effects);
    StepResult {
        outcome: Outcome::Complete(Status::SUCCESS),
        effects,
    }
}

// ============================================================================
// Partition operation handlers
// ============================================================================

fn step_wait(state: &mut SpmState, caller: ClientId, mask: SignalSet, timeout: Timeout) -> StepResult {
    let pid = match caller_partition(state, caller) {
        Some(p) => p,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let valid = match state.partitions.get(&pid) {
        Some(p) => p.valid_signals,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    // A mask that no assigned signal can ever satisfy is a protocol error.
    if (mask & valid).is_empty() {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let part = match state.partitions.get_mut(&pid) {
        Some(p) => p,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let asserted = part.signals & mask;
    if !asserted.is_empty() {
        return StepResult {
            outcome: Outcome::Signals(asserted),
            effects: vec![],
        };
    }
    match timeout {
        Timeout::Poll => StepResult {
            outcome: Outcome::Signals(SignalSet::empty()),
            effects: vec![],
        },
        Timeout::Block => {
            part.run_state = RunState::Waiting(mask.bits());
            StepResult {
                outcome: Outcome::WouldBlock,
                effects: vec![],
            }
        }
    }
}

fn step_get(state: &mut SpmState, caller: ClientId, signal: SignalSet) -> StepResult {
    let pid = match caller_partition(state, caller) {
        Some(p) => p,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let slot = match signal.service_slot() {
        Some(s) => s,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let sid = match state.service_by_signal(pid, slot) {
        Some(s) => s,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let asserted = state
        .partitions
        .get(&pid)
        .map(|p| p.signals.contains(signal))
        .unwrap_or(false);
    if !asserted {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }

    let mid = match state.services.get_mut(&sid).and_then(|s| s.dequeue()) {
        Some(m) => m,
        None => {
            // The signal outlived the queue. Benign: drop the stale bit
            // and let the caller retry.
            clear_signal(state, pid, signal);
            return StepResult {
                outcome: Outcome::Complete(Status::DOES_NOT_EXIST),
                effects: vec![],
            };
        }
    };
    let msg_handle = match state.handles.allocate(caller, HandleTarget::Message(mid)) {
        Ok(h) => h,
        Err(_) => {
            // Registry exhausted. Put the message back where it was.
            if let Some(svc) = state.services.get_mut(&sid) {
                svc.requeue(mid);
            }
            return StepResult {
                outcome: Outcome::Complete(Status::INSUFFICIENT_MEMORY),
                effects: vec![],
            };
        }
    };
    let drained = state
        .services
        .get(&sid)
        .map(|s| s.pending.is_empty())
        .unwrap_or(true);
    if drained {
        clear_signal(state, pid, signal);
    }

    let info = match state.messages.get_mut(&mid) {
        Some(msg) => {
            msg.service_handle = Some(msg_handle);
            MessageInfo {
                handle: msg_handle,
                kind: msg.kind,
                client_id: msg.client,
                rhandle: msg.rhandle,
                in_size: msg.in_sizes(),
                out_size: msg.out_sizes(),
            }
        }
        None => {
            let _ = state.handles.release(msg_handle, caller);
            return StepResult {
                outcome: Outcome::Complete(Status::DOES_NOT_EXIST),
                effects: vec![],
            };
        }
    };
    if let Some(part) = state.partitions.get_mut(&pid) {
        part.metrics.messages_handled += 1;
    }
    StepResult {
        outcome: Outcome::Delivered(info),
        effects: vec![],
    }
}

fn step_read(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    invec_idx: usize,
    max_bytes: usize,
) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let read = state
        .messages
        .get_mut(&mid)
        .map(|msg| msg.read_invec(invec_idx, max_bytes));
    match read {
        Some(Ok(bytes)) => StepResult {
            outcome: Outcome::Bytes(bytes),
            effects: vec![],
        },
        _ => classified(state, caller, Status::PROGRAMMER_ERROR),
    }
}

fn step_skip(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    invec_idx: usize,
    num_bytes: usize,
) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let skipped = state
        .messages
        .get_mut(&mid)
        .map(|msg| msg.skip_invec(invec_idx, num_bytes));
    match skipped {
        Some(Ok(n)) => StepResult {
            outcome: Outcome::Value(n as u64),
            effects: vec![],
        },
        _ => classified(state, caller, Status::PROGRAMMER_ERROR),
    }
}

fn step_write(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    outvec_idx: usize,
    data: Vec<u8>,
) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let written = state
        .messages
        .get_mut(&mid)
        .map(|msg| msg.write_outvec(outvec_idx, &data));
    match written {
        Some(Ok(())) => StepResult {
            outcome: Outcome::Complete(Status::SUCCESS),
            effects: vec![],
        },
        _ => classified(state, caller, Status::PROGRAMMER_ERROR),
    }
}

fn step_map_invec(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    invec_idx: usize,
) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    if !mapping_allowed(state, mid) {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let mapped = state
        .messages
        .get_mut(&mid)
        .map(|msg| msg.map_invec(invec_idx));
    match mapped {
        Some(Ok(bytes)) => StepResult {
            outcome: Outcome::Bytes(bytes),
            effects: vec![],
        },
        _ => classified(state, caller, Status::PROGRAMMER_ERROR),
    }
}

fn step_unmap_invec(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    invec_idx: usize,
) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    if !mapping_allowed(state, mid) {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let unmapped = state
        .messages
        .get_mut(&mid)
        .map(|msg| msg.unmap_invec(invec_idx));
    match unmapped {
        Some(Ok(())) => StepResult {
            outcome: Outcome::Complete(Status::SUCCESS),
            effects: vec![],
        },
        _ => classified(state, caller, Status::PROGRAMMER_ERROR),
    }
}

fn step_map_outvec(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    outvec_idx: usize,
) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    if !mapping_allowed(state, mid) {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let mapped = state
        .messages
        .get_mut(&mid)
        .map(|msg| msg.map_outvec(outvec_idx));
    match mapped {
        Some(Ok(buf)) => StepResult {
            outcome: Outcome::OutBuffer(buf),
            effects: vec![],
        },
        _ => classified(state, caller, Status::PROGRAMMER_ERROR),
    }
}

fn step_unmap_outvec(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    outvec_idx: usize,
    len: usize,
    data: Vec<u8>,
) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    if !mapping_allowed(state, mid) {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let unmapped = state
        .messages
        .get_mut(&mid)
        .map(|msg| msg.unmap_outvec(outvec_idx, len, data));
    match unmapped {
        Some(Ok(())) => StepResult {
            outcome: Outcome::Complete(Status::SUCCESS),
            effects: vec![],
        },
        _ => classified(state, caller, Status::PROGRAMMER_ERROR),
    }
}

fn step_reply(state: &mut SpmState, caller: ClientId, handle: Handle, status: Status) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    // Validate the status against the message kind before committing
    // anything, so a rejected reply leaves the message answerable.
    let kind = match state.messages.get(&mid) {
        Some(m) => m.kind,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    match kind {
        MessageKind::Connect => {
            if status != Status::SUCCESS && !status.is_negotiation() {
                return classified(state, caller, Status::PROGRAMMER_ERROR);
            }
        }
        MessageKind::Call(_) => {
            // Negotiation vocabulary is reserved for connect replies.
            if status.is_negotiation() {
                return classified(state, caller, Status::PROGRAMMER_ERROR);
            }
        }
        MessageKind::Disconnect => {}
    }

    // Commit. The handle dies first: a second reply resolves nothing.
    let _ = state.handles.release(handle, caller);
    let mut msg = match state.messages.remove(&mid) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    if let Some(part) = state.partitions.get_mut(&PartitionId(caller)) {
        part.metrics.replies_sent += 1;
    }

    let mut effects = Vec::new();
    match msg.kind {
        MessageKind::Connect => {
            let completion = finish_connect(state, &msg, status);
            if let Some(ticket) = msg.ticket {
                effects.push(Effect::Complete(ticket, completion));
            }
        }
        MessageKind::Call(_) => {
            // A programmer-error reply is charged to the client, not
            // returned like an ordinary service status.
            let fatal = status == Status::PROGRAMMER_ERROR
                && matches!(
                    disposition(status, state.fault_mode_of(msg.client)),
                    Disposition::Terminate
                );
            if fatal {
                effects.extend(terminate_partition(state, PartitionId(msg.client)));
            }
            if let Some(cid) = msg.connection {
                if state.client_is_alive(msg.client) {
                    if let Some(conn) = state.connections.get_mut(&cid) {
                        conn.state = ConnectionState::Idle;
                    }
                } else if let Some(conn) = state.connections.remove(&cid) {
                    if let Some(ch) = conn.client_handle {
                        let _ = state.handles.release(ch, conn.client);
                    }
                }
            }
            let outvecs = core::array::from_fn(|i| msg.outvecs[i].take());
            if let Some(ticket) = msg.ticket {
                effects.push(Effect::Complete(
                    ticket,
                    Completion {
                        status,
                        handle: Handle::NULL,
                        outvecs,
                        fatal,
                    },
                ));
            }
        }
        MessageKind::Disconnect => {
            // The closer moved on long ago; the status is discarded.
            if let Some(cid) = msg.connection {
                state.connections.remove(&cid);
            }
        }
    }
    StepResult {
        outcome: Outcome::Complete(Status::SUCCESS),
        effects,
    }
}

/// Drive the pending connection to idle or oblivion, building the
/// client's completion.
fn finish_connect(state: &mut SpmState, msg: &SpmMessage, status: Status) -> Completion {
    let cid = match msg.connection {
        Some(c) => c,
        None => return Completion::status_only(Status::GENERIC_ERROR),
    };
    if status != Status::SUCCESS {
        // Refused or busy: as far as the client can tell, the connection
        // never existed.
        state.connections.remove(&cid);
        return Completion::status_only(status);
    }
    if !state.client_is_alive(msg.client) {
        state.connections.remove(&cid);
        return Completion::status_only(Status::GENERIC_ERROR);
    }
    match state
        .handles
        .allocate(msg.client, HandleTarget::Connection(cid))
    {
        Ok(client_handle) => {
            if let Some(conn) = state.connections.get_mut(&cid) {
                conn.state = ConnectionState::Idle;
                conn.client_handle = Some(client_handle);
            }
            Completion {
                status: Status::SUCCESS,
                handle: client_handle,
                outvecs: Default::default(),
                fatal: false,
            }
        }
        Err(_) => {
            // No handle, no connection.
            state.connections.remove(&cid);
            Completion::status_only(Status::INSUFFICIENT_MEMORY)
        }
    }
}

fn step_set_rhandle(
    state: &mut SpmState,
    caller: ClientId,
    handle: Handle,
    rhandle: u64,
) -> StepResult {
    let mid = match resolve_message(state, caller, handle) {
        Some(m) => m,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let cid = match state.messages.get(&mid).and_then(|m| m.connection) {
        Some(c) => c,
        // Stateless messages have no connection to remember anything on.
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    match state.connections.get_mut(&cid) {
        Some(conn) => {
            // Takes effect from the next message; the current descriptor
            // keeps its snapshot.
            conn.rhandle = rhandle;
            StepResult {
                outcome: Outcome::Complete(Status::SUCCESS),
                effects: vec![],
            }
        }
        None => classified(state, caller, Status::PROGRAMMER_ERROR),
    }
}

fn step_notify(state: &mut SpmState, caller: ClientId, target: PartitionId) -> StepResult {
    if caller_partition(state, caller).is_none() {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    if !cfg!(feature = "doorbell") {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    if !state.partitions.contains_key(&target) {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let mut effects = Vec::new();
    assert_signal(state, target, SignalSet::DOORBELL, &mut effects);
    StepResult {
        outcome: Outcome::Complete(Status::SUCCESS),
        effects,
    }
}

fn step_clear(state: &mut SpmState, caller: ClientId) -> StepResult {
    let pid = match caller_partition(state, caller) {
        Some(p) => p,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    if !cfg!(feature = "doorbell") {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let rung = state
        .partitions
        .get(&pid)
        .map(|p| p.signals.contains(SignalSet::DOORBELL))
        .unwrap_or(false);
    // Clearing a doorbell that was never rung is a protocol error.
    if !rung {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    clear_signal(state, pid, SignalSet::DOORBELL);
    StepResult {
        outcome: Outcome::Complete(Status::SUCCESS),
        effects: vec![],
    }
}

/// Resolve a single interrupt signal bit to the caller's bound line slot.
fn caller_irq_slot(state: &SpmState, caller: ClientId, signal: SignalSet) -> Option<(PartitionId, u32)> {
    let pid = caller_partition(state, caller)?;
    let slot = signal.irq_line()?;
    state
        .partitions
        .get(&pid)
        .and_then(|p| p.irq_by_slot(slot))
        .map(|irq| (pid, irq.slot))
}

fn step_irq_enable(state: &mut SpmState, caller: ClientId, signal: SignalSet) -> StepResult {
    let (pid, slot) = match caller_irq_slot(state, caller, signal) {
        Some(v) => v,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    if let Some(irq) = state
        .partitions
        .get_mut(&pid)
        .and_then(|p| p.irq_by_slot_mut(slot))
    {
        irq.enabled = true;
    }
    StepResult {
        outcome: Outcome::Complete(Status::SUCCESS),
        effects: vec![],
    }
}

fn step_irq_disable(state: &mut SpmState, caller: ClientId, signal: SignalSet) -> StepResult {
    let (pid, slot) = match caller_irq_slot(state, caller, signal) {
        Some(v) => v,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let previous = match state
        .partitions
        .get_mut(&pid)
        .and_then(|p| p.irq_by_slot_mut(slot))
    {
        Some(irq) => {
            let prev = irq.enabled;
            irq.enabled = false;
            prev
        }
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    StepResult {
        outcome: Outcome::Value(previous as u64),
        effects: vec![],
    }
}

fn step_reset_signal(state: &mut SpmState, caller: ClientId, signal: SignalSet) -> StepResult {
    if !cfg!(feature = "irq-flih") {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let (pid, slot) = match caller_irq_slot(state, caller, signal) {
        Some(v) => v,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let first_level = state
        .partitions
        .get(&pid)
        .and_then(|p| p.irq_by_slot(slot))
        .map(|irq| irq.handling == IrqHandling::FirstLevel)
        .unwrap_or(false);
    let asserted = state
        .partitions
        .get(&pid)
        .map(|p| p.signals.contains(signal))
        .unwrap_or(false);
    if !first_level || !asserted {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    clear_signal(state, pid, signal);
    StepResult {
        outcome: Outcome::Complete(Status::SUCCESS),
        effects: vec![],
    }
}

fn step_eoi(state: &mut SpmState, caller: ClientId, signal: SignalSet) -> StepResult {
    if !cfg!(feature = "irq-slih") {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    let (pid, slot) = match caller_irq_slot(state, caller, signal) {
        Some(v) => v,
        None => return classified(state, caller, Status::PROGRAMMER_ERROR),
    };
    let second_level = state
        .partitions
        .get(&pid)
        .and_then(|p| p.irq_by_slot(slot))
        .map(|irq| irq.handling == IrqHandling::SecondLevel)
        .unwrap_or(false);
    let asserted = state
        .partitions
        .get(&pid)
        .map(|p| p.signals.contains(signal))
        .unwrap_or(false);
    if !second_level || !asserted {
        return classified(state, caller, Status::PROGRAMMER_ERROR);
    }
    clear_signal(state, pid, signal);
    // Completion re-arms the line that masked itself at delivery.
    if let Some(irq) = state
        .partitions
        .get_mut(&pid)
        .and_then(|p| p.irq_by_slot_mut(slot))
    {
        irq.enabled = true;
    }
    StepResult {
        outcome: Outcome::Complete(Status::SUCCESS),
        effects: vec![],
    }
}

fn step_panic(state: &mut SpmState, caller: ClientId) -> StepResult {
    let effects = if caller > 0 {
        terminate_partition(state, PartitionId(caller))
    } else {
        vec![]
    };
    StepResult {
        outcome: Outcome::Terminated,
        effects,
    }
}
