//! Hosting runtime
//!
//! Wraps the pure state machine in real blocking. Partition code runs on
//! threads; `call` parks its client on a per-message completion channel
//! fulfilled by the service's `reply`; a blocking `wait` parks the
//! service thread on its partition's condvar. One mutex guards the whole
//! state, and every operation is a single `step` under that lock with
//! its effects applied before the lock drops, so waiters can never miss
//! the transition they are parked on.
//!
//! Termination never returns to the caller: the port raises a
//! [`PartitionFault`] panic that unwinds the partition thread to the
//! runner installed by [`Spm::spawn_partition`]. The panic is only ever
//! raised after the state lock is released.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use warden_hal::{Access, Platform};
use warden_ipc::{
    CallControl, Handle, MessageInfo, SignalSet, Status, Timeout, FRAMEWORK_VERSION,
    LIFECYCLE_SECURED, MAX_IOVEC, VERSION_NONE,
};
use warden_spm_core::{
    charge_fault, step, ClientId, Completion, CompletionTicket, ConfigError, Effect, IrqPostError,
    Outcome, PartitionId, Request, ServiceId, SpmState, StepResult,
};

use crate::audit::{AuditEvent, AuditLog};
use crate::manifest::Manifest;

// ============================================================================
// Termination plumbing
// ============================================================================

/// Panic payload distinguishing a manager termination from an ordinary
/// panic. The partition runner catches exactly this type; anything else
/// keeps unwinding.
#[derive(Clone, Copy, Debug)]
pub struct PartitionFault {
    /// Client id the fault was charged to.
    pub client: ClientId,
}

/// How a hosted partition body finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionExit {
    /// The body ran to completion.
    Completed,
    /// The manager fatally terminated the partition mid-body.
    Terminated,
}

/// Join handle for a hosted partition thread.
pub struct PartitionThread {
    partition: PartitionId,
    handle: thread::JoinHandle<PartitionExit>,
}

impl PartitionThread {
    /// The partition this thread hosts.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Wait for the partition body to finish.
    ///
    /// Manager terminations come back as [`PartitionExit::Terminated`];
    /// any other panic in the body keeps propagating, so test assertion
    /// failures inside partition code stay visible.
    pub fn join(self) -> PartitionExit {
        match self.handle.join() {
            Ok(exit) => exit,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

// ============================================================================
// Locked runtime state
// ============================================================================

/// Everything guarded by the single state lock.
struct RuntimeCore {
    state: SpmState,
    /// Senders for suspended clients, keyed by their completion ticket.
    waiters: BTreeMap<CompletionTicket, mpsc::Sender<Completion>>,
    audit: AuditLog,
}

struct SpmInner<P: Platform> {
    platform: P,
    core: Mutex<RuntimeCore>,
    /// One condvar per partition; `Effect::Wake` notifies exactly one.
    wakeups: BTreeMap<PartitionId, Condvar>,
}

/// What a suspending submission produced.
enum BlockingReply {
    /// The request finished (or was rejected) without suspending.
    Immediate(Outcome),
    /// The request suspended and this completion resumed it.
    Resumed(Completion),
}

impl<P: Platform> SpmInner<P> {
    /// Acquire the state lock.
    ///
    /// Termination panics are raised strictly after the lock is
    /// released, so a poisoned lock still guards consistent state.
    fn lock_core(&self) -> MutexGuard<'_, RuntimeCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One non-suspending request: log, step, apply effects, log result.
    fn submit(&self, caller: ClientId, request: Request) -> Outcome {
        let now = self.platform.now_nanos();
        let op = request.name();
        let arg = audit_arg(&request);
        let mut core = self.lock_core();
        let request_id = if should_log(&request) {
            Some(core.audit.log_request(caller, op, arg, now))
        } else {
            None
        };
        let StepResult { outcome, effects } = step(&mut core.state, caller, request, now);
        self.apply_effects(&mut core, effects);
        if matches!(outcome, Outcome::Terminated) {
            // Faults are recorded even for unaudited operations.
            core.audit.log_fault(caller, now);
        } else if let Some(request_id) = request_id {
            core.audit
                .log_response(caller, request_id, response_code(&outcome), now);
        }
        outcome
    }

    /// One request that may suspend the caller until a service replies.
    fn submit_blocking(&self, caller: ClientId, request: Request) -> BlockingReply {
        let now = self.platform.now_nanos();
        let op = request.name();
        let arg = audit_arg(&request);
        let (tx, rx) = mpsc::channel();

        let mut core = self.lock_core();
        let request_id = core.audit.log_request(caller, op, arg, now);
        let StepResult { outcome, effects } = step(&mut core.state, caller, request, now);
        self.apply_effects(&mut core, effects);
        match outcome {
            Outcome::Suspended(ticket) => {
                // Registered under the same lock that produced the
                // ticket; the completing reply cannot race past us.
                core.waiters.insert(ticket, tx);
            }
            Outcome::Terminated => {
                core.audit.log_fault(caller, now);
                drop(core);
                self.fault_exit(caller);
            }
            other => {
                core.audit
                    .log_response(caller, request_id, response_code(&other), now);
                return BlockingReply::Immediate(other);
            }
        }
        drop(core);

        // Park until the service replies or the manager abandons the
        // message. The sender only drops unfulfilled if the manager
        // itself is torn down mid-call.
        let completion = rx
            .recv()
            .unwrap_or_else(|_| Completion::status_only(Status::GENERIC_ERROR));

        let now = self.platform.now_nanos();
        let mut core = self.lock_core();
        if completion.fatal {
            core.audit.log_fault(caller, now);
            drop(core);
            self.fault_exit(caller);
        }
        core.audit
            .log_response(caller, request_id, completion.status.0 as i64, now);
        drop(core);
        BlockingReply::Resumed(completion)
    }

    /// Charge a violation detected by the platform layer (a rejected
    /// memory range) through the same classification policy in-state
    /// requests use.
    fn submit_fault(&self, caller: ClientId, status: Status) -> Outcome {
        let now = self.platform.now_nanos();
        let mut core = self.lock_core();
        let StepResult { outcome, effects } = charge_fault(&mut core.state, caller, status);
        self.apply_effects(&mut core, effects);
        if matches!(outcome, Outcome::Terminated) {
            core.audit.log_fault(caller, now);
        }
        outcome
    }

    /// Apply step effects while still holding the state lock.
    fn apply_effects(&self, core: &mut RuntimeCore, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Wake(pid) => {
                    if let Some(cv) = self.wakeups.get(&pid) {
                        cv.notify_all();
                    }
                }
                Effect::Complete(ticket, completion) => {
                    if let Some(tx) = core.waiters.remove(&ticket) {
                        // A dead client's receiver is already gone.
                        let _ = tx.send(completion);
                    }
                }
            }
        }
    }

    /// Single termination exit. Every fatal classification funnels here;
    /// never returns.
    fn fault_exit(&self, client: ClientId) -> ! {
        self.platform
            .debug_write(&format!("[spm] client {} fatally terminated", client));
        panic::panic_any(PartitionFault { client });
    }
}

/// High-frequency data-plane operations stay out of the audit log.
fn should_log(request: &Request) -> bool {
    !matches!(
        request,
        Request::FrameworkVersion
            | Request::ServiceVersion { .. }
            | Request::Wait { .. }
            | Request::Read { .. }
            | Request::Skip { .. }
            | Request::Write { .. }
    )
}

/// Salient request argument recorded in the audit trail.
fn audit_arg(request: &Request) -> u64 {
    match request {
        Request::FrameworkVersion | Request::Clear | Request::Panic => 0,
        Request::ServiceVersion { sid } | Request::Connect { sid, .. } => sid.0 as u64,
        Request::Call { handle, .. }
        | Request::Close { handle }
        | Request::Read { handle, .. }
        | Request::Skip { handle, .. }
        | Request::Write { handle, .. }
        | Request::Reply { handle, .. }
        | Request::SetRhandle { handle, .. }
        | Request::MapInvec { handle, .. }
        | Request::UnmapInvec { handle, .. }
        | Request::MapOutvec { handle, .. }
        | Request::UnmapOutvec { handle, .. } => handle.0 as u32 as u64,
        Request::Wait { mask, .. } => mask.bits() as u64,
        Request::Get { signal }
        | Request::IrqEnable { signal }
        | Request::IrqDisable { signal }
        | Request::ResetSignal { signal }
        | Request::Eoi { signal } => signal.bits() as u64,
        Request::Notify { partition } => partition.0 as u32 as u64,
    }
}

/// Result code recorded for a finished outcome.
fn response_code(outcome: &Outcome) -> i64 {
    match outcome {
        Outcome::Complete(status) => status.0 as i64,
        Outcome::Value(v) => *v as i64,
        Outcome::Bytes(data) => data.len() as i64,
        Outcome::OutBuffer(buf) => buf.len() as i64,
        Outcome::Signals(signals) => signals.bits() as i64,
        Outcome::Delivered(info) => info.handle.0 as i64,
        // Suspended requests log their response at resumption;
        // would-block waits are not audited at all.
        Outcome::Suspended(_) | Outcome::WouldBlock => 0,
        Outcome::Terminated => Status::PROGRAMMER_ERROR.0 as i64,
    }
}

/// Collapse a non-payload outcome into its status.
fn status_of(outcome: Outcome) -> Status {
    match outcome {
        Outcome::Complete(status) => status,
        _ => Status::GENERIC_ERROR,
    }
}

// ============================================================================
// The manager
// ============================================================================

/// The hosted partition manager.
///
/// Owns the state machine, the platform, and the audit log. Partition
/// code talks to it through [`ClientPort`] and [`ServicePort`] values,
/// which stay valid for the manager's whole lifetime.
pub struct Spm<P: Platform> {
    inner: Arc<SpmInner<P>>,
}

impl<P: Platform> Spm<P> {
    /// Build a manager from a deployment manifest.
    pub fn new(manifest: &Manifest, platform: P) -> Result<Self, ConfigError> {
        let state = manifest.build()?;
        let wakeups = state
            .partitions
            .keys()
            .map(|pid| (*pid, Condvar::new()))
            .collect();
        Ok(Self {
            inner: Arc::new(SpmInner {
                platform,
                core: Mutex::new(RuntimeCore {
                    state,
                    waiters: BTreeMap::new(),
                    audit: AuditLog::new(),
                }),
                wakeups,
            }),
        })
    }

    /// Client-side port for `client`. Non-secure callers use negative
    /// ids; secure partitions normally reach their client surface
    /// through [`ServicePort::client`] instead.
    pub fn client_port(&self, client: ClientId) -> ClientPort<P> {
        ClientPort {
            spm: Arc::clone(&self.inner),
            client,
        }
    }

    /// Service-side port for a registered partition.
    pub fn service_port(&self, partition: PartitionId) -> Option<ServicePort<P>> {
        let core = self.inner.lock_core();
        if !core.state.partitions.contains_key(&partition) {
            return None;
        }
        drop(core);
        Some(ServicePort {
            spm: Arc::clone(&self.inner),
            partition,
        })
    }

    /// Run a partition body on its own thread.
    ///
    /// The runner catches the manager's termination unwind and reports
    /// it through [`PartitionThread::join`]; every other panic keeps
    /// propagating.
    pub fn spawn_partition<F>(&self, partition: PartitionId, body: F) -> Option<PartitionThread>
    where
        F: FnOnce(ServicePort<P>) + Send + 'static,
    {
        let port = self.service_port(partition)?;
        let handle = thread::spawn(move || {
            match panic::catch_unwind(AssertUnwindSafe(|| body(port))) {
                Ok(()) => PartitionExit::Completed,
                Err(payload) if payload.downcast_ref::<PartitionFault>().is_some() => {
                    PartitionExit::Terminated
                }
                Err(payload) => panic::resume_unwind(payload),
            }
        });
        Some(PartitionThread { partition, handle })
    }

    /// Deliver a hardware interrupt to the partition owning `line`.
    ///
    /// Returns whether the signal was asserted; a disabled line or a
    /// dead partition swallows the delivery.
    pub fn post_irq(&self, partition: PartitionId, line: u32) -> Result<bool, IrqPostError> {
        let mut core = self.inner.lock_core();
        let delivery = warden_spm_core::post_irq(&mut core.state, partition, line)?;
        self.inner.apply_effects(&mut core, delivery.effects);
        Ok(delivery.delivered)
    }

    /// Security lifecycle of the manager's root of trust.
    pub fn lifecycle_state(&self) -> u32 {
        LIFECYCLE_SECURED
    }

    /// Snapshot of the audit log.
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.inner.lock_core().audit.events().to_vec()
    }

    /// Run a read-only closure over the manager state. Observability for
    /// tests and diagnostics; partition code has no business here.
    pub fn inspect<R>(&self, f: impl FnOnce(&SpmState) -> R) -> R {
        let core = self.inner.lock_core();
        f(&core.state)
    }

    /// The platform this manager runs on.
    pub fn platform(&self) -> &P {
        &self.inner.platform
    }
}

// ============================================================================
// Client port
// ============================================================================

/// Everything a completed call hands back: the service's reply status
/// (payload, positive or negative) and the bytes written into each
/// output vector.
#[derive(Clone, Debug)]
pub struct CallReply {
    pub status: Status,
    pub out_lengths: [usize; MAX_IOVEC],
}

impl CallReply {
    fn failed(status: Status) -> Self {
        Self {
            status,
            out_lengths: [0; MAX_IOVEC],
        }
    }
}

/// Client-side surface: discovery, connect, call, close.
pub struct ClientPort<P: Platform> {
    spm: Arc<SpmInner<P>>,
    client: ClientId,
}

impl<P: Platform> ClientPort<P> {
    /// The client id this port speaks for.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Protocol version implemented by the manager.
    pub fn framework_version(&self) -> u32 {
        match self.spm.submit(self.client, Request::FrameworkVersion) {
            Outcome::Value(version) => version as u32,
            _ => FRAMEWORK_VERSION,
        }
    }

    /// Version of `sid`, or [`VERSION_NONE`] when the service is absent
    /// or this client may not see it.
    pub fn service_version(&self, sid: ServiceId) -> u32 {
        match self
            .spm
            .submit(self.client, Request::ServiceVersion { sid })
        {
            Outcome::Value(version) => version as u32,
            _ => VERSION_NONE,
        }
    }

    /// Open a connection, parking until the service answers.
    ///
    /// Refusals come back as the refusing status. Protocol violations
    /// (unknown sid, version mismatch, unauthorized access) are charged
    /// to this client and terminate it when it runs in panic mode.
    pub fn connect(&self, sid: ServiceId, version: u32) -> Result<Handle, Status> {
        match self
            .spm
            .submit_blocking(self.client, Request::Connect { sid, version })
        {
            BlockingReply::Immediate(outcome) => Err(status_of(outcome)),
            BlockingReply::Resumed(completion) => {
                if completion.status == Status::SUCCESS {
                    Ok(completion.handle)
                } else {
                    Err(completion.status)
                }
            }
        }
    }

    /// Issue a request on a connection or stateless handle and park
    /// until the service replies.
    ///
    /// Reply bytes are copied into `outvecs`; the written length of each
    /// is reported in the reply. Every input and output range is
    /// validated against the platform before any byte is trusted.
    pub fn call(
        &self,
        handle: Handle,
        request_type: i16,
        invecs: &[&[u8]],
        outvecs: &mut [&mut [u8]],
    ) -> CallReply {
        for vec in invecs {
            if !self.spm.platform.validate_range(
                self.client,
                vec.as_ptr() as usize,
                vec.len(),
                Access::Read,
            ) {
                return self.vector_fault();
            }
        }
        for buf in outvecs.iter() {
            if !self.spm.platform.validate_range(
                self.client,
                buf.as_ptr() as usize,
                buf.len(),
                Access::Write,
            ) {
                return self.vector_fault();
            }
        }

        let control = CallControl {
            request: request_type,
            invec_count: u8::try_from(invecs.len()).unwrap_or(u8::MAX),
            outvec_count: u8::try_from(outvecs.len()).unwrap_or(u8::MAX),
        };
        let request = Request::Call {
            handle,
            control,
            invecs: invecs.iter().map(|v| v.to_vec()).collect(),
            outvec_capacities: outvecs.iter().map(|b| b.len()).collect(),
        };
        match self.spm.submit_blocking(self.client, request) {
            BlockingReply::Immediate(outcome) => CallReply::failed(status_of(outcome)),
            BlockingReply::Resumed(completion) => {
                let mut out_lengths = [0; MAX_IOVEC];
                for (idx, buf) in outvecs.iter_mut().enumerate().take(MAX_IOVEC) {
                    let written = &completion.outvecs[idx];
                    let n = written.len().min(buf.len());
                    buf[..n].copy_from_slice(&written[..n]);
                    out_lengths[idx] = n;
                }
                CallReply {
                    status: completion.status,
                    out_lengths,
                }
            }
        }
    }

    /// Tear down an idle connection. Never blocks; the disconnect
    /// notification reaches the service asynchronously.
    pub fn close(&self, handle: Handle) -> Status {
        match self.spm.submit(self.client, Request::Close { handle }) {
            Outcome::Terminated => self.spm.fault_exit(self.client),
            outcome => status_of(outcome),
        }
    }

    /// A vector range failed isolation validation.
    fn vector_fault(&self) -> CallReply {
        match self.spm.submit_fault(self.client, Status::PROGRAMMER_ERROR) {
            Outcome::Terminated => self.spm.fault_exit(self.client),
            outcome => CallReply::failed(status_of(outcome)),
        }
    }
}

// ============================================================================
// Service port
// ============================================================================

/// Service-side surface for one partition: the wait/get/reply protocol,
/// vector access, doorbell, and interrupt control.
pub struct ServicePort<P: Platform> {
    spm: Arc<SpmInner<P>>,
    partition: PartitionId,
}

impl<P: Platform> ServicePort<P> {
    /// The partition this port speaks for.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Client-side surface for this partition, for calling other
    /// partitions' services.
    pub fn client(&self) -> ClientPort<P> {
        ClientPort {
            spm: Arc::clone(&self.spm),
            client: self.partition.0,
        }
    }

    fn caller(&self) -> ClientId {
        self.partition.0
    }

    fn submit(&self, request: Request) -> Outcome {
        self.spm.submit(self.caller(), request)
    }

    /// Collect asserted signals from `mask`.
    ///
    /// [`Timeout::Poll`] returns immediately, possibly with an empty
    /// set; [`Timeout::Block`] parks this thread until a masked signal
    /// asserts. A mask no assigned signal can ever satisfy is a
    /// protocol violation.
    pub fn wait(&self, mask: SignalSet, timeout: Timeout) -> Result<SignalSet, Status> {
        let caller = self.caller();
        let Some(cv) = self.spm.wakeups.get(&self.partition) else {
            return Err(Status::PROGRAMMER_ERROR);
        };
        let mut core = self.spm.lock_core();
        loop {
            let now = self.spm.platform.now_nanos();
            let StepResult { outcome, effects } =
                step(&mut core.state, caller, Request::Wait { mask, timeout }, now);
            self.spm.apply_effects(&mut core, effects);
            match outcome {
                Outcome::Signals(signals) => return Ok(signals),
                // Parked; any wake rechecks the mask from scratch.
                Outcome::WouldBlock => core = cv.wait(core).unwrap_or_else(|e| e.into_inner()),
                Outcome::Terminated => {
                    core.audit.log_fault(caller, now);
                    drop(core);
                    self.spm.fault_exit(caller);
                }
                other => return Err(status_of(other)),
            }
        }
    }

    /// Claim the oldest message behind one asserted service signal.
    ///
    /// `DOES_NOT_EXIST` means the signal outlived its queue; poll again.
    pub fn get(&self, signal: SignalSet) -> Result<MessageInfo, Status> {
        match self.submit(Request::Get { signal }) {
            Outcome::Delivered(info) => Ok(info),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Copy bytes from input vector `invec_idx` into `buf`, advancing
    /// the read cursor. Returns the number of bytes copied, 0 once the
    /// vector is exhausted.
    pub fn read(&self, handle: Handle, invec_idx: usize, buf: &mut [u8]) -> Result<usize, Status> {
        if !self.spm.platform.validate_range(
            self.caller(),
            buf.as_ptr() as usize,
            buf.len(),
            Access::Write,
        ) {
            return self.range_fault();
        }
        match self.submit(Request::Read {
            handle,
            invec_idx,
            max_bytes: buf.len(),
        }) {
            Outcome::Bytes(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Discard bytes from input vector `invec_idx` without copying.
    /// Returns the number of bytes actually skipped.
    pub fn skip(&self, handle: Handle, invec_idx: usize, num_bytes: usize) -> Result<usize, Status> {
        match self.submit(Request::Skip {
            handle,
            invec_idx,
            num_bytes,
        }) {
            Outcome::Value(skipped) => Ok(skipped as usize),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Append `data` to output vector `outvec_idx`. Overflowing the
    /// declared capacity is a protocol violation with nothing committed.
    pub fn write(&self, handle: Handle, outvec_idx: usize, data: &[u8]) -> Result<(), Status> {
        if !self.spm.platform.validate_range(
            self.caller(),
            data.as_ptr() as usize,
            data.len(),
            Access::Read,
        ) {
            return self.range_fault();
        }
        match self.submit(Request::Write {
            handle,
            outvec_idx,
            data: data.to_vec(),
        }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Complete a delivered message; its suspended client resumes with
    /// `status`. The message handle dies here. Never blocks.
    pub fn reply(&self, handle: Handle, status: Status) -> Result<(), Status> {
        match self.submit(Request::Reply { handle, status }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Store a reverse handle on the message's connection; later
    /// deliveries on that connection echo it.
    pub fn set_rhandle(&self, handle: Handle, rhandle: u64) -> Result<(), Status> {
        match self.submit(Request::SetRhandle { handle, rhandle }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Map input vector `invec_idx` for zero-copy consumption, receiving
    /// its whole unconsumed content.
    pub fn map_invec(&self, handle: Handle, invec_idx: usize) -> Result<Vec<u8>, Status> {
        match self.submit(Request::MapInvec { handle, invec_idx }) {
            Outcome::Bytes(data) => Ok(data),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Retire a mapped input vector.
    pub fn unmap_invec(&self, handle: Handle, invec_idx: usize) -> Result<(), Status> {
        match self.submit(Request::UnmapInvec { handle, invec_idx }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Map output vector `outvec_idx`, receiving a writable zero-filled
    /// buffer of its declared capacity.
    pub fn map_outvec(&self, handle: Handle, outvec_idx: usize) -> Result<Vec<u8>, Status> {
        match self.submit(Request::MapOutvec { handle, outvec_idx }) {
            Outcome::OutBuffer(buf) => Ok(buf),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Unmap output vector `outvec_idx`, committing the first `len`
    /// bytes of `buf` as its final content.
    pub fn unmap_outvec(
        &self,
        handle: Handle,
        outvec_idx: usize,
        len: usize,
        buf: Vec<u8>,
    ) -> Result<(), Status> {
        match self.submit(Request::UnmapOutvec {
            handle,
            outvec_idx,
            len,
            data: buf,
        }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Raise another partition's doorbell signal.
    pub fn notify(&self, partition: PartitionId) -> Result<(), Status> {
        match self.submit(Request::Notify { partition }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Clear this partition's doorbell signal. Clearing an unasserted
    /// doorbell is a protocol violation.
    pub fn clear(&self) -> Result<(), Status> {
        match self.submit(Request::Clear) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Enable deliveries on an owned interrupt signal.
    pub fn irq_enable(&self, signal: SignalSet) -> Result<(), Status> {
        match self.submit(Request::IrqEnable { signal }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Disable deliveries on an owned interrupt signal, reporting the
    /// previous enable state.
    pub fn irq_disable(&self, signal: SignalSet) -> Result<bool, Status> {
        match self.submit(Request::IrqDisable { signal }) {
            Outcome::Value(previous) => Ok(previous != 0),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Acknowledge a first-level interrupt signal.
    pub fn reset_signal(&self, signal: SignalSet) -> Result<(), Status> {
        match self.submit(Request::ResetSignal { signal }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Acknowledge a second-level interrupt signal, re-arming its line.
    pub fn eoi(&self, signal: SignalSet) -> Result<(), Status> {
        match self.submit(Request::Eoi { signal }) {
            Outcome::Complete(Status::SUCCESS) => Ok(()),
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }

    /// Security lifecycle of the manager's root of trust.
    pub fn lifecycle_state(&self) -> u32 {
        LIFECYCLE_SECURED
    }

    /// Unconditionally terminate this partition. Never returns.
    pub fn panic(&self) -> ! {
        let _ = self.submit(Request::Panic);
        self.spm.fault_exit(self.caller())
    }

    /// A buffer range failed isolation validation.
    fn range_fault<T>(&self) -> Result<T, Status> {
        match self.spm.submit_fault(self.caller(), Status::PROGRAMMER_ERROR) {
            Outcome::Terminated => self.spm.fault_exit(self.caller()),
            outcome => Err(status_of(outcome)),
        }
    }
}
