//! IPC Protocol & ABI Constants for the Warden Partition Manager
//!
//! This crate defines:
//! - **Status codes** (results crossing the client/service boundary)
//! - **Handle encoding** (connection, message, and stateless handle layout)
//! - **Call control words** (request type + vector counts packed in a u32)
//! - **Signal bit assignments** (doorbell, service, and interrupt signals)
//!
//! It is the **single source of truth** for all protocol constants,
//! eliminating duplication across crates.
//!
//! # Signal Bit Layout
//!
//! | Bits  | Meaning                      |
//! |-------|------------------------------|
//! | 0-2   | Reserved                     |
//! | 3     | Doorbell                     |
//! | 4-27  | RoT Service message signals  |
//! | 28-31 | Interrupt signals            |
//!
//! # Status Code Ranges
//!
//! | Range        | Category                              |
//! |--------------|---------------------------------------|
//! | 0            | Success                               |
//! | > 0          | Service-defined success statuses      |
//! | -1 to -128   | Service-defined error statuses        |
//! | -129 to -131 | Framework fatal set (see `policy`)    |
//! | -132 to -147 | Framework recoverable error statuses  |

#![no_std]

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// =============================================================================
// Status Codes
// =============================================================================

/// A status value crossing the client/service boundary.
///
/// **CRITICAL**: the numeric values are wire ABI shared with non-secure
/// clients and must not change. Values in the open ranges (positive, or
/// -1 to -128) belong to individual services and are opaque to the
/// framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Status(pub i32);

impl Status {
    /// Operation completed successfully.
    pub const SUCCESS: Status = Status(0);
    /// The caller violated the API contract. Fatal under a panicking
    /// fault mode.
    pub const PROGRAMMER_ERROR: Status = Status(-129);
    /// The service refused the connection.
    pub const CONNECTION_REFUSED: Status = Status(-130);
    /// The service (or connection) cannot accept more work right now.
    pub const CONNECTION_BUSY: Status = Status(-131);
    /// Unspecified internal failure.
    pub const GENERIC_ERROR: Status = Status(-132);
    /// The caller is not authorized for the requested operation.
    pub const NOT_PERMITTED: Status = Status(-133);
    /// The operation or requested version is not supported.
    pub const NOT_SUPPORTED: Status = Status(-134);
    /// A parameter was malformed.
    pub const INVALID_ARGUMENT: Status = Status(-135);
    /// The handle does not identify a live entity.
    pub const INVALID_HANDLE: Status = Status(-136);
    /// The entity is in the wrong state for the operation.
    pub const BAD_STATE: Status = Status(-137);
    /// The supplied buffer is too small for the result.
    pub const BUFFER_TOO_SMALL: Status = Status(-138);
    /// The entity already exists.
    pub const ALREADY_EXISTS: Status = Status(-139);
    /// The requested entity does not exist (retryable for `get`).
    pub const DOES_NOT_EXIST: Status = Status(-140);
    /// A table or pool is exhausted.
    pub const INSUFFICIENT_MEMORY: Status = Status(-141);

    /// Whether this status reports success (zero or a service-defined
    /// positive value).
    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Whether this status reports an error.
    pub fn is_error(self) -> bool {
        self.0 < 0
    }

    /// Whether this status is reserved connection-negotiation vocabulary
    /// (only meaningful in reply to a connect request).
    pub fn is_negotiation(self) -> bool {
        self == Status::CONNECTION_REFUSED || self == Status::CONNECTION_BUSY
    }

    /// Human-readable name for framework-defined values.
    ///
    /// Service-defined values render as `"service-defined"`.
    pub fn name(self) -> &'static str {
        match self {
            Status::SUCCESS => "Success",
            Status::PROGRAMMER_ERROR => "ProgrammerError",
            Status::CONNECTION_REFUSED => "ConnectionRefused",
            Status::CONNECTION_BUSY => "ConnectionBusy",
            Status::GENERIC_ERROR => "GenericError",
            Status::NOT_PERMITTED => "NotPermitted",
            Status::NOT_SUPPORTED => "NotSupported",
            Status::INVALID_ARGUMENT => "InvalidArgument",
            Status::INVALID_HANDLE => "InvalidHandle",
            Status::BAD_STATE => "BadState",
            Status::BUFFER_TOO_SMALL => "BufferTooSmall",
            Status::ALREADY_EXISTS => "AlreadyExists",
            Status::DOES_NOT_EXIST => "DoesNotExist",
            Status::INSUFFICIENT_MEMORY => "InsufficientMemory",
            _ => "service-defined",
        }
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

// =============================================================================
// Message Types
// =============================================================================

/// Raw message type value for a connect request.
pub const MSG_TYPE_CONNECT: i32 = -1;
/// Raw message type value for a disconnect request.
pub const MSG_TYPE_DISCONNECT: i32 = -2;
/// Smallest raw message type value for a call request. Call types carry
/// the client's request type, any value in `0..=REQUEST_TYPE_MAX`.
pub const MSG_TYPE_CALL_MIN: i32 = 0;
/// Largest client request type representable in a control word.
pub const REQUEST_TYPE_MAX: i32 = i16::MAX as i32;

/// The kind of work a delivered message asks a service to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// A client is establishing a connection.
    Connect,
    /// A client request on an established connection or stateless service.
    /// Carries the client-chosen request type.
    Call(i16),
    /// A client is tearing down a connection.
    Disconnect,
}

impl MessageKind {
    /// The raw wire value delivered in the message descriptor.
    pub fn raw(self) -> i32 {
        match self {
            MessageKind::Connect => MSG_TYPE_CONNECT,
            MessageKind::Call(request) => request as i32,
            MessageKind::Disconnect => MSG_TYPE_DISCONNECT,
        }
    }

    /// Decode a raw wire value.
    ///
    /// Returns `None` for values outside the defined ranges.
    pub fn from_raw(raw: i32) -> Option<MessageKind> {
        match raw {
            MSG_TYPE_CONNECT => Some(MessageKind::Connect),
            MSG_TYPE_DISCONNECT => Some(MessageKind::Disconnect),
            t if (MSG_TYPE_CALL_MIN..=REQUEST_TYPE_MAX).contains(&t) => {
                Some(MessageKind::Call(t as i16))
            }
            _ => None,
        }
    }

    /// Whether this is a call message (the only kind carrying vectors).
    pub fn is_call(self) -> bool {
        matches!(self, MessageKind::Call(_))
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Number of bits used for the table index in a handle.
pub const HANDLE_INDEX_BITS: u32 = 8;
/// Mask extracting the table index from a handle.
pub const HANDLE_INDEX_MASK: i32 = (1 << HANDLE_INDEX_BITS) - 1;
/// Bit offset of the generation field in a registry handle.
pub const HANDLE_GENERATION_SHIFT: u32 = HANDLE_INDEX_BITS;
/// Mask (pre-shift) of the generation field in a registry handle.
pub const HANDLE_GENERATION_MASK: i32 = 0xFFFF;
/// Bit marking a handle as a stateless service handle.
pub const HANDLE_STATELESS_BIT: i32 = 1 << 30;
/// Bit offset of the version field inside a stateless handle.
pub const HANDLE_STATELESS_VERSION_SHIFT: u32 = 8;

/// An opaque capability naming a connection, an in-flight message, or a
/// stateless service.
///
/// Handle values are meaningful only to the registry that issued them;
/// arithmetic on them carries no meaning for callers. Registry handles
/// pack a table index with a generation counter so stale values are
/// rejected after release. Generations start at 1, so a live registry
/// handle is never equal to [`Handle::NULL`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Handle(pub i32);

impl Handle {
    /// The null handle. Never identifies an entity.
    pub const NULL: Handle = Handle(0);

    /// Pack a registry handle from a table index and generation.
    pub fn from_parts(index: u8, generation: u16) -> Handle {
        Handle(((generation as i32) << HANDLE_GENERATION_SHIFT) | index as i32)
    }

    /// Pack a stateless service handle from a service table index and
    /// the service's major version.
    pub fn stateless(index: u8, version: u8) -> Handle {
        Handle(HANDLE_STATELESS_BIT | ((version as i32) << HANDLE_STATELESS_VERSION_SHIFT) | index as i32)
    }

    /// The raw wire value.
    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether this handle names a stateless service rather than a
    /// registry entity.
    pub fn is_stateless(self) -> bool {
        self.0 & HANDLE_STATELESS_BIT != 0
    }

    /// Table index field. Meaningful for both registry and stateless
    /// handles.
    pub fn index(self) -> u8 {
        (self.0 & HANDLE_INDEX_MASK) as u8
    }

    /// Generation field of a registry handle.
    pub fn generation(self) -> u16 {
        ((self.0 >> HANDLE_GENERATION_SHIFT) & HANDLE_GENERATION_MASK) as u16
    }

    /// Version field of a stateless handle.
    pub fn stateless_version(self) -> u8 {
        ((self.0 >> HANDLE_STATELESS_VERSION_SHIFT) & 0xFF) as u8
    }
}

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// =============================================================================
// Call Control Word
// =============================================================================

/// Decoded form of the control word a client passes with every call.
///
/// Wire layout: request type in bits 16-31 (signed 16-bit), input vector
/// count in bits 8-15, output vector count in bits 0-7.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallControl {
    /// Client-chosen request type, must be non-negative.
    pub request: i16,
    /// Number of input vectors supplied, at most [`MAX_IOVEC`].
    pub invec_count: u8,
    /// Number of output vectors supplied, at most [`MAX_IOVEC`].
    pub outvec_count: u8,
}

impl CallControl {
    /// Pack into the wire representation.
    pub fn pack(self) -> u32 {
        ((self.request as u16 as u32) << 16)
            | ((self.invec_count as u32) << 8)
            | self.outvec_count as u32
    }

    /// Decode from the wire representation. Field values are extracted
    /// verbatim; range validation is the manager's job.
    pub fn unpack(raw: u32) -> CallControl {
        CallControl {
            request: (raw >> 16) as i16,
            invec_count: (raw >> 8) as u8,
            outvec_count: raw as u8,
        }
    }

    /// Whether the decoded fields are within protocol limits.
    pub fn is_valid(self) -> bool {
        self.request >= 0
            && self.invec_count as usize <= MAX_IOVEC
            && self.outvec_count as usize <= MAX_IOVEC
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Bit position of the doorbell signal.
pub const DOORBELL_SIGNAL_BIT: u32 = 3;
/// First bit position assigned to RoT Service message signals.
pub const SERVICE_SIGNAL_BASE: u32 = 4;
/// Number of bit positions available for RoT Service message signals.
pub const SERVICE_SIGNAL_COUNT: u32 = 24;
/// First bit position assigned to interrupt signals.
pub const IRQ_SIGNAL_BASE: u32 = 28;
/// Number of bit positions available for interrupt signals.
pub const IRQ_SIGNAL_COUNT: u32 = 4;

bitflags! {
    /// A partition's pending-event word.
    ///
    /// One bit per event source. Service and interrupt bits are assigned
    /// from the manifest; the doorbell bit is fixed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SignalSet: u32 {
        /// Doorbell raised by another partition via notify.
        const DOORBELL = 1 << DOORBELL_SIGNAL_BIT;
        /// All RoT Service message signal positions.
        const SERVICES = 0x0FFF_FFF0;
        /// All interrupt signal positions.
        const IRQS = 0xF000_0000;
    }
}

impl SignalSet {
    /// The signal bit for the service assigned signal slot `slot`.
    ///
    /// Returns `None` when `slot` is outside the service signal range.
    pub fn service(slot: u32) -> Option<SignalSet> {
        if slot < SERVICE_SIGNAL_COUNT {
            Some(SignalSet::from_bits_retain(1 << (SERVICE_SIGNAL_BASE + slot)))
        } else {
            None
        }
    }

    /// The signal bit for interrupt line `line`.
    ///
    /// Returns `None` when `line` is outside the interrupt signal range.
    pub fn irq(line: u32) -> Option<SignalSet> {
        if line < IRQ_SIGNAL_COUNT {
            Some(SignalSet::from_bits_retain(1 << (IRQ_SIGNAL_BASE + line)))
        } else {
            None
        }
    }

    /// Whether exactly one bit is set.
    pub fn is_single(self) -> bool {
        let bits = self.bits();
        bits != 0 && bits & (bits - 1) == 0
    }

    /// Whether this is a single asserted service signal bit.
    pub fn is_service_signal(self) -> bool {
        self.is_single() && SignalSet::SERVICES.contains(self)
    }

    /// Whether this is a single asserted interrupt signal bit.
    pub fn is_irq_signal(self) -> bool {
        self.is_single() && SignalSet::IRQS.contains(self)
    }

    /// The signal slot a single service bit was assigned from, if any.
    pub fn service_slot(self) -> Option<u32> {
        if self.is_service_signal() {
            Some(self.bits().trailing_zeros() - SERVICE_SIGNAL_BASE)
        } else {
            None
        }
    }

    /// The interrupt line a single interrupt bit was assigned from, if any.
    pub fn irq_line(self) -> Option<u32> {
        if self.is_irq_signal() {
            Some(self.bits().trailing_zeros() - IRQ_SIGNAL_BASE)
        } else {
            None
        }
    }
}

// =============================================================================
// Wait Timeouts
// =============================================================================

/// Raw timeout value selecting a blocking wait.
pub const TIMEOUT_BLOCK: u32 = 0x8000_0000;
/// Raw timeout value selecting a non-blocking poll.
pub const TIMEOUT_POLL: u32 = 0x0000_0000;

/// How long a wait is prepared to suspend the caller.
///
/// There is no intermediate deadline; partial timeouts are a scheduler
/// concern outside this protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeout {
    /// Suspend until at least one masked signal asserts.
    Block,
    /// Return immediately with whatever is asserted.
    Poll,
}

impl Timeout {
    /// Decode a raw timeout word. Returns `None` for reserved values.
    pub fn from_raw(raw: u32) -> Option<Timeout> {
        match raw {
            TIMEOUT_BLOCK => Some(Timeout::Block),
            TIMEOUT_POLL => Some(Timeout::Poll),
            _ => None,
        }
    }

    /// The raw wire value.
    pub fn raw(self) -> u32 {
        match self {
            Timeout::Block => TIMEOUT_BLOCK,
            Timeout::Poll => TIMEOUT_POLL,
        }
    }
}

// =============================================================================
// Versions & Limits
// =============================================================================

/// Version of the framework protocol implemented, major in the high
/// byte, minor in the low byte.
pub const FRAMEWORK_VERSION: u32 = 0x0101;

/// Returned by a service-version query when the service is absent or the
/// caller is not authorized to learn about it.
pub const VERSION_NONE: u32 = 0;

/// Security lifecycle word reported to services: bits 15:8 carry the
/// lifecycle state, bits 7:0 are implementation defined. The manager
/// always reports the secured state.
pub const LIFECYCLE_SECURED: u32 = 0x3000;

/// Maximum number of input vectors (and, separately, output vectors) a
/// single call may carry.
pub const MAX_IOVEC: usize = 4;

/// Total per-message vector slots: indexes `0..MAX_IOVEC` are input
/// vectors, `MAX_IOVEC..2 * MAX_IOVEC` are output vectors.
pub const IOVEC_SLOTS: usize = 2 * MAX_IOVEC;

/// Capacity of the handle registry.
pub const MAX_HANDLES: usize = 1 << HANDLE_INDEX_BITS;

/// Maximum number of services reachable through stateless handles.
pub const MAX_STATELESS_SERVICES: usize = 32;

// =============================================================================
// Message Descriptor
// =============================================================================

/// Everything a service learns about a delivered message.
///
/// Returned by `get` once per message; the handle inside stays valid
/// until the service replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Handle for read/skip/write/reply on this message.
    pub handle: Handle,
    /// What the client asked for.
    pub kind: MessageKind,
    /// Identity of the calling client. Negative ids are non-secure
    /// callers.
    pub client_id: i32,
    /// Reverse handle previously stored on the connection, 0 if never
    /// set or the service is stateless.
    pub rhandle: u64,
    /// Total size of each input vector.
    pub in_size: [usize; MAX_IOVEC],
    /// Capacity of each output vector.
    pub out_size: [usize; MAX_IOVEC],
}
