//! Warden Hosting Runtime
//!
//! This crate hosts the partition manager state machine on threads:
//! - Manifest loading and state construction
//! - Blocking client/service ports over the pure step function
//! - Fault termination via controlled unwinding
//! - Audit log of control-plane operations

pub mod audit;
pub mod manifest;
pub mod runtime;

pub use audit::{AuditEvent, AuditKind, AuditLog, EventId};
pub use manifest::Manifest;
pub use runtime::{
    CallReply, ClientPort, PartitionExit, PartitionFault, PartitionThread, ServicePort, Spm,
};

// Re-export protocol types
pub use warden_ipc::{
    Handle, MessageInfo, MessageKind, SignalSet, Status, Timeout, FRAMEWORK_VERSION,
    LIFECYCLE_SECURED, MAX_IOVEC, VERSION_NONE,
};

// Re-export manager state types
pub use warden_spm_core::{
    check_all_invariants, ClientId, ConfigError, FaultMode, IrqConfig, IrqHandling, IrqPostError,
    PartitionConfig, PartitionId, ServiceConfig, ServiceId, SpmState, VersionPolicy,
};
