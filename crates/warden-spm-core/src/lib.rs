//! Warden SPM Core - Pure State Machine for Formal Verification
//!
//! This crate contains the **pure, platform-free** partition manager state
//! machine that serves as the primary verification target for Warden.
//!
//! # Design Principles
//!
//! 1. **No platform dependency**: All platform-specific code lives in `warden-spm`
//! 2. **No I/O or side effects**: Pure state transformations only
//! 3. **Deterministic**: Same input always produces same output
//! 4. **Verifiable**: Small TCB suitable for Kani/property proofs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   warden-spm-core                           │
//! │                 (Pure State Machine)                        │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │   SpmState    │    │    step()     │                   │
//! │   │  - partitions │───▶│  Pure state   │                   │
//! │   │  - services   │    │  transformer  │                   │
//! │   │  - messages   │    └───────────────┘                   │
//! │   └───────────────┘                                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │ HandleTable   │    │  Invariants   │                   │
//! │   │ policy        │    │  Assertions   │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     warden-spm                              │
//! │                  (Runtime Wrapper)                          │
//! │                                                             │
//! │   - Platform integration (memory checks, timing)            │
//! │   - Blocking client/service ports                           │
//! │   - AuditLog trail                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Verification Strategy
//!
//! - **Kani proofs**: Handle soundness, no cross-owner resolution
//! - **Property tests**: Vector access exclusivity, queue/signal agreement
//!
//! # Module Organization
//!
//! - `types` - Core manager types (PartitionId, ServiceId, etc.)
//! - `policy` - Error classification: deliver a status or terminate the caller
//! - `handle` - Generation-counted handle registry
//! - `iovec` - Message vector payloads and per-slot access tracking
//! - `state` - SpmState struct with all manager data
//! - `step` - Pure `step(state, caller, request) -> (state', result)` function
//! - `invariants` - Formal invariant assertions for verification

#![no_std]
extern crate alloc;

pub mod handle;
pub mod invariants;
pub mod iovec;
pub mod policy;
pub mod state;
pub mod step;
pub mod types;

#[cfg(test)]
mod tests_prop;

// Re-export all public types for convenient access
pub use handle::{HandleEntry, HandleError, HandleTable, HandleTarget};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use iovec::{InVec, IovecError, OutVec, SlotState, VecAccess};
pub use policy::{disposition, is_fatal, Disposition, FaultMode};
pub use state::{ConfigError, IrqConfig, PartitionConfig, ServiceConfig, SpmState};
pub use step::{
    charge_fault, post_irq, step, Completion, Effect, IrqDelivery, IrqPostError, Outcome, Request,
    StepResult,
};
pub use types::{
    is_nonsecure, ClientId, CompletionTicket, Connection, ConnectionId, ConnectionState,
    IrqHandling, IrqLine, MessageId, Partition, PartitionId, PartitionMetrics, RunState, Service,
    ServiceId, ServiceMetrics, SpmMessage, SpmMetrics, VersionPolicy,
};
