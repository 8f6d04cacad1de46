//! Error classification policy
//!
//! Every status produced by a manager operation passes through exactly one
//! authority before it reaches the caller. Depending on the status and the
//! caller's configured fault mode, the status is either delivered as an
//! ordinary return value or escalated to termination of the calling
//! execution context. Nothing else in the crate decides between those two
//! outcomes.

use serde::{Deserialize, Serialize};
use warden_ipc::Status;

/// How fatal statuses charged to a partition are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultMode {
    /// Fatal statuses terminate the partition.
    Panic,
    /// All statuses are returned; nothing terminates.
    Return,
}

/// The classified outcome for one status delivered to one caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the status back as an ordinary return value.
    Deliver(Status),
    /// Terminate the calling execution context; it never observes a value.
    Terminate,
}

/// Statuses that indicate a protocol violation by the caller rather than a
/// recoverable service condition.
pub fn is_fatal(status: Status) -> bool {
    matches!(
        status,
        Status::PROGRAMMER_ERROR | Status::CONNECTION_REFUSED | Status::CONNECTION_BUSY
    )
}

/// Classify a status against a caller's fault mode.
///
/// Non-secure callers always run in [`FaultMode::Return`]; the manager never
/// terminates the non-secure world.
pub fn disposition(status: Status, mode: FaultMode) -> Disposition {
    if is_fatal(status) && mode == FaultMode::Panic {
        Disposition::Terminate
    } else {
        Disposition::Deliver(status)
    }
}
