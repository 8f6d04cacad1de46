//! Platform trait for the Warden partition manager
//!
//! This crate defines the `Platform` trait that allows the manager to run
//! on different targets (hosted test harness, MPU-backed hardware) by
//! abstracting the operations the isolation boundary depends on.
//!
//! The manager consumes exactly three things from a platform:
//! - a memory-isolation check for client-supplied vector ranges
//! - a monotonic clock for audit timestamps
//! - a debug output sink

#![no_std]

/// Direction of a proposed access to client memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// The manager wants to read the range (input vectors).
    Read,
    /// The manager wants to write the range (output vectors).
    Write,
}

/// Platform trait
///
/// Implementations provide target-specific functionality for:
/// - Memory-range validation (MPU/SAU lookup on hardware)
/// - Time measurement
/// - Debug output
pub trait Platform: Send + Sync + 'static {
    /// Check that `[base, base + len)` lies inside memory the given
    /// client is granted for the requested access direction.
    ///
    /// Consulted before any client-supplied vector base/length pair is
    /// trusted. A zero-length range is always acceptable.
    fn validate_range(&self, client_id: i32, base: usize, len: usize, access: Access) -> bool;

    /// Current time in nanoseconds (monotonic).
    fn now_nanos(&self) -> u64;

    /// Write a debug message to the platform's console/log.
    fn debug_write(&self, msg: &str);
}

/// A minimal test platform for unit testing
///
/// Accepts every memory range by default; a single client id can be
/// scripted to fail validation so rejection paths are testable. Time
/// only moves when a test advances it.
#[derive(Default)]
pub struct TestPlatform {
    time: core::sync::atomic::AtomicU64,
    denied_client: core::sync::atomic::AtomicI64,
}

/// Sentinel meaning "no client is denied".
const NO_DENIED_CLIENT: i64 = i64::MIN;

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            time: core::sync::atomic::AtomicU64::new(0),
            denied_client: core::sync::atomic::AtomicI64::new(NO_DENIED_CLIENT),
        }
    }

    /// Advance the monotonic clock.
    pub fn advance_time(&self, nanos: u64) {
        self.time
            .fetch_add(nanos, core::sync::atomic::Ordering::SeqCst);
    }

    /// Make every range validation fail for `client_id`.
    pub fn deny_client(&self, client_id: i32) {
        self.denied_client
            .store(client_id as i64, core::sync::atomic::Ordering::SeqCst);
    }

    /// Clear a previous `deny_client`.
    pub fn allow_all(&self) {
        self.denied_client
            .store(NO_DENIED_CLIENT, core::sync::atomic::Ordering::SeqCst);
    }
}

impl Platform for TestPlatform {
    fn validate_range(&self, client_id: i32, _base: usize, _len: usize, _access: Access) -> bool {
        self.denied_client
            .load(core::sync::atomic::Ordering::SeqCst)
            != client_id as i64
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn debug_write(&self, _msg: &str) {
        // No-op for tests
    }
}
