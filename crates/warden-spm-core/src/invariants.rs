//! Formal invariants for manager verification
//!
//! This module contains runtime-checkable invariants that should always hold.
//! These are used for:
//! 1. Runtime assertion checking during development
//! 2. Property-based testing with proptest
//! 3. Formal verification with Kani
//!
//! # Invariants
//!
//! 1. **Handle Target Validity**: Every live handle references an existing
//!    connection or message, issued to the right owner
//! 2. **Connection Consistency**: Each lifecycle state carries exactly the
//!    in-flight messages it implies
//! 3. **Message Consistency**: Undelivered messages sit in their service
//!    queue exactly once; delivered ones hold a resolvable handle
//! 4. **Signal Consistency**: Asserted signals stay within the assigned set,
//!    and a non-empty queue keeps its service signal raised
//! 5. **ID Monotonicity**: Next IDs are always greater than existing IDs

use alloc::string::String;
use alloc::vec::Vec;

use warden_ipc::MessageKind;

use crate::handle::HandleTarget;
use crate::state::SpmState;
use crate::types::RunState;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all manager invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &SpmState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_handle_target_validity(state));
    violations.extend(check_connection_consistency(state));
    violations.extend(check_message_consistency(state));
    violations.extend(check_signal_consistency(state));
    violations.extend(check_id_monotonicity(state));

    violations
}

/// Invariant 1: Every live handle references an existing object and was
/// issued to the party the object records.
fn check_handle_target_validity(state: &SpmState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (handle, entry) in state.handles.iter_live() {
        match entry.target {
            HandleTarget::Connection(cid) => match state.connections.get(&cid) {
                Some(conn) => {
                    if conn.client != entry.owner {
                        violations.push(InvariantViolation {
                            invariant: "handle_target_validity",
                            description: alloc::format!(
                                "Handle {:#x} for connection {} issued to {} but the connection belongs to {}",
                                handle.0,
                                cid.0,
                                entry.owner,
                                conn.client
                            ),
                        });
                    }
                    if conn.client_handle != Some(handle) {
                        violations.push(InvariantViolation {
                            invariant: "handle_target_validity",
                            description: alloc::format!(
                                "Handle {:#x} references connection {} which records a different handle",
                                handle.0,
                                cid.0
                            ),
                        });
                    }
                }
                None => violations.push(InvariantViolation {
                    invariant: "handle_target_validity",
                    description: alloc::format!(
                        "Handle {:#x} references non-existent connection {}",
                        handle.0,
                        cid.0
                    ),
                }),
            },
            HandleTarget::Message(mid) => match state.messages.get(&mid) {
                Some(msg) => {
                    let server = state.services.get(&msg.service).map(|s| s.partition.0);
                    if server != Some(entry.owner) {
                        violations.push(InvariantViolation {
                            invariant: "handle_target_validity",
                            description: alloc::format!(
                                "Handle {:#x} for message {} issued to {} instead of the serving partition",
                                handle.0,
                                mid.0,
                                entry.owner
                            ),
                        });
                    }
                    if msg.service_handle != Some(handle) {
                        violations.push(InvariantViolation {
                            invariant: "handle_target_validity",
                            description: alloc::format!(
                                "Handle {:#x} references message {} which records a different handle",
                                handle.0,
                                mid.0
                            ),
                        });
                    }
                }
                None => violations.push(InvariantViolation {
                    invariant: "handle_target_validity",
                    description: alloc::format!(
                        "Handle {:#x} references non-existent message {}",
                        handle.0,
                        mid.0
                    ),
                }),
            },
        }
    }

    violations
}

/// Invariant 2: A connection's lifecycle state matches its in-flight
/// messages: pending carries one connect, active one call, closing one
/// disconnect, idle none.
fn check_connection_consistency(state: &SpmState) -> Vec<InvariantViolation> {
    use crate::types::ConnectionState::*;

    let mut violations = Vec::new();

    for (cid, conn) in &state.connections {
        if !state.services.contains_key(&conn.service) {
            violations.push(InvariantViolation {
                invariant: "connection_consistency",
                description: alloc::format!(
                    "Connection {} targets non-existent service {:#x}",
                    cid.0,
                    conn.service.0
                ),
            });
            continue;
        }

        let connects = state
            .messages
            .values()
            .filter(|m| m.connection == Some(*cid) && m.kind == MessageKind::Connect)
            .count();
        let calls = state
            .messages
            .values()
            .filter(|m| m.connection == Some(*cid) && matches!(m.kind, MessageKind::Call(_)))
            .count();
        let disconnects = state
            .messages
            .values()
            .filter(|m| m.connection == Some(*cid) && m.kind == MessageKind::Disconnect)
            .count();

        let expected = match conn.state {
            Pending => (1, 0, 0),
            Idle => (0, 0, 0),
            Active => (0, 1, 0),
            Closing => (0, 0, 1),
        };
        if (connects, calls, disconnects) != expected {
            violations.push(InvariantViolation {
                invariant: "connection_consistency",
                description: alloc::format!(
                    "Connection {} in {:?} has {} connect / {} call / {} disconnect messages in flight",
                    cid.0,
                    conn.state,
                    connects,
                    calls,
                    disconnects
                ),
            });
        }

        // An established connection is reachable from its client.
        let established = matches!(conn.state, Idle | Active);
        if established && conn.client_handle.is_none() {
            violations.push(InvariantViolation {
                invariant: "connection_consistency",
                description: alloc::format!(
                    "Connection {} in {:?} has no client handle",
                    cid.0,
                    conn.state
                ),
            });
        }
    }

    violations
}

/// Invariant 3: Undelivered messages appear exactly once in their service's
/// queue; delivered messages appear in no queue and hold a live handle.
fn check_message_consistency(state: &SpmState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (mid, msg) in &state.messages {
        let svc = match state.services.get(&msg.service) {
            Some(s) => s,
            None => {
                violations.push(InvariantViolation {
                    invariant: "message_consistency",
                    description: alloc::format!(
                        "Message {} targets non-existent service {:#x}",
                        mid.0,
                        msg.service.0
                    ),
                });
                continue;
            }
        };

        let queued = svc.pending.iter().filter(|id| **id == *mid).count();
        if msg.is_delivered() {
            if queued != 0 {
                violations.push(InvariantViolation {
                    invariant: "message_consistency",
                    description: alloc::format!(
                        "Delivered message {} is still queued {} time(s)",
                        mid.0,
                        queued
                    ),
                });
            }
        } else if queued != 1 {
            violations.push(InvariantViolation {
                invariant: "message_consistency",
                description: alloc::format!(
                    "Undelivered message {} queued {} time(s)",
                    mid.0,
                    queued
                ),
            });
        }
    }

    // Queue entries must reference existing messages for this service.
    for (sid, svc) in &state.services {
        for mid in &svc.pending {
            match state.messages.get(mid) {
                Some(msg) if msg.service == *sid => {}
                Some(_) => violations.push(InvariantViolation {
                    invariant: "message_consistency",
                    description: alloc::format!(
                        "Service {:#x} queues message {} addressed to another service",
                        sid.0,
                        mid.0
                    ),
                }),
                None => violations.push(InvariantViolation {
                    invariant: "message_consistency",
                    description: alloc::format!(
                        "Service {:#x} queues non-existent message {}",
                        sid.0,
                        mid.0
                    ),
                }),
            }
        }
    }

    violations
}

/// Invariant 4: Signals stay inside the assigned set, dead partitions hold
/// none, and a non-empty queue keeps its service signal raised.
fn check_signal_consistency(state: &SpmState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (pid, part) in &state.partitions {
        if !part.valid_signals.contains(part.signals) {
            violations.push(InvariantViolation {
                invariant: "signal_consistency",
                description: alloc::format!(
                    "Partition {} asserts {:#x} outside its assigned set {:#x}",
                    pid.0,
                    part.signals.bits(),
                    part.valid_signals.bits()
                ),
            });
        }
        if part.run_state == RunState::Dead && !part.signals.is_empty() {
            violations.push(InvariantViolation {
                invariant: "signal_consistency",
                description: alloc::format!(
                    "Dead partition {} still asserts {:#x}",
                    pid.0,
                    part.signals.bits()
                ),
            });
        }
    }

    for (sid, svc) in &state.services {
        if svc.pending.is_empty() {
            continue;
        }
        let part = match state.partitions.get(&svc.partition) {
            Some(p) => p,
            None => {
                violations.push(InvariantViolation {
                    invariant: "signal_consistency",
                    description: alloc::format!(
                        "Service {:#x} belongs to non-existent partition {}",
                        sid.0,
                        svc.partition.0
                    ),
                });
                continue;
            }
        };
        if part.run_state != RunState::Dead && !part.signals.contains(svc.signal()) {
            violations.push(InvariantViolation {
                invariant: "signal_consistency",
                description: alloc::format!(
                    "Service {:#x} has {} queued message(s) but its signal is clear",
                    sid.0,
                    svc.pending.len()
                ),
            });
        }
    }

    violations
}

/// Invariant 5: Next IDs are always greater than existing IDs
fn check_id_monotonicity(state: &SpmState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for cid in state.connections.keys() {
        if cid.0 >= state.next_connection_id {
            violations.push(InvariantViolation {
                invariant: "id_monotonicity",
                description: alloc::format!(
                    "Connection {} exists but next_connection_id is {}",
                    cid.0,
                    state.next_connection_id
                ),
            });
        }
    }

    for mid in state.messages.keys() {
        if mid.0 >= state.next_message_id {
            violations.push(InvariantViolation {
                invariant: "id_monotonicity",
                description: alloc::format!(
                    "Message {} exists but next_message_id is {}",
                    mid.0,
                    state.next_message_id
                ),
            });
        }
    }

    for msg in state.messages.values() {
        if let Some(ticket) = msg.ticket {
            if ticket.0 >= state.next_ticket {
                violations.push(InvariantViolation {
                    invariant: "id_monotonicity",
                    description: alloc::format!(
                        "Ticket {} exists but next_ticket is {}",
                        ticket.0,
                        state.next_ticket
                    ),
                });
            }
        }
    }

    violations
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants(state: &SpmState) {
    let violations = check_all_invariants(state);
    if !violations.is_empty() {
        for v in &violations {
            // In no_std, we can't easily panic with a formatted message,
            // but we can at least report the invariant name
            panic!("Invariant violated: {}", v.invariant);
        }
    }
}

// ============================================================================
// Kani proofs for invariants
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;
    use crate::policy::FaultMode;
    use crate::state::{PartitionConfig, ServiceConfig};
    use crate::step::{step, Outcome, Request};
    use crate::types::{ServiceId, VersionPolicy};
    use alloc::string::String;
    use alloc::vec::Vec;

    fn loaded() -> SpmState {
        let mut state = SpmState::new();
        state
            .register_partition(PartitionConfig {
                id: 1,
                name: String::from("server"),
                fault_mode: FaultMode::Panic,
                irqs: Vec::new(),
            })
            .unwrap();
        state
            .register_service(ServiceConfig {
                sid: 0x40,
                name: String::from("echo"),
                partition: 1,
                version: 1,
                policy: VersionPolicy::Strict,
                connection_based: true,
                stateless: false,
                ns_accessible: true,
                mm_iovec: false,
            })
            .unwrap();
        state
    }

    /// Proof: Loading a manifest maintains invariants
    #[kani::proof]
    #[kani::unwind(5)]
    fn manifest_load_maintains_invariants() {
        let state = loaded();
        let violations = check_all_invariants(&state);
        kani::assert(
            violations.is_empty(),
            "Loading a manifest should maintain invariants",
        );
    }

    /// Proof: A connect request maintains invariants
    #[kani::proof]
    #[kani::unwind(10)]
    fn connect_maintains_invariants() {
        let mut state = loaded();
        let result = step(
            &mut state,
            -1,
            Request::Connect {
                sid: ServiceId(0x40),
                version: 1,
            },
            1000,
        );
        kani::assume(matches!(result.outcome, Outcome::Suspended(_)));
        let violations = check_all_invariants(&state);
        kani::assert(
            violations.is_empty(),
            "A connect request should maintain invariants",
        );
    }

    /// Proof: Terminating a partition maintains invariants
    #[kani::proof]
    #[kani::unwind(10)]
    fn termination_maintains_invariants() {
        let mut state = loaded();
        let _ = step(&mut state, 1, Request::Panic, 1000);
        let violations = check_all_invariants(&state);
        kani::assert(
            violations.is_empty(),
            "Termination should maintain invariants",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleTarget;
    use crate::policy::FaultMode;
    use crate::state::{PartitionConfig, ServiceConfig};
    use crate::step::{step, Effect, Outcome, Request};
    use crate::types::{ClientId, ConnectionState, MessageId, ServiceId, VersionPolicy};
    use alloc::string::String;
    use alloc::vec::Vec;
    use warden_ipc::{CallControl, Handle, SignalSet, Status};

    const ECHO: ServiceId = ServiceId(0x40);

    fn loaded_state() -> SpmState {
        let mut state = SpmState::new();
        state
            .register_partition(PartitionConfig {
                id: 1,
                name: String::from("server"),
                fault_mode: FaultMode::Panic,
                irqs: Vec::new(),
            })
            .unwrap();
        state
            .register_service(ServiceConfig {
                sid: ECHO.0,
                name: String::from("echo"),
                partition: 1,
                version: 1,
                policy: VersionPolicy::Strict,
                connection_based: true,
                stateless: false,
                ns_accessible: true,
                mm_iovec: false,
            })
            .unwrap();
        state
    }

    fn completion_handle(effects: &[Effect]) -> Handle {
        for effect in effects {
            if let Effect::Complete(_, completion) = effect {
                return completion.handle;
            }
        }
        panic!("no completion effect");
    }

    fn connect(state: &mut SpmState, client: ClientId) -> Handle {
        let res = step(
            state,
            client,
            Request::Connect {
                sid: ECHO,
                version: 1,
            },
            0,
        );
        assert!(matches!(res.outcome, Outcome::Suspended(_)));
        let got = step(
            state,
            1,
            Request::Get {
                signal: SignalSet::service(0).unwrap(),
            },
            0,
        );
        let info = match got.outcome {
            Outcome::Delivered(info) => info,
            other => panic!("connect not delivered: {:?}", other),
        };
        let replied = step(
            state,
            1,
            Request::Reply {
                handle: info.handle,
                status: Status::SUCCESS,
            },
            0,
        );
        completion_handle(&replied.effects)
    }

    #[test]
    fn test_invariants_hold_for_new_state() {
        let state = SpmState::new();
        let violations = check_all_invariants(&state);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_invariants_hold_after_manifest_load() {
        let state = loaded_state();
        let violations = check_all_invariants(&state);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_invariants_hold_across_an_exchange() {
        let mut state = loaded_state();

        let res = step(
            &mut state,
            -1,
            Request::Connect {
                sid: ECHO,
                version: 1,
            },
            0,
        );
        assert!(matches!(res.outcome, Outcome::Suspended(_)));
        assert!(check_all_invariants(&state).is_empty());

        let got = step(
            &mut state,
            1,
            Request::Get {
                signal: SignalSet::service(0).unwrap(),
            },
            0,
        );
        let info = match got.outcome {
            Outcome::Delivered(info) => info,
            other => panic!("connect not delivered: {:?}", other),
        };
        assert!(check_all_invariants(&state).is_empty());

        let replied = step(
            &mut state,
            1,
            Request::Reply {
                handle: info.handle,
                status: Status::SUCCESS,
            },
            0,
        );
        let handle = completion_handle(&replied.effects);
        assert!(check_all_invariants(&state).is_empty());

        let res = step(
            &mut state,
            -1,
            Request::Call {
                handle,
                control: CallControl {
                    request: 0,
                    invec_count: 1,
                    outvec_count: 0,
                },
                invecs: Vec::from([Vec::from(*b"ping")]),
                outvec_capacities: Vec::new(),
            },
            0,
        );
        assert!(matches!(res.outcome, Outcome::Suspended(_)));
        assert!(check_all_invariants(&state).is_empty());

        let got = step(
            &mut state,
            1,
            Request::Get {
                signal: SignalSet::service(0).unwrap(),
            },
            0,
        );
        let info = match got.outcome {
            Outcome::Delivered(info) => info,
            other => panic!("call not delivered: {:?}", other),
        };
        assert!(check_all_invariants(&state).is_empty());

        step(
            &mut state,
            1,
            Request::Reply {
                handle: info.handle,
                status: Status::SUCCESS,
            },
            0,
        );
        assert!(check_all_invariants(&state).is_empty());
    }

    #[test]
    fn test_invariants_hold_after_termination() {
        let mut state = loaded_state();
        connect(&mut state, -1);
        let _ = step(&mut state, 1, Request::Panic, 0);
        let violations = check_all_invariants(&state);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_detects_dangling_message_handle() {
        let mut state = loaded_state();
        state
            .handles
            .allocate(1, HandleTarget::Message(MessageId(999)))
            .unwrap();

        let violations = check_all_invariants(&state);
        assert!(!violations.is_empty());
        assert!(violations
            .iter()
            .any(|v| v.invariant == "handle_target_validity"));
    }

    #[test]
    fn test_detects_connection_state_mismatch() {
        let mut state = loaded_state();
        let handle = connect(&mut state, -1);

        // Force an active state with no call in flight.
        let entry = state.handles.resolve(handle, -1).unwrap();
        let cid = match entry.target {
            HandleTarget::Connection(cid) => cid,
            _ => panic!("expected a connection handle"),
        };
        state.connections.get_mut(&cid).unwrap().state = ConnectionState::Active;

        let violations = check_all_invariants(&state);
        assert!(!violations.is_empty());
        assert!(violations
            .iter()
            .any(|v| v.invariant == "connection_consistency"));
    }

    #[test]
    fn test_detects_queue_signal_disagreement() {
        let mut state = loaded_state();
        let res = step(
            &mut state,
            -1,
            Request::Connect {
                sid: ECHO,
                version: 1,
            },
            0,
        );
        assert!(matches!(res.outcome, Outcome::Suspended(_)));

        // Drop the signal while the connect message is still queued.
        state
            .partitions
            .get_mut(&crate::types::PartitionId(1))
            .unwrap()
            .signals = SignalSet::empty();

        let violations = check_all_invariants(&state);
        assert!(!violations.is_empty());
        assert!(violations
            .iter()
            .any(|v| v.invariant == "signal_consistency"));
    }

    #[test]
    fn test_detects_stale_queue_entry() {
        let mut state = loaded_state();
        state
            .services
            .get_mut(&ECHO)
            .unwrap()
            .pending
            .push_back(MessageId(777));

        let violations = check_all_invariants(&state);
        assert!(!violations.is_empty());
        assert!(violations
            .iter()
            .any(|v| v.invariant == "message_consistency"));
    }

    #[test]
    fn test_detects_id_monotonicity_violation() {
        let mut state = loaded_state();
        let res = step(
            &mut state,
            -1,
            Request::Connect {
                sid: ECHO,
                version: 1,
            },
            0,
        );
        assert!(matches!(res.outcome, Outcome::Suspended(_)));

        // Manually break monotonicity
        state.next_message_id = 0;

        let violations = check_all_invariants(&state);
        assert!(!violations.is_empty());
        assert!(violations.iter().any(|v| v.invariant == "id_monotonicity"));
    }

    #[test]
    fn test_detects_multiple_violations() {
        let mut state = loaded_state();
        connect(&mut state, -1);

        // 1. Dangling handle
        state
            .handles
            .allocate(1, HandleTarget::Message(MessageId(888)))
            .unwrap();

        // 2. Stale queue entry
        state
            .services
            .get_mut(&ECHO)
            .unwrap()
            .pending
            .push_back(MessageId(777));

        // 3. Broken ID monotonicity
        state.next_connection_id = 0;

        let violations = check_all_invariants(&state);
        assert!(violations.len() >= 3);
        assert!(violations
            .iter()
            .any(|v| v.invariant == "handle_target_validity"));
        assert!(violations
            .iter()
            .any(|v| v.invariant == "message_consistency"));
        assert!(violations.iter().any(|v| v.invariant == "id_monotonicity"));
    }
}
