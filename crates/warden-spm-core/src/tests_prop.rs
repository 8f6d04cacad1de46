//! Property suites for the handle registry, vector access tracking, and
//! the step function.
//!
//! The step properties throw unconstrained request streams at a populated
//! state: whatever mix of valid and garbage traffic arrives, every
//! consistency invariant must hold after every single transition, and no
//! suspension ticket may resolve twice.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;

use proptest::prelude::*;

use warden_ipc::{CallControl, Handle, MessageKind, SignalSet, Status, Timeout};

use crate::handle::{HandleTable, HandleTarget};
use crate::invariants::check_all_invariants;
use crate::iovec::{InVec, IovecError, OutVec, VecAccess};
use crate::policy::FaultMode;
use crate::state::{IrqConfig, PartitionConfig, ServiceConfig, SpmState};
use crate::step::{step, Effect, Outcome, Request};
use crate::types::{
    ClientId, ConnectionId, IrqHandling, MessageId, PartitionId, ServiceId, SpmMessage,
    VersionPolicy,
};

// ============================================================================
// Fixtures and strategies
// ============================================================================

/// A delivered call message with one input payload and one output vector.
fn call_message(payload: Vec<u8>, capacity: usize) -> SpmMessage {
    let mut invecs: [InVec; warden_ipc::MAX_IOVEC] = Default::default();
    invecs[0] = InVec::new(payload);
    let mut outvecs: [OutVec; warden_ipc::MAX_IOVEC] = Default::default();
    outvecs[0] = OutVec::new(capacity);
    SpmMessage {
        id: MessageId(1),
        kind: MessageKind::Call(0),
        client: -1,
        service: ServiceId(0x40),
        connection: None,
        rhandle: 0,
        invecs,
        outvecs,
        access: VecAccess::new(),
        ticket: None,
        service_handle: None,
    }
}

/// Three partitions, three services: a strict connection-based service and
/// a relaxed bulk service on a panicking partition, a stateless service on
/// a lenient one, plus a lenient interrupt driver.
fn populated() -> SpmState {
    let mut state = SpmState::new();
    state
        .register_partition(PartitionConfig {
            id: 1,
            name: String::from("alpha"),
            fault_mode: FaultMode::Panic,
            irqs: Vec::new(),
        })
        .unwrap();
    state
        .register_partition(PartitionConfig {
            id: 2,
            name: String::from("driver"),
            fault_mode: FaultMode::Return,
            irqs: Vec::from([
                IrqConfig {
                    line: 33,
                    handling: IrqHandling::FirstLevel,
                },
                IrqConfig {
                    line: 47,
                    handling: IrqHandling::SecondLevel,
                },
            ]),
        })
        .unwrap();
    state
        .register_partition(PartitionConfig {
            id: 3,
            name: String::from("gamma"),
            fault_mode: FaultMode::Return,
            irqs: Vec::new(),
        })
        .unwrap();
    state
        .register_service(ServiceConfig {
            sid: 0x3e,
            name: String::from("strict"),
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
        .register_service(ServiceConfig {
            sid: 0x40,
            name: String::from("bulk"),
            partition: 1,
            version: 2,
            policy: VersionPolicy::Relaxed,
            connection_based: true,
            stateless: false,
            ns_accessible: true,
            mm_iovec: true,
        })
        .unwrap();
    state
        .register_service(ServiceConfig {
            sid: 0x41,
            name: String::from("oneshot"),
            partition: 3,
            version: 1,
            policy: VersionPolicy::Strict,
            connection_based: false,
            stateless: true,
            ns_accessible: true,
            mm_iovec: false,
        })
        .unwrap();
    state
}

fn arb_handle() -> impl Strategy<Value = Handle> {
    prop_oneof![
        Just(Handle::NULL),
        (0u8..6, 0u16..4).prop_map(|(index, generation)| Handle::from_parts(index, generation)),
        (0u8..4, 0u8..3).prop_map(|(index, version)| Handle::stateless(index, version)),
    ]
}

fn arb_signal() -> impl Strategy<Value = SignalSet> {
    prop_oneof![
        Just(SignalSet::DOORBELL),
        (0u32..4).prop_map(|slot| SignalSet::service(slot).unwrap()),
        (0u32..4).prop_map(|line| SignalSet::irq(line).unwrap()),
        any::<u32>().prop_map(SignalSet::from_bits_retain),
    ]
}

fn arb_status() -> impl Strategy<Value = Status> {
    prop_oneof![
        Just(Status::SUCCESS),
        Just(Status::CONNECTION_REFUSED),
        Just(Status::CONNECTION_BUSY),
        Just(Status::PROGRAMMER_ERROR),
        Just(Status::NOT_SUPPORTED),
        Just(Status::GENERIC_ERROR),
        (-200i32..10).prop_map(Status),
    ]
}

fn arb_client_request() -> impl Strategy<Value = Request> {
    prop_oneof![
        Just(Request::FrameworkVersion),
        (0x3du32..0x44).prop_map(|sid| Request::ServiceVersion { sid: ServiceId(sid) }),
        ((0x3du32..0x44), 0u32..4).prop_map(|(sid, version)| Request::Connect {
            sid: ServiceId(sid),
            version,
        }),
        (
            arb_handle(),
            0i16..3,
            prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 0..3),
            prop::collection::vec(0usize..24, 0..3),
        )
            .prop_map(|(handle, request, invecs, outvec_capacities)| Request::Call {
                handle,
                control: CallControl {
                    request,
                    invec_count: invecs.len() as u8,
                    outvec_count: outvec_capacities.len() as u8,
                },
                invecs,
                outvec_capacities,
            }),
        arb_handle().prop_map(|handle| Request::Close { handle }),
        (arb_signal(), any::<bool>()).prop_map(|(mask, block)| Request::Wait {
            mask,
            timeout: if block { Timeout::Block } else { Timeout::Poll },
        }),
        arb_signal().prop_map(|signal| Request::Get { signal }),
        (arb_handle(), arb_status())
            .prop_map(|(handle, status)| Request::Reply { handle, status }),
    ]
}

fn arb_vector_request() -> impl Strategy<Value = Request> {
    prop_oneof![
        (arb_handle(), 0usize..5, 0usize..64).prop_map(|(handle, invec_idx, max_bytes)| {
            Request::Read {
                handle,
                invec_idx,
                max_bytes,
            }
        }),
        (arb_handle(), 0usize..5, 0usize..64).prop_map(|(handle, invec_idx, num_bytes)| {
            Request::Skip {
                handle,
                invec_idx,
                num_bytes,
            }
        }),
        (
            arb_handle(),
            0usize..5,
            prop::collection::vec(any::<u8>(), 0..24)
        )
            .prop_map(|(handle, outvec_idx, data)| Request::Write {
                handle,
                outvec_idx,
                data,
            }),
        (arb_handle(), any::<u64>())
            .prop_map(|(handle, rhandle)| Request::SetRhandle { handle, rhandle }),
        (arb_handle(), 0usize..5)
            .prop_map(|(handle, invec_idx)| Request::MapInvec { handle, invec_idx }),
        (arb_handle(), 0usize..5)
            .prop_map(|(handle, invec_idx)| Request::UnmapInvec { handle, invec_idx }),
        (arb_handle(), 0usize..5)
            .prop_map(|(handle, outvec_idx)| Request::MapOutvec { handle, outvec_idx }),
        (
            arb_handle(),
            0usize..5,
            0usize..40,
            prop::collection::vec(any::<u8>(), 0..40)
        )
            .prop_map(|(handle, outvec_idx, len, data)| Request::UnmapOutvec {
                handle,
                outvec_idx,
                len,
                data,
            }),
    ]
}

fn arb_partition_request() -> impl Strategy<Value = Request> {
    prop_oneof![
        3 => (-1i32..5).prop_map(|p| Request::Notify {
            partition: PartitionId(p),
        }),
        3 => Just(Request::Clear),
        3 => arb_signal().prop_map(|signal| Request::IrqEnable { signal }),
        3 => arb_signal().prop_map(|signal| Request::IrqDisable { signal }),
        3 => arb_signal().prop_map(|signal| Request::ResetSignal { signal }),
        3 => arb_signal().prop_map(|signal| Request::Eoi { signal }),
        1 => Just(Request::Panic),
    ]
}

fn arb_request() -> impl Strategy<Value = Request> {
    prop_oneof![
        4 => arb_client_request(),
        4 => arb_vector_request(),
        2 => arb_partition_request(),
    ]
}

fn arb_caller() -> impl Strategy<Value = ClientId> {
    prop_oneof![
        Just(-2),
        Just(-1),
        Just(1),
        Just(2),
        Just(3),
        // Unknown secure ids must bounce without damage too.
        Just(9),
    ]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn handle_allocations_are_distinct(count in 1usize..=64, owner in -2i32..4) {
        let mut table = HandleTable::new();
        let mut seen = BTreeSet::new();
        for i in 0..count {
            let handle = table
                .allocate(owner, HandleTarget::Message(MessageId(i as u64)))
                .unwrap();
            prop_assert!(!handle.is_null());
            prop_assert!(!handle.is_stateless());
            prop_assert!(seen.insert(handle.raw()));
        }
        prop_assert_eq!(table.live_count(), count);
    }

    #[test]
    fn handle_release_invalidates_the_old_generation(owner in -2i32..4, mid in any::<u64>()) {
        let mut table = HandleTable::new();
        let first = table
            .allocate(owner, HandleTarget::Message(MessageId(mid)))
            .unwrap();
        table.release(first, owner).unwrap();
        prop_assert!(table.resolve(first, owner).is_err());

        // The slot comes back under a fresh generation; the old wire value
        // stays dead.
        let second = table
            .allocate(owner, HandleTarget::Connection(ConnectionId(mid)))
            .unwrap();
        prop_assert_eq!(second.index(), first.index());
        prop_assert_ne!(second.raw(), first.raw());
        prop_assert!(table.resolve(first, owner).is_err());
        prop_assert!(table.resolve(second, owner).is_ok());
    }

    #[test]
    fn handle_resolution_enforces_ownership(owner in 1i32..4, other in -3i32..0) {
        let mut table = HandleTable::new();
        let handle = table
            .allocate(owner, HandleTarget::Message(MessageId(7)))
            .unwrap();
        prop_assert!(table.resolve(handle, owner).is_ok());
        prop_assert!(table.resolve(handle, other).is_err());
        prop_assert!(table.release(handle, other).is_err());
        prop_assert!(table.release(handle, owner).is_ok());
    }

    #[test]
    fn chunked_reads_reassemble_the_payload(
        payload in prop::collection::vec(any::<u8>(), 0..256),
        chunks in prop::collection::vec(1usize..64, 0..24),
    ) {
        let mut msg = call_message(payload.clone(), 0);
        let mut collected = Vec::new();
        for max in chunks {
            collected.extend(msg.read_invec(0, max).unwrap());
        }
        let tail = msg.read_invec(0, payload.len().max(1)).unwrap();
        collected.extend(tail);
        prop_assert_eq!(collected, payload);
    }

    #[test]
    fn skip_and_read_share_one_cursor(
        payload in prop::collection::vec(any::<u8>(), 0..200),
        ops in prop::collection::vec((any::<bool>(), 1usize..48), 0..24),
    ) {
        let mut msg = call_message(payload.clone(), 0);
        let mut cursor = 0usize;
        for (skip, n) in ops {
            let left = payload.len() - cursor;
            if skip {
                let advanced = msg.skip_invec(0, n).unwrap();
                prop_assert_eq!(advanced, n.min(left));
                cursor += advanced;
            } else {
                let bytes = msg.read_invec(0, n).unwrap();
                prop_assert_eq!(bytes.len(), n.min(left));
                prop_assert_eq!(&bytes[..], &payload[cursor..cursor + bytes.len()]);
                cursor += bytes.len();
            }
        }
    }

    #[test]
    fn writes_commit_exactly_what_fits(
        capacity in 0usize..128,
        writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..48), 0..12),
    ) {
        let mut msg = call_message(Vec::new(), capacity);
        let mut model: Vec<u8> = Vec::new();
        for data in writes {
            if model.len() + data.len() <= capacity {
                prop_assert!(msg.write_outvec(0, &data).is_ok());
                model.extend_from_slice(&data);
            } else {
                // A rejected write commits nothing.
                prop_assert_eq!(msg.write_outvec(0, &data), Err(IovecError::CapacityExceeded));
            }
        }
        prop_assert_eq!(msg.outvecs[0].take(), model);
    }

    #[test]
    fn random_request_streams_never_corrupt_state(
        ops in prop::collection::vec((arb_caller(), arb_request()), 1..50),
    ) {
        let mut state = populated();
        let mut issued = BTreeSet::new();
        let mut completed = BTreeSet::new();
        for (tick, (caller, request)) in ops.into_iter().enumerate() {
            let result = step(&mut state, caller, request, tick as u64);
            if let Outcome::Suspended(ticket) = result.outcome {
                issued.insert(ticket);
            }
            for effect in &result.effects {
                if let Effect::Complete(ticket, _) = effect {
                    prop_assert!(issued.contains(ticket), "completion for an unissued ticket");
                    prop_assert!(completed.insert(*ticket), "ticket completed twice");
                }
            }
            let violations = check_all_invariants(&state);
            prop_assert!(violations.is_empty(), "invariants violated: {:?}", violations);
        }
    }
}
