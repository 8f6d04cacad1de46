//! Manager state
//!
//! Central state for the partition manager core: static partition and
//! service tables built from the manifest, plus the dynamic connection,
//! message, and handle tables the state machine mutates. Everything here is
//! deterministic data; the hosting runtime owns locking, scheduling, and
//! time.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use warden_ipc::{
    Handle, SignalSet, IRQ_SIGNAL_COUNT, MAX_STATELESS_SERVICES, SERVICE_SIGNAL_COUNT,
};

use crate::handle::HandleTable;
use crate::policy::FaultMode;
use crate::types::{
    ClientId, CompletionTicket, Connection, ConnectionId, IrqHandling, IrqLine, MessageId,
    Partition, PartitionId, PartitionMetrics, RunState, Service, ServiceId, ServiceMetrics,
    SpmMessage, SpmMetrics, VersionPolicy,
};

// ============================================================================
// Manifest configuration
// ============================================================================

/// Interrupt binding declared by a partition manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IrqConfig {
    /// Platform interrupt line number.
    pub line: u32,
    /// Completion model for the bound line.
    pub handling: IrqHandling,
}

/// One partition entry from the manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition id, strictly positive.
    pub id: i32,
    /// Human-readable name.
    pub name: String,
    /// Disposition of fatal statuses charged to this partition.
    pub fault_mode: FaultMode,
    /// Interrupt lines bound to this partition, in slot order.
    #[serde(default)]
    pub irqs: Vec<IrqConfig>,
}

/// One service entry from the manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 32-bit service id.
    pub sid: u32,
    /// Human-readable name.
    pub name: String,
    /// Owning partition id.
    pub partition: i32,
    /// Provided version, nonzero.
    pub version: u32,
    /// Version negotiation policy.
    pub policy: VersionPolicy,
    /// Accepts connect/close. Mutually exclusive with `stateless`.
    #[serde(default)]
    pub connection_based: bool,
    /// Reachable through a pre-published stateless handle.
    #[serde(default)]
    pub stateless: bool,
    /// Whether non-secure clients may reach this service.
    #[serde(default)]
    pub ns_accessible: bool,
    /// Whether the service may map vectors instead of copying.
    #[serde(default)]
    pub mm_iovec: bool,
}

/// Manifest validation failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Partition ids must be strictly positive.
    InvalidPartitionId(i32),
    /// Partition id registered twice.
    DuplicatePartition(PartitionId),
    /// Service names a partition that was never registered.
    UnknownPartition(PartitionId),
    /// Service id registered twice.
    DuplicateService(ServiceId),
    /// A service must be exactly one of connection-based or stateless.
    ConflictingServiceKind(ServiceId),
    /// Version zero is reserved, and stateless versions must fit the
    /// handle encoding.
    InvalidVersion(ServiceId),
    /// Partition exceeded its service signal range.
    TooManyServiceSignals(PartitionId),
    /// Stateless handle table is full.
    TooManyStatelessServices,
    /// Partition exceeded its irq signal range.
    TooManyIrqLines(PartitionId),
    /// Interrupt line bound twice (lines are global).
    DuplicateIrqLine(u32),
}

// ============================================================================
// Manager state
// ============================================================================

/// The complete state of the partition manager.
#[derive(Debug, PartialEq)]
pub struct SpmState {
    /// Partition table, fixed after manifest loading.
    pub partitions: BTreeMap<PartitionId, Partition>,
    /// Service table, fixed after manifest loading apart from queues.
    pub services: BTreeMap<ServiceId, Service>,
    /// Stateless handle table: index to service.
    pub stateless: [Option<ServiceId>; MAX_STATELESS_SERVICES],
    /// Live connections.
    pub connections: BTreeMap<ConnectionId, Connection>,
    /// In-flight messages, queued or delivered.
    pub messages: BTreeMap<MessageId, SpmMessage>,
    /// Handle registry.
    pub handles: HandleTable,
    /// Next connection id to allocate.
    pub next_connection_id: u64,
    /// Next message id to allocate.
    pub next_message_id: u64,
    /// Next completion ticket to allocate.
    pub next_ticket: u64,
}

impl SpmState {
    /// Create an empty manager state.
    pub fn new() -> Self {
        Self {
            partitions: BTreeMap::new(),
            services: BTreeMap::new(),
            stateless: [None; MAX_STATELESS_SERVICES],
            connections: BTreeMap::new(),
            messages: BTreeMap::new(),
            handles: HandleTable::new(),
            next_connection_id: 1,
            next_message_id: 1,
            next_ticket: 1,
        }
    }

    /// Register a partition from its manifest entry.
    pub fn register_partition(&mut self, cfg: PartitionConfig) -> Result<(), ConfigError> {
        if cfg.id <= 0 {
            return Err(ConfigError::InvalidPartitionId(cfg.id));
        }
        let id = PartitionId(cfg.id);
        if self.partitions.contains_key(&id) {
            return Err(ConfigError::DuplicatePartition(id));
        }
        if cfg.irqs.len() > IRQ_SIGNAL_COUNT as usize {
            return Err(ConfigError::TooManyIrqLines(id));
        }
        for irq in &cfg.irqs {
            if self.irq_owner(irq.line).is_some()
                || cfg.irqs.iter().filter(|i| i.line == irq.line).count() > 1
            {
                return Err(ConfigError::DuplicateIrqLine(irq.line));
            }
        }

        let mut valid = SignalSet::empty();
        if cfg!(feature = "doorbell") {
            valid |= SignalSet::DOORBELL;
        }
        let mut irqs = Vec::with_capacity(cfg.irqs.len());
        for (slot, irq) in cfg.irqs.iter().enumerate() {
            let slot = slot as u32;
            // Bounded by the length check above.
            if let Some(bit) = SignalSet::irq(slot) {
                valid |= bit;
            }
            irqs.push(IrqLine {
                line: irq.line,
                slot,
                handling: irq.handling,
                enabled: false,
            });
        }

        self.partitions.insert(
            id,
            Partition {
                id,
                name: cfg.name,
                fault_mode: cfg.fault_mode,
                signals: SignalSet::empty(),
                valid_signals: valid,
                run_state: RunState::Ready,
                irqs,
                metrics: PartitionMetrics::default(),
                service_slots: 0,
            },
        );
        Ok(())
    }

    /// Register a service from its manifest entry. The owning partition
    /// must already be registered.
    pub fn register_service(&mut self, cfg: ServiceConfig) -> Result<(), ConfigError> {
        let sid = ServiceId(cfg.sid);
        let pid = PartitionId(cfg.partition);
        if self.services.contains_key(&sid) {
            return Err(ConfigError::DuplicateService(sid));
        }
        if cfg.connection_based == cfg.stateless {
            return Err(ConfigError::ConflictingServiceKind(sid));
        }
        if cfg.version == 0 || (cfg.stateless && cfg.version > u8::MAX as u32) {
            return Err(ConfigError::InvalidVersion(sid));
        }
        let partition = self
            .partitions
            .get_mut(&pid)
            .ok_or(ConfigError::UnknownPartition(pid))?;

        let slot = partition.service_slots;
        if slot >= SERVICE_SIGNAL_COUNT {
            return Err(ConfigError::TooManyServiceSignals(pid));
        }

        let stateless_index = if cfg.stateless {
            let index = self
                .stateless
                .iter()
                .position(|s| s.is_none())
                .ok_or(ConfigError::TooManyStatelessServices)?;
            self.stateless[index] = Some(sid);
            Some(index as u8)
        } else {
            None
        };

        partition.service_slots += 1;
        if let Some(bit) = SignalSet::service(slot) {
            partition.valid_signals |= bit;
        }

        self.services.insert(
            sid,
            Service {
                sid,
                name: cfg.name,
                partition: pid,
                version: cfg.version,
                policy: cfg.policy,
                connection_based: cfg.connection_based,
                stateless_index,
                ns_accessible: cfg.ns_accessible,
                mm_iovec: cfg.mm_iovec,
                signal_slot: slot,
                pending: Default::default(),
                metrics: ServiceMetrics::default(),
            },
        );
        Ok(())
    }

    // ========================================================================
    // Read-only accessors
    // ========================================================================

    /// Look up a partition.
    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    /// Look up a service.
    pub fn service(&self, sid: ServiceId) -> Option<&Service> {
        self.services.get(&sid)
    }

    /// Look up a connection.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Look up a message.
    pub fn message(&self, id: MessageId) -> Option<&SpmMessage> {
        self.messages.get(&id)
    }

    /// The published handle for a stateless service, if it has one.
    pub fn stateless_handle(&self, sid: ServiceId) -> Option<Handle> {
        let service = self.services.get(&sid)?;
        let index = service.stateless_index?;
        Some(Handle::stateless(index, service.version as u8))
    }

    /// The service owned by `partition` whose signal bit sits at `slot`.
    pub fn service_by_signal(&self, partition: PartitionId, slot: u32) -> Option<ServiceId> {
        self.services
            .values()
            .find(|s| s.partition == partition && s.signal_slot == slot)
            .map(|s| s.sid)
    }

    /// The partition owning an interrupt line, if any.
    pub fn irq_owner(&self, line: u32) -> Option<PartitionId> {
        self.partitions
            .values()
            .find(|p| p.irq_line(line).is_some())
            .map(|p| p.id)
    }

    /// Fault mode of a caller. The non-secure world always runs in return
    /// mode; unknown ids also resolve to return mode, the dispatch layer
    /// rejects them before classification matters.
    pub fn fault_mode_of(&self, client: ClientId) -> FaultMode {
        if client < 0 {
            return FaultMode::Return;
        }
        match self.partitions.get(&PartitionId(client)) {
            Some(p) => p.fault_mode,
            None => FaultMode::Return,
        }
    }

    /// Whether a client can still observe a completion.
    pub fn client_is_alive(&self, client: ClientId) -> bool {
        if client < 0 {
            return true;
        }
        self.partitions
            .get(&PartitionId(client))
            .map(|p| p.is_alive())
            .unwrap_or(false)
    }

    /// System-wide metrics snapshot.
    pub fn metrics(&self) -> SpmMetrics {
        SpmMetrics {
            partition_count: self.partitions.len(),
            service_count: self.services.len(),
            connection_count: self.connections.len(),
            message_count: self.messages.len(),
            handle_count: self.handles.live_count(),
            total_messages: self.services.values().map(|s| s.metrics.total_messages).sum(),
        }
    }

    /// Stamp the caller's activity time. No-op for non-secure callers and
    /// unknown ids.
    pub fn update_caller_metrics(&mut self, caller: ClientId, timestamp: u64) {
        if caller > 0 {
            if let Some(p) = self.partitions.get_mut(&PartitionId(caller)) {
                p.metrics.last_active_ns = timestamp;
            }
        }
    }

    // ========================================================================
    // Id allocation
    // ========================================================================

    /// Allocate a connection id.
    pub fn alloc_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        id
    }

    /// Allocate a message id.
    pub fn alloc_message_id(&mut self) -> MessageId {
        let id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        id
    }

    /// Allocate a completion ticket.
    pub fn alloc_ticket(&mut self) -> CompletionTicket {
        let t = CompletionTicket(self.next_ticket);
        self.next_ticket += 1;
        t
    }
}

impl Default for SpmState {
    fn default() -> Self {
        Self::new()
    }
}
