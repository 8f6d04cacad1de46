//! Manifest-driven construction
//!
//! Partition and service tables are fixed before the manager starts.
//! This module carries the serde-facing deployment description and turns
//! it into populated state tables.

use serde::{Deserialize, Serialize};
use warden_spm_core::{ConfigError, PartitionConfig, ServiceConfig, SpmState};

/// Deployment description: every partition the manager hosts and every
/// RoT Service they expose.
///
/// Partitions register first, in listed order; services follow, each
/// naming an already-listed owning partition. Signal slots are assigned
/// by listing order, so the first service of a partition owns service
/// signal bit 0, and the first bound interrupt line owns interrupt
/// signal bit 0.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Hosted partitions.
    pub partitions: Vec<PartitionConfig>,
    /// RoT Services, each owned by a listed partition.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl Manifest {
    /// Empty manifest, for builder-style construction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a partition entry.
    pub fn partition(mut self, cfg: PartitionConfig) -> Self {
        self.partitions.push(cfg);
        self
    }

    /// Append a service entry.
    pub fn service(mut self, cfg: ServiceConfig) -> Self {
        self.services.push(cfg);
        self
    }

    /// Build the state tables this manifest describes.
    pub fn build(&self) -> Result<SpmState, ConfigError> {
        let mut state = SpmState::new();
        for partition in &self.partitions {
            state.register_partition(partition.clone())?;
        }
        for service in &self.services {
            state.register_service(service.clone())?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_spm_core::{FaultMode, IrqConfig, IrqHandling, PartitionId, ServiceId, VersionPolicy};

    fn sample() -> Manifest {
        Manifest::new()
            .partition(PartitionConfig {
                id: 1,
                name: "crypto".to_string(),
                fault_mode: FaultMode::Panic,
                irqs: vec![IrqConfig {
                    line: 33,
                    handling: IrqHandling::FirstLevel,
                }],
            })
            .service(ServiceConfig {
                sid: 0x40,
                name: "crypto-api".to_string(),
                partition: 1,
                version: 1,
                policy: VersionPolicy::Strict,
                connection_based: true,
                stateless: false,
                ns_accessible: true,
                mm_iovec: false,
            })
    }

    #[test]
    fn test_build_populates_tables() {
        let state = sample().build().expect("manifest is valid");

        assert_eq!(state.partitions.len(), 1);
        assert_eq!(state.services.len(), 1);
        let svc = state.services.get(&ServiceId(0x40)).expect("registered");
        assert_eq!(svc.partition, PartitionId(1));
        assert_eq!(svc.version, 1);
    }

    #[test]
    fn test_build_rejects_service_without_partition() {
        let manifest = Manifest::new().service(ServiceConfig {
            sid: 0x41,
            name: "orphan".to_string(),
            partition: 9,
            version: 1,
            policy: VersionPolicy::Strict,
            connection_based: true,
            stateless: false,
            ns_accessible: false,
            mm_iovec: false,
        });

        assert_eq!(
            manifest.build(),
            Err(ConfigError::UnknownPartition(PartitionId(9)))
        );
    }

    #[test]
    fn test_json_round_trip() {
        let manifest = sample();
        let json = serde_json::to_string(&manifest).expect("serializes");
        let parsed: Manifest = serde_json::from_str(&json).expect("parses back");

        assert_eq!(parsed.partitions.len(), manifest.partitions.len());
        assert_eq!(parsed.services.len(), manifest.services.len());
        parsed.build().expect("round-tripped manifest still builds");
    }

    #[test]
    fn test_parses_deployment_json() {
        // Optional service flags may be omitted entirely.
        let json = r#"{
            "partitions": [
                { "id": 1, "name": "storage", "fault_mode": "Return" },
                { "id": 2, "name": "driver", "fault_mode": "Panic",
                  "irqs": [ { "line": 47, "handling": "SecondLevel" } ] }
            ],
            "services": [
                { "sid": 64, "name": "blob", "partition": 1, "version": 2,
                  "policy": "Relaxed", "connection_based": true,
                  "ns_accessible": true }
            ]
        }"#;

        let manifest: Manifest = serde_json::from_str(json).expect("parses");
        let state = manifest.build().expect("builds");

        assert_eq!(state.partitions.len(), 2);
        let svc = state.services.get(&ServiceId(64)).expect("registered");
        assert!(svc.connection_based);
        assert!(!svc.mm_iovec);
        let driver = state.partitions.get(&PartitionId(2)).expect("registered");
        assert_eq!(driver.irqs.len(), 1);
        assert_eq!(driver.irqs[0].line, 47);
    }
}
