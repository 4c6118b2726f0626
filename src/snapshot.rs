//! Controller aggregate snapshots.
//!
//! One envelope serves both persistence and network sync: the save delegate
//! serializes the controller's aggregate state into this form, and observers
//! or a later session decode it back. Encoding uses bincode over serde.

use serde::{Deserialize, Serialize};

use crate::controller::MachineState;
use crate::error::MultiblockResult;

/// Serialized form of a controller's aggregate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    /// Registered machine kind name. Kind tags are per-session, so the wire
    /// form carries the stable name instead.
    pub kind: String,
    pub machine_state: MachineState,
    /// Opaque machine-specific payload.
    pub machine_data: Vec<u8>,
}

impl ControllerSnapshot {
    pub fn encode(&self) -> MultiblockResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> MultiblockResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_survives_encoding() {
        let snapshot = ControllerSnapshot {
            kind: "test:boiler".to_string(),
            machine_state: MachineState::Partial,
            machine_data: vec![0xde, 0xad, 0xbe, 0xef],
        };

        let bytes = snapshot.encode().unwrap();
        assert_eq!(ControllerSnapshot::decode(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        assert!(ControllerSnapshot::decode(&[0xff; 3]).is_err());
    }
}
