//! Multiblock Error Handling
//!
//! Provides error types for host-facing registry operations. Internal
//! inconsistencies (a part that should already be detached, a snapshot that
//! fails to replay) are repaired in place and logged, never raised. The
//! surrounding simulation must not crash on a transient spatial
//! inconsistency.

use crate::controller::ControllerId;
use crate::machine::MachineKind;
use crate::part::PartId;
use crate::position::BlockPos;

/// Multiblock-specific result type
pub type MultiblockResult<T> = Result<T, MultiblockError>;

#[derive(Debug, thiserror::Error)]
pub enum MultiblockError {
    #[error("unknown part {0:?}")]
    UnknownPart(PartId),

    #[error("unknown controller {0:?}")]
    UnknownController(ControllerId),

    #[error("unknown machine kind {0:?}")]
    UnknownKind(MachineKind),

    #[error("machine kind '{0}' is already registered")]
    KindAlreadyRegistered(String),

    #[error("a part already occupies {0}")]
    PositionOccupied(BlockPos),

    #[error("snapshot codec error: {0}")]
    SnapshotCodec(#[from] bincode::Error),

    #[error("snapshot carries machine kind '{found}', expected '{expected}'")]
    SnapshotKindMismatch { expected: String, found: String },
}
