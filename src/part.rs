//! Part records.
//!
//! A part is one spatial unit that can attach to a controller. The record
//! here is pure data; the attachment protocol itself lives in
//! `MultiblockRegistry`, which owns every part for its world.

use serde::{Deserialize, Serialize};

use crate::controller::ControllerId;
use crate::machine::MachineKind;
use crate::position::BlockPos;

/// Unique identifier for a part within one registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct PartId(pub u32);

/// Structural suitability flags, queried by the assembly-validation layer
/// when it decides whether a structure forms a complete machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralCaps {
    pub frame: bool,
    pub sides: bool,
    pub top: bool,
    pub bottom: bool,
    pub interior: bool,
}

impl StructuralCaps {
    /// A part usable anywhere in a structure.
    pub const fn any() -> Self {
        Self {
            frame: true,
            sides: true,
            top: true,
            bottom: true,
            interior: true,
        }
    }
}

/// Everything the host supplies when a part becomes live.
#[derive(Debug, Clone)]
pub struct PartSpawn {
    pub pos: BlockPos,
    pub kind: MachineKind,
    pub caps: StructuralCaps,
    /// Aggregate state read from persistence before the part was live. Held
    /// until a controller exists, then replayed exactly once.
    pub persisted: Option<Vec<u8>>,
}

impl PartSpawn {
    pub fn new(pos: BlockPos, kind: MachineKind) -> Self {
        Self {
            pos,
            kind,
            caps: StructuralCaps::any(),
            persisted: None,
        }
    }

    pub fn with_caps(mut self, caps: StructuralCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_persisted(mut self, data: Vec<u8>) -> Self {
        self.persisted = Some(data);
        self
    }
}

/// A live part record.
#[derive(Debug, Clone)]
pub struct Part {
    pub(crate) pos: BlockPos,
    pub(crate) kind: MachineKind,
    pub(crate) controller: Option<ControllerId>,
    /// Scratch flag for a single graph traversal; reset before and after
    /// each pass.
    pub(crate) visited: bool,
    /// At most one part per controller holds this; aggregate state is
    /// written through it.
    pub(crate) save_delegate: bool,
    /// True while a controller swap is in flight, to suppress premature
    /// side effects.
    pub(crate) paused_for_replacement: bool,
    pub(crate) caps: StructuralCaps,
    /// Snapshot bytes that arrived before a controller existed; replayed
    /// exactly once upon attachment.
    pub(crate) cached_snapshot: Option<Vec<u8>>,
}

impl Part {
    pub(crate) fn new(spawn: PartSpawn) -> Self {
        Self {
            pos: spawn.pos,
            kind: spawn.kind,
            controller: None,
            visited: false,
            save_delegate: false,
            paused_for_replacement: false,
            caps: spawn.caps,
            cached_snapshot: spawn.persisted,
        }
    }

    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    pub fn controller(&self) -> Option<ControllerId> {
        self.controller
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_some()
    }

    pub fn is_save_delegate(&self) -> bool {
        self.save_delegate
    }

    pub fn is_paused(&self) -> bool {
        self.paused_for_replacement
    }

    pub fn caps(&self) -> StructuralCaps {
        self.caps
    }

    /// Snapshot bytes still waiting for a controller to replay into.
    pub fn cached_snapshot(&self) -> Option<&[u8]> {
        self.cached_snapshot.as_deref()
    }
}
