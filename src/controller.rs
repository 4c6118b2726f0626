//! Controller records.
//!
//! A controller is the aggregate owning one connected set of parts. Like
//! `Part`, the record is data plus a few pure helpers; the merge/split state
//! machine is driven by `MultiblockRegistry`, which owns every controller.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::machine::MachineKind;
use crate::part::PartId;
use crate::position::BlockPos;

/// Unique identifier for a controller within one registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct ControllerId(pub u32);

/// Assembly state of a controller.
///
/// The membership machinery only moves between `Empty`, `Partial` and
/// `Disassembling`; the predicate that promotes a structure to `Assembled`
/// belongs to a separate validation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    /// No parts; pending destruction.
    Empty,
    /// Parts present, structure not validated as a complete machine.
    Partial,
    /// Structure validated by the assembly layer.
    Assembled,
    /// Being torn down.
    Disassembling,
}

/// A live controller record.
#[derive(Debug)]
pub struct Controller {
    pub(crate) id: ControllerId,
    pub(crate) kind: MachineKind,
    pub(crate) parts: FxHashSet<PartId>,
    /// Minimum member position (lexicographic). Stable identity used for
    /// deterministic merge ordering; recomputed whenever membership changes.
    pub(crate) reference_pos: Option<BlockPos>,
    pub(crate) machine_state: MachineState,
    pub(crate) active: bool,
    pub(crate) save_delegate: Option<PartId>,
    /// Opaque aggregate state, written and read by the host machine logic.
    pub(crate) machine_data: Vec<u8>,
}

impl Controller {
    pub(crate) fn new(id: ControllerId, kind: MachineKind) -> Self {
        Self {
            id,
            kind,
            parts: FxHashSet::default(),
            reference_pos: None,
            machine_state: MachineState::Empty,
            active: false,
            save_delegate: None,
            machine_data: Vec::new(),
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn contains(&self, part: PartId) -> bool {
        self.parts.contains(&part)
    }

    pub fn parts(&self) -> impl Iterator<Item = PartId> + '_ {
        self.parts.iter().copied()
    }

    pub fn reference_pos(&self) -> Option<BlockPos> {
        self.reference_pos
    }

    pub fn machine_state(&self) -> MachineState {
        self.machine_state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn save_delegate(&self) -> Option<PartId> {
        self.save_delegate
    }

    pub fn machine_data(&self) -> &[u8] {
        &self.machine_data
    }

    /// Strict total order used during merge discovery: does `self` consume
    /// `other`? Larger membership wins; ties break toward the smaller
    /// reference position. Reference positions are unique across
    /// controllers, so two distinct controllers never tie.
    pub fn should_consume(&self, other: &Controller) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.parts.len() != other.parts.len() {
            return self.parts.len() > other.parts.len();
        }
        match (self.reference_pos, other.reference_pos) {
            (Some(a), Some(b)) => a < b,
            (Some(_), None) => true,
            _ => false,
        }
    }
}
