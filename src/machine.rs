//! Machine kind registration.
//!
//! Every multiblock machine kind registers once per world/session and gets a
//! `MachineKind` tag back. The merge logic only ever compares tags: parts of
//! different kinds never join the same controller, even when physically
//! adjacent. Each registration also supplies the machine's outward callback
//! surface (`MachineHooks`).

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::controller::ControllerId;
use crate::error::{MultiblockError, MultiblockResult};

/// Compatibility tag for a registered machine kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MachineKind(pub u16);

/// Callbacks a machine kind receives from the membership machinery.
///
/// All methods default to no-ops; what a machine does once assembled is a
/// collaborator concern, not part of this core.
pub trait MachineHooks {
    /// The controller's structure was validated as a complete machine.
    fn on_machine_assembled(&mut self, controller: ControllerId) {
        let _ = controller;
    }

    /// A previously assembled controller lost its validated structure.
    fn on_machine_broken(&mut self, controller: ControllerId) {
        let _ = controller;
    }

    fn on_machine_activated(&mut self, controller: ControllerId) {
        let _ = controller;
    }

    fn on_machine_deactivated(&mut self, controller: ControllerId) {
        let _ = controller;
    }

    /// An observer-side instance finished loading aggregate state that was
    /// replicated from the authoritative instance.
    fn on_snapshot_loaded(&mut self, controller: ControllerId) {
        let _ = controller;
    }
}

/// Machine kind registration record
pub struct MachineKindRegistration {
    pub kind: MachineKind,
    pub name: String,
}

/// Registry of machine kinds known to one world/session.
pub struct MachineKindRegistry {
    hooks: FxHashMap<MachineKind, Box<dyn MachineHooks>>,
    name_to_kind: FxHashMap<String, MachineKind>,
    registrations: Vec<MachineKindRegistration>,
    next_kind: u16,
}

impl MachineKindRegistry {
    pub fn new() -> Self {
        Self {
            hooks: FxHashMap::default(),
            name_to_kind: FxHashMap::default(),
            registrations: Vec::new(),
            next_kind: 0,
        }
    }

    /// Register a machine kind under a unique name.
    pub fn register(
        &mut self,
        name: &str,
        hooks: Box<dyn MachineHooks>,
    ) -> MultiblockResult<MachineKind> {
        if self.name_to_kind.contains_key(name) {
            return Err(MultiblockError::KindAlreadyRegistered(name.to_string()));
        }

        let kind = MachineKind(self.next_kind);
        self.next_kind += 1;

        self.hooks.insert(kind, hooks);
        self.name_to_kind.insert(name.to_string(), kind);
        self.registrations.push(MachineKindRegistration {
            kind,
            name: name.to_string(),
        });

        log::debug!("[MachineKindRegistry] Registered kind '{}' as {:?}", name, kind);
        Ok(kind)
    }

    pub fn kind_of(&self, name: &str) -> Option<MachineKind> {
        self.name_to_kind.get(name).copied()
    }

    pub fn name_of(&self, kind: MachineKind) -> Option<&str> {
        self.registrations
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.name.as_str())
    }

    pub fn hooks_mut(&mut self, kind: MachineKind) -> Option<&mut (dyn MachineHooks + 'static)> {
        self.hooks.get_mut(&kind).map(|h| &mut **h)
    }

    pub fn registrations(&self) -> &[MachineKindRegistration] {
        &self.registrations
    }

    pub fn is_registered(&self, kind: MachineKind) -> bool {
        self.hooks.contains_key(&kind)
    }
}

impl Default for MachineKindRegistry {
    fn default() -> Self {
        Self::new()
    }
}
