//! Multiblock attachment and controller consolidation.
//!
//! Independently placed parts discover each other through 6-adjacency and
//! consolidate into a single logical controller per connected component.
//! Placing a part between two existing machines merges them; removing or
//! unloading parts splits or tears machines down cleanly. The
//! `MultiblockRegistry` is the per-world entry point for all of it.

// Constants module
pub mod constants;

// Core data types
pub mod controller;
pub mod error;
pub mod machine;
pub mod part;
pub mod position;

// Membership machinery
pub mod oracle;
pub mod registry;
pub mod snapshot;

pub use controller::{Controller, ControllerId, MachineState};
pub use error::{MultiblockError, MultiblockResult};
pub use machine::{MachineHooks, MachineKind, MachineKindRegistration, MachineKindRegistry};
pub use oracle::{AllLoaded, ChunkOracle, LoadedSet};
pub use part::{Part, PartId, PartSpawn, StructuralCaps};
pub use position::{BlockPos, ChunkPos};
pub use registry::MultiblockRegistry;
pub use snapshot::ControllerSnapshot;
