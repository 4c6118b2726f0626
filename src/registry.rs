//! Multiblock registry.
//!
//! The registry is the per-world context object that owns every live part
//! and controller, keyed by id, with spatial indexes by block position and
//! by chunk. All lifecycle entry points the host must call live here:
//! `on_part_added` when a part becomes safely queryable, `on_part_removed`
//! when one is deliberately removed, and `on_chunk_unload` when a chunk is
//! going away.
//!
//! Everything runs on one logical thread per world instance; every mutating
//! entry point takes `&mut self` and each batch runs to completion before
//! the next begins.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::controller::{Controller, ControllerId, MachineState};
use crate::error::{MultiblockError, MultiblockResult};
use crate::machine::{MachineHooks, MachineKind, MachineKindRegistry};
use crate::oracle::ChunkOracle;
use crate::part::{Part, PartId, PartSpawn};
use crate::position::{BlockPos, ChunkPos};
use crate::snapshot::ControllerSnapshot;

/// Per-world index of all live parts and controllers.
pub struct MultiblockRegistry {
    kinds: MachineKindRegistry,
    parts: FxHashMap<PartId, Part>,
    controllers: FxHashMap<ControllerId, Controller>,
    by_pos: FxHashMap<BlockPos, PartId>,
    by_chunk: FxHashMap<ChunkPos, FxHashSet<PartId>>,
    next_part: u32,
    next_controller: u32,
}

impl MultiblockRegistry {
    pub fn new() -> Self {
        Self {
            kinds: MachineKindRegistry::new(),
            parts: FxHashMap::default(),
            controllers: FxHashMap::default(),
            by_pos: FxHashMap::default(),
            by_chunk: FxHashMap::default(),
            next_part: 0,
            next_controller: 0,
        }
    }

    /// Register a machine kind under a unique name.
    pub fn register_kind(
        &mut self,
        name: &str,
        hooks: Box<dyn MachineHooks>,
    ) -> MultiblockResult<MachineKind> {
        self.kinds.register(name, hooks)
    }

    pub fn kinds(&self) -> &MachineKindRegistry {
        &self.kinds
    }

    ///// Queries

    pub fn part_at(&self, pos: BlockPos) -> Option<PartId> {
        self.by_pos.get(&pos).copied()
    }

    pub fn part(&self, id: PartId) -> Option<&Part> {
        self.parts.get(&id)
    }

    pub fn controller(&self, id: ControllerId) -> Option<&Controller> {
        self.controllers.get(&id)
    }

    pub fn controller_of(&self, part: PartId) -> Option<ControllerId> {
        self.parts.get(&part).and_then(|p| p.controller)
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    pub fn controllers(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    pub fn parts_in_chunk(&self, chunk: ChunkPos) -> impl Iterator<Item = PartId> + '_ {
        self.by_chunk
            .get(&chunk)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    ///// Lifecycle entry points

    /// A part became live and is safely queryable. Indexes it, runs the
    /// neighbor attachment pass and, when more than one compatible
    /// controller was discovered, the merge pass.
    pub fn on_part_added(
        &mut self,
        oracle: &dyn ChunkOracle,
        spawn: PartSpawn,
    ) -> MultiblockResult<PartId> {
        if !self.kinds.is_registered(spawn.kind) {
            return Err(MultiblockError::UnknownKind(spawn.kind));
        }
        if self.by_pos.contains_key(&spawn.pos) {
            return Err(MultiblockError::PositionOccupied(spawn.pos));
        }

        let id = PartId(self.next_part);
        self.next_part += 1;

        let pos = spawn.pos;
        self.by_pos.insert(pos, id);
        self.by_chunk.entry(pos.chunk()).or_default().insert(id);
        self.parts.insert(id, Part::new(spawn));
        log::debug!("[MultiblockRegistry] Part {:?} became live at {}", id, pos);

        let discovered = self.attach_to_neighbors(oracle, id);
        if discovered.len() > 1 {
            self.merge_pass(&discovered);
        }
        Ok(id)
    }

    /// A part was deliberately removed from the world. Detaches it, drops
    /// it from every index, then regroups any survivors that lost
    /// connectivity.
    pub fn on_part_removed(&mut self, id: PartId) -> MultiblockResult<()> {
        let (pos, cid) = match self.parts.get(&id) {
            Some(p) => (p.pos, p.controller),
            None => return Err(MultiblockError::UnknownPart(id)),
        };

        if cid.is_some() {
            self.detach_self(id, false)?;
        }
        self.unindex(id, pos);
        log::debug!("[MultiblockRegistry] Part {:?} removed from world at {}", id, pos);

        if let Some(cid) = cid {
            if self.controllers.contains_key(&cid) {
                self.revalidate(cid);
            }
        }
        Ok(())
    }

    /// A chunk is unloading. Force-detaches every tracked part inside it,
    /// in no particular order, and returns the evicted records so the host
    /// can persist them. Any snapshot cached by a departing save delegate
    /// rides along in its record. Survivors that lost connectivity through
    /// the departed region are regrouped once the batch completes.
    pub fn on_chunk_unload(&mut self, chunk: ChunkPos) -> Vec<Part> {
        let ids = match self.by_chunk.remove(&chunk) {
            Some(ids) => ids,
            None => return Vec::new(),
        };

        let mut evicted = Vec::new();
        let mut touched: Vec<ControllerId> = Vec::new();
        for id in ids {
            let (pos, cid) = match self.parts.get(&id) {
                Some(p) => (p.pos, p.controller),
                None => continue,
            };
            if let Some(cid) = cid {
                self.detach_part(cid, id, true);
                if !touched.contains(&cid) {
                    touched.push(cid);
                }
            }
            if let Some(part) = self.unindex(id, pos) {
                evicted.push(part);
            }
        }

        // An unloading chunk can sever a controller's middle; what survives
        // on each side must not keep sharing a controller.
        for cid in touched {
            if self.controllers.contains_key(&cid) {
                self.revalidate(cid);
            }
        }

        log::debug!(
            "[MultiblockRegistry] Chunk {} unloaded, evicted {} part(s)",
            chunk,
            evicted.len()
        );
        evicted
    }

    /// Detach a part from its controller. No-op when already unattached.
    /// `forced` means the containing chunk is becoming unavailable rather
    /// than the part being deliberately removed; aggregate state is then
    /// cached instead of discarded.
    pub fn detach_self(&mut self, id: PartId, forced: bool) -> MultiblockResult<()> {
        let cid = match self.parts.get(&id) {
            Some(p) => match p.controller {
                Some(cid) => cid,
                None => return Ok(()),
            },
            None => return Err(MultiblockError::UnknownPart(id)),
        };

        self.detach_part(cid, id, forced);

        // detach_part clears the handle as a postcondition; clear again
        // defensively in case a controller implementation missed it.
        if let Some(part) = self.parts.get_mut(&id) {
            part.controller = None;
        }
        Ok(())
    }

    /// Self-healing invariant check: a part that should already be detached
    /// but still holds a controller handle gets repaired in place.
    pub fn assert_detached(&mut self, id: PartId) -> MultiblockResult<()> {
        let part = self
            .parts
            .get_mut(&id)
            .ok_or(MultiblockError::UnknownPart(id))?;
        if part.controller.is_some() {
            log::warn!(
                "[MultiblockRegistry] Part {:?} at {} should be detached already, \
                 but was not. This is not fatal and will be repaired, but is unusual.",
                id,
                part.pos
            );
            part.controller = None;
        }
        Ok(())
    }

    ///// Aggregate state and sync

    /// Serialize the aggregate state of the part's controller, but only
    /// when the part is the save delegate. Every other part writes nothing.
    pub fn build_sync_snapshot(&self, id: PartId) -> MultiblockResult<Option<Vec<u8>>> {
        let part = self.parts.get(&id).ok_or(MultiblockError::UnknownPart(id))?;
        if !part.save_delegate {
            return Ok(None);
        }
        let cid = match part.controller {
            Some(cid) => cid,
            None => return Ok(None),
        };
        Ok(Some(self.encode_controller(cid)?))
    }

    /// Persistence write hook; identical wire form to the sync snapshot.
    pub fn write_persisted_state(&self, id: PartId) -> MultiblockResult<Option<Vec<u8>>> {
        self.build_sync_snapshot(id)
    }

    /// Apply replicated aggregate state arriving at an observer instance.
    /// Attached parts forward it to their controller and the kind's
    /// `on_snapshot_loaded` hook fires; unattached parts cache it until
    /// attachment completes.
    pub fn apply_sync_snapshot(&mut self, id: PartId, bytes: &[u8]) -> MultiblockResult<()> {
        self.ingest_snapshot(id, bytes, true)
    }

    /// Persistence read hook; caches until a controller exists, like the
    /// sync path, but without the observer notification.
    pub fn read_persisted_state(&mut self, id: PartId, bytes: &[u8]) -> MultiblockResult<()> {
        self.ingest_snapshot(id, bytes, false)
    }

    pub fn machine_data(&self, cid: ControllerId) -> MultiblockResult<&[u8]> {
        self.controllers
            .get(&cid)
            .map(|c| c.machine_data.as_slice())
            .ok_or(MultiblockError::UnknownController(cid))
    }

    pub fn set_machine_data(&mut self, cid: ControllerId, data: Vec<u8>) -> MultiblockResult<()> {
        let ctrl = self
            .controllers
            .get_mut(&cid)
            .ok_or(MultiblockError::UnknownController(cid))?;
        ctrl.machine_data = data;
        Ok(())
    }

    /// Record an assembly-state transition decided by the validation layer
    /// and fire the outward hooks. Hooks are suppressed while a controller
    /// swap is in flight for any member.
    pub fn set_machine_state(
        &mut self,
        cid: ControllerId,
        state: MachineState,
    ) -> MultiblockResult<()> {
        let (prev, kind) = {
            let ctrl = self
                .controllers
                .get_mut(&cid)
                .ok_or(MultiblockError::UnknownController(cid))?;
            let prev = ctrl.machine_state;
            ctrl.machine_state = state;
            (prev, ctrl.kind)
        };
        if prev == state {
            return Ok(());
        }
        if self.any_member_paused(cid) {
            log::debug!(
                "[MultiblockRegistry] Suppressing state hooks for {:?}, swap in flight",
                cid
            );
            return Ok(());
        }
        if let Some(hooks) = self.kinds.hooks_mut(kind) {
            if state == MachineState::Assembled {
                hooks.on_machine_assembled(cid);
            } else if prev == MachineState::Assembled {
                hooks.on_machine_broken(cid);
            }
        }
        Ok(())
    }

    /// Activate or deactivate a machine; fires the matching hook on change.
    pub fn set_machine_active(&mut self, cid: ControllerId, active: bool) -> MultiblockResult<()> {
        let (prev, kind) = {
            let ctrl = self
                .controllers
                .get_mut(&cid)
                .ok_or(MultiblockError::UnknownController(cid))?;
            let prev = ctrl.active;
            ctrl.active = active;
            (prev, ctrl.kind)
        };
        if prev == active {
            return Ok(());
        }
        if self.any_member_paused(cid) {
            log::debug!(
                "[MultiblockRegistry] Suppressing activation hooks for {:?}, swap in flight",
                cid
            );
            return Ok(());
        }
        if let Some(hooks) = self.kinds.hooks_mut(kind) {
            if active {
                hooks.on_machine_activated(cid);
            } else {
                hooks.on_machine_deactivated(cid);
            }
        }
        Ok(())
    }

    ///// Attachment protocol

    /// Discover compatible controllers among the six loaded neighbors and
    /// attach to the best of them, or to a fresh controller when none
    /// exists. Returns the full discovered set; consolidating it is the
    /// merge pass's job, never done while discovery iterates.
    fn attach_to_neighbors(&mut self, oracle: &dyn ChunkOracle, id: PartId) -> Vec<ControllerId> {
        let (pos, kind) = match self.parts.get(&id) {
            Some(p) => (p.pos, p.kind),
            None => return Vec::new(),
        };

        let mut discovered: Vec<ControllerId> = Vec::new();
        for npos in pos.neighbors6() {
            if !oracle.is_chunk_loaded(npos.chunk()) {
                // Chunk not loaded, skip it.
                continue;
            }
            let nid = match self.by_pos.get(&npos) {
                Some(&nid) => nid,
                None => continue,
            };
            let cid = match self.parts.get(&nid).and_then(|p| p.controller) {
                Some(cid) => cid,
                None => continue,
            };
            let candidate = match self.controllers.get(&cid) {
                Some(c) => c,
                None => continue,
            };
            if candidate.kind != kind {
                // Skip multiblocks of incompatible kinds.
                continue;
            }
            if !discovered.contains(&cid) {
                discovered.push(cid);
            }
        }

        let target = match self.best_of(&discovered) {
            Some(cid) => cid,
            None => self.create_controller(kind),
        };
        self.attach_part(target, id);
        discovered
    }

    /// Pick the consuming controller from a candidate set. `should_consume`
    /// is a strict total order, so the result does not depend on the
    /// enumeration order of the candidates.
    fn best_of(&self, candidates: &[ControllerId]) -> Option<ControllerId> {
        let mut best: Option<ControllerId> = None;
        for &cid in candidates {
            match best {
                None => best = Some(cid),
                Some(b) => {
                    if let (Some(cand), Some(cur)) =
                        (self.controllers.get(&cid), self.controllers.get(&b))
                    {
                        if cand.should_consume(cur) {
                            best = Some(cid);
                        }
                    }
                }
            }
        }
        best
    }

    fn create_controller(&mut self, kind: MachineKind) -> ControllerId {
        let id = ControllerId(self.next_controller);
        self.next_controller += 1;
        self.controllers.insert(id, Controller::new(id, kind));
        log::debug!("[MultiblockRegistry] Created controller {:?} for {:?}", id, kind);
        id
    }

    fn attach_part(&mut self, cid: ControllerId, id: PartId) {
        let (pos, cached) = {
            let part = match self.parts.get_mut(&id) {
                Some(p) => p,
                None => return,
            };
            part.controller = Some(cid);
            (part.pos, part.cached_snapshot.take())
        };

        let mut promoted = false;
        {
            let ctrl = match self.controllers.get_mut(&cid) {
                Some(c) => c,
                None => return,
            };
            ctrl.parts.insert(id);
            ctrl.reference_pos = Some(match ctrl.reference_pos {
                Some(r) if r <= pos => r,
                _ => pos,
            });
            if ctrl.machine_state == MachineState::Empty {
                ctrl.machine_state = MachineState::Partial;
            }
            if ctrl.save_delegate.is_none() {
                ctrl.save_delegate = Some(id);
                promoted = true;
            }
        }
        if promoted {
            if let Some(part) = self.parts.get_mut(&id) {
                part.save_delegate = true;
            }
        }
        log::debug!("[MultiblockRegistry] Part {:?} attached to {:?}", id, cid);

        // A snapshot that arrived before attachment replays exactly once now.
        if let Some(bytes) = cached {
            self.replay_snapshot(cid, &bytes);
        }
    }

    /// Remove a part from its controller. Postconditions: the part's
    /// handle is cleared, a surviving controller still has exactly one save
    /// delegate and a valid reference position, and an empty controller is
    /// retired.
    fn detach_part(&mut self, cid: ControllerId, id: PartId, forced: bool) {
        let was_delegate = self
            .controllers
            .get(&cid)
            .map_or(false, |c| c.save_delegate == Some(id));

        // Encode before tearing anything down so a chunk unload never loses
        // aggregate state, whatever order the batch visits the members in.
        let cached = if forced && was_delegate {
            self.encode_controller(cid).ok()
        } else {
            None
        };

        let remaining: Vec<PartId> = {
            let ctrl = match self.controllers.get_mut(&cid) {
                Some(c) => c,
                None => return,
            };
            ctrl.parts.remove(&id);
            if was_delegate {
                ctrl.save_delegate = None;
            }
            ctrl.parts.iter().copied().collect()
        };

        if let Some(part) = self.parts.get_mut(&id) {
            part.controller = None;
            part.save_delegate = false;
            part.visited = false;
            if cached.is_some() {
                part.cached_snapshot = cached;
            }
        }

        if remaining.is_empty() {
            self.retire_controller(cid, false);
            return;
        }

        let new_min = self.min_member(&remaining);
        if let Some(ctrl) = self.controllers.get_mut(&cid) {
            ctrl.reference_pos = new_min.map(|(pos, _)| pos);
        }
        if was_delegate {
            // Hand the delegate to the smallest remaining member before the
            // former holder is finally dropped.
            if let Some((_, nid)) = new_min {
                if let Some(ctrl) = self.controllers.get_mut(&cid) {
                    ctrl.save_delegate = Some(nid);
                }
                if let Some(part) = self.parts.get_mut(&nid) {
                    part.save_delegate = true;
                }
                log::debug!(
                    "[MultiblockRegistry] Save delegate for {:?} moved to {:?}",
                    cid,
                    nid
                );
            }
        }
    }

    fn retire_controller(&mut self, cid: ControllerId, quiet: bool) {
        let mut ctrl = match self.controllers.remove(&cid) {
            Some(c) => c,
            None => return,
        };
        let was_assembled = ctrl.machine_state == MachineState::Assembled;
        let was_active = ctrl.active;
        ctrl.machine_state = MachineState::Disassembling;
        log::debug!("[MultiblockRegistry] Controller {:?} retired", cid);

        if quiet {
            return;
        }
        if let Some(hooks) = self.kinds.hooks_mut(ctrl.kind) {
            if was_active {
                hooks.on_machine_deactivated(cid);
            }
            if was_assembled {
                hooks.on_machine_broken(cid);
            }
        }
    }

    ///// Merge pass

    /// Consolidate the controllers discovered by one attachment pass into
    /// the single best survivor. Idempotent: a second run over the same set
    /// finds at most one live controller and does nothing.
    fn merge_pass(&mut self, discovered: &[ControllerId]) {
        let mut live: Vec<ControllerId> = discovered
            .iter()
            .copied()
            .filter(|cid| {
                self.controllers
                    .get(cid)
                    .map_or(false, |c| !c.parts.is_empty())
            })
            .collect();
        live.sort();
        live.dedup();
        if live.len() < 2 {
            return;
        }

        let survivor = match self.best_of(&live) {
            Some(cid) => cid,
            None => return,
        };

        let mut moved: Vec<PartId> = Vec::new();
        for cid in live {
            if cid != survivor {
                self.assimilate(survivor, cid, &mut moved);
            }
        }
        // The swap is complete; side effects may resume.
        for pid in moved {
            if let Some(part) = self.parts.get_mut(&pid) {
                part.paused_for_replacement = false;
            }
        }
    }

    /// Move every part of `absorbed` into `survivor` without re-running the
    /// full attach logic, then discard the absorbed controller.
    fn assimilate(
        &mut self,
        survivor: ControllerId,
        absorbed: ControllerId,
        moved: &mut Vec<PartId>,
    ) {
        let (members, absorbed_ref) = {
            let ctrl = match self.controllers.get_mut(&absorbed) {
                Some(c) => c,
                None => return,
            };
            let members: Vec<PartId> = ctrl.parts.drain().collect();
            (members, ctrl.reference_pos)
        };

        for &pid in &members {
            if let Some(part) = self.parts.get_mut(&pid) {
                part.paused_for_replacement = true;
                part.controller = Some(survivor);
                part.save_delegate = false;
                moved.push(pid);
            }
        }

        if let Some(ctrl) = self.controllers.get_mut(&survivor) {
            ctrl.parts.extend(members.iter().copied());
            if let Some(r) = absorbed_ref {
                ctrl.reference_pos = Some(match ctrl.reference_pos {
                    Some(cur) if cur <= r => cur,
                    _ => r,
                });
            }
        }

        log::info!(
            "[MultiblockRegistry] Controller {:?} assimilated into {:?} ({} part(s))",
            absorbed,
            survivor,
            members.len()
        );
        self.retire_controller(absorbed, true);
    }

    ///// Revalidation (split detection)

    /// Reverse of the merge pass: flood-fill the controller's members from
    /// its reference position and regroup everything unreachable into fresh
    /// controllers, one per connected component.
    fn revalidate(&mut self, cid: ControllerId) {
        let members: Vec<PartId> = match self.controllers.get(&cid) {
            Some(c) => c.parts.iter().copied().collect(),
            None => return,
        };
        if members.len() < 2 {
            return;
        }

        // Reset the scratch flags before the traversal.
        for &pid in &members {
            if let Some(part) = self.parts.get_mut(&pid) {
                part.visited = false;
            }
        }

        let root = match self.min_member(&members) {
            Some((_, id)) => id,
            None => return,
        };
        let mut queue: VecDeque<PartId> = VecDeque::new();
        if let Some(part) = self.parts.get_mut(&root) {
            part.visited = true;
        }
        queue.push_back(root);
        while let Some(pid) = queue.pop_front() {
            let pos = match self.parts.get(&pid) {
                Some(p) => p.pos,
                None => continue,
            };
            for npos in pos.neighbors6() {
                let nid = match self.by_pos.get(&npos) {
                    Some(&nid) => nid,
                    None => continue,
                };
                let neighbor = match self.parts.get_mut(&nid) {
                    Some(p) => p,
                    None => continue,
                };
                if neighbor.controller != Some(cid) || neighbor.visited {
                    continue;
                }
                neighbor.visited = true;
                queue.push_back(nid);
            }
        }

        let stray: Vec<PartId> = members
            .iter()
            .copied()
            .filter(|pid| self.parts.get(pid).map_or(false, |p| !p.visited))
            .collect();

        // Reset the scratch flags after the traversal as well.
        for &pid in &members {
            if let Some(part) = self.parts.get_mut(&pid) {
                part.visited = false;
            }
        }

        if stray.is_empty() {
            return;
        }
        log::info!(
            "[MultiblockRegistry] Controller {:?} lost connectivity to {} part(s), regrouping",
            cid,
            stray.len()
        );
        self.split_off(cid, &stray);
    }

    /// Pull `stray` out of `cid` and regroup them component-by-component
    /// into fresh controllers of the same kind.
    fn split_off(&mut self, cid: ControllerId, stray: &[PartId]) {
        let kind = {
            let ctrl = match self.controllers.get_mut(&cid) {
                Some(c) => c,
                None => return,
            };
            for pid in stray {
                ctrl.parts.remove(pid);
            }
            ctrl.kind
        };

        // The old controller may have lost its reference position or its
        // save delegate to the stray set.
        let retained: Vec<PartId> = self
            .controllers
            .get(&cid)
            .map(|c| c.parts.iter().copied().collect())
            .unwrap_or_default();
        let retained_min = self.min_member(&retained);
        let delegate = self.controllers.get(&cid).and_then(|c| c.save_delegate);
        let delegate_lost = delegate.map_or(false, |d| stray.contains(&d));

        if let Some(ctrl) = self.controllers.get_mut(&cid) {
            ctrl.reference_pos = retained_min.map(|(pos, _)| pos);
            if delegate_lost {
                ctrl.save_delegate = None;
            }
        }
        if delegate_lost {
            if let Some(d) = delegate {
                if let Some(part) = self.parts.get_mut(&d) {
                    part.save_delegate = false;
                }
            }
            if let Some((_, nid)) = retained_min {
                if let Some(ctrl) = self.controllers.get_mut(&cid) {
                    ctrl.save_delegate = Some(nid);
                }
                if let Some(part) = self.parts.get_mut(&nid) {
                    part.save_delegate = true;
                }
            }
        }

        // Seed components smallest-position-first so regrouping is
        // deterministic for identical inputs.
        let mut order: Vec<(BlockPos, PartId)> = stray
            .iter()
            .filter_map(|&id| self.parts.get(&id).map(|p| (p.pos, id)))
            .collect();
        order.sort();

        let mut remaining: FxHashSet<PartId> = stray.iter().copied().collect();
        for (_, seed) in order {
            if !remaining.remove(&seed) {
                continue;
            }
            let mut component = vec![seed];
            let mut queue: VecDeque<PartId> = VecDeque::from([seed]);
            while let Some(pid) = queue.pop_front() {
                let pos = match self.parts.get(&pid) {
                    Some(p) => p.pos,
                    None => continue,
                };
                for npos in pos.neighbors6() {
                    let nid = match self.by_pos.get(&npos) {
                        Some(&nid) => nid,
                        None => continue,
                    };
                    if remaining.remove(&nid) {
                        component.push(nid);
                        queue.push_back(nid);
                    }
                }
            }

            let new_cid = self.create_controller(kind);
            self.adopt(new_cid, &component);
            log::debug!(
                "[MultiblockRegistry] Split component of {} part(s) into controller {:?}",
                component.len(),
                new_cid
            );
        }
    }

    /// Take over a group of parts wholesale, the way assimilation does, and
    /// establish the membership invariants on the receiving controller.
    fn adopt(&mut self, cid: ControllerId, members: &[PartId]) {
        for &pid in members {
            if let Some(part) = self.parts.get_mut(&pid) {
                part.controller = Some(cid);
                part.save_delegate = false;
            }
        }
        let min = self.min_member(members);
        let mut promoted = None;
        {
            let ctrl = match self.controllers.get_mut(&cid) {
                Some(c) => c,
                None => return,
            };
            ctrl.parts.extend(members.iter().copied());
            if let Some((pos, nid)) = min {
                ctrl.reference_pos = Some(match ctrl.reference_pos {
                    Some(cur) if cur <= pos => cur,
                    _ => pos,
                });
                if ctrl.save_delegate.is_none() {
                    ctrl.save_delegate = Some(nid);
                    promoted = Some(nid);
                }
            }
            if ctrl.machine_state == MachineState::Empty {
                ctrl.machine_state = MachineState::Partial;
            }
        }
        if let Some(nid) = promoted {
            if let Some(part) = self.parts.get_mut(&nid) {
                part.save_delegate = true;
            }
        }
    }

    ///// Helpers

    /// Smallest (position, id) pair among the given parts. The position is
    /// primary, so the result is stable across runs and map orderings.
    fn min_member(&self, ids: &[PartId]) -> Option<(BlockPos, PartId)> {
        ids.iter()
            .filter_map(|&id| self.parts.get(&id).map(|p| (p.pos, id)))
            .min()
    }

    fn any_member_paused(&self, cid: ControllerId) -> bool {
        self.controllers.get(&cid).map_or(false, |c| {
            c.parts.iter().any(|pid| {
                self.parts
                    .get(pid)
                    .map_or(false, |p| p.paused_for_replacement)
            })
        })
    }

    fn unindex(&mut self, id: PartId, pos: BlockPos) -> Option<Part> {
        self.by_pos.remove(&pos);
        if let Some(set) = self.by_chunk.get_mut(&pos.chunk()) {
            set.remove(&id);
            if set.is_empty() {
                self.by_chunk.remove(&pos.chunk());
            }
        }
        self.parts.remove(&id)
    }

    fn encode_controller(&self, cid: ControllerId) -> MultiblockResult<Vec<u8>> {
        let ctrl = self
            .controllers
            .get(&cid)
            .ok_or(MultiblockError::UnknownController(cid))?;
        let name = self
            .kinds
            .name_of(ctrl.kind)
            .ok_or(MultiblockError::UnknownKind(ctrl.kind))?;
        ControllerSnapshot {
            kind: name.to_string(),
            machine_state: ctrl.machine_state,
            machine_data: ctrl.machine_data.clone(),
        }
        .encode()
    }

    fn apply_snapshot(&mut self, cid: ControllerId, snap: ControllerSnapshot) -> MultiblockResult<()> {
        let expected = {
            let ctrl = self
                .controllers
                .get(&cid)
                .ok_or(MultiblockError::UnknownController(cid))?;
            self.kinds
                .name_of(ctrl.kind)
                .ok_or(MultiblockError::UnknownKind(ctrl.kind))?
                .to_string()
        };
        if snap.kind != expected {
            return Err(MultiblockError::SnapshotKindMismatch {
                expected,
                found: snap.kind,
            });
        }
        if let Some(ctrl) = self.controllers.get_mut(&cid) {
            ctrl.machine_state = snap.machine_state;
            ctrl.machine_data = snap.machine_data;
        }
        Ok(())
    }

    /// Replay a cached snapshot into a freshly attached controller. Stale
    /// or corrupt buffers are discarded with a warning; a transient
    /// inconsistency here must never take down the simulation.
    fn replay_snapshot(&mut self, cid: ControllerId, bytes: &[u8]) {
        match ControllerSnapshot::decode(bytes) {
            Ok(snap) => {
                if let Err(e) = self.apply_snapshot(cid, snap) {
                    log::warn!(
                        "[MultiblockRegistry] Discarding cached snapshot for {:?}: {}",
                        cid,
                        e
                    );
                }
            }
            Err(e) => {
                log::warn!(
                    "[MultiblockRegistry] Cached snapshot for {:?} failed to decode: {}",
                    cid,
                    e
                );
            }
        }
    }

    fn ingest_snapshot(&mut self, id: PartId, bytes: &[u8], notify: bool) -> MultiblockResult<()> {
        let cid = {
            let part = self.parts.get(&id).ok_or(MultiblockError::UnknownPart(id))?;
            part.controller
        };
        match cid {
            Some(cid) => {
                let snap = ControllerSnapshot::decode(bytes)?;
                self.apply_snapshot(cid, snap)?;
                if notify {
                    let kind = self.controllers.get(&cid).map(|c| c.kind);
                    if let Some(kind) = kind {
                        if let Some(hooks) = self.kinds.hooks_mut(kind) {
                            hooks.on_snapshot_loaded(cid);
                        }
                    }
                }
                Ok(())
            }
            None => {
                if let Some(part) = self.parts.get_mut(&id) {
                    part.cached_snapshot = Some(bytes.to_vec());
                }
                Ok(())
            }
        }
    }
}

impl Default for MultiblockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{AllLoaded, LoadedSet};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct NoopHooks;
    impl MachineHooks for NoopHooks {}

    #[derive(Default)]
    struct Recorded {
        assembled: u32,
        broken: u32,
        activated: u32,
        deactivated: u32,
        snapshots: u32,
    }

    struct RecordingHooks(Rc<RefCell<Recorded>>);

    impl MachineHooks for RecordingHooks {
        fn on_machine_assembled(&mut self, _: ControllerId) {
            self.0.borrow_mut().assembled += 1;
        }
        fn on_machine_broken(&mut self, _: ControllerId) {
            self.0.borrow_mut().broken += 1;
        }
        fn on_machine_activated(&mut self, _: ControllerId) {
            self.0.borrow_mut().activated += 1;
        }
        fn on_machine_deactivated(&mut self, _: ControllerId) {
            self.0.borrow_mut().deactivated += 1;
        }
        fn on_snapshot_loaded(&mut self, _: ControllerId) {
            self.0.borrow_mut().snapshots += 1;
        }
    }

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn registry_with_kind() -> (MultiblockRegistry, MachineKind) {
        init_logs();
        let mut reg = MultiblockRegistry::new();
        let kind = reg
            .register_kind("test:reactor", Box::new(NoopHooks))
            .unwrap();
        (reg, kind)
    }

    fn add(reg: &mut MultiblockRegistry, kind: MachineKind, x: i32, y: i32, z: i32) -> PartId {
        reg.on_part_added(&AllLoaded, PartSpawn::new(BlockPos::new(x, y, z), kind))
            .unwrap()
    }

    /// Quiescence invariants: each controller's membership equals the
    /// 6-connected component reachable from any member, back-references
    /// agree, exactly one save delegate exists, and the reference position
    /// is the minimum member position.
    fn assert_connectivity(reg: &MultiblockRegistry) {
        for ctrl in reg.controllers.values() {
            assert!(
                !ctrl.parts.is_empty(),
                "empty controller {:?} still registered",
                ctrl.id
            );
            for pid in &ctrl.parts {
                assert_eq!(reg.parts[pid].controller, Some(ctrl.id));
            }

            let start = *ctrl.parts.iter().next().unwrap();
            let mut seen: FxHashSet<PartId> = FxHashSet::default();
            seen.insert(start);
            let mut queue = VecDeque::from([start]);
            while let Some(pid) = queue.pop_front() {
                let pos = reg.parts[&pid].pos;
                for npos in pos.neighbors6() {
                    if let Some(&nid) = reg.by_pos.get(&npos) {
                        if reg.parts[&nid].controller == Some(ctrl.id) && seen.insert(nid) {
                            queue.push_back(nid);
                        }
                    }
                }
            }
            assert_eq!(
                seen, ctrl.parts,
                "controller {:?} membership does not match its connected component",
                ctrl.id
            );

            let delegates: Vec<PartId> = ctrl
                .parts
                .iter()
                .copied()
                .filter(|pid| reg.parts[pid].save_delegate)
                .collect();
            assert_eq!(
                delegates.len(),
                1,
                "controller {:?} has {} save delegates",
                ctrl.id,
                delegates.len()
            );
            assert_eq!(ctrl.save_delegate, Some(delegates[0]));

            let min_pos = ctrl.parts.iter().map(|pid| reg.parts[pid].pos).min();
            assert_eq!(ctrl.reference_pos, min_pos);
        }
    }

    #[test]
    fn test_lone_part_creates_controller() {
        let (mut reg, kind) = registry_with_kind();
        let pid = add(&mut reg, kind, 0, 0, 0);

        assert_eq!(reg.controller_count(), 1);
        assert_eq!(reg.part_at(BlockPos::new(0, 0, 0)), Some(pid));
        let cid = reg.controller_of(pid).unwrap();
        let ctrl = reg.controller(cid).unwrap();
        assert_eq!(ctrl.part_count(), 1);
        assert_eq!(ctrl.machine_state(), MachineState::Partial);
        assert!(reg.part(pid).unwrap().is_save_delegate());
        assert_connectivity(&reg);
    }

    #[test]
    fn test_three_in_a_row_forms_one_controller_in_any_order() {
        let orders = [
            [1, 0, 2],
            [0, 1, 2],
            [2, 0, 1],
            [1, 2, 0],
            [0, 2, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let (mut reg, kind) = registry_with_kind();
            for x in order {
                add(&mut reg, kind, x, 0, 0);
            }
            assert_eq!(reg.controller_count(), 1, "insertion order {:?}", order);
            assert_eq!(reg.controllers().next().unwrap().part_count(), 3);
            assert_connectivity(&reg);
        }
    }

    #[test]
    fn test_bridging_part_merges_two_controllers() {
        let (mut reg, kind) = registry_with_kind();
        add(&mut reg, kind, -1, 0, 0);
        add(&mut reg, kind, 0, 0, 0);
        add(&mut reg, kind, 2, 0, 0);
        add(&mut reg, kind, 3, 0, 0);
        assert_eq!(reg.controller_count(), 2);

        let bridge = add(&mut reg, kind, 1, 0, 0);
        assert_eq!(reg.controller_count(), 1);
        let cid = reg.controller_of(bridge).unwrap();
        let ctrl = reg.controller(cid).unwrap();
        assert_eq!(ctrl.part_count(), 5);
        // The swap finished; nobody is left paused for replacement.
        for pid in ctrl.parts().collect::<Vec<_>>() {
            assert!(!reg.part(pid).unwrap().is_paused());
        }
        assert_connectivity(&reg);
    }

    #[test]
    fn test_merge_pass_is_idempotent() {
        let (mut reg, kind) = registry_with_kind();
        let left = add(&mut reg, kind, 0, 0, 0);
        add(&mut reg, kind, 1, 0, 0);
        let right = add(&mut reg, kind, 3, 0, 0);
        add(&mut reg, kind, 4, 0, 0);
        let a = reg.controller_of(left).unwrap();
        let b = reg.controller_of(right).unwrap();

        add(&mut reg, kind, 2, 0, 0);
        assert_eq!(reg.controller_count(), 1);
        let survivor = reg.controller_of(left).unwrap();
        let members_before: FxHashSet<PartId> =
            reg.controller(survivor).unwrap().parts().collect();
        let delegate_before = reg.controller(survivor).unwrap().save_delegate();

        // Running the pass again over the already-merged set is a no-op.
        reg.merge_pass(&[a, b]);
        assert_eq!(reg.controller_count(), 1);
        let members_after: FxHashSet<PartId> =
            reg.controller(survivor).unwrap().parts().collect();
        assert_eq!(members_before, members_after);
        assert_eq!(delegate_before, reg.controller(survivor).unwrap().save_delegate());
        assert_connectivity(&reg);
    }

    #[test]
    fn test_survivor_is_independent_of_insertion_order() {
        let left = [(0, 0, 0), (1, 0, 0)];
        let right = [(3, 0, 0), (4, 0, 0)];

        let build = |first: &[(i32, i32, i32)], second: &[(i32, i32, i32)]| {
            let (mut reg, kind) = registry_with_kind();
            for &(x, y, z) in first.iter().chain(second) {
                add(&mut reg, kind, x, y, z);
            }
            add(&mut reg, kind, 2, 0, 0);
            assert_eq!(reg.controller_count(), 1);
            let ctrl = reg.controllers().next().unwrap();
            (ctrl.reference_pos(), ctrl.part_count())
        };

        let forward = build(&left, &right);
        let backward = build(&right, &left);
        assert_eq!(forward, backward);
        assert_eq!(forward, (Some(BlockPos::new(0, 0, 0)), 5));
    }

    #[test]
    fn test_incompatible_kinds_never_merge() {
        init_logs();
        let mut reg = MultiblockRegistry::new();
        let reactor = reg.register_kind("test:reactor", Box::new(NoopHooks)).unwrap();
        let turbine = reg.register_kind("test:turbine", Box::new(NoopHooks)).unwrap();

        add(&mut reg, reactor, 0, 0, 0);
        add(&mut reg, turbine, 1, 0, 0);
        add(&mut reg, reactor, 2, 0, 0);

        assert_eq!(reg.controller_count(), 3);
        assert_connectivity(&reg);
    }

    #[test]
    fn test_detach_clears_controller_reference() {
        let (mut reg, kind) = registry_with_kind();
        let p0 = add(&mut reg, kind, 0, 0, 0);
        let p1 = add(&mut reg, kind, 1, 0, 0);
        let cid = reg.controller_of(p0).unwrap();

        reg.detach_self(p0, false).unwrap();

        assert_eq!(reg.part(p0).unwrap().controller(), None);
        assert!(!reg.controller(cid).unwrap().contains(p0));
        assert!(reg.part(p1).unwrap().is_save_delegate());
        assert_connectivity(&reg);

        // Detaching an already-unattached part is a no-op.
        reg.detach_self(p0, false).unwrap();
        assert_eq!(reg.part(p0).unwrap().controller(), None);
    }

    #[test]
    fn test_middle_removal_splits_chain_after_revalidation() {
        let (mut reg, kind) = registry_with_kind();
        let p0 = add(&mut reg, kind, 0, 0, 0);
        let p1 = add(&mut reg, kind, 1, 0, 0);
        let p2 = add(&mut reg, kind, 2, 0, 0);
        assert_eq!(reg.controller_count(), 1);

        reg.on_part_removed(p1).unwrap();

        assert_eq!(reg.controller_count(), 2);
        let c0 = reg.controller_of(p0).unwrap();
        let c2 = reg.controller_of(p2).unwrap();
        assert_ne!(c0, c2, "ends must not share a controller that no longer spans them");
        assert_eq!(reg.controller(c0).unwrap().part_count(), 1);
        assert_eq!(reg.controller(c2).unwrap().part_count(), 1);
        assert_connectivity(&reg);
    }

    #[test]
    fn test_removing_hub_splits_into_components() {
        let (mut reg, kind) = registry_with_kind();
        let hub = add(&mut reg, kind, 0, 0, 0);
        add(&mut reg, kind, 1, 0, 0);
        add(&mut reg, kind, -1, 0, 0);
        add(&mut reg, kind, 0, 1, 0);
        add(&mut reg, kind, 0, -1, 0);
        assert_eq!(reg.controller_count(), 1);

        reg.on_part_removed(hub).unwrap();

        assert_eq!(reg.controller_count(), 4);
        assert_eq!(reg.part_count(), 4);
        assert_connectivity(&reg);
    }

    #[test]
    fn test_removing_delegate_reassigns_before_drop() {
        let (mut reg, kind) = registry_with_kind();
        let p0 = add(&mut reg, kind, 0, 0, 0);
        let p1 = add(&mut reg, kind, 1, 0, 0);
        add(&mut reg, kind, 2, 0, 0);
        assert!(reg.part(p0).unwrap().is_save_delegate());

        reg.on_part_removed(p0).unwrap();

        assert_eq!(reg.controller_count(), 1);
        assert!(reg.part(p1).unwrap().is_save_delegate());
        assert_connectivity(&reg);
    }

    #[test]
    fn test_unload_batch_in_reverse_order_keeps_aggregate_state() {
        let (mut reg, kind) = registry_with_kind();
        let mut oracle = LoadedSet::new();
        oracle.load(ChunkPos::new(0, 0, 0));
        oracle.load(ChunkPos::new(1, 0, 0));

        let spawn = |x| PartSpawn::new(BlockPos::new(x, 0, 0), kind);
        let p14 = reg.on_part_added(&oracle, spawn(14)).unwrap();
        let p15 = reg.on_part_added(&oracle, spawn(15)).unwrap();
        let p16 = reg.on_part_added(&oracle, spawn(16)).unwrap();
        reg.on_part_added(&oracle, spawn(17)).unwrap();

        let cid = reg.controller_of(p14).unwrap();
        assert_eq!(reg.controller(cid).unwrap().part_count(), 4);
        assert!(reg.part(p14).unwrap().is_save_delegate());
        reg.set_machine_data(cid, vec![7, 7, 7]).unwrap();

        // The host walks the unload batch in reverse insertion order.
        oracle.unload(ChunkPos::new(0, 0, 0));
        reg.detach_self(p15, true).unwrap();
        reg.detach_self(p14, true).unwrap();

        // Delegate moved into the surviving chunk before its holder dropped.
        assert!(reg.part(p16).unwrap().is_save_delegate());
        assert_eq!(reg.controller(cid).unwrap().part_count(), 2);

        let evicted = reg.on_chunk_unload(ChunkPos::new(0, 0, 0));
        assert_eq!(evicted.len(), 2);
        let former = evicted
            .iter()
            .find(|p| p.pos() == BlockPos::new(14, 0, 0))
            .unwrap();
        let snap = ControllerSnapshot::decode(former.cached_snapshot().unwrap()).unwrap();
        assert_eq!(snap.kind, "test:reactor");
        assert_eq!(snap.machine_data, vec![7, 7, 7]);

        assert_eq!(reg.part_count(), 2);
        assert_connectivity(&reg);
    }

    #[test]
    fn test_unloading_middle_chunk_splits_surviving_ends() {
        let (mut reg, kind) = registry_with_kind();
        let first = add(&mut reg, kind, 15, 0, 0);
        for x in 16..=32 {
            add(&mut reg, kind, x, 0, 0);
        }
        let last = reg.part_at(BlockPos::new(32, 0, 0)).unwrap();
        assert_eq!(reg.controller_count(), 1);

        // The chain spans three chunks; unloading the middle one leaves one
        // survivor at each end with nothing live between them.
        let evicted = reg.on_chunk_unload(ChunkPos::new(1, 0, 0));

        assert_eq!(evicted.len(), 16);
        assert_eq!(reg.part_count(), 2);
        assert_eq!(reg.controller_count(), 2);
        assert_ne!(
            reg.controller_of(first).unwrap(),
            reg.controller_of(last).unwrap()
        );
        assert_connectivity(&reg);
    }

    #[test]
    fn test_unload_batch_handles_attached_members_and_delegate() {
        let (mut reg, kind) = registry_with_kind();
        let p14 = add(&mut reg, kind, 14, 0, 0);
        add(&mut reg, kind, 15, 0, 0);
        let p16 = add(&mut reg, kind, 16, 0, 0);
        add(&mut reg, kind, 17, 0, 0);

        let cid = reg.controller_of(p14).unwrap();
        assert!(reg.part(p14).unwrap().is_save_delegate());
        reg.set_machine_data(cid, vec![3, 1, 4]).unwrap();

        // No per-part notifications beforehand; the batch alone must detach
        // both still-attached members (the delegate among them) in whatever
        // order the index yields, cache the aggregate state, and hand the
        // delegate to a survivor.
        let evicted = reg.on_chunk_unload(ChunkPos::new(0, 0, 0));

        assert_eq!(evicted.len(), 2);
        let former = evicted
            .iter()
            .find(|p| p.pos() == BlockPos::new(14, 0, 0))
            .unwrap();
        let snap = ControllerSnapshot::decode(former.cached_snapshot().unwrap()).unwrap();
        assert_eq!(snap.kind, "test:reactor");
        assert_eq!(snap.machine_data, vec![3, 1, 4]);

        assert_eq!(reg.part_count(), 2);
        assert_eq!(reg.controller(cid).unwrap().part_count(), 2);
        assert!(reg.part(p16).unwrap().is_save_delegate());
        assert_connectivity(&reg);
    }

    #[test]
    fn test_persisted_state_cached_until_controller_exists() {
        let (mut reg, kind) = registry_with_kind();
        let bytes = ControllerSnapshot {
            kind: "test:reactor".to_string(),
            machine_state: MachineState::Partial,
            machine_data: vec![1, 2, 3],
        }
        .encode()
        .unwrap();

        let pid = reg
            .on_part_added(
                &AllLoaded,
                PartSpawn::new(BlockPos::new(0, 0, 0), kind).with_persisted(bytes),
            )
            .unwrap();

        let cid = reg.controller_of(pid).unwrap();
        assert_eq!(reg.machine_data(cid).unwrap(), &[1, 2, 3]);
        // Replayed exactly once; nothing left to replay.
        assert!(reg.part(pid).unwrap().cached_snapshot().is_none());
    }

    #[test]
    fn test_snapshot_after_attachment_applies_and_notifies() {
        init_logs();
        let mut reg = MultiblockRegistry::new();
        let events = Rc::new(RefCell::new(Recorded::default()));
        let kind = reg
            .register_kind("test:reactor", Box::new(RecordingHooks(events.clone())))
            .unwrap();
        let pid = add(&mut reg, kind, 0, 0, 0);
        let cid = reg.controller_of(pid).unwrap();

        let bytes = ControllerSnapshot {
            kind: "test:reactor".to_string(),
            machine_state: MachineState::Assembled,
            machine_data: vec![9],
        }
        .encode()
        .unwrap();
        reg.apply_sync_snapshot(pid, &bytes).unwrap();

        assert_eq!(reg.machine_data(cid).unwrap(), &[9]);
        assert_eq!(
            reg.controller(cid).unwrap().machine_state(),
            MachineState::Assembled
        );
        assert_eq!(events.borrow().snapshots, 1);
    }

    #[test]
    fn test_read_persisted_state_applies_without_notifying() {
        init_logs();
        let mut reg = MultiblockRegistry::new();
        let events = Rc::new(RefCell::new(Recorded::default()));
        let kind = reg
            .register_kind("test:reactor", Box::new(RecordingHooks(events.clone())))
            .unwrap();
        let pid = add(&mut reg, kind, 0, 0, 0);
        let cid = reg.controller_of(pid).unwrap();

        let bytes = ControllerSnapshot {
            kind: "test:reactor".to_string(),
            machine_state: MachineState::Partial,
            machine_data: vec![5, 6],
        }
        .encode()
        .unwrap();
        reg.read_persisted_state(pid, &bytes).unwrap();

        assert_eq!(reg.machine_data(cid).unwrap(), &[5, 6]);
        assert_eq!(events.borrow().snapshots, 0);
    }

    #[test]
    fn test_only_save_delegate_builds_sync_snapshot() {
        let (mut reg, kind) = registry_with_kind();
        let p0 = add(&mut reg, kind, 0, 0, 0);
        let p1 = add(&mut reg, kind, 1, 0, 0);
        let cid = reg.controller_of(p0).unwrap();
        reg.set_machine_data(cid, vec![42]).unwrap();

        assert!(reg.build_sync_snapshot(p1).unwrap().is_none());
        let bytes = reg.build_sync_snapshot(p0).unwrap().unwrap();
        let snap = ControllerSnapshot::decode(&bytes).unwrap();
        assert_eq!(snap.kind, "test:reactor");
        assert_eq!(snap.machine_data, vec![42]);

        assert!(reg.write_persisted_state(p1).unwrap().is_none());
        assert!(reg.write_persisted_state(p0).unwrap().is_some());
    }

    #[test]
    fn test_mismatched_snapshot_kind_is_rejected() {
        init_logs();
        let mut reg = MultiblockRegistry::new();
        let reactor = reg.register_kind("test:reactor", Box::new(NoopHooks)).unwrap();
        reg.register_kind("test:turbine", Box::new(NoopHooks)).unwrap();
        let pid = add(&mut reg, reactor, 0, 0, 0);

        let bytes = ControllerSnapshot {
            kind: "test:turbine".to_string(),
            machine_state: MachineState::Partial,
            machine_data: vec![1],
        }
        .encode()
        .unwrap();

        let err = reg.apply_sync_snapshot(pid, &bytes);
        assert!(matches!(
            err,
            Err(MultiblockError::SnapshotKindMismatch { .. })
        ));
    }

    #[test]
    fn test_assert_detached_repairs_stale_handle() {
        let (mut reg, kind) = registry_with_kind();
        let pid = add(&mut reg, kind, 0, 0, 0);
        reg.detach_self(pid, false).unwrap();

        // Forge the inconsistency the repair path exists for.
        reg.parts.get_mut(&pid).unwrap().controller = Some(ControllerId(4242));
        reg.assert_detached(pid).unwrap();
        assert_eq!(reg.part(pid).unwrap().controller(), None);
    }

    #[test]
    fn test_machine_state_hooks_fire_on_transitions() {
        init_logs();
        let mut reg = MultiblockRegistry::new();
        let events = Rc::new(RefCell::new(Recorded::default()));
        let kind = reg
            .register_kind("test:reactor", Box::new(RecordingHooks(events.clone())))
            .unwrap();
        let pid = add(&mut reg, kind, 0, 0, 0);
        let cid = reg.controller_of(pid).unwrap();

        reg.set_machine_state(cid, MachineState::Assembled).unwrap();
        reg.set_machine_active(cid, true).unwrap();
        reg.set_machine_active(cid, true).unwrap();
        reg.set_machine_active(cid, false).unwrap();
        reg.set_machine_state(cid, MachineState::Partial).unwrap();

        let seen = events.borrow();
        assert_eq!(seen.assembled, 1);
        assert_eq!(seen.activated, 1);
        assert_eq!(seen.deactivated, 1);
        assert_eq!(seen.broken, 1);
    }

    #[test]
    fn test_retiring_assembled_controller_fires_broken() {
        init_logs();
        let mut reg = MultiblockRegistry::new();
        let events = Rc::new(RefCell::new(Recorded::default()));
        let kind = reg
            .register_kind("test:reactor", Box::new(RecordingHooks(events.clone())))
            .unwrap();
        let pid = add(&mut reg, kind, 0, 0, 0);
        let cid = reg.controller_of(pid).unwrap();
        reg.set_machine_state(cid, MachineState::Assembled).unwrap();
        reg.set_machine_active(cid, true).unwrap();

        reg.on_part_removed(pid).unwrap();

        assert_eq!(reg.controller_count(), 0);
        let seen = events.borrow();
        assert_eq!(seen.deactivated, 1);
        assert_eq!(seen.broken, 1);
    }

    #[test]
    fn test_rejects_duplicate_position_and_unknown_kind() {
        let (mut reg, kind) = registry_with_kind();
        add(&mut reg, kind, 0, 0, 0);

        let dup = reg.on_part_added(&AllLoaded, PartSpawn::new(BlockPos::new(0, 0, 0), kind));
        assert!(matches!(dup, Err(MultiblockError::PositionOccupied(_))));

        let unknown = reg.on_part_added(
            &AllLoaded,
            PartSpawn::new(BlockPos::new(5, 5, 5), MachineKind(99)),
        );
        assert!(matches!(unknown, Err(MultiblockError::UnknownKind(_))));
    }

    #[test]
    fn test_unloaded_neighbor_chunks_are_not_queried() {
        let (mut reg, kind) = registry_with_kind();

        let mut west = LoadedSet::new();
        west.load(ChunkPos::new(0, 0, 0));
        reg.on_part_added(&west, PartSpawn::new(BlockPos::new(15, 0, 0), kind))
            .unwrap();

        // The western chunk has unloaded by the time the eastern parts come
        // live; the boundary neighbor must be skipped, not merged with.
        let mut east = LoadedSet::new();
        east.load(ChunkPos::new(1, 0, 0));
        reg.on_part_added(&east, PartSpawn::new(BlockPos::new(16, 0, 0), kind))
            .unwrap();
        reg.on_part_added(&east, PartSpawn::new(BlockPos::new(17, 0, 0), kind))
            .unwrap();

        assert_eq!(reg.controller_count(), 2);
        assert_connectivity(&reg);
    }
}
