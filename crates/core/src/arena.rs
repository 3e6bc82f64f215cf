//! Region store: bump-allocated arenas collected whole (spec 3.3, 4.2).
//!
//! Grounded on the teacher's own use of `bumpalo` for arena allocation
//! (`crates/core/Cargo.toml`, `crates/runtime/src/memory_stats.rs` tracking
//! arena byte counts per thread). The teacher's arenas back raw-pointer
//! `SeqString` buffers directly; here a `Region` instead *retains* the
//! crystal `Value`s frozen into it (`retained`) so the whole region can be
//! dropped together when it becomes unreachable, while `bump` gives a real,
//! observable allocated-bytes counter for the diagnostics module even though
//! no `Value` payload is literally carved out of it — see DESIGN.md for why
//! a fully pointer-backed arena was not a safe fit for an owned-tree
//! `Value` model.

use std::collections::HashSet;

use bumpalo::Bump;

use crate::value::Value;

/// Where a value's region bookkeeping lives (spec 3.1's `region_id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionRef {
    /// Flux heap, or a type that doesn't carry region metadata.
    None,
    /// Created via `crystallize`/similar with no durable region backing —
    /// collected on the next GC cycle unless promoted.
    Ephemeral,
    Id(u64),
}

pub struct Region {
    pub id: u64,
    pub epoch: u64,
    bump: Bump,
    retained: Vec<Value>,
}

impl Region {
    fn new(id: u64, epoch: u64) -> Self {
        Region { id, epoch, bump: Bump::new(), retained: Vec::new() }
    }

    /// Anchor a crystal value's lifetime to this region. Since crystal
    /// values are immutable, retaining a structural clone alongside
    /// whatever binding the caller keeps is invisible to the program but
    /// gives the region something real to free on sweep.
    pub fn retain(&mut self, v: Value) {
        self.bump.alloc(v.approx_size());
        self.retained.push(v);
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bump.allocated_bytes()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegionStats {
    pub live_regions: usize,
    pub total_bytes: usize,
    pub total_retained: usize,
}

/// Owns every live region and hands out fresh ids/epochs (spec 4.2: "a
/// global epoch counter increments on every sweep").
pub struct RegionStore {
    next_id: u64,
    epoch: u64,
    regions: std::collections::HashMap<u64, Region>,
}

impl RegionStore {
    pub fn new() -> Self {
        RegionStore { next_id: 1, epoch: 0, regions: std::collections::HashMap::new() }
    }

    pub fn create_region(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.regions.insert(id, Region::new(id, self.epoch));
        id
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Region> {
        self.regions.get_mut(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Region> {
        self.regions.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.regions.contains_key(&id)
    }

    /// Drops every region whose id is not in `reachable`, returning how many
    /// were collected. Bumps the epoch counter regardless (spec 4.2 step 5).
    pub fn sweep(&mut self, reachable: &HashSet<u64>) -> usize {
        let before = self.regions.len();
        self.regions.retain(|id, _| reachable.contains(id));
        self.epoch += 1;
        before - self.regions.len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stats(&self) -> RegionStats {
        RegionStats {
            live_regions: self.regions.len(),
            total_bytes: self.regions.values().map(Region::allocated_bytes).sum(),
            total_retained: self.regions.values().map(Region::retained_count).sum(),
        }
    }

    pub fn all_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.regions.keys().copied()
    }
}

impl Default for RegionStore {
    fn default() -> Self {
        Self::new()
    }
}
