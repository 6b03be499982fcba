// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entity identifiers and the entity pool (component B of the core).
//!
//! An [`Entity`] packs an index and a generation into a single 32-bit-index,
//! 32-bit-generation pair. `EntityInfo`'s own fields (`generation: u16`) only
//! make sense next to an index wider than 16 bits, so this crate uses a
//! 32/32 split packed into a `u64` for hashing and equality. See
//! `DESIGN.md` for the reasoning (grounded on
//! `nomai-ecs::entity::EntityId`'s identical generation-high/index-low `u64`
//! packing).

use std::fmt;

/// A generational entity handle: `{index, generation}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation)
    }
}

/// Bookkeeping stored per live (or freed) entity slot.
#[derive(Debug, Clone, Copy)]
pub struct EntityInfo {
    pub main_archetype: u32,
    pub base_archetype: u32,
    pub stream_index: u32,
    pub generation: u32,
    pub tag_bits: u8,
    pub layer: u8,
    alive: bool,
}

pub const ARCHETYPE_NONE: u32 = u32::MAX;

impl EntityInfo {
    fn free(generation: u32) -> Self {
        Self {
            main_archetype: ARCHETYPE_NONE,
            base_archetype: ARCHETYPE_NONE,
            stream_index: 0,
            generation,
            tag_bits: 0,
            layer: 0,
            alive: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

/// Dense id→location map and generation counter, with a free list for reuse.
pub struct EntityPool {
    slots: Vec<EntityInfo>,
    free_indices: Vec<u32>,
    live_count: usize,
}

impl Default for EntityPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_indices: Vec::new(),
            live_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Allocates a fresh entity, recycling a freed index when available.
    pub fn allocate(&mut self) -> Entity {
        self.live_count += 1;
        if let Some(index) = self.free_indices.pop() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            Entity::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            let mut info = EntityInfo::free(0);
            info.alive = true;
            self.slots.push(info);
            Entity::new(index, 0)
        }
    }

    /// Allocates `count` fresh entities and writes their initial `EntityInfo`,
    /// assigning contiguous `stream_index` values starting at
    /// `stream_index_base`.2's batch-allocate contract.
    pub fn allocate_batch(
        &mut self,
        count: usize,
        main_archetype: u32,
        base_archetype: u32,
        stream_index_base: u32,
    ) -> Vec<Entity> {
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let entity = self.allocate();
            let slot = &mut self.slots[entity.index() as usize];
            slot.main_archetype = main_archetype;
            slot.base_archetype = base_archetype;
            slot.stream_index = stream_index_base + i as u32;
            out.push(entity);
        }
        out
    }

    /// Invalidates `entity` by bumping its slot's generation.
    pub fn deallocate(&mut self, entity: Entity) {
        assert!(self.is_valid(entity), "deallocate of stale/invalid entity");
        let slot = &mut self.slots[entity.index() as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.alive = false;
        slot.main_archetype = ARCHETYPE_NONE;
        slot.base_archetype = ARCHETYPE_NONE;
        slot.tag_bits = 0;
        slot.layer = 0;
        self.free_indices.push(entity.index());
        self.live_count -= 1;
    }

    #[inline]
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index() as usize)
            .is_some_and(|slot| slot.alive && slot.generation == entity.generation())
    }

    pub fn info(&self, entity: Entity) -> Option<&EntityInfo> {
        if self.is_valid(entity) {
            self.slots.get(entity.index() as usize)
        } else {
            None
        }
    }

    pub fn info_mut(&mut self, entity: Entity) -> Option<&mut EntityInfo> {
        if self.is_valid(entity) {
            self.slots.get_mut(entity.index() as usize)
        } else {
            None
        }
    }

    /// Updates the archetype/row location recorded for a live entity.
    pub fn set_location(&mut self, entity: Entity, main: u32, base: u32, stream_index: u32) {
        if let Some(slot) = self.info_mut(entity) {
            slot.main_archetype = main;
            slot.base_archetype = base;
            slot.stream_index = stream_index;
        }
    }

    pub fn set_tag(&mut self, entity: Entity, bit: u8) {
        if let Some(slot) = self.info_mut(entity) {
            slot.tag_bits |= bit;
        }
    }

    pub fn clear_tag(&mut self, entity: Entity, bit: u8) {
        if let Some(slot) = self.info_mut(entity) {
            slot.tag_bits &= !bit;
        }
    }

    /// Checks all bits in `mask` are set. The multi-bit form is an all-of
    /// test, not any-of.
    pub fn has_tag(&self, entity: Entity, mask: u8) -> bool {
        self.info(entity)
            .is_some_and(|slot| slot.tag_bits & mask == mask)
    }

    /// Where `entity` currently lives in archetype storage, or `None` if it
    /// is not a live entity.
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        let info = self.info(entity)?;
        Some(EntityLocation {
            main_archetype: info.main_archetype,
            base_archetype: info.base_archetype,
            row: info.stream_index,
        })
    }
}

/// Location of an entity inside archetype storage (main archetype id, base
/// id, row index within the base).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub main_archetype: u32,
    pub base_archetype: u32,
    pub row: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_validate() {
        let mut pool = EntityPool::new();
        let e = pool.allocate();
        assert!(pool.is_valid(e));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn deallocate_bumps_generation_and_invalidates() {
        let mut pool = EntityPool::new();
        let e = pool.allocate();
        pool.deallocate(e);
        assert!(!pool.is_valid(e));
        assert_eq!(pool.len(), 0);

        let recycled = pool.allocate();
        assert_eq!(recycled.index(), e.index());
        assert_ne!(recycled.generation(), e.generation());
        assert!(pool.is_valid(recycled));
        assert!(!pool.is_valid(e), "stale handle must stay invalid after recycle");
    }

    #[test]
    fn batch_allocate_assigns_contiguous_stream_indices() {
        let mut pool = EntityPool::new();
        let batch = pool.allocate_batch(4, 7, 2, 10);
        for (i, e) in batch.iter().enumerate() {
            let info = pool.info(*e).unwrap();
            assert_eq!(info.main_archetype, 7);
            assert_eq!(info.base_archetype, 2);
            assert_eq!(info.stream_index, 10 + i as u32);
        }
    }

    #[test]
    fn tag_bits_are_all_of_not_any_of() {
        let mut pool = EntityPool::new();
        let e = pool.allocate();
        pool.set_tag(e, 0b001);
        pool.set_tag(e, 0b010);
        assert!(pool.has_tag(e, 0b001));
        assert!(pool.has_tag(e, 0b011));
        assert!(!pool.has_tag(e, 0b111));
    }

    #[test]
    fn entity_bits_round_trip() {
        let e = Entity::new(123, 45);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
    }

    #[test]
    fn location_reflects_batch_placement() {
        let mut pool = EntityPool::new();
        let batch = pool.allocate_batch(2, 7, 2, 10);
        let loc = pool.location(batch[1]).unwrap();
        assert_eq!(loc.main_archetype, 7);
        assert_eq!(loc.base_archetype, 2);
        assert_eq!(loc.row, 11);
    }

    #[test]
    fn location_is_none_for_freed_entity() {
        let mut pool = EntityPool::new();
        let e = pool.allocate();
        pool.deallocate(e);
        assert!(pool.location(e).is_none());
    }
}
