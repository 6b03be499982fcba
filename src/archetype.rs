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

//! Archetype (component E): a collection of [`ArchetypeBase`] chunks sharing
//! one (unique-signature, shared-signature) pair, plus the buffer-cleanup
//! metadata derived from the registry at creation time.
//!
//! Bases are append-only; destroying one is swap-with-last, the same
//! pattern `ArchetypeBase::remove_entity` uses for rows one level down.
//! There is no per-column destructor here the way the old `ComponentColumn`
//! had one — components are opaque bytes, so owned buffers are freed
//! explicitly through the registry's buffer descriptors instead of a typed
//! `Drop` impl.

use std::ptr::NonNull;

use crate::allocator::{Allocator, SystemAllocator};
use crate::archetype_base::ArchetypeBase;
use crate::component::{BufferDescriptor, ComponentRegistry, ComponentSpace, SharedInstance};
use crate::entity::{Entity, EntityPool};
use crate::error::{EcsError, Result};
use crate::signature::{SharedSignature, UniqueSignature, VectorSignature};

fn read_word(bytes: &[u8], offset: usize) -> usize {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    usize::from_ne_bytes(buf)
}

fn write_word(bytes: &mut [u8], offset: usize, value: usize) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

/// Frees the buffer `descriptor` points at inside `bytes`, then zeroes the
/// pointer (and length, for a stream slice) so a stale read sees "empty".
///
/// An `OwnedPointer` block is always exactly `allocator_size` bytes, the
/// component's declared owned-block size. A `StreamSlice` stores
/// `{ptr: usize, len: usize}` inline at its offset, `len` elements of
/// `elem_size` each.
fn free_descriptor(allocator: &SystemAllocator, bytes: &mut [u8], descriptor: &BufferDescriptor, allocator_size: usize) {
    match *descriptor {
        BufferDescriptor::OwnedPointer { offset } => {
            let ptr = read_word(bytes, offset);
            if ptr != 0 {
                let size = allocator_size.max(1);
                unsafe { allocator.dealloc(NonNull::new_unchecked(ptr as *mut u8), size, 1) };
                write_word(bytes, offset, 0);
            }
        }
        BufferDescriptor::StreamSlice { offset, elem_size } => {
            let ptr = read_word(bytes, offset);
            let len = read_word(bytes, offset + 8);
            if ptr != 0 {
                let size = (len * elem_size).max(1);
                unsafe { allocator.dealloc(NonNull::new_unchecked(ptr as *mut u8), size, 1) };
            }
            write_word(bytes, offset, 0);
            write_word(bytes, offset + 8, 0);
        }
    }
}

/// Deep-copies the buffer `descriptor` points at in `src` into `dst`,
/// allocating a fresh owned block via `allocator`. Symmetrical with
/// [`free_descriptor`].
fn copy_descriptor(allocator: &SystemAllocator, src: &[u8], dst: &mut [u8], descriptor: &BufferDescriptor, allocator_size: usize) {
    match *descriptor {
        BufferDescriptor::OwnedPointer { offset } => {
            let src_ptr = read_word(src, offset);
            if src_ptr == 0 {
                write_word(dst, offset, 0);
                return;
            }
            let size = allocator_size.max(1);
            let new_ptr = allocator.alloc(size, 1);
            unsafe { std::ptr::copy_nonoverlapping(src_ptr as *const u8, new_ptr.as_ptr(), size) };
            write_word(dst, offset, new_ptr.as_ptr() as usize);
        }
        BufferDescriptor::StreamSlice { offset, elem_size } => {
            let src_ptr = read_word(src, offset);
            let len = read_word(src, offset + 8);
            if src_ptr == 0 || len == 0 {
                write_word(dst, offset, 0);
                write_word(dst, offset + 8, 0);
                return;
            }
            let size = (len * elem_size).max(1);
            let new_ptr = allocator.alloc(size, 1);
            unsafe { std::ptr::copy_nonoverlapping(src_ptr as *const u8, new_ptr.as_ptr(), size) };
            write_word(dst, offset, new_ptr.as_ptr() as usize);
            write_word(dst, offset + 8, len);
        }
    }
}

/// One main archetype: the set of bases sharing a (unique, shared) signature
/// pair, plus the subset of unique components that own internal buffers.
pub struct Archetype {
    id: u32,
    unique_sig: UniqueSignature,
    shared_sig: SharedSignature,
    unique_vector: VectorSignature,
    shared_vector: VectorSignature,
    component_sizes: Vec<(u16, usize)>,
    deallocate_list: Vec<u16>,
    bases: Vec<ArchetypeBase>,
    shared_tuples: Vec<Vec<SharedInstance>>,
}

impl Archetype {
    /// Builds an (initially base-less) archetype for `unique_sig`/`shared_sig`,
    /// resolving unique component byte sizes and the buffer-owning subset
    /// from the registry ("the deallocate list equals the subset
    /// of unique components whose registry entry has ≥ 1 buffer descriptor").
    pub fn new(id: u32, unique_sig: UniqueSignature, shared_sig: SharedSignature, registry: &ComponentRegistry) -> Result<Self> {
        let mut component_sizes = Vec::with_capacity(unique_sig.len());
        let mut deallocate_list = Vec::new();
        for &comp in unique_sig.ids() {
            let info = registry.info(ComponentSpace::Unique, comp)?;
            component_sizes.push((comp, info.size));
            if info.owns_buffers() {
                deallocate_list.push(comp);
            }
        }
        let unique_vector = unique_sig.to_vector();
        let shared_vector = shared_sig.to_vector();
        Ok(Self {
            id,
            unique_sig,
            shared_sig,
            unique_vector,
            shared_vector,
            component_sizes,
            deallocate_list,
            bases: Vec::new(),
            shared_tuples: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn unique_signature(&self) -> &UniqueSignature {
        &self.unique_sig
    }

    pub fn shared_signature(&self) -> &SharedSignature {
        &self.shared_sig
    }

    pub fn unique_vector(&self) -> &VectorSignature {
        &self.unique_vector
    }

    pub fn shared_vector(&self) -> &VectorSignature {
        &self.shared_vector
    }

    pub fn deallocate_list(&self) -> &[u16] {
        &self.deallocate_list
    }

    pub fn base_count(&self) -> usize {
        self.bases.len()
    }

    pub fn base(&self, index: usize) -> Option<&ArchetypeBase> {
        self.bases.get(index)
    }

    pub fn base_mut(&mut self, index: usize) -> Option<&mut ArchetypeBase> {
        self.bases.get_mut(index)
    }

    pub fn shared_tuple(&self, index: usize) -> Option<&[SharedInstance]> {
        self.shared_tuples.get(index).map(|v| v.as_slice())
    }

    /// Appends a new, empty base pinning `shared_tuple`: bases
    /// are append-only within the archetype.
    pub fn create_base(&mut self, shared_tuple: Vec<SharedInstance>, starting_size: usize) -> usize {
        let mut base = ArchetypeBase::new(&self.component_sizes);
        if starting_size > 0 {
            base.reserve(starting_size);
        }
        self.bases.push(base);
        self.shared_tuples.push(shared_tuple);
        self.bases.len() - 1
    }

    /// Linear search over bases for one pinning exactly `shared_tuple`
    /// ("expected small").
    pub fn find_base(&self, shared_tuple: &[SharedInstance]) -> Option<usize> {
        self.shared_tuples.iter().position(|t| t.as_slice() == shared_tuple)
    }

    /// Destroys the base at `index` by swapping the last base into its slot,
    /// then fixes up the `base_archetype` field of every entity the swap
    /// moved.
    pub fn destroy_base(&mut self, index: usize, pool: &mut EntityPool) -> Result<()> {
        if index >= self.bases.len() {
            return Err(EcsError::BaseArchetypeMissing(self.id));
        }
        let last = self.bases.len() - 1;
        self.bases.swap_remove(index);
        self.shared_tuples.swap_remove(index);
        if index != last {
            let moved_entities = self.bases[index].entities().to_vec();
            for (row, entity) in moved_entities.into_iter().enumerate() {
                pool.set_location(entity, self.id, index as u32, row as u32);
            }
        }
        Ok(())
    }

    /// Appends `entities` to `base_index`, updating the pool's location for
    /// each. Returns the starting row.
    pub fn add_entities(&mut self, base_index: usize, entities: &[Entity], pool: &mut EntityPool) -> Result<usize> {
        let base = self.bases.get_mut(base_index).ok_or(EcsError::BaseArchetypeMissing(self.id))?;
        let start = base.add_entities(entities);
        for (i, &entity) in entities.iter().enumerate() {
            pool.set_location(entity, self.id, base_index as u32, (start + i) as u32);
        }
        Ok(start)
    }

    /// Swap-removes `row` from `base_index`, updating the pool's location
    /// for whichever entity the swap moved into `row`.
    pub fn remove_entity(&mut self, base_index: usize, row: usize, pool: &mut EntityPool) -> Result<()> {
        let base = self.bases.get_mut(base_index).ok_or(EcsError::BaseArchetypeMissing(self.id))?;
        if let Some(moved) = base.remove_entity(row) {
            pool.set_location(moved, self.id, base_index as u32, row as u32);
        }
        Ok(())
    }

    pub fn get_component(&self, base_index: usize, row: usize, component: u16) -> Option<&[u8]> {
        self.bases.get(base_index)?.get_component(row, component)
    }

    pub fn get_component_mut(&mut self, base_index: usize, row: usize, component: u16) -> Option<&mut [u8]> {
        self.bases.get_mut(base_index)?.get_component_mut(row, component)
    }

    /// Walks the deallocate list for `(base_index, row)`, freeing every
    /// owned buffer described by the registry.
    pub fn deallocate_entity_buffers(&mut self, base_index: usize, row: usize, registry: &ComponentRegistry) -> Result<()> {
        let allocator = SystemAllocator;
        for &comp in &self.deallocate_list {
            let info = registry.info(ComponentSpace::Unique, comp)?;
            let base = self.bases.get_mut(base_index).ok_or(EcsError::BaseArchetypeMissing(self.id))?;
            if let Some(bytes) = base.get_component_mut(row, comp) {
                for descriptor in &info.buffer_descriptors {
                    free_descriptor(&allocator, bytes, descriptor, info.allocator_size);
                }
            }
        }
        Ok(())
    }

    /// As [`deallocate_entity_buffers`], but only for the subset of
    /// `components` that actually own buffers, used when a `remove_components`
    /// edit drops specific columns rather than destroying the whole entity.
    ///
    /// [`deallocate_entity_buffers`]: Archetype::deallocate_entity_buffers
    pub fn deallocate_component_buffers(&mut self, base_index: usize, row: usize, components: &[u16], registry: &ComponentRegistry) -> Result<()> {
        let allocator = SystemAllocator;
        for &comp in &self.deallocate_list {
            if !components.contains(&comp) {
                continue;
            }
            let info = registry.info(ComponentSpace::Unique, comp)?;
            let base = self.bases.get_mut(base_index).ok_or(EcsError::BaseArchetypeMissing(self.id))?;
            if let Some(bytes) = base.get_component_mut(row, comp) {
                for descriptor in &info.buffer_descriptors {
                    free_descriptor(&allocator, bytes, descriptor, info.allocator_size);
                }
            }
        }
        Ok(())
    }

    /// Deep-copies owned buffers for `(base_index, row)` from pre-fetched
    /// source bytes, keyed by component id. Callers gather the source bytes
    /// (which may come from this same archetype, e.g. `copy_entity`) before
    /// calling, avoiding a self-referential borrow.
    pub fn copy_entity_buffers(
        &mut self,
        base_index: usize,
        row: usize,
        sources: &[(u16, Vec<u8>)],
        registry: &ComponentRegistry,
    ) -> Result<()> {
        let allocator = SystemAllocator;
        for &comp in &self.deallocate_list {
            let Some((_, src_bytes)) = sources.iter().find(|(id, _)| *id == comp) else {
                continue;
            };
            let info = registry.info(ComponentSpace::Unique, comp)?;
            let base = self.bases.get_mut(base_index).ok_or(EcsError::BaseArchetypeMissing(self.id))?;
            if let Some(dst_bytes) = base.get_component_mut(row, comp) {
                for descriptor in &info.buffer_descriptors {
                    copy_descriptor(&allocator, src_bytes, dst_bytes, descriptor, info.allocator_size);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_position() -> ComponentRegistry {
        let mut reg = ComponentRegistry::new();
        reg.register_unique(1, 12, 0, "Position", Vec::new()).unwrap();
        reg
    }

    fn entity(i: u32) -> Entity {
        Entity::new(i, 0)
    }

    #[test]
    fn create_base_and_add_entities_updates_pool() {
        let registry = registry_with_position();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let mut archetype = Archetype::new(0, sig, SharedSignature::new(), &registry).unwrap();
        let base_index = archetype.create_base(Vec::new(), 0);

        let mut pool = EntityPool::new();
        let e = pool.allocate();
        archetype.add_entities(base_index, &[e], &mut pool).unwrap();

        let info = pool.info(e).unwrap();
        assert_eq!(info.main_archetype, 0);
        assert_eq!(info.base_archetype, base_index as u32);
        assert_eq!(info.stream_index, 0);
    }

    #[test]
    fn destroy_base_fixes_up_moved_entities() {
        let registry = registry_with_position();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let mut archetype = Archetype::new(7, sig, SharedSignature::new(), &registry).unwrap();
        let base0 = archetype.create_base(vec![SharedInstance(0)], 0);
        let base1 = archetype.create_base(vec![SharedInstance(1)], 0);

        let mut pool = EntityPool::new();
        let e0 = pool.allocate();
        let e1 = pool.allocate();
        archetype.add_entities(base0, &[e0], &mut pool).unwrap();
        archetype.add_entities(base1, &[e1], &mut pool).unwrap();

        archetype.destroy_base(base0, &mut pool).unwrap();

        // e1's base (formerly index 1) was swapped into index 0.
        let info = pool.info(e1).unwrap();
        assert_eq!(info.base_archetype, 0);
        assert_eq!(archetype.base_count(), 1);
    }

    #[test]
    fn remove_entity_updates_swapped_entity_location() {
        let registry = registry_with_position();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let mut archetype = Archetype::new(0, sig, SharedSignature::new(), &registry).unwrap();
        let base_index = archetype.create_base(Vec::new(), 0);

        let mut pool = EntityPool::new();
        let entities: Vec<Entity> = (0..3).map(|_| pool.allocate()).collect();
        archetype.add_entities(base_index, &entities, &mut pool).unwrap();

        archetype.remove_entity(base_index, 0, &mut pool).unwrap();
        let info = pool.info(entities[2]).unwrap();
        assert_eq!(info.stream_index, 0);
    }

    #[test]
    fn deallocate_entity_buffers_frees_owned_pointer() {
        let mut registry = ComponentRegistry::new();
        registry
            .register_unique(1, 8, 32, "Owned", vec![BufferDescriptor::OwnedPointer { offset: 0 }])
            .unwrap();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let mut archetype = Archetype::new(0, sig, SharedSignature::new(), &registry).unwrap();
        let base_index = archetype.create_base(Vec::new(), 0);

        let allocator = SystemAllocator;
        let block = allocator.alloc(32, 1);
        archetype.add_entities(base_index, &[entity(0)], &mut EntityPool::new()).unwrap();
        {
            let bytes = archetype.get_component_mut(base_index, 0, 1).unwrap();
            write_word(bytes, 0, block.as_ptr() as usize);
        }

        archetype.deallocate_entity_buffers(base_index, 0, &registry).unwrap();
        let bytes = archetype.get_component(base_index, 0, 1).unwrap();
        assert_eq!(read_word(bytes, 0), 0);
    }

    #[test]
    fn copy_entity_buffers_deep_copies_owned_pointer() {
        let mut registry = ComponentRegistry::new();
        registry
            .register_unique(1, 8, 4, "Owned", vec![BufferDescriptor::OwnedPointer { offset: 0 }])
            .unwrap();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let mut archetype = Archetype::new(0, sig, SharedSignature::new(), &registry).unwrap();
        let base_index = archetype.create_base(Vec::new(), 0);
        archetype
            .add_entities(base_index, &[entity(0), entity(1)], &mut EntityPool::new())
            .unwrap();

        let allocator = SystemAllocator;
        let block = allocator.alloc(4, 1);
        unsafe { std::ptr::write_bytes(block.as_ptr(), 0xEF, 4) };
        let mut src_bytes = vec![0u8; 8];
        write_word(&mut src_bytes, 0, block.as_ptr() as usize);

        archetype
            .copy_entity_buffers(base_index, 1, &[(1, src_bytes)], &registry)
            .unwrap();

        let dst = archetype.get_component(base_index, 1, 1).unwrap();
        let dst_ptr = read_word(dst, 0);
        assert_ne!(dst_ptr, 0);
        assert_ne!(dst_ptr, block.as_ptr() as usize);
        let dst_slice = unsafe { std::slice::from_raw_parts(dst_ptr as *const u8, 4) };
        assert_eq!(dst_slice, &[0xEF; 4]);

        unsafe {
            allocator.dealloc(block, 4, 1);
            allocator.dealloc(NonNull::new_unchecked(dst_ptr as *mut u8), 4, 1);
        }
    }
}
