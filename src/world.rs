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

//! Entity manager (component F): the central `World` tying entity pool,
//! component registry, archetype catalog, hierarchy, query cache, command
//! stream, and temporary arena into one owner.
//!
//! Every structural edit exposes two surfaces: an immediate
//! `*_commit` that runs synchronously, and a deferred variant that appends a
//! [`CommandRecord`] to a [`CommandStream`] for replay at [`World::flush`].
//! The old design reached this through a typed `Bundle`/`Component` API;
//! here every surface works in opaque component ids and byte slices, the
//! same redesign `component.rs`/`archetype.rs` already made one layer down.

use ahash::AHashMap;

use crate::allocator::TemporaryArena;
use crate::archetype::Archetype;
use crate::archetype_base::ArchetypeBase;
use crate::command::{CommandRecord, CommandStream, CopyModeTag, RecordData};
use crate::component::{ComponentRegistry, ComponentSpace, SharedInstance};
use crate::entity::{Entity, EntityLocation, EntityPool};
use crate::error::{DebugInfo, EcsError, Result};
use crate::hierarchy::EntityHierarchy;
use crate::query::QueryCache;
use crate::signature::{SharedSignature, UniqueSignature};
use crate::system_manager::SystemManager;

/// Resolved column list (component id, byte size) in signature order, used
/// to decode a bulk copy-mode payload.
type ColumnLayout = Vec<(u16, usize)>;

/// Writes `count` freshly-added rows starting at `start` from `data`,
/// honoring one of the five bulk copy-mode layouts.
///
/// `ByEntity`/`ByComponents` read a table of `usize` pointers (one per row,
/// or one per column) into externally-owned memory; the `*Contiguous`
/// variants read the bytes directly out of `data` with no indirection.
fn apply_copy_mode(base: &mut ArchetypeBase, start: usize, count: usize, columns: &[(u16, usize)], data: &[u8], mode: CopyModeTag) {
    const PTR: usize = std::mem::size_of::<usize>();

    fn read_ptr(bytes: &[u8]) -> *const u8 {
        let mut buf = [0u8; PTR];
        buf.copy_from_slice(&bytes[..PTR]);
        usize::from_ne_bytes(buf) as *const u8
    }

    match mode {
        CopyModeTag::Splat => {
            let mut offset = 0;
            for &(comp, size) in columns {
                base.copy_splat_component(start, count, comp, &data[offset..offset + size]);
                offset += size;
            }
        }
        CopyModeTag::ByEntityContiguous => {
            let row_size: usize = columns.iter().map(|&(_, s)| s).sum();
            for row in 0..count {
                let row_bytes = &data[row * row_size..(row + 1) * row_size];
                let mut offset = 0;
                for &(comp, size) in columns {
                    base.set_component(start + row, comp, &row_bytes[offset..offset + size]);
                    offset += size;
                }
            }
        }
        CopyModeTag::ByEntity => {
            for row in 0..count {
                let ptr = read_ptr(&data[row * PTR..(row + 1) * PTR]);
                let mut offset = 0;
                for &(comp, size) in columns {
                    let value = unsafe { std::slice::from_raw_parts(ptr.add(offset), size) };
                    base.set_component(start + row, comp, value);
                    offset += size;
                }
            }
        }
        CopyModeTag::ByComponentsContiguous => {
            for (ci, &(comp, size)) in columns.iter().enumerate() {
                let ptr = read_ptr(&data[ci * PTR..(ci + 1) * PTR]);
                for row in 0..count {
                    let value = unsafe { std::slice::from_raw_parts(ptr.add(row * size), size) };
                    base.set_component(start + row, comp, value);
                }
            }
        }
        CopyModeTag::ByComponents => {
            let mut offset = 0;
            for &(comp, size) in columns {
                for row in 0..count {
                    base.set_component(start + row, comp, &data[offset..offset + size]);
                    offset += size;
                }
            }
        }
    }
}

/// Guard returned by [`World::lock_manager`]; releases the lock on drop.
/// This is the resource-manager integration seam — nothing in this crate's
/// own modules takes it, but the lock exists so a host that layers a
/// resource manager over the world has the real mutex to synchronize on.
pub struct ManagerLockGuard<'a> {
    _guard: parking_lot::MutexGuard<'a, ()>,
}

/// Central owner of entities, components, archetypes, and the subsystems
/// built on top of them.
pub struct World {
    entities: EntityPool,
    registry: ComponentRegistry,
    archetypes: Vec<Archetype>,
    archetype_index: AHashMap<(UniqueSignature, SharedSignature), u32>,
    hierarchy: EntityHierarchy,
    queries: QueryCache,
    command_stream: CommandStream,
    arena: TemporaryArena,
    system_manager: SystemManager,
    manager_lock: parking_lot::Mutex<()>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            entities: EntityPool::new(),
            registry: ComponentRegistry::new(),
            archetypes: Vec::new(),
            archetype_index: AHashMap::new(),
            hierarchy: EntityHierarchy::new(),
            queries: QueryCache::new(),
            command_stream: CommandStream::new(),
            arena: TemporaryArena::new(),
            system_manager: SystemManager::new(),
            manager_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    pub fn entities(&self) -> &EntityPool {
        &self.entities
    }

    pub fn hierarchy(&self) -> &EntityHierarchy {
        &self.hierarchy
    }

    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }

    pub fn queries_mut(&mut self) -> &mut QueryCache {
        &mut self.queries
    }

    pub fn system_manager(&self) -> &SystemManager {
        &self.system_manager
    }

    pub fn system_manager_mut(&mut self) -> &mut SystemManager {
        &mut self.system_manager
    }

    pub fn command_stream_mut(&mut self) -> &mut CommandStream {
        &mut self.command_stream
    }

    pub fn archetype(&self, id: u32) -> Option<&Archetype> {
        self.archetypes.get(id as usize)
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Where `entity` currently lives in archetype storage, for callers that
    /// need the triple without reaching into `EntityInfo` directly.
    pub fn entity_location(&self, entity: Entity) -> Option<EntityLocation> {
        self.entities.location(entity)
    }

    /// Signatures of every registered archetype, as the `(index, vector)`
    /// pairs `QueryCache::register_query` consumes.
    pub fn archetype_signatures(&self) -> Vec<(u32, crate::signature::VectorSignature)> {
        self.archetypes.iter().map(|a| (a.id(), *a.unique_vector())).collect()
    }

    /// Acquires the manager-integration lock.
    pub fn lock_manager(&self) -> ManagerLockGuard<'_> {
        ManagerLockGuard {
            _guard: self.manager_lock.lock(),
        }
    }

    fn column_layout(&self, sig: &UniqueSignature) -> Result<ColumnLayout> {
        sig.ids()
            .iter()
            .map(|&id| self.registry.info(ComponentSpace::Unique, id).map(|info| (id, info.size)))
            .collect()
    }

    fn find_or_create_archetype(&mut self, unique_sig: &UniqueSignature, shared_sig: &SharedSignature) -> Result<u32> {
        let key = (unique_sig.clone(), shared_sig.clone());
        if let Some(&id) = self.archetype_index.get(&key) {
            return Ok(id);
        }
        let id = self.archetypes.len() as u32;
        let archetype = Archetype::new(id, unique_sig.clone(), shared_sig.clone(), &self.registry)?;
        self.queries.update_add(id, archetype.unique_vector());
        self.archetypes.push(archetype);
        self.archetype_index.insert(key, id);
        Ok(id)
    }

    fn find_or_create_base(&mut self, archetype_id: u32, shared_tuple: Vec<SharedInstance>) -> usize {
        let archetype = &mut self.archetypes[archetype_id as usize];
        match archetype.find_base(&shared_tuple) {
            Some(idx) => idx,
            None => archetype.create_base(shared_tuple, 0),
        }
    }

    /// Builds the full, `new_sig`-ordered shared tuple for an edit that adds
    /// `added_sig`/`added_instances` to an entity whose current shared tuple
    /// is `(old_sig, old_tuple)`.
    fn merge_shared_tuple(new_sig: &SharedSignature, old_sig: &SharedSignature, old_tuple: &[SharedInstance], added_sig: &SharedSignature, added_instances: &[SharedInstance]) -> Vec<SharedInstance> {
        new_sig
            .ids()
            .iter()
            .map(|&id| {
                if let Some(pos) = old_sig.ids().iter().position(|&o| o == id) {
                    old_tuple[pos]
                } else {
                    let pos = added_sig.ids().iter().position(|&a| a == id).expect("id must come from old or added signature");
                    added_instances[pos]
                }
            })
            .collect()
    }

    // ---- immediate operations -------------------------------------------------

    /// Creates `count` entities in the (unique_sig, shared_sig, shared_tuple)
    /// archetype/base, writing `data` (if any) via `copy_mode`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_entities_commit(
        &mut self,
        count: usize,
        unique_sig: &UniqueSignature,
        shared_sig: &SharedSignature,
        shared_tuple: Vec<SharedInstance>,
        data: Option<&[u8]>,
        copy_mode: CopyModeTag,
        as_root: bool,
    ) -> Result<Vec<Entity>> {
        let archetype_id = self.find_or_create_archetype(unique_sig, shared_sig)?;
        let base_index = self.find_or_create_base(archetype_id, shared_tuple);

        let entities: Vec<Entity> = (0..count).map(|_| self.entities.allocate()).collect();
        let archetype = &mut self.archetypes[archetype_id as usize];
        let start = archetype.add_entities(base_index, &entities, &mut self.entities)?;

        if let Some(data) = data {
            let columns = self.column_layout(unique_sig)?;
            let archetype = &mut self.archetypes[archetype_id as usize];
            let base = archetype.base_mut(base_index).expect("base just created");
            apply_copy_mode(base, start, count, &columns, data, copy_mode);
        }

        if as_root {
            for &e in &entities {
                self.hierarchy.add_entry(None, e)?;
            }
        }
        Ok(entities)
    }

    /// Destroys `entities`: frees owned buffers, swap-removes from storage,
    /// detaches from the hierarchy, and bumps each generation.
    pub fn delete_entities_commit(&mut self, entities: &[Entity]) -> Result<()> {
        for &e in entities {
            let info = *self.entities.info(e).ok_or(EcsError::InvalidEntity(e))?;
            let archetype = self.archetypes.get_mut(info.main_archetype as usize).ok_or(EcsError::ArchetypeMissing)?;
            archetype.deallocate_entity_buffers(info.base_archetype as usize, info.stream_index as usize, &self.registry)?;
            archetype.remove_entity(info.base_archetype as usize, info.stream_index as usize, &mut self.entities)?;
            self.hierarchy.remove_entry(e, false);
            self.entities.deallocate(e);
        }
        Ok(())
    }

    /// Moves each entity into the archetype for `old_unique ∪ sig`,
    /// transferring surviving columns byte-for-byte and writing the newly
    /// added ones from `data`.
    ///
    /// `data`'s row order is assumed to match `entities`' order, laid out
    /// with one of the five copy-mode layouts over the new columns alone.
    /// This only decodes correctly when the whole batch lands in a single
    /// (archetype, base) pair, the common case of a homogeneous batch —
    /// rows move there in the same order they are appended, so the written
    /// range is exactly `entities`' contiguous image in the target base.
    pub fn add_components_commit(&mut self, entities: &[Entity], sig: &UniqueSignature, data: Option<&[u8]>, copy_mode: CopyModeTag) -> Result<()> {
        let columns = self.column_layout(sig)?;
        let mut target: Option<(u32, usize, usize)> = None; // (archetype, base, first new row)

        for &e in entities {
            let info = *self.entities.info(e).ok_or(EcsError::InvalidEntity(e))?;
            let old_archetype_id = info.main_archetype;
            let old_base_index = info.base_archetype as usize;
            let old_row = info.stream_index as usize;

            let old_archetype = &self.archetypes[old_archetype_id as usize];
            let old_unique = old_archetype.unique_signature().clone();
            let shared_sig = old_archetype.shared_signature().clone();
            let shared_tuple = old_archetype.shared_tuple(old_base_index).unwrap_or(&[]).to_vec();

            let new_unique = old_unique.union(sig).ok_or(EcsError::ArchetypeSignatureLimitExceeded {
                unique: old_unique.len() + sig.len(),
                shared: shared_sig.len(),
            })?;

            let new_archetype_id = self.find_or_create_archetype(&new_unique, &shared_sig)?;
            let new_base_index = self.find_or_create_base(new_archetype_id, shared_tuple);

            let surviving: Vec<(u16, Vec<u8>)> = old_unique
                .ids()
                .iter()
                .filter_map(|&id| self.archetypes[old_archetype_id as usize].get_component(old_base_index, old_row, id).map(|bytes| (id, bytes.to_vec())))
                .collect();

            let new_archetype = &mut self.archetypes[new_archetype_id as usize];
            let new_row = new_archetype.add_entities(new_base_index, std::slice::from_ref(&e), &mut self.entities)?;
            for (id, bytes) in surviving {
                if let Some(dst) = new_archetype.get_component_mut(new_base_index, new_row, id) {
                    dst.copy_from_slice(&bytes);
                }
            }
            target.get_or_insert((new_archetype_id, new_base_index, new_row));

            self.archetypes[old_archetype_id as usize].remove_entity(old_base_index, old_row, &mut self.entities)?;
        }

        if let (Some(data), Some((archetype_id, base_index, start))) = (data, target) {
            let base = self.archetypes[archetype_id as usize].base_mut(base_index).expect("base just used");
            apply_copy_mode(base, start, entities.len(), &columns, data, copy_mode);
        }
        Ok(())
    }

    /// Moves each entity into the archetype for `old_unique \ sig`, freeing
    /// the removed columns' owned buffers before the row is dropped.
    pub fn remove_components_commit(&mut self, entities: &[Entity], sig: &UniqueSignature) -> Result<()> {
        for &e in entities {
            let info = *self.entities.info(e).ok_or(EcsError::InvalidEntity(e))?;
            let old_archetype_id = info.main_archetype;
            let old_base_index = info.base_archetype as usize;
            let old_row = info.stream_index as usize;

            let old_archetype = &self.archetypes[old_archetype_id as usize];
            let old_unique = old_archetype.unique_signature().clone();
            let shared_sig = old_archetype.shared_signature().clone();
            let shared_tuple = old_archetype.shared_tuple(old_base_index).unwrap_or(&[]).to_vec();
            let new_unique = old_unique.difference(sig);

            let new_archetype_id = self.find_or_create_archetype(&new_unique, &shared_sig)?;
            let new_base_index = self.find_or_create_base(new_archetype_id, shared_tuple);

            let surviving: Vec<(u16, Vec<u8>)> = new_unique
                .ids()
                .iter()
                .filter_map(|&id| self.archetypes[old_archetype_id as usize].get_component(old_base_index, old_row, id).map(|bytes| (id, bytes.to_vec())))
                .collect();

            self.archetypes[old_archetype_id as usize].deallocate_component_buffers(old_base_index, old_row, sig.ids(), &self.registry)?;

            let new_archetype = &mut self.archetypes[new_archetype_id as usize];
            let new_row = new_archetype.add_entities(new_base_index, std::slice::from_ref(&e), &mut self.entities)?;
            for (id, bytes) in surviving {
                if let Some(dst) = new_archetype.get_component_mut(new_base_index, new_row, id) {
                    dst.copy_from_slice(&bytes);
                }
            }

            self.archetypes[old_archetype_id as usize].remove_entity(old_base_index, old_row, &mut self.entities)?;
        }
        Ok(())
    }

    /// As [`add_components_commit`], but over the shared signature: moves
    /// each entity to a base of the archetype for `old_shared ∪ sig`.
    pub fn add_shared_components_commit(&mut self, entities: &[Entity], sig: &SharedSignature, instances: &[SharedInstance]) -> Result<()> {
        for &e in entities {
            let info = *self.entities.info(e).ok_or(EcsError::InvalidEntity(e))?;
            let old_archetype_id = info.main_archetype;
            let old_base_index = info.base_archetype as usize;
            let old_row = info.stream_index as usize;

            let old_archetype = &self.archetypes[old_archetype_id as usize];
            let unique_sig = old_archetype.unique_signature().clone();
            let old_shared = old_archetype.shared_signature().clone();
            let old_tuple = old_archetype.shared_tuple(old_base_index).unwrap_or(&[]).to_vec();
            let new_shared = old_shared.union(sig).ok_or(EcsError::ArchetypeSignatureLimitExceeded {
                unique: unique_sig.len(),
                shared: old_shared.len() + sig.len(),
            })?;
            let new_tuple = Self::merge_shared_tuple(&new_shared, &old_shared, &old_tuple, sig, instances);

            let new_archetype_id = self.find_or_create_archetype(&unique_sig, &new_shared)?;
            let new_base_index = self.find_or_create_base(new_archetype_id, new_tuple);
            self.move_row(old_archetype_id, old_base_index, old_row, new_archetype_id, new_base_index, e, &unique_sig)?;
        }
        Ok(())
    }

    /// As [`remove_components_commit`], but over the shared signature.
    pub fn remove_shared_components_commit(&mut self, entities: &[Entity], sig: &SharedSignature) -> Result<()> {
        for &e in entities {
            let info = *self.entities.info(e).ok_or(EcsError::InvalidEntity(e))?;
            let old_archetype_id = info.main_archetype;
            let old_base_index = info.base_archetype as usize;
            let old_row = info.stream_index as usize;

            let old_archetype = &self.archetypes[old_archetype_id as usize];
            let unique_sig = old_archetype.unique_signature().clone();
            let old_shared = old_archetype.shared_signature().clone();
            let old_tuple = old_archetype.shared_tuple(old_base_index).unwrap_or(&[]).to_vec();
            let new_shared = old_shared.difference(sig);
            let new_tuple: Vec<SharedInstance> = new_shared.ids().iter().map(|&id| old_tuple[old_shared.ids().iter().position(|&o| o == id).unwrap()]).collect();

            let new_archetype_id = self.find_or_create_archetype(&unique_sig, &new_shared)?;
            let new_base_index = self.find_or_create_base(new_archetype_id, new_tuple);
            self.move_row(old_archetype_id, old_base_index, old_row, new_archetype_id, new_base_index, e, &unique_sig)?;
        }
        Ok(())
    }

    /// Rebinds one entity's shared instance for `component`, moving it
    /// between bases of the same main archetype. Destroys the vacated
    /// source base if it is left empty.
    pub fn change_shared_instance_commit(&mut self, elements: &[(Entity, u16, SharedInstance)]) -> Result<()> {
        for &(e, component, instance) in elements {
            let info = *self.entities.info(e).ok_or(EcsError::InvalidEntity(e))?;
            let archetype_id = info.main_archetype;
            let old_base_index = info.base_archetype as usize;
            let old_row = info.stream_index as usize;

            let archetype = &self.archetypes[archetype_id as usize];
            let unique_sig = archetype.unique_signature().clone();
            let shared_sig = archetype.shared_signature().clone();
            let mut new_tuple = archetype.shared_tuple(old_base_index).unwrap_or(&[]).to_vec();
            let pos = shared_sig.ids().iter().position(|&id| id == component).ok_or(EcsError::ComponentNotRegistered(component))?;
            new_tuple[pos] = instance;

            let new_base_index = self.find_or_create_base(archetype_id, new_tuple);
            self.move_row(archetype_id, old_base_index, old_row, archetype_id, new_base_index, e, &unique_sig)?;

            if self.archetypes[archetype_id as usize].base(old_base_index).is_some_and(|b| b.is_empty()) {
                self.archetypes[archetype_id as usize].destroy_base(old_base_index, &mut self.entities)?;
            }
        }
        Ok(())
    }

    /// Shared row-move primitive used by every edit that keeps an entity's
    /// unique column set fixed but relocates it to a different base: copies
    /// every unique column byte-for-byte, then swap-removes the old row.
    fn move_row(&mut self, old_archetype_id: u32, old_base_index: usize, old_row: usize, new_archetype_id: u32, new_base_index: usize, e: Entity, unique_sig: &UniqueSignature) -> Result<()> {
        if old_archetype_id == new_archetype_id && old_base_index == new_base_index {
            return Ok(());
        }
        let bytes: Vec<(u16, Vec<u8>)> = unique_sig
            .ids()
            .iter()
            .filter_map(|&id| self.archetypes[old_archetype_id as usize].get_component(old_base_index, old_row, id).map(|b| (id, b.to_vec())))
            .collect();

        let new_archetype = &mut self.archetypes[new_archetype_id as usize];
        let new_row = new_archetype.add_entities(new_base_index, std::slice::from_ref(&e), &mut self.entities)?;
        for (id, value) in bytes {
            if let Some(dst) = new_archetype.get_component_mut(new_base_index, new_row, id) {
                dst.copy_from_slice(&value);
            }
        }
        self.archetypes[old_archetype_id as usize].remove_entity(old_base_index, old_row, &mut self.entities)?;
        Ok(())
    }

    /// Creates `count` clones of `source`, splatting its component values
    /// and deep-copying any owned buffers so each clone has independent
    /// ownership. If `copy_children` is set, recursively clones `source`'s
    /// hierarchy subtree under each new clone.
    pub fn copy_entity_commit(&mut self, source: Entity, count: usize, copy_children: bool) -> Result<Vec<Entity>> {
        let info = *self.entities.info(source).ok_or(EcsError::InvalidEntity(source))?;
        let archetype_id = info.main_archetype;
        let base_index = info.base_archetype as usize;
        let src_row = info.stream_index as usize;

        let archetype = &self.archetypes[archetype_id as usize];
        let unique_sig = archetype.unique_signature().clone();
        let shared_tuple = archetype.shared_tuple(base_index).unwrap_or(&[]).to_vec();

        let source_bytes: Vec<(u16, Vec<u8>)> = unique_sig
            .ids()
            .iter()
            .filter_map(|&id| self.archetypes[archetype_id as usize].get_component(base_index, src_row, id).map(|b| (id, b.to_vec())))
            .collect();

        let clones: Vec<Entity> = (0..count).map(|_| self.entities.allocate()).collect();
        let archetype = &mut self.archetypes[archetype_id as usize];
        let start = archetype.add_entities(base_index, &clones, &mut self.entities)?;
        for (id, bytes) in &source_bytes {
            archetype.base_mut(base_index).expect("base just used").copy_splat_component(start, count, *id, bytes);
        }
        for row in start..start + count {
            archetype.copy_entity_buffers(base_index, row, &source_bytes, &self.registry)?;
        }

        if copy_children {
            let children = self.hierarchy.get_children(source).to_vec();
            for &clone in &clones {
                for &child in &children {
                    let child_clones = self.copy_entity_commit(child, 1, true)?;
                    if let Some(&child_clone) = child_clones.first() {
                        self.hierarchy.add_entry(Some(clone), child_clone)?;
                    }
                }
            }
        }
        Ok(clones)
    }

    pub fn create_shared_instance_commit(&mut self, component: u16, data: &[u8]) -> Result<SharedInstance> {
        self.registry.create_shared_instance(component, data)
    }

    pub fn destroy_shared_instance_commit(&mut self, component: u16, instance: SharedInstance) -> Result<()> {
        self.registry.destroy_shared_instance(component, instance)
    }

    pub fn bind_named_instance_commit(&mut self, name: &str, component: u16, instance: SharedInstance) -> Result<()> {
        self.registry.bind_named(name, component, instance)
    }

    pub fn destroy_named_instance_commit(&mut self, name: &str) -> Result<()> {
        self.registry.destroy_named(name)
    }

    pub fn add_hierarchy_entry_commit(&mut self, parent: Option<Entity>, child: Entity) -> Result<()> {
        self.hierarchy.add_entry(parent, child)
    }

    pub fn change_parent_commit(&mut self, old_parent: Entity, child: Entity) -> Result<()> {
        self.hierarchy.change_parent(old_parent, child)
    }

    pub fn change_or_set_parent_commit(&mut self, parent: Entity, child: Entity) -> Result<()> {
        self.hierarchy.change_or_set_parent(parent, child)
    }

    /// Detaches `e`; if `destroy_children` is set, also destroys its whole
    /// descendant subtree through [`delete_entities_commit`].
    pub fn remove_hierarchy_entry_commit(&mut self, e: Entity, destroy_children: bool) -> Result<()> {
        let subtree = self.hierarchy.remove_entry(e, destroy_children);
        if !subtree.is_empty() {
            self.delete_entities_commit(&subtree)?;
        }
        Ok(())
    }

    pub fn set_tag_commit(&mut self, e: Entity, bit: u8) {
        self.entities.set_tag(e, bit);
    }

    pub fn clear_tag_commit(&mut self, e: Entity, bit: u8) {
        self.entities.clear_tag(e, bit);
    }

    // ---- deferred surface -------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_entities(
        &mut self,
        count: usize,
        unique_sig: UniqueSignature,
        shared_sig: SharedSignature,
        shared_tuple: Vec<SharedInstance>,
        data: Option<&[u8]>,
        copy_mode: CopyModeTag,
        as_root: bool,
        debug: DebugInfo,
    ) -> Result<()> {
        let data = data.map(|d| RecordData::copied(&self.arena, d));
        self.command_stream.push(CommandRecord::CreateEntities {
            count: count as u32,
            unique_sig,
            shared_sig,
            shared_tuple,
            data,
            copy_mode,
            as_root,
            debug,
        })
    }

    pub fn destroy_entities(&mut self, entities: Vec<Entity>, debug: DebugInfo) -> Result<()> {
        self.command_stream.push(CommandRecord::DestroyEntities { entities, debug })
    }

    pub fn add_components(&mut self, entities: Vec<Entity>, sig: UniqueSignature, data: Option<&[u8]>, copy_mode: CopyModeTag, debug: DebugInfo) -> Result<()> {
        let data = data.map(|d| RecordData::copied(&self.arena, d));
        self.command_stream.push(CommandRecord::AddComponents { entities, sig, data, copy_mode, debug })
    }

    pub fn remove_components(&mut self, entities: Vec<Entity>, sig: UniqueSignature, debug: DebugInfo) -> Result<()> {
        self.command_stream.push(CommandRecord::RemoveComponents { entities, sig, debug })
    }

    /// Drains the command stream in push order, dispatching each record
    /// through [`dispatch_record`], then rewinds the temporary arena and
    /// leaves the stream empty.
    pub fn flush(&mut self) -> Result<()> {
        let records: Vec<CommandRecord> = self.command_stream.drain().collect();
        for record in records {
            self.dispatch_record(record)?;
        }
        self.arena.rewind();
        Ok(())
    }

    fn dispatch_record(&mut self, record: CommandRecord) -> Result<()> {
        crate::error::set_crash_context(record.debug_info());
        match record {
            CommandRecord::CreateEntities {
                count,
                unique_sig,
                shared_sig,
                shared_tuple,
                data,
                copy_mode,
                as_root,
                ..
            } => {
                // SAFETY: the arena has not been rewound since this record
                // was pushed onto the same stream we are currently draining.
                let data = data.as_ref().map(|d| unsafe { d.as_slice() });
                self.create_entities_commit(count as usize, &unique_sig, &shared_sig, shared_tuple, data, copy_mode, as_root)?;
                Ok(())
            }
            CommandRecord::DestroyEntities { entities, .. } => self.delete_entities_commit(&entities),
            CommandRecord::AddComponents { entities, sig, data, copy_mode, .. } => {
                let data = data.as_ref().map(|d| unsafe { d.as_slice() });
                self.add_components_commit(&entities, &sig, data, copy_mode)
            }
            CommandRecord::RemoveComponents { entities, sig, .. } => self.remove_components_commit(&entities, &sig),
            CommandRecord::AddSharedComponents { entities, sig, instances, .. } => self.add_shared_components_commit(&entities, &sig, &instances),
            CommandRecord::RemoveSharedComponents { entities, sig, .. } => self.remove_shared_components_commit(&entities, &sig),
            CommandRecord::ChangeSharedInstance { entity, component, instance, .. } => self.change_shared_instance_commit(&[(entity, component, instance)]),
            CommandRecord::CopyEntity { source, count, copy_children, .. } => self.copy_entity_commit(source, count as usize, copy_children).map(|_| ()),
            CommandRecord::CreateSharedInstance { component, data, .. } => {
                let bytes = unsafe { data.as_slice() }.to_vec();
                self.create_shared_instance_commit(component, &bytes).map(|_| ())
            }
            CommandRecord::DestroySharedInstance { component, instance, .. } => self.destroy_shared_instance_commit(component, instance),
            CommandRecord::BindNamedInstance { name, component, instance, .. } => self.bind_named_instance_commit(&name, component, instance),
            CommandRecord::DestroyNamedInstance { name, .. } => self.destroy_named_instance_commit(&name),
            CommandRecord::CreateArchetypeBase { main_archetype, shared_tuple, .. } => {
                self.find_or_create_base(main_archetype, shared_tuple);
                Ok(())
            }
            CommandRecord::DestroyArchetypeBase { main_archetype, base_index, .. } => {
                let archetype = self.archetypes.get_mut(main_archetype as usize).ok_or(EcsError::ArchetypeMissing)?;
                archetype.destroy_base(base_index as usize, &mut self.entities)
            }
            CommandRecord::HierarchyAddEntry { parent, child, .. } => self.add_hierarchy_entry_commit(parent, child),
            CommandRecord::HierarchyChangeParent { old_parent, child, .. } => self.change_parent_commit(old_parent, child),
            CommandRecord::HierarchyChangeOrSetParent { parent, child, .. } => self.change_or_set_parent_commit(parent, child),
            CommandRecord::HierarchyRemoveEntry { entity, destroy_children, .. } => self.remove_hierarchy_entry_commit(entity, destroy_children),
            CommandRecord::SetTag { entity, bit, .. } => {
                self.set_tag_commit(entity, bit);
                Ok(())
            }
            CommandRecord::ClearTag { entity, bit, .. } => {
                self.clear_tag_commit(entity, bit);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::BufferDescriptor;

    fn debug() -> DebugInfo {
        crate::debug_info!()
    }

    fn setup_position_world() -> World {
        let mut world = World::new();
        world.registry_mut().register_unique(1, 8, 0, "Position", Vec::new()).unwrap();
        world
    }

    #[test]
    fn create_entities_commit_writes_splat_data() {
        let mut world = setup_position_world();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let value = 42i64.to_ne_bytes();
        let entities = world
            .create_entities_commit(3, &sig, &SharedSignature::new(), Vec::new(), Some(&value), CopyModeTag::Splat, false)
            .unwrap();
        assert_eq!(entities.len(), 3);
        for &e in &entities {
            let info = world.entities().info(e).unwrap();
            let archetype = world.archetype(info.main_archetype).unwrap();
            let bytes = archetype.get_component(info.base_archetype as usize, info.stream_index as usize, 1).unwrap();
            assert_eq!(bytes, &value);
        }
    }

    #[test]
    fn delete_entities_commit_invalidates_handles() {
        let mut world = setup_position_world();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let entities = world.create_entities_commit(2, &sig, &SharedSignature::new(), Vec::new(), None, CopyModeTag::Splat, false).unwrap();
        world.delete_entities_commit(&entities).unwrap();
        for &e in &entities {
            assert!(world.entities().info(e).is_none());
        }
    }

    #[test]
    fn add_components_commit_moves_to_new_archetype_and_preserves_data() {
        let mut world = setup_position_world();
        world.registry_mut().register_unique(2, 4, 0, "Velocity", Vec::new()).unwrap();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let value = 7i64.to_ne_bytes();
        let entities = world
            .create_entities_commit(1, &sig, &SharedSignature::new(), Vec::new(), Some(&value), CopyModeTag::Splat, false)
            .unwrap();

        let add_sig = UniqueSignature::from_ids(&[2]).unwrap();
        let vel = 3i32.to_ne_bytes();
        world.add_components_commit(&entities, &add_sig, Some(&vel), CopyModeTag::ByEntityContiguous).unwrap();

        let info = *world.entities().info(entities[0]).unwrap();
        let archetype = world.archetype(info.main_archetype).unwrap();
        assert_eq!(archetype.unique_signature().ids(), &[1, 2]);
        let pos = archetype.get_component(info.base_archetype as usize, info.stream_index as usize, 1).unwrap();
        assert_eq!(pos, &value);
        let velocity = archetype.get_component(info.base_archetype as usize, info.stream_index as usize, 2).unwrap();
        assert_eq!(velocity, &vel);
    }

    #[test]
    fn remove_components_commit_drops_column() {
        let mut world = setup_position_world();
        world.registry_mut().register_unique(2, 4, 0, "Velocity", Vec::new()).unwrap();
        let sig = UniqueSignature::from_ids(&[1, 2]).unwrap();
        let entities = world.create_entities_commit(1, &sig, &SharedSignature::new(), Vec::new(), None, CopyModeTag::Splat, false).unwrap();

        let remove_sig = UniqueSignature::from_ids(&[2]).unwrap();
        world.remove_components_commit(&entities, &remove_sig).unwrap();

        let info = *world.entities().info(entities[0]).unwrap();
        let archetype = world.archetype(info.main_archetype).unwrap();
        assert_eq!(archetype.unique_signature().ids(), &[1]);
    }

    #[test]
    fn change_shared_instance_commit_moves_between_bases() {
        let mut world = setup_position_world();
        world.registry_mut().register_shared(10, 4, 0, "Team", Vec::new()).unwrap();
        let red = world.create_shared_instance_commit(10, &[1, 0, 0, 0]).unwrap();
        let blue = world.create_shared_instance_commit(10, &[2, 0, 0, 0]).unwrap();

        let unique = UniqueSignature::from_ids(&[1]).unwrap();
        let shared = SharedSignature::from_ids(&[10]).unwrap();
        let entities = world.create_entities_commit(1, &unique, &shared, vec![red], None, CopyModeTag::Splat, false).unwrap();

        world.change_shared_instance_commit(&[(entities[0], 10, blue)]).unwrap();

        let info = *world.entities().info(entities[0]).unwrap();
        let archetype = world.archetype(info.main_archetype).unwrap();
        let tuple = archetype.shared_tuple(info.base_archetype as usize).unwrap();
        assert_eq!(tuple, &[blue]);
    }

    #[test]
    fn copy_entity_commit_deep_copies_owned_buffers() {
        let mut world = World::new();
        world
            .registry_mut()
            .register_unique(1, 8, 4, "Owned", vec![BufferDescriptor::OwnedPointer { offset: 0 }])
            .unwrap();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let entities = world.create_entities_commit(1, &sig, &SharedSignature::new(), Vec::new(), None, CopyModeTag::Splat, false).unwrap();

        let allocator = crate::allocator::SystemAllocator;
        use crate::allocator::Allocator;
        let block = allocator.alloc(4, 1);
        unsafe { std::ptr::write_bytes(block.as_ptr(), 0xCD, 4) };
        let info = *world.entities().info(entities[0]).unwrap();
        let archetype_id = info.main_archetype;
        {
            let archetype = &mut world.archetypes[archetype_id as usize];
            let bytes = archetype.get_component_mut(info.base_archetype as usize, info.stream_index as usize, 1).unwrap();
            bytes[..8].copy_from_slice(&(block.as_ptr() as usize as u64).to_ne_bytes());
        }

        let clones = world.copy_entity_commit(entities[0], 1, false).unwrap();
        let clone_info = *world.entities().info(clones[0]).unwrap();
        let clone_archetype = world.archetype(clone_info.main_archetype).unwrap();
        let clone_bytes = clone_archetype.get_component(clone_info.base_archetype as usize, clone_info.stream_index as usize, 1).unwrap();
        let mut ptr_buf = [0u8; 8];
        ptr_buf.copy_from_slice(&clone_bytes[..8]);
        let clone_ptr = u64::from_ne_bytes(ptr_buf) as usize;
        assert_ne!(clone_ptr, 0);
        assert_ne!(clone_ptr, block.as_ptr() as usize);
    }

    #[test]
    fn flush_drains_stream_and_rewinds_arena() {
        let mut world = setup_position_world();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let entities = world.create_entities_commit(1, &sig, &SharedSignature::new(), Vec::new(), None, CopyModeTag::Splat, false).unwrap();

        world.destroy_entities(entities.clone(), debug()).unwrap();
        assert_eq!(world.command_stream_mut().len(), 1);
        world.flush().unwrap();
        assert_eq!(world.command_stream_mut().len(), 0);
        assert!(world.entities().info(entities[0]).is_none());
    }

    #[test]
    fn remove_hierarchy_entry_with_destroy_deletes_subtree() {
        let mut world = setup_position_world();
        let sig = UniqueSignature::from_ids(&[1]).unwrap();
        let parent = world.create_entities_commit(1, &sig, &SharedSignature::new(), Vec::new(), None, CopyModeTag::Splat, true).unwrap()[0];
        let child = world.create_entities_commit(1, &sig, &SharedSignature::new(), Vec::new(), None, CopyModeTag::Splat, false).unwrap()[0];
        world.add_hierarchy_entry_commit(Some(parent), child).unwrap();

        world.remove_hierarchy_entry_commit(parent, true).unwrap();
        assert!(world.entities().info(child).is_none());
    }

    #[test]
    fn lock_manager_round_trips() {
        let world = World::new();
        let _guard = world.lock_manager();
    }
}
