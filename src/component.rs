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

//! Component registry (component C): byte sizes, buffer-descriptor tables,
//! and shared-instance interning.
//!
//! Components are opaque plain-data blobs; this module never sees a
//! concrete Rust type. A typed convenience layer is a caller's concern, not
//! the core's.

use ahash::AHashMap;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

use crate::error::{EcsError, Result};

/// Disjoint id spaces a component id can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentSpace {
    Unique,
    Shared,
    Global,
}

/// Describes one buffer a component owns internally, which must be
/// deep-copied or freed whenever the component is moved, overwritten, or
/// destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDescriptor {
    /// A length-prefixed run of `elem_size`-byte elements at `offset` bytes
    /// into the component.
    StreamSlice { offset: usize, elem_size: usize },
    /// A single owned pointer at `offset` bytes into the component.
    OwnedPointer { offset: usize },
}

impl BufferDescriptor {
    pub fn offset(&self) -> usize {
        match self {
            BufferDescriptor::StreamSlice { offset, .. } => *offset,
            BufferDescriptor::OwnedPointer { offset } => *offset,
        }
    }
}

/// Registered metadata for one component id.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub size: usize,
    pub name: String,
    pub allocator_size: usize,
    pub buffer_descriptors: Vec<BufferDescriptor>,
    pub space: ComponentSpace,
}

impl ComponentInfo {
    pub fn owns_buffers(&self) -> bool {
        !self.buffer_descriptors.is_empty()
    }
}

/// Maximum byte size the registry accepts for one component.
pub const MAX_COMPONENT_SIZE: usize = 1 << 20;

/// A handle into the sparse stream of interned shared-component blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedInstance(pub u16);

struct SharedSlot {
    component: u16,
    data: Vec<u8>,
    content_hash: u64,
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    bytes.hash(&mut hasher);
    hasher.finish()
}

fn ensure_len<T>(vec: &mut Vec<Option<T>>, id: usize) {
    if vec.len() <= id {
        vec.resize_with(id + 1, || None);
    }
}

/// Types, sizes, per-component arenas, and shared-instance interning.
/// Sparsely indexed by component id; a `None` slot is unregistered.
#[derive(Default)]
pub struct ComponentRegistry {
    unique: Vec<Option<ComponentInfo>>,
    shared: Vec<Option<ComponentInfo>>,
    global: Vec<Option<ComponentInfo>>,
    shared_instances: Vec<Option<SharedSlot>>,
    free_instances: Vec<u16>,
    named_instances: AHashMap<String, (u16, SharedInstance)>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, space: ComponentSpace) -> &Vec<Option<ComponentInfo>> {
        match space {
            ComponentSpace::Unique => &self.unique,
            ComponentSpace::Shared => &self.shared,
            ComponentSpace::Global => &self.global,
        }
    }

    fn table_mut(&mut self, space: ComponentSpace) -> &mut Vec<Option<ComponentInfo>> {
        match space {
            ComponentSpace::Unique => &mut self.unique,
            ComponentSpace::Shared => &mut self.shared,
            ComponentSpace::Global => &mut self.global,
        }
    }

    fn register(
        &mut self,
        space: ComponentSpace,
        id: u16,
        size: usize,
        allocator_size: usize,
        name: &str,
        buffer_descriptors: Vec<BufferDescriptor>,
    ) -> Result<()> {
        if size > MAX_COMPONENT_SIZE {
            return Err(EcsError::ComponentTooLarge {
                component: id,
                size,
                max: MAX_COMPONENT_SIZE,
            });
        }
        if !buffer_descriptors.is_empty() && allocator_size == 0 {
            return Err(EcsError::ComponentAllocatorMissing(id));
        }

        let table = self.table_mut(space);
        ensure_len(table, id as usize);
        if table[id as usize].is_some() {
            return Err(EcsError::ComponentAlreadyRegistered(id));
        }
        table[id as usize] = Some(ComponentInfo {
            size,
            name: name.to_string(),
            allocator_size,
            buffer_descriptors,
            space,
        });
        Ok(())
    }

    pub fn register_unique(
        &mut self,
        id: u16,
        size: usize,
        allocator_size: usize,
        name: &str,
        buffer_descriptors: Vec<BufferDescriptor>,
    ) -> Result<()> {
        self.register(ComponentSpace::Unique, id, size, allocator_size, name, buffer_descriptors)
    }

    pub fn register_shared(
        &mut self,
        id: u16,
        size: usize,
        allocator_size: usize,
        name: &str,
        buffer_descriptors: Vec<BufferDescriptor>,
    ) -> Result<()> {
        self.register(ComponentSpace::Shared, id, size, allocator_size, name, buffer_descriptors)
    }

    pub fn register_global(&mut self, id: u16, size: usize, allocator_size: usize, name: &str) -> Result<()> {
        self.register(ComponentSpace::Global, id, size, allocator_size, name, Vec::new())
    }

    pub fn unregister(&mut self, space: ComponentSpace, id: u16) -> Result<()> {
        let table = self.table_mut(space);
        match table.get_mut(id as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(EcsError::ComponentNotRegistered(id)),
        }
    }

    /// Updates the byte size used to plan future per-component arenas.
    /// Callers must have already moved any live data before calling this;
    /// the registry holds no allocator of its own to perform the move.
    pub fn resize_component_allocator(&mut self, space: ComponentSpace, id: u16, new_size: usize) -> Result<()> {
        let table = self.table_mut(space);
        match table.get_mut(id as usize) {
            Some(Some(info)) => {
                info.allocator_size = new_size;
                Ok(())
            }
            _ => Err(EcsError::ComponentNotRegistered(id)),
        }
    }

    pub fn info(&self, space: ComponentSpace, id: u16) -> Result<&ComponentInfo> {
        self.table(space)
            .get(id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(EcsError::ComponentNotRegistered(id))
    }

    pub fn is_registered(&self, space: ComponentSpace, id: u16) -> bool {
        self.table(space).get(id as usize).is_some_and(|s| s.is_some())
    }

    /// Interns `data` as a shared instance of `comp`, deduplicating on
    /// content equality.
    pub fn create_shared_instance(&mut self, comp: u16, data: &[u8]) -> Result<SharedInstance> {
        self.info(ComponentSpace::Shared, comp)?;
        if let Some(existing) = self.find_shared_instance(comp, data) {
            return Ok(existing);
        }
        let slot = SharedSlot {
            component: comp,
            data: data.to_vec(),
            content_hash: content_hash(data),
        };
        let idx = if let Some(idx) = self.free_instances.pop() {
            self.shared_instances[idx as usize] = Some(slot);
            idx
        } else {
            let idx = self.shared_instances.len() as u16;
            self.shared_instances.push(Some(slot));
            idx
        };
        Ok(SharedInstance(idx))
    }

    /// Removes a shared instance. Callers (the entity manager) must check
    /// the instance is unreferenced by any archetype base first — this
    /// registry has no visibility into the archetype catalog.
    pub fn destroy_shared_instance(&mut self, comp: u16, inst: SharedInstance) -> Result<()> {
        let idx = inst.0 as usize;
        match self.shared_instances.get(idx) {
            Some(Some(s)) if s.component == comp => {
                self.shared_instances[idx] = None;
                self.free_instances.push(inst.0);
                Ok(())
            }
            _ => Err(EcsError::SharedInstanceMissing {
                component: comp,
                instance: inst.0,
            }),
        }
    }

    pub fn find_shared_instance(&self, comp: u16, data: &[u8]) -> Option<SharedInstance> {
        let hash = content_hash(data);
        self.shared_instances.iter().enumerate().find_map(|(idx, slot)| match slot {
            Some(s) if s.component == comp && s.content_hash == hash && s.data == data => {
                Some(SharedInstance(idx as u16))
            }
            _ => None,
        })
    }

    pub fn get_shared_data(&self, comp: u16, inst: SharedInstance) -> Result<&[u8]> {
        match self.shared_instances.get(inst.0 as usize) {
            Some(Some(s)) if s.component == comp => Ok(&s.data),
            _ => Err(EcsError::SharedInstanceMissing {
                component: comp,
                instance: inst.0,
            }),
        }
    }

    pub fn create_named(&mut self, name: &str, comp: u16, data: &[u8]) -> Result<SharedInstance> {
        let inst = self.create_shared_instance(comp, data)?;
        self.named_instances.insert(name.to_string(), (comp, inst));
        Ok(inst)
    }

    pub fn bind_named(&mut self, name: &str, comp: u16, inst: SharedInstance) -> Result<()> {
        self.get_shared_data(comp, inst)?;
        self.named_instances.insert(name.to_string(), (comp, inst));
        Ok(())
    }

    pub fn destroy_named(&mut self, name: &str) -> Result<()> {
        self.named_instances
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EcsError::NamedSharedInstanceMissing(name.to_string()))
    }

    pub fn get_named(&self, name: &str) -> Result<(u16, SharedInstance)> {
        self.named_instances
            .get(name)
            .copied()
            .ok_or_else(|| EcsError::NamedSharedInstanceMissing(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let mut reg = ComponentRegistry::new();
        reg.register_unique(1, 12, 0, "Position", Vec::new()).unwrap();
        let info = reg.info(ComponentSpace::Unique, 1).unwrap();
        assert_eq!(info.size, 12);
        assert_eq!(info.name, "Position");
    }

    #[test]
    fn double_register_fails() {
        let mut reg = ComponentRegistry::new();
        reg.register_unique(1, 4, 0, "X", Vec::new()).unwrap();
        assert!(matches!(
            reg.register_unique(1, 4, 0, "X", Vec::new()),
            Err(EcsError::ComponentAlreadyRegistered(1))
        ));
    }

    #[test]
    fn buffer_descriptors_require_allocator() {
        let mut reg = ComponentRegistry::new();
        let result = reg.register_unique(1, 16, 0, "Owned", vec![BufferDescriptor::OwnedPointer { offset: 8 }]);
        assert!(matches!(result, Err(EcsError::ComponentAllocatorMissing(1))));
    }

    #[test]
    fn shared_instance_dedup_by_content() {
        let mut reg = ComponentRegistry::new();
        reg.register_shared(1, 4, 0, "Material", Vec::new()).unwrap();
        let i1 = reg.create_shared_instance(1, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        let i2 = reg.find_shared_instance(1, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        assert_eq!(i1, i2);
    }

    #[test]
    fn destroy_unreferenced_instance_frees_slot() {
        let mut reg = ComponentRegistry::new();
        reg.register_shared(1, 4, 0, "Material", Vec::new()).unwrap();
        let inst = reg.create_shared_instance(1, &[1, 2, 3, 4]).unwrap();
        reg.destroy_shared_instance(1, inst).unwrap();
        assert!(reg.get_shared_data(1, inst).is_err());

        let inst2 = reg.create_shared_instance(1, &[5, 6, 7, 8]).unwrap();
        assert_eq!(inst2.0, inst.0);
    }

    #[test]
    fn named_instance_round_trip() {
        let mut reg = ComponentRegistry::new();
        reg.register_shared(1, 4, 0, "Material", Vec::new()).unwrap();
        reg.create_named("default_material", 1, &[0, 0, 0, 0]).unwrap();
        let (comp, inst) = reg.get_named("default_material").unwrap();
        assert_eq!(comp, 1);
        assert_eq!(reg.get_shared_data(1, inst).unwrap(), &[0, 0, 0, 0]);
    }
}
