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

//! Archetype base (component D): the column-oriented chunk that actually
//! owns component bytes for one set of shared-instance bindings.
//!
//! Each base is backed by a single heap allocation sliced into per-column
//! regions, one per unique component id in the owning archetype's
//! signature, each region starting on a cache-line boundary. Growth
//! reallocates the whole block and copies every column forward, the same
//! "one allocation per chunk" layout `archetype.rs`'s `ComponentColumn`
//! used per-column, generalized here to span every column at once so a row
//! move only touches one allocation's worth of bookkeeping rather than one
//! per column.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::entity::Entity;
use crate::utils::align_to;

const CACHE_LINE: usize = 64;
const INITIAL_CAPACITY: usize = 4;

struct Column {
    component: u16,
    elem_size: usize,
    offset: usize,
}

/// Copy semantics for moving one entity's component bytes from a source row
/// in another base into a newly allocated row here (the five
/// copy modes operate above this layer; this is the primitive they use).
pub enum CopyMode<'a> {
    /// Copy every column present in both bases for this one row.
    ByEntity,
    /// Copy only the named component ids.
    ByComponents(&'a [u16]),
}

/// A single column-oriented storage chunk: one allocation, N columns, M
/// live rows, grown geometrically.
pub struct ArchetypeBase {
    columns: Vec<Column>,
    row_size: usize,
    data: Option<NonNull<u8>>,
    capacity: usize,
    len: usize,
    entities: Vec<Entity>,
}

unsafe impl Send for ArchetypeBase {}
unsafe impl Sync for ArchetypeBase {}

impl ArchetypeBase {
    /// Builds a base whose columns are laid out, in order, for the given
    /// `(component_id, elem_size)` pairs. Ids should already be sorted, the
    /// invariant `UniqueSignature` maintains.
    pub fn new(component_sizes: &[(u16, usize)]) -> Self {
        let mut offset = 0usize;
        let mut columns = Vec::with_capacity(component_sizes.len());
        for &(component, elem_size) in component_sizes {
            offset = align_to(offset, CACHE_LINE);
            columns.push(Column {
                component,
                elem_size,
                offset,
            });
            offset += elem_size.max(1);
        }
        Self {
            columns,
            row_size: offset,
            data: None,
            capacity: 0,
            len: 0,
            entities: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    fn column(&self, component: u16) -> Option<&Column> {
        self.columns.iter().find(|c| c.component == component)
    }

    fn layout_for(&self, capacity: usize) -> Option<Layout> {
        if capacity == 0 || self.row_size == 0 {
            return None;
        }
        Layout::from_size_align(self.row_size * capacity, CACHE_LINE).ok()
    }

    /// Grows backing storage to hold at least `min_capacity` rows,
    /// reallocating the single block and copying every column's live
    /// prefix forward into the new layout.
    pub fn reserve(&mut self, min_capacity: usize) {
        if min_capacity <= self.capacity {
            return;
        }
        let grown = self.capacity + self.capacity / 2;
        let new_capacity = grown.max(INITIAL_CAPACITY).max(min_capacity);
        let new_layout = match self.layout_for(new_capacity) {
            Some(layout) => layout,
            None => {
                self.capacity = new_capacity;
                return;
            }
        };
        let new_ptr = unsafe { alloc::alloc_zeroed(new_layout) };
        let new_ptr = NonNull::new(new_ptr).unwrap_or_else(|| alloc::handle_alloc_error(new_layout));

        if let Some(old_ptr) = self.data {
            for column in &self.columns {
                let stride = column.elem_size.max(1);
                let old_base = unsafe { old_ptr.as_ptr().add(column.offset) };
                let new_base = unsafe { new_ptr.as_ptr().add(column.offset) };
                for row in 0..self.len {
                    unsafe {
                        std::ptr::copy_nonoverlapping(old_base.add(row * stride), new_base.add(row * stride), stride);
                    }
                }
            }
            if let Some(old_layout) = self.layout_for(self.capacity) {
                unsafe { alloc::dealloc(old_ptr.as_ptr(), old_layout) };
            }
        }

        self.data = Some(new_ptr);
        self.capacity = new_capacity;
    }

    /// Appends `count` zeroed rows for `entities`, growing storage first if
    /// necessary. Returns the starting row index of the new block.
    pub fn add_entities(&mut self, entities: &[Entity]) -> usize {
        self.reserve(self.len + entities.len());
        let start = self.len;
        self.entities.extend_from_slice(entities);
        self.len += entities.len();
        start
    }

    /// Swap-removes `row`, returning the entity that was moved into its
    /// place, if any.
    pub fn remove_entity(&mut self, row: usize) -> Option<Entity> {
        assert!(row < self.len, "row out of bounds");
        let last = self.len - 1;
        if row != last {
            for column in &self.columns {
                let stride = column.elem_size.max(1);
                let base = unsafe { self.data.unwrap().as_ptr().add(column.offset) };
                unsafe {
                    let src = base.add(last * stride);
                    let dst = base.add(row * stride);
                    std::ptr::copy_nonoverlapping(src, dst, stride);
                }
            }
        }
        self.entities.swap_remove(row);
        self.len -= 1;
        if row < self.len {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Raw byte view of `component`'s column value at `row`, if present.
    pub fn get_component(&self, row: usize, component: u16) -> Option<&[u8]> {
        if row >= self.len {
            return None;
        }
        let column = self.column(component)?;
        let stride = column.elem_size.max(1);
        let base = unsafe { self.data?.as_ptr().add(column.offset) };
        let ptr = unsafe { base.add(row * stride) };
        Some(unsafe { std::slice::from_raw_parts(ptr, column.elem_size) })
    }

    /// Mutable raw byte view of `component`'s column value at `row`.
    pub fn get_component_mut(&mut self, row: usize, component: u16) -> Option<&mut [u8]> {
        if row >= self.len {
            return None;
        }
        let column = self.column(component)?;
        let stride = column.elem_size.max(1);
        let base = unsafe { self.data?.as_ptr().add(column.offset) };
        let ptr = unsafe { base.add(row * stride) };
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, column.elem_size) })
    }

    /// Writes `value` into `component`'s column at `row`. `value.len()` must
    /// equal the column's registered element size.
    pub fn set_component(&mut self, row: usize, component: u16, value: &[u8]) {
        let dst = self
            .get_component_mut(row, component)
            .expect("row/component out of range");
        assert_eq!(dst.len(), value.len(), "component size mismatch");
        dst.copy_from_slice(value);
    }

    /// Splats a single component value into every row from `start` up to
    /// (exclusive) `start + count` — the "copy splat" bulk-write mode.
    pub fn copy_splat_component(&mut self, start: usize, count: usize, component: u16, value: &[u8]) {
        for row in start..start + count {
            self.set_component(row, component, value);
        }
    }

    /// Copies the row at `src_row` in `source` into `dst_row` here, for
    /// every column named in `mode` that exists in both bases.
    pub fn copy_row_from(&mut self, dst_row: usize, source: &ArchetypeBase, src_row: usize, mode: CopyMode<'_>) {
        let ids: Vec<u16> = match mode {
            CopyMode::ByEntity => self.columns.iter().map(|c| c.component).collect(),
            CopyMode::ByComponents(ids) => ids.to_vec(),
        };
        for id in ids {
            if let Some(value) = source.get_component(src_row, id) {
                if self.column(id).is_some() {
                    let value = value.to_vec();
                    self.set_component(dst_row, id, &value);
                }
            }
        }
    }

    pub fn component_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.columns.iter().map(|c| c.component)
    }
}

impl Drop for ArchetypeBase {
    fn drop(&mut self) {
        if let Some(ptr) = self.data {
            if let Some(layout) = self.layout_for(self.capacity) {
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
        }
    }
}
