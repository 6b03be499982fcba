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

//! Command stream (component I): an append-only log of deferred structural
//! mutations, replayed in push order at flush time.
//!
//! The old design boxed a `FnOnce(&mut World) -> Result<()>` per command;
//! that doesn't survive the move to opaque byte components, since a closure
//! capturing a typed value can no longer exist once there is no type to
//! capture. In its place: a tagged union of record kinds and a
//! `match`-based dispatch table. Bulk component payloads are copied into a
//! [`TemporaryArena`] at push time; everything else (entity lists, small
//! signatures) is owned directly by the record.

use std::ptr::NonNull;

use crate::allocator::TemporaryArena;
use crate::component::SharedInstance;
use crate::entity::Entity;
use crate::error::{DebugInfo, EcsError, Result};
use crate::signature::{SharedSignature, UniqueSignature};

/// Copy mode for bulk component writes: which of the five layouts a batch
/// write uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyModeTag {
    Splat,
    ByEntity,
    ByEntityContiguous,
    ByComponents,
    ByComponentsContiguous,
}

/// A bulk payload attached to a record: either a pointer the caller
/// guarantees stays valid until flush, or an owning copy carved from the
/// world's temporary arena ("a record captures either a stable
/// pointer supplied by the caller... or an owning copy in the temporary
/// arena").
#[derive(Clone, Copy)]
pub enum RecordData {
    Stable(NonNull<u8>, usize),
    Owned(NonNull<[u8]>),
}

impl RecordData {
    /// Copies `bytes` into `arena` and wraps the result.
    pub fn copied(arena: &TemporaryArena, bytes: &[u8]) -> Self {
        RecordData::Owned(arena.alloc_copy(bytes))
    }

    /// # Safety
    /// For `Stable`, the caller must guarantee the pointer is still valid;
    /// for `Owned`, the arena must not have been rewound since this record
    /// was pushed.
    pub unsafe fn as_slice(&self) -> &[u8] {
        match *self {
            RecordData::Stable(ptr, len) => std::slice::from_raw_parts(ptr.as_ptr(), len),
            RecordData::Owned(slice) => slice.as_ref(),
        }
    }
}

/// One deferred structural mutation: a tagged union over every structural
/// edit a caller can defer. Each variant carries its own [`DebugInfo`] so a
/// commit failure can report the call site that queued it.
pub enum CommandRecord {
    CreateEntities {
        count: u32,
        unique_sig: UniqueSignature,
        shared_sig: SharedSignature,
        shared_tuple: Vec<SharedInstance>,
        data: Option<RecordData>,
        copy_mode: CopyModeTag,
        as_root: bool,
        debug: DebugInfo,
    },
    DestroyEntities {
        entities: Vec<Entity>,
        debug: DebugInfo,
    },
    AddComponents {
        entities: Vec<Entity>,
        sig: UniqueSignature,
        data: Option<RecordData>,
        copy_mode: CopyModeTag,
        debug: DebugInfo,
    },
    RemoveComponents {
        entities: Vec<Entity>,
        sig: UniqueSignature,
        debug: DebugInfo,
    },
    AddSharedComponents {
        entities: Vec<Entity>,
        sig: SharedSignature,
        instances: Vec<SharedInstance>,
        debug: DebugInfo,
    },
    RemoveSharedComponents {
        entities: Vec<Entity>,
        sig: SharedSignature,
        debug: DebugInfo,
    },
    ChangeSharedInstance {
        entity: Entity,
        component: u16,
        instance: SharedInstance,
        debug: DebugInfo,
    },
    CopyEntity {
        source: Entity,
        count: u32,
        copy_children: bool,
        debug: DebugInfo,
    },
    CreateSharedInstance {
        component: u16,
        data: RecordData,
        debug: DebugInfo,
    },
    DestroySharedInstance {
        component: u16,
        instance: SharedInstance,
        debug: DebugInfo,
    },
    BindNamedInstance {
        name: String,
        component: u16,
        instance: SharedInstance,
        debug: DebugInfo,
    },
    DestroyNamedInstance {
        name: String,
        debug: DebugInfo,
    },
    CreateArchetypeBase {
        main_archetype: u32,
        shared_tuple: Vec<SharedInstance>,
        debug: DebugInfo,
    },
    DestroyArchetypeBase {
        main_archetype: u32,
        base_index: u32,
        debug: DebugInfo,
    },
    HierarchyAddEntry {
        parent: Option<Entity>,
        child: Entity,
        debug: DebugInfo,
    },
    HierarchyChangeParent {
        old_parent: Entity,
        child: Entity,
        debug: DebugInfo,
    },
    HierarchyChangeOrSetParent {
        parent: Entity,
        child: Entity,
        debug: DebugInfo,
    },
    HierarchyRemoveEntry {
        entity: Entity,
        destroy_children: bool,
        debug: DebugInfo,
    },
    SetTag {
        entity: Entity,
        bit: u8,
        debug: DebugInfo,
    },
    ClearTag {
        entity: Entity,
        bit: u8,
        debug: DebugInfo,
    },
}

impl CommandRecord {
    /// The debug metadata to install as crash context before this record is
    /// dispatched ("Crash context is set from the record's debug
    /// metadata before dispatch").
    pub fn debug_info(&self) -> DebugInfo {
        match self {
            CommandRecord::CreateEntities { debug, .. }
            | CommandRecord::DestroyEntities { debug, .. }
            | CommandRecord::AddComponents { debug, .. }
            | CommandRecord::RemoveComponents { debug, .. }
            | CommandRecord::AddSharedComponents { debug, .. }
            | CommandRecord::RemoveSharedComponents { debug, .. }
            | CommandRecord::ChangeSharedInstance { debug, .. }
            | CommandRecord::CopyEntity { debug, .. }
            | CommandRecord::CreateSharedInstance { debug, .. }
            | CommandRecord::DestroySharedInstance { debug, .. }
            | CommandRecord::BindNamedInstance { debug, .. }
            | CommandRecord::DestroyNamedInstance { debug, .. }
            | CommandRecord::CreateArchetypeBase { debug, .. }
            | CommandRecord::DestroyArchetypeBase { debug, .. }
            | CommandRecord::HierarchyAddEntry { debug, .. }
            | CommandRecord::HierarchyChangeParent { debug, .. }
            | CommandRecord::HierarchyChangeOrSetParent { debug, .. }
            | CommandRecord::HierarchyRemoveEntry { debug, .. }
            | CommandRecord::SetTag { debug, .. }
            | CommandRecord::ClearTag { debug, .. } => *debug,
        }
    }
}

/// Append-only FIFO of pending [`CommandRecord`]s. Concurrent producers are
/// serialized by `parking_lot::Mutex` acting as the stream's atomic append
/// counter ("each command stream is its own FIFO").
#[derive(Default)]
pub struct CommandStream {
    records: Vec<CommandRecord>,
    capacity: Option<usize>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    /// Appends `record`, failing with `CommandStreamFull` if a capacity was
    /// set and is already reached.
    pub fn push(&mut self, record: CommandRecord) -> Result<()> {
        if let Some(capacity) = self.capacity {
            if self.records.len() >= capacity {
                return Err(EcsError::CommandStreamFull { capacity });
            }
        }
        self.records.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drains every record in push order, leaving the stream empty.
    pub fn drain(&mut self) -> std::vec::Drain<'_, CommandRecord> {
        self.records.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug() -> DebugInfo {
        DebugInfo {
            file: "test",
            function: "test",
            line: 0,
        }
    }

    fn entity(i: u32) -> Entity {
        Entity::new(i, 0)
    }

    #[test]
    fn push_and_drain_preserves_order() {
        let mut stream = CommandStream::new();
        stream
            .push(CommandRecord::SetTag {
                entity: entity(1),
                bit: 1,
                debug: debug(),
            })
            .unwrap();
        stream
            .push(CommandRecord::ClearTag {
                entity: entity(1),
                bit: 1,
                debug: debug(),
            })
            .unwrap();

        let drained: Vec<_> = stream.drain().collect();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], CommandRecord::SetTag { .. }));
        assert!(matches!(drained[1], CommandRecord::ClearTag { .. }));
        assert!(stream.is_empty());
    }

    #[test]
    fn push_past_capacity_fails() {
        let mut stream = CommandStream::with_capacity(1);
        stream
            .push(CommandRecord::DestroyEntities {
                entities: vec![entity(1)],
                debug: debug(),
            })
            .unwrap();
        let err = stream
            .push(CommandRecord::DestroyEntities {
                entities: vec![entity(2)],
                debug: debug(),
            })
            .unwrap_err();
        assert!(matches!(err, EcsError::CommandStreamFull { capacity: 1 }));
    }

    #[test]
    fn owned_record_data_round_trips_through_arena() {
        let arena = TemporaryArena::new();
        let data = RecordData::copied(&arena, &[1, 2, 3, 4]);
        // SAFETY: arena has not been rewound.
        let slice = unsafe { data.as_slice() };
        assert_eq!(slice, &[1, 2, 3, 4]);
    }
}
