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

//! Archetype-based ECS core runtime.
//!
//! Entities are generational handles into column-oriented archetype storage.
//! Components are opaque byte blobs identified by small integer ids, not Rust
//! types — a typed convenience layer is a caller's concern, not this crate's.
//! [`World`] ties the entity pool, component registry, archetype catalog,
//! hierarchy, query cache, and command stream together; structural edits go
//! through it either immediately (`*_commit`) or deferred through the command
//! stream and replayed at [`World::flush`]. [`TaskManager`] drives a frame
//! across a fixed worker pool; [`Scheduler`] turns a declared set of
//! [`SchedulerElement`]s into the ordered static task list it runs.

pub mod allocator;
pub mod archetype;
pub mod archetype_base;
pub mod command;
pub mod component;
pub mod dependency;
pub mod entity;
pub mod error;
pub mod hierarchy;
pub mod query;
pub mod schedule;
pub mod signature;
pub mod system_manager;
pub mod task_manager;
pub mod time;
pub mod utils;
pub mod world;

pub use allocator::{Allocator, SystemAllocator, TemporaryArena, ThreadSafeAllocator};
pub use archetype::Archetype;
pub use archetype_base::ArchetypeBase;
pub use command::{CommandRecord, CommandStream, CopyModeTag, RecordData};
pub use component::{BufferDescriptor, ComponentInfo, ComponentRegistry, ComponentSpace, SharedInstance};
pub use dependency::{ComponentAccess, Group, Phase, ReadVisibility, SubPhase};
pub use entity::{Entity, EntityInfo, EntityLocation, EntityPool};
pub use error::{DebugInfo, EcsError, Result};
pub use hierarchy::EntityHierarchy;
pub use query::{QueryCache, QueryHandle};
pub use schedule::{set_task_manager_tasks, ScheduledPlan, Scheduler, SchedulerElement, SetTasksOptions};
pub use signature::{SharedSignature, UniqueSignature, VectorSignature};
pub use system_manager::SystemManager;
pub use task_manager::{Barrier, DynamicTask, DynamicTaskRing, StaticTask, TaskFn, TaskManager, ThreadFunctionWrapper, WaitPolicy};
pub use time::Time;
pub use world::{ManagerLockGuard, World};
