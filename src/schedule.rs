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

//! Task scheduler (component L): a dependency graph over named scheduler
//! elements, solved into a single ordered list the task manager runs as its
//! static task sequence.
//!
//! This replaces the old `Schedule`/`SystemGraph`, which built *parallel*
//! stages of `Box<dyn System>` trait objects keyed by `TypeId` conflicts.
//! There is no `System` trait in the opaque-component world — a scheduled
//! element is a plain function pointer plus a declared dependency/group/
//! query, and "parallelism" now comes from the dynamic tasks an element's
//! body pushes onto the task manager, not from running several elements'
//! bodies concurrently. What survives from the old design is the
//! topological-sort-with-cycle-report shape.

use std::collections::HashSet;

use crate::dependency::{ComponentAccess, Group, ReadVisibility};
use crate::error::{EcsError, Result};
use crate::task_manager::{StaticTask, TaskFn, TaskManager};

/// One schedulable unit: a named task with its dependencies, group, and
/// optional component-access declaration.
#[derive(Clone, Debug)]
pub struct SchedulerElement {
    pub name: String,
    pub function: TaskFn,
    pub dependencies: Vec<String>,
    pub group: Group,
    pub query: Option<ComponentAccess>,
    pub read_visibility: ReadVisibility,
    pub barrier_task: bool,
    /// Optional per-element setup, run once by `set_task_manager_tasks`
    /// unless `options.preserve_data` supplies a carried-over value instead.
    pub initialize: Option<fn(*mut ()) -> *mut ()>,
    pub data: *mut (),
}

// SAFETY: `data` is handed off to exactly one `StaticTask` and not touched
// concurrently; see `task_manager::StaticTask`'s equivalent comment.
unsafe impl Send for SchedulerElement {}

impl SchedulerElement {
    pub fn new(name: impl Into<String>, function: TaskFn, group: Group) -> Self {
        Self {
            name: name.into(),
            function,
            dependencies: Vec::new(),
            group,
            query: None,
            read_visibility: ReadVisibility::default(),
            barrier_task: false,
            initialize: None,
            data: std::ptr::null_mut(),
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn with_query(mut self, query: ComponentAccess, visibility: ReadVisibility) -> Self {
        self.query = Some(query);
        self.read_visibility = visibility;
        self
    }

    pub fn as_barrier(mut self) -> Self {
        self.barrier_task = true;
        self
    }
}

/// The result of [`Scheduler::solve`]: a single ordered list plus, for each
/// position, whether the task manager must insert a barrier before it.
#[derive(Debug)]
pub struct ScheduledPlan {
    pub order: Vec<SchedulerElement>,
    pub barrier_before: Vec<bool>,
}

pub struct Scheduler;

impl Scheduler {
    /// Runs the solve in four steps: group partition, per-group topological
    /// sort, adjacent-pair dependency-wait analysis, adjacent-pair
    /// query-conflict analysis.
    pub fn solve(elements: Vec<SchedulerElement>) -> Result<ScheduledPlan> {
        let groups = Self::partition_by_group(elements);
        let mut order = Vec::new();
        for group_elements in groups {
            let sorted = Self::topo_sort_group(group_elements, &order)?;
            order.extend(sorted);
        }
        let barrier_before = Self::analyze_adjacent_pairs(&order);
        Ok(ScheduledPlan { order, barrier_before })
    }

    /// Stable-partitions elements by group in group order, preserving each
    /// group's relative input order.
    fn partition_by_group(mut elements: Vec<SchedulerElement>) -> Vec<Vec<SchedulerElement>> {
        elements.sort_by_key(|e| e.group);
        let mut groups: Vec<Vec<SchedulerElement>> = Vec::new();
        for element in elements {
            match groups.last_mut() {
                Some(last) if last[0].group == element.group => last.push(element),
                _ => groups.push(vec![element]),
            }
        }
        groups
    }

    /// Iteratively moves elements whose dependencies are satisfied into the
    /// scheduled prefix. Dependencies on an element in an earlier group are
    /// automatically satisfied (this stage: "crossing into an earlier
    /// group are considered satisfied automatically"). A pass that makes no
    /// progress reports a cycle naming the offending pairs.
    fn topo_sort_group(elements: Vec<SchedulerElement>, prior: &[SchedulerElement]) -> Result<Vec<SchedulerElement>> {
        let prior_names: HashSet<&str> = prior.iter().map(|e| e.name.as_str()).collect();
        let mut scheduled_names: HashSet<String> = HashSet::new();
        let mut remaining = elements;
        let mut out = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut next_remaining = Vec::with_capacity(remaining.len());
            let mut progressed = false;

            for element in remaining {
                let ready = element
                    .dependencies
                    .iter()
                    .all(|dep| prior_names.contains(dep.as_str()) || scheduled_names.contains(dep));
                if ready {
                    scheduled_names.insert(element.name.clone());
                    out.push(element);
                    progressed = true;
                } else {
                    next_remaining.push(element);
                }
            }

            if !progressed {
                let pairs = next_remaining
                    .iter()
                    .flat_map(|e| {
                        e.dependencies
                            .iter()
                            .filter(|d| !prior_names.contains(d.as_str()) && !scheduled_names.contains(*d))
                            .map(move |d| (e.name.clone(), d.clone()))
                    })
                    .collect();
                return Err(EcsError::SchedulerCycle(pairs));
            }

            remaining = next_remaining;
        }

        Ok(out)
    }

    /// For each adjacent pair in the final order: marks a barrier if the
    /// later element names the earlier as a dependency, or if both declare
    /// queries whose component accesses conflict and the later element's
    /// read-visibility isn't `Lazy`.
    fn analyze_adjacent_pairs(order: &[SchedulerElement]) -> Vec<bool> {
        let mut barrier_before = vec![false; order.len()];
        for i in 1..order.len() {
            let prev = &order[i - 1];
            let cur = &order[i];

            if cur.dependencies.iter().any(|d| d == &prev.name) {
                barrier_before[i] = true;
                continue;
            }

            if let (Some(prev_query), Some(cur_query)) = (&prev.query, &cur.query) {
                if prev_query.conflicts_with(cur_query) && cur.read_visibility != ReadVisibility::Lazy {
                    barrier_before[i] = true;
                }
            }
        }
        barrier_before
    }
}

/// Options for [`set_task_manager_tasks`].
#[derive(Default)]
pub struct SetTasksOptions {
    /// If set, `transfer` entries are consulted before an element's own
    /// `initialize` function ("carried-over previous data if
    /// preserve_data is set and a transfer entry is supplied").
    pub preserve_data: bool,
    pub transfer: Vec<(String, *mut ())>,
}

// SAFETY: transfer pointers are handed off exactly once to the new static
// task list, mirroring `SchedulerElement::data`.
unsafe impl Send for SetTasksOptions {}

/// Copies a solved plan's elements into `tm`'s static task list, resolving
/// each element's initial data per `options` and leaking its name so the
/// task manager can hold it as `&'static str` — scheduled element names
/// live for the process, the same way a name-keyed task table never
/// shrinks once an entry is registered.
pub fn set_task_manager_tasks(tm: &TaskManager, plan: &ScheduledPlan, options: &SetTasksOptions) {
    let worker_count = tm.worker_count();
    let mut statics = Vec::with_capacity(plan.order.len());

    for (i, element) in plan.order.iter().enumerate() {
        let carried = if options.preserve_data {
            options.transfer.iter().find(|(name, _)| name == &element.name).map(|(_, ptr)| *ptr)
        } else {
            None
        };
        let data = match (carried, element.initialize) {
            (Some(ptr), _) => ptr,
            (None, Some(init)) => init(element.data),
            (None, None) => element.data,
        };

        let name: &'static str = Box::leak(element.name.clone().into_boxed_str());
        let needs_barrier = plan.barrier_before.get(i).copied().unwrap_or(false) || element.barrier_task;
        let task = if needs_barrier {
            StaticTask::barrier_task(name, element.function, data, worker_count)
        } else {
            StaticTask::simple(name, element.function, data)
        };
        statics.push(task);
    }

    tm.set_static_tasks(statics);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{Phase, SubPhase};
    use crate::world::World;

    fn noop(_: u32, _: &mut World, _: *mut ()) {}

    fn group(phase: Phase, sub: SubPhase) -> Group {
        Group::new(phase, sub)
    }

    #[test]
    fn groups_are_ordered_before_internal_dependencies() {
        let elements = vec![
            SchedulerElement::new("finalize_a", noop as TaskFn, group(Phase::Finalize, SubPhase::Early)),
            SchedulerElement::new("init_a", noop as TaskFn, group(Phase::Initialize, SubPhase::Early)),
            SchedulerElement::new("sim_a", noop as TaskFn, group(Phase::Simulate, SubPhase::Mid)),
        ];
        let plan = Scheduler::solve(elements).unwrap();
        let names: Vec<&str> = plan.order.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["init_a", "sim_a", "finalize_a"]);
    }

    #[test]
    fn dependency_within_group_orders_before_dependent() {
        let elements = vec![
            SchedulerElement::new("b", noop as TaskFn, group(Phase::Simulate, SubPhase::Early)).depends_on("a"),
            SchedulerElement::new("a", noop as TaskFn, group(Phase::Simulate, SubPhase::Early)),
        ];
        let plan = Scheduler::solve(elements).unwrap();
        let names: Vec<&str> = plan.order.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(plan.barrier_before[1], "b depends on a directly adjacent to it");
    }

    #[test]
    fn unsatisfiable_dependency_reports_cycle() {
        let elements = vec![
            SchedulerElement::new("a", noop as TaskFn, group(Phase::Simulate, SubPhase::Early)).depends_on("b"),
            SchedulerElement::new("b", noop as TaskFn, group(Phase::Simulate, SubPhase::Early)).depends_on("a"),
        ];
        let err = Scheduler::solve(elements).unwrap_err();
        assert!(matches!(err, EcsError::SchedulerCycle(_)));
    }

    #[test]
    fn conflicting_queries_mark_barrier_unless_lazy() {
        let writer = ComponentAccess::new().writing(1);
        let reader = ComponentAccess::new().reading(1);
        let elements = vec![
            SchedulerElement::new("write_pos", noop as TaskFn, group(Phase::Simulate, SubPhase::Early))
                .with_query(writer, ReadVisibility::Lazy),
            SchedulerElement::new("read_pos", noop as TaskFn, group(Phase::Simulate, SubPhase::Mid))
                .with_query(reader, ReadVisibility::LatestAll),
        ];
        let plan = Scheduler::solve(elements).unwrap();
        assert!(plan.barrier_before[1]);
    }

    #[test]
    fn lazy_visibility_skips_the_barrier() {
        let writer = ComponentAccess::new().writing(1);
        let reader = ComponentAccess::new().reading(1);
        let elements = vec![
            SchedulerElement::new("write_pos", noop as TaskFn, group(Phase::Simulate, SubPhase::Early))
                .with_query(writer, ReadVisibility::Lazy),
            SchedulerElement::new("read_pos", noop as TaskFn, group(Phase::Simulate, SubPhase::Mid)).with_query(reader, ReadVisibility::Lazy),
        ];
        let plan = Scheduler::solve(elements).unwrap();
        assert!(!plan.barrier_before[1]);
    }

    #[test]
    fn set_task_manager_tasks_populates_static_list() {
        let elements = vec![SchedulerElement::new("only", noop as TaskFn, group(Phase::Simulate, SubPhase::Early))];
        let plan = Scheduler::solve(elements).unwrap();
        let tm = TaskManager::new(2, crate::task_manager::WaitPolicy::SPIN);
        set_task_manager_tasks(&tm, &plan, &SetTasksOptions::default());
        assert_eq!(tm.static_task_count(), 1);
    }
}
