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

//! Scheduling vocabulary shared by the task scheduler (component L):
//! execution phases, component access declarations, and read-visibility
//! modes. Kept separate from `schedule.rs`'s graph-solving algorithm, the
//! same split as `SystemAccess` living apart from `Schedule`.

/// Top-level frame phase, ordered `Initialize < Simulate < Finalize` by
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Initialize,
    Simulate,
    Finalize,
}

/// Sub-ordering within a phase, `Early < Mid < Late`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubPhase {
    Early,
    Mid,
    Late,
}

/// A scheduling group: one of the nine `Phase × SubPhase` slots. `Ord` on
/// the derived field order (`phase` then `sub_phase`) gives exactly the
/// intended group ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Group {
    pub phase: Phase,
    pub sub_phase: SubPhase,
}

impl Group {
    pub const fn new(phase: Phase, sub_phase: SubPhase) -> Self {
        Self { phase, sub_phase }
    }
}

/// How aggressively a query's pending-write conflict forces a preceding
/// flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadVisibility {
    /// Reads may observe stale data from before the conflicting write; no
    /// barrier is inserted on this query's account.
    #[default]
    Lazy,
    /// Reads of the specific conflicting components must observe the write.
    LatestSelection,
    /// Reads of anything this query touches must observe every preceding
    /// write, not just the directly conflicting component.
    LatestAll,
}

/// The component ids a scheduled element reads and writes, used for
/// adjacent-pair conflict analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentAccess {
    pub reads: Vec<u16>,
    pub writes: Vec<u16>,
}

impl ComponentAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reading(mut self, id: u16) -> Self {
        self.reads.push(id);
        self
    }

    pub fn writing(mut self, id: u16) -> Self {
        self.writes.push(id);
        self
    }

    /// True if some component is written by one side and read or written by
    /// the other ("read vs write on the same component").
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.writes.iter().any(|w| other.reads.contains(w) || other.writes.contains(w)) || self.reads.iter().any(|r| other.writes.contains(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_orders_phase_then_subphase() {
        let a = Group::new(Phase::Initialize, SubPhase::Late);
        let b = Group::new(Phase::Simulate, SubPhase::Early);
        assert!(a < b, "any Initialize group precedes any Simulate group");

        let c = Group::new(Phase::Simulate, SubPhase::Early);
        let d = Group::new(Phase::Simulate, SubPhase::Mid);
        assert!(c < d);
    }

    #[test]
    fn access_conflicts_on_read_write_overlap() {
        let reader = ComponentAccess::new().reading(1);
        let writer = ComponentAccess::new().writing(1);
        assert!(reader.conflicts_with(&writer));
        assert!(writer.conflicts_with(&reader));
    }

    #[test]
    fn access_does_not_conflict_on_disjoint_reads() {
        let a = ComponentAccess::new().reading(1);
        let b = ComponentAccess::new().reading(2);
        assert!(!a.conflicts_with(&b));
    }

    #[test]
    fn access_conflicts_on_write_write() {
        let a = ComponentAccess::new().writing(5);
        let b = ComponentAccess::new().writing(5);
        assert!(a.conflicts_with(&b));
    }
}
