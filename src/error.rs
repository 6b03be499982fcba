//! Error types for the core runtime.
//!
//! Immediate (`*_commit`) operations treat precondition violations as fatal:
//! callers that hit one of these should route it through [`fatal`] rather
//! than propagate it. Deferred operations return `Result` up through
//! `flush`, whose caller decides whether a commit failure is fatal the same
//! way (it is, by convention, but that decision lives at the call site).

use crate::entity::Entity;
use std::fmt;

/// Debug metadata carried by a command record or raised with a crash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.file, self.line, self.function)
    }
}

/// Captures the call site of a fatal error for inclusion in a panic message.
#[macro_export]
macro_rules! debug_info {
    () => {
        $crate::error::DebugInfo {
            file: file!(),
            function: concat!(module_path!()),
            line: line!(),
        }
    };
}

/// Exhaustive error kinds for the core runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EcsError {
    #[error("invalid entity {0:?}")]
    InvalidEntity(Entity),

    #[error("component {0} is not registered")]
    ComponentNotRegistered(u16),

    #[error("component {0} is already registered")]
    ComponentAlreadyRegistered(u16),

    #[error("component {0} has buffer descriptors but no allocator")]
    ComponentAllocatorMissing(u16),

    #[error("component {component} byte size {size} exceeds the maximum of {max}")]
    ComponentTooLarge {
        component: u16,
        size: usize,
        max: usize,
    },

    #[error("shared instance {instance} of component {component} is missing")]
    SharedInstanceMissing { component: u16, instance: u16 },

    #[error("named shared instance '{0}' is missing")]
    NamedSharedInstanceMissing(String),

    #[error("no archetype matches the requested signature")]
    ArchetypeMissing,

    #[error("archetype {0} has no base for the requested shared tuple")]
    BaseArchetypeMissing(u32),

    #[error("archetype signature limit exceeded ({unique} unique, {shared} shared)")]
    ArchetypeSignatureLimitExceeded { unique: usize, shared: usize },

    #[error("copy mode is incompatible with this operation")]
    IncompatibleCopyMode,

    #[error("command stream is full (capacity {capacity})")]
    CommandStreamFull { capacity: usize },

    #[error("scheduler dependency cycle: {}", format_pairs(.0))]
    SchedulerCycle(Vec<(String, String)>),

    #[error("hierarchy edit from {child:?} to {parent:?} would create a cycle")]
    HierarchyCycle { parent: Entity, child: Entity },

    #[error("hierarchy has no entry for entity {0:?}")]
    HierarchyEntryMissing(Entity),
}

fn format_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(a, b)| format!("({a}, {b})"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, EcsError>;

thread_local! {
    static CRASH_CONTEXT: std::cell::Cell<DebugInfo> = const { std::cell::Cell::new(DebugInfo { file: "", function: "", line: 0 }) };
}

/// Records `info` as the call site a crash during the current dispatch
/// should blame, set from a command record's debug metadata before it
/// dispatches. Every `fatal` call site in this crate already carries its own
/// `DebugInfo`; this exists for a host's commands or systems that want the
/// ambient context instead of threading their own.
pub fn set_crash_context(info: DebugInfo) {
    CRASH_CONTEXT.with(|c| c.set(info));
}

pub fn crash_context() -> DebugInfo {
    CRASH_CONTEXT.with(|c| c.get())
}

/// Raises a structured crash event and aborts the current thread via panic.
///
/// Immediate operations that hit a precondition violation log a crash event
/// with a formatted message and debug metadata, then panic. A library cannot
/// unilaterally disable unwinding; a host that wants no unwinding at all
/// builds with `panic = "abort"`. What we guarantee here is that the event
/// is logged, with debug metadata, before the panic fires.
#[track_caller]
pub fn fatal(err: EcsError, info: DebugInfo) -> ! {
    tracing::error!(error = %err, debug = %info, "fatal ecs error");
    panic!("{err} ({info})");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_cycle_names_pairs() {
        let err = EcsError::SchedulerCycle(vec![
            ("A".into(), "B".into()),
            ("B".into(), "C".into()),
            ("C".into(), "A".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("(A, B)"));
        assert!(msg.contains("(C, A)"));
    }

    #[test]
    fn crash_context_round_trips() {
        let info = DebugInfo {
            file: "a.rs",
            function: "f",
            line: 7,
        };
        set_crash_context(info);
        assert_eq!(crash_context(), info);
    }

    #[test]
    fn display_includes_debug_info() {
        let info = DebugInfo {
            file: "world.rs",
            function: "add_component",
            line: 42,
        };
        assert_eq!(info.to_string(), "world.rs:42 in add_component");
    }
}
