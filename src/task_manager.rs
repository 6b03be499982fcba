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

//! Task manager (component K): a fixed pool of worker threads, each owning a
//! cache-line-padded dynamic task queue, plus a shared static task list
//! walked by a global cursor.
//!
//! Per-thread queues are `crossbeam::deque::Worker`/`Stealer` pairs — the
//! standard Rust work-stealing primitive — rather than a shared `Injector`,
//! since static-task dispatch already has its own atomic cursor and does not
//! need a second shared queue. `Worker::push`/`pop` require exclusive access
//! (the type is `Send` but not `Sync`), and `add_dynamic_task_with_affinity`
//! must be callable from any thread, not just the queue's owner, so each
//! queue is held behind a `parking_lot::Mutex`; the `Stealer` half is kept
//! outside that lock, since stealing is lock-free by crossbeam's own design.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::deque::{Steal, Stealer, Worker};
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::time::Time;
use crate::world::World;

/// The task declaration ABI: a plain function pointer plus an
/// opaque data pointer, rather than a boxed closure. The caller stages
/// `data` (typically from a per-thread [`DynamicTaskRing`]) and guarantees
/// it outlives the task's execution.
pub type TaskFn = fn(u32, &mut World, *mut ());

/// A unit of work pushed to a specific worker's queue, or round-robined
/// across all of them.
#[derive(Clone, Copy)]
pub struct DynamicTask {
    pub name: &'static str,
    pub function: TaskFn,
    pub data: *mut (),
    /// If false, this task is only ever popped by the thread it was pushed
    /// to, never taken by `try_steal`.
    pub can_be_stolen: bool,
}

// SAFETY: `data` is a handoff pointer the caller promises stays valid for
// exactly one execution on exactly one thread; the queue never aliases it.
unsafe impl Send for DynamicTask {}

/// An entry in the scheduler's ordered static task list.
/// `barrier = None` means target = 1: the first worker to reach it runs it
/// and everyone else's cursor walks past. `barrier = Some(_)` means target =
/// worker_count: every worker must arrive before the designated runner
/// executes the body.
#[derive(Clone)]
pub struct StaticTask {
    pub name: &'static str,
    pub function: TaskFn,
    pub data: *mut (),
    pub barrier: Option<Arc<Barrier>>,
}

// SAFETY: same contract as `DynamicTask::data`; static task data is staged
// once before `set_static_tasks` and not mutated while the schedule runs.
unsafe impl Send for StaticTask {}
unsafe impl Sync for StaticTask {}

impl StaticTask {
    pub fn simple(name: &'static str, function: TaskFn, data: *mut ()) -> Self {
        Self {
            name,
            function,
            data,
            barrier: None,
        }
    }

    pub fn barrier_task(name: &'static str, function: TaskFn, data: *mut (), worker_count: usize) -> Self {
        Self {
            name,
            function,
            data,
            barrier: Some(Arc::new(Barrier::new(worker_count))),
        }
    }
}

/// Barrier state machine for a barrier static task: sentinel
/// `-1` while no worker has claimed the runner role, `-2` once the runner has
/// finished running the body and released the waiters. In between, the state
/// counts arrivals of the non-runner workers.
pub struct Barrier {
    state: std::sync::atomic::AtomicI64,
    target: usize,
}

const ENTERING: i64 = -1;
const SERIAL_DONE: i64 = -2;

impl Barrier {
    pub fn new(target: usize) -> Self {
        Self {
            state: std::sync::atomic::AtomicI64::new(ENTERING),
            target,
        }
    }

    /// Exactly one caller per barrier cycle gets `true`: that caller becomes
    /// the runner and must call [`wait_for_others`](Self::wait_for_others),
    /// run the task body, then [`release`](Self::release). Every other
    /// caller should call [`arrive`](Self::arrive) and
    /// [`wait_for_release`](Self::wait_for_release).
    pub fn claim_runner(&self) -> bool {
        self.state
            .compare_exchange(ENTERING, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn arrive(&self) {
        self.state.fetch_add(1, Ordering::AcqRel);
    }

    pub fn arrivals(&self) -> i64 {
        self.state.load(Ordering::Acquire)
    }

    pub fn wait_for_others(&self, spin: &dyn Fn()) {
        while self.arrivals() < self.target as i64 - 1 {
            spin();
        }
    }

    pub fn release(&self) {
        self.state.store(SERIAL_DONE, Ordering::Release);
    }

    pub fn wait_for_release(&self, spin: &dyn Fn()) {
        while self.state.load(Ordering::Acquire) != SERIAL_DONE {
            spin();
        }
    }

    /// Rearms the barrier for the next frame.
    pub fn reset(&self) {
        self.state.store(ENTERING, Ordering::Release);
    }
}

/// The exhausted-worker wait strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBase {
    Sleep,
    Spin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub base: WaitBase,
    pub steal: bool,
}

impl WaitPolicy {
    pub const SLEEP: Self = Self {
        base: WaitBase::Sleep,
        steal: false,
    };
    pub const SPIN: Self = Self {
        base: WaitBase::Spin,
        steal: false,
    };
    pub const SLEEP_STEAL: Self = Self {
        base: WaitBase::Sleep,
        steal: true,
    };
    pub const SPIN_STEAL: Self = Self {
        base: WaitBase::Spin,
        steal: true,
    };
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::SPIN_STEAL
    }
}

/// Per-thread ring buffer used to stage `task.data`/`task.name` bytes for
/// dynamic tasks. Bump-allocates from `head`, reclaims from
/// `tail` on [`advance`](Self::advance); does not wrap a staged write across
/// the buffer boundary; sized to ~25 KiB, freed by ring-advance, without a
/// prescribed wraparound discipline beyond never tearing a staged write.
pub struct DynamicTaskRing {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
}

const RING_BYTES: usize = 25 * 1024;

impl DynamicTaskRing {
    fn new() -> Self {
        Self {
            buf: vec![0u8; RING_BYTES],
            head: 0,
            tail: 0,
        }
    }

    fn used(&self) -> usize {
        self.head - self.tail
    }

    /// Stages `bytes`, returning a pointer valid until the matching
    /// [`advance`](Self::advance). Fails (returns `None`) if there isn't
    /// enough contiguous room before the buffer end or the ring is full.
    pub fn stage(&mut self, bytes: &[u8]) -> Option<*mut u8> {
        let start = self.head % RING_BYTES;
        if bytes.is_empty() {
            return Some(self.buf.as_mut_ptr());
        }
        if self.used() + bytes.len() > RING_BYTES || start + bytes.len() > RING_BYTES {
            return None;
        }
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.head += bytes.len();
        Some(self.buf[start..].as_mut_ptr())
    }

    /// Reclaims `len` bytes from the tail, called once the task that staged
    /// them has finished running.
    pub fn advance(&mut self, len: usize) {
        self.tail += len;
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

struct ThreadQueueState {
    stealable: Worker<DynamicTask>,
    pinned: VecDeque<DynamicTask>,
}

struct ThreadSlot {
    queue: Mutex<ThreadQueueState>,
    stealer: Stealer<DynamicTask>,
    parked: Mutex<bool>,
    condvar: Condvar,
    done_this_frame: AtomicBool,
    scratch: Mutex<bumpalo::Bump>,
    ring: Mutex<DynamicTaskRing>,
}

/// A chain of invocation wrappers around task dispatch ("a
/// compose builder chains two wrappers"). Each stage receives the
/// already-composed remainder as `inner` and decides whether, and how many
/// times, to call it — enabling counting, instrumentation, or extra
/// barriers without touching task bodies.
pub type WrapperStage = Arc<dyn Fn(u32, &mut World, &str, &dyn Fn(u32, &mut World)) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ThreadFunctionWrapper {
    stages: Vec<WrapperStage>,
}

impl ThreadFunctionWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compose(mut self, stage: WrapperStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn invoke(&self, thread_id: u32, world: &mut World, name: &str, body: &dyn Fn(u32, &mut World)) {
        self.invoke_from(0, thread_id, world, name, body);
    }

    fn invoke_from(&self, index: usize, thread_id: u32, world: &mut World, name: &str, body: &dyn Fn(u32, &mut World)) {
        match self.stages.get(index) {
            Some(stage) => {
                let next = |tid: u32, w: &mut World| self.invoke_from(index + 1, tid, w, name, body);
                (stage.as_ref())(thread_id, world, name, &next);
            }
            None => body(thread_id, world),
        }
    }
}

struct WorldPtr(*mut World);

// SAFETY: see `run_frame`'s safety comment; soundness rests on the
// scheduler's conflict analysis, not on the type system.
unsafe impl Sync for WorldPtr {}

/// Worker pool driving one scheduled frame at a time.
pub struct TaskManager {
    worker_count: usize,
    slots: Vec<CachePadded<ThreadSlot>>,
    next_queue: AtomicUsize,
    static_tasks: Mutex<Vec<StaticTask>>,
    next_static: AtomicUsize,
    frame_done: AtomicUsize,
    wait_policy: WaitPolicy,
    time: Mutex<Time>,
}

impl TaskManager {
    pub fn new(worker_count: usize, wait_policy: WaitPolicy) -> Self {
        assert!(worker_count > 0, "task manager requires at least one worker");
        let slots = (0..worker_count)
            .map(|_| {
                let worker = Worker::new_fifo();
                let stealer = worker.stealer();
                CachePadded::new(ThreadSlot {
                    queue: Mutex::new(ThreadQueueState {
                        stealable: worker,
                        pinned: VecDeque::new(),
                    }),
                    stealer,
                    parked: Mutex::new(false),
                    condvar: Condvar::new(),
                    done_this_frame: AtomicBool::new(false),
                    scratch: Mutex::new(bumpalo::Bump::new()),
                    ring: Mutex::new(DynamicTaskRing::new()),
                })
            })
            .collect();
        Self {
            worker_count,
            slots,
            next_queue: AtomicUsize::new(0),
            static_tasks: Mutex::new(Vec::new()),
            next_static: AtomicUsize::new(0),
            frame_done: AtomicUsize::new(0),
            wait_policy,
            time: Mutex::new(Time::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn set_static_tasks(&self, tasks: Vec<StaticTask>) {
        *self.static_tasks.lock() = tasks;
    }

    pub fn static_task_count(&self) -> usize {
        self.static_tasks.lock().len()
    }

    pub fn time(&self) -> Time {
        self.time.lock().clone()
    }

    /// Stages `bytes` in thread `tid`'s dynamic task ring, for use as a
    /// [`DynamicTask::data`] payload.
    pub fn stage_dynamic_data(&self, tid: u32, bytes: &[u8]) -> Option<*mut u8> {
        self.slots[tid as usize].ring.lock().stage(bytes)
    }

    pub fn advance_dynamic_ring(&self, tid: u32, len: usize) {
        self.slots[tid as usize].ring.lock().advance(len);
    }

    /// Runs `f` with exclusive access to thread `tid`'s scoped scratch
    /// allocator, cleared every frame boundary by [`reset_frame`].
    pub fn with_thread_scratch<R>(&self, tid: u32, f: impl FnOnce(&bumpalo::Bump) -> R) -> R {
        f(&self.slots[tid as usize].scratch.lock())
    }

    pub fn add_dynamic_task(&self, task: DynamicTask) -> u32 {
        let tid = (self.next_queue.fetch_add(1, Ordering::Relaxed) % self.worker_count) as u32;
        self.add_dynamic_task_with_affinity(task, tid);
        tid
    }

    pub fn add_dynamic_task_and_wake(&self, task: DynamicTask) -> u32 {
        let tid = self.add_dynamic_task(task);
        self.wake(tid as usize);
        tid
    }

    pub fn add_dynamic_task_with_affinity(&self, task: DynamicTask, tid: u32) {
        let mut state = self.slots[tid as usize].queue.lock();
        if task.can_be_stolen {
            state.stealable.push(task);
        } else {
            state.pinned.push_back(task);
        }
    }

    pub fn add_dynamic_task_with_affinity_and_wake(&self, task: DynamicTask, tid: u32) {
        self.add_dynamic_task_with_affinity(task, tid);
        self.wake(tid as usize);
    }

    /// Partitions `worker_count` identical tasks evenly across threads.
    pub fn add_dynamic_task_group(&self, make_task: impl Fn(u32) -> DynamicTask) {
        for tid in 0..self.worker_count as u32 {
            self.add_dynamic_task_with_affinity(make_task(tid), tid);
        }
    }

    pub fn add_dynamic_task_group_and_wake(&self, make_task: impl Fn(u32) -> DynamicTask) {
        for tid in 0..self.worker_count as u32 {
            self.add_dynamic_task_with_affinity_and_wake(make_task(tid), tid);
        }
    }

    fn pop_local(&self, tid: usize) -> Option<DynamicTask> {
        let mut state = self.slots[tid].queue.lock();
        if let Some(task) = state.pinned.pop_front() {
            return Some(task);
        }
        state.stealable.pop()
    }

    /// Scans other threads' stealable queues, alternating scan direction
    /// per thread (odd/even) to avoid every idle worker converging on the
    /// same victim.
    fn try_steal(&self, tid: usize) -> Option<DynamicTask> {
        let n = self.worker_count;
        if n <= 1 {
            return None;
        }
        let offsets: Vec<usize> = if tid % 2 == 0 { (1..n).collect() } else { (1..n).rev().collect() };
        for off in offsets {
            let other = (tid + off) % n;
            loop {
                match self.slots[other].stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    fn pop_dynamic(&self, tid: usize) -> Option<DynamicTask> {
        self.pop_local(tid).or_else(|| if self.wait_policy.steal { self.try_steal(tid) } else { None })
    }

    fn wake(&self, tid: usize) {
        let slot = &self.slots[tid];
        let mut parked = slot.parked.lock();
        *parked = false;
        slot.condvar.notify_one();
    }

    fn wake_all(&self) {
        for tid in 0..self.worker_count {
            self.wake(tid);
        }
    }

    fn park(&self, tid: usize) {
        match self.wait_policy.base {
            WaitBase::Spin => std::hint::spin_loop(),
            WaitBase::Sleep => {
                let slot = &self.slots[tid];
                let mut parked = slot.parked.lock();
                *parked = true;
                slot.condvar.wait_for(&mut parked, std::time::Duration::from_millis(1));
            }
        }
    }

    /// Atomically claims the next static task index; dispatches it if there
    /// is one left. Returns `false` once the static list is exhausted.
    fn run_next_static(&self, tid: u32, world: &mut World, wrapper: &ThreadFunctionWrapper) -> bool {
        let task = {
            let tasks = self.static_tasks.lock();
            let index = self.next_static.fetch_add(1, Ordering::AcqRel);
            match tasks.get(index) {
                Some(task) => task.clone(),
                None => return false,
            }
        };
        match &task.barrier {
            None => {
                let (function, data) = (task.function, task.data);
                let body = |t: u32, w: &mut World| function(t, w, data);
                wrapper.invoke(tid, world, task.name, &body);
            }
            Some(barrier) => {
                let (function, data) = (task.function, task.data);
                if barrier.claim_runner() {
                    barrier.wait_for_others(&|| std::hint::spin_loop());
                    let body = |t: u32, w: &mut World| function(t, w, data);
                    wrapper.invoke(tid, world, task.name, &body);
                    barrier.release();
                } else {
                    barrier.arrive();
                    barrier.wait_for_release(&|| std::hint::spin_loop());
                }
            }
        }
        true
    }

    fn on_thread_done(&self) {
        if self.frame_done.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.time.lock().update();
        }
    }

    fn reset_frame(&self) {
        self.next_static.store(0, Ordering::Release);
        self.frame_done.store(self.worker_count, Ordering::Release);
        for slot in &self.slots {
            slot.done_this_frame.store(false, Ordering::Release);
            slot.scratch.lock().reset();
            slot.ring.lock().reset();
        }
        for task in self.static_tasks.lock().iter() {
            if let Some(barrier) = &task.barrier {
                barrier.reset();
            }
        }
    }

    fn worker_loop(&self, tid: u32, world: &mut World, wrapper: &ThreadFunctionWrapper) {
        loop {
            if let Some(task) = self.pop_dynamic(tid as usize) {
                let (function, data, name) = (task.function, task.data, task.name);
                let body = |t: u32, w: &mut World| function(t, w, data);
                wrapper.invoke(tid, world, name, &body);
                continue;
            }
            if self.run_next_static(tid, world, wrapper) {
                continue;
            }
            let slot = &self.slots[tid as usize];
            if !slot.done_this_frame.swap(true, Ordering::AcqRel) {
                self.on_thread_done();
            }
            if self.frame_done.load(Ordering::Acquire) == 0 {
                return;
            }
            self.park(tid as usize);
        }
    }

    /// Runs one scheduled frame to completion across `worker_count` scoped
    /// threads, then returns once every worker has drained both its static
    /// cursor and its dynamic queues.
    ///
    /// # Safety (soundness, not a `unsafe fn`)
    /// Every worker receives its own `&mut World` aliased from the same
    /// backing allocation. That is unsound in ordinary safe Rust; it is
    /// sound here only because the scheduler's adjacent-pair query-conflict
    /// analysis (component L) guarantees no two tasks running concurrently
    /// touch overlapping component data. The type system cannot express
    /// that invariant, so we assert it by construction instead.
    pub fn run_frame(&self, world: &mut World, wrapper: &ThreadFunctionWrapper) {
        self.reset_frame();
        let world_ptr = WorldPtr(world as *mut World);
        std::thread::scope(|scope| {
            for tid in 0..self.worker_count as u32 {
                let world_ptr = &world_ptr;
                scope.spawn(move || {
                    let world = unsafe { &mut *world_ptr.0 };
                    self.worker_loop(tid, world, wrapper);
                });
            }
        });
    }

    /// Resets the static cursor and frame-done counter, wakes every worker,
    /// then runs the frame. Since
    /// `run_frame` already blocks until the frame finishes, `wait = false`
    /// is only honored by skipping that block — a caller that wants
    /// fire-and-forget scheduling should drive `run_frame` directly from a
    /// background thread instead.
    pub fn do_frame(&self, world: &mut World, wrapper: &ThreadFunctionWrapper, wait: bool) {
        if wait {
            self.run_frame(world, wrapper);
        } else {
            self.reset_frame();
            self.wake_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_policy_constants_are_distinct() {
        assert_ne!(WaitPolicy::SLEEP, WaitPolicy::SPIN);
        assert!(WaitPolicy::SLEEP_STEAL.steal);
        assert!(!WaitPolicy::SLEEP.steal);
    }

    #[test]
    fn ring_stages_and_advances() {
        let mut ring = DynamicTaskRing::new();
        let ptr = ring.stage(&[1, 2, 3]).unwrap();
        assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 3) }, &[1, 2, 3]);
        assert_eq!(ring.used(), 3);
        ring.advance(3);
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn ring_refuses_oversized_stage() {
        let mut ring = DynamicTaskRing::new();
        let big = vec![0u8; RING_BYTES + 1];
        assert!(ring.stage(&big).is_none());
    }

    #[test]
    fn barrier_runner_waits_for_all_arrivals() {
        let barrier = Barrier::new(3);
        assert!(barrier.claim_runner());
        assert!(!barrier.claim_runner());
        barrier.arrive();
        assert_eq!(barrier.arrivals(), 1);
        barrier.arrive();
        assert_eq!(barrier.arrivals(), 2);
        barrier.wait_for_others(&|| panic!("should not need to spin, arrivals already satisfied"));
        barrier.release();
        barrier.wait_for_release(&|| panic!("should already be released"));
    }

    #[test]
    fn barrier_reset_reopens_entering_phase() {
        let barrier = Barrier::new(2);
        assert!(barrier.claim_runner());
        barrier.release();
        barrier.reset();
        assert!(barrier.claim_runner());
    }

    #[test]
    fn task_manager_round_robins_affinity() {
        let tm = TaskManager::new(3, WaitPolicy::SPIN);
        fn noop(_: u32, _: &mut World, _: *mut ()) {}
        let task = |stolen: bool| DynamicTask {
            name: "noop",
            function: noop as TaskFn,
            data: std::ptr::null_mut(),
            can_be_stolen: stolen,
        };
        let first = tm.add_dynamic_task(task(true));
        let second = tm.add_dynamic_task(task(true));
        let third = tm.add_dynamic_task(task(true));
        assert_eq!([first, second, third], [0, 1, 2]);
    }

    #[test]
    fn pinned_tasks_are_not_stealable() {
        let tm = TaskManager::new(2, WaitPolicy::SPIN_STEAL);
        fn noop(_: u32, _: &mut World, _: *mut ()) {}
        tm.add_dynamic_task_with_affinity(
            DynamicTask {
                name: "pinned",
                function: noop as TaskFn,
                data: std::ptr::null_mut(),
                can_be_stolen: false,
            },
            0,
        );
        assert!(tm.try_steal(1).is_none());
        assert!(tm.pop_local(0).is_some());
    }

    #[test]
    fn stealable_task_is_visible_to_other_threads() {
        let tm = TaskManager::new(2, WaitPolicy::SPIN_STEAL);
        fn noop(_: u32, _: &mut World, _: *mut ()) {}
        tm.add_dynamic_task_with_affinity(
            DynamicTask {
                name: "stealable",
                function: noop as TaskFn,
                data: std::ptr::null_mut(),
                can_be_stolen: true,
            },
            0,
        );
        assert!(tm.try_steal(1).is_some());
    }

    #[test]
    fn thread_function_wrapper_runs_stages_in_order() {
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let log_a = log.clone();
        let log_b = log.clone();
        let wrapper = ThreadFunctionWrapper::new()
            .compose(Arc::new(move |tid, world: &mut World, name, inner: &dyn Fn(u32, &mut World)| {
                log_a.lock().push("outer-before");
                inner(tid, world);
                log_a.lock().push("outer-after");
                let _ = name;
            }))
            .compose(Arc::new(move |tid, world: &mut World, _name, inner: &dyn Fn(u32, &mut World)| {
                log_b.lock().push("inner-before");
                inner(tid, world);
                log_b.lock().push("inner-after");
            }));

        let mut world = World::new();
        wrapper.invoke(0, &mut world, "test", &|_, _| {
            log.lock().push("body");
        });

        assert_eq!(*log.lock(), vec!["outer-before", "inner-before", "body", "inner-after", "outer-after"]);
    }
}
