use crate::subservice::RebootPartition;
use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Longest task name the scheduler reports; longer names are truncated.
pub const MAX_TASK_NAME_LEN: usize = 16;
/// Upper bound on live tasks in one enumeration snapshot.
pub const MAX_TASKS: usize = 32;

pub type TaskName = ArrayString<MAX_TASK_NAME_LEN>;

/// Opaque scheduler-assigned task handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub name: TaskName,
}

/// The interpreter's only window into the scheduler. Accessors take an
/// opaque handle and report failure with a result or a zero sentinel
/// rather than aborting; `reboot` is the one irreversible call.
pub trait TaskBridge {
    /// Set a task's periodic delay. `false` if the handle is unknown or
    /// the scheduler rejected the change.
    fn set_task_delay(&mut self, task: TaskId, delay_ms: u32) -> bool;

    /// Current periodic delay for a task; 0 for unknown handles.
    fn task_delay(&self, task: TaskId) -> u32;

    /// Minimum observed remaining stack for a task, in words; 0 for
    /// unknown handles.
    fn task_watermark(&self, task: TaskId) -> u32;

    /// Snapshot of all live tasks, valid only until the next command.
    fn task_snapshot(&self) -> Vec<TaskDescriptor, MAX_TASKS>;

    /// Initiate a reboot into the given partition. Irrecoverable on real
    /// hardware; the acknowledgement must already be on the wire.
    fn reboot(&mut self, partition: RebootPartition);
}

// A poisoned lock only means some other holder panicked; the task table
// itself stays coherent, so recover the guard instead of panicking too.
fn lock_bridge<B>(bridge: &Mutex<B>) -> MutexGuard<'_, B> {
    bridge.lock().unwrap_or_else(PoisonError::into_inner)
}

// Lets a test or binary keep an observer handle on the same scheduler the
// interpreter drives.
impl<B: TaskBridge> TaskBridge for Arc<Mutex<B>> {
    fn set_task_delay(&mut self, task: TaskId, delay_ms: u32) -> bool {
        lock_bridge(self).set_task_delay(task, delay_ms)
    }

    fn task_delay(&self, task: TaskId) -> u32 {
        lock_bridge(self).task_delay(task)
    }

    fn task_watermark(&self, task: TaskId) -> u32 {
        lock_bridge(self).task_watermark(task)
    }

    fn task_snapshot(&self) -> Vec<TaskDescriptor, MAX_TASKS> {
        lock_bridge(self).task_snapshot()
    }

    fn reboot(&mut self, partition: RebootPartition) {
        lock_bridge(self).reboot(partition);
    }
}

#[derive(Debug, Clone)]
struct SimTask {
    id: TaskId,
    name: TaskName,
    delay_ms: u32,
    watermark_words: u32,
}

/// Simulated scheduler backing the node binary and the test suite. Holds
/// a bounded task table and records the reboot request instead of
/// resetting anything.
#[derive(Debug, Default)]
pub struct SimScheduler {
    tasks: Vec<SimTask, MAX_TASKS>,
    reboot_target: Option<RebootPartition>,
}

impl SimScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A task table resembling a small OBC build.
    pub fn with_flight_tasks() -> Self {
        let mut sched = Self::new();
        for (id, name, delay_ms, watermark) in [
            (1, "obc_idle", 0, 420),
            (2, "housekeeping", 10_000, 180),
            (3, "time_mgmt", 1_000, 210),
            (4, "general_svc", 50, 160),
            (5, "wdt_feed", 500, 300),
            (6, "beacon_tx", 30_000, 240),
        ] {
            sched.spawn_task(TaskId(id), name, delay_ms, watermark);
        }
        sched
    }

    /// Register a task. Returns `false` when the table is full or the id
    /// is already taken.
    pub fn spawn_task(&mut self, id: TaskId, name: &str, delay_ms: u32, watermark_words: u32) -> bool {
        if self.tasks.iter().any(|t| t.id == id) {
            return false;
        }
        self.tasks
            .push(SimTask {
                id,
                name: truncated_name(name),
                delay_ms,
                watermark_words,
            })
            .is_ok()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Partition a reboot was requested into, if any.
    pub fn reboot_target(&self) -> Option<RebootPartition> {
        self.reboot_target
    }

    fn find(&self, task: TaskId) -> Option<&SimTask> {
        self.tasks.iter().find(|t| t.id == task)
    }
}

impl TaskBridge for SimScheduler {
    fn set_task_delay(&mut self, task: TaskId, delay_ms: u32) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == task) {
            Some(t) => {
                t.delay_ms = delay_ms;
                true
            }
            None => false,
        }
    }

    fn task_delay(&self, task: TaskId) -> u32 {
        self.find(task).map_or(0, |t| t.delay_ms)
    }

    fn task_watermark(&self, task: TaskId) -> u32 {
        self.find(task).map_or(0, |t| t.watermark_words)
    }

    fn task_snapshot(&self) -> Vec<TaskDescriptor, MAX_TASKS> {
        let mut snapshot = Vec::new();
        for task in &self.tasks {
            // Same capacity on both sides, cannot fail.
            let _ = snapshot.push(TaskDescriptor {
                id: task.id,
                name: task.name,
            });
        }
        snapshot
    }

    fn reboot(&mut self, partition: RebootPartition) {
        self.reboot_target = Some(partition);
    }
}

/// Clamp a name to the scheduler's fixed maximum.
pub fn truncated_name(name: &str) -> TaskName {
    let mut out = TaskName::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}
