//! Per-worker record and the shared state machine (spec §3 "Worker record",
//! §4.1 state diagram).

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::constants::JOIN_POLL_INTERVAL;

/// Stable numeric worker identifier, unique and monotonically issued within
/// one [`crate::pool::WorkerPool`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of body a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// An in-process closure running on a dedicated OS thread.
    Function,
    /// A monitored child process.
    Process,
}

/// Run-state of a worker (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Paused,
    Stopped,
    Error,
}

impl WorkerState {
    /// `is_alive(id) == true ⟺ state(id) ∈ {created, running, paused}` (§8).
    #[must_use]
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Created | Self::Running | Self::Paused)
    }
}

/// Coordination primitives shared between a worker's body and the pool.
///
/// This is the "mutex and a condition variable" named in §3's Worker record
/// and the suspension point named in §5: `check_pause` waits on the condvar
/// while paused, `should_exit` is a plain flag read under the same mutex.
struct Shared {
    state: Mutex<WorkerState>,
    should_exit: Mutex<bool>,
    cond: Condvar,
}

/// Handle passed into a function-kind worker body so it can cooperate with
/// pause/stop requests at its own safe points (§4.1 "Cooperative
/// suspension").
#[derive(Clone)]
pub struct WorkerControl {
    shared: Arc<Shared>,
}

impl WorkerControl {
    /// Blocks while paused; returns once resumed or once should-exit is set.
    /// Bodies are expected to call this at safe points and follow it with
    /// [`Self::should_exit`].
    pub fn check_pause(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while *state == WorkerState::Paused {
            if *self.shared.should_exit.lock().unwrap() {
                return;
            }
            state = self.shared.cond.wait(state).unwrap();
        }
    }

    /// Returns `true` once the pool has asked this worker to return.
    #[must_use]
    pub fn should_exit(&self) -> bool {
        *self.shared.should_exit.lock().unwrap()
    }
}

/// Captured state for a process-kind worker: pid, I/O buffers, exit code.
/// The three pipes (§3) remain open for the lifetime of the record; stdout
/// and stderr are drained into growable buffers by the monitor loop so
/// `read_stdout`/`read_stderr` never block a caller.
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub argv: Vec<String>,
    pub stdout: Arc<Mutex<Vec<u8>>>,
    pub stderr: Arc<Mutex<Vec<u8>>>,
    pub exit_status: Mutex<Option<i32>>,
}

/// One live task tracked by the pool.
pub struct Worker {
    pub id: WorkerId,
    pub kind: WorkerKind,
    shared: Arc<Shared>,
    pub(crate) join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    pub process: Option<ProcessInfo>,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, kind: WorkerKind, process: Option<ProcessInfo>) -> Self {
        Self {
            id,
            kind,
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState::Created),
                should_exit: Mutex::new(false),
                cond: Condvar::new(),
            }),
            join_handle: Mutex::new(None),
            process,
        }
    }

    pub(crate) fn control(&self) -> WorkerControl {
        WorkerControl {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, next: WorkerState) {
        *self.shared.state.lock().unwrap() = next;
        self.shared.cond.notify_all();
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    /// Mark `running` (entered once the body actually starts).
    pub(crate) fn mark_running(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state == WorkerState::Created {
            *state = WorkerState::Running;
        }
    }

    /// `pause(id)`: if running, set paused; no-op otherwise (§4.1).
    pub(crate) fn pause(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if *state == WorkerState::Running {
            *state = WorkerState::Paused;
            self.shared.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// `resume(id)`: inverse of pause; no-op if not paused.
    pub(crate) fn resume(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if *state == WorkerState::Paused {
            *state = WorkerState::Running;
            self.shared.cond.notify_all();
            true
        } else {
            false
        }
    }

    /// `stop(id)`: set should-exit, clear paused, wake. Idempotent.
    pub(crate) fn request_stop(&self) {
        *self.shared.should_exit.lock().unwrap() = true;
        let mut state = self.shared.state.lock().unwrap();
        if state.is_alive() {
            *state = WorkerState::Running;
        }
        self.shared.cond.notify_all();
    }

    pub(crate) fn should_exit(&self) -> bool {
        *self.shared.should_exit.lock().unwrap()
    }

    /// Blocks until the underlying thread has exited, or `timeout` elapses.
    /// Polls at [`JOIN_POLL_INTERVAL`] (§5) so a caller can bound wall time
    /// without the platform offering a timed `thread::join`.
    pub(crate) fn join_thread(&self, timeout: Option<Duration>) -> bool {
        let handle = self.join_handle.lock().unwrap().take();
        let Some(handle) = handle else {
            return true;
        };
        match timeout {
            None => {
                let _ = handle.join();
                true
            }
            Some(limit) => {
                let deadline = std::time::Instant::now() + limit;
                while !handle.is_finished() {
                    if std::time::Instant::now() >= deadline {
                        *self.join_handle.lock().unwrap() = Some(handle);
                        return false;
                    }
                    std::thread::sleep(JOIN_POLL_INTERVAL);
                }
                let _ = handle.join();
                true
            }
        }
    }
}
