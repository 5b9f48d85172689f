//! Managed Worker Pool (component A) — identifier-addressable, pausable,
//! restartable long-lived tasks plus an attachment-key registry (spec §4.1).
//!
//! Grounded on `thread_manager.h`'s C API surface for the exact state
//! machine and operation names, adapted to an owned task table (§9's
//! redesign note: "make the task table a strongly referenced handle that
//! outlives all workers and encode teardown as a reference count drop").

mod error;
mod process;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use error::{PoolError, Result};
pub use worker::{WorkerControl, WorkerId, WorkerKind, WorkerState};

use worker::Worker;

/// Snapshot returned by `get_info` — the fields of §3's Worker record that
/// make sense to expose read-only.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub kind: WorkerKind,
    pub state: WorkerState,
    pub pid: Option<u32>,
}

/// Outcome of a bounded [`WorkerPool::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Exited,
    TimedOut,
}

/// An identifier-addressable pool of long-lived, pausable, restartable
/// worker tasks. All other subsystems launch their work through one
/// instance of this (spec §1).
pub struct WorkerPool {
    table: Mutex<HashMap<WorkerId, Arc<Worker>>>,
    attachments: Mutex<HashMap<String, WorkerId>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            attachments: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn allocate_id(&self) -> WorkerId {
        WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn guard_shutdown(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        Ok(())
    }

    /// `create(fn) -> id`: launches `body` on a fresh OS thread.
    pub fn create<F>(&self, body: F) -> Result<WorkerId>
    where
        F: FnOnce(WorkerControl) + Send + 'static,
    {
        self.guard_shutdown()?;
        let id = self.allocate_id();
        let worker = Arc::new(Worker::new(id, WorkerKind::Function, None));
        let control = worker.control();
        let thread_worker = Arc::clone(&worker);

        let handle = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                thread_worker.mark_running();
                body(control);
                thread_worker.set_state(WorkerState::Stopped);
            })
            .map_err(|e| PoolError::SpawnError(e.to_string()))?;
        *worker.join_handle.lock().unwrap() = Some(handle);

        self.table.lock().unwrap().insert(id, worker);
        Ok(id)
    }

    /// `create_process(argv) -> id`: forks/execs a monitored child process.
    pub fn create_process(&self, argv: &[String]) -> Result<WorkerId> {
        self.guard_shutdown()?;
        let id = self.allocate_id();
        let (child, info) = process::spawn(argv)?;
        let worker = Arc::new(Worker::new(id, WorkerKind::Process, Some(info)));
        let control = worker.control();
        let monitor_worker = Arc::clone(&worker);

        let handle = std::thread::Builder::new()
            .name(format!("worker-{id}-monitor"))
            .spawn(move || {
                monitor_worker.mark_running();
                let exit_status = &monitor_worker.process.as_ref().unwrap().exit_status;
                let stopped = {
                    let w = Arc::clone(&monitor_worker);
                    move || w.set_state(WorkerState::Stopped)
                };
                let errored = {
                    let w = Arc::clone(&monitor_worker);
                    move || w.set_state(WorkerState::Error)
                };
                process::monitor(child, control, exit_status, stopped, errored);
            })
            .map_err(|e| PoolError::SpawnError(e.to_string()))?;
        *worker.join_handle.lock().unwrap() = Some(handle);

        self.table.lock().unwrap().insert(id, worker);
        Ok(id)
    }

    fn get(&self, id: WorkerId) -> Result<Arc<Worker>> {
        self.table
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(PoolError::NotFound)
    }

    /// `stop(id)`. Idempotent; fails with `NotFound` on an unknown ID.
    pub fn stop(&self, id: WorkerId) -> Result<()> {
        let worker = self.get(id)?;
        worker.request_stop();
        Ok(())
    }

    /// `pause(id)`. No-op (not an error) unless currently `running`.
    pub fn pause(&self, id: WorkerId) -> Result<()> {
        let worker = self.get(id)?;
        if worker.pause() {
            if let (WorkerKind::Process, Some(info)) = (worker.kind, &worker.process) {
                if let Some(pid) = info.pid {
                    process::send_stop(pid);
                }
            }
        }
        Ok(())
    }

    /// `resume(id)`. Inverse of [`Self::pause`].
    pub fn resume(&self, id: WorkerId) -> Result<()> {
        let worker = self.get(id)?;
        if worker.resume() {
            if let (WorkerKind::Process, Some(info)) = (worker.kind, &worker.process) {
                if let Some(pid) = info.pid {
                    process::send_continue(pid);
                }
            }
        }
        Ok(())
    }

    /// `join(id, timeout)`. On success, the record is removed from the
    /// table (§4.1: "On success, the task record is destroyed").
    pub fn join(&self, id: WorkerId, timeout: Option<Duration>) -> Result<JoinOutcome> {
        let worker = self.get(id)?;
        if worker.join_thread(timeout) {
            self.table.lock().unwrap().remove(&id);
            Ok(JoinOutcome::Exited)
        } else {
            Ok(JoinOutcome::TimedOut)
        }
    }

    /// `restart(id, new_arg)`: stop, join, relaunch the same body/command,
    /// preserving the ID. The supplied closure rebuilds the body or argv.
    pub fn restart<F>(&self, id: WorkerId, rebuild: F) -> Result<()>
    where
        F: FnOnce(&WorkerKind, Option<&[String]>) -> RestartSpec,
    {
        let worker = self.get(id)?;
        worker.request_stop();
        worker.join_thread(None);
        self.table.lock().unwrap().remove(&id);

        let argv = worker
            .process
            .as_ref()
            .map(|p| p.argv.as_slice());
        match rebuild(&worker.kind, argv) {
            RestartSpec::Function(body) => {
                let fresh = Arc::new(Worker::new(id, WorkerKind::Function, None));
                let control = fresh.control();
                let thread_worker = Arc::clone(&fresh);
                let handle = std::thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || {
                        thread_worker.mark_running();
                        body(control);
                        thread_worker.set_state(WorkerState::Stopped);
                    })
                    .map_err(|e| PoolError::SpawnError(e.to_string()))?;
                *fresh.join_handle.lock().unwrap() = Some(handle);
                self.table.lock().unwrap().insert(id, fresh);
            }
            RestartSpec::Process(new_argv) => {
                let (child, info) = process::spawn(&new_argv)?;
                let fresh = Arc::new(Worker::new(id, WorkerKind::Process, Some(info)));
                let control = fresh.control();
                let monitor_worker = Arc::clone(&fresh);
                let handle = std::thread::Builder::new()
                    .name(format!("worker-{id}-monitor"))
                    .spawn(move || {
                        monitor_worker.mark_running();
                        let exit_status = &monitor_worker.process.as_ref().unwrap().exit_status;
                        let stopped = {
                            let w = Arc::clone(&monitor_worker);
                            move || w.set_state(WorkerState::Stopped)
                        };
                        let errored = {
                            let w = Arc::clone(&monitor_worker);
                            move || w.set_state(WorkerState::Error)
                        };
                        process::monitor(child, control, exit_status, stopped, errored);
                    })
                    .map_err(|e| PoolError::SpawnError(e.to_string()))?;
                *fresh.join_handle.lock().unwrap() = Some(handle);
                self.table.lock().unwrap().insert(id, fresh);
            }
        }
        Ok(())
    }

    pub fn state(&self, id: WorkerId) -> Result<WorkerState> {
        Ok(self.get(id)?.state())
    }

    pub fn is_alive(&self, id: WorkerId) -> Result<bool> {
        Ok(self.get(id)?.is_alive())
    }

    pub fn get_info(&self, id: WorkerId) -> Result<WorkerInfo> {
        let w = self.get(id)?;
        Ok(WorkerInfo {
            id: w.id,
            kind: w.kind,
            state: w.state(),
            pid: w.process.as_ref().and_then(|p| p.pid),
        })
    }

    #[must_use]
    pub fn all_ids(&self) -> Vec<WorkerId> {
        self.table.lock().unwrap().keys().copied().collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    /// Drains whatever the process-kind worker has written to stdout so
    /// far (§4.1 supplement: `thread_read_from_process`).
    pub fn read_stdout(&self, id: WorkerId) -> Result<Vec<u8>> {
        let w = self.get(id)?;
        let info = w.process.as_ref().ok_or(PoolError::NotFound)?;
        Ok(std::mem::take(&mut info.stdout.lock().unwrap()))
    }

    /// Drains stderr (§4.1 supplement: `thread_read_error_from_process`).
    pub fn read_stderr(&self, id: WorkerId) -> Result<Vec<u8>> {
        let w = self.get(id)?;
        let info = w.process.as_ref().ok_or(PoolError::NotFound)?;
        Ok(std::mem::take(&mut info.stderr.lock().unwrap()))
    }

    // -- Attachment registry (§3, §4.1) --------------------------------

    pub fn register(&self, id: WorkerId, key: &str) -> Result<()> {
        if !self.table.lock().unwrap().contains_key(&id) {
            return Err(PoolError::NotFound);
        }
        let mut attachments = self.attachments.lock().unwrap();
        if attachments.contains_key(key) {
            return Err(PoolError::AlreadyExists);
        }
        attachments.insert(key.to_string(), id);
        Ok(())
    }

    pub fn unregister(&self, key: &str) -> Result<()> {
        self.attachments
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or(PoolError::NotFound)
    }

    pub fn find(&self, key: &str) -> Result<WorkerId> {
        self.attachments
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .ok_or(PoolError::NotFound)
    }

    #[must_use]
    pub fn all_keys(&self) -> Vec<String> {
        self.attachments.lock().unwrap().keys().cloned().collect()
    }

    pub fn stop_by_key(&self, key: &str) -> Result<()> {
        let id = self.find(key)?;
        self.stop(id)
    }

    /// Forceful kill by attachment key: SIGKILL for process-kind, a
    /// cooperative stop (no OS-level preemption is possible) for
    /// function-kind (§4.1).
    pub fn kill_by_key(&self, key: &str) -> Result<()> {
        let id = self.find(key)?;
        let worker = self.get(id)?;
        match (worker.kind, &worker.process) {
            (WorkerKind::Process, Some(info)) => {
                if let Some(pid) = info.pid {
                    process::send_kill(pid);
                }
                worker.request_stop();
            }
            _ => worker.request_stop(),
        }
        Ok(())
    }

    pub fn restart_by_key<F>(&self, key: &str, rebuild: F) -> Result<()>
    where
        F: FnOnce(&WorkerKind, Option<&[String]>) -> RestartSpec,
    {
        let id = self.find(key)?;
        self.restart(id, rebuild)
    }

    /// Stops all workers, joins them, destroys records. Late `create`/
    /// `create_process` calls observe [`PoolError::ShuttingDown`] rather
    /// than racing the table teardown (§4.1 "Teardown of the pool").
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let workers: Vec<Arc<Worker>> = self.table.lock().unwrap().values().cloned().collect();
        for w in &workers {
            w.request_stop();
        }
        for w in &workers {
            w.join_thread(None);
        }
        self.table.lock().unwrap().clear();
        self.attachments.lock().unwrap().clear();
    }
}

/// What to relaunch with, produced by the caller's `rebuild` closure passed
/// to [`WorkerPool::restart`]/[`WorkerPool::restart_by_key`].
pub enum RestartSpec {
    Function(Box<dyn FnOnce(WorkerControl) + Send + 'static>),
    Process(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::time::Duration as Dur;

    #[test]
    fn worker_ids_are_unique_and_monotonic() {
        let pool = WorkerPool::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(pool.create(|_| {}).unwrap());
        }
        for w in ids.windows(2) {
            assert!(w[1].0 > w[0].0);
        }
        pool.shutdown();
    }

    #[test]
    fn is_alive_matches_state_invariant() {
        let pool = WorkerPool::new();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let id = pool
            .create(move |control| {
                let _ = tx;
                while !control.should_exit() {
                    control.check_pause();
                    std::thread::sleep(Dur::from_millis(5));
                }
            })
            .unwrap();
        std::thread::sleep(Dur::from_millis(20));
        assert!(pool.is_alive(id).unwrap());
        assert_eq!(pool.state(id).unwrap(), WorkerState::Running);

        pool.stop(id).unwrap();
        pool.join(id, Some(Dur::from_secs(1))).unwrap();
        assert!(!pool.table.lock().unwrap().contains_key(&id));
        drop(rx);
    }

    #[test]
    fn register_then_unregister_makes_find_fail() {
        let pool = WorkerPool::new();
        let id = pool.create(|_| {}).unwrap();
        pool.register(id, "k").unwrap();
        assert_eq!(pool.find("k").unwrap(), id);
        pool.unregister("k").unwrap();
        assert!(matches!(pool.find("k"), Err(PoolError::NotFound)));
        pool.stop(id).unwrap();
        pool.shutdown();
    }

    #[test]
    fn duplicate_register_key_fails() {
        let pool = WorkerPool::new();
        let a = pool.create(|_| {}).unwrap();
        let b = pool.create(|_| {}).unwrap();
        pool.register(a, "dup").unwrap();
        assert!(matches!(
            pool.register(b, "dup"),
            Err(PoolError::AlreadyExists)
        ));
        pool.shutdown();
    }

    #[test]
    fn double_stop_is_idempotent() {
        let pool = WorkerPool::new();
        let id = pool.create(|control| while !control.should_exit() {}).unwrap();
        pool.stop(id).unwrap();
        pool.stop(id).unwrap();
        pool.join(id, Some(Dur::from_secs(1))).unwrap();
    }

    #[test]
    fn pause_resume_is_noop_on_running_state() {
        let pool = WorkerPool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&counter);
        let id = pool
            .create(move |control| {
                for _ in 0..3 {
                    if control.should_exit() {
                        return;
                    }
                    control.check_pause();
                    c2.fetch_add(1, O::SeqCst);
                    std::thread::sleep(Dur::from_millis(10));
                }
            })
            .unwrap();
        pool.pause(id).unwrap();
        assert_eq!(pool.state(id).unwrap(), WorkerState::Paused);
        pool.resume(id).unwrap();
        assert_eq!(pool.state(id).unwrap(), WorkerState::Running);
        pool.join(id, Some(Dur::from_secs(1))).unwrap();
        assert!(counter.load(O::SeqCst) > 0);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let pool = WorkerPool::new();
        let bogus = WorkerId(999);
        assert!(matches!(pool.stop(bogus), Err(PoolError::NotFound)));
        assert!(matches!(pool.state(bogus), Err(PoolError::NotFound)));
    }

    #[test]
    fn create_after_shutdown_is_rejected() {
        let pool = WorkerPool::new();
        pool.shutdown();
        assert!(matches!(pool.create(|_| {}), Err(PoolError::ShuttingDown)));
    }

    #[test]
    fn all_ids_and_count_track_table() {
        let pool = WorkerPool::new();
        let id1 = pool.create(|_| {}).unwrap();
        let id2 = pool.create(|_| {}).unwrap();
        assert_eq!(pool.count(), 2);
        let ids = pool.all_ids();
        assert!(ids.contains(&id1) && ids.contains(&id2));
        pool.shutdown();
        assert_eq!(pool.count(), 0);
    }
}
