//! Process-kind worker launch and monitor loop (§4.1 "Process monitor
//! loop"), grounded on `thread_create_process`/`thread_write_to_process`/
//! `thread_read_from_process` in
//! `ur-threadder-api/include/thread_manager.h`.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use super::error::PoolError;
use super::worker::{ProcessInfo, WorkerControl};
use crate::constants::{JOIN_POLL_INTERVAL, PROCESS_TERM_GRACE};

/// Spawns `argv[0]` with the remaining elements as arguments, piping all
/// three standard streams. stdout/stderr are drained continuously by
/// dedicated reader threads into the returned [`ProcessInfo`] buffers so the
/// monitor loop's `waitpid` poll never blocks on a full pipe.
pub(super) fn spawn(argv: &[String]) -> Result<(Child, ProcessInfo), PoolError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(PoolError::SpawnError("empty argv".into()));
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| PoolError::SpawnError(e.to_string()))?;

    let pid = child.id();
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));

    if let Some(mut stdout) = child.stdout.take() {
        let buf = Arc::clone(&stdout_buf);
        std::thread::spawn(move || drain(&mut stdout, &buf));
    }
    if let Some(mut stderr) = child.stderr.take() {
        let buf = Arc::clone(&stderr_buf);
        std::thread::spawn(move || drain(&mut stderr, &buf));
    }

    let info = ProcessInfo {
        pid: Some(pid),
        argv: argv.to_vec(),
        stdout: stdout_buf,
        stderr: stderr_buf,
        exit_status: Mutex::new(None),
    };

    Ok((child, info))
}

fn drain(src: &mut impl Read, buf: &Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match src.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.lock().unwrap().extend_from_slice(&chunk[..n]),
        }
    }
}

/// Runs on the worker's dedicated thread: poll-wait for exit, honour a
/// should-exit request with SIGTERM then SIGKILL after a grace period,
/// capture the final exit status.
pub(super) fn monitor(
    mut child: Child,
    control: WorkerControl,
    exit_status: &Mutex<Option<i32>>,
    mark_stopped: impl Fn(),
    mark_error: impl Fn(),
) {
    let mut term_sent_at: Option<std::time::Instant> = None;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                *exit_status.lock().unwrap() = status.code();
                mark_stopped();
                return;
            }
            Ok(None) => {}
            Err(_) => {
                mark_error();
                return;
            }
        }

        if control.should_exit() {
            let pid = child.id() as i32;
            match term_sent_at {
                None => {
                    unsafe { libc::kill(pid, libc::SIGTERM) };
                    term_sent_at = Some(std::time::Instant::now());
                }
                Some(sent) if sent.elapsed() >= PROCESS_TERM_GRACE => {
                    unsafe { libc::kill(pid, libc::SIGKILL) };
                    let _ = child.wait();
                    mark_stopped();
                    return;
                }
                Some(_) => {}
            }
        }

        std::thread::sleep(JOIN_POLL_INTERVAL);
    }
}

/// Sends the OS stop signal (§4.1 pause for process-kind).
pub(super) fn send_stop(pid: u32) {
    unsafe { libc::kill(pid as i32, libc::SIGSTOP) };
}

/// Sends the OS continue signal (§4.1 resume for process-kind).
pub(super) fn send_continue(pid: u32) {
    unsafe { libc::kill(pid as i32, libc::SIGCONT) };
}

/// Forceful kill for `kill_by_key` on a process-kind worker (§4.1).
pub(super) fn send_kill(pid: u32) {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) };
}
