//! `ProcessGuardian`: OS-abstracted spawn, graceful terminate, and forceful
//! kill of the encoder's process tree.
//!
//! Grounded on the teacher's RAII-guard idiom (`api/ws_connection.rs`'s
//! `ConnectionGuard`) for "undo setup on drop", and on the pack's process
//! supervision examples for the spawn/signal shape. POSIX puts the child in
//! its own session/process group (`setsid`) so a signal to the group reaches
//! every descendant the encoder may have forked; Windows assigns the child
//! to a kill-on-close Job Object for the same effect.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use crate::error::{TinycamError, TinycamResult};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// A spawned child process, with its piped stdio handles split out for the
/// caller and enough platform state retained to terminate the whole tree.
pub struct Process {
    child: Child,
    pid: u32,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdin: Option<ChildStdin>,
    #[cfg(windows)]
    job: windows_job::JobHandle,
}

impl Process {
    /// The child's OS process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Takes ownership of the child's stdout pipe. Call once; the
    /// supervisor's read loop owns it afterward.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Takes ownership of the child's stderr pipe (line-oriented logging).
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }
}

/// Spawns, gracefully terminates, and forcefully kills encoder subprocess
/// trees. Stateless; every operation takes the `Process` it acts on.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGuardian;

impl ProcessGuardian {
    /// Creates a guardian. Stateless - this just reads better at call sites
    /// than free functions (`ProcessGuardian::new().spawn(..)`).
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Spawns `argv[0]` with `argv[1..]` as arguments and `env` as
    /// additional environment variables. Stdout is piped binary-clean;
    /// stderr is piped for optional line-oriented logging; stdin is piped
    /// so a polite in-band quit keystroke can be sent later.
    pub fn spawn(&self, argv: &[String], env: &[(String, String)]) -> TinycamResult<Process> {
        if argv.is_empty() {
            return Err(TinycamError::Configuration("empty encoder argv".into()));
        }

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            // New session + process group: a signal to -pid reaches every
            // descendant the encoder forks, not just the direct child.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TinycamError::EncoderFailure(format!("spawn failed: {e}")))?;

        let pid = child
            .id()
            .ok_or_else(|| TinycamError::EncoderFailure("child exited before pid was read".into()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        #[cfg(windows)]
        let job = windows_job::JobHandle::assign(&child)
            .map_err(|e| TinycamError::EncoderFailure(format!("job object setup failed: {e}")))?;

        Ok(Process {
            child,
            pid,
            stdout,
            stderr,
            stdin,
            #[cfg(windows)]
            job,
        })
    }

    /// Sends the encoder's in-band polite-quit keystroke (if `quit_byte` is
    /// `Some`), then a polite termination signal to the whole process group
    /// (POSIX) or simply waits (Windows). Returns `true` iff the process
    /// exits within `timeout`.
    pub async fn terminate_graceful(
        &self,
        process: &mut Process,
        quit_byte: Option<u8>,
        timeout: Duration,
    ) -> bool {
        if let (Some(byte), Some(stdin)) = (quit_byte, process.stdin.as_mut()) {
            let _ = stdin.write_all(&[byte]).await;
            let _ = stdin.flush().await;
        }

        #[cfg(unix)]
        {
            // SAFETY: killpg with a valid, still-owned pid is a plain syscall.
            unsafe {
                libc::kill(-(process.pid as i32), libc::SIGTERM);
            }
        }

        self.await_exit(process, timeout).await
    }

    /// Forcefully terminates the whole process tree: on POSIX, sends a
    /// polite signal to the group, pauses briefly, then sends the lethal
    /// signal; on Windows, terminates the Job Object (killing every member
    /// process). Returns `true` iff the child has exited within `timeout`.
    pub async fn kill(&self, process: &mut Process, timeout: Duration) -> bool {
        #[cfg(unix)]
        {
            unsafe {
                libc::kill(-(process.pid as i32), libc::SIGTERM);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            unsafe {
                libc::kill(-(process.pid as i32), libc::SIGKILL);
            }
        }

        #[cfg(windows)]
        {
            process.job.terminate();
        }

        self.await_exit(process, timeout).await
    }

    async fn await_exit(&self, process: &mut Process, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, process.child.wait()).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(windows)]
mod windows_job {
    use tokio::process::Child;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    /// A Windows Job Object configured to kill every member process when
    /// closed, giving POSIX process-group-kill parity.
    pub struct JobHandle(HANDLE);

    // SAFETY: the underlying HANDLE is only ever accessed through `&self`
    // methods that call thread-safe Win32 APIs.
    unsafe impl Send for JobHandle {}
    unsafe impl Sync for JobHandle {}

    impl JobHandle {
        pub fn assign(child: &Child) -> std::io::Result<Self> {
            unsafe {
                let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
                if job == 0 {
                    return Err(std::io::Error::last_os_error());
                }

                let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
                info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

                let ok = SetInformationJobObject(
                    job,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const _,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                );
                if ok == 0 {
                    return Err(std::io::Error::last_os_error());
                }

                if let Some(raw) = child.raw_handle() {
                    let ok = AssignProcessToJobObject(job, raw as HANDLE);
                    if ok == 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(Self(job))
            }
        }

        pub fn terminate(&self) {
            unsafe {
                TerminateJobObject(self.0, 1);
            }
        }
    }

    impl Drop for JobHandle {
        fn drop(&mut self) {
            unsafe {
                windows_sys::Win32::Foundation::CloseHandle(self.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_rejects_empty_argv() {
        let guardian = ProcessGuardian::new();
        let result = guardian.spawn(&[], &[]);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_terminate_stops_a_sleeping_process() {
        let guardian = ProcessGuardian::new();
        let mut process = guardian
            .spawn(&["sleep".to_string(), "30".to_string()], &[])
            .expect("spawn sleep");

        let stopped = guardian
            .terminate_graceful(&mut process, None, Duration::from_secs(2))
            .await;
        assert!(stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_stops_a_process_that_ignores_term() {
        let guardian = ProcessGuardian::new();
        // `sh -c 'trap "" TERM; sleep 30'` ignores SIGTERM so only kill() can
        // reap it within the timeout.
        let mut process = guardian
            .spawn(
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    "trap '' TERM; sleep 30".to_string(),
                ],
                &[],
            )
            .expect("spawn shell");

        let stopped = guardian.kill(&mut process, Duration::from_secs(2)).await;
        assert!(stopped);
    }
}
