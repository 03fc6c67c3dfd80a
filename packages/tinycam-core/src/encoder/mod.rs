//! `EncoderSupervisor`: runs the encoder in a perpetual loop, feeding its
//! stdout to the `InitCache` and `Broadcaster`, and restarting it with a
//! back-off after it exits.
//!
//! Grounded on the teacher's task-lifecycle idiom (a start/stop-gated
//! background task driven by a control channel) combined with
//! `ProcessGuardian` for spawn/terminate and `DeviceLock` for single-instance
//! arbitration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::Broadcaster;
use crate::config::EncoderConfig;
use crate::error::{TinycamError, TinycamResult};
use crate::init_cache::InitCache;
use crate::process::{DeviceLock, ProcessGuardian};

/// Size of each read from the encoder's stdout.
const CHUNK_SIZE: usize = 64 * 1024;
/// Back-off before respawning after a user-initiated restart.
const RESTART_BACKOFF: Duration = Duration::from_millis(200);
/// Back-off before respawning after a crash or natural exit.
const CRASH_BACKOFF: Duration = Duration::from_secs(3);
/// Budget for the polite termination signal to take effect.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(3);
/// Budget for the forceful kill to take effect.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);
/// In-band polite-quit character most encoders (ffmpeg included) honor on
/// stdin.
const QUIT_BYTE: u8 = b'q';

type ArgvSource = Box<dyn Fn() -> Vec<String> + Send + Sync>;

enum Control {
    /// Carries the freshly-built argv source so a restart while already
    /// running picks up the new config instead of respawning with the old
    /// one.
    Restart(ArgvSource),
    Shutdown,
}

enum ExitReason {
    Shutdown,
    Restarted,
    Stopped,
}

struct RunningTask {
    control: mpsc::Sender<Control>,
    handle: JoinHandle<()>,
}

/// Supervises one encoder's lifetime: exactly one child alive at a time,
/// arbitrated across processes by a `DeviceLock` on the device identifier.
pub struct EncoderSupervisor {
    guardian: ProcessGuardian,
    init_cache: Arc<InitCache>,
    broadcaster: Arc<Broadcaster>,
    current_pid: Arc<AtomicU32>,
    running: Mutex<Option<RunningTask>>,
}

impl EncoderSupervisor {
    /// Builds a supervisor that feeds the given cache and broadcaster.
    #[must_use]
    pub fn new(init_cache: Arc<InitCache>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            guardian: ProcessGuardian::new(),
            init_cache,
            broadcaster,
            current_pid: Arc::new(AtomicU32::new(0)),
            running: Mutex::new(None),
        }
    }

    /// The encoder child's current OS pid, if one is running.
    #[must_use]
    pub fn current_pid(&self) -> Option<u32> {
        match self.current_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Starts the supervisor loop for `config`, acquiring the device lock
    /// under `lock_dir`. Idempotent: a no-op if already running.
    pub async fn start(&self, config: EncoderConfig, lock_dir: PathBuf) -> TinycamResult<()> {
        self.start_with_argv_source(
            lock_dir,
            config.device_id.clone(),
            Box::new(move || config.build_argv()),
        )
        .await
    }

    /// Idempotent stop: sends shutdown, terminates the current child, and
    /// awaits the read loop's exit before returning.
    pub async fn stop(&self) {
        let task = self.running.lock().await.take();
        if let Some(task) = task {
            let _ = task.control.send(Control::Shutdown).await;
            let _ = task.handle.await;
        }
    }

    /// Stop then start: used to pick up configuration changes or recover
    /// from a wedged encoder without a full server restart. If already
    /// running, the new config's argv is picked up on the respawn that
    /// follows - the device lock and read task are left untouched.
    pub async fn restart(&self, config: EncoderConfig, lock_dir: PathBuf) -> TinycamResult<()> {
        {
            let guard = self.running.lock().await;
            if let Some(task) = guard.as_ref() {
                let argv_source: ArgvSource = Box::new(move || config.build_argv());
                let _ = task.control.send(Control::Restart(argv_source)).await;
                return Ok(());
            }
        }
        self.start(config, lock_dir).await
    }

    async fn start_with_argv_source(
        &self,
        lock_dir: PathBuf,
        device_id: String,
        argv_source: ArgvSource,
    ) -> TinycamResult<()> {
        let mut guard = self.running.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let device_lock = DeviceLock::acquire(&lock_dir, &device_id)?;
        let (tx, rx) = mpsc::channel(4);

        let guardian = self.guardian;
        let init_cache = self.init_cache.clone();
        let broadcaster = self.broadcaster.clone();
        let current_pid = self.current_pid.clone();

        let handle = tokio::spawn(async move {
            let _device_lock = device_lock;
            run_loop(guardian, init_cache, broadcaster, current_pid, argv_source, rx).await;
        });

        *guard = Some(RunningTask { control: tx, handle });
        Ok(())
    }

    #[cfg(test)]
    async fn start_with_argv(&self, argv: Vec<String>, lock_dir: PathBuf) -> TinycamResult<()> {
        let source: ArgvSource = Box::new(move || argv.clone());
        self.start_with_argv_source(lock_dir, "test-device".to_string(), source)
            .await
    }
}

async fn run_loop(
    guardian: ProcessGuardian,
    init_cache: Arc<InitCache>,
    broadcaster: Arc<Broadcaster>,
    current_pid: Arc<AtomicU32>,
    mut argv_source: ArgvSource,
    mut control: mpsc::Receiver<Control>,
) {
    loop {
        init_cache.reset();
        let argv = argv_source();

        let mut process = match guardian.spawn(&argv, &[]) {
            Ok(process) => process,
            Err(e) => {
                log::warn!("encoder spawn failed: {e}");
                tokio::time::sleep(CRASH_BACKOFF).await;
                match control.recv().await {
                    Some(Control::Shutdown) | None => return,
                    Some(Control::Restart(new_source)) => {
                        argv_source = new_source;
                        continue;
                    }
                }
            }
        };

        current_pid.store(process.pid(), Ordering::Relaxed);
        let mut stdout = process.take_stdout();
        let mut buf = [0u8; CHUNK_SIZE];

        let reason = loop {
            tokio::select! {
                biased;

                signal = control.recv() => {
                    break match signal {
                        Some(Control::Shutdown) | None => ExitReason::Shutdown,
                        Some(Control::Restart(new_source)) => {
                            argv_source = new_source;
                            ExitReason::Restarted
                        }
                    };
                }

                read_result = read_chunk(&mut stdout, &mut buf) => {
                    match read_result {
                        Some(n) if n > 0 => {
                            let chunk = Bytes::copy_from_slice(&buf[..n]);
                            init_cache.feed(&chunk);
                            broadcaster.broadcast(chunk);
                        }
                        _ => break ExitReason::Stopped,
                    }
                }
            }
        };

        current_pid.store(0, Ordering::Relaxed);
        match reason {
            ExitReason::Shutdown => {
                guardian
                    .terminate_graceful(&mut process, Some(QUIT_BYTE), GRACEFUL_TIMEOUT)
                    .await;
                guardian.kill(&mut process, KILL_TIMEOUT).await;
                return;
            }
            ExitReason::Restarted => {
                guardian
                    .terminate_graceful(&mut process, Some(QUIT_BYTE), GRACEFUL_TIMEOUT)
                    .await;
                guardian.kill(&mut process, KILL_TIMEOUT).await;
                tokio::time::sleep(RESTART_BACKOFF).await;
            }
            ExitReason::Stopped => {
                guardian.kill(&mut process, KILL_TIMEOUT).await;
                tokio::time::sleep(CRASH_BACKOFF).await;
            }
        }
    }
}

async fn read_chunk(stdout: &mut Option<tokio::process::ChildStdout>, buf: &mut [u8]) -> Option<usize> {
    match stdout {
        Some(out) => out.read(buf).await.ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_cache::ContainerKind;

    fn fresh_supervisor() -> (Arc<InitCache>, Arc<Broadcaster>, EncoderSupervisor) {
        let init_cache = Arc::new(InitCache::new(ContainerKind::Cluster));
        let broadcaster = Arc::new(Broadcaster::new());
        let supervisor = EncoderSupervisor::new(init_cache.clone(), broadcaster.clone());
        (init_cache, broadcaster, supervisor)
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (_, _, supervisor) = fresh_supervisor();
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()];

        supervisor
            .start_with_argv(argv.clone(), dir.path().to_path_buf())
            .await
            .unwrap();
        let pid_first = supervisor.current_pid();

        supervisor
            .start_with_argv(argv, dir.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(supervisor.current_pid(), pid_first);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn stdout_chunks_reach_the_broadcaster() {
        let (_, broadcaster, supervisor) = fresh_supervisor();
        let dir = tempfile::tempdir().unwrap();
        let sub = broadcaster.subscribe(8);

        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            "printf 'hello-from-encoder'; sleep 5".to_string(),
        ];
        supervisor
            .start_with_argv(argv, dir.path().to_path_buf())
            .await
            .unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(2), sub.queue().pop())
            .await
            .expect("chunk delivered in time")
            .expect("queue not closed");
        assert_eq!(&chunk[..], b"hello-from-encoder");

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn restart_while_running_picks_up_new_argv() {
        let init_cache = Arc::new(InitCache::new(ContainerKind::Cluster));
        let broadcaster = Arc::new(Broadcaster::new());
        let current_pid = Arc::new(AtomicU32::new(0));
        let sub = broadcaster.subscribe(8);

        let (tx, rx) = mpsc::channel(4);
        let first: ArgvSource = Box::new(|| {
            vec!["sh".to_string(), "-c".to_string(), "printf 'first'; sleep 5".to_string()]
        });

        let handle = tokio::spawn(run_loop(
            ProcessGuardian::new(),
            init_cache,
            broadcaster,
            current_pid,
            first,
            rx,
        ));

        let chunk = tokio::time::timeout(Duration::from_secs(2), sub.queue().pop())
            .await
            .expect("first chunk delivered")
            .expect("queue not closed");
        assert_eq!(&chunk[..], b"first");

        let second: ArgvSource = Box::new(|| {
            vec!["sh".to_string(), "-c".to_string(), "printf 'second'; sleep 5".to_string()]
        });
        tx.send(Control::Restart(second)).await.unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(2), sub.queue().pop())
            .await
            .expect("chunk from the restarted argv delivered")
            .expect("queue not closed");
        assert_eq!(
            &chunk[..], b"second",
            "restart() must respawn with the new argv, not the stale one"
        );

        tx.send(Control::Shutdown).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(3), handle).await;
    }

    #[tokio::test]
    async fn stop_clears_current_pid() {
        let (_, _, supervisor) = fresh_supervisor();
        let dir = tempfile::tempdir().unwrap();
        let argv = vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()];

        supervisor
            .start_with_argv(argv, dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(supervisor.current_pid().is_some());

        supervisor.stop().await;
        assert!(supervisor.current_pid().is_none());
    }
}
