//! Backend process lifecycle.
//!
//! Spawns a backend executable as a child process, forwards its output to the
//! log, and stops it on request. Stop is idempotent: the child handle is taken
//! out exactly once.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use super::error::BackendError;

/// Everything needed to launch one backend.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Backend name, used to tag forwarded output.
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Extra environment for the child on top of the gateway's own.
    pub env: Vec<(String, String)>,
    /// Passed to the backend as `--addr <address>`.
    pub address: String,
}

pub struct BackendProcess {
    name: String,
    executable: PathBuf,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProcess")
            .field("name", &self.name)
            .field("executable", &self.executable)
            .field("pid", &self.pid)
            .finish()
    }
}

impl BackendProcess {
    /// Spawn the backend. Must be called from within a tokio runtime.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, BackendError> {
        let executable = ensure_executable(&spec.executable).map_err(|source| BackendError::Spawn {
            name: spec.name.clone(),
            source,
        })?;

        let mut command = Command::new(&executable);
        command
            .args(&spec.args)
            .arg("--addr")
            .arg(&spec.address)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }

        info!(
            "[PROCESS] Spawning {}: {} {} --addr {}",
            spec.name,
            executable.display(),
            spec.args.join(" "),
            spec.address
        );

        let mut child = command.spawn().map_err(|source| BackendError::Spawn {
            name: spec.name.clone(),
            source,
        })?;
        let pid = child.id();
        let tag = format!("{}-{}", spec.name, spec.address);

        match child.stdout.take() {
            Some(stdout) => forward_output(tag.clone(), "stdout", stdout),
            None => warn!("[PROCESS] Could not tail stdout of {tag}"),
        }
        match child.stderr.take() {
            Some(stderr) => forward_output(tag.clone(), "stderr", stderr),
            None => warn!("[PROCESS] Could not tail stderr of {tag}"),
        }

        debug!("[PROCESS] {tag} started with pid {pid:?}");

        Ok(Self {
            name: spec.name.clone(),
            executable,
            pid,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Ask the process to terminate, wait up to `timeout`, then kill it.
    /// Stopping an already stopped process is a no-op.
    pub async fn stop(&self, timeout: Duration) -> Result<(), BackendError> {
        let taken = self.child.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut child) = taken else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("[PROCESS] {} (pid {:?}) had already exited: {status}", self.name, self.pid);
            return Ok(());
        }

        request_termination(&mut child);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!("[PROCESS] {} (pid {:?}) exited: {status}", self.name, self.pid);
            }
            Ok(Err(e)) => return Err(BackendError::Io(e)),
            Err(_) => {
                warn!(
                    "[PROCESS] {} (pid {:?}) did not exit within {timeout:?}, killing",
                    self.name, self.pid
                );
                child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Resolve the executable and make sure it has an exec bit.
fn ensure_executable(path: &Path) -> std::io::Result<PathBuf> {
    let path = std::fs::canonicalize(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path)?.permissions().mode();
        if mode & 0o111 == 0 {
            debug!("[PROCESS] {} is not executable, setting mode 0700", path.display());
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    Ok(path)
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.start_kill();
}

fn forward_output<R>(tag: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!("[BACKEND {tag}] {stream}: {line}"),
                Ok(None) => break,
                Err(e) => {
                    warn!("[BACKEND {tag}] failed to read {stream}: {e}");
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("llama-gateway-process-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("backend.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        path
    }

    fn spec(executable: PathBuf) -> ProcessSpec {
        ProcessSpec {
            name: "test".into(),
            executable,
            args: vec![],
            env: vec![("LLAMA_GATEWAY_TEST".into(), "1".into())],
            address: "127.0.0.1:0".into(),
        }
    }

    #[tokio::test]
    async fn test_spawn_sets_exec_bit_and_stops() {
        let path = write_script("graceful", "echo \"started $@\"\nexec sleep 30");
        let process = BackendProcess::spawn(&spec(path.clone())).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_ne!(mode & 0o100, 0);
        assert!(process.pid().is_some());
        assert!(process.is_alive());

        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_double_stop_is_noop() {
        let path = write_script("double", "exec sleep 30");
        let process = BackendProcess::spawn(&spec(path)).unwrap();
        process.stop(Duration::from_secs(5)).await.unwrap();
        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_stop_kills_process_ignoring_sigterm() {
        let path = write_script("stubborn", "trap '' TERM\nwhile true; do sleep 1; done");
        let process = BackendProcess::spawn(&spec(path)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        process.stop(Duration::from_millis(200)).await.unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_stop_after_exit() {
        let path = write_script("exits", "exit 0");
        let process = BackendProcess::spawn(&spec(path)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!process.is_alive());
        process.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let err = BackendProcess::spawn(&spec(PathBuf::from("/nonexistent/backend"))).unwrap_err();
        assert!(matches!(err, BackendError::Spawn { .. }));
    }
}
