//! Case Executor (C5): drives one case through
//! `pending -> configuring -> configured -> building -> built -> running ->
//! verifying -> done(verdict)`, with a parallel `failed(phase, reason)`
//! reachable from any non-terminal state (spec.md §4.5).
//!
//! Side effects are scoped to the case's own directory plus well-scoped
//! network/mount teardown, matching the "ambient mutable state" redesign
//! note in spec.md §9: no process-wide `chdir`, every acquired resource
//! (child PID, network device, mount) is owned by a registry whose
//! release is guaranteed on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::CaseError;
use crate::orchestrator::PortAllocator;

/// Default wall-clock deadlines, overridable per invocation (spec.md §4.5).
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
    Cancelled,
}

impl Verdict {
    /// The single line written to `result`: `pass` | `fail(<phase>)` | `cancelled`.
    pub fn result_line(&self) -> String {
        match self {
            Verdict::Pass => "pass".to_string(),
            Verdict::Fail(phase) => format!("fail({phase})"),
            Verdict::Cancelled => "cancelled".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub index: usize,
    pub verdict: Verdict,
}

/// Resources a case acquires while running, released unconditionally by
/// `cleanup` regardless of which phase the case is leaving from.
#[derive(Default)]
struct ResourceRegistry {
    child_pid: Option<u32>,
    bridge_name: Option<String>,
    mounted: bool,
    allocated_ports: Vec<u16>,
}

pub struct CaseExecutor {
    pub index: usize,
    pub case_dir: PathBuf,
    pub session_name: String,
    pub build_timeout: Duration,
    pub run_timeout: Duration,
    pub grace: Duration,
    pub success_marker: Option<String>,
    pub networking: bool,
    pub bridge_name: String,
    pub env_allowlist: Vec<(String, String)>,
    /// Host ports allocated for this case's run phase by the orchestrator's
    /// `PortAllocator`, one per `app.runtime.ports` entry; exposed to the
    /// run script as `UKHARNESS_PORT_<index>` rather than baked into the
    /// materialized script, so concurrently dispatched cases never share a
    /// port (spec.md §5).
    pub allocated_ports: Vec<u16>,
    pub port_allocator: Arc<PortAllocator>,
    /// Checked at phase boundaries and mid-phase (via `run_phase`'s
    /// `select!`); when set, the in-flight script is terminated through the
    /// same polite sequence as a timeout rather than the task being
    /// aborted out from under it.
    pub shutdown: Arc<AtomicBool>,
}

impl CaseExecutor {
    fn log_dir(&self) -> PathBuf {
        self.case_dir.join(&self.session_name)
    }

    async fn prepare_log_dir(&self) -> Result<(), CaseError> {
        tokio::fs::create_dir_all(self.log_dir())
            .await
            .map_err(|e| CaseError::Build {
                index: self.index,
                reason: format!("creating log directory: {e}"),
            })
    }

    /// `configuring -> configured`: verifies the three artifacts C4
    /// promises are present (invariant: build/run/config exist before the
    /// case enters `configure-complete`).
    fn ensure_configured(&self) -> Result<(), CaseError> {
        for name in ["build", "run", "config.yaml"] {
            if !self.case_dir.join(name).exists() {
                return Err(CaseError::Build {
                    index: self.index,
                    reason: format!("missing materialized artifact '{name}'"),
                });
            }
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        script: &str,
        log_name: &str,
        deadline: Duration,
        phase_name: &'static str,
        extra_env: &[(String, String)],
        registry: &mut ResourceRegistry,
    ) -> Result<i32, CaseError> {
        let script_path = self.case_dir.join(script);
        let mut command = Command::new(&script_path);
        command
            .current_dir(&self.case_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env_allowlist {
            command.env(key, value);
        }
        for (key, value) in extra_env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            stage_error(self.index, phase_name, format!("spawning {script}: {e}"))
        })?;
        registry.child_pid = child.id();

        let log_path = self.log_dir().join(log_name);

        let outcome = tokio::select! {
            result = timeout(deadline, drain_and_wait(&mut child, &log_path, self.index, phase_name)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => {
                        warn!(index = self.index, phase = phase_name, "deadline exceeded, terminating");
                        terminate_politely(&mut child, self.grace).await;
                        Err(CaseError::Timeout {
                            index: self.index,
                            phase: phase_name.to_string(),
                        })
                    }
                }
            }
            _ = wait_for_shutdown(&self.shutdown) => {
                info!(index = self.index, phase = phase_name, "shutdown requested, terminating case");
                terminate_politely(&mut child, self.grace).await;
                Err(CaseError::Cancelled { index: self.index })
            }
        };
        registry.child_pid = None;
        outcome
    }

    /// Drives the full state machine for one case. Cleanup runs
    /// unconditionally on every exit path, including cancellation.
    pub async fn execute(&self) -> CaseOutcome {
        let mut registry = ResourceRegistry {
            bridge_name: if self.networking {
                Some(self.bridge_name.clone())
            } else {
                None
            },
            allocated_ports: self.allocated_ports.clone(),
            ..Default::default()
        };

        let verdict = self.execute_inner(&mut registry).await;
        self.cleanup(&registry).await;

        let verdict = match verdict {
            Ok(v) => v,
            Err(CaseError::Cancelled { .. }) => Verdict::Cancelled,
            Err(e) => Verdict::Fail(phase_of(&e)),
        };
        self.write_result(&verdict).await;
        CaseOutcome {
            index: self.index,
            verdict,
        }
    }

    async fn execute_inner(&self, registry: &mut ResourceRegistry) -> Result<Verdict, CaseError> {
        self.prepare_log_dir().await?;
        self.ensure_configured()?;

        if self.shutdown.load(Ordering::SeqCst) {
            return Err(CaseError::Cancelled { index: self.index });
        }
        info!(index = self.index, "building");
        let build_exit = self
            .run_phase("build", "build.log", self.build_timeout, "build", &[], registry)
            .await?;
        if build_exit != 0 {
            return Err(CaseError::Build {
                index: self.index,
                reason: format!("exit={build_exit}"),
            });
        }

        if self.shutdown.load(Ordering::SeqCst) {
            return Err(CaseError::Cancelled { index: self.index });
        }
        info!(index = self.index, "running");
        registry.mounted = true;
        let port_env: Vec<(String, String)> = self
            .allocated_ports
            .iter()
            .enumerate()
            .map(|(i, port)| (format!("UKHARNESS_PORT_{i}"), port.to_string()))
            .collect();
        let run_exit = self
            .run_phase("run", "run.log", self.run_timeout, "run", &port_env, registry)
            .await?;
        if run_exit != 0 {
            return Err(CaseError::Run {
                index: self.index,
                reason: format!("exit={run_exit}"),
            });
        }

        info!(index = self.index, "verifying");
        self.verify().await
    }

    async fn verify(&self) -> Result<Verdict, CaseError> {
        let run_log = self.log_dir().join("run.log");
        let content = tokio::fs::read_to_string(&run_log).await.unwrap_or_default();

        match &self.success_marker {
            Some(marker) if !marker.is_empty() => {
                if content.contains(marker.as_str()) {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::Fail("verify".to_string()))
                }
            }
            // No declared marker: a clean exit within the timeout is a pass.
            _ => Ok(Verdict::Pass),
        }
    }

    /// Invoked unconditionally on exit, including cancellation: kills any
    /// recorded child still alive, tears down network plumbing it set up,
    /// and unmounts any filesystem it mounted. Failures here are logged
    /// (`CleanupWarning`) and never alter the already-decided verdict.
    async fn cleanup(&self, registry: &ResourceRegistry) {
        if let Some(pid) = registry.child_pid {
            if let Err(e) = kill_pid(pid) {
                warn!(index = self.index, pid, error = %e, "cleanup: failed to kill residual child");
            }
        }
        if let Some(bridge) = &registry.bridge_name {
            if let Err(e) = teardown_bridge(bridge).await {
                warn!(index = self.index, bridge, error = %e, "cleanup: failed to tear down bridge");
            }
        }
        if registry.mounted {
            let mount_point = self.case_dir.join("rootfs-mount");
            if mount_point.exists() {
                if let Err(e) = unmount(&mount_point).await {
                    warn!(index = self.index, path = %mount_point.display(), error = %e, "cleanup: failed to unmount");
                }
            }
        }
        for port in &registry.allocated_ports {
            self.port_allocator.release(*port);
        }
    }

    async fn write_result(&self, verdict: &Verdict) {
        let path = self.log_dir().join("result");
        if let Err(e) = tokio::fs::write(&path, verdict.result_line()).await {
            warn!(index = self.index, error = %e, "failed to write result file");
        }
    }
}

fn phase_of(err: &CaseError) -> String {
    match err {
        CaseError::Build { .. } => "build".to_string(),
        CaseError::Run { .. } => "run".to_string(),
        CaseError::Verify { .. } => "verify".to_string(),
        CaseError::Timeout { phase, .. } => format!("{phase},timeout"),
        CaseError::Cancelled { .. } => "cancelled".to_string(),
    }
}

/// Builds the `CaseError` variant matching `phase` so a failure during the
/// run phase is never mislabeled as a build failure (or vice versa).
fn stage_error(index: usize, phase: &str, reason: String) -> CaseError {
    match phase {
        "run" => CaseError::Run { index, reason },
        _ => CaseError::Build { index, reason },
    }
}

/// Resolves once `shutdown` is observed set. Polled rather than notified:
/// shutdown is rare and the poll interval is short relative to any phase
/// deadline, so the added latency is negligible.
async fn wait_for_shutdown(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn drain_and_wait(
    child: &mut Child,
    log_path: &Path,
    index: usize,
    phase: &str,
) -> Result<i32, CaseError> {
    let mut log_file = tokio::fs::File::create(log_path)
        .await
        .map_err(|e| stage_error(index, phase, format!("creating log file {}: {e}", log_path.display())))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_copy = async {
        if let Some(mut out) = stdout {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut out, &mut buf).await;
            buf
        } else {
            Vec::new()
        }
    };
    let stderr_copy = async {
        if let Some(mut err) = stderr {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut err, &mut buf).await;
            buf
        } else {
            Vec::new()
        }
    };

    // Drive stdout/stderr draining concurrently with the wait so a chatty
    // child can't deadlock on a full pipe while the executor blocks on exit.
    let (out_buf, err_buf, status) = tokio::join!(stdout_copy, stderr_copy, child.wait());

    log_file
        .write_all(&out_buf)
        .await
        .map_err(|e| stage_error(index, phase, format!("writing stdout to {}: {e}", log_path.display())))?;
    if !err_buf.is_empty() {
        log_file
            .write_all(&err_buf)
            .await
            .map_err(|e| stage_error(index, phase, format!("writing stderr to {}: {e}", log_path.display())))?;
    }

    let status = status.map_err(|e| stage_error(index, phase, format!("waiting for child: {e}")))?;
    Ok(status.code().unwrap_or(-1))
}

/// Polite signal, grace window, then a hard kill (spec.md §5).
async fn terminate_politely(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let _ = send_signal(pid, "TERM");
    }
    if timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: &str) -> std::io::Result<()> {
    let sig = match signal {
        "TERM" => libc::SIGTERM,
        "KILL" => libc::SIGKILL,
        _ => libc::SIGTERM,
    };
    let result = unsafe { libc::kill(pid as i32, sig) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: &str) -> std::io::Result<()> {
    Ok(())
}

fn kill_pid(pid: u32) -> std::io::Result<()> {
    send_signal(pid, "TERM")
}

async fn teardown_bridge(name: &str) -> Result<(), std::io::Error> {
    let status = Command::new("ip")
        .args(["link", "delete", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() || !Path::new("/sys/class/net").join(name).exists() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("ip link delete {name} failed")))
    }
}

async fn unmount(path: &Path) -> Result<(), std::io::Error> {
    let status = Command::new("umount")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("umount {} failed", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn writable_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
    }

    fn base_executor(case_dir: &Path) -> CaseExecutor {
        CaseExecutor {
            index: 1,
            case_dir: case_dir.to_path_buf(),
            session_name: "session".to_string(),
            build_timeout: Duration::from_secs(5),
            run_timeout: Duration::from_secs(5),
            grace: Duration::from_millis(200),
            success_marker: Some("ALL TESTS PASSED".to_string()),
            networking: false,
            bridge_name: "uktap-test".to_string(),
            env_allowlist: vec![],
            allocated_ports: vec![],
            port_allocator: Arc::new(crate::orchestrator::PortAllocator::new(vec![])),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// S5 from spec.md §8: build failure is terminal for the case.
    #[tokio::test]
    async fn s5_build_failure_is_contained() {
        let dir = tempdir().unwrap();
        writable_script(dir.path(), "build", "#!/bin/sh\nexit 2\n");
        writable_script(dir.path(), "run", "#!/bin/sh\necho should-not-run\n");
        std::fs::write(dir.path().join("config.yaml"), "{}").unwrap();

        let executor = base_executor(dir.path());
        let outcome = executor.execute().await;
        assert_eq!(outcome.verdict, Verdict::Fail("build".to_string()));

        let result = std::fs::read_to_string(dir.path().join("session/result")).unwrap();
        assert_eq!(result, "fail(build)");
    }

    #[tokio::test]
    async fn successful_run_with_marker_passes() {
        let dir = tempdir().unwrap();
        writable_script(dir.path(), "build", "#!/bin/sh\nexit 0\n");
        writable_script(dir.path(), "run", "#!/bin/sh\necho ALL TESTS PASSED\n");
        std::fs::write(dir.path().join("config.yaml"), "{}").unwrap();

        let executor = base_executor(dir.path());
        let outcome = executor.execute().await;
        assert_eq!(outcome.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn missing_marker_is_a_failure() {
        let dir = tempdir().unwrap();
        writable_script(dir.path(), "build", "#!/bin/sh\nexit 0\n");
        writable_script(dir.path(), "run", "#!/bin/sh\necho nothing interesting\n");
        std::fs::write(dir.path().join("config.yaml"), "{}").unwrap();

        let executor = base_executor(dir.path());
        let outcome = executor.execute().await;
        assert_eq!(outcome.verdict, Verdict::Fail("verify".to_string()));
    }

    #[tokio::test]
    async fn no_declared_marker_passes_on_clean_exit() {
        let dir = tempdir().unwrap();
        writable_script(dir.path(), "build", "#!/bin/sh\nexit 0\n");
        writable_script(dir.path(), "run", "#!/bin/sh\necho anything\n");
        std::fs::write(dir.path().join("config.yaml"), "{}").unwrap();

        let mut executor = base_executor(dir.path());
        executor.success_marker = None;
        let outcome = executor.execute().await;
        assert_eq!(outcome.verdict, Verdict::Pass);
    }

    /// S6 from spec.md §8: a run that sleeps past its deadline times out.
    #[tokio::test]
    async fn s6_run_timeout_is_terminated() {
        let dir = tempdir().unwrap();
        writable_script(dir.path(), "build", "#!/bin/sh\nexit 0\n");
        writable_script(dir.path(), "run", "#!/bin/sh\nsleep 30\n");
        std::fs::write(dir.path().join("config.yaml"), "{}").unwrap();

        let mut executor = base_executor(dir.path());
        executor.run_timeout = Duration::from_millis(200);
        executor.grace = Duration::from_millis(100);
        let outcome = executor.execute().await;
        assert_eq!(outcome.verdict, Verdict::Fail("run,timeout".to_string()));
    }

    /// A shutdown that arrives mid-run is handled the same way a timeout
    /// is: SIGTERM first, so the run script's own `trap ... EXIT INT TERM`
    /// gets to fire, not an external abort that would SIGKILL it.
    #[tokio::test]
    async fn shutdown_mid_run_terminates_politely_and_cancels() {
        let dir = tempdir().unwrap();
        writable_script(dir.path(), "build", "#!/bin/sh\nexit 0\n");
        writable_script(dir.path(), "run", "#!/bin/sh\ntrap 'echo caught-term; exit 0' TERM\nsleep 30\n");
        std::fs::write(dir.path().join("config.yaml"), "{}").unwrap();

        let mut executor = base_executor(dir.path());
        executor.run_timeout = Duration::from_secs(5);
        let shutdown = Arc::new(AtomicBool::new(false));
        executor.shutdown = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move { executor.execute().await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.store(true, Ordering::SeqCst);
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.verdict, Verdict::Cancelled);
        let result = std::fs::read_to_string(dir.path().join("session/result")).unwrap();
        assert_eq!(result, "cancelled");
    }

    #[tokio::test]
    async fn missing_materialized_artifact_fails_configure() {
        let dir = tempdir().unwrap();
        // No build/run/config.yaml written.
        let executor = base_executor(dir.path());
        let outcome = executor.execute().await;
        assert!(matches!(outcome.verdict, Verdict::Fail(_)));
    }
}
