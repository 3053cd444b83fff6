//! Session Orchestrator (C6): owns a bounded pool of workers, dispatches
//! cases in ascending index order subject to a selection filter, aggregates
//! verdicts, and guarantees cleanup of shared host resources (ports,
//! bridge names) on shutdown.
//!
//! The port allocator and bridge-name allocator are the only
//! shared-mutable state (spec.md §5) and are guarded by a plain
//! `std::sync::Mutex`, grounded on the teacher's in-process `PortManager`
//! (`sx9-port-manager/src/port_manager.rs`) rather than its HTTP-service
//! variant — this crate has no reason to go over the network for state
//! that lives in the same process.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::executor::{CaseExecutor, CaseOutcome, Verdict};
use crate::matrix::TargetCase;
use crate::selection::SelectionFilter;

/// One dispatched case: either already decided (never actually ran, e.g. the
/// port pool was exhausted before it could start) or a live task to await.
enum Dispatched {
    Done(CaseSummaryEntry),
    Handle(usize, String, JoinHandle<CaseOutcome>),
}

#[derive(Debug, Error)]
pub enum PortAllocatorError {
    #[error("no free port in the configured pool")]
    PoolExhausted,
}

/// Hands out TCP/UDP ports from a configured pool; two cases never
/// receive the same port concurrently (spec.md §5).
pub struct PortAllocator {
    pool: Vec<u16>,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(pool: Vec<u16>) -> Self {
        PortAllocator {
            pool,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<u16, PortAllocatorError> {
        let mut allocated = self.allocated.lock().expect("port allocator mutex poisoned");
        for port in &self.pool {
            if !allocated.contains(port) {
                allocated.insert(*port);
                return Ok(*port);
            }
        }
        Err(PortAllocatorError::PoolExhausted)
    }

    pub fn release(&self, port: u16) {
        self.allocated.lock().expect("port allocator mutex poisoned").remove(&port);
    }
}

/// Derives a unique bridge/tap name from the case index (spec.md §5:
/// "each case that needs networking is assigned a unique bridge/tap name
/// derived from its case index").
pub fn bridge_name_for(index: usize) -> String {
    format!("uktap{index}")
}

#[derive(Debug, Clone)]
pub struct CaseSummaryEntry {
    pub index: usize,
    pub id: String,
    pub verdict: Verdict,
}

pub struct SessionSummary {
    pub entries: Vec<CaseSummaryEntry>,
}

impl SessionSummary {
    pub fn all_passed(&self) -> bool {
        self.entries.iter().all(|e| e.verdict == Verdict::Pass)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!(
                "{} {} {}\n",
                entry.index,
                entry.id,
                entry.verdict.result_line()
            ));
        }
        out
    }
}

pub struct SessionOrchestrator {
    pub workers: usize,
    pub session_name: String,
    pub build_timeout: Duration,
    pub run_timeout: Duration,
    pub grace: Duration,
    pub env_allowlist: Vec<(String, String)>,
    port_allocator: Arc<PortAllocator>,
    shutdown: Arc<AtomicBool>,
}

impl SessionOrchestrator {
    pub fn new(
        workers: usize,
        session_name: String,
        build_timeout: Duration,
        run_timeout: Duration,
        grace: Duration,
        env_allowlist: Vec<(String, String)>,
        port_pool: Vec<u16>,
    ) -> Self {
        SessionOrchestrator {
            workers: workers.max(1),
            session_name,
            build_timeout,
            run_timeout,
            grace,
            env_allowlist,
            port_allocator: Arc::new(PortAllocator::new(port_pool)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests cancellation of in-flight cases and stops dispatching new
    /// ones. The workspace on disk is left intact for post-mortem.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Dispatches the cases selected by `filter`, at most `self.workers`
    /// at a time, in ascending index order. `ports_per_case` is how many
    /// host ports each networking-enabled case needs; one allocation from
    /// the shared pool is made per such case before it is dispatched, so
    /// two concurrently running cases never receive the same port (spec.md
    /// §5). Shutdown is not enforced by aborting in-flight tasks — that
    /// would SIGKILL the run script and skip its `trap cleanup` — instead
    /// it is threaded into the executor, which checks it at phase
    /// boundaries and, if it fires mid-phase, runs the same polite
    /// terminate-then-grace-then-kill sequence as a timeout. Returns once
    /// every dispatched case has reached a terminal state.
    pub async fn run(
        &self,
        cases: &[TargetCase],
        filter: &SelectionFilter,
        case_dir_of: impl Fn(usize) -> PathBuf,
        success_marker_of: impl Fn(&TargetCase) -> Option<String>,
        networking_of: impl Fn(&TargetCase) -> bool,
        ports_per_case: usize,
    ) -> SessionSummary {
        let total = cases.len();
        let selected: Vec<&TargetCase> = cases
            .iter()
            .filter(|c| filter.contains(c.index, total))
            .collect();

        info!(selected = selected.len(), total, "dispatching cases");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut dispatched = Vec::with_capacity(selected.len());

        for case in selected {
            if self.shutdown.load(Ordering::SeqCst) {
                warn!(index = case.index, "shutdown requested; not dispatching further cases");
                break;
            }

            let networking = networking_of(case);
            let allocated_ports = if networking && ports_per_case > 0 {
                match self.allocate_ports(ports_per_case) {
                    Ok(ports) => ports,
                    Err(_) => {
                        warn!(index = case.index, "port pool exhausted; case not dispatched");
                        dispatched.push(Dispatched::Done(CaseSummaryEntry {
                            index: case.index,
                            id: case.id.clone(),
                            verdict: Verdict::Fail("run".to_string()),
                        }));
                        continue;
                    }
                }
            } else {
                Vec::new()
            };

            let permit = Arc::clone(&semaphore);
            let case_dir = case_dir_of(case.index);
            let success_marker = success_marker_of(case);
            let bridge_name = bridge_name_for(case.index);
            let index = case.index;
            let id = case.id.clone();
            let session_name = self.session_name.clone();
            let build_timeout = self.build_timeout;
            let run_timeout = self.run_timeout;
            let grace = self.grace;
            let env_allowlist = self.env_allowlist.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let port_allocator = Arc::clone(&self.port_allocator);

            let handle = tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                if shutdown.load(Ordering::SeqCst) {
                    for port in &allocated_ports {
                        port_allocator.release(*port);
                    }
                    return CaseOutcome {
                        index,
                        verdict: Verdict::Cancelled,
                    };
                }

                let executor = CaseExecutor {
                    index,
                    case_dir,
                    session_name,
                    build_timeout,
                    run_timeout,
                    grace,
                    success_marker,
                    networking,
                    bridge_name,
                    env_allowlist,
                    allocated_ports,
                    port_allocator,
                    shutdown,
                };
                executor.execute().await
            });
            dispatched.push(Dispatched::Handle(index, id, handle));
        }

        let mut entries = Vec::with_capacity(dispatched.len());
        for item in dispatched {
            match item {
                Dispatched::Done(entry) => entries.push(entry),
                Dispatched::Handle(index, id, handle) => {
                    let verdict = match handle.await {
                        Ok(outcome) => outcome.verdict,
                        Err(_) => Verdict::Cancelled,
                    };
                    entries.push(CaseSummaryEntry { index, id, verdict });
                }
            }
        }

        SessionSummary { entries }
    }

    fn allocate_ports(&self, count: usize) -> Result<Vec<u16>, PortAllocatorError> {
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            match self.port_allocator.allocate() {
                Ok(port) => ports.push(port),
                Err(e) => {
                    for port in &ports {
                        self.port_allocator.release(*port);
                    }
                    return Err(e);
                }
            }
        }
        Ok(ports)
    }

    pub fn allocate_port(&self) -> Result<u16, PortAllocatorError> {
        self.port_allocator.allocate()
    }

    pub fn release_port(&self, port: u16) {
        self.port_allocator.release(port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_names_are_unique_per_index() {
        let names: HashSet<String> = (1..=20).map(bridge_name_for).collect();
        assert_eq!(names.len(), 20);
    }

    #[test]
    fn port_allocator_never_double_allocates() {
        let allocator = PortAllocator::new(vec![18100, 18101]);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_ne!(a, b);
        assert!(matches!(allocator.allocate(), Err(PortAllocatorError::PoolExhausted)));
        allocator.release(a);
        assert_eq!(allocator.allocate().unwrap(), a);
    }

    #[tokio::test]
    async fn aggregate_verdict_reflects_any_failure() {
        let dir = tempfile::tempdir().unwrap();
        let case_dirs: Vec<PathBuf> = (1..=2)
            .map(|i| {
                let d = dir.path().join(i.to_string());
                std::fs::create_dir_all(&d).unwrap();
                d
            })
            .collect();

        // Case 1 fails to build, case 2 succeeds.
        std::fs::write(case_dirs[0].join("build"), "#!/bin/sh\nexit 2\n").unwrap();
        std::fs::write(case_dirs[0].join("run"), "#!/bin/sh\necho x\n").unwrap();
        std::fs::write(case_dirs[0].join("config.yaml"), "{}").unwrap();
        std::fs::write(case_dirs[1].join("build"), "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::write(case_dirs[1].join("run"), "#!/bin/sh\necho ok\n").unwrap();
        std::fs::write(case_dirs[1].join("config.yaml"), "{}").unwrap();
        for d in &case_dirs {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                for f in ["build", "run"] {
                    let p = d.join(f);
                    let mut perm = std::fs::metadata(&p).unwrap().permissions();
                    perm.set_mode(0o755);
                    std::fs::set_permissions(&p, perm).unwrap();
                }
            }
        }

        let cases: Vec<TargetCase> = (1..=2)
            .map(|i| TargetCase {
                index: i,
                id: format!("case-{i}"),
                assignment: indexmap::IndexMap::new(),
            })
            .collect();

        let orchestrator = SessionOrchestrator::new(
            2,
            "session".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_millis(100),
            vec![],
            vec![18100, 18101],
        );

        let dirs = case_dirs.clone();
        let summary = orchestrator
            .run(
                &cases,
                &SelectionFilter::all(),
                move |index| dirs[index - 1].clone(),
                |_| None,
                |_| false,
                0,
            )
            .await;

        assert!(!summary.all_passed());
        assert_eq!(summary.entries.len(), 2);
        assert_eq!(
            summary.entries[0].verdict,
            Verdict::Fail("build".to_string())
        );
        assert_eq!(summary.entries[1].verdict, Verdict::Pass);
    }

    /// §5: two cases dispatched concurrently that both need a forwarded
    /// port must never be handed the same one.
    #[tokio::test]
    async fn concurrent_networking_cases_receive_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let case_dirs: Vec<PathBuf> = (1..=2)
            .map(|i| {
                let d = dir.path().join(i.to_string());
                std::fs::create_dir_all(&d).unwrap();
                d
            })
            .collect();

        for d in &case_dirs {
            std::fs::write(d.join("build"), "#!/bin/sh\nexit 0\n").unwrap();
            std::fs::write(d.join("run"), "#!/bin/sh\necho \"PORT=$UKHARNESS_PORT_0\"\n").unwrap();
            std::fs::write(d.join("config.yaml"), "{}").unwrap();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                for f in ["build", "run"] {
                    let p = d.join(f);
                    let mut perm = std::fs::metadata(&p).unwrap().permissions();
                    perm.set_mode(0o755);
                    std::fs::set_permissions(&p, perm).unwrap();
                }
            }
        }

        let cases: Vec<TargetCase> = (1..=2)
            .map(|i| TargetCase {
                index: i,
                id: format!("case-{i}"),
                assignment: indexmap::IndexMap::new(),
            })
            .collect();

        let orchestrator = SessionOrchestrator::new(
            2,
            "session".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_millis(100),
            vec![],
            vec![18200, 18201],
        );

        let dirs = case_dirs.clone();
        let summary = orchestrator
            .run(
                &cases,
                &SelectionFilter::all(),
                move |index| dirs[index - 1].clone(),
                |_| None,
                |_| true,
                1,
            )
            .await;

        assert!(summary.all_passed(), "{:?}", summary.entries);

        let mut ports = Vec::new();
        for d in &case_dirs {
            let log = std::fs::read_to_string(d.join("session/run.log")).unwrap();
            let port: u16 = log.trim().strip_prefix("PORT=").unwrap().parse().unwrap();
            ports.push(port);
        }
        assert_ne!(ports[0], ports[1]);
        for port in &ports {
            assert!([18200u16, 18201u16].contains(port));
        }
    }
}
