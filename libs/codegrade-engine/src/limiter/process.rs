//! Local process backend.
//!
//! Each launch is a child of the grading process:
//!
//! 1. Fork with an empty environment (plus the profile allowlist) and the
//!    private scope as working directory
//! 2. In the child, before exec: own process group and parent-death signal.
//!    Where the host allows it the child then enters a private jail (see
//!    `jail`): fresh user, mount, pid and network namespaces, a read-only
//!    filesystem view that exposes only the scope, and a namespace init
//!    that takes every leftover process down with it
//! 3. In the program process: rlimit backstops (CPU, address space, file
//!    size, core) and exec
//! 4. In the parent: feed stdin, capture stdout/stderr against a shared
//!    budget, and scan the process tree from /proc every poll interval on
//!    the blocking pool
//! 5. Reap with `wait4`; a jailed launch takes exit status and usage from
//!    the report its namespace init writes
//!
//! Any breach kills the whole tree with SIGKILL. There is no grace period.

use super::jail::{self, Jail, ScopeMount};
use super::{capture, decode, Launch, OutputBudget, ResourceLimiter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use codegrade_common::config::NetworkIsolation;
use codegrade_common::types::{ExecutionResult, Limits, ResourceUsage, TerminationReason};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long captured pipes may keep draining after the root was reaped
const DRAIN_GRACE: Duration = Duration::from_millis(250);
/// RLIMIT_AS is virtual; runtimes reserve far more than they touch
const ADDRESS_SPACE_HEADROOM: u64 = 4;
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub struct ProcessLimiter {
    jail: Option<Arc<Jail>>,
    poll_interval: Duration,
}

impl ProcessLimiter {
    /// Fails under `Strict` isolation when the host cannot build a jail
    pub fn new(network: NetworkIsolation) -> Result<Self> {
        let jail = match Jail::prepare() {
            Ok(jail) => {
                info!("Process sandbox runs launches in private namespaces");
                Some(Arc::new(jail))
            }
            Err(e) if network == NetworkIsolation::BestEffort => {
                warn!(
                    error = %format!("{:#}", e),
                    "Private namespaces unavailable: programs run without filesystem, pid or network isolation"
                );
                None
            }
            Err(e) => return Err(e.context("Strict isolation needs private namespaces")),
        };
        Ok(Self {
            jail,
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_jailed(&self) -> bool {
        self.jail.is_some()
    }
}

#[async_trait]
impl ResourceLimiter for ProcessLimiter {
    fn guest_workdir(&self, scope: &Path) -> PathBuf {
        // The jail binds the scope at its canonical path
        scope.canonicalize().unwrap_or_else(|_| scope.to_path_buf())
    }

    #[tracing::instrument(skip(self, launch, cancel), fields(program = %launch.argv.first().map(String::as_str).unwrap_or("")))]
    async fn run_bounded(
        &self,
        launch: Launch<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let limits = *launch.limits;
        let program = launch.argv.first().context("Empty command vector")?;
        let workdir = launch
            .workdir
            .canonicalize()
            .with_context(|| format!("Scope {} is unusable", launch.workdir.display()))?;

        let mut command = Command::new(program);
        command
            .args(&launch.argv[1..])
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", &workdir)
            .envs(launch.env)
            .current_dir(&workdir)
            .stdin(if launch.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let (setup, report) = match &self.jail {
            Some(jail) => {
                let scope = jail.scope(&workdir, limits.max_file_bytes)?;
                let (reader, writer) = jail::report_pipe().context("Failed to create report pipe")?;
                let jailed = Jailed {
                    jail: jail.clone(),
                    scope,
                    report: writer.as_raw_fd(),
                };
                (ChildSetup::new(&limits, Some(jailed)), Some((reader, writer)))
            }
            None => (ChildSetup::new(&limits, None), None),
        };
        // SAFETY: ChildSetup::apply only issues async-signal-safe syscalls
        unsafe {
            command.pre_exec(move || setup.apply());
        }

        let started = Instant::now();
        let spawned = command.spawn();
        // Only the namespace init may hold the write end from here on
        let report = report.map(|(reader, _writer)| reader);
        let mut child = spawned.with_context(|| format!("Failed to launch '{}'", program))?;
        let mut tree = ProcessTree::new(child.id() as libc::pid_t, report.is_some());

        let stdout = tokio::process::ChildStdout::from_std(
            child.stdout.take().context("stdout was not captured")?,
        )?;
        let stderr = tokio::process::ChildStderr::from_std(
            child.stderr.take().context("stderr was not captured")?,
        )?;
        let stdin_task = match (child.stdin.take(), launch.stdin) {
            (Some(pipe), Some(payload)) => {
                let mut pipe = tokio::process::ChildStdin::from_std(pipe)?;
                let payload = payload.to_vec();
                Some(tokio::spawn(async move {
                    // A program that never reads its input gets EPIPE here
                    let _ = pipe.write_all(&payload).await;
                    let _ = pipe.shutdown().await;
                }))
            }
            _ => None,
        };

        let budget = OutputBudget::new(limits.max_output_bytes);
        let stdout_task = tokio::spawn(capture(stdout, budget.clone()));
        let stderr_task = tokio::spawn(capture(stderr, budget.clone()));

        let root = tree.root;
        let mut reaper = tokio::task::spawn_blocking(move || reap(root, report));

        let wall = tokio::time::sleep(limits.wall_time());
        tokio::pin!(wall);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut breach: Option<TerminationReason> = None;
        let mut peak = Sample::default();
        let mut scan: Option<JoinHandle<Snapshot>> = None;

        let reaped = loop {
            tokio::select! {
                res = &mut reaper => {
                    break res.context("Reaper task failed")?.context("wait4 failed")?;
                }
                _ = &mut wall, if breach.is_none() => {
                    breach = Some(TerminationReason::TimedOut);
                    tree.kill();
                }
                _ = cancel.cancelled(), if breach.is_none() => {
                    breach = Some(TerminationReason::KilledByScheduler);
                    tree.kill();
                }
                _ = budget.exceeded(), if breach.is_none() => {
                    breach = Some(TerminationReason::OutputExceeded);
                    tree.kill();
                }
                _ = ticker.tick(), if breach.is_none() && scan.is_none() => {
                    let job = tree.scan();
                    scan = Some(tokio::task::spawn_blocking(move || job.run()));
                }
                snapshot = next_snapshot(&mut scan) => {
                    scan = None;
                    if let Ok(snapshot) = snapshot {
                        tree.remember(&snapshot.seen);
                        peak.absorb(&snapshot.sample);
                        if breach.is_none() {
                            if let Some(reason) = snapshot.sample.breach(&limits) {
                                breach = Some(reason);
                                tree.kill();
                            }
                        }
                    }
                }
            }
        };
        tree.mark_reaped();
        // Background children may still hold the pipes open
        tree.kill();

        let wall_time = started.elapsed();
        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;
        if let Some(task) = stdin_task {
            task.abort();
        }

        let cpu_time = reaped.cpu_time.max(peak.cpu_time);
        let peak_memory = reaped.max_rss_bytes.max(peak.rss_bytes);
        let termination = breach.unwrap_or_else(|| {
            classify(&reaped, cpu_time, peak_memory, &limits, budget.is_exceeded())
        });

        match termination {
            TerminationReason::Normal | TerminationReason::KilledByScheduler => {}
            other => warn!(
                termination = %other,
                cpu_ms = cpu_time.as_millis() as u64,
                peak_memory_bytes = peak_memory,
                wall_ms = wall_time.as_millis() as u64,
                "Process stopped by limit"
            ),
        }
        debug!(
            exit_code = ?reaped.exit_code,
            signal = ?reaped.signal,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Process reaped"
        );

        Ok(ExecutionResult {
            exit_code: reaped.exit_code,
            signal: reaped.signal,
            stdout: decode(&stdout),
            stderr: decode(&stderr),
            stdout_lossy: std::str::from_utf8(&stdout).is_err(),
            usage: ResourceUsage {
                cpu_time_ms: Some(cpu_time.as_millis() as u64),
                peak_memory_bytes: Some(peak_memory),
                wall_time_ms: wall_time.as_millis() as u64,
            },
            termination,
            output_truncated: budget.is_exceeded(),
        })
    }
}

/// Post-mortem classification when the monitor never had to intervene
fn classify(
    reaped: &Reaped,
    cpu_time: Duration,
    peak_memory: u64,
    limits: &Limits,
    output_exceeded: bool,
) -> TerminationReason {
    let abnormal = reaped.signal.is_some() || reaped.exit_code != Some(0);

    if output_exceeded || reaped.signal == Some(libc::SIGXFSZ) {
        TerminationReason::OutputExceeded
    } else if reaped.signal == Some(libc::SIGXCPU) || cpu_time >= limits.cpu_time() {
        TerminationReason::TimedOut
    } else if abnormal && peak_memory >= limits.memory_bytes {
        TerminationReason::MemoryExceeded
    } else if reaped.signal.is_some() {
        TerminationReason::Crashed
    } else {
        TerminationReason::Normal
    }
}

async fn drain(task: JoinHandle<Vec<u8>>) -> Vec<u8> {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}

async fn next_snapshot(scan: &mut Option<JoinHandle<Snapshot>>) -> Result<Snapshot, JoinError> {
    match scan {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

struct Jailed {
    jail: Arc<Jail>,
    scope: ScopeMount,
    report: RawFd,
}

/// Everything applied in the forked child before exec
struct ChildSetup {
    cpu_secs: u64,
    address_space: u64,
    file_size: u64,
    jailed: Option<Jailed>,
}

impl ChildSetup {
    fn new(limits: &Limits, jailed: Option<Jailed>) -> Self {
        Self {
            // RLIMIT_CPU has one-second granularity; the monitor enforces the real value
            cpu_secs: limits.cpu_time_ms.div_ceil(1000) + 1,
            address_space: limits.memory_bytes.saturating_mul(ADDRESS_SPACE_HEADROOM),
            file_size: limits.max_file_bytes.max(1),
            jailed,
        }
    }

    /// Runs between fork and exec: async-signal-safe calls only
    fn apply(&self) -> io::Result<()> {
        unsafe {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        }
        if let Some(jailed) = &self.jailed {
            jailed.jail.launch(&jailed.scope, jailed.report)?;
        }
        self.limit()
    }

    fn limit(&self) -> io::Result<()> {
        set_rlimit(libc::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        set_rlimit(libc::RLIMIT_AS, self.address_space, self.address_space)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        set_rlimit(libc::RLIMIT_CORE, 0, 0)
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug)]
struct Reaped {
    exit_code: Option<i32>,
    signal: Option<i32>,
    cpu_time: Duration,
    max_rss_bytes: u64,
}

impl Reaped {
    fn from_status(status: libc::c_int, cpu_time: Duration, max_rss_bytes: u64) -> Self {
        Self {
            exit_code: libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status)),
            signal: libc::WIFSIGNALED(status).then(|| libc::WTERMSIG(status)),
            cpu_time,
            max_rss_bytes,
        }
    }
}

/// Block until `pid` exits. A jailed launch reports the program's own
/// status and usage; the supervisor's are a copy of the grading process.
fn reap(pid: libc::pid_t, report: Option<File>) -> io::Result<Reaped> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
        if rc == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let Some(mut pipe) = report else {
        return Ok(Reaped::from_status(
            status,
            timeval(rusage.ru_utime) + timeval(rusage.ru_stime),
            (rusage.ru_maxrss.max(0) as u64) * 1024,
        ));
    };
    Ok(match jail::read_report(&mut pipe) {
        Some(report) => Reaped::from_status(report.status, report.cpu_time, report.max_rss_bytes),
        // Killed before the program finished; the monitor's samples stand in
        None => Reaped::from_status(status, Duration::ZERO, 0),
    })
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Resource totals across the live process tree
#[derive(Debug, Default, Clone, Copy)]
struct Sample {
    cpu_time: Duration,
    rss_bytes: u64,
    tasks: u64,
}

impl Sample {
    fn absorb(&mut self, other: &Sample) {
        self.cpu_time = self.cpu_time.max(other.cpu_time);
        self.rss_bytes = self.rss_bytes.max(other.rss_bytes);
        self.tasks = self.tasks.max(other.tasks);
    }

    fn breach(&self, limits: &Limits) -> Option<TerminationReason> {
        if self.cpu_time >= limits.cpu_time() {
            Some(TerminationReason::TimedOut)
        } else if self.rss_bytes > limits.memory_bytes {
            Some(TerminationReason::MemoryExceeded)
        } else if self.tasks > limits.max_processes as u64 {
            Some(TerminationReason::ProcessLimitExceeded)
        } else {
            None
        }
    }
}

/// Fields of /proc/<pid>/stat the monitor cares about
#[derive(Debug, Clone, Copy)]
struct ProcStat {
    pid: libc::pid_t,
    ppid: libc::pid_t,
    pgrp: libc::pid_t,
    /// utime + stime, in clock ticks
    cpu_ticks: u64,
    /// cutime + cstime: children already waited for
    reaped_ticks: u64,
    threads: u64,
    start_time: u64,
    rss_pages: u64,
}

fn parse_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    // Fields after the command name, starting at field 3 (state)
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    let field = |n: usize| -> Option<u64> { fields.get(n - 3)?.parse().ok() };

    Some(ProcStat {
        pid,
        ppid: fields.get(1)?.parse().ok()?,
        pgrp: fields.get(2)?.parse().ok()?,
        cpu_ticks: field(14)? + field(15)?,
        reaped_ticks: field(16)? + field(17)?,
        threads: field(20)?,
        start_time: field(22)?,
        rss_pages: field(24)?,
    })
}

fn read_stat(pid: libc::pid_t) -> Option<ProcStat> {
    let content = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&content)
}

fn all_stats() -> Vec<ProcStat> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<libc::pid_t>().ok())
        .filter_map(read_stat)
        .collect()
}

/// One /proc pass over a launch's tree, run on the blocking pool
#[derive(Debug, Clone, Copy)]
struct TreeScan {
    root: libc::pid_t,
    /// Root and its direct child are the jail's supervisor and init
    supervised: bool,
    clock_ticks: u64,
    page_size: u64,
}

struct Snapshot {
    sample: Sample,
    /// pid -> start time of every member seen
    seen: Vec<(libc::pid_t, u64)>,
}

impl TreeScan {
    fn run(self) -> Snapshot {
        self.measure(&all_stats())
    }

    fn measure(&self, stats: &[ProcStat]) -> Snapshot {
        let mut children: HashMap<libc::pid_t, Vec<&ProcStat>> = HashMap::new();
        for stat in stats {
            children.entry(stat.ppid).or_default().push(stat);
        }

        let mut members: HashSet<libc::pid_t> = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(pid) = stack.pop() {
            if !members.insert(pid) {
                continue;
            }
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids.iter().map(|s| s.pid));
            }
        }

        let mut sample = Sample::default();
        let mut seen = Vec::new();
        let mut ticks = 0u64;
        for stat in stats
            .iter()
            .filter(|s| members.contains(&s.pid) || s.pgrp == self.root)
        {
            seen.push((stat.pid, stat.start_time));
            ticks += stat.reaped_ticks;
            // Supervisors are forked copies of this process; only what they reaped counts
            if self.supervised && (stat.pid == self.root || stat.ppid == self.root) {
                continue;
            }
            ticks += stat.cpu_ticks;
            sample.rss_bytes += stat.rss_pages * self.page_size;
            sample.tasks += stat.threads;
        }
        sample.cpu_time = Duration::from_millis(ticks * 1000 / self.clock_ticks);
        Snapshot { sample, seen }
    }
}

/// Every process descended from one launch, tracked so it can be killed
struct ProcessTree {
    root: libc::pid_t,
    supervised: bool,
    /// pid -> start time, guards against pid reuse when killing
    known: HashMap<libc::pid_t, u64>,
    reaped: bool,
    clock_ticks: u64,
    page_size: u64,
}

impl ProcessTree {
    fn new(root: libc::pid_t, supervised: bool) -> Self {
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(1) as u64;
        Self {
            root,
            supervised,
            known: HashMap::new(),
            reaped: false,
            clock_ticks,
            page_size,
        }
    }

    fn scan(&self) -> TreeScan {
        TreeScan {
            root: self.root,
            supervised: self.supervised,
            clock_ticks: self.clock_ticks,
            page_size: self.page_size,
        }
    }

    fn remember(&mut self, seen: &[(libc::pid_t, u64)]) {
        self.known.extend(seen.iter().copied());
    }

    fn mark_reaped(&mut self) {
        self.reaped = true;
    }

    /// SIGKILL the group, the root and any descendant that left the group.
    /// Killing a jail's supervisor takes its namespace init, and with it
    /// the whole pid namespace, along.
    fn kill(&self) {
        unsafe {
            libc::killpg(self.root, libc::SIGKILL);
            if !self.reaped {
                libc::kill(self.root, libc::SIGKILL);
            }
        }
        for (&pid, &start_time) in &self.known {
            if pid == self.root {
                continue;
            }
            let still_ours = read_stat(pid).map(|s| s.start_time) == Some(start_time);
            if still_ours {
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        self.kill();
        if !self.reaped {
            // Launch abandoned mid-flight: reap off-thread so no zombie is left
            let pid = self.root;
            std::thread::spawn(move || {
                let _ = reap(pid, None);
            });
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn limits() -> Limits {
        Limits {
            cpu_time_ms: 2000,
            wall_time_ms: 5000,
            memory_bytes: 256 * 1024 * 1024,
            max_output_bytes: 64 * 1024,
            max_file_bytes: 1024 * 1024,
            max_processes: 16,
        }
    }

    fn limiter() -> ProcessLimiter {
        ProcessLimiter::new(NetworkIsolation::BestEffort).unwrap()
    }

    /// A limiter that must run launches in private namespaces
    fn isolated_limiter() -> Option<ProcessLimiter> {
        match ProcessLimiter::new(NetworkIsolation::Strict) {
            Ok(limiter) => Some(limiter),
            Err(e) => {
                eprintln!("skipping: {:#}", e);
                None
            }
        }
    }

    async fn run_in(
        limiter: &ProcessLimiter,
        scope: &Path,
        script: &str,
        stdin: Option<&str>,
        limits: Limits,
    ) -> ExecutionResult {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()];
        let env = BTreeMap::new();
        let launch = Launch {
            argv: &argv,
            workdir: scope,
            env: &env,
            limits: &limits,
            stdin: stdin.map(str::as_bytes),
            image: None,
        };
        limiter
            .run_bounded(launch, &CancellationToken::new())
            .await
            .unwrap()
    }

    async fn sh(script: &str, stdin: Option<&str>, limits: Limits) -> ExecutionResult {
        let scope = tempfile::tempdir().unwrap();
        run_in(&limiter(), scope.path(), script, stdin, limits).await
    }

    #[test]
    fn test_parse_stat_handles_spaces_in_command() {
        let line = "4242 (my prog) S 1 4242 4242 0 -1 4194560 100 0 0 0 7 3 1 2 20 0 3 0 555 1000 250 18446744073709551615";
        let stat = parse_stat(line).unwrap();

        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.cpu_ticks, 10);
        assert_eq!(stat.reaped_ticks, 3);
        assert_eq!(stat.threads, 3);
        assert_eq!(stat.start_time, 555);
        assert_eq!(stat.rss_pages, 250);
    }

    #[test]
    fn test_classify_precedence() {
        let limits = limits();
        let crashed = Reaped {
            exit_code: None,
            signal: Some(libc::SIGSEGV),
            cpu_time: Duration::from_millis(10),
            max_rss_bytes: 1024,
        };
        assert_eq!(
            classify(&crashed, crashed.cpu_time, 1024, &limits, false),
            TerminationReason::Crashed
        );
        assert_eq!(
            classify(&crashed, crashed.cpu_time, limits.memory_bytes, &limits, false),
            TerminationReason::MemoryExceeded
        );
        assert_eq!(
            classify(&crashed, Duration::from_secs(3), 1024, &limits, false),
            TerminationReason::TimedOut
        );
        assert_eq!(
            classify(&crashed, crashed.cpu_time, 1024, &limits, true),
            TerminationReason::OutputExceeded
        );

        let clean = Reaped {
            exit_code: Some(3),
            signal: None,
            cpu_time: Duration::from_millis(10),
            max_rss_bytes: 1024,
        };
        assert_eq!(
            classify(&clean, clean.cpu_time, 1024, &limits, false),
            TerminationReason::Normal
        );
    }

    #[tokio::test]
    async fn test_echoes_stdin() {
        let result = sh("cat", Some("hello sandbox\n"), limits()).await;

        assert_eq!(result.termination, TerminationReason::Normal);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello sandbox\n");
        assert!(result.usage.cpu_time_ms.is_some());
        assert!(result.usage.peak_memory_bytes.is_some());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_observed_not_an_error() {
        let result = sh("echo oops >&2; exit 7", None, limits()).await;

        assert_eq!(result.termination, TerminationReason::Normal);
        assert_eq!(result.exit_code, Some(7));
        assert_eq!(result.stderr, "oops\n");
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        std::env::set_var("CODEGRADE_TEST_SECRET", "leaked");
        let result = sh("echo \"[$CODEGRADE_TEST_SECRET]\"", None, limits()).await;

        assert_eq!(result.stdout, "[]\n");
    }

    #[tokio::test]
    async fn test_wall_clock_timeout() {
        let mut limits = limits();
        limits.wall_time_ms = 200;
        let started = Instant::now();

        let result = sh("sleep 30", None, limits).await;

        assert_eq!(result.termination, TerminationReason::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cpu_time_limit() {
        let mut limits = limits();
        limits.cpu_time_ms = 300;
        limits.wall_time_ms = 10_000;

        let result = sh("while :; do :; done", None, limits).await;

        assert_eq!(result.termination, TerminationReason::TimedOut);
        assert!(result.usage.wall_time_ms < 10_000);
    }

    #[tokio::test]
    async fn test_output_cap_stops_capture() {
        let mut limits = limits();
        limits.max_output_bytes = 1024;

        let result = sh("while :; do echo yyyyyyyyyyyyyyyy; done", None, limits).await;

        assert_eq!(result.termination, TerminationReason::OutputExceeded);
        assert!(result.output_truncated);
        assert!(result.stdout.len() + result.stderr.len() <= 1024);
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let mut limits = limits();
        limits.memory_bytes = 16 * 1024 * 1024;

        let result = sh("x=0123456789abcdef; while :; do x=$x$x; done", None, limits).await;

        assert_eq!(result.termination, TerminationReason::MemoryExceeded);
    }

    #[tokio::test]
    async fn test_process_limit() {
        let mut limits = limits();
        limits.max_processes = 3;

        let result = sh("for i in 1 2 3 4 5 6 7 8; do sleep 5 & done; wait", None, limits).await;

        assert_eq!(result.termination, TerminationReason::ProcessLimitExceeded);
    }

    #[tokio::test]
    async fn test_background_children_are_killed() {
        let scope = tempfile::tempdir().unwrap();
        let limiter = limiter();

        let result = run_in(
            &limiter,
            scope.path(),
            "(sleep 1; touch survivor) & exit 0",
            None,
            limits(),
        )
        .await;
        assert_eq!(result.exit_code, Some(0));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!scope.path().join("survivor").exists());
    }

    #[tokio::test]
    async fn test_new_session_does_not_outlive_the_launch() {
        let Some(limiter) = isolated_limiter() else {
            return;
        };
        let scope = tempfile::tempdir().unwrap();
        let script = "setsid sh -c 'sleep 1; touch escaped' </dev/null >/dev/null 2>&1 & exit 0";

        let result = run_in(&limiter, scope.path(), script, None, limits()).await;
        assert_eq!(result.exit_code, Some(0));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!scope.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn test_program_sees_only_its_own_scope() {
        let Some(limiter) = isolated_limiter() else {
            return;
        };
        let neighbor = tempfile::tempdir().unwrap();
        let secret = neighbor.path().join("expected_output.txt");
        std::fs::write(&secret, "42\n").unwrap();
        let scope = tempfile::tempdir().unwrap();
        let script = format!(
            "cat {0} || echo unreadable; echo tampered > {0} || echo refused",
            secret.display()
        );

        let result = run_in(&limiter, scope.path(), &script, None, limits()).await;

        assert!(!result.stdout.contains("42"), "stdout: {}", result.stdout);
        assert!(result.stdout.contains("unreadable"));
        assert!(result.stdout.contains("refused"));
        assert_eq!(std::fs::read_to_string(&secret).unwrap(), "42\n");
    }

    #[tokio::test]
    async fn test_host_directories_are_read_only() {
        let Some(limiter) = isolated_limiter() else {
            return;
        };
        let scope = tempfile::tempdir().unwrap();
        let script = "touch /usr/codegrade-write 2>/dev/null || echo refused; \
                      touch /etc/codegrade-write 2>/dev/null || echo refused; \
                      touch inside && echo written";

        let result = run_in(&limiter, scope.path(), script, None, limits()).await;

        assert_eq!(result.stdout, "refused\nrefused\nwritten\n");
        assert!(scope.path().join("inside").exists());
        assert!(!Path::new("/usr/codegrade-write").exists());
    }

    #[tokio::test]
    async fn test_scope_keeps_its_host_path() {
        let Some(limiter) = isolated_limiter() else {
            return;
        };
        let scope = tempfile::tempdir().unwrap();
        let canonical = scope.path().canonicalize().unwrap();

        let result = run_in(&limiter, scope.path(), "pwd", None, limits()).await;

        assert_eq!(result.stdout.trim_end(), canonical.to_str().unwrap());
        assert_eq!(limiter.guest_workdir(scope.path()), canonical);
    }

    #[test]
    fn test_supervisors_only_contribute_reaped_time() {
        let stat = |pid, ppid, cpu_ticks, reaped_ticks, rss_pages| ProcStat {
            pid,
            ppid,
            pgrp: 100,
            cpu_ticks,
            reaped_ticks,
            threads: 1,
            start_time: pid as u64,
            rss_pages,
        };
        let mut stats = vec![
            stat(100, 1, 500, 0, 10_000),
            stat(101, 100, 500, 7, 10_000),
            stat(102, 101, 20, 0, 30),
            stat(200, 1, 900, 0, 99_999),
        ];
        stats[3].pgrp = 200;
        let scan = TreeScan {
            root: 100,
            supervised: true,
            clock_ticks: 100,
            page_size: 4096,
        };

        let snapshot = scan.measure(&stats);

        assert_eq!(snapshot.sample.cpu_time, Duration::from_millis(270));
        assert_eq!(snapshot.sample.rss_bytes, 30 * 4096);
        assert_eq!(snapshot.sample.tasks, 1);
        assert_eq!(snapshot.seen.len(), 3);

        let unsupervised = TreeScan {
            supervised: false,
            ..scan
        };
        assert_eq!(unsupervised.measure(&stats).sample.tasks, 3);
    }

    #[tokio::test]
    async fn test_cancellation_kills_immediately() {
        let scope = tempfile::tempdir().unwrap();
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        let env = BTreeMap::new();
        let limits = limits();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let launch = Launch {
            argv: &argv,
            workdir: scope.path(),
            env: &env,
            limits: &limits,
            stdin: None,
            image: None,
        };
        let result = limiter().run_bounded(launch, &cancel).await.unwrap();

        assert_eq!(result.termination, TerminationReason::KilledByScheduler);
        assert!(result.usage.wall_time_ms < 5000);
    }

    #[tokio::test]
    async fn test_missing_program_is_an_infrastructure_error() {
        let scope = tempfile::tempdir().unwrap();
        let argv = vec!["/definitely/not/a/compiler".to_string()];
        let env = BTreeMap::new();
        let limits = limits();
        let launch = Launch {
            argv: &argv,
            workdir: scope.path(),
            env: &env,
            limits: &limits,
            stdin: None,
            image: None,
        };

        assert!(limiter()
            .run_bounded(launch, &CancellationToken::new())
            .await
            .is_err());
    }
}
