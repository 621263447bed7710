//! Private namespaces for the process backend.
//!
//! A jailed launch is three processes:
//!
//! 1. Supervisor: the child the grading process forks. It unshares the
//!    user, mount, pid, network, ipc and uts namespaces, forks again and
//!    mirrors that child's exit.
//! 2. Namespace init (pid 1): builds the filesystem view, pivots into it,
//!    forks the program and reaps everything reparented to it. When it
//!    exits the kernel kills whatever is left in the namespace, so nothing
//!    a program starts can outlive it, `setsid` or not.
//! 3. Program: returns into `Command`'s pre-exec path and execs.
//!
//! The filesystem view is a read-only tmpfs holding read-only binds of the
//! host toolchain directories, a handful of device nodes, a private `/tmp`
//! and the launch scope, the only host directory the program can write.
//! Other scopes, home directories and the grading service's own files are
//! simply not there.
//!
//! Everything the forked processes touch is allocated by the parent
//! beforehand; code that runs after fork sticks to raw syscalls.

use anyhow::{bail, Context, Result};
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::ptr;
use std::time::Duration;
use tempfile::TempDir;

/// Host directories programs may read and execute from
const HOST_DIRS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/libx32", "/etc", "/opt",
];
const DEVICES: &[&str] = &["null", "zero", "random", "urandom"];
const DEV_LINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];
/// Inside id used when the grading service itself runs as root
const OVERFLOW_ID: u32 = 65534;
const NAMESPACES: libc::c_int = libc::CLONE_NEWUSER
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWUTS;
/// wait status, CPU microseconds, peak RSS in KiB
const REPORT_LEN: usize = 20;

struct Bind {
    source: CString,
    target: CString,
    /// Flags the kernel refuses to drop on a remount inside a user namespace
    locked: libc::c_ulong,
}

struct Link {
    target: CString,
    value: CString,
}

/// Filesystem layout and id maps shared by every jailed launch
pub(super) struct Jail {
    root_dir: TempDir,
    root: CString,
    dirs: Vec<CString>,
    binds: Vec<Bind>,
    links: Vec<Link>,
    devices: Vec<Bind>,
    tmp: CString,
    proc_dir: CString,
    uid_map: CString,
    gid_map: CString,
}

/// Per-launch part of the layout
pub(super) struct ScopeMount {
    /// Host path, and the same path once inside
    source: CString,
    target: CString,
    dirs: Vec<CString>,
    tmp_options: CString,
}

/// How the program ended, as seen by the namespace init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ExitReport {
    pub status: libc::c_int,
    pub cpu_time: Duration,
    pub max_rss_bytes: u64,
}

impl Jail {
    /// Lay out the jail and confirm the host lets us build it
    pub(super) fn prepare() -> Result<Self> {
        let root_dir = tempfile::Builder::new()
            .prefix("codegrade-root-")
            .tempdir()
            .context("Failed to create jail root")?;
        let root = root_dir.path().to_path_buf();

        let mut dirs = vec![inside(&root, "/dev"), inside(&root, "/proc"), inside(&root, "/tmp")];
        let mut binds = Vec::new();
        let mut links = Vec::new();

        for dir in HOST_DIRS {
            let host = Path::new(dir);
            let Ok(meta) = std::fs::symlink_metadata(host) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                let value = std::fs::read_link(host)
                    .with_context(|| format!("Failed to read link {}", host.display()))?;
                links.push(Link {
                    target: cstring(&inside(&root, dir))?,
                    value: cstring(&value)?,
                });
            } else if meta.is_dir() {
                dirs.push(inside(&root, dir));
                binds.push(Bind {
                    source: cstring(host)?,
                    target: cstring(&inside(&root, dir))?,
                    locked: locked_flags(host)?,
                });
            }
        }

        let mut devices = Vec::new();
        for name in DEVICES {
            let host = Path::new("/dev").join(name);
            if host.exists() {
                devices.push(Bind {
                    source: cstring(&host)?,
                    target: cstring(&root.join("dev").join(name))?,
                    locked: 0,
                });
            }
        }
        for (name, value) in DEV_LINKS {
            links.push(Link {
                target: cstring(&root.join("dev").join(name))?,
                value: cstring(Path::new(value))?,
            });
        }

        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        let jail = Self {
            root: cstring(&root)?,
            tmp: cstring(&inside(&root, "/tmp"))?,
            proc_dir: cstring(&inside(&root, "/proc"))?,
            dirs: dirs.iter().map(|d| cstring(d)).collect::<Result<_>>()?,
            binds,
            links,
            devices,
            uid_map: CString::new(id_map(uid))?,
            gid_map: CString::new(id_map(gid))?,
            root_dir,
        };
        jail.check()?;
        Ok(jail)
    }

    /// Precompute the mounts for one scope
    pub(super) fn scope(&self, scope: &Path, tmp_bytes: u64) -> Result<ScopeMount> {
        let dirs = scope_dirs(self.root_dir.path(), scope)?;
        let target = dirs
            .last()
            .cloned()
            .context("Scope cannot be the filesystem root")?;
        Ok(ScopeMount {
            source: cstring(scope)?,
            target: cstring(&target)?,
            dirs: dirs.iter().map(|d| cstring(d)).collect::<Result<_>>()?,
            tmp_options: CString::new(format!("mode=1777,size={}", tmp_bytes.max(4096)))?,
        })
    }

    /// Fork a throwaway child that tries the privileged steps
    fn check(&self) -> Result<()> {
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error()).context("fork failed");
        }
        if pid == 0 {
            let stage = if self.enter_namespaces().is_err() {
                1
            } else if self.mount_root().is_err() {
                2
            } else {
                0
            };
            unsafe { libc::_exit(stage) }
        }

        let status = wait_status(pid).context("Failed to wait for namespace check")?;
        match libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status)) {
            Some(0) => Ok(()),
            Some(1) => bail!("unprivileged user namespaces are not available"),
            Some(2) => bail!("mounts inside a private namespace are not permitted"),
            _ => bail!("namespace check did not finish (status {})", status),
        }
    }

    /// Runs in the forked child of the grading process.
    /// Returns only in the program process; the other two never return.
    pub(super) fn launch(&self, scope: &ScopeMount, report: RawFd) -> io::Result<()> {
        self.enter_namespaces()?;

        let init = fork()?;
        if init > 0 {
            supervise(init);
        }

        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        }
        self.enter(scope)?;

        let program = fork()?;
        if program > 0 {
            reap_namespace(program, report);
        }

        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn enter_namespaces(&self) -> io::Result<()> {
        check(unsafe { libc::unshare(NAMESPACES) })?;
        write_file(c"/proc/self/setgroups", b"deny")?;
        write_file(c"/proc/self/uid_map", self.uid_map.as_bytes())?;
        write_file(c"/proc/self/gid_map", self.gid_map.as_bytes())
    }

    fn mount_root(&self) -> io::Result<()> {
        mount(None, c"/", None, libc::MS_REC | libc::MS_PRIVATE, None)?;
        mount(
            Some(c"tmpfs"),
            &self.root,
            Some(c"tmpfs"),
            libc::MS_NOSUID | libc::MS_NODEV,
            Some(c"mode=0755"),
        )
    }

    /// Build the view and pivot into it; runs as the namespace init
    fn enter(&self, scope: &ScopeMount) -> io::Result<()> {
        self.mount_root()?;
        for dir in &self.dirs {
            make_dir(dir)?;
        }
        for bind in &self.binds {
            mount(Some(&bind.source), &bind.target, None, libc::MS_BIND | libc::MS_REC, None)?;
            mount(
                None,
                &bind.target,
                None,
                libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | bind.locked,
                None,
            )?;
        }
        for link in &self.links {
            let rc = unsafe { libc::symlink(link.value.as_ptr(), link.target.as_ptr()) };
            if rc != 0 && errno() != libc::EEXIST {
                return Err(io::Error::last_os_error());
            }
        }
        for device in &self.devices {
            let fd = unsafe {
                libc::open(
                    device.target.as_ptr(),
                    libc::O_WRONLY | libc::O_CREAT | libc::O_CLOEXEC,
                    0o666,
                )
            };
            check(fd)?;
            unsafe { libc::close(fd) };
            mount(Some(&device.source), &device.target, None, libc::MS_BIND, None)?;
        }

        mount(
            Some(c"tmpfs"),
            &self.tmp,
            Some(c"tmpfs"),
            libc::MS_NOSUID | libc::MS_NODEV,
            Some(&scope.tmp_options),
        )?;
        for dir in &scope.dirs {
            make_dir(dir)?;
        }
        mount(Some(&scope.source), &scope.target, None, libc::MS_BIND | libc::MS_REC, None)?;

        // Hosts that mask parts of /proc refuse a fresh instance; programs cope
        let _ = mount(
            Some(c"proc"),
            &self.proc_dir,
            Some(c"proc"),
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
            None,
        );

        check(unsafe { libc::chdir(self.root.as_ptr()) })?;
        let dot = c".";
        check(unsafe { libc::syscall(libc::SYS_pivot_root, dot.as_ptr(), dot.as_ptr()) } as libc::c_int)?;
        check(unsafe { libc::umount2(dot.as_ptr(), libc::MNT_DETACH) })?;
        check(unsafe { libc::chdir(c"/".as_ptr()) })?;
        mount(
            None,
            c"/",
            None,
            libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV,
            None,
        )?;
        check(unsafe { libc::chdir(scope.source.as_ptr()) })
    }
}

/// Pipe the namespace init reports through. Both ends are close-on-exec.
pub(super) fn report_pipe() -> io::Result<(File, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    check(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    // SAFETY: pipe2 just handed us both descriptors
    Ok(unsafe { (File::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// `None` when the namespace init died before the program did
pub(super) fn read_report(pipe: &mut File) -> Option<ExitReport> {
    let mut buf = [0u8; REPORT_LEN];
    pipe.read_exact(&mut buf).ok()?;
    let status = libc::c_int::from_ne_bytes(buf[0..4].try_into().ok()?);
    let cpu_us = u64::from_ne_bytes(buf[4..12].try_into().ok()?);
    let rss_kb = u64::from_ne_bytes(buf[12..20].try_into().ok()?);
    Some(ExitReport {
        status,
        cpu_time: Duration::from_micros(cpu_us),
        max_rss_bytes: rss_kb * 1024,
    })
}

/// Mirror the namespace init's exit, then go
fn supervise(init: libc::pid_t) -> ! {
    close_fds(None);
    unsafe {
        match wait_status(init) {
            Ok(status) if libc::WIFSIGNALED(status) => {
                let signal = libc::WTERMSIG(status);
                libc::signal(signal, libc::SIG_DFL);
                libc::kill(libc::getpid(), signal);
                libc::_exit(128 + signal)
            }
            Ok(status) if libc::WIFEXITED(status) => libc::_exit(libc::WEXITSTATUS(status)),
            _ => libc::_exit(1),
        }
    }
}

/// Namespace init main loop: reap until the program is gone, report, exit
fn reap_namespace(program: libc::pid_t, report: RawFd) -> ! {
    close_fds(Some(report));

    let mut status = None;
    let mut cpu_us = 0u64;
    let mut rss_kb = 0u64;
    loop {
        let mut raw: libc::c_int = 0;
        // SAFETY: rusage is plain old data
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let pid = unsafe { libc::wait4(-1, &mut raw, 0, &mut usage) };
        if pid < 0 {
            if errno() == libc::EINTR {
                continue;
            }
            break;
        }
        cpu_us += micros(usage.ru_utime) + micros(usage.ru_stime);
        rss_kb = rss_kb.max(usage.ru_maxrss.max(0) as u64);
        if pid == program {
            status = Some(raw);
            break;
        }
    }

    if let Some(status) = status {
        let mut buf = [0u8; REPORT_LEN];
        buf[0..4].copy_from_slice(&status.to_ne_bytes());
        buf[4..12].copy_from_slice(&cpu_us.to_ne_bytes());
        buf[12..20].copy_from_slice(&rss_kb.to_ne_bytes());
        unsafe {
            libc::write(report, buf.as_ptr().cast(), buf.len());
        }
    }
    unsafe { libc::_exit(0) }
}

/// Paths to create on the jail tmpfs so `scope` can be bound at its own path
fn scope_dirs(root: &Path, scope: &Path) -> Result<Vec<PathBuf>> {
    if !scope.is_absolute() {
        bail!("Scope path must be absolute: {}", scope.display());
    }
    let mut current = root.to_path_buf();
    let mut dirs = Vec::new();
    for component in scope.components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => {
                current.push(part);
                dirs.push(current.clone());
            }
            _ => bail!("Scope path must be canonical: {}", scope.display()),
        }
    }
    Ok(dirs)
}

/// statvfs flags to the mount flags a bind remount has to repeat
fn mount_flags(st_flags: libc::c_ulong) -> libc::c_ulong {
    const PAIRS: &[(libc::c_ulong, libc::c_ulong)] = &[
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ];
    let mut flags = PAIRS
        .iter()
        .filter(|(st, _)| st_flags & st != 0)
        .fold(0, |acc, (_, ms)| acc | ms);
    if st_flags & (libc::ST_NOATIME | libc::ST_RELATIME) == 0 {
        flags |= libc::MS_STRICTATIME;
    }
    flags
}

fn locked_flags(path: &Path) -> Result<libc::c_ulong> {
    let c_path = cstring(path)?;
    // SAFETY: statvfs is plain old data
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("statvfs {} failed", path.display()));
    }
    Ok(mount_flags(stat.f_flag))
}

fn inside(root: &Path, host: &str) -> PathBuf {
    root.join(host.trim_start_matches('/'))
}

fn id_map(outside: u32) -> String {
    let inside = if outside == 0 { OVERFLOW_ID } else { outside };
    format!("{} {} 1\n", inside, outside)
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("Path contains a NUL byte: {}", path.display()))
}

fn wait_status(pid: libc::pid_t) -> io::Result<libc::c_int> {
    let mut status: libc::c_int = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status, 0) } == pid {
            return Ok(status);
        }
        if errno() != libc::EINTR {
            return Err(io::Error::last_os_error());
        }
    }
}

fn fork() -> io::Result<libc::pid_t> {
    let pid = unsafe { libc::fork() };
    check(pid)?;
    Ok(pid)
}

/// Close every descriptor except `keep`
fn close_fds(keep: Option<RawFd>) {
    match keep {
        Some(fd) => {
            if fd > 0 {
                close_range(0, fd as u32 - 1);
            }
            close_range(fd as u32 + 1, u32::MAX);
        }
        None => close_range(0, u32::MAX),
    }
}

fn close_range(first: u32, last: u32) {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            last as libc::c_uint,
            0 as libc::c_uint,
        )
    };
    if rc == 0 {
        return;
    }
    // Kernels before 5.9
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    let end = (limit.rlim_cur as u64).min(last as u64 + 1).min(1 << 16);
    for fd in first as u64..end {
        unsafe { libc::close(fd as libc::c_int) };
    }
}

fn mount(
    source: Option<&CStr>,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
    data: Option<&CStr>,
) -> io::Result<()> {
    let rc = unsafe {
        libc::mount(
            source.map_or(ptr::null(), CStr::as_ptr),
            target.as_ptr(),
            fstype.map_or(ptr::null(), CStr::as_ptr),
            flags,
            data.map_or(ptr::null(), |d| d.as_ptr().cast()),
        )
    };
    check(rc)
}

fn make_dir(path: &CStr) -> io::Result<()> {
    if unsafe { libc::mkdir(path.as_ptr(), 0o755) } != 0 && errno() != libc::EEXIST {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn write_file(path: &CStr, data: &[u8]) -> io::Result<()> {
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    check(fd)?;
    let written = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    let result = if written == data.len() as isize {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    };
    unsafe { libc::close(fd) };
    result
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn errno() -> libc::c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn micros(tv: libc::timeval) -> u64 {
    tv.tv_sec.max(0) as u64 * 1_000_000 + tv.tv_usec.max(0) as u64
}
