// crates/libcorral/src/cgroup.rs
//
// Ephemeral cgroup handling: the launcher parks the target process in
// `corral.<pid>` under its own cgroup v2 directory, and a detached watcher
// process removes that cgroup once `cgroup.events` reports it empty.

use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::{ForkResult, Pid, fork, setsid};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

// Longest line we accept from cgroup.events. The kernel writes short
// `<key> <0|1>` pairs; anything beyond this is not the file we think it is.
pub const EVENTS_LINE_MAX: usize = 128;

pub fn ephemeral_name(root_pid: Pid) -> String {
    format!("corral.{root_pid}")
}

/// The caller's own cgroup v2 directory, from `/proc/self/cgroup`.
pub fn current_cgroup_dir() -> Result<PathBuf> {
    let text = fs::read_to_string("/proc/self/cgroup").context("read /proc/self/cgroup")?;
    for line in text.lines() {
        if let Some(rel) = line.strip_prefix("0::") {
            return Ok(Path::new("/sys/fs/cgroup").join(rel.trim_start_matches('/')));
        }
    }
    Err(anyhow!("no cgroup v2 entry in /proc/self/cgroup"))
}

/// Create `corral.<root_pid>` under `base` and hand back a directory fd for
/// `base` itself; the watcher resolves everything relative to it.
pub fn create(base: &Path, root_pid: Pid) -> Result<OwnedFd> {
    let dir = base.join(ephemeral_name(root_pid));
    fs::create_dir(&dir).with_context(|| format!("create cgroup {}", dir.display()))?;
    let fd = open(base, OFlag::O_DIRECTORY | OFlag::O_CLOEXEC, Mode::empty())
        .with_context(|| format!("open cgroup directory {}", base.display()))?;
    debug!("created ephemeral cgroup {}", dir.display());
    Ok(fd)
}

/// Move `pid` into the ephemeral cgroup.
pub fn attach(base: &Path, root_pid: Pid, pid: Pid) -> Result<()> {
    let procs = base.join(ephemeral_name(root_pid)).join("cgroup.procs");
    fs::write(&procs, pid.to_string())
        .with_context(|| format!("move pid {pid} into {}", procs.display()))
}

/// Fork the watcher. The child is deliberately left unreaped: it has to
/// outlive both the helper and the launcher to observe the cgroup draining
/// after everything else has exited.
pub fn spawn_watcher(dir: OwnedFd, root_pid: Pid) -> Result<()> {
    match unsafe { fork() }.context("fork cgroup watcher")? {
        ForkResult::Parent { child } => {
            debug!("cgroup watcher running as pid {child}");
            Ok(())
        }
        ForkResult::Child => {
            let code = match watch(dir, root_pid) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("corral: cgroup watcher: {e:#}");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

fn watch(dir: OwnedFd, root_pid: Pid) -> Result<()> {
    // Our own session, immune to whatever the launcher's group receives.
    setsid().context("setsid")?;

    let events_rel = format!("{}/cgroup.events", ephemeral_name(root_pid));
    let events_path = fd_path(&dir).join(&events_rel);

    let watch_fd = open(
        &events_path,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("open {}", events_path.display()))?;

    // Edge-triggered: cgroup.events cannot be meaningfully seeked, so each
    // wake is only a hint to go look again.
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create")?;
    epoll
        .add(
            &watch_fd,
            EpollEvent::new(EpollFlags::EPOLLPRI | EpollFlags::EPOLLET, 0),
        )
        .context("epoll_ctl cgroup.events")?;

    loop {
        // The file must be reopened to observe the current state.
        let snapshot = fs::File::open(&events_path)
            .with_context(|| format!("reopen {}", events_path.display()))?;
        if events_show_empty(snapshot)? {
            cgroup_clean(&dir, root_pid)?;
            return Ok(());
        }

        let mut pending = [EpollEvent::empty()];
        match epoll.wait(&mut pending, EpollTimeout::NONE) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(e).context("epoll_wait on cgroup.events"),
        }
    }
}

/// Scan one snapshot of `cgroup.events` for a `populated 0` line. Field
/// order within the file is not guaranteed, so every line is inspected;
/// lines such as `frozen 1` are ignored. Over-long lines mean we are not
/// reading the file we expect and are a fatal protocol error.
pub fn events_show_empty<R: Read>(events: R) -> Result<bool> {
    let mut reader = BufReader::new(events);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .by_ref()
            .take(EVENTS_LINE_MAX as u64 + 1)
            .read_line(&mut line)
            .context("read cgroup.events")?;
        if n == 0 {
            return Ok(false);
        }
        if n > EVENTS_LINE_MAX {
            bail!("cgroup.events: line longer than {EVENTS_LINE_MAX} bytes");
        }
        if line.starts_with("populated 0") {
            return Ok(true);
        }
    }
}

/// Remove the ephemeral cgroup and any child cgroups created inside it.
/// Paths are anchored to the held directory fd through procfs, so the
/// watcher stays independent of its cwd and of later renames of `base`.
pub fn cgroup_clean(dir: &OwnedFd, root_pid: Pid) -> Result<()> {
    let root = fd_path(dir).join(ephemeral_name(root_pid));
    let entries = fs::read_dir(&root).with_context(|| format!("list {}", root.display()))?;
    for entry in entries {
        let entry = entry.context("read cgroup entry")?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            fs::remove_dir(entry.path())
                .with_context(|| format!("remove child cgroup {}", entry.path().display()))?;
        }
    }
    fs::remove_dir(&root).with_context(|| format!("remove cgroup {}", root.display()))?;
    debug!("removed ephemeral cgroup {}", root.display());
    Ok(())
}

fn fd_path(fd: &OwnedFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}
