// crates/libcorral/src/helper.rs
//
// The outer helper is a sibling process forked while the launcher still
// holds its host credentials. It waits to learn the target's pid over a
// socketpair, performs the privileged setup steps on the target's behalf
// (id maps, namespace persistence, virtual interfaces), and releases the
// barrier with a fixed sentinel. The target must not touch its own ids
// until that sentinel has been relayed to it.

use crate::capable::make_capable;
use crate::cgroup;
use crate::fdpass::recv_fd;
use crate::idmap::{self, IdKind, IdMap};
use crate::net::{NicSpec, create_nics};
use crate::nspersist::{PersistTable, persist_all};
use anyhow::{Context, Result, anyhow, bail};
use caps::Capability;
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{OFlag, open, openat};
use nix::sys::prctl;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::stat::Mode;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, read, write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

// Barrier sentinel; its value is opaque to the peer but checked on receipt.
const OK_TOKEN: [u8; 4] = *b"OKAY";

/// Everything the helper needs to know, fixed before the fork.
#[derive(Debug, Default)]
pub struct HelperConfig {
    pub unshare_user: bool,
    pub unshare_net: bool,
    pub cgroup: bool,
    pub uid_desired: IdMap,
    pub gid_desired: IdMap,
    pub persist: PersistTable,
    pub nics: Vec<NicSpec>,
}

/// Launcher-side handle on a running helper. Dropping it closes the control
/// socket.
pub struct OuterHelper {
    pid: Pid,
    control: OwnedFd,
}

impl OuterHelper {
    /// Fork the helper. Must be called before the launcher unshares
    /// anything: the child keeps the launcher's credentials of this moment.
    pub fn spawn(config: HelperConfig) -> Result<OuterHelper> {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .context("create helper control socketpair")?;

        match unsafe { fork() }.context("fork outer helper")? {
            ForkResult::Parent { child } => {
                drop(theirs);
                debug!("outer helper running as pid {child}");
                Ok(OuterHelper {
                    pid: child,
                    control: ours,
                })
            }
            ForkResult::Child => {
                drop(ours);
                std::process::exit(helper_main(&config, theirs));
            }
        }
    }

    pub fn control(&self) -> BorrowedFd<'_> {
        self.control.as_fd()
    }

    /// Tell the helper which process to operate on.
    pub fn send_pid(&self, tp: Pid) -> Result<()> {
        write_pid(self.control.as_fd(), tp).context("send target pid to outer helper")
    }

    /// Block until the helper has finished every privileged step. An EOF
    /// here means it died mid-setup, which is fatal (it has already written
    /// its own diagnostic).
    pub fn sync(&self) -> Result<()> {
        if read_ok(self.control.as_fd()).context("sync with outer helper")? {
            Ok(())
        } else {
            Err(anyhow!("outer helper exited before completing setup"))
        }
    }

    /// Reap the helper once [`sync`](Self::sync) has returned.
    pub fn wait(self) -> Result<()> {
        match waitpid(self.pid, None).context("wait for outer helper")? {
            WaitStatus::Exited(_, 0) => Ok(()),
            status => bail!("outer helper failed: {status:?}"),
        }
    }
}

fn helper_main(config: &HelperConfig, sock: OwnedFd) -> i32 {
    let init = || -> Result<()> {
        SigSet::empty()
            .thread_set_mask()
            .context("clear signal mask")?;
        // An aborted launcher must take the helper down with it.
        prctl::set_pdeathsig(Signal::SIGKILL).context("set parent-death signal")?;
        Ok(())
    };
    if let Err(e) = init() {
        eprintln!("corral: outer helper: {e:#}");
        return 1;
    }
    match run(config, &sock) {
        Ok(true) => 0,
        // The launcher died before sending a pid; it has nothing left to
        // read, so exit without noise.
        Ok(false) => 1,
        Err(e) => {
            eprintln!("corral: outer helper: {e:#}");
            1
        }
    }
}

fn run(config: &HelperConfig, sock: &OwnedFd) -> Result<bool> {
    let tp = match read_pid(sock.as_fd())? {
        Some(pid) => pid,
        None => return Ok(false),
    };
    debug!("outer helper: target pid is {tp}");

    if config.cgroup {
        let dir = recv_fd(sock.as_fd()).context("receive cgroup directory fd")?;
        cgroup::spawn_watcher(dir, tp)?;
    }

    if config.unshare_user {
        let proc_dir = open(
            format!("/proc/{tp}").as_str(),
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .with_context(|| format!("open /proc/{tp}"))?;

        // Resolve both maps before taking any privilege.
        let uid_map = idmap::build_proc_map(IdKind::Uid, &config.uid_desired)?;
        let gid_map = idmap::build_proc_map(IdKind::Gid, &config.gid_desired)?;

        let _guard = make_capable(&[
            Capability::CAP_SETUID,
            Capability::CAP_SETGID,
            Capability::CAP_DAC_OVERRIDE,
        ])?;
        burn(proc_dir.as_fd(), "uid_map", &uid_map)?;
        burn(proc_dir.as_fd(), "gid_map", &gid_map)?;
    }

    persist_all(tp, &config.persist)?;

    if config.unshare_net && !config.nics.is_empty() {
        let _guard = make_capable(&[Capability::CAP_NET_ADMIN])?;
        create_nics(tp, &config.nics)?;
    }

    write_ok(sock.as_fd())?;
    Ok(true)
}

/// Write the full map in one syscall. The kernel rejects a second write to
/// these files, so a short write is a defect, never a retry opportunity.
fn burn(proc_dir: BorrowedFd<'_>, file: &str, text: &str) -> Result<()> {
    let fd = openat(
        proc_dir,
        file,
        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .with_context(|| format!("open {file}"))?;
    let n = write(&fd, text.as_bytes()).with_context(|| format!("write {file}"))?;
    if n != text.len() {
        bail!("short write to {file}: {n} of {} bytes", text.len());
    }
    debug!("burned {file}:\n{}", text.trim_end());
    Ok(())
}

/// Send a pid as fixed-width little-endian bytes.
pub fn write_pid(fd: BorrowedFd<'_>, pid: Pid) -> Result<()> {
    write_full(fd, &pid.as_raw().to_le_bytes())
}

/// Read a peer's pid. `None` means the peer closed the socket before a full
/// pid arrived; the reader exits quietly since the peer already reported.
pub fn read_pid(fd: BorrowedFd<'_>) -> Result<Option<Pid>> {
    let mut buf = [0u8; 4];
    if !read_full(fd, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(Pid::from_raw(i32::from_le_bytes(buf))))
}

/// Release the setup barrier.
pub fn write_ok(fd: BorrowedFd<'_>) -> Result<()> {
    write_full(fd, &OK_TOKEN)
}

/// Wait on the setup barrier. `false` on EOF or a truncated token; a
/// present-but-wrong token is a protocol error.
pub fn read_ok(fd: BorrowedFd<'_>) -> Result<bool> {
    let mut buf = [0u8; 4];
    if !read_full(fd, &mut buf)? {
        return Ok(false);
    }
    if buf != OK_TOKEN {
        bail!("bad sync token {buf:?}");
    }
    Ok(true)
}

fn write_full(fd: BorrowedFd<'_>, buf: &[u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match write(fd, &buf[done..]) {
            Ok(0) => bail!("peer closed the control socket"),
            Ok(n) => done += n,
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e).context("write control socket"),
        }
    }
    Ok(())
}

// False on EOF, whether at the first byte or mid-message.
fn read_full(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<bool> {
    let mut done = 0;
    while done < buf.len() {
        match read(fd, &mut buf[done..]) {
            Ok(0) => return Ok(false),
            Ok(n) => done += n,
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e).context("read control socket"),
        }
    }
    Ok(true)
}
