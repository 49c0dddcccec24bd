// crates/libcorral/src/tty.rs
//
// Controlling-terminal brokerage. The target process allocates the pty and
// ships the master back over the setup socket; the launcher relays stdio in
// raw mode, forwards signals, and mirrors window-size changes.

use crate::fdpass::{recv_fd, send_fd};
use anyhow::{Context, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{OFlag, SpliceFFlags, open, splice};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::SigSet;
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::stat::Mode;
use nix::sys::termios::{OutputFlags, SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use nix::unistd::{Pid, pipe2, setsid, write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};

nix::ioctl_write_ptr_bad!(tiocsptlck, libc::TIOCSPTLCK, libc::c_int);
nix::ioctl_write_int_bad!(tiocgptpeer, libc::TIOCGPTPEER);
nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

// Largest transfer attempted per splice; the loop polls again for the rest.
const SPLICE_MAX: usize = 1 << 16;

const EOT: [u8; 1] = [0x04];

fn stdin_fd() -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) }
}

fn stdout_fd() -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(libc::STDOUT_FILENO) }
}

/// Runs in the target process before the payload exec: allocate a pty, ship
/// the master to the launcher, and make the slave our controlling terminal
/// on stdin/stdout/stderr.
pub fn tty_child_setup(sock: BorrowedFd<'_>) -> Result<()> {
    // /dev/pts/ptmx rather than /dev/ptmx so this also works once the mount
    // tree only carries a fresh devpts instance.
    let master = open(
        "/dev/pts/ptmx",
        OFlag::O_RDWR | OFlag::O_NOCTTY,
        Mode::empty(),
    )
    .context("open /dev/pts/ptmx")?;

    let unlock: libc::c_int = 0;
    unsafe { tiocsptlck(master.as_raw_fd(), &unlock) }.context("unlock pty slave")?;

    // TIOCGPTPEER opens the slave through the master, which keeps working
    // after the slave path is no longer reachable from this mount namespace.
    let peer_flags = OFlag::O_RDWR | OFlag::O_NOCTTY;
    let slave = unsafe { tiocgptpeer(master.as_raw_fd(), peer_flags.bits()) }
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .context("open pty slave")?;

    send_fd(sock, master.as_fd()).context("send pty master to launcher")?;
    drop(master);

    setsid().context("setsid")?;
    unsafe { tiocsctty(slave.as_raw_fd(), 0) }.context("acquire controlling terminal")?;

    for stdfd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        Errno::result(unsafe { libc::dup2(slave.as_raw_fd(), stdfd) })
            .with_context(|| format!("dup pty slave onto fd {stdfd}"))?;
    }
    if slave.as_raw_fd() <= libc::STDERR_FILENO {
        // Already one of the standard fds; leaking the handle keeps it open.
        let _ = slave.into_raw_fd();
    }
    Ok(())
}

/// Launcher half of the terminal relay.
///
/// Owns the pty master, the signalfd, and the two decoupling pipes; restores
/// the caller's termios when dropped, so it must be constructed at most once
/// per process and kept alive for the whole relay.
pub struct TtyParent {
    termfd: OwnedFd,
    sigfd: SignalFd,
    stdin_termios: Option<Termios>,
    inpipe_r: Option<OwnedFd>,
    inpipe_w: Option<OwnedFd>,
    outpipe_r: Option<OwnedFd>,
    outpipe_w: Option<OwnedFd>,
    stdin_open: bool,
    term_read_open: bool,
    stdout_open: bool,
}

impl TtyParent {
    /// Switch stdin to raw mode (keeping its output post-processing), block
    /// every signal behind a signalfd, and receive the pty master from the
    /// target process.
    pub fn setup(sock: BorrowedFd<'_>) -> Result<TtyParent> {
        // A failing tcgetattr means stdin is not a terminal; the relay then
        // leaves it alone and window-size handling stays off.
        let stdin_termios = match tcgetattr(stdin_fd()) {
            Ok(orig) => {
                let mut raw = orig.clone();
                cfmakeraw(&mut raw);
                // Keep the caller's c_oflag: our own stdout still wants
                // ONLCR and friends applied.
                raw.output_flags = orig.output_flags;
                tcsetattr(stdin_fd(), SetArg::TCSANOW, &raw).context("set stdin raw mode")?;
                Some(orig)
            }
            Err(_) => None,
        };

        let termfd = recv_fd(sock).context("receive pty master")?;

        // Output post-processing happens on our stdout, not on the master;
        // leaving OPOST set would inject \r into the relayed stream.
        let mut tios = tcgetattr(&termfd).context("read pty master termios")?;
        tios.output_flags.remove(OutputFlags::OPOST);
        tcsetattr(&termfd, SetArg::TCSANOW, &tios).context("clear OPOST on pty master")?;

        if stdin_termios.is_some() {
            let _ = copy_winsize(stdin_fd(), termfd.as_fd());
        }

        let mask = SigSet::all();
        mask.thread_block().context("block signals")?;
        let sigfd =
            SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC).context("create signalfd")?;

        let (inpipe_r, inpipe_w) = pipe2(OFlag::O_CLOEXEC).context("create input pipe")?;
        let (outpipe_r, outpipe_w) = pipe2(OFlag::O_CLOEXEC).context("create output pipe")?;

        Ok(TtyParent {
            termfd,
            sigfd,
            stdin_termios,
            inpipe_r: Some(inpipe_r),
            inpipe_w: Some(inpipe_w),
            outpipe_r: Some(outpipe_r),
            outpipe_w: Some(outpipe_w),
            stdin_open: true,
            term_read_open: true,
            stdout_open: true,
        })
    }

    /// One poll pass over the relay edges. Returns `true` once `SIGCHLD`
    /// for the target process arrives; the caller then reaps it and drops
    /// the relay.
    pub fn pump(&mut self, tp: Pid) -> Result<bool> {
        // Poll slots: 0 stdin, 1 inpipe read, 2 master read, 3 outpipe
        // read, 4 signalfd, 5 inpipe write, 6 master write, 7 outpipe
        // write, 8 stdout. An edge is armed only while both of its ends
        // are still open, so a finished edge cannot spin the loop.
        let mut fds: Vec<PollFd> = Vec::with_capacity(9);
        let mut slot = [None::<usize>; 9];

        if self.stdin_open && let Some(w) = &self.inpipe_w {
            slot[0] = Some(fds.len());
            fds.push(PollFd::new(stdin_fd(), PollFlags::POLLIN));
            slot[5] = Some(fds.len());
            fds.push(PollFd::new(w.as_fd(), PollFlags::POLLOUT));
        }
        if let Some(r) = &self.inpipe_r {
            slot[1] = Some(fds.len());
            fds.push(PollFd::new(r.as_fd(), PollFlags::POLLIN));
            slot[6] = Some(fds.len());
            fds.push(PollFd::new(self.termfd.as_fd(), PollFlags::POLLOUT));
        }
        if self.term_read_open && let Some(w) = &self.outpipe_w {
            slot[2] = Some(fds.len());
            fds.push(PollFd::new(self.termfd.as_fd(), PollFlags::POLLIN));
            slot[7] = Some(fds.len());
            fds.push(PollFd::new(w.as_fd(), PollFlags::POLLOUT));
        }
        if self.stdout_open && let Some(r) = &self.outpipe_r {
            slot[3] = Some(fds.len());
            fds.push(PollFd::new(r.as_fd(), PollFlags::POLLIN));
            slot[8] = Some(fds.len());
            fds.push(PollFd::new(stdout_fd(), PollFlags::POLLOUT));
        }
        slot[4] = Some(fds.len());
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(self.sigfd.as_raw_fd()) },
            PollFlags::POLLIN,
        ));

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(false),
            Err(e) => return Err(e).context("poll relay fds"),
        }

        let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let writable = PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR;
        let ready = |i: usize, want: PollFlags| {
            slot[i].is_some_and(|n| fds[n].revents().is_some_and(|r| r.intersects(want)))
        };
        let r_stdin = ready(0, readable);
        let r_inpipe = ready(1, readable);
        let r_term = ready(2, readable);
        let r_outpipe = ready(3, readable);
        let r_sig = ready(4, readable);
        let w_inpipe = ready(5, writable);
        let w_term = ready(6, writable);
        let w_outpipe = ready(7, writable);
        let w_stdout = ready(8, writable);
        drop(fds);

        let flags = SpliceFFlags::SPLICE_F_MOVE | SpliceFFlags::SPLICE_F_NONBLOCK;

        // stdin -> inpipe
        if r_stdin && w_inpipe && let Some(w) = &self.inpipe_w {
            match splice(stdin_fd(), None, w.as_fd(), None, SPLICE_MAX, flags) {
                Ok(0) => {
                    // End of input: let the line discipline see ^D, then
                    // drain whatever is still buffered.
                    let _ = write(w, &EOT);
                    self.stdin_open = false;
                    self.inpipe_w = None;
                }
                Ok(_) => {}
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(e) => {
                    debug!("stdin relay closed: {e}");
                    self.stdin_open = false;
                    self.inpipe_w = None;
                }
            }
        }

        // inpipe -> pty master
        if r_inpipe && w_term {
            let done = match self.splice_from_inpipe(flags) {
                Ok(0) => true,
                Ok(_) => false,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => false,
                Err(e) => {
                    debug!("input relay closed: {e}");
                    true
                }
            };
            if done {
                self.inpipe_r = None;
            }
        }

        // pty master -> outpipe
        if r_term && w_outpipe && let Some(w) = &self.outpipe_w {
            match splice(self.termfd.as_fd(), None, w.as_fd(), None, SPLICE_MAX, flags) {
                Ok(0) | Err(Errno::EIO) => {
                    // EIO is how a master reads once the slave side is gone.
                    self.term_read_open = false;
                    self.outpipe_w = None;
                }
                Ok(_) => {}
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
                Err(e) => {
                    debug!("output relay closed: {e}");
                    self.term_read_open = false;
                    self.outpipe_w = None;
                }
            }
        }

        // outpipe -> stdout
        if r_outpipe && w_stdout {
            let done = match self.splice_to_stdout(flags) {
                Ok(0) => true,
                Ok(_) => false,
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => false,
                Err(e) => {
                    debug!("stdout relay closed: {e}");
                    true
                }
            };
            if done {
                self.outpipe_r = None;
                self.stdout_open = false;
            }
        }

        if r_sig {
            return self.drain_signal(tp);
        }
        Ok(false)
    }

    fn splice_from_inpipe(&self, flags: SpliceFFlags) -> nix::Result<usize> {
        match &self.inpipe_r {
            Some(r) => splice(r.as_fd(), None, self.termfd.as_fd(), None, SPLICE_MAX, flags),
            None => Ok(0),
        }
    }

    fn splice_to_stdout(&self, flags: SpliceFFlags) -> nix::Result<usize> {
        match &self.outpipe_r {
            Some(r) => splice(r.as_fd(), None, stdout_fd(), None, SPLICE_MAX, flags),
            None => Ok(0),
        }
    }

    fn drain_signal(&mut self, tp: Pid) -> Result<bool> {
        let info = match self.sigfd.read_signal().context("read signalfd")? {
            Some(info) => info,
            None => return Ok(false),
        };
        let signo = info.ssi_signo as i32;
        if signo == libc::SIGCHLD {
            // Only the target's death ends the relay; an earlier-reaped
            // sibling (the outer helper) may still have a queued SIGCHLD.
            if info.ssi_pid as libc::pid_t == tp.as_raw() {
                return Ok(true);
            }
            return Ok(false);
        }
        if signo == libc::SIGWINCH && self.handle_winch() {
            return Ok(false);
        }
        // Everything else belongs to the target process.
        let _ = unsafe { libc::kill(tp.as_raw(), signo) };
        Ok(false)
    }

    /// Mirror stdin's window size onto the master. Returns false when stdin
    /// is not a terminal, in which case the signal is forwarded instead.
    fn handle_winch(&self) -> bool {
        if self.stdin_termios.is_none() {
            return false;
        }
        copy_winsize(stdin_fd(), self.termfd.as_fd()).is_ok()
    }
}

impl Drop for TtyParent {
    fn drop(&mut self) {
        if let Some(orig) = &self.stdin_termios {
            let _ = tcsetattr(stdin_fd(), SetArg::TCSANOW, orig);
        }
    }
}

fn copy_winsize(from: BorrowedFd<'_>, to: BorrowedFd<'_>) -> Result<()> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    unsafe { tiocgwinsz(from.as_raw_fd(), &mut ws) }.context("read window size")?;
    unsafe { tiocswinsz(to.as_raw_fd(), &ws) }.context("set window size")?;
    Ok(())
}
