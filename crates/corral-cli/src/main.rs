// crates/corral-cli/src/main.rs

use anyhow::{Context, Result, bail};
use clap::Parser;
use libcorral::config::{MapEntry, SandboxConfig};
use libcorral::helper::{self, HelperConfig, OuterHelper};
use libcorral::net::NicSpec;
use libcorral::tty::{TtyParent, tty_child_setup};
use libcorral::{cgroup, fdpass};
use log::debug;
use nix::sched::{CloneFlags, clone};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Gid, Uid, execvp, sethostname, setgid, setgroups, setuid};
use std::ffi::CString;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Run a command inside fresh Linux namespaces")]
struct Cli {
    /// JSON sandbox description; the flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Uid range to map, as inner:outer:length (outer as seen by the caller)
    #[arg(long = "uid-map", value_name = "INNER:OUTER:LEN")]
    uid_map: Vec<MapEntry>,

    /// Gid range to map, as inner:outer:length
    #[arg(long = "gid-map", value_name = "INNER:OUTER:LEN")]
    gid_map: Vec<MapEntry>,

    /// Persist a namespace file, e.g. --persist net=/run/corral/net
    #[arg(long, value_name = "NS=PATH")]
    persist: Vec<String>,

    /// Create an interface inside the sandbox, e.g. --nic sb0:macvlan:eth0
    #[arg(long, value_name = "NAME:KIND[:LINK]")]
    nic: Vec<NicSpec>,

    /// Keep the host's network namespace
    #[arg(long)]
    share_net: bool,

    /// Park the sandbox in an ephemeral cgroup, reaped once it empties
    #[arg(long)]
    cgroup: bool,

    /// Hostname inside the sandbox
    #[arg(long)]
    hostname: Option<String>,

    /// Command to run inside the sandbox
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    env_logger::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("corral: {e:#}");
            std::process::exit(1);
        }
    }
}

fn effective_config(cli: &Cli) -> Result<SandboxConfig> {
    let mut cfg = match &cli.config {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("load {}", path.display()))?,
        None => SandboxConfig::default(),
    };
    if !cli.command.is_empty() {
        cfg.command = cli.command.clone();
    }
    if !cli.uid_map.is_empty() {
        cfg.uid_map = cli.uid_map.clone();
    }
    if !cli.gid_map.is_empty() {
        cfg.gid_map = cli.gid_map.clone();
    }
    if !cli.nic.is_empty() {
        cfg.nics = cli.nic.clone();
    }
    for spec in &cli.persist {
        let (ns, path) = spec
            .split_once('=')
            .with_context(|| format!("--persist {spec:?} is not NS=PATH"))?;
        cfg.persist.insert(ns.to_string(), PathBuf::from(path));
    }
    cfg.share_net |= cli.share_net;
    cfg.cgroup |= cli.cgroup;
    if cli.hostname.is_some() {
        cfg.hostname = cli.hostname.clone();
    }
    cfg.validate()?;
    if cfg.command.is_empty() {
        bail!("no command given");
    }
    Ok(cfg)
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cfg = effective_config(&cli)?;

    let (uid_desired, gid_desired) = cfg.desired_maps()?;
    // The target adopts the lowest mapped inner ids after the barrier.
    let inner_uid = lowest_inner(&cfg.uid_map);
    let inner_gid = lowest_inner(&cfg.gid_map);

    let helper = OuterHelper::spawn(HelperConfig {
        unshare_user: true,
        unshare_net: !cfg.share_net,
        cgroup: cfg.cgroup,
        uid_desired,
        gid_desired,
        persist: cfg.persist_table()?,
        nics: cfg.nics.clone(),
    })?;

    let (setup, setup_child) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context("create setup socketpair")?;

    let mut flags = CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWCGROUP;
    if !cfg.share_net {
        flags |= CloneFlags::CLONE_NEWNET;
    }

    let child_sock = setup_child.as_raw_fd();
    let parent_sock = setup.as_raw_fd();
    let hostname = cfg.hostname.clone();
    let command = cfg.command.clone();
    let mut stack = vec![0u8; 1024 * 1024];
    let cb = Box::new(move || {
        // Shed the launcher end of the socketpair so its death reaches us
        // as an EOF instead of a hang.
        drop(unsafe { OwnedFd::from_raw_fd(parent_sock) });
        target_main(child_sock, &hostname, &command, inner_uid, inner_gid)
    });
    let tp = unsafe { clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }
        .context("clone target process")?;
    // The child's fd-table copy keeps its end alive.
    drop(setup_child);
    debug!("target process is pid {tp}");

    helper.send_pid(tp)?;

    if cfg.cgroup {
        let base = cgroup::current_cgroup_dir()?;
        let dir = cgroup::create(&base, tp)?;
        cgroup::attach(&base, tp, tp)?;
        fdpass::send_fd(helper.control(), dir.as_fd())
            .context("pass cgroup directory to outer helper")?;
    }

    helper.sync()?;
    helper.wait()?;

    // Privileged setup is visible; let the target continue.
    helper::write_ok(setup.as_fd()).context("release target process")?;

    let mut tty = TtyParent::setup(setup.as_fd())?;
    while !tty.pump(tp)? {}

    let status = waitpid(tp, None).context("reap target process")?;
    drop(tty);
    match status {
        WaitStatus::Exited(_, code) => Ok(code),
        WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
        other => bail!("unexpected wait status {other:?}"),
    }
}

fn lowest_inner(entries: &[MapEntry]) -> u32 {
    entries.iter().map(|e| e.0.inner).min().unwrap_or(0)
}

// Runs inside the fresh namespaces, between clone and execvp.
fn target_main(
    sock: RawFd,
    hostname: &Option<String>,
    command: &[String],
    inner_uid: u32,
    inner_gid: u32,
) -> isize {
    let sock = unsafe { BorrowedFd::borrow_raw(sock) };
    match target_run(sock, hostname, command, inner_uid, inner_gid) {
        Ok(()) => unreachable!("execvp returned successfully"),
        Err(e) => {
            eprintln!("corral: sandbox: {e:#}");
            1
        }
    }
}

fn target_run(
    sock: BorrowedFd<'_>,
    hostname: &Option<String>,
    command: &[String],
    inner_uid: u32,
    inner_gid: u32,
) -> Result<()> {
    // Ids are unusable until the outer helper has burned the maps and the
    // launcher relays the barrier sentinel.
    if !helper::read_ok(sock)? {
        bail!("launcher died before setup finished");
    }

    tty_child_setup(sock)?;

    if let Some(name) = hostname {
        sethostname(name).context("set hostname")?;
    }

    setgroups(&[]).context("clear supplementary groups")?;
    setgid(Gid::from_raw(inner_gid)).with_context(|| format!("setgid {inner_gid}"))?;
    setuid(Uid::from_raw(inner_uid)).with_context(|| format!("setuid {inner_uid}"))?;

    let args = command
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("command contains a NUL byte")?;
    execvp(&args[0], &args).context("execvp")?;
    Ok(())
}
