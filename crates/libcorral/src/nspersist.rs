// crates/libcorral/src/nspersist.rs

use crate::capable::make_capable;
use anyhow::{Context, Result, bail};
use caps::Capability;
use log::debug;
use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sys::stat::{Mode, SFlag, mknod};
use nix::unistd::{Pid, unlink};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const NS_COUNT: usize = 8;

/// Namespace types whose `/proc/<pid>/ns/<name>` files can be pinned to a
/// caller-chosen path. The short names are fixed: `nsenter` users rely on
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsKind {
    User,
    Mnt,
    Net,
    Pid,
    Uts,
    Ipc,
    Cgroup,
    Time,
}

impl NsKind {
    pub const ALL: [NsKind; NS_COUNT] = [
        NsKind::User,
        NsKind::Mnt,
        NsKind::Net,
        NsKind::Pid,
        NsKind::Uts,
        NsKind::Ipc,
        NsKind::Cgroup,
        NsKind::Time,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NsKind::User => "user",
            NsKind::Mnt => "mnt",
            NsKind::Net => "net",
            NsKind::Pid => "pid",
            NsKind::Uts => "uts",
            NsKind::Ipc => "ipc",
            NsKind::Cgroup => "cgroup",
            NsKind::Time => "time",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for NsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NsKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown namespace type {s:?}"))
    }
}

/// Requested persistence targets, indexed by [`NsKind::index`].
pub type PersistTable = [Option<PathBuf>; NS_COUNT];

/// Bind-mount the target process's namespace files onto their requested
/// paths. Runs in the outer helper while it still holds host credentials.
pub fn persist_all(tp: Pid, table: &PersistTable) -> Result<()> {
    if table.iter().all(Option::is_none) {
        return Ok(());
    }
    let _guard = make_capable(&[Capability::CAP_SYS_ADMIN, Capability::CAP_SYS_PTRACE])?;
    for kind in NsKind::ALL {
        if let Some(target) = &table[kind.index()] {
            persist_one(tp, kind, target)?;
        }
    }
    Ok(())
}

fn persist_one(tp: Pid, kind: NsKind, target: &Path) -> Result<()> {
    let source = PathBuf::from(format!("/proc/{}/ns/{}", tp, kind.name()));

    match mknod(
        target,
        SFlag::S_IFREG,
        Mode::S_IRUSR | Mode::S_IWUSR,
        0,
    ) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => {
            return Err(e).with_context(|| format!("create {}", target.display()));
        }
    }

    match mount(
        Some(&source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    ) {
        Ok(()) => {
            debug!("persisted {} namespace at {}", kind, target.display());
            Ok(())
        }
        Err(Errno::ENOENT) => {
            // This kernel has no such namespace type; leave no stray file.
            let _ = unlink(target);
            debug!("skipping {} namespace: not supported by this kernel", kind);
            Ok(())
        }
        Err(Errno::EINVAL) => {
            let _ = unlink(target);
            bail!(
                "bind-mount {} onto {}: is the destination on a private mount?",
                source.display(),
                target.display()
            );
        }
        Err(e) => {
            let _ = unlink(target);
            Err(e).with_context(|| {
                format!("bind-mount {} onto {}", source.display(), target.display())
            })
        }
    }
}
