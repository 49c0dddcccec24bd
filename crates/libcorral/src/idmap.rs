// crates/libcorral/src/idmap.rs

use nix::unistd::{Group, User, getgid, getuid};
use std::fmt;
use std::fmt::Write as _;
use std::io;
use thiserror::Error;

/// Kernel ceiling on the number of lines accepted by `/proc/<pid>/[ug]id_map`.
pub const MAX_USER_MAPPINGS: usize = 340;

/// Upper bound on the serialized map handed to a single `write` syscall.
pub const ID_MAP_MAX: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Uid,
    Gid,
}

impl IdKind {
    pub fn subid_path(self) -> &'static str {
        match self {
            IdKind::Uid => "/etc/subuid",
            IdKind::Gid => "/etc/subgid",
        }
    }

    pub fn proc_file(self) -> &'static str {
        match self {
            IdKind::Uid => "uid_map",
            IdKind::Gid => "gid_map",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdKind::Uid => "uid",
            IdKind::Gid => "gid",
        })
    }
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("id map has more than {MAX_USER_MAPPINGS} entries")]
    TooManyRanges,
    #[error("id map ranges overlap")]
    Overlapping,
    #[error("id range exceeds the 32-bit id space")]
    RangeOverflow,
    #[error("cannot map desired {kind} map: some {kind}s are not in the {kind}s allowed in {path}")]
    NotAllowed { kind: IdKind, path: &'static str },
    #[error("too many {kind}s to map")]
    TooManyIds { kind: IdKind },
    #[error("{path}:{line}: malformed subordinate id entry")]
    MalformedSubid { path: String, line: usize },
    #[error("{path}:{line}: subordinate id range exceeds the 32-bit id space")]
    SubidOverflow { path: String, line: usize },
    #[error("malformed id map line: {0:?}")]
    MalformedProcMap(String),
    #[error("id map text exceeds {ID_MAP_MAX} bytes")]
    FormatOverflow,
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

/// `length` consecutive ids, seen as `inner..` inside the user namespace and
/// `outer..` in the enclosing one. A zero `length` means the range is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub inner: u32,
    pub outer: u32,
    pub length: u32,
}

impl IdRange {
    fn inner_end(&self) -> u64 {
        self.inner as u64 + self.length as u64
    }

    fn outer_end(&self) -> u64 {
        self.outer as u64 + self.length as u64
    }

    fn start(&self, key: SortKey) -> u32 {
        match key {
            SortKey::Inner => self.inner,
            SortKey::Outer => self.outer,
        }
    }

    fn end(&self, key: SortKey) -> u64 {
        match key {
            SortKey::Inner => self.inner_end(),
            SortKey::Outer => self.outer_end(),
        }
    }

    // Signed inner-to-outer distance; ranges with equal deltas describe one
    // contiguous translation and may be fused.
    fn delta(&self) -> i64 {
        self.outer as i64 - self.inner as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Inner,
    Outer,
}

/// An ordered set of id ranges, at most [`MAX_USER_MAPPINGS`] of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMap {
    ranges: Vec<IdRange>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges<I>(ranges: I) -> Result<Self, MapError>
    where
        I: IntoIterator<Item = IdRange>,
    {
        let mut map = Self::new();
        for r in ranges {
            map.push(r)?;
        }
        Ok(map)
    }

    pub fn ranges(&self) -> &[IdRange] {
        &self.ranges
    }

    /// Append a range, silently dropping absent (zero-length) ones. Ranges
    /// running past the 32-bit id space are rejected outright.
    pub fn push(&mut self, range: IdRange) -> Result<(), MapError> {
        if range.length == 0 {
            return Ok(());
        }
        if range.inner_end() > u32::MAX as u64 || range.outer_end() > u32::MAX as u64 {
            return Err(MapError::RangeOverflow);
        }
        if self.ranges.len() == MAX_USER_MAPPINGS {
            return Err(MapError::TooManyRanges);
        }
        self.ranges.push(range);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total ids covered. `None` is the overflow sentinel: more than
    /// `u32::MAX` ids cannot be expressed in a single kernel map.
    pub fn count(&self) -> Option<u32> {
        let total: u64 = self.ranges.iter().map(|r| r.length as u64).sum();
        if total > u32::MAX as u64 {
            None
        } else {
            Some(total as u32)
        }
    }

    /// Sort by `key`, drop duplicates, and either fuse compatible
    /// adjacent/overlapping ranges (`merge`) or reject any overlap.
    ///
    /// After a successful normalize no two ranges share an id on the `key`
    /// side.
    pub fn normalize(&mut self, key: SortKey, merge: bool) -> Result<(), MapError> {
        self.ranges.retain(|r| r.length > 0);
        self.ranges
            .sort_by_key(|r| (r.start(key), r.start(key.other())));
        self.ranges.dedup();

        let mut out: Vec<IdRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match out.last_mut() {
                Some(prev) if (r.start(key) as u64) < prev.end(key) => {
                    // Overlap on the sort key. Only a continuation of the
                    // same translation may be fused.
                    if !merge || prev.delta() != r.delta() {
                        return Err(MapError::Overlapping);
                    }
                    let end = prev.end(key).max(r.end(key));
                    prev.length = (end - prev.start(key) as u64) as u32;
                }
                Some(prev)
                    if merge && r.start(key) as u64 == prev.end(key) && prev.delta() == r.delta() =>
                {
                    prev.length += r.length;
                }
                _ => out.push(r),
            }
        }
        self.ranges = out;
        Ok(())
    }

    /// Intersect-and-relocate through `view`: every portion of a range whose
    /// `outer` ids fall inside some view range survives, with `outer`
    /// rewritten into the view's `inner` space. Portions outside the view
    /// are dropped.
    pub fn project(&self, view: &IdMap) -> Result<IdMap, MapError> {
        let mut out = IdMap::new();
        for r in &self.ranges {
            for s in &view.ranges {
                let lo = (r.outer as u64).max(s.outer as u64);
                let hi = r.outer_end().min(s.outer_end());
                if lo >= hi {
                    continue;
                }
                let shift = lo - r.outer as u64;
                out.push(IdRange {
                    inner: (r.inner as u64 + shift) as u32,
                    outer: (s.inner as u64 + (lo - s.outer as u64)) as u32,
                    length: (hi - lo) as u32,
                })?;
            }
        }
        Ok(out)
    }

    /// Swap the inner and outer sides of every range.
    pub fn invert(&self) -> IdMap {
        IdMap {
            ranges: self
                .ranges
                .iter()
                .map(|r| IdRange {
                    inner: r.outer,
                    outer: r.inner,
                    length: r.length,
                })
                .collect(),
        }
    }

    /// View in which every range maps to itself (`inner` copied from
    /// `outer`), used to turn an allocation list into a permission set.
    pub fn identity(&self) -> IdMap {
        IdMap {
            ranges: self
                .ranges
                .iter()
                .map(|r| IdRange {
                    inner: r.outer,
                    outer: r.outer,
                    length: r.length,
                })
                .collect(),
        }
    }

    /// Serialize as `"<inner> <outer> <length>\n"` lines, the exact text
    /// accepted by `/proc/<pid>/[ug]id_map`.
    pub fn format(&self) -> Result<String, MapError> {
        let mut text = String::new();
        for r in &self.ranges {
            let _ = writeln!(text, "{} {} {}", r.inner, r.outer, r.length);
            if text.len() > ID_MAP_MAX {
                return Err(MapError::FormatOverflow);
            }
        }
        Ok(text)
    }
}

impl SortKey {
    fn other(self) -> SortKey {
        match self {
            SortKey::Inner => SortKey::Outer,
            SortKey::Outer => SortKey::Inner,
        }
    }
}

/// Parse `/proc/<pid>/uid_map`-format text: whitespace-separated
/// `inner outer length` triples, one per line.
pub fn parse_proc_map(text: &str) -> Result<IdMap, MapError> {
    let mut map = IdMap::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (inner, outer, length) = match (fields.next(), fields.next(), fields.next()) {
            (Some(a), Some(b), Some(c)) if fields.next().is_none() => {
                let parse = |s: &str| {
                    s.parse::<u32>()
                        .map_err(|_| MapError::MalformedProcMap(line.to_string()))
                };
                (parse(a)?, parse(b)?, parse(c)?)
            }
            _ => return Err(MapError::MalformedProcMap(line.to_string())),
        };
        map.push(IdRange {
            inner,
            outer,
            length,
        })?;
    }
    Ok(map)
}

/// The caller identity used to select `/etc/sub{u,g}id` entries. Entries
/// match either the numeric id or the account name.
#[derive(Debug, Clone)]
pub struct Owner {
    pub id: u32,
    pub name: Option<String>,
}

impl Owner {
    pub fn current(kind: IdKind) -> Self {
        match kind {
            IdKind::Uid => {
                let uid = getuid();
                Owner {
                    id: uid.as_raw(),
                    name: User::from_uid(uid).ok().flatten().map(|u| u.name),
                }
            }
            IdKind::Gid => {
                let gid = getgid();
                Owner {
                    id: gid.as_raw(),
                    name: Group::from_gid(gid).ok().flatten().map(|g| g.name),
                }
            }
        }
    }
}

/// Parse subordinate-id text (`owner:start:count` per line) and collect the
/// allocations belonging to `owner`. Comments and blank lines are skipped;
/// anything else malformed fails the whole parse.
///
/// The returned ranges carry the allocation in `outer` and a zero `inner`;
/// callers assign inner ids ([`generate`]) or take an identity view.
pub fn parse_subids(text: &str, owner: &Owner, path: &str) -> Result<IdMap, MapError> {
    let numeric = owner.id.to_string();
    let mut map = IdMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || MapError::MalformedSubid {
            path: path.to_string(),
            line: idx + 1,
        };
        let mut fields = line.split(':');
        let (who, start, count) = match (fields.next(), fields.next(), fields.next()) {
            (Some(a), Some(b), Some(c)) if fields.next().is_none() => (a, b, c),
            _ => return Err(malformed()),
        };
        let start: u32 = start.parse().map_err(|_| malformed())?;
        let count: u32 = count.parse().map_err(|_| malformed())?;
        if start as u64 + count as u64 > u32::MAX as u64 {
            return Err(MapError::SubidOverflow {
                path: path.to_string(),
                line: idx + 1,
            });
        }
        if who != numeric && Some(who) != owner.name.as_deref() {
            continue;
        }
        map.push(IdRange {
            inner: 0,
            outer: start,
            length: count,
        })?;
    }
    Ok(map)
}

fn load_subids(kind: IdKind, owner: &Owner) -> Result<IdMap, MapError> {
    let path = kind.subid_path();
    match std::fs::read_to_string(path) {
        Ok(text) => parse_subids(&text, owner, path),
        // No subordinate-id file means no delegated ranges, not an error.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(IdMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn load_self_map(kind: IdKind) -> Result<IdMap, MapError> {
    let text = std::fs::read_to_string(format!("/proc/self/{}", kind.proc_file()))?;
    parse_proc_map(&text)
}

/// Default map: the caller's own id becomes inner 0, then successive inner
/// ids consume the subordinate allocations in order.
pub fn generate(kind: IdKind, subids: &IdMap, own: u32) -> Result<IdMap, MapError> {
    let mut map = IdMap::new();
    map.push(IdRange {
        inner: 0,
        outer: own,
        length: 1,
    })?;
    let mut next: u64 = 1;
    for r in subids.ranges() {
        if next + r.length as u64 > u32::MAX as u64 {
            return Err(MapError::TooManyIds { kind });
        }
        map.push(IdRange {
            inner: next as u32,
            outer: r.outer,
            length: r.length,
        })?;
        next += r.length as u64;
    }
    Ok(map)
}

/// Combine the user's request, the caller's subordinate allocations, and the
/// caller's own `/proc/self` map into the text to burn into the target's
/// `uid_map`/`gid_map`.
///
/// `desired` speaks in caller-relative outer ids; the result speaks in the
/// host-absolute ids the kernel file expects.
pub fn resolve(
    kind: IdKind,
    desired: &IdMap,
    subids: &IdMap,
    cur_map: &IdMap,
    own: u32,
) -> Result<String, MapError> {
    let mut cur = cur_map.clone();
    cur.normalize(SortKey::Outer, false)?;

    let mut subids = subids.clone();
    subids.normalize(SortKey::Outer, true)?;

    let map = if desired.is_empty() {
        generate(kind, &subids, own)?
    } else {
        let mut desired = desired.clone();
        desired.normalize(SortKey::Inner, false)?;
        let want = desired
            .count()
            .ok_or(MapError::TooManyIds { kind })?;

        // The permission set: delegated ranges plus the caller's own id,
        // viewed as an identity so projection keeps caller-relative outers.
        let mut allowed = subids.identity();
        allowed.push(IdRange {
            inner: own,
            outer: own,
            length: 1,
        })?;
        allowed.normalize(SortKey::Outer, true)?;

        let projected = desired.project(&allowed)?;
        match projected.count() {
            None => return Err(MapError::TooManyIds { kind }),
            Some(got) if got != want => {
                return Err(MapError::NotAllowed {
                    kind,
                    path: kind.subid_path(),
                });
            }
            Some(_) => projected,
        }
    };

    // Translate caller-relative outer ids into the host-absolute form the
    // kernel expects, then emit sorted by inner.
    let mut map = map.project(&cur.invert())?;
    map.normalize(SortKey::Inner, true)?;
    map.format()
}

/// [`resolve`] against the live system: `/etc/sub{u,g}id` and
/// `/proc/self/{uid,gid}_map` for the current process.
pub fn build_proc_map(kind: IdKind, desired: &IdMap) -> Result<String, MapError> {
    let owner = Owner::current(kind);
    let subids = load_subids(kind, &owner)?;
    let cur = load_self_map(kind)?;
    resolve(kind, desired, &subids, &cur, owner.id)
}
