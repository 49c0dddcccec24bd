// crates/libcorral/src/config.rs

use crate::idmap::{IdMap, IdRange};
use crate::net::NicSpec;
use crate::nspersist::{NsKind, PersistTable};
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// One id-map range in the compact `inner:outer:length` form used on the
/// command line and in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry(pub IdRange);

impl fmt::Display for MapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0.inner, self.0.outer, self.0.length)
    }
}

impl FromStr for MapEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some(inner), Some(outer), Some(length), None) => {
                let parse = |field: &str| {
                    field
                        .parse::<u32>()
                        .map_err(|_| format!("map entry {s:?} is not inner:outer:length"))
                };
                Ok(MapEntry(IdRange {
                    inner: parse(inner)?,
                    outer: parse(outer)?,
                    length: parse(length)?,
                }))
            }
            _ => Err(format!("map entry {s:?} is not inner:outer:length")),
        }
    }
}

/// A sandbox description, loadable from JSON. Command-line flags layer on
/// top of it.
#[serde_as]
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SandboxConfig {
    pub command: Vec<String>,
    pub hostname: Option<String>,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub uid_map: Vec<MapEntry>,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub gid_map: Vec<MapEntry>,
    /// Namespace short name -> path to bind the namespace file onto.
    pub persist: BTreeMap<String, PathBuf>,
    /// Keep the host's network namespace instead of unsharing one.
    pub share_net: bool,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub nics: Vec<NicSpec>,
    /// Park the target in an ephemeral cgroup reaped after it empties.
    pub cgroup: bool,
}

impl SandboxConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let cfg: Self = serde_json::from_reader(BufReader::new(file))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in self.persist.keys() {
            NsKind::from_str(name).map_err(ConfigError::Invalid)?;
        }
        if self.share_net && !self.nics.is_empty() {
            return Err(ConfigError::Invalid(
                "nics require an unshared network namespace".into(),
            ));
        }
        Ok(())
    }

    pub fn desired_maps(&self) -> Result<(IdMap, IdMap), ConfigError> {
        let build = |entries: &[MapEntry]| {
            IdMap::from_ranges(entries.iter().map(|e| e.0))
                .map_err(|e| ConfigError::Invalid(e.to_string()))
        };
        Ok((build(&self.uid_map)?, build(&self.gid_map)?))
    }

    pub fn persist_table(&self) -> Result<PersistTable, ConfigError> {
        let mut table = PersistTable::default();
        for (name, path) in &self.persist {
            let kind = NsKind::from_str(name).map_err(ConfigError::Invalid)?;
            table[kind.index()] = Some(path.clone());
        }
        Ok(table)
    }
}
