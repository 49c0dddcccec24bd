use libcorral::config::{ConfigError, MapEntry, SandboxConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use libcorral::nspersist::NsKind;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        write!(file, "{json}").expect("Failed to write config");
        file.flush().expect("Failed to flush");
        file
    }

    #[test]
    fn full_config_parses() {
        let file = write_config(
            r#"
            {
                "command": ["/bin/sh", "-c", "id"],
                "hostname": "sb",
                "uid-map": ["0:1000:1", "1:100000:65536"],
                "gid-map": ["0:1000:1"],
                "persist": {"net": "/run/corral/net", "user": "/run/corral/user"},
                "share-net": false,
                "nics": ["sb0:macvlan:eth0", "lo0:dummy"],
                "cgroup": true
            }"#,
        );

        let cfg = SandboxConfig::load(file.path()).expect("Failed to parse config");
        assert_eq!(cfg.command, vec!["/bin/sh", "-c", "id"]);
        assert_eq!(cfg.hostname.as_deref(), Some("sb"));
        assert_eq!(cfg.uid_map.len(), 2);
        assert_eq!(cfg.uid_map[1].0.outer, 100000);
        assert!(cfg.cgroup);

        let (uid, gid) = cfg.desired_maps().expect("desired maps");
        assert_eq!(uid.count(), Some(65537));
        assert_eq!(gid.count(), Some(1));

        let table = cfg.persist_table().expect("persist table");
        assert_eq!(
            table[NsKind::Net.index()],
            Some(PathBuf::from("/run/corral/net"))
        );
        assert_eq!(table[NsKind::Mnt.index()], None);
    }

    #[test]
    fn defaults_are_empty() {
        let file = write_config("{}");
        let cfg = SandboxConfig::load(file.path()).expect("empty config is fine");
        assert!(cfg.command.is_empty());
        assert!(!cfg.cgroup);
        assert!(!cfg.share_net);
        assert!(cfg.desired_maps().expect("maps").0.is_empty());
    }

    #[test]
    fn unknown_namespace_names_are_rejected() {
        let file = write_config(r#"{"persist": {"mount": "/run/x"}}"#);
        let err = SandboxConfig::load(file.path()).expect_err("mnt, not mount");
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn nics_conflict_with_a_shared_network() {
        let file = write_config(r#"{"share-net": true, "nics": ["sb0:dummy"]}"#);
        let err = SandboxConfig::load(file.path()).expect_err("nowhere to put the nic");
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn malformed_map_entries_are_rejected() {
        let file = write_config(r#"{"uid-map": ["0:1000"]}"#);
        let err = SandboxConfig::load(file.path()).expect_err("two fields only");
        assert!(matches!(err, ConfigError::Json(_)), "{err}");
    }

    #[test]
    fn map_entries_round_trip_through_text() {
        let entry: MapEntry = "7:100000:65536".parse().expect("parse entry");
        assert_eq!(entry.0.inner, 7);
        assert_eq!(entry.0.outer, 100000);
        assert_eq!(entry.0.length, 65536);
        assert_eq!(entry.to_string(), "7:100000:65536");
        assert!("1:2:3:4".parse::<MapEntry>().is_err());
        assert!("one:2:3".parse::<MapEntry>().is_err());
    }
}
