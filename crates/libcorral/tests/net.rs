use libcorral::net::{NicKind, NicSpec};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_parse_and_print() {
        let nic: NicSpec = "sb0:macvlan:eth0".parse().expect("parse macvlan");
        assert_eq!(nic.name, "sb0");
        assert_eq!(nic.kind, NicKind::Macvlan);
        assert_eq!(nic.link.as_deref(), Some("eth0"));
        assert_eq!(nic.to_string(), "sb0:macvlan:eth0");

        let nic: NicSpec = "lo0:dummy".parse().expect("parse dummy");
        assert_eq!(nic.kind, NicKind::Dummy);
        assert_eq!(nic.link, None);
        assert_eq!(nic.to_string(), "lo0:dummy");
    }

    #[test]
    fn vlan_kinds_require_a_host_link() {
        assert!("sb0:macvlan".parse::<NicSpec>().is_err());
        assert!("sb0:ipvlan".parse::<NicSpec>().is_err());
        assert!("sb0:ipvlan:eth0".parse::<NicSpec>().is_ok());
    }

    #[test]
    fn junk_specs_are_rejected() {
        assert!("".parse::<NicSpec>().is_err());
        assert!("sb0".parse::<NicSpec>().is_err());
        assert!("sb0:bridge".parse::<NicSpec>().is_err());
        assert!("sb0:macvlan:eth0:extra".parse::<NicSpec>().is_err());
        assert!(
            "averyveryverylongname:dummy".parse::<NicSpec>().is_err(),
            "IFNAMSIZ applies"
        );
    }
}
