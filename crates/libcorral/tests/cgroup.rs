use libcorral::cgroup::{EVENTS_LINE_MAX, ephemeral_name, events_show_empty};

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn populated_zero_terminates() {
        assert!(events_show_empty("populated 0\nfrozen 0\n".as_bytes()).expect("scan"));
    }

    #[test]
    fn a_populated_cgroup_keeps_waiting() {
        assert!(!events_show_empty("populated 1\nfrozen 0\n".as_bytes()).expect("scan"));
    }

    #[test]
    fn field_order_does_not_matter() {
        // The kernel does not promise an ordering, and unrelated fields may
        // toggle in the same wake.
        assert!(events_show_empty("frozen 1\npopulated 0\n".as_bytes()).expect("scan"));
        assert!(events_show_empty("populated 0\nfrozen 1\n".as_bytes()).expect("scan"));
    }

    #[test]
    fn an_empty_snapshot_keeps_waiting() {
        assert!(!events_show_empty("".as_bytes()).expect("scan"));
    }

    #[test]
    fn a_final_line_without_newline_still_counts() {
        assert!(events_show_empty("populated 0".as_bytes()).expect("scan"));
    }

    #[test]
    fn an_overlong_line_is_a_protocol_error() {
        let mut text = "x".repeat(EVENTS_LINE_MAX + 10);
        text.push('\n');
        let err = events_show_empty(text.as_bytes()).expect_err("line too long");
        assert!(err.to_string().contains("longer than"), "{err}");
    }

    #[test]
    fn ephemeral_names_embed_the_root_pid() {
        assert_eq!(ephemeral_name(Pid::from_raw(1234)), "corral.1234");
    }
}
