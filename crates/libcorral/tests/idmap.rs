use libcorral::idmap::{
    IdKind, IdMap, IdRange, MAX_USER_MAPPINGS, MapError, Owner, SortKey, generate, parse_proc_map,
    parse_subids, resolve,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn range(inner: u32, outer: u32, length: u32) -> IdRange {
        IdRange {
            inner,
            outer,
            length,
        }
    }

    fn map(ranges: &[(u32, u32, u32)]) -> IdMap {
        IdMap::from_ranges(ranges.iter().map(|&(i, o, l)| range(i, o, l)))
            .expect("build test map")
    }

    fn owner(id: u32, name: Option<&str>) -> Owner {
        Owner {
            id,
            name: name.map(str::to_owned),
        }
    }

    // The identity /proc/self/uid_map of a process in the initial namespace.
    fn full_map() -> IdMap {
        map(&[(0, 0, u32::MAX)])
    }

    #[test]
    fn default_map_pins_caller_and_consumes_subids() {
        let subids = parse_subids("1000:100000:65536\n", &owner(1000, None), "/etc/subuid")
            .expect("parse subuid");
        let text = resolve(IdKind::Uid, &IdMap::new(), &subids, &full_map(), 1000)
            .expect("resolve default map");
        assert_eq!(text, "0 1000 1\n1 100000 65536\n");
    }

    #[test]
    fn desired_outside_subids_is_rejected() {
        let subids = parse_subids("1000:100000:65536\n", &owner(1000, None), "/etc/subuid")
            .expect("parse subuid");
        let desired = map(&[(0, 0, 1), (1, 1, 10)]);
        let err = resolve(IdKind::Uid, &desired, &subids, &full_map(), 1000)
            .expect_err("ids 0..11 are not delegated");
        assert!(matches!(err, MapError::NotAllowed { kind: IdKind::Uid, .. }));
        assert!(
            err.to_string()
                .contains("not in the uids allowed in /etc/subuid"),
            "unexpected message: {err}"
        );
    }

    #[test]
    fn desired_contained_in_subids_keeps_its_count() {
        let subids = parse_subids("1000:100000:65536\n", &owner(1000, None), "/etc/subuid")
            .expect("parse subuid");
        let desired = map(&[(0, 1000, 1), (1, 100000, 100)]);
        let text = resolve(IdKind::Uid, &desired, &subids, &full_map(), 1000)
            .expect("desired is fully delegated");
        assert_eq!(text, "0 1000 1\n1 100000 100\n");
        let parsed = parse_proc_map(&text).expect("reparse");
        assert_eq!(parsed.count(), desired.count());
    }

    #[test]
    fn resolve_translates_through_the_callers_own_map() {
        // Caller lives in a namespace where its view 0..65536 is host
        // 200000..265536; subids are expressed in the caller's view.
        let cur = map(&[(0, 200000, 65536)]);
        let subids = parse_subids("7:1000:100\n", &owner(7, None), "/etc/subuid")
            .expect("parse subuid");
        let text =
            resolve(IdKind::Uid, &IdMap::new(), &subids, &cur, 7).expect("resolve nested map");
        assert_eq!(text, "0 200007 1\n1 201000 100\n");
    }

    #[test]
    fn gid_errors_name_the_gid_files() {
        let subids =
            parse_subids("1000:100000:10\n", &owner(1000, None), "/etc/subgid").expect("parse");
        let desired = map(&[(0, 4000, 5)]);
        let err = resolve(IdKind::Gid, &desired, &subids, &full_map(), 1000)
            .expect_err("gid 4000 is not delegated");
        assert!(
            err.to_string()
                .contains("not in the gids allowed in /etc/subgid"),
            "unexpected message: {err}"
        );
    }

    #[test]
    fn normalize_leaves_disjoint_inner_ranges() {
        let mut m = map(&[(10, 500, 5), (0, 100, 5), (20, 900, 3)]);
        m.normalize(SortKey::Inner, false).expect("normalize");
        let ranges = m.ranges();
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                let a_end = a.inner as u64 + a.length as u64;
                assert!(
                    (b.inner as u64) >= a_end,
                    "ranges {a:?} and {b:?} share inner ids"
                );
            }
        }
        assert_eq!(ranges[0].inner, 0);
        assert_eq!(ranges[2].inner, 20);
    }

    #[test]
    fn normalize_rejects_overlap_without_merge() {
        let mut m = map(&[(0, 1000, 5), (3, 2000, 5)]);
        let err = m.normalize(SortKey::Inner, false).expect_err("inner overlap");
        assert!(matches!(err, MapError::Overlapping));
    }

    #[test]
    fn normalize_merges_contiguous_translations() {
        let mut m = map(&[(0, 1000, 5), (5, 1005, 5), (10, 3000, 2)]);
        m.normalize(SortKey::Inner, true).expect("normalize");
        assert_eq!(
            m.ranges(),
            &[range(0, 1000, 10), range(10, 3000, 2)],
            "first two ranges describe one translation"
        );
    }

    #[test]
    fn normalize_drops_duplicates_and_zero_lengths() {
        let mut m = IdMap::new();
        m.push(range(0, 1000, 4)).expect("push");
        m.push(range(0, 1000, 4)).expect("push duplicate");
        m.push(range(9, 9, 0)).expect("zero length is dropped");
        m.normalize(SortKey::Inner, false).expect("normalize");
        assert_eq!(m.ranges(), &[range(0, 1000, 4)]);
    }

    // compose(a, b): a view translating a's outer space directly into b's
    // inner space, built from the two projection primitives.
    fn compose(a: &IdMap, b: &IdMap) -> IdMap {
        a.invert().project(b).expect("compose").invert()
    }

    #[test]
    fn projection_composes() {
        let m = map(&[(0, 1000, 10)]);
        let a = map(&[(500, 995, 8), (600, 1003, 100)]);
        let b = map(&[(0, 500, 200), (1000, 0, 100)]);

        let mut two_steps = m.project(&a).expect("m through a").project(&b).expect("then b");
        let mut one_step = m.project(&compose(&a, &b)).expect("m through compose");
        two_steps.normalize(SortKey::Inner, true).expect("normalize");
        one_step.normalize(SortKey::Inner, true).expect("normalize");
        assert_eq!(two_steps, one_step);
    }

    #[test]
    fn projection_clips_and_relocates() {
        let m = map(&[(0, 1000, 10)]);
        let view = map(&[(5000, 1004, 2)]);
        let projected = m.project(&view).expect("project");
        assert_eq!(projected.ranges(), &[range(4, 5000, 2)]);
    }

    #[test]
    fn format_then_parse_round_trips() {
        let mut m = map(&[(1, 100000, 65536), (0, 1000, 1)]);
        m.normalize(SortKey::Inner, false).expect("normalize");
        let text = m.format().expect("format");
        let mut reparsed = parse_proc_map(&text).expect("parse");
        reparsed.normalize(SortKey::Inner, false).expect("normalize");
        assert_eq!(m, reparsed);
    }

    #[test]
    fn count_overflow_is_a_sentinel() {
        let m = map(&[(0, 0, u32::MAX), (0, 0, 1)]);
        assert_eq!(m.count(), None);
        assert_eq!(map(&[(0, 0, u32::MAX)]).count(), Some(u32::MAX));
    }

    #[test]
    fn range_cap_is_enforced() {
        let err = IdMap::from_ranges((0..=MAX_USER_MAPPINGS as u32).map(|i| range(i, i, 1)))
            .expect_err("one range too many");
        assert!(matches!(err, MapError::TooManyRanges));
    }

    #[test]
    fn subids_match_by_number_or_name() {
        let text = "\
# subordinate uids
alice:100000:1000

1000:200000:500
bob:300000:100
";
        let by_both = parse_subids(text, &owner(1000, Some("alice")), "/etc/subuid")
            .expect("parse");
        assert_eq!(
            by_both.ranges(),
            &[range(0, 100000, 1000), range(0, 200000, 500)]
        );

        let by_number_only =
            parse_subids(text, &owner(1000, None), "/etc/subuid").expect("parse");
        assert_eq!(by_number_only.ranges(), &[range(0, 200000, 500)]);
    }

    #[test]
    fn malformed_subid_lines_fail_the_parse() {
        for bad in ["1000:abc:10", "1000:5", "1000:5:6:7"] {
            let err = parse_subids(bad, &owner(1000, None), "/etc/subuid")
                .expect_err("malformed line");
            assert!(matches!(err, MapError::MalformedSubid { line: 1, .. }), "{bad}: {err}");
        }
    }

    #[test]
    fn subid_range_past_the_id_space_is_rejected() {
        let err = parse_subids("1000:4294967290:10\n", &owner(1000, None), "/etc/subuid")
            .expect_err("start + count overflows");
        assert!(matches!(err, MapError::SubidOverflow { line: 1, .. }));
    }

    #[test]
    fn proc_map_parse_rejects_junk() {
        assert!(parse_proc_map("0 0\n").is_err());
        assert!(parse_proc_map("0 0 many\n").is_err());
        assert!(parse_proc_map("         0          0 4294967295\n").is_ok());
    }

    #[test]
    fn generate_orders_inners_after_the_pinned_id() {
        let subids = map(&[(0, 100000, 10), (0, 300000, 5)]);
        let m = generate(IdKind::Uid, &subids, 1000).expect("generate");
        assert_eq!(
            m.ranges(),
            &[
                range(0, 1000, 1),
                range(1, 100000, 10),
                range(11, 300000, 5)
            ]
        );
    }
}
