use libcorral::helper::{read_ok, read_pid, write_ok, write_pid};

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
    use nix::unistd::{Pid, write};
    use std::os::unix::io::AsFd;

    fn pair() -> (std::os::unix::io::OwnedFd, std::os::unix::io::OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .expect("socketpair")
    }

    #[test]
    fn pid_round_trips() {
        let (left, right) = pair();
        write_pid(left.as_fd(), Pid::from_raw(4321)).expect("send pid");
        let pid = read_pid(right.as_fd()).expect("read pid");
        assert_eq!(pid, Some(Pid::from_raw(4321)));
    }

    #[test]
    fn truncated_pid_reads_as_peer_death() {
        let (left, right) = pair();
        write(&left, &[0x39, 0x05]).expect("write a partial pid");
        drop(left);
        let pid = read_pid(right.as_fd()).expect("short read is not an error");
        assert_eq!(pid, None, "a truncated pid means the peer died");
    }

    #[test]
    fn ok_token_round_trips() {
        let (left, right) = pair();
        write_ok(left.as_fd()).expect("send sentinel");
        assert!(read_ok(right.as_fd()).expect("read sentinel"));
    }

    #[test]
    fn eof_before_the_sentinel_is_not_ok() {
        let (left, right) = pair();
        drop(left);
        assert!(!read_ok(right.as_fd()).expect("eof reads as false"));
    }

    #[test]
    fn a_wrong_sentinel_is_a_protocol_error() {
        let (left, right) = pair();
        write(&left, b"NOPE").expect("write bogus token");
        let err = read_ok(right.as_fd()).expect_err("token mismatch");
        assert!(err.to_string().contains("sync token"), "{err}");
    }
}
