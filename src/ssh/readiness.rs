//! Socket readiness waits
//!
//! After a would-block return the library reports which directions it is
//! blocked on. We poll exactly those directions on the library-side socket,
//! bounded by the session timeout.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::types::BlockDirections;

/// Poll events for a set of block directions.
pub fn poll_flags(directions: BlockDirections) -> PollFlags {
    let mut flags = PollFlags::empty();
    if directions.inbound() {
        flags |= PollFlags::POLLIN;
    }
    if directions.outbound() {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

/// Wait until `fd` is ready for `directions`.
///
/// Returns the `poll(2)` result: 0 on timeout, positive when ready, negative
/// on error. Returns -1 at once when the handle (`directions`) or the
/// descriptor is missing. Never retries.
pub fn wait_socket(fd: Option<RawFd>, directions: Option<BlockDirections>, timeout: Duration) -> i32 {
    let (Some(fd), Some(directions)) = (fd, directions) else {
        return -1;
    };
    wait_fd(fd, poll_flags(directions), timeout)
}

/// Poll a single descriptor for readability.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> i32 {
    wait_fd(fd, PollFlags::POLLIN, timeout)
}

fn wait_fd(fd: RawFd, flags: PollFlags, timeout: Duration) -> i32 {
    if fd < 0 {
        return -1;
    }
    // SAFETY: the descriptor is owned by the session transport, which outlives this call.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(fd, flags)];
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
    match poll(&mut fds, timeout) {
        Ok(ready) => ready,
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_direction_mapping() {
        assert_eq!(poll_flags(BlockDirections::Inbound), PollFlags::POLLIN);
        assert_eq!(poll_flags(BlockDirections::Outbound), PollFlags::POLLOUT);
        assert_eq!(
            poll_flags(BlockDirections::Both),
            PollFlags::POLLIN | PollFlags::POLLOUT
        );
        assert!(poll_flags(BlockDirections::None).is_empty());
    }

    #[test]
    fn test_missing_handle_or_descriptor() {
        let timeout = Duration::from_millis(10);
        assert_eq!(wait_socket(None, Some(BlockDirections::Inbound), timeout), -1);
        assert_eq!(wait_socket(Some(3), None, timeout), -1);
        assert_eq!(wait_socket(Some(-1), Some(BlockDirections::Inbound), timeout), -1);
    }

    #[test]
    fn test_inbound_readiness() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let timeout = Duration::from_millis(50);

        assert_eq!(wait_socket(Some(fd), Some(BlockDirections::Inbound), timeout), 0);

        theirs.write_all(b"x").unwrap();
        assert_eq!(wait_socket(Some(fd), Some(BlockDirections::Inbound), timeout), 1);
        assert_eq!(wait_readable(fd, timeout), 1);
    }

    #[test]
    fn test_outbound_readiness() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let ready = wait_socket(
            Some(ours.as_raw_fd()),
            Some(BlockDirections::Outbound),
            Duration::from_millis(50),
        );
        assert_eq!(ready, 1);
    }
}
