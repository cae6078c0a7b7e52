use std::os::fd::{AsFd, AsRawFd, RawFd};

/// Formats a string like "/proc/self/fd/3" for the given fd.  This can be used to work with kernel
/// APIs that don't directly accept file descriptors, or to reopen a file with different flags.
///
/// This call never fails.
pub(crate) fn proc_self_fd(fd: impl AsFd) -> String {
    proc_self_fd_num(fd.as_fd().as_raw_fd())
}

/// Same as [`proc_self_fd()`] but for a raw fd number which may only exist in another process.
pub(crate) fn proc_self_fd_num(fd: RawFd) -> String {
    format!("/proc/self/fd/{fd}")
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_proc_self_fd() {
        let file = tempfile::tempfile().unwrap();
        let expected = format!("/proc/self/fd/{}", file.as_raw_fd());
        assert_eq!(proc_self_fd(&file), expected);
        assert_eq!(proc_self_fd_num(3), "/proc/self/fd/3");
    }
}
