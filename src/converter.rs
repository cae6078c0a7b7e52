//! Running the external dumpfile → erofs converter.
//!
//! The converter reads the dumpfile on stdin and writes the image through a file descriptor that
//! we pass down to it.  The descriptor always lands at [`DESTINATION_FD`] in the child, so the
//! converter is told to write to `/proc/self/fd/3`.  Its stderr is shared with ours and its stdout
//! is discarded.

#![allow(unsafe_code)]

use std::{
    ffi::OsString,
    io::{self, ErrorKind},
    mem::ManuallyDrop,
    os::{
        fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::process::CommandExt,
    },
    path::Path,
    process::{ChildStdin, Command, ExitStatus, Stdio},
};

use log::debug;
use rustix::io::{dup2, fcntl_setfd, FdFlags};
use thiserror::Error;

use crate::util::proc_self_fd_num;

/// The descriptor number at which the destination file appears in the converter process.
pub const DESTINATION_FD: RawFd = 3;

/// Running the converter failed.
#[derive(Error, Debug)]
pub enum ConverterError {
    #[error("failed to spawn converter")]
    Spawn(#[source] io::Error),
    #[error("failed to stream input to converter")]
    Stream(#[source] io::Error),
    #[error("failed to wait for converter")]
    Wait(#[source] io::Error),
    #[error("converter failed: {0}")]
    Exit(ExitStatus),
}

/// An invocation of an external converter with one extra file descriptor.
#[derive(Debug)]
pub struct Converter<'fd> {
    program: &'fd Path,
    args: Vec<OsString>,
    destination: Option<BorrowedFd<'fd>>,
}

impl<'fd> Converter<'fd> {
    pub fn new(program: &'fd Path) -> Self {
        Self {
            program,
            args: vec![],
            destination: None,
        }
    }

    /// The arguments for converting a dumpfile on stdin into an image written to `destination`:
    /// `--from-file - /proc/self/fd/3`.
    pub fn mkcomposefs(program: &'fd Path, destination: BorrowedFd<'fd>) -> Self {
        Self::new(program)
            .arg("--from-file")
            .arg("-")
            .arg(proc_self_fd_num(DESTINATION_FD))
            .destination(destination)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Passes `fd` to the child as [`DESTINATION_FD`].
    ///
    /// The descriptor is borrowed only for as long as the converter runs; the caller keeps
    /// ownership and decides when to close it.
    pub fn destination(mut self, fd: BorrowedFd<'fd>) -> Self {
        self.destination = Some(fd);
        self
    }

    /// Spawns the converter, feeds its stdin from `write_input` and waits for it to exit.
    ///
    /// Stdin is closed as soon as `write_input` returns, even if it fails, and the child is always
    /// reaped.  A non-zero exit status takes precedence over a failure to write the input, since a
    /// converter that bails out early usually causes the latter.
    pub fn run(
        self,
        write_input: impl FnOnce(&mut ChildStdin) -> io::Result<()>,
    ) -> Result<(), ConverterError> {
        let mut command = Command::new(self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        if let Some(fd) = self.destination {
            let raw = fd.as_raw_fd();
            // SAFETY: the closure only calls async-signal-safe functions, and `raw` stays open in
            // the parent for the lifetime of `self`, which outlives the spawn.
            unsafe {
                command.pre_exec(move || install_fd(raw, DESTINATION_FD));
            }
        }

        debug!("running {:?} {:?}", self.program, self.args);
        let mut child = command.spawn().map_err(ConverterError::Spawn)?;

        let streamed = match child.stdin.take() {
            Some(mut stdin) => write_input(&mut stdin),
            None => Err(io::Error::new(ErrorKind::BrokenPipe, "stdin was not captured")),
        };

        let status = child.wait().map_err(ConverterError::Wait)?;
        if !status.success() {
            return Err(ConverterError::Exit(status));
        }
        streamed.map_err(ConverterError::Stream)
    }
}

/// Makes `fd` available as `slot` across exec.  Runs in the child between fork and exec.
fn install_fd(fd: RawFd, slot: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is open in the child, since it was open in the parent at fork time.
    let source = unsafe { BorrowedFd::borrow_raw(fd) };
    if fd == slot {
        // dup2() would be a no-op and leave O_CLOEXEC set
        fcntl_setfd(source, FdFlags::empty())?;
    } else {
        // dup2() replaces whatever is at `slot` and gives the copy a clear O_CLOEXEC flag.  We
        // mustn't close it again on the way out, hence the ManuallyDrop.
        let mut target = ManuallyDrop::new(unsafe { OwnedFd::from_raw_fd(slot) });
        dup2(source, &mut target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, fs::File, io::Write, os::fd::AsFd};

    use similar_asserts::assert_eq;

    use super::*;

    fn shell<'fd>(script: &str) -> Converter<'fd> {
        Converter::new(Path::new("/bin/sh"))
            .arg("-c")
            .arg(script)
            .arg("converter")
    }

    #[test]
    fn test_mkcomposefs_args() {
        let file = tempfile::tempfile().unwrap();
        let converter = Converter::mkcomposefs(Path::new("mkcomposefs"), file.as_fd());
        assert_eq!(converter.args, ["--from-file", "-", "/proc/self/fd/3"]);
        assert!(converter.destination.is_some());
    }

    #[test]
    fn test_stdin_reaches_destination() {
        let dir = tempfile::tempdir().unwrap();
        let output = File::create(dir.path().join("out")).unwrap();

        shell(r#"cat > "$1""#)
            .arg(proc_self_fd_num(DESTINATION_FD))
            .destination(output.as_fd())
            .run(|stdin| stdin.write_all(b"hello from stdin\n"))
            .unwrap();
        drop(output);

        assert_eq!(
            fs::read_to_string(dir.path().join("out")).unwrap(),
            "hello from stdin\n"
        );
    }

    #[test]
    fn test_exit_status() {
        let err = shell("exit 3").run(|_| Ok(())).unwrap_err();
        let ConverterError::Exit(status) = &err else {
            panic!("expected an exit status error, got {err:?}");
        };
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn test_exit_status_beats_stream_error() {
        let err = shell("exit 1")
            .run(|_| Err(io::Error::from(ErrorKind::BrokenPipe)))
            .unwrap_err();
        assert!(matches!(err, ConverterError::Exit(..)));
    }

    #[test]
    fn test_stream_error() {
        let err = shell("cat > /dev/null")
            .run(|_| Err(io::Error::other("serializer broke")))
            .unwrap_err();
        assert!(
            matches!(err, ConverterError::Stream(ref e) if e.to_string() == "serializer broke")
        );
    }

    #[test]
    fn test_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = Converter::new(&missing).run(|_| Ok(())).unwrap_err();
        assert!(matches!(err, ConverterError::Spawn(..)));
    }
}
