//! fs-verity primitives: enabling verity on a file and measuring its digest.
//!
//! Both operations use fixed parameters: descriptor version 1, SHA-256, 4096 byte Merkle tree
//! blocks, no salt and no signature.

mod ioctl;

use std::{io::Error, os::fd::AsFd};

use thiserror::Error;

/// `FS_VERITY_HASH_ALG_SHA256`
pub const HASH_ALG_SHA256: u8 = 1;

/// Merkle tree block size passed to `FS_IOC_ENABLE_VERITY`.
pub const BLOCK_SIZE: u32 = 4096;

/// Size of the digest buffer offered to `FS_IOC_MEASURE_VERITY` (`FS_VERITY_MAX_DIGEST_SIZE`).
pub const MAX_DIGEST_SIZE: usize = 64;

/// Measuring fsverity failed.
#[derive(Error, Debug)] // can't derive PartialEq because of std::io::Error
pub enum MeasureVerityError {
    #[error("{0}")]
    Io(#[from] Error),
    #[error("fs-verity is not enabled on file")]
    VerityMissing,
    #[error("fs-verity is not supported by filesystem")]
    FilesystemNotSupported,
    #[error("Unexpected digest size {size}")]
    InvalidDigestSize { size: u16 },
}

/// Enabling fsverity failed.
#[derive(Error, Debug)]
pub enum EnableVerityError {
    #[error("{0}")]
    Io(#[from] Error),
    #[error("Filesystem does not support fs-verity")]
    FilesystemNotSupported,
    #[error("fs-verity is already enabled on file")]
    AlreadyEnabled,
    #[error("File is opened for writing")]
    FileOpenedForWrite,
}

/// Enable fs-verity on the given file.
///
/// This essentially boils down to the FS_IOC_ENABLE_VERITY ioctl.
///
/// The file must be stored on a filesystem which supports fs-verity.  The file descriptor must be
/// opened O_RDONLY and there must be no other writable file descriptors or mappings for the file.
///
/// Enabling verity a second time fails with [`EnableVerityError::AlreadyEnabled`].  See
/// [`ensure_verity()`] for the idempotent variant.
pub fn enable_verity(fd: impl AsFd) -> Result<(), EnableVerityError> {
    ioctl::fs_ioc_enable_verity(fd)
}

/// Enable fs-verity on the given file, treating "already enabled" as success.
pub fn ensure_verity(fd: impl AsFd) -> Result<(), EnableVerityError> {
    match enable_verity(fd) {
        Ok(()) | Err(EnableVerityError::AlreadyEnabled) => Ok(()),
        Err(other) => Err(other),
    }
}

/// Measures fs-verity on the given file.
///
/// This essentially boils down to the FS_IOC_MEASURE_VERITY ioctl.
///
/// If the file has fs-verity enabled then the digest of the fs-verity descriptor is returned in
/// lowercase hex.  Its length is whatever the kernel reports for the algorithm the file was sealed
/// with (64 characters for SHA-256).  In this case, the kernel guarantees that the file content
/// cannot possibly change for as long as the file descriptor exists.
///
/// If the file doesn't have fs-verity enabled then [`MeasureVerityError::VerityMissing`] is
/// returned, which is distinct from the error for filesystems that lack fs-verity entirely.
pub fn measure_verity_hex(fd: impl AsFd) -> Result<String, MeasureVerityError> {
    Ok(hex::encode(ioctl::fs_ioc_measure_verity(fd)?))
}
