#![allow(unsafe_code)]

use std::{io::Error, os::fd::AsFd};

use rustix::{
    io::Errno,
    ioctl::{ioctl, opcode, Opcode, Setter, Updater},
};

use super::{EnableVerityError, MeasureVerityError, BLOCK_SIZE, HASH_ALG_SHA256, MAX_DIGEST_SIZE};

// See /usr/include/linux/fsverity.h
#[repr(C)]
#[derive(Debug)]
struct FsVerityEnableArg {
    version: u32,
    hash_algorithm: u32,
    block_size: u32,
    salt_size: u32,
    salt_ptr: u64,
    sig_size: u32,
    __reserved1: u32,
    sig_ptr: u64,
    __reserved2: [u64; 11],
}

// #define FS_IOC_ENABLE_VERITY    _IOW('f', 133, struct fsverity_enable_arg)
const FS_IOC_ENABLE_VERITY: Opcode = opcode::write::<FsVerityEnableArg>(b'f', 133);

/// Enable fsverity on the target file with SHA-256 and 4096 byte blocks.  This is a thin safe
/// wrapper for the underlying `ioctl` and hence all of its constraints apply: the file descriptor
/// must be `O_RDONLY` and no writable descriptors or mappings of the file may exist.
pub(super) fn fs_ioc_enable_verity(fd: impl AsFd) -> Result<(), EnableVerityError> {
    unsafe {
        match ioctl(
            fd,
            Setter::<{ FS_IOC_ENABLE_VERITY }, FsVerityEnableArg>::new(FsVerityEnableArg {
                version: 1,
                hash_algorithm: HASH_ALG_SHA256 as u32,
                block_size: BLOCK_SIZE,
                salt_size: 0,
                salt_ptr: 0,
                sig_size: 0,
                __reserved1: 0,
                sig_ptr: 0,
                __reserved2: [0; 11],
            }),
        ) {
            Err(Errno::NOTTY) | Err(Errno::OPNOTSUPP) => {
                Err(EnableVerityError::FilesystemNotSupported)
            }
            Err(Errno::EXIST) => Err(EnableVerityError::AlreadyEnabled),
            Err(Errno::TXTBSY) => Err(EnableVerityError::FileOpenedForWrite),
            Err(e) => Err(Error::from(e).into()),
            Ok(_) => Ok(()),
        }
    }
}

/// `struct fsverity_digest` followed by room for `N` bytes of digest.
#[repr(C)]
#[derive(Debug)]
struct FsVerityDigest<const N: usize> {
    digest_algorithm: u16,
    digest_size: u16,
    digest: [u8; N],
}

// #define FS_IOC_MEASURE_VERITY   _IORW('f', 134, struct fsverity_digest)
const FS_IOC_MEASURE_VERITY: Opcode = opcode::read_write::<FsVerityDigest<0>>(b'f', 134);

/// Measure the fsverity digest of the provided file descriptor.
///
/// We offer the kernel a `MAX_DIGEST_SIZE` buffer and return exactly as many bytes as it reports,
/// whatever algorithm the file was sealed with.
pub(super) fn fs_ioc_measure_verity(fd: impl AsFd) -> Result<Vec<u8>, MeasureVerityError> {
    let mut digest = FsVerityDigest::<MAX_DIGEST_SIZE> {
        digest_algorithm: 0,
        digest_size: MAX_DIGEST_SIZE as u16,
        digest: [0; MAX_DIGEST_SIZE],
    };

    let r = unsafe {
        ioctl(
            fd,
            Updater::<{ FS_IOC_MEASURE_VERITY }, FsVerityDigest<MAX_DIGEST_SIZE>>::new(&mut digest),
        )
    };
    match r {
        Ok(()) => match digest.digest.get(..digest.digest_size as usize) {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(MeasureVerityError::InvalidDigestSize {
                size: digest.digest_size,
            }),
        },
        Err(Errno::NODATA) => Err(MeasureVerityError::VerityMissing),
        Err(Errno::NOTTY | Errno::OPNOTSUPP) => Err(MeasureVerityError::FilesystemNotSupported),
        Err(Errno::OVERFLOW) => Err(MeasureVerityError::InvalidDigestSize {
            size: digest.digest_size,
        }),
        Err(e) => Err(Error::from(e).into()),
    }
}
