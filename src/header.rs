//! Reading the composefs header at the start of an image.
//!
//! `mkcomposefs` prefixes the erofs image with a small header.  The only part we care about is the
//! flags word, which tells us whether the image carries POSIX ACLs and therefore whether it can be
//! mounted with `noacl`.

use std::{mem::offset_of, os::fd::AsFd, path::Path};

use rustix::{
    fs::{open, Mode, OFlags},
    io::pread,
};
use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

pub const COMPOSEFS_MAGIC: U32 = U32::new(0xd078629a);

pub const COMPOSEFS_FLAGS_HAS_ACL: U32 = U32::new(1 << 0);

#[derive(Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ComposefsHeader {
    pub magic: U32,
    pub version: U32,
    pub flags: U32,
    pub composefs_version: U32,
    pub unused: [U32; 4],
}

/// Byte offset of the flags word in the image.
pub const FLAGS_OFFSET: u64 = offset_of!(ComposefsHeader, flags) as u64;

/// Reads the flags word from an open image.
///
/// The magic and version are not checked: anything that is long enough has flags.  Fewer than
/// four bytes at the flags offset is reported as [`Error::ShortHeader`].
pub fn read_flags(fd: impl AsFd, path: &Path) -> Result<U32> {
    let mut flags = U32::ZERO;
    let buf = flags.as_mut_bytes();

    let mut filled = 0;
    while filled < buf.len() {
        let n = pread(&fd, &mut buf[filled..], FLAGS_OFFSET + filled as u64).map_err(|e| {
            Error::ReadHeader {
                path: path.to_path_buf(),
                source: e.into(),
            }
        })?;
        if n == 0 {
            return Err(Error::ShortHeader {
                path: path.to_path_buf(),
                read: filled,
            });
        }
        filled += n;
    }

    Ok(flags)
}

/// Whether the image at `path` was built with POSIX ACLs.
pub fn has_acl(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let fd = open(path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()).map_err(|e| {
        Error::ReadHeader {
            path: path.to_path_buf(),
            source: e.into(),
        }
    })?;

    let flags = read_flags(&fd, path)?;
    Ok(flags.get() & COMPOSEFS_FLAGS_HAS_ACL.get() != 0)
}
