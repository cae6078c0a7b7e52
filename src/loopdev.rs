//! Attaching an image to a loop device.
//!
//! erofs wants a block device.  We ask `/dev/loop-control` for a free device and configure it
//! read-only with `LO_FLAGS_AUTOCLEAR`: the kernel detaches the backing file once the last
//! reference goes away.  Before mounting, that's our descriptor; after mounting, it's the mount.
//! Dropping a [`LoopDevice`] closes the descriptor and therefore releases it, whether or not the
//! mount succeeded.

#![allow(unsafe_code)]

use std::{
    ffi::{c_int, c_void},
    fs::{File, OpenOptions},
    io::{Error, Result},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use log::debug;
use rustix::{
    io::Errno,
    ioctl::{ioctl, opcode, Ioctl, IoctlOutput, Opcode, Setter},
};

// LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR
const ATTACH_FLAGS: u32 = 1 | 4;

// another process can claim the free device before we configure it
const ATTACH_ATTEMPTS: usize = 8;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

#[repr(C)]
#[derive(Default)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

// LOOP_CTL_GET_FREE returns the device number as the ioctl's return value
struct LoopCtlGetFree;

unsafe impl Ioctl for LoopCtlGetFree {
    type Output = c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> Opcode {
        LOOP_CTL_GET_FREE
    }

    fn as_ptr(&mut self) -> *mut c_void {
        std::ptr::null_mut()
    }

    unsafe fn output_from_ptr(
        out: IoctlOutput,
        _ptr: *mut c_void,
    ) -> rustix::io::Result<c_int> {
        Ok(out)
    }
}

const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);
const LOOP_CONFIGURE: Opcode = opcode::write::<LoopConfig>(0x4C, 0x0A);

/// A configured loop device.
///
/// The device is autoclear, so there is nothing to undo on drop: closing `_fd` drops our reference,
/// and the kernel detaches the image once no mount holds it either.
#[derive(Debug)]
pub struct LoopDevice {
    _fd: OwnedFd,
    path: PathBuf,
}

fn open_rw(path: impl AsRef<Path>) -> Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn configure(device: &File, image: BorrowedFd<'_>) -> rustix::io::Result<()> {
    let config = LoopConfig {
        fd: image.as_raw_fd() as u32,
        block_size: 4096,
        info: LoopInfo64 {
            lo_flags: ATTACH_FLAGS,
            ..Default::default()
        },
        ..Default::default()
    };
    unsafe { ioctl(device, Setter::<{ LOOP_CONFIGURE }, LoopConfig>::new(config)) }
}

impl LoopDevice {
    /// Attaches `image` to a free loop device, read-only.
    pub fn attach_ro(image: impl AsFd) -> Result<Self> {
        let control = open_rw("/dev/loop-control")?;

        let mut attempt = 1;
        loop {
            let number = unsafe { ioctl(&control, LoopCtlGetFree) }?;
            let path = PathBuf::from(format!("/dev/loop{number}"));
            let device = open_rw(&path)?;

            match configure(&device, image.as_fd()) {
                Ok(()) => {
                    debug!("attached {path:?}");
                    return Ok(Self {
                        _fd: device.into(),
                        path,
                    });
                }
                Err(Errno::BUSY) if attempt < ATTACH_ATTEMPTS => {
                    debug!("{path:?} was taken before we configured it, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(Error::from(err)),
            }
        }
    }

    /// The device node, e.g. `/dev/loop3`.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, thread};

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_loop_config_layout() {
        assert_eq!(size_of::<LoopInfo64>(), 232);
        assert_eq!(size_of::<LoopConfig>(), 304);
    }

    #[test]
    fn test_attach_directory() {
        // fails without access to /dev/loop-control, and with EINVAL for a directory otherwise
        let dir = tempfile::tempdir().unwrap();
        let fd = File::open(dir.path()).unwrap();
        assert!(LoopDevice::attach_ro(&fd).is_err());
    }

    #[test_with::root()]
    #[test]
    fn test_attach_concurrently() {
        let attached: Vec<PathBuf> = thread::scope(|s| {
            let threads: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let mut file = tempfile::tempfile().unwrap();
                        file.write_all(&[0u8; 4096]).unwrap();
                        let device = LoopDevice::attach_ro(&file).unwrap();
                        // holding the device keeps the number taken
                        let path = device.path().to_path_buf();
                        (device, path)
                    })
                })
                .collect();
            let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
            results.into_iter().map(|(_device, path)| path).collect()
        });

        let mut unique = attached.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), attached.len());
    }
}
