//! Mounting a `composefs.blob` read-only.

use std::{ffi::CStr, path::Path};

use log::info;
use rustix::{
    fs::{open, Mode, OFlags},
    mount::{mount, MountFlags},
};

use crate::{
    blob::blob_path,
    error::{Error, Result},
    header::{read_flags, COMPOSEFS_FLAGS_HAS_ACL},
    loopdev::LoopDevice,
};

/// The erofs mount options for an image with or without POSIX ACLs.
pub fn mount_options(has_acl: bool) -> &'static CStr {
    if has_acl {
        c"ro"
    } else {
        c"ro,noacl"
    }
}

/// Mounts the erofs image at `image` on `mountpoint`.
///
/// The image is attached to a read-only loop device and mounted read-only, with `noacl` unless
/// its header says it was built with ACLs.  The loop device is released again if anything fails;
/// on success the mount keeps it alive until it is unmounted.
pub fn mount_blob(image: impl AsRef<Path>, mountpoint: impl AsRef<Path>) -> Result<()> {
    let image = image.as_ref();
    let mountpoint = mountpoint.as_ref();

    let fd = open(image, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty()).map_err(|e| {
        Error::Io {
            context: "failed to open image",
            path: image.to_path_buf(),
            source: e.into(),
        }
    })?;

    let device = LoopDevice::attach_ro(&fd).map_err(|source| Error::LoopDevice {
        path: image.to_path_buf(),
        source,
    })?;

    let has_acl = read_flags(&fd, image)?.get() & COMPOSEFS_FLAGS_HAS_ACL.get() != 0;
    let options = mount_options(has_acl);

    mount(
        device.path(),
        mountpoint,
        c"erofs",
        MountFlags::RDONLY,
        Some(options),
    )
    .map_err(|e| Error::Mount {
        device: device.path().to_path_buf(),
        target: mountpoint.to_path_buf(),
        source: e.into(),
    })?;

    info!(
        "mounted {image:?} on {mountpoint:?} via {:?} ({})",
        device.path(),
        options.to_string_lossy()
    );
    Ok(())
}

/// Mounts `<dir>/composefs.blob` on `mountpoint`.
pub fn mount_blob_dir(dir: impl AsRef<Path>, mountpoint: impl AsRef<Path>) -> Result<()> {
    mount_blob(blob_path(dir), mountpoint)
}
