//! Building a sealed `composefs.blob`.
//!
//! The image is written by `mkcomposefs` through a write-only descriptor that we create
//! exclusively and lend to it.  Before lending it out, we reopen the file read-only via
//! `/proc/self/fd`.  Once the converter is done, the write descriptor is closed and fs-verity is
//! enabled through the read-only one: the kernel refuses to enable verity while writers exist, and
//! afterwards refuses new writers, so the image can't change under whoever mounts it.
//!
//! The handle types make that order the only one possible: [`PendingBlob::finish()`] consumes the
//! blob, closing the write side, and only the [`UnsealedBlob`] it returns can be sealed.

use std::{
    fs::DirBuilder,
    io::{BufWriter, Write},
    os::{
        fd::{AsFd, BorrowedFd, OwnedFd},
        unix::fs::DirBuilderExt,
    },
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rustix::fs::{open, openat, Mode, OFlags, CWD};

use crate::{
    converter::Converter,
    digests::VerityDigests,
    error::{Error, Result},
    fsverity::{enable_verity, EnableVerityError},
    helper::{mkcomposefs_helper, HelperLocator},
    tree::TreeDescriptor,
    util::proc_self_fd,
};

/// File name of the image inside its directory.
pub const BLOB_NAME: &str = "composefs.blob";

/// The location of the image for the layer data directory `dir`.
pub fn blob_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(BLOB_NAME)
}

/// A newly created, still writable image file.
///
/// Holds two independent descriptors for the same inode: the write-only one that the converter
/// fills in, and a read-only one opened through `/proc/self/fd` which carries no write access.
#[derive(Debug)]
pub struct PendingBlob {
    path: PathBuf,
    write: OwnedFd,
    read: OwnedFd,
}

impl PendingBlob {
    /// Creates `path`, failing if it already exists.  An existing image is never touched.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let write = openat(
            CWD,
            path.as_path(),
            OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o644),
        )
        .map_err(|e| Error::Io {
            context: "failed to open output file",
            path: path.clone(),
            source: e.into(),
        })?;

        // Reopen rather than dup(): a dup would share the O_WRONLY open file description
        let read = open(
            proc_self_fd(&write),
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| Error::Io {
            context: "failed to reopen output file",
            path: path.clone(),
            source: e.into(),
        })?;

        Ok(Self { path, write, read })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The write-only descriptor, to be handed to the converter.
    pub fn writer(&self) -> BorrowedFd<'_> {
        self.write.as_fd()
    }

    /// Closes the write-only descriptor.
    pub fn finish(self) -> UnsealedBlob {
        let Self { path, write, read } = self;
        drop(write);
        UnsealedBlob { path, read }
    }
}

/// A fully written image with no writable descriptors left in this process.
#[derive(Debug)]
pub struct UnsealedBlob {
    path: PathBuf,
    read: OwnedFd,
}

impl UnsealedBlob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enables fs-verity on the image and closes the last descriptor.
    ///
    /// Returns `Ok(false)` if the filesystem doesn't support fs-verity: the image is still usable,
    /// just not sealed, so this only produces a warning.  Every other failure is an error.
    pub fn seal(self) -> Result<bool> {
        match enable_verity(&self.read) {
            Ok(()) => {
                debug!("sealed {:?}", self.path);
                Ok(true)
            }
            Err(EnableVerityError::FilesystemNotSupported) => {
                warn!(
                    "failed to enable verity for {:?}: {}",
                    self.path,
                    EnableVerityError::FilesystemNotSupported
                );
                Ok(false)
            }
            Err(source) => Err(Error::EnableVerity {
                path: self.path,
                source,
            }),
        }
    }
}

/// Drives `mkcomposefs` to turn a tree description and its digests into a sealed image.
#[derive(Debug)]
pub struct BlobBuilder<'a> {
    helper: &'a HelperLocator,
}

impl Default for BlobBuilder<'static> {
    fn default() -> Self {
        Self::with_helper(mkcomposefs_helper())
    }
}

impl<'a> BlobBuilder<'a> {
    /// Uses the converter found by `helper` instead of the process-wide `mkcomposefs`.
    pub fn with_helper(helper: &'a HelperLocator) -> Self {
        Self { helper }
    }

    /// Writes `<dest_dir>/composefs.blob` from `tree` and `digests` and seals it.
    ///
    /// `dest_dir` is created (mode 0700) if needed.  The image must not exist yet.  If the
    /// converter fails, the partially written image is left behind for inspection; removing it
    /// before trying again is up to the caller.
    pub fn build(
        &self,
        digests: &VerityDigests,
        tree: &(impl TreeDescriptor + ?Sized),
        dest_dir: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let dest_dir = dest_dir.as_ref();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dest_dir)
            .map_err(|source| Error::Io {
                context: "failed to create directory",
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let helper = self.helper.locate()?;

        let pending = PendingBlob::create(blob_path(dest_dir))?;
        debug!("writing {:?} with {helper:?}", pending.path());

        Converter::mkcomposefs(helper, pending.writer())
            .run(|stdin| {
                let mut writer = BufWriter::new(stdin);
                tree.write_dump(digests, &mut writer)?;
                writer.flush()
            })
            .map_err(|source| Error::Converter {
                helper: helper.to_path_buf(),
                source,
            })?;

        let unsealed = pending.finish();
        let path = unsealed.path().to_path_buf();
        unsealed.seal()?;
        Ok(path)
    }
}

/// Builds `<dest_dir>/composefs.blob` using `mkcomposefs` from `$PATH`.
pub fn build_blob(
    digests: &VerityDigests,
    tree: &(impl TreeDescriptor + ?Sized),
    dest_dir: impl AsRef<Path>,
) -> Result<PathBuf> {
    BlobBuilder::default().build(digests, tree, dest_dir)
}

#[cfg(test)]
mod tests {
    use std::{
        fs::{self, File, OpenOptions},
        io::ErrorKind,
        os::unix::fs::PermissionsExt,
    };

    use rustix::io::{write, Errno};
    use similar_asserts::assert_eq;
    use tempfile::tempdir_in;

    use crate::{
        converter::ConverterError,
        fsverity::{measure_verity_hex, EnableVerityError},
        test::tempdir,
        tree::{Stat, Tree},
    };

    use super::*;

    static SH: HelperLocator = HelperLocator::new("sh");
    static MISSING: HelperLocator = HelperLocator::new("composefs-blob-missing-converter");

    fn tree() -> Tree {
        let mut tree = Tree::new(Stat {
            st_mode: 0o755,
            ..Default::default()
        });
        tree.insert_file("a.txt", Stat::default(), b"hello").unwrap();
        tree
    }

    #[test]
    fn test_blob_path() {
        assert_eq!(
            blob_path("/var/lib/layer"),
            PathBuf::from("/var/lib/layer/composefs.blob")
        );
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = blob_path(dir.path());
        fs::write(&path, "existing image").unwrap();

        let err = PendingBlob::create(&path).unwrap_err();
        let Error::Io { ref source, .. } = err else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!(source.kind(), ErrorKind::AlreadyExists);
        assert_eq!(fs::read_to_string(&path).unwrap(), "existing image");
    }

    #[test]
    fn test_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = blob_path(dir.path());
        let pending = PendingBlob::create(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o111, 0);

        assert_eq!(write(pending.writer(), b"data").unwrap(), 4);
        assert_eq!(write(&pending.read, b"data").unwrap_err(), Errno::BADF);

        let unsealed = pending.finish();
        assert_eq!(unsealed.path(), path);
        assert_eq!(fs::read_to_string(&path).unwrap(), "data");
    }

    #[test_with::path(/dev/shm)]
    #[test]
    fn test_seal_unsupported() {
        let dir = tempdir_in("/dev/shm").unwrap();
        let pending = PendingBlob::create(blob_path(dir.path())).unwrap();
        assert!(!pending.finish().seal().unwrap());
    }

    #[test]
    fn test_seal() {
        let dir = tempdir();
        let path = blob_path(dir.path());
        let pending = PendingBlob::create(&path).unwrap();
        write(pending.writer(), b"hello world").unwrap();
        assert!(pending.finish().seal().unwrap());

        let file = File::open(&path).unwrap();
        assert_eq!(
            measure_verity_hex(&file).unwrap(),
            "1e2eaa4202d750a41174ee454970b92c1bc2f925b1e35076d8c7d5f56362ba64"
        );
        // sealed files can't be opened for writing anymore
        assert!(OpenOptions::new().write(true).open(&path).is_err());
    }

    #[test]
    fn test_seal_with_other_writer() {
        let dir = tempdir();
        let path = blob_path(dir.path());
        let pending = PendingBlob::create(&path).unwrap();
        write(pending.writer(), b"hello world").unwrap();
        let _other = OpenOptions::new().write(true).open(&path).unwrap();

        let err = pending.finish().seal().unwrap_err();
        assert!(matches!(
            err,
            Error::EnableVerity {
                source: EnableVerityError::FileOpenedForWrite,
                ref path,
            } if path == &blob_path(dir.path())
        ));
        assert_eq!(
            err.to_string(),
            format!("failed to enable verity for {}", path.display())
        );
    }

    #[test]
    fn test_missing_helper() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("layer/composefs");

        let err = BlobBuilder::with_helper(&MISSING)
            .build(&VerityDigests::new(), &tree(), &dest)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));

        // the directory is created, but nothing else is written
        assert!(dest.is_dir());
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
        assert_eq!(
            fs::metadata(&dest).unwrap().permissions().mode() & 0o777,
            0o700
        );
    }

    #[test]
    fn test_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = blob_path(dir.path());
        fs::write(&path, "existing image").unwrap();

        let err = BlobBuilder::with_helper(&SH)
            .build(&VerityDigests::new(), &tree(), dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "existing image");
    }

    #[test]
    fn test_converter_failure_leaves_partial_image() {
        let dir = tempfile::tempdir().unwrap();

        // sh rejects `--from-file` and exits non-zero
        let err = BlobBuilder::with_helper(&SH)
            .build(&VerityDigests::new(), &tree(), dir.path())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Converter {
                source: ConverterError::Exit(..),
                ..
            }
        ));
        assert!(blob_path(dir.path()).exists());
    }
}
