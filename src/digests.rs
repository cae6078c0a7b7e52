//! Computing the fs-verity digests of every regular file in a layer.

use std::{
    collections::BTreeMap,
    fs::File,
    io::Error as IoError,
    path::{Path, PathBuf},
};

use log::debug;
use walkdir::WalkDir;

use crate::{
    error::{Error, Result},
    fsverity::{ensure_verity, measure_verity_hex},
};

/// Hex-encoded fs-verity digests keyed by path relative to the layer root.
pub type VerityDigests = BTreeMap<PathBuf, String>;

/// Enables fs-verity on every regular file under `root` and returns the measured digests.
///
/// The walk is sequential and doesn't follow symlinks.  Directories, symlinks, devices and other
/// non-regular entries are skipped.  Files that already have verity enabled are measured as they
/// are.  Any failure to walk, open, enable or measure aborts the whole operation; no partial
/// mapping is ever returned.
///
/// The filesystem holding `root` must support fs-verity: unlike sealing the final image,
/// "unsupported" is an error here since there is no digest to record without it.
pub fn compute_digests(root: impl AsRef<Path>) -> Result<VerityDigests> {
    let root = root.as_ref();
    let mut digests = VerityDigests::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::Traversal {
            path: e.path().unwrap_or(root).to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let file = File::open(path).map_err(|source| Error::Traversal {
            path: path.to_path_buf(),
            source,
        })?;
        ensure_verity(&file).map_err(|source| Error::EnableVerity {
            path: path.to_path_buf(),
            source,
        })?;
        let digest = measure_verity_hex(&file).map_err(|source| Error::MeasureVerity {
            path: path.to_path_buf(),
            source,
        })?;

        let relative = path
            .strip_prefix(root)
            .map_err(|e| Error::Traversal {
                path: path.to_path_buf(),
                source: IoError::other(e),
            })?
            .to_path_buf();
        debug!("{relative:?} has verity {digest}");
        digests.insert(relative, digest);
    }

    Ok(digests)
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink};

    use similar_asserts::assert_eq;

    use crate::{
        fsverity::EnableVerityError,
        test::tempdir,
    };

    use super::*;

    #[test]
    fn test_compute_digests() {
        let dir = tempdir();
        let root = dir.path();
        fs::write(root.join("a.txt"), "hello world").unwrap();
        fs::create_dir_all(root.join("sub/empty")).unwrap();
        fs::write(root.join("sub/b"), "hello world").unwrap();
        symlink("../a.txt", root.join("sub/link")).unwrap();

        let digests = compute_digests(root).unwrap();

        let hello = "1e2eaa4202d750a41174ee454970b92c1bc2f925b1e35076d8c7d5f56362ba64";
        assert_eq!(
            digests,
            VerityDigests::from([
                (PathBuf::from("a.txt"), hello.to_string()),
                (PathBuf::from("sub/b"), hello.to_string()),
            ])
        );

        // every file is sealed now; a second walk measures the same digests
        assert_eq!(compute_digests(root).unwrap(), digests);
    }

    #[test]
    fn test_compute_digests_open_for_write() {
        let dir = tempdir();
        let path = dir.path().join("busy");
        let _writer = File::create(&path).unwrap();

        let err = compute_digests(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::EnableVerity {
                source: EnableVerityError::FileOpenedForWrite,
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            format!("failed to enable verity for {}", path.display())
        );
    }

    #[test]
    fn test_compute_digests_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            compute_digests(&missing).unwrap_err(),
            Error::Traversal { path, .. } if path == missing
        ));
    }

    #[test_with::path(/dev/shm)]
    #[test]
    fn test_compute_digests_unsupported() {
        let dir = tempfile::tempdir_in("/dev/shm").unwrap();
        fs::write(dir.path().join("file"), "data").unwrap();

        assert!(matches!(
            compute_digests(dir.path()).unwrap_err(),
            Error::EnableVerity {
                source: EnableVerityError::FilesystemNotSupported,
                ..
            }
        ));
    }

    #[test_with::path(/dev/shm)]
    #[test]
    fn test_compute_digests_no_regular_files() {
        let dir = tempfile::tempdir_in("/dev/shm").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        symlink("nowhere", dir.path().join("dangling")).unwrap();

        // nothing to seal, so even a filesystem without verity is fine
        assert_eq!(compute_digests(dir.path()).unwrap(), VerityDigests::new());
    }
}
