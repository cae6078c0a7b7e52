//! Reading a [`Tree`] from a directory on disk.

use std::{
    fs::{self, Metadata},
    io::{Error, ErrorKind},
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::Path,
};

use log::debug;
use walkdir::WalkDir;

use crate::{
    error::{Error as BlobError, Result},
    tree::{Node, NodeContent, RegularFile, Stat, Tree},
    INLINE_CONTENT_MAX,
};

fn stat(metadata: &Metadata) -> Stat {
    Stat {
        st_mode: metadata.mode() & 0o7777,
        st_uid: metadata.uid(),
        st_gid: metadata.gid(),
        st_mtim_sec: metadata.mtime(),
    }
}

fn node_content(path: &Path, metadata: &Metadata) -> std::io::Result<NodeContent> {
    let ft = metadata.file_type();
    Ok(if ft.is_dir() {
        NodeContent::Directory
    } else if ft.is_file() {
        let size = metadata.len();
        if size <= INLINE_CONTENT_MAX as u64 {
            let data = fs::read(path)?;
            if data.len() as u64 != size {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("{path:?} changed size while reading"),
                ));
            }
            NodeContent::Regular(RegularFile::Inline(data.into()))
        } else {
            NodeContent::Regular(RegularFile::External(size))
        }
    } else if ft.is_symlink() {
        NodeContent::Symlink(fs::read_link(path)?.into_os_string())
    } else if ft.is_fifo() {
        NodeContent::Fifo
    } else if ft.is_socket() {
        NodeContent::Socket
    } else if ft.is_char_device() {
        NodeContent::CharacterDevice(metadata.rdev())
    } else if ft.is_block_device() {
        NodeContent::BlockDevice(metadata.rdev())
    } else {
        return Err(Error::new(
            ErrorKind::Unsupported,
            format!("{path:?} has an unknown file type"),
        ));
    })
}

/// Reads the directory tree at `root` into a [`Tree`].
///
/// Symlinks are recorded, not followed.  Regular files of up to [`INLINE_CONTENT_MAX`] bytes are
/// read and stored inline; larger files are recorded as external references by size only.
/// Hardlinks are recorded as independent files and extended attributes are not captured.
pub fn read_tree(root: impl AsRef<Path>) -> Result<Tree> {
    let root = root.as_ref();
    let traversal = |path: &Path, source| BlobError::Traversal {
        path: path.to_path_buf(),
        source,
    };

    let root_metadata = fs::metadata(root).map_err(|e| traversal(root, e))?;
    if !root_metadata.is_dir() {
        return Err(traversal(
            root,
            Error::new(ErrorKind::InvalidInput, "layer root is not a directory"),
        ));
    }
    let mut tree = Tree::new(stat(&root_metadata));

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            traversal(&path, e.into())
        })?;
        let path = entry.path();
        let metadata = entry.metadata().map_err(|e| traversal(path, e.into()))?;
        let content = node_content(path, &metadata).map_err(|e| traversal(path, e))?;
        let relative = path
            .strip_prefix(root)
            .map_err(|e| traversal(path, Error::other(e)))?;

        tree.insert(
            relative,
            Node {
                stat: stat(&metadata),
                content,
            },
        )
        .map_err(|e| traversal(path, e))?;
    }

    debug!("read {} entries from {root:?}", tree.len());
    Ok(tree)
}
