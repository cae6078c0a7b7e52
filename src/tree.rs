//! Descriptions of the file tree that goes into a composefs blob.
//!
//! The blob builder doesn't care how the tree is represented: anything implementing
//! [`TreeDescriptor`] can be serialized together with a digest mapping into the dumpfile stream
//! that `mkcomposefs` reads.  [`Tree`] is the representation this crate ships.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{digests::VerityDigests, dumpfile::write_dumpfile, INLINE_CONTENT_MAX};

/// Something that can describe a file tree to `mkcomposefs`.
///
/// Implementations write the tree, with each external regular file referencing its entry in
/// `digests`, to `writer`.  The output is streamed straight into the converter's stdin, so it
/// should be produced incrementally rather than buffered in full.
pub trait TreeDescriptor {
    fn write_dump(&self, digests: &VerityDigests, writer: &mut dyn Write) -> io::Result<()>;
}

/// Ownership, permissions and modification time of a tree node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    /// Permission bits only; the file type comes from [`NodeContent`].
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_mtim_sec: i64,
}

/// How a regular file's data is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegularFile {
    /// The content is small enough to be stored in the image itself.
    Inline(Box<[u8]>),
    /// The content lives outside of the image; only the size is recorded here.  The image refers
    /// to it by its relative path and its fs-verity digest.
    External(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    Directory,
    Regular(RegularFile),
    Symlink(OsString),
    Fifo,
    Socket,
    CharacterDevice(u64),
    BlockDevice(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub stat: Stat,
    pub content: NodeContent,
}

/// A file tree, keyed by path relative to the root of the layer.
///
/// The root directory itself has the empty path.  Paths sort component-wise, so a directory is
/// always visited before any of its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    nodes: BTreeMap<PathBuf, Node>,
}

impl Tree {
    /// Creates a tree containing only a root directory with the given metadata.
    pub fn new(root: Stat) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            PathBuf::new(),
            Node {
                stat: root,
                content: NodeContent::Directory,
            },
        );
        Self { nodes }
    }

    /// Adds (or replaces) a node.  The parent directory of `path` must already be present.
    pub fn insert(&mut self, path: impl Into<PathBuf>, node: Node) -> io::Result<()> {
        let path = path.into();
        if path.is_absolute() || path.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{path:?} is not a relative path"),
            ));
        }

        let parent = path.parent().unwrap_or(Path::new(""));
        match self.nodes.get(parent) {
            Some(Node {
                content: NodeContent::Directory,
                ..
            }) => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("parent directory of {path:?} is not in the tree"),
                ))
            }
        }

        self.nodes.insert(path, node);
        Ok(())
    }

    /// Convenience for adding a regular file, stored inline if it is small enough.
    pub fn insert_file(
        &mut self,
        path: impl Into<PathBuf>,
        stat: Stat,
        content: &[u8],
    ) -> io::Result<()> {
        let content = if content.len() <= INLINE_CONTENT_MAX {
            RegularFile::Inline(content.into())
        } else {
            RegularFile::External(content.len() as u64)
        };
        self.insert(
            path,
            Node {
                stat,
                content: NodeContent::Regular(content),
            },
        )
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&Node> {
        self.nodes.get(path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, parents before children.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Node)> {
        self.nodes.iter().map(|(path, node)| (path.as_path(), node))
    }

    /// Number of immediate subdirectories of every directory that has any, in a single pass.
    pub(crate) fn subdirectory_counts(&self) -> BTreeMap<&Path, usize> {
        let mut counts = BTreeMap::new();
        for (path, node) in &self.nodes {
            if let (NodeContent::Directory, Some(parent)) = (&node.content, path.parent()) {
                *counts.entry(parent).or_insert(0) += 1;
            }
        }
        counts
    }
}

impl TreeDescriptor for Tree {
    fn write_dump(&self, digests: &VerityDigests, writer: &mut dyn Write) -> io::Result<()> {
        write_dumpfile(writer, self, digests)
    }
}
