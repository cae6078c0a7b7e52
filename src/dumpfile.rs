//! Writing the composefs dumpfile format.
//!
//! This is the text format read by `mkcomposefs --from-file`.  Each line describes one inode:
//!
//! ```text
//! PATH SIZE MODE NLINK UID GID RDEV MTIME PAYLOAD CONTENT DIGEST
//! ```
//!
//! Parents must appear before their children.  Regular files either carry their content inline or
//! name a payload (the path of the backing file relative to the layer) plus its fs-verity digest.

use std::{
    fmt,
    io::{self, Write},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use rustix::fs::FileType;

use crate::{
    digests::VerityDigests,
    tree::{Node, NodeContent, RegularFile, Stat, Tree},
};

fn write_empty(writer: &mut impl fmt::Write) -> fmt::Result {
    writer.write_str("-")
}

fn write_escaped(writer: &mut impl fmt::Write, bytes: &[u8]) -> fmt::Result {
    if bytes.is_empty() {
        return write_empty(writer);
    }

    for c in bytes {
        let c = *c;

        if c < b'!' || c == b'=' || c == b'\\' || c > b'~' {
            write!(writer, "\\x{c:02x}")?;
        } else {
            writer.write_char(c as char)?;
        }
    }

    Ok(())
}

/// The fields of one dumpfile line that vary by file type.
struct Entry<'a> {
    ifmt: FileType,
    size: u64,
    nlink: usize,
    rdev: u64,
    payload: &'a [u8],
    content: &'a [u8],
    digest: Option<&'a str>,
}

impl<'a> Entry<'a> {
    fn leaf(ifmt: FileType) -> Self {
        Self {
            ifmt,
            size: 0,
            nlink: 1,
            rdev: 0,
            payload: &[],
            content: &[],
            digest: None,
        }
    }
}

fn write_entry(writer: &mut impl fmt::Write, path: &Path, stat: &Stat, entry: Entry) -> fmt::Result {
    let Entry {
        ifmt,
        size,
        nlink,
        rdev,
        payload,
        content,
        digest,
    } = entry;
    let mode = (stat.st_mode & 0o7777) | ifmt.as_raw_mode();
    let uid = stat.st_uid;
    let gid = stat.st_gid;
    let mtim_sec = stat.st_mtim_sec;

    write_escaped(writer, Path::new("/").join(path).as_os_str().as_bytes())?;
    write!(
        writer,
        " {size} {mode:o} {nlink} {uid} {gid} {rdev} {mtim_sec}.0 "
    )?;
    write_escaped(writer, payload)?;
    write!(writer, " ")?;
    write_escaped(writer, content)?;
    write!(writer, " ")?;
    if let Some(digest) = digest {
        write!(writer, "{digest}")
    } else {
        write_empty(writer)
    }
}

/// Formats the dumpfile line for a single node.
///
/// `subdirs` is only consulted for directories, whose link count is 2 plus the number of
/// subdirectories (this is also true for the root, since its `..` points at itself).
pub fn write_node(
    writer: &mut impl fmt::Write,
    path: &Path,
    node: &Node,
    subdirs: usize,
    digests: &VerityDigests,
) -> fmt::Result {
    let entry = match &node.content {
        NodeContent::Directory => Entry {
            nlink: 2 + subdirs,
            ..Entry::leaf(FileType::Directory)
        },
        NodeContent::Regular(RegularFile::Inline(data)) => Entry {
            size: data.len() as u64,
            content: data,
            ..Entry::leaf(FileType::RegularFile)
        },
        NodeContent::Regular(RegularFile::External(size)) => Entry {
            size: *size,
            payload: path.as_os_str().as_bytes(),
            digest: digests.get(path).map(String::as_str),
            ..Entry::leaf(FileType::RegularFile)
        },
        NodeContent::Symlink(target) => Entry {
            size: target.as_bytes().len() as u64,
            payload: target.as_bytes(),
            ..Entry::leaf(FileType::Symlink)
        },
        NodeContent::Fifo => Entry::leaf(FileType::Fifo),
        NodeContent::Socket => Entry::leaf(FileType::Socket),
        NodeContent::CharacterDevice(rdev) => Entry {
            rdev: *rdev,
            ..Entry::leaf(FileType::CharacterDevice)
        },
        NodeContent::BlockDevice(rdev) => Entry {
            rdev: *rdev,
            ..Entry::leaf(FileType::BlockDevice)
        },
    };

    write_entry(writer, path, &node.stat, entry)
}

/// Writes `tree` in dumpfile format, looking up the digest of every external regular file in
/// `digests` by its relative path.
///
/// Lines are written one at a time so that a slow reader on the other end of a pipe never forces
/// the whole dump into memory.
pub fn write_dumpfile(
    writer: &mut (impl Write + ?Sized),
    tree: &Tree,
    digests: &VerityDigests,
) -> io::Result<()> {
    let subdir_counts = tree.subdirectory_counts();
    let mut line = String::with_capacity(256);
    for (path, node) in tree.iter() {
        line.clear();
        let subdirs = match node.content {
            NodeContent::Directory => subdir_counts.get(path).copied().unwrap_or(0),
            _ => 0,
        };
        write_node(&mut line, path, node, subdirs, digests).map_err(io::Error::other)?;
        writeln!(writer, "{line}")?;
    }
    Ok(())
}
