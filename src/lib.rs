//! Build, seal and mount composefs blobs.
//!
//! A container storage layer can be materialised as a single erofs image instead of as a tree of
//! extracted files.  The pipeline is:
//!
//!  1. [`digests::compute_digests()`] enables fs-verity on every regular file of the layer and
//!     measures it;
//!  2. [`blob::BlobBuilder`] feeds a [`tree::TreeDescriptor`] plus those digests to
//!     `mkcomposefs`, which writes `composefs.blob` through a file descriptor that we hand it,
//!     and then seals the blob with fs-verity;
//!  3. [`header::has_acl()`] peeks at the composefs header to pick mount options;
//!  4. [`mount::mount_blob()`] attaches the blob to a loop device and mounts it read-only.

#![deny(unsafe_code)]

pub mod blob;
pub mod converter;
pub mod digests;
pub mod dumpfile;
pub mod error;
pub mod fs;
pub mod fsverity;
pub mod header;
pub mod helper;
pub mod loopdev;
pub mod mount;
pub mod tree;
pub mod util;


pub use error::{Error, Result};

/// Regular files that contain 64 or fewer bytes may be stored inline in the erofs image.  Anything
/// larger is referred to from the image by its relative path and fs-verity digest.
pub const INLINE_CONTENT_MAX: usize = 64;
