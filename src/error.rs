//! Errors returned by the blob pipeline.
//!
//! Every variant names the file (and where it matters, the stage) that failed so that the caller
//! can tell a missing `mkcomposefs` apart from a filesystem without fs-verity or a broken image.
//! Nothing in this crate retries; a failed build may leave a partial `composefs.blob` behind and
//! removing it is up to the caller.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    converter::ConverterError,
    fsverity::{EnableVerityError, MeasureVerityError},
};

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The external converter can't be found.  This outcome is cached for the whole process.
    #[error("failed to find {helper}")]
    Configuration {
        helper: &'static str,
        #[source]
        source: which::Error,
    },
    /// Walking, opening or reading a file of the layer failed.
    #[error("failed to walk {}", .path.display())]
    Traversal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to enable verity for {}", .path.display())]
    EnableVerity {
        path: PathBuf,
        #[source]
        source: EnableVerityError,
    },
    #[error("failed to measure verity for {}", .path.display())]
    MeasureVerity {
        path: PathBuf,
        #[source]
        source: MeasureVerityError,
    },
    /// Creating the destination directory or the image file failed.
    #[error("{context} {}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to convert dumpfile to erofs with {}", .helper.display())]
    Converter {
        helper: PathBuf,
        #[source]
        source: ConverterError,
    },
    #[error("failed to read flags from {}", .path.display())]
    ReadHeader {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read flags from {}: got {read} of 4 bytes", .path.display())]
    ShortHeader { path: PathBuf, read: usize },
    #[error("failed to attach {} to a loop device", .path.display())]
    LoopDevice {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to mount {} on {}", .device.display(), .target.display())]
    Mount {
        device: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
}
