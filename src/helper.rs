//! Locating the external `mkcomposefs` converter.

use std::path::{Path, PathBuf};

use log::debug;
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};

/// Name of the executable that turns a dumpfile into an erofs image.
pub const MKCOMPOSEFS: &str = "mkcomposefs";

static MKCOMPOSEFS_HELPER: HelperLocator = HelperLocator::new(MKCOMPOSEFS);

/// Resolves an executable once and remembers the answer.
///
/// The lookup runs at most once for the lifetime of the locator, even with concurrent callers.
/// Failure is remembered too: if the executable is installed after the first lookup it will not
/// be noticed until the process restarts.
#[derive(Debug)]
pub struct HelperLocator {
    name: &'static str,
    resolved: OnceCell<which::Result<PathBuf>>,
}

impl HelperLocator {
    /// Creates a locator for `name`, which is looked up in `$PATH` unless it is a path itself.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            resolved: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the resolved path, performing the lookup on the first call only.
    pub fn locate(&self) -> Result<&Path> {
        let resolved = self.resolved.get_or_init(|| {
            let result = which::which(self.name);
            debug!("resolved {} to {result:?}", self.name);
            result
        });

        match resolved {
            Ok(path) => Ok(path),
            Err(err) => Err(Error::Configuration {
                helper: self.name,
                source: err.clone(),
            }),
        }
    }
}

/// The process-wide locator for `mkcomposefs`.
pub fn mkcomposefs_helper() -> &'static HelperLocator {
    &MKCOMPOSEFS_HELPER
}
