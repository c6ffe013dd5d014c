use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;

mod manager;
pub use manager::*;

mod store;
pub use store::*;

#[derive(Debug, Error)]
pub enum Error {
    /// The backing store could not be read while loading a resource for the first time.
    #[error("resource `{name}` cannot be read from `{}`", path.display())]
    NotFound {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The resource is not currently held by anyone.
    #[error("resource `{0}` is not loaded")]
    NotLoaded(String),
    /// The background read could not complete.
    #[error(transparent)]
    Task(#[from] crate::task::Error),
}

/// Backing store interface.
///
/// A read-only byte store resources are loaded from, addressed by paths relative to its root.
pub trait BackingStore: Send + Sync + Debug {
    /// Whether `path` can be read from this store.
    fn exists(&self, path: &Path) -> bool;

    /// Read the full contents at `path`.
    fn read(&self, path: &Path) -> io::Result<Bytes>;
}
