//! Shared utility functions.

use std::path::{Path, PathBuf};

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run synchronous work (git, filesystem) off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// True when `path` equals or lies under any of `scopes`.
///
/// An empty scope list covers nothing.
pub fn within_scope(path: &Path, scopes: &[PathBuf]) -> bool {
    scopes.iter().any(|scope| path.starts_with(scope))
}

/// True when two scope lists claim a common path prefix. An empty list
/// stands for the whole tree and overlaps everything.
pub fn scopes_overlap(a: &[PathBuf], b: &[PathBuf]) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a.iter()
        .any(|x| b.iter().any(|y| x.starts_with(y) || y.starts_with(x)))
}
