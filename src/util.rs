//! Shared utility functions.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run blocking filesystem work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}
