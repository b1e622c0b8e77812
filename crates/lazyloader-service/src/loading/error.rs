use std::time::Duration;

use thiserror::Error;

/// The reason a load did not produce a value.
///
/// One outcome is shared with every caller waiting on the same item, so the error is cheap to
/// clone and a loader's own error is kept only in its rendered form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// No loader is registered for the requested resource type.
    #[error("no loader registered for type `{0}`")]
    NoLoaderRegistered(String),
    /// A single attempt did not settle within its timeout.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// The loader itself returned an error.
    ///
    /// The attached string is the loader's error including its chain of causes.
    #[error("{0}")]
    LoaderFailed(String),
    /// The item was cleared while a caller was waiting for it.
    #[error("item `{0}` is not tracked anymore")]
    ItemNotFound(String),
}

impl LoadError {
    /// Captures the error returned by a loader function.
    pub fn from_loader<E: Into<anyhow::Error>>(error: E) -> Self {
        Self::LoaderFailed(format!("{:#}", error.into()))
    }

    /// A short, stable name of the variant, used to tag metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NoLoaderRegistered(_) => "noloader",
            Self::Timeout(_) => "timeout",
            Self::LoaderFailed(_) => "loaderfailed",
            Self::ItemNotFound(_) => "notfound",
        }
    }
}

/// The outcome of a load: either the loaded value or the terminal [`LoadError`].
pub type LoadResult<T> = Result<T, LoadError>;
