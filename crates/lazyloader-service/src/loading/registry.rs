use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::{LoadError, LoadResult};

/// A type-erased loader function.
///
/// The token is cancelled once the item being loaded is cleared.
pub(super) type LoaderFn<T> =
    Arc<dyn Fn(String, CancellationToken) -> BoxFuture<'static, LoadResult<T>> + Send + Sync>;

/// Maps resource types to the functions loading them.
pub(super) struct LoaderRegistry<T> {
    loaders: RwLock<HashMap<String, LoaderFn<T>>>,
}

impl<T> Default for LoaderRegistry<T> {
    fn default() -> Self {
        Self {
            loaders: Default::default(),
        }
    }
}

impl<T> std::fmt::Debug for LoaderRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaders = self.loaders.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<_> = loaders.keys().collect();
        types.sort();
        f.debug_struct("LoaderRegistry")
            .field("types", &types)
            .finish()
    }
}

impl<T: Send + 'static> LoaderRegistry<T> {
    /// Registers `f` for `resource_type`, returning whether a previous loader was replaced.
    pub fn register<F, Fut, E>(&self, resource_type: &str, f: F) -> bool
    where
        F: Fn(String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let loader: LoaderFn<T> = Arc::new(move |id, token| {
            let future = f(id, token);
            Box::pin(async move { future.await.map_err(LoadError::from_loader) })
        });

        self.loaders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource_type.to_owned(), loader)
            .is_some()
    }

    pub fn get(&self, resource_type: &str) -> Option<LoaderFn<T>> {
        self.loaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_type)
            .cloned()
    }
}
