//! Asynchronous splat file loading with polling-style completion.
//!
//! The streaming core never waits on a load: it calls [`AssetLoader::load`]
//! and then polls [`AssetLoader::get_resource`] on later frames. Both may be
//! called redundantly; implementations deduplicate.
//!
//! Background tasks report back over a platform-agnostic `async_channel`,
//! which is drained on the calling thread whenever a resource is queried.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::error::Result;
use crate::fetch::Fetch;
use crate::resource::SplatResource;

/// Loader collaborator used by octrees to bring splat files in and out of memory.
pub trait AssetLoader {
    /// Request `url`. Repeated requests for an in-flight or loaded URL are no-ops.
    fn load(&self, url: &str);

    /// Drop `url`. Late completions of an unloaded request are discarded.
    fn unload(&self, url: &str);

    /// The loaded resource for `url`, if its load has completed.
    fn get_resource(&self, url: &str) -> Option<Arc<SplatResource>>;

    /// Number of requested resources that have not completed yet.
    fn pending_count(&self) -> usize;
}

type Completion = (String, u64, Result<SplatResource>);

enum Request {
    Loading { ticket: u64 },
    Ready(Arc<SplatResource>),
}

#[derive(Default)]
struct LoaderState {
    requests: HashMap<String, Request>,
    next_ticket: u64,
}

/// Loads splat files through a [`Fetch`] on a Tokio runtime.
///
/// Failed loads are logged and forgotten, so the next [`AssetLoader::load`]
/// for the same URL retries.
pub struct StreamingLoader {
    fetch: Arc<dyn Fetch>,
    runtime: tokio::runtime::Handle,
    completion_tx: async_channel::Sender<Completion>,
    completion_rx: async_channel::Receiver<Completion>,
    state: Mutex<LoaderState>,
}

impl StreamingLoader {
    /// Create a loader that spawns fetches onto `runtime`.
    #[must_use]
    pub fn new(fetch: Arc<dyn Fetch>, runtime: tokio::runtime::Handle) -> Self {
        let (completion_tx, completion_rx) = async_channel::unbounded();
        Self {
            fetch,
            runtime,
            completion_tx,
            completion_rx,
            state: Mutex::new(LoaderState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move finished background loads into the request table.
    fn drain_completions(&self, state: &mut LoaderState) {
        while let Ok((url, ticket, result)) = self.completion_rx.try_recv() {
            let current = matches!(
                state.requests.get(&url),
                Some(Request::Loading { ticket: t }) if *t == ticket
            );
            if !current {
                tracing::trace!(url, "discarding completion of unloaded request");
                continue;
            }

            match result {
                Ok(resource) => {
                    tracing::debug!(url, splats = resource.num_splats(), "loaded");
                    state
                        .requests
                        .insert(url, Request::Ready(Arc::new(resource)));
                }
                Err(e) => {
                    tracing::warn!(url, "load failed, will retry: {e}");
                    state.requests.remove(&url);
                }
            }
        }
    }
}

impl AssetLoader for StreamingLoader {
    fn load(&self, url: &str) {
        let mut state = self.state();
        if state.requests.contains_key(url) {
            return;
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state
            .requests
            .insert(url.to_string(), Request::Loading { ticket });
        drop(state);

        let fetch = Arc::clone(&self.fetch);
        let tx = self.completion_tx.clone();
        let url = url.to_string();
        self.runtime.spawn(async move {
            let result = match fetch.fetch(&url).await {
                Ok(bytes) => SplatResource::decode(&url, &bytes),
                Err(e) => Err(e),
            };
            let _ = tx.send((url, ticket, result)).await;
        });
    }

    fn unload(&self, url: &str) {
        if self.state().requests.remove(url).is_some() {
            tracing::debug!(url, "unloaded");
        }
    }

    fn get_resource(&self, url: &str) -> Option<Arc<SplatResource>> {
        let mut state = self.state();
        self.drain_completions(&mut state);
        match state.requests.get(url) {
            Some(Request::Ready(resource)) => Some(Arc::clone(resource)),
            _ => None,
        }
    }

    fn pending_count(&self) -> usize {
        let mut state = self.state();
        self.drain_completions(&mut state);
        state
            .requests
            .values()
            .filter(|r| matches!(r, Request::Loading { .. }))
            .count()
    }
}

/// A loader whose completions are supplied by the host.
///
/// Useful when files are decoded elsewhere (for instance by an engine's own
/// asset system): the host calls [`ManualLoader::complete`] when a file is
/// ready. Also records every request, which makes it the loader of choice in
/// tests.
#[derive(Default)]
pub struct ManualLoader {
    inner: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    requested: HashSet<String>,
    available: HashMap<String, Arc<SplatResource>>,
    load_calls: HashMap<String, usize>,
    unload_calls: HashMap<String, usize>,
}

impl ManualLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `resource` available under its URL. It is handed out once requested.
    pub fn complete(&self, resource: SplatResource) -> Arc<SplatResource> {
        let resource = Arc::new(resource);
        self.inner()
            .available
            .insert(resource.url().to_string(), Arc::clone(&resource));
        resource
    }

    /// Forget a previously completed resource, as if its load failed.
    pub fn fail(&self, url: &str) {
        self.inner().available.remove(url);
    }

    /// Whether `url` is currently requested.
    #[must_use]
    pub fn is_requested(&self, url: &str) -> bool {
        self.inner().requested.contains(url)
    }

    /// Number of `load` calls seen for `url`.
    #[must_use]
    pub fn load_calls(&self, url: &str) -> usize {
        self.inner().load_calls.get(url).copied().unwrap_or(0)
    }

    /// Number of `unload` calls seen for `url`.
    #[must_use]
    pub fn unload_calls(&self, url: &str) -> usize {
        self.inner().unload_calls.get(url).copied().unwrap_or(0)
    }
}

impl AssetLoader for ManualLoader {
    fn load(&self, url: &str) {
        let mut inner = self.inner();
        *inner.load_calls.entry(url.to_string()).or_default() += 1;
        inner.requested.insert(url.to_string());
    }

    fn unload(&self, url: &str) {
        let mut inner = self.inner();
        *inner.unload_calls.entry(url.to_string()).or_default() += 1;
        inner.requested.remove(url);
    }

    fn get_resource(&self, url: &str) -> Option<Arc<SplatResource>> {
        let inner = self.inner();
        if !inner.requested.contains(url) {
            return None;
        }
        inner.available.get(url).cloned()
    }

    fn pending_count(&self) -> usize {
        let inner = self.inner();
        inner
            .requested
            .iter()
            .filter(|url| !inner.available.contains_key(*url))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use glam::Vec3;

    use super::*;
    use crate::error::Error;
    use crate::fetch::FetchFuture;

    /// Serves fixed payloads from memory and fails every other URL.
    struct StaticFetch(HashMap<String, Vec<u8>>);

    impl Fetch for StaticFetch {
        fn fetch(&self, url: &str) -> FetchFuture<'_> {
            let result = self.0.get(url).cloned().ok_or_else(|| Error::HttpStatus {
                url: url.to_string(),
                status: 404,
            });
            Box::pin(async move { result })
        }
    }

    fn packed_center() -> Vec<u8> {
        [1.0f32, 2.0, 3.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    async fn wait_for(loader: &StreamingLoader, url: &str) -> Option<Arc<SplatResource>> {
        for _ in 0..200 {
            if let Some(resource) = loader.get_resource(url) {
                return Some(resource);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_loader_loads_and_dedups() {
        let fetch = StaticFetch(HashMap::from([("a.bin".to_string(), packed_center())]));
        let loader = StreamingLoader::new(Arc::new(fetch), tokio::runtime::Handle::current());

        loader.load("a.bin");
        loader.load("a.bin");
        let resource = wait_for(&loader, "a.bin").await.unwrap();
        assert_eq!(resource.centers()[0], Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(loader.pending_count(), 0);

        // A second load of a ready resource keeps the same instance.
        loader.load("a.bin");
        let again = loader.get_resource("a.bin").unwrap();
        assert!(Arc::ptr_eq(&resource, &again));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_loader_failure_allows_retry() {
        let loader = StreamingLoader::new(
            Arc::new(StaticFetch(HashMap::new())),
            tokio::runtime::Handle::current(),
        );

        loader.load("missing.bin");
        for _ in 0..200 {
            if loader.pending_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(loader.pending_count(), 0);
        assert!(loader.get_resource("missing.bin").is_none());

        // The failed request was forgotten, so loading again issues a new fetch.
        loader.load("missing.bin");
        assert!(loader.state().requests.contains_key("missing.bin"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_loader_unload_discards_late_completion() {
        let fetch = StaticFetch(HashMap::from([("a.bin".to_string(), packed_center())]));
        let loader = StreamingLoader::new(Arc::new(fetch), tokio::runtime::Handle::current());

        loader.load("a.bin");
        loader.unload("a.bin");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(loader.get_resource("a.bin").is_none());
        assert_eq!(loader.pending_count(), 0);
    }

    #[test]
    fn test_manual_loader() {
        let loader = ManualLoader::new();
        loader.complete(SplatResource::new("a.bin", vec![Vec3::ZERO]));

        // Not handed out until requested.
        assert!(loader.get_resource("a.bin").is_none());

        loader.load("a.bin");
        loader.load("b.bin");
        assert!(loader.get_resource("a.bin").is_some());
        assert_eq!(loader.pending_count(), 1);
        assert_eq!(loader.load_calls("a.bin"), 1);

        loader.unload("a.bin");
        assert!(loader.get_resource("a.bin").is_none());
        assert_eq!(loader.unload_calls("a.bin"), 1);
        assert!(!loader.is_requested("a.bin"));
    }
}
