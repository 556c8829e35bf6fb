//! Tile fetching and decoding with in-flight deduplication
//!
//! One load pipeline per tile file: RAM blob cache, then persistent
//! store, then the fetch backend with write-through. Concurrent loads
//! for the same file share a single pending result. A coarse global
//! cancel flag discards results at the completion boundary; it never
//! preempts a running fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::core::error::Error;
use crate::core::types::{BoxFuture, Result};
use crate::model::DecodedFragment;
use crate::store::TileStore;

/// Fetch backend boundary (network, local files, custom callbacks)
pub trait TileFetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Decoder boundary: binary tile payload to a render-ready fragment.
/// Runs inside the load task, off the control thread.
pub trait TileDecoder: Send + Sync + 'static {
    fn decode(&self, name: &str, bytes: &[u8], has_holes: bool) -> Result<DecodedFragment>;
}

/// Cooperative cancel switch shared between a loader and its owner.
///
/// A field on the owning component, not a process-wide static, so
/// independent streaming sessions do not interfere.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How one load settled
#[derive(Clone)]
pub enum LoadOutcome {
    Done(Arc<DecodedFragment>),
    Failed(Arc<Error>),
    /// Discarded at the completion boundary; the expected path after
    /// the cancel flag is raised, not a failure
    Cancelled,
}

impl std::fmt::Debug for LoadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadOutcome::Done(_) => write!(f, "Done"),
            LoadOutcome::Failed(error) => write!(f, "Failed({error})"),
            LoadOutcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

struct Inner {
    fetcher: Arc<dyn TileFetcher>,
    decoder: Arc<dyn TileDecoder>,
    store: Option<Arc<dyn TileStore>>,
    cancel: CancelFlag,
    max_ram_time: Duration,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<LoadOutcome>>>>,
    ram_cache: Mutex<HashMap<String, (Arc<Vec<u8>>, Instant)>>,
}

/// Deduplicating tile loader. Cheap to clone; clones share the
/// in-flight map and the cancel flag.
#[derive(Clone)]
pub struct TileLoader {
    inner: Arc<Inner>,
}

impl TileLoader {
    pub fn new(
        fetcher: Arc<dyn TileFetcher>,
        decoder: Arc<dyn TileDecoder>,
        store: Option<Arc<dyn TileStore>>,
        max_ram_time: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                decoder,
                store,
                cancel: CancelFlag::new(),
                max_ram_time,
                inflight: Mutex::new(HashMap::new()),
                ram_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The shared cancel switch. Raising it discards every in-flight
    /// load at its completion boundary.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.inner.cancel.clone()
    }

    /// Number of loads currently in flight
    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().unwrap().len()
    }

    /// Load and decode one tile file.
    ///
    /// A second call for a file already loading returns the same
    /// pending result instead of issuing a new fetch.
    pub async fn load(&self, name: &str, has_holes: bool) -> LoadOutcome {
        let mut rx = self.ensure_task(name, has_holes);
        loop {
            let settled = rx.borrow().clone();
            if let Some(outcome) = settled {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Task dropped without publishing (runtime shutdown)
                return LoadOutcome::Cancelled;
            }
        }
    }

    fn ensure_task(&self, name: &str, has_holes: bool) -> watch::Receiver<Option<LoadOutcome>> {
        let mut inflight = self.inner.inflight.lock().unwrap();
        if let Some(rx) = inflight.get(name) {
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        inflight.insert(name.to_string(), rx.clone());

        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            let outcome = run_load(&inner, &name, has_holes).await;
            inner.inflight.lock().unwrap().remove(&name);
            let _ = tx.send(Some(outcome));
        });
        rx
    }
}

async fn run_load(inner: &Inner, name: &str, has_holes: bool) -> LoadOutcome {
    let bytes = match acquire_bytes(inner, name).await {
        Ok(bytes) => bytes,
        Err(error) => return LoadOutcome::Failed(Arc::new(error)),
    };

    let fragment = match inner.decoder.decode(name, &bytes, has_holes) {
        Ok(fragment) => fragment,
        Err(error) => return LoadOutcome::Failed(Arc::new(error)),
    };

    // Cancel is checked once, immediately before the result would be
    // applied. Coarse-grained: one flag for all in-flight loads.
    if inner.cancel.is_set() {
        log::debug!("discarding cancelled load of {name}");
        return LoadOutcome::Cancelled;
    }

    LoadOutcome::Done(Arc::new(fragment))
}

/// RAM cache, then persistent store, then fetch with write-through
async fn acquire_bytes(inner: &Inner, name: &str) -> Result<Arc<Vec<u8>>> {
    if let Some(bytes) = ram_cache_get(inner, name) {
        return Ok(bytes);
    }

    if let Some(store) = &inner.store {
        match store.get(name).await {
            Ok(Some(bytes)) => {
                let bytes = Arc::new(bytes);
                ram_cache_put(inner, name, Arc::clone(&bytes));
                return Ok(bytes);
            }
            Ok(None) => {}
            Err(error) => {
                log::warn!("store read failed for {name}: {error}");
            }
        }
    }

    let bytes = Arc::new(inner.fetcher.fetch(name).await?);

    if let Some(store) = &inner.store {
        if let Err(error) = store.put(name, &bytes).await {
            log::warn!("store write-through failed for {name}: {error}");
        }
    }
    ram_cache_put(inner, name, Arc::clone(&bytes));
    Ok(bytes)
}

fn ram_cache_get(inner: &Inner, name: &str) -> Option<Arc<Vec<u8>>> {
    let mut cache = inner.ram_cache.lock().unwrap();
    let now = Instant::now();
    cache.retain(|_, (_, stored_at)| now.duration_since(*stored_at) <= inner.max_ram_time);
    cache.get(name).map(|(bytes, _)| Arc::clone(bytes))
}

fn ram_cache_put(inner: &Inner, name: &str, bytes: Arc<Vec<u8>>) {
    let mut cache = inner.ram_cache.lock().unwrap();
    cache.insert(name.to_string(), (bytes, Instant::now()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FragmentInstance, MeshData, MeshTopology};
    use crate::store::MemoryTileStore;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Fetcher that counts fetches and can hold them until released
    struct CountingFetcher {
        fetches: AtomicUsize,
        gate: Option<Arc<Notify>>,
        fail: bool,
    }

    impl CountingFetcher {
        fn new() -> Self {
            Self { fetches: AtomicUsize::new(0), gate: None, fail: false }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self { fetches: AtomicUsize::new(0), gate: Some(gate), fail: false }
        }

        fn count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl TileFetcher for CountingFetcher {
        fn fetch<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                if self.fail {
                    return Err(Error::TileFetch {
                        name: name.to_string(),
                        reason: "connection refused".into(),
                    });
                }
                Ok(name.as_bytes().to_vec())
            })
        }
    }

    struct StubDecoder;

    impl TileDecoder for StubDecoder {
        fn decode(&self, _name: &str, bytes: &[u8], _has_holes: bool) -> Result<DecodedFragment> {
            Ok(DecodedFragment {
                mesh: MeshData {
                    positions: vec![[bytes.len() as f32; 3]],
                    normals: vec![[0.0, 1.0, 0.0]],
                    indices: vec![],
                    topology: MeshTopology::Triangles,
                },
                instances: vec![FragmentInstance {
                    transform: glam::Mat4::IDENTITY,
                    color: [1.0; 4],
                }],
                bounding_box: crate::math::Aabb::default(),
            })
        }
    }

    fn loader_with(fetcher: Arc<CountingFetcher>, store: Option<Arc<dyn TileStore>>) -> TileLoader {
        TileLoader::new(fetcher, Arc::new(StubDecoder), store, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_load_success() {
        let fetcher = Arc::new(CountingFetcher::new());
        let loader = loader_with(Arc::clone(&fetcher), None);

        match loader.load("tile-1.bin", false).await {
            LoadOutcome::Done(fragment) => {
                assert_eq!(fragment.mesh.positions.len(), 1);
            }
            other => panic!("expected Done, got {other:?}"),
        }
        assert_eq!(fetcher.count(), 1);
        assert_eq!(loader.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch() {
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(CountingFetcher::gated(Arc::clone(&gate)));
        let loader = loader_with(Arc::clone(&fetcher), None);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = loader.clone();
            handles.push(tokio::spawn(async move { loader.load("tile-1.bin", false).await }));
        }
        // Let every caller reach the shared pending result, then release
        // the single gated fetch (notify_one stores the permit if the
        // fetch has not parked yet)
        tokio::task::yield_now().await;
        gate.notify_one();

        let mut fragments = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                LoadOutcome::Done(fragment) => fragments.push(fragment),
                other => panic!("expected Done, got {other:?}"),
            }
        }
        assert_eq!(fetcher.count(), 1);
        // Every caller got the same decoded fragment
        for fragment in &fragments[1..] {
            assert!(Arc::ptr_eq(&fragments[0], fragment));
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces() {
        let mut fetcher = CountingFetcher::new();
        fetcher.fail = true;
        let loader = loader_with(Arc::new(fetcher), None);

        match loader.load("tile-1.bin", false).await {
            LoadOutcome::Failed(error) => {
                assert!(matches!(&*error, Error::TileFetch { .. }));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_discards_at_completion() {
        let fetcher = Arc::new(CountingFetcher::new());
        let loader = loader_with(Arc::clone(&fetcher), None);

        loader.cancel_flag().set();
        match loader.load("tile-1.bin", false).await {
            LoadOutcome::Cancelled => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }

        // Clearing the flag makes the next load succeed
        loader.cancel_flag().clear();
        assert!(matches!(
            loader.load("tile-1.bin", false).await,
            LoadOutcome::Done(_)
        ));
    }

    #[tokio::test]
    async fn test_store_hit_skips_fetch() {
        let store: Arc<dyn TileStore> = Arc::new(MemoryTileStore::new());
        store.put("tile-1.bin", b"cached").await.unwrap();
        let fetcher = Arc::new(CountingFetcher::new());
        let loader = loader_with(Arc::clone(&fetcher), Some(store));

        assert!(matches!(
            loader.load("tile-1.bin", false).await,
            LoadOutcome::Done(_)
        ));
        assert_eq!(fetcher.count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_writes_through_to_store() {
        let store: Arc<dyn TileStore> = Arc::new(MemoryTileStore::new());
        let fetcher = Arc::new(CountingFetcher::new());
        let loader = loader_with(Arc::clone(&fetcher), Some(Arc::clone(&store)));

        loader.load("tile-1.bin", false).await;
        assert_eq!(
            store.get("tile-1.bin").await.unwrap().as_deref(),
            Some("tile-1.bin".as_bytes())
        );
        assert_eq!(fetcher.count(), 1);
    }

    #[tokio::test]
    async fn test_sequential_loads_refetch_without_store() {
        let fetcher = Arc::new(CountingFetcher::new());
        // RAM cache expires immediately
        let loader = TileLoader::new(Arc::clone(&fetcher) as Arc<dyn TileFetcher>, Arc::new(StubDecoder), None, Duration::ZERO);

        loader.load("tile-1.bin", false).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        loader.load("tile-1.bin", false).await;
        assert_eq!(fetcher.count(), 2);
    }

    #[tokio::test]
    async fn test_ram_cache_serves_repeat_loads() {
        let fetcher = Arc::new(CountingFetcher::new());
        let loader = loader_with(Arc::clone(&fetcher), None);

        loader.load("tile-1.bin", false).await;
        loader.load("tile-1.bin", false).await;
        assert_eq!(fetcher.count(), 1);
    }
}
