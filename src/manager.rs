//! Per-archive lifecycle, caching and request coalescing.
//!
//! An [`ArchiveManager`] owns one archive's state machine
//! (`Unloaded -> Loading -> Loaded | Failed`) and its payload caches.
//! Concurrent requests for the same catalog, or for the same entry, share a
//! single in-flight future. The join tables only hold weak handles: when
//! every caller has dropped its request the underlying fetch is dropped too,
//! and the next request starts a fresh one.
//!
//! An [`ArchiveRegistry`] keys managers by URI so callers can address
//! archives by location alone.

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheStore, DiskStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::RangeFetch;
use crate::progress::{DEFAULT_BUFFER_SIZE, Progress};
use crate::zip::{ArchiveReader, Catalog, Entry};

type CatalogFuture = BoxFuture<'static, Result<Arc<Catalog>>>;
type PayloadFuture = BoxFuture<'static, Result<Bytes>>;

/// Observable load state of one archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

enum State {
    Unloaded,
    /// `fresh` loads go to the network without consulting the snapshot
    Loading {
        load: WeakShared<CatalogFuture>,
        fresh: bool,
    },
    Loaded(Arc<Catalog>),
    Failed(Error),
}

struct Slot {
    /// Bumped whenever a load starts or the archive is invalidated; a load
    /// only commits its result while its epoch is current.
    epoch: u64,
    state: State,
}

struct Inner<F: RangeFetch> {
    uri: String,
    reader: ArchiveReader<F>,
    store: Option<Arc<dyn CacheStore>>,
    memory_cache: bool,
    slot: Mutex<Slot>,
    payloads: DashMap<String, Bytes>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_request: AtomicU64,
    /// Bumped by cache clears so fetches started earlier do not repopulate
    cache_generation: AtomicU64,
}

/// One in-flight payload fetch and the progress callbacks of its callers
struct InFlight {
    id: u64,
    fetch: WeakShared<PayloadFuture>,
    listeners: Arc<Mutex<Vec<Progress>>>,
}

/// Manages the catalog and payload caches of one remote archive.
///
/// Cheap to clone; clones share state.
pub struct ArchiveManager<F: RangeFetch + 'static> {
    inner: Arc<Inner<F>>,
}

impl<F: RangeFetch + 'static> Clone for ArchiveManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: RangeFetch + 'static> ArchiveManager<F> {
    /// Create a manager for the archive at `uri`.
    ///
    /// `store` is ignored when `config.durable_cache` is off.
    pub fn new(
        uri: impl Into<String>,
        fetcher: Arc<F>,
        store: Option<Arc<dyn CacheStore>>,
        config: &Config,
    ) -> Self {
        let store = if config.durable_cache { store } else { None };

        Self {
            inner: Arc::new(Inner {
                uri: uri.into(),
                reader: ArchiveReader::new(fetcher).with_slack(config.local_header_slack),
                store,
                memory_cache: config.memory_cache,
                slot: Mutex::new(Slot {
                    epoch: 0,
                    state: State::Unloaded,
                }),
                payloads: DashMap::new(),
                in_flight: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(0),
                cache_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn state(&self) -> LoadState {
        match &self.inner.slot.lock().state {
            State::Unloaded => LoadState::Unloaded,
            State::Loading { load, .. } if load.upgrade().is_some() => LoadState::Loading,
            // Every caller of the last load went away before it finished
            State::Loading { .. } => LoadState::Unloaded,
            State::Loaded(_) => LoadState::Loaded,
            State::Failed(_) => LoadState::Failed,
        }
    }

    /// The loaded catalog, if any
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        match &self.inner.slot.lock().state {
            State::Loaded(catalog) => Some(Arc::clone(catalog)),
            _ => None,
        }
    }

    /// The error of the last failed load, if the archive is in `Failed`
    pub fn last_error(&self) -> Option<Error> {
        match &self.inner.slot.lock().state {
            State::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Load the catalog, joining a load already in flight.
    ///
    /// A durable snapshot is used when present and decodable. A failed
    /// archive is loaded again on the next call.
    pub async fn load_catalog(&self) -> Result<Arc<Catalog>> {
        let shared = {
            let mut slot = self.inner.slot.lock();
            let existing = match &slot.state {
                State::Loaded(catalog) => return Ok(Arc::clone(catalog)),
                State::Loading { load, .. } => load.upgrade(),
                State::Unloaded | State::Failed(_) => None,
            };

            match existing {
                Some(shared) => {
                    debug!("Joining in-flight catalog load for {}", self.inner.uri);
                    shared
                }
                None => self.inner.start_load(&mut slot, true),
            }
        };

        shared.await
    }

    /// Fetch the catalog from the network again, ignoring the snapshot.
    ///
    /// Joins a network load already in flight. Payloads cached in memory are
    /// dropped; durable payloads are kept and are re-verified against the
    /// new catalog before use.
    pub async fn reload_catalog(&self) -> Result<Arc<Catalog>> {
        let shared = {
            let mut slot = self.inner.slot.lock();
            let existing = match &slot.state {
                State::Loading { load, fresh: true } => load.upgrade(),
                _ => None,
            };

            match existing {
                Some(shared) => {
                    debug!("Joining in-flight catalog reload for {}", self.inner.uri);
                    shared
                }
                None => {
                    let shared = self.inner.start_load(&mut slot, false);
                    drop(slot);
                    self.clear_memory_cache();
                    shared
                }
            }
        };
        shared.await
    }

    /// Get the verified payload of the entry at `path`.
    ///
    /// Serves from memory, then from the durable store, then from the
    /// network, where concurrent requests for the same entry share one fetch.
    pub async fn fetch_entry_data(&self, path: &str) -> Result<Bytes> {
        self.fetch_payload(path, None).await
    }

    /// [`fetch_entry_data`](Self::fetch_entry_data), reporting download
    /// progress of the entry to `progress`.
    ///
    /// Cached payloads report completion at once. A caller joining a fetch
    /// in flight receives progress from the point it joined.
    pub async fn fetch_entry_data_with_progress(&self, path: &str, progress: Progress) -> Result<Bytes> {
        let data = self.fetch_payload(path, Some(&progress)).await?;
        progress.finish();
        Ok(data)
    }

    async fn fetch_payload(&self, path: &str, progress: Option<&Progress>) -> Result<Bytes> {
        let catalog = self.load_catalog().await?;
        let entry = catalog
            .get(path)
            .ok_or_else(|| Error::EntryNotFound(path.to_string()))?;
        if entry.is_directory() {
            return Err(Error::EntryIsDirectory(path.to_string()));
        }

        if let Some(data) = self.inner.cached_payload(entry).await {
            return Ok(data);
        }

        let shared = self
            .inner
            .join_or_start_fetch(entry.clone(), catalog.archive_length(), progress);
        shared.await
    }

    /// Get the entry at `path` with its payload attached
    pub async fn fetch_entry(&self, path: &str) -> Result<Entry> {
        let data = self.fetch_entry_data(path).await?;
        let catalog = self.load_catalog().await?;
        let entry = catalog
            .get(path)
            .ok_or_else(|| Error::EntryNotFound(path.to_string()))?;
        Ok(entry.with_data(data))
    }

    /// Drop payloads cached in memory. Catalog and durable cache are kept.
    pub fn clear_memory_cache(&self) {
        self.inner.cache_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.payloads.clear();
    }

    /// Drop the catalog and every cached payload of this archive, in memory
    /// and in the durable store.
    pub async fn clear_cache(&self) -> Result<()> {
        self.invalidate();
        match &self.inner.store {
            Some(store) => store.clear(Some(&self.inner.uri)).await,
            None => Ok(()),
        }
    }

    /// Reset to `Unloaded` and drop memory caches
    fn invalidate(&self) {
        {
            let mut slot = self.inner.slot.lock();
            slot.epoch += 1;
            slot.state = State::Unloaded;
        }
        self.clear_memory_cache();
        debug!("Invalidated archive {}", self.inner.uri);
    }
}

impl<F: RangeFetch + 'static> Inner<F> {
    /// Start a catalog load and record it as the in-flight one.
    fn start_load(self: &Arc<Self>, slot: &mut Slot, use_snapshot: bool) -> Shared<CatalogFuture> {
        slot.epoch += 1;
        let epoch = slot.epoch;
        let inner = Arc::clone(self);

        let fresh = !use_snapshot || self.store.is_none();

        let shared = async move { inner.run_load(epoch, use_snapshot).await }
            .boxed()
            .shared();
        if let Some(load) = shared.downgrade() {
            slot.state = State::Loading { load, fresh };
        }
        trace!("Started catalog load #{} for {}", epoch, self.uri);
        shared
    }

    async fn run_load(self: Arc<Self>, epoch: u64, use_snapshot: bool) -> Result<Arc<Catalog>> {
        let snapshot = if use_snapshot {
            self.load_snapshot().await
        } else {
            None
        };
        let from_snapshot = snapshot.is_some();

        let result = match snapshot {
            Some(catalog) => Ok(Arc::new(catalog)),
            None => self.reader.load_catalog(&self.uri).await.map(Arc::new),
        };

        let committed = {
            let mut slot = self.slot.lock();
            if slot.epoch == epoch {
                slot.state = match &result {
                    Ok(catalog) => State::Loaded(Arc::clone(catalog)),
                    Err(err) => State::Failed(err.clone()),
                };
                true
            } else {
                false
            }
        };

        match &result {
            Ok(catalog) if committed => {
                info!("Loaded catalog of {} ({} entries)", self.uri, catalog.len());
                if !from_snapshot {
                    self.persist_snapshot(catalog).await;
                }
            }
            Ok(_) => debug!("Discarding stale catalog load for {}", self.uri),
            Err(err) => warn!("Failed to load catalog of {}: {}", self.uri, err),
        }

        result
    }

    async fn load_snapshot(&self) -> Option<Catalog> {
        let store = self.store.as_ref()?;
        let bytes = match store.get(&self.uri, None).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!("Failed to read catalog snapshot for {}: {}", self.uri, e);
                return None;
            }
        };

        match Catalog::decode(&bytes) {
            Ok(catalog) => {
                debug!("Cache hit for catalog of {}", self.uri);
                Some(catalog)
            }
            Err(e) => {
                warn!("Discarding catalog snapshot for {}: {}", self.uri, e);
                None
            }
        }
    }

    async fn persist_snapshot(&self, catalog: &Catalog) {
        if let Some(store) = &self.store
            && let Err(e) = store.put(&self.uri, None, &catalog.encode()).await
        {
            warn!("Failed to write catalog snapshot for {}: {}", self.uri, e);
        }
    }

    /// Look up a verified payload in memory, then in the durable store.
    async fn cached_payload(&self, entry: &Entry) -> Option<Bytes> {
        if self.memory_cache {
            if let Some(data) = self.payloads.get(&entry.path).map(|d| d.value().clone()) {
                if entry.verifies(&data) {
                    trace!("Memory cache hit for '{}'", entry.path);
                    return Some(data);
                }
                warn!("Dropping memory cached '{}': checksum mismatch", entry.path);
                self.payloads.remove(&entry.path);
            }
        }

        let store = self.store.as_ref()?;
        let bytes = match store.get(&self.uri, Some(&entry.path)).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!("Failed to read cache record for '{}': {}", entry.path, e);
                return None;
            }
        };

        let data = match Entry::decode(&bytes) {
            Ok(cached) if same_member(&cached, entry) => cached.data,
            Ok(_) => None,
            Err(e) => {
                debug!("Undecodable cache record for '{}': {}", entry.path, e);
                None
            }
        };

        match data {
            Some(data) if entry.verifies(&data) => {
                debug!("Cache hit for '{}'", entry.path);
                if self.memory_cache {
                    self.payloads.insert(entry.path.clone(), data.clone());
                }
                Some(data)
            }
            _ => {
                warn!(
                    "Discarding cache record for '{}' of {}: failed verification",
                    entry.path, self.uri
                );
                None
            }
        }
    }

    /// Join the in-flight fetch of this entry or start one.
    fn join_or_start_fetch(
        self: &Arc<Self>,
        entry: Entry,
        archive_length: u64,
        progress: Option<&Progress>,
    ) -> Shared<PayloadFuture> {
        let mut table = self.in_flight.lock();
        if let Some(in_flight) = table.get(&entry.path)
            && let Some(shared) = in_flight.fetch.upgrade()
        {
            debug!("Joining in-flight fetch of '{}'", entry.path);
            if let Some(progress) = progress {
                in_flight.listeners.lock().push(progress.clone());
            }
            return shared;
        }

        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let path = entry.path.clone();
        let listeners: Arc<Mutex<Vec<Progress>>> =
            Arc::new(Mutex::new(progress.into_iter().cloned().collect()));
        let inner = Arc::clone(self);
        let fanout = Arc::clone(&listeners);

        debug!("Cache miss for '{}', fetching from {}", path, self.uri);
        let shared = async move { inner.run_fetch(id, entry, archive_length, fanout).await }
            .boxed()
            .shared();
        if let Some(fetch) = shared.downgrade() {
            table.insert(path, InFlight { id, fetch, listeners });
        }
        shared
    }

    async fn run_fetch(
        self: Arc<Self>,
        id: u64,
        entry: Entry,
        archive_length: u64,
        listeners: Arc<Mutex<Vec<Progress>>>,
    ) -> Result<Bytes> {
        let generation = self.cache_generation.load(Ordering::SeqCst);
        let buffer_size = listeners
            .lock()
            .iter()
            .map(Progress::buffer_size)
            .min()
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        let fanout = Progress::with_buffer_size(buffer_size, move |value| {
            let current = listeners.lock().clone();
            for listener in current {
                listener.report(value);
            }
        });

        let result = self
            .reader
            .fetch_entry_with_progress(&self.uri, &entry, Some(archive_length), Some(&fanout))
            .await;

        match &result {
            Ok(data) if self.cache_generation.load(Ordering::SeqCst) == generation => {
                if self.memory_cache {
                    self.payloads.insert(entry.path.clone(), data.clone());
                }
                self.persist_payload(&entry, data).await;
            }
            Ok(_) => debug!("Cache cleared while fetching '{}', not storing", entry.path),
            Err(err) if err.is_entry_scoped() => {
                warn!("Entry '{}' of {} is unreadable: {}", entry.path, self.uri, err)
            }
            Err(err) => warn!("Failed to fetch '{}' from {}: {}", entry.path, self.uri, err),
        }

        let mut table = self.in_flight.lock();
        if table.get(&entry.path).is_some_and(|in_flight| in_flight.id == id) {
            table.remove(&entry.path);
        }
        drop(table);

        result
    }

    async fn persist_payload(&self, entry: &Entry, data: &Bytes) {
        if let Some(store) = &self.store {
            let record = entry.with_data(data.clone()).encode();
            if let Err(e) = store.put(&self.uri, Some(&entry.path), &record).await {
                warn!("Failed to write cache record for '{}': {}", entry.path, e);
            }
        }
    }
}

/// Whether a cached record describes the same archive member as `entry`
fn same_member(cached: &Entry, entry: &Entry) -> bool {
    cached.path == entry.path
        && cached.offset == entry.offset
        && cached.crc32 == entry.crc32
        && cached.compressed_size == entry.compressed_size
        && cached.uncompressed_size == entry.uncompressed_size
}

/// Archive managers keyed by URI, sharing one transport and one store.
pub struct ArchiveRegistry<F: RangeFetch + 'static> {
    fetcher: Arc<F>,
    store: Option<Arc<dyn CacheStore>>,
    config: Config,
    managers: DashMap<String, ArchiveManager<F>>,
}

impl<F: RangeFetch + 'static> ArchiveRegistry<F> {
    pub fn new(fetcher: Arc<F>, store: Option<Arc<dyn CacheStore>>, config: Config) -> Self {
        Self {
            fetcher,
            store,
            config,
            managers: DashMap::new(),
        }
    }

    /// Create a registry with a [`DiskStore`] at the configured cache
    /// directory, or no durable store when `durable_cache` is off.
    pub async fn with_config(fetcher: Arc<F>, config: Config) -> Result<Self> {
        let store: Option<Arc<dyn CacheStore>> = if config.durable_cache {
            let dir = config.resolved_cache_dir()?;
            Some(Arc::new(DiskStore::with_base_dir(dir).await?))
        } else {
            None
        };

        Ok(Self::new(fetcher, store, config))
    }

    pub fn fetcher(&self) -> &Arc<F> {
        &self.fetcher
    }

    /// The manager for `uri`, created on first use
    pub fn manager(&self, uri: &str) -> ArchiveManager<F> {
        self.managers
            .entry(uri.to_string())
            .or_insert_with(|| {
                ArchiveManager::new(uri, Arc::clone(&self.fetcher), self.store.clone(), &self.config)
            })
            .clone()
    }

    pub async fn load_catalog(&self, uri: &str) -> Result<Arc<Catalog>> {
        self.manager(uri).load_catalog().await
    }

    pub async fn fetch_entry_data(&self, uri: &str, path: &str) -> Result<Bytes> {
        self.manager(uri).fetch_entry_data(path).await
    }

    pub async fn fetch_entry_data_with_progress(
        &self,
        uri: &str,
        path: &str,
        progress: Progress,
    ) -> Result<Bytes> {
        self.manager(uri)
            .fetch_entry_data_with_progress(path, progress)
            .await
    }

    /// Drop in-memory payloads of every archive
    pub fn clear_memory_cache(&self) {
        for manager in self.managers.iter() {
            manager.value().clear_memory_cache();
        }
    }

    /// Reset every archive and clear the whole durable store
    pub async fn clear_cache(&self) -> Result<()> {
        for manager in self.managers.iter() {
            manager.value().invalidate();
        }
        match &self.store {
            Some(store) => store.clear(None).await,
            None => Ok(()),
        }
    }
}
