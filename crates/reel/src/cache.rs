//! On-disk media cache.
//!
//! Downloads media into `root/media` through a temp file in `root/tmp`, so a crash or
//! cancellation never leaves a partial entry visible. Concurrent fetches for the same asset
//! join a single in-flight download. After every completed write the cache evicts
//! least-recently-accessed entries until it is back under its byte budget; in-flight and
//! leased entries are never evicted.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OnceCell, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{Error, FetchError, Result, TimeoutPhase};
use crate::media::{MediaDescriptor, cache_key_for};
use crate::transport::{HttpTransport, MediaTransport};

/// A cached, complete media file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub id: String,
    pub path: PathBuf,
    pub bytes: u64,
    /// Served from an existing entry without touching the network.
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    size_bytes: u64,
    /// Logical access clock; higher is more recent.
    last_access: u64,
}

#[derive(Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    leases: HashMap<String, usize>,
}

impl CacheIndex {
    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.total_bytes += entry.size_bytes;
        if let Some(old) = self.entries.insert(key, entry) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Remove oldest entries until under `max_bytes`, skipping `protect`, leased keys and
    /// anything `pinned` reports as in flight.
    fn evict_over_budget<P>(&mut self, max_bytes: u64, protect: Option<&str>, pinned: P) -> Vec<CacheEntry>
    where
        P: Fn(&str) -> bool,
    {
        if self.total_bytes <= max_bytes {
            return Vec::new();
        }

        let mut candidates: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|(key, _)| {
                Some(key.as_str()) != protect
                    && !self.leases.contains_key(key.as_str())
                    && !pinned(key)
            })
            .map(|(key, entry)| (entry.last_access, key.clone()))
            .collect();
        candidates.sort_unstable();

        let mut evicted = Vec::new();
        for (_, key) in candidates {
            if self.total_bytes <= max_bytes {
                break;
            }
            if let Some(entry) = self.remove(&key) {
                evicted.push(entry);
            }
        }
        evicted
    }
}

type FetchResult = std::result::Result<FetchedAsset, FetchError>;

/// In-flight download shared by every caller fetching the same asset.
struct InFlightState {
    /// Asset id the download was started for.
    id: String,
    result: OnceCell<FetchResult>,
    notify: Notify,
    cancel: CancellationToken,
    progress: watch::Sender<u64>,
}

impl InFlightState {
    fn new(id: &str) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            id: id.to_owned(),
            result: OnceCell::new(),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            progress,
        }
    }

    fn set_result(&self, result: FetchResult) {
        let _ = self.result.set(result);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> FetchResult {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

type InFlightRequest = Arc<InFlightState>;

/// Handle to a fetch started with [`AssetCache::begin`].
///
/// Dropping the handle does not cancel the download; use [`AssetCache::cancel`].
pub struct FetchHandle {
    id: String,
    state: HandleState,
}

enum HandleState {
    Ready(FetchedAsset),
    Pending(InFlightRequest),
}

impl FetchHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the asset was already cached when the fetch began.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    /// Bytes written so far by the shared download. `None` for cache hits.
    pub fn progress(&self) -> Option<watch::Receiver<u64>> {
        match &self.state {
            HandleState::Ready(_) => None,
            HandleState::Pending(request) => Some(request.progress.subscribe()),
        }
    }

    pub async fn wait(self) -> FetchResult {
        match self.state {
            HandleState::Ready(asset) => Ok(asset),
            HandleState::Pending(request) => request.wait().await,
        }
    }
}

/// Keeps an entry out of eviction while held.
pub struct AssetLease {
    inner: Arc<CacheInner>,
    key: String,
    path: PathBuf,
    bytes: u64,
}

impl AssetLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl std::fmt::Debug for AssetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetLease").field("path", &self.path).finish()
    }
}

impl Drop for AssetLease {
    fn drop(&mut self) {
        let mut index = self.inner.index.lock();
        if let Some(count) = index.leases.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                index.leases.remove(&self.key);
            }
        }
    }
}

/// Statistics about the media cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub in_flight_count: usize,
    pub leased_count: usize,
}

struct CacheInner {
    config: CacheConfig,
    media_dir: PathBuf,
    tmp_dir: PathBuf,
    transport: Arc<dyn MediaTransport>,
    index: Mutex<CacheIndex>,
    /// In-flight downloads keyed by cache key.
    in_flight: DashMap<String, InFlightRequest>,
    permits: Arc<Semaphore>,
    clock: AtomicU64,
    runtime: Handle,
}

/// Shared, cloneable handle to the media cache.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<CacheInner>,
}

impl AssetCache {
    /// Open the cache over the reqwest transport built from `config.fetch`.
    pub async fn open_http(config: CacheConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.fetch)
            .map_err(|e| Error::configuration(format!("HTTP transport: {e}")))?;
        Self::open(config, Arc::new(transport)).await
    }

    /// Create directories, drop stale temp files and rebuild the index from disk.
    pub async fn open(config: CacheConfig, transport: Arc<dyn MediaTransport>) -> Result<Self> {
        config.validate()?;
        let media_dir = config.media_dir();
        let tmp_dir = config.tmp_dir();

        tokio::fs::create_dir_all(&media_dir)
            .await
            .map_err(|e| Error::cache_init(&media_dir, e))?;
        match tokio::fs::remove_dir_all(&tmp_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(Error::cache_init(&tmp_dir, e)),
        }
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| Error::cache_init(&tmp_dir, e))?;

        let mut found = scan_media_dir(&media_dir)
            .await
            .map_err(|e| Error::cache_init(&media_dir, e))?;
        found.sort_by_key(|(_, _, modified)| *modified);

        let mut index = CacheIndex::default();
        let mut clock = 0;
        for (key, entry, _) in found {
            clock += 1;
            index.insert(
                key,
                CacheEntry {
                    last_access: clock,
                    ..entry
                },
            );
        }

        let evicted = index.evict_over_budget(config.max_bytes, None, |_| false);
        info!(
            root = %config.root.display(),
            entries = index.entries.len(),
            bytes = index.total_bytes,
            evicted = evicted.len(),
            "media cache opened"
        );
        for entry in &evicted {
            remove_file_quietly(&entry.path).await;
        }

        Ok(Self {
            inner: Arc::new(CacheInner {
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                media_dir,
                tmp_dir,
                transport,
                index: Mutex::new(index),
                in_flight: DashMap::new(),
                clock: AtomicU64::new(clock),
                runtime: Handle::current(),
            }),
        })
    }

    /// Fetch `descriptor` into the cache and return the local path.
    pub async fn fetch(&self, descriptor: &MediaDescriptor) -> FetchResult {
        self.begin(descriptor).wait().await
    }

    /// Start (or join) a fetch without waiting for it.
    pub fn begin(&self, descriptor: &MediaDescriptor) -> FetchHandle {
        let key = descriptor.cache_key();
        if let Some(asset) = self.inner.lookup(&key, &descriptor.id) {
            return FetchHandle {
                id: descriptor.id.clone(),
                state: HandleState::Ready(asset),
            };
        }

        let (request, is_new) = self.inner.get_or_create_in_flight(&key, &descriptor.id);
        if is_new {
            debug!(id = %descriptor.id, "starting media download");
            let inner = self.inner.clone();
            let descriptor = descriptor.clone();
            let task_request = request.clone();
            self.inner.runtime.spawn(async move {
                inner.run_fetch(descriptor, key, task_request).await;
            });
        } else {
            debug!(id = %descriptor.id, "joining in-flight media download");
        }

        FetchHandle {
            id: descriptor.id.clone(),
            state: HandleState::Pending(request),
        }
    }

    /// Local path of a cached asset. Counts as an access.
    pub fn cached_path(&self, descriptor: &MediaDescriptor) -> Option<PathBuf> {
        self.inner
            .lookup(&descriptor.cache_key(), &descriptor.id)
            .map(|asset| asset.path)
    }

    /// Cached size of an asset, without counting as an access.
    pub fn cached_size(&self, id: &str) -> Option<u64> {
        self.inner
            .index
            .lock()
            .entries
            .get(&cache_key_for(id))
            .map(|entry| entry.size_bytes)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .index
            .lock()
            .entries
            .contains_key(&cache_key_for(id))
    }

    /// Pin a cached asset against eviction. Counts as an access.
    pub fn lease(&self, id: &str) -> Option<AssetLease> {
        let key = cache_key_for(id);
        let asset = self.inner.lookup(&key, id)?;
        let mut index = self.inner.index.lock();
        if !index.entries.contains_key(&key) {
            return None;
        }
        *index.leases.entry(key.clone()).or_insert(0) += 1;
        Some(AssetLease {
            inner: self.inner.clone(),
            key,
            path: asset.path,
            bytes: asset.bytes,
        })
    }

    pub fn has_in_flight(&self, id: &str) -> bool {
        self.inner.in_flight.contains_key(&cache_key_for(id))
    }

    /// Cancel the in-flight download of `id`, failing its waiters with `Cancelled`.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.inner.cancel_in_flight(&cache_key_for(id), id);
        if cancelled {
            debug!(id, "media download cancelled");
        }
        cancelled
    }

    /// Cancel every in-flight download.
    pub fn cancel_all(&self) -> usize {
        let pending: Vec<(String, String)> = self
            .inner
            .in_flight
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().id.clone()))
            .collect();
        pending
            .iter()
            .filter(|(key, id)| self.inner.cancel_in_flight(key, id))
            .count()
    }

    /// Drop the entry for `id` and cancel its download, e.g. after upstream removal.
    pub async fn invalidate(&self, id: &str) -> bool {
        let key = cache_key_for(id);
        let cancelled = self.inner.cancel_in_flight(&key, id);
        let removed = {
            let mut index = self.inner.index.lock();
            let removed = index.remove(&key);
            if let Some(entry) = &removed {
                remove_entry_file(&entry.path);
            }
            removed
        };
        debug!(id, cancelled, removed = removed.is_some(), "asset invalidated");
        cancelled || removed.is_some()
    }

    /// Cancel all downloads and delete every entry that is not leased.
    pub async fn clear(&self) -> usize {
        self.cancel_all();
        let removed: Vec<CacheEntry> = {
            let mut index = self.inner.index.lock();
            let keys: Vec<String> = index
                .entries
                .keys()
                .filter(|key| !index.leases.contains_key(key.as_str()))
                .cloned()
                .collect();
            let removed: Vec<CacheEntry> = keys.iter().filter_map(|key| index.remove(key)).collect();
            for entry in &removed {
                remove_entry_file(&entry.path);
            }
            removed
        };
        info!(removed = removed.len(), "media cache cleared");
        removed.len()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.inner.index.lock();
        CacheStats {
            entry_count: index.entries.len(),
            total_bytes: index.total_bytes,
            max_bytes: self.inner.config.max_bytes,
            in_flight_count: self.inner.in_flight.len(),
            leased_count: index.leases.len(),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.inner.media_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.inner.tmp_dir
    }
}

impl CacheInner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Hit lookup: bumps the access clock and the file mtime.
    fn lookup(&self, key: &str, id: &str) -> Option<FetchedAsset> {
        let asset = {
            let mut index = self.index.lock();
            let now = self.tick();
            let entry = index.entries.get_mut(key)?;
            entry.last_access = now;
            FetchedAsset {
                id: id.to_owned(),
                path: entry.path.clone(),
                bytes: entry.size_bytes,
                from_cache: true,
            }
        };

        let path = asset.path.clone();
        self.runtime.spawn_blocking(move || {
            let touched = std::fs::File::options()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_modified(SystemTime::now()));
            if let Err(e) = touched {
                debug!(path = %path.display(), error = %e, "failed to touch cached file");
            }
        });
        Some(asset)
    }

    fn get_or_create_in_flight(&self, key: &str, id: &str) -> (InFlightRequest, bool) {
        if let Some(existing) = self.in_flight.get(key) {
            return (existing.clone(), false);
        }

        let request = Arc::new(InFlightState::new(id));

        match self.in_flight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(request.clone());
                (request, true)
            }
        }
    }

    /// Remove `request` from the in-flight map if it is still the current one.
    fn take_in_flight(&self, key: &str, request: &InFlightRequest) -> bool {
        self.in_flight
            .remove_if(key, |_, current| Arc::ptr_eq(current, request))
            .is_some()
    }

    fn cancel_in_flight(&self, key: &str, id: &str) -> bool {
        match self.in_flight.remove(key) {
            Some((_, request)) => {
                request.cancel.cancel();
                request.set_result(Err(FetchError::cancelled(id)));
                true
            }
            None => false,
        }
    }

    async fn run_fetch(self: Arc<Self>, descriptor: MediaDescriptor, key: String, request: InFlightRequest) {
        let started = Instant::now();
        let result = self.fetch_into_cache(&descriptor, &key, &request).await;

        match &result {
            Ok(asset) => debug!(
                id = %descriptor.id,
                bytes = asset.bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "media download complete"
            ),
            Err(e) if e.is_cancelled() => debug!(id = %descriptor.id, "media download cancelled"),
            Err(e) => warn!(id = %descriptor.id, error = %e, "media download failed"),
        }

        if self.take_in_flight(&key, &request) {
            request.set_result(result);
        }
    }

    async fn fetch_into_cache(
        &self,
        descriptor: &MediaDescriptor,
        key: &str,
        request: &InFlightRequest,
    ) -> FetchResult {
        // A download for this key may have completed between the caller's miss and now.
        if let Some(asset) = self.lookup(key, &descriptor.id) {
            return Ok(asset);
        }

        let _permit = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(FetchError::cancelled(&descriptor.id)),
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| FetchError::transport("download pool closed", false))?,
        };

        let retry = &self.config.fetch.retry;
        let mut attempt = 0;
        let (temp_path, bytes) = loop {
            match self.download_once(descriptor, key, request).await {
                Ok(done) => break done,
                Err(e) if e.is_retryable() && retry.should_retry(attempt) => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        id = %descriptor.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying media download"
                    );
                    request.progress.send_replace(0);
                    tokio::select! {
                        biased;
                        _ = request.cancel.cancelled() => return Err(FetchError::cancelled(&descriptor.id)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        };

        // Files under `media_dir` only change while the index lock is held.
        let dest = self.media_dir.join(descriptor.cache_file_name());
        {
            let mut index = self.index.lock();
            if request.cancel.is_cancelled() {
                return Err(FetchError::cancelled(&descriptor.id));
            }
            temp_path
                .persist(&dest)
                .map_err(|e| FetchError::io("moving into cache", e.error))?;
            let last_access = self.tick();
            index.insert(
                key.to_owned(),
                CacheEntry {
                    path: dest.clone(),
                    size_bytes: bytes,
                    last_access,
                },
            );
            let evicted = index.evict_over_budget(self.config.max_bytes, Some(key), |k| {
                self.in_flight.contains_key(k)
            });
            for entry in &evicted {
                debug!(path = %entry.path.display(), bytes = entry.size_bytes, "evicting cached media");
                remove_entry_file(&entry.path);
            }
        }

        Ok(FetchedAsset {
            id: descriptor.id.clone(),
            path: dest,
            bytes,
            from_cache: false,
        })
    }

    /// One attempt: stream the body into a fresh temp file.
    ///
    /// The returned `TempPath` deletes the file when dropped, so every error path cleans up.
    async fn download_once(
        &self,
        descriptor: &MediaDescriptor,
        key: &str,
        request: &InFlightRequest,
    ) -> std::result::Result<(tempfile::TempPath, u64), FetchError> {
        let fetch = &self.config.fetch;
        let cancelled = || FetchError::cancelled(&descriptor.id);

        let response = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(cancelled()),
            opened = tokio::time::timeout(fetch.request_timeout, self.transport.open(descriptor)) => {
                opened.map_err(|_| FetchError::timeout(TimeoutPhase::Request, fetch.request_timeout))??
            }
        };

        let temp = tempfile::Builder::new()
            .prefix(key)
            .suffix(".part")
            .tempfile_in(&self.tmp_dir)
            .map_err(|e| FetchError::io("creating temp file", e))?;
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut body = response.body;
        let mut written: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = request.cancel.cancelled() => return Err(cancelled()),
                next = tokio::time::timeout(fetch.read_timeout, body.next()) => next,
            };
            match next {
                Err(_) => return Err(FetchError::timeout(TimeoutPhase::Read, fetch.read_timeout)),
                Ok(None) => break,
                Ok(Some(chunk)) => {
                    let chunk = chunk?;
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| FetchError::io("writing temp file", e))?;
                    written += chunk.len() as u64;
                    request.progress.send_replace(written);
                }
            }
        }

        if written == 0 {
            return Err(FetchError::EmptyBody {
                url: descriptor.uri.clone(),
            });
        }
        if let Some(expected) = response.content_length
            && expected != written
        {
            return Err(FetchError::transport(
                format!("body truncated: expected {expected} bytes, got {written}"),
                true,
            ));
        }

        file.flush()
            .await
            .map_err(|e| FetchError::io("flushing temp file", e))?;
        file.sync_all()
            .await
            .map_err(|e| FetchError::io("syncing temp file", e))?;
        drop(file);

        Ok((temp_path, written))
    }
}

async fn scan_media_dir(dir: &Path) -> std::io::Result<Vec<(String, CacheEntry, SystemTime)>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((
            key.to_owned(),
            CacheEntry {
                path: path.clone(),
                size_bytes: metadata.len(),
                last_access: 0,
            },
            modified,
        ));
    }
    Ok(found)
}

/// Unlink an indexed file. Called with the index lock held.
fn remove_entry_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove cached file");
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove cached file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FetchConfig, PreloadPolicy, RetryConfig};
    use crate::transport::MediaResponse;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    type OpenResult = std::result::Result<MediaResponse, FetchError>;

    /// Serves fixed payloads. Bodies of gated uris wait for a permit before every chunk.
    /// Opening a stalled uri never resolves.
    struct FakeTransport {
        payloads: HashMap<String, Bytes>,
        opens: AtomicUsize,
        gate: Arc<Semaphore>,
        gated: Vec<String>,
        stalled: Vec<String>,
        failures_before_success: AtomicUsize,
    }

    impl FakeTransport {
        fn new(payloads: &[(&str, usize)]) -> Self {
            Self {
                payloads: payloads
                    .iter()
                    .map(|(uri, len)| (uri.to_string(), Bytes::from(vec![7u8; *len])))
                    .collect(),
                opens: AtomicUsize::new(0),
                gate: Arc::new(Semaphore::new(0)),
                gated: Vec::new(),
                stalled: Vec::new(),
                failures_before_success: AtomicUsize::new(0),
            }
        }

        fn gated(mut self, uris: &[&str]) -> (Self, Arc<Semaphore>) {
            self.gated = uris.iter().map(|uri| uri.to_string()).collect();
            let gate = self.gate.clone();
            (self, gate)
        }

        fn stalled(mut self, uris: &[&str]) -> Self {
            self.stalled = uris.iter().map(|uri| uri.to_string()).collect();
            self
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaTransport for FakeTransport {
        async fn open(&self, descriptor: &MediaDescriptor) -> OpenResult {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.stalled.contains(&descriptor.uri) {
                std::future::pending::<()>().await;
            }
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(FetchError::transport("connection reset", true));
            }
            let payload = self.payloads.get(&descriptor.uri).cloned().ok_or_else(|| {
                FetchError::http_status(reqwest::StatusCode::NOT_FOUND, &descriptor.uri)
            })?;
            let half = payload.len() / 2;
            let chunks = vec![payload.slice(..half), payload.slice(half..)];
            let gate = self
                .gated
                .contains(&descriptor.uri)
                .then(|| self.gate.clone());
            let body = stream::iter(chunks)
                .then(move |chunk| {
                    let gate = gate.clone();
                    async move {
                        if let Some(gate) = gate {
                            gate.acquire().await.map(|permit| permit.forget()).ok();
                        }
                        Ok::<_, FetchError>(chunk)
                    }
                })
                .boxed();
            Ok(MediaResponse::new(Some(payload.len() as u64), body))
        }
    }

    fn descriptor(id: &str) -> MediaDescriptor {
        MediaDescriptor::new(id, format!("https://cdn.test/{id}.mp4"))
    }

    fn config(dir: &TempDir, max_bytes: u64) -> CacheConfig {
        let policy = PreloadPolicy {
            cache_max_bytes: max_bytes,
            max_concurrent_prefetch: 4,
            ..PreloadPolicy::default()
        };
        CacheConfig::new(dir.path(), &policy).with_fetch(FetchConfig {
            retry: RetryConfig {
                initial_delay_ms: 1,
                use_jitter: false,
                ..RetryConfig::default()
            },
            ..FetchConfig::default()
        })
    }

    async fn open(dir: &TempDir, max_bytes: u64, transport: Arc<FakeTransport>) -> AssetCache {
        AssetCache::open(config(dir, max_bytes), transport)
            .await
            .unwrap()
    }

    async fn open_with_timeouts(
        dir: &TempDir,
        transport: Arc<FakeTransport>,
        request_timeout: Duration,
        read_timeout: Duration,
    ) -> AssetCache {
        let config = config(dir, 1024).with_fetch(FetchConfig {
            request_timeout,
            read_timeout,
            retry: RetryConfig::disabled(),
            ..FetchConfig::default()
        });
        AssetCache::open(config, transport).await.unwrap()
    }

    fn tmp_is_empty(cache: &AssetCache) -> bool {
        std::fs::read_dir(cache.tmp_dir()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_fetch_writes_entry_and_hits_afterwards() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new(&[("https://cdn.test/a.mp4", 64)]));
        let cache = open(&dir, 1024, transport.clone()).await;

        let asset = cache.fetch(&descriptor("a")).await.unwrap();
        assert!(!asset.from_cache);
        assert_eq!(asset.bytes, 64);
        assert_eq!(std::fs::metadata(&asset.path).unwrap().len(), 64);
        assert!(asset.path.starts_with(cache.media_dir()));
        assert!(tmp_is_empty(&cache));

        let again = cache.fetch(&descriptor("a")).await.unwrap();
        assert!(again.from_cache);
        assert_eq!(again.path, asset.path);
        assert_eq!(transport.opens(), 1);
        assert_eq!(cache.cached_path(&descriptor("a")), Some(asset.path));
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(
            FakeTransport::new(&[("https://cdn.test/a.mp4", 64)]).stalled(&["https://cdn.test/a.mp4"]),
        );
        let cache = open_with_timeouts(
            &dir,
            transport.clone(),
            Duration::from_millis(50),
            Duration::from_secs(5),
        )
        .await;

        let err = cache.fetch(&descriptor("a")).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Timeout {
                phase: TimeoutPhase::Request,
                ..
            }
        ));
        assert_eq!(transport.opens(), 1);
        assert_eq!(cache.stats().entry_count, 0);
        assert!(!cache.has_in_flight("a"));
        assert!(tmp_is_empty(&cache));
    }

    #[tokio::test]
    async fn test_stalled_body_times_out_and_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let (transport, gate) = FakeTransport::new(&[("https://cdn.test/a.mp4", 64)])
            .gated(&["https://cdn.test/a.mp4"]);
        let cache = open_with_timeouts(
            &dir,
            Arc::new(transport),
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await;

        let handle = cache.begin(&descriptor("a"));
        let mut progress = handle.progress().unwrap();
        // Only the first chunk arrives.
        gate.add_permits(1);
        progress.wait_for(|written| *written == 32).await.unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Timeout {
                phase: TimeoutPhase::Read,
                ..
            }
        ));
        assert_eq!(err.to_string(), "read timed out after 50ms");
        assert_eq!(cache.stats().entry_count, 0);
        assert!(!cache.contains("a"));
        assert!(tmp_is_empty(&cache));
    }

    #[tokio::test]
    async fn test_cancel_all_reports_asset_ids() {
        let dir = TempDir::new().unwrap();
        let (transport, _gate) = FakeTransport::new(&[
            ("https://cdn.test/a.mp4", 64),
            ("https://cdn.test/b.mp4", 64),
        ])
        .gated(&["https://cdn.test/a.mp4", "https://cdn.test/b.mp4"]);
        let cache = open(&dir, 1024, Arc::new(transport)).await;

        let a = cache.begin(&descriptor("a"));
        let b = cache.begin(&descriptor("b"));
        assert_eq!(cache.cancel_all(), 2);

        for (handle, id) in [(a, "a"), (b, "b")] {
            match handle.wait().await {
                Err(FetchError::Cancelled { id: got }) => assert_eq!(got, id),
                other => panic!("expected cancellation of {id}, got {other:?}"),
            }
        }
        assert_eq!(cache.stats().in_flight_count, 0);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_newer_download_intact() {
        let dir = TempDir::new().unwrap();
        let (transport, gate) = FakeTransport::new(&[("https://cdn.test/a.mp4", 64)])
            .gated(&["https://cdn.test/a.mp4"]);
        let cache = open(&dir, 1024, Arc::new(transport)).await;

        let stale = cache.begin(&descriptor("a"));
        let mut progress = stale.progress().unwrap();
        gate.add_permits(1);
        progress.wait_for(|written| *written > 0).await.unwrap();
        assert!(cache.cancel("a"));

        let fresh = cache.begin(&descriptor("a"));
        gate.add_permits(8);
        let asset = fresh.wait().await.unwrap();
        assert!(stale.wait().await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.stats().entry_count, 1);
        assert_eq!(std::fs::metadata(&asset.path).unwrap().len(), 64);
        assert!(tmp_is_empty(&cache));
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_download() {
        let dir = TempDir::new().unwrap();
        let (transport, gate) = FakeTransport::new(&[("https://cdn.test/a.mp4", 64)])
            .gated(&["https://cdn.test/a.mp4"]);
        let transport = Arc::new(transport);
        let cache = open(&dir, 1024, transport.clone()).await;

        let first = cache.begin(&descriptor("a"));
        let second = cache.begin(&descriptor("a"));
        assert!(cache.has_in_flight("a"));
        gate.add_permits(2);

        let (a, b) = tokio::join!(first.wait(), second.wait());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.path, b.path);
        assert_eq!(transport.opens(), 1);
        assert_eq!(cache.stats().entry_count, 1);
        assert!(!cache.has_in_flight("a"));
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new(&[
            ("https://cdn.test/a.mp4", 40),
            ("https://cdn.test/b.mp4", 40),
            ("https://cdn.test/c.mp4", 40),
        ]));
        let cache = open(&dir, 100, transport).await;

        let a = cache.fetch(&descriptor("a")).await.unwrap();
        let b = cache.fetch(&descriptor("b")).await.unwrap();
        // Touching `a` makes `b` the oldest.
        assert!(cache.cached_path(&descriptor("a")).is_some());

        cache.fetch(&descriptor("c")).await.unwrap();
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert!(a.path.exists());
        assert!(!b.path.exists());
        assert_eq!(cache.stats().total_bytes, 80);
    }

    #[tokio::test]
    async fn test_in_flight_and_leased_entries_are_not_evicted() {
        let dir = TempDir::new().unwrap();
        let (transport, gate) = FakeTransport::new(&[
            ("https://cdn.test/a.mp4", 40),
            ("https://cdn.test/b.mp4", 40),
            ("https://cdn.test/c.mp4", 40),
        ])
        .gated(&["https://cdn.test/b.mp4"]);
        let cache = open(&dir, 60, Arc::new(transport)).await;

        cache.fetch(&descriptor("a")).await.unwrap();
        let lease = cache.lease("a").unwrap();

        // `b` is parked mid-download with its temp file open.
        let b = cache.begin(&descriptor("b"));
        for _ in 0..50 {
            if !tmp_is_empty(&cache) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!tmp_is_empty(&cache));

        // `c` completes over budget; `a` is leased and `c` was just written.
        cache.fetch(&descriptor("c")).await.unwrap();
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
        assert!(lease.path().exists());
        assert!(!tmp_is_empty(&cache), "in-flight write untouched");
        assert!(cache.has_in_flight("b"));

        gate.add_permits(2);
        let b = b.wait().await.unwrap();
        assert!(b.path.exists());
        assert!(cache.contains("a"));
        assert!(!cache.contains("c"));

        drop(lease);
        assert_eq!(cache.stats().leased_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_fails_waiters_and_cleans_temp() {
        let dir = TempDir::new().unwrap();
        let (transport, gate) = FakeTransport::new(&[("https://cdn.test/a.mp4", 64)])
            .gated(&["https://cdn.test/a.mp4"]);
        let cache = open(&dir, 1024, Arc::new(transport)).await;

        let handle = cache.begin(&descriptor("a"));
        let mut progress = handle.progress().unwrap();
        gate.add_permits(1);
        progress.wait_for(|written| *written > 0).await.unwrap();

        assert!(cache.cancel("a"));
        assert!(matches!(handle.wait().await, Err(FetchError::Cancelled { .. })));
        assert!(!cache.cancel("a"));

        // Let the download task observe cancellation and drop its temp file.
        for _ in 0..50 {
            if tmp_is_empty(&cache) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tmp_is_empty(&cache));
        assert!(!cache.contains("a"));
    }

    #[tokio::test]
    async fn test_failed_fetch_creates_no_entry() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new(&[]));
        let cache = open(&dir, 1024, transport).await;

        let err = cache.fetch(&descriptor("missing")).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { .. }));
        assert_eq!(cache.stats().entry_count, 0);
        assert!(tmp_is_empty(&cache));
    }

    #[tokio::test]
    async fn test_retryable_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let transport = FakeTransport::new(&[("https://cdn.test/a.mp4", 16)]);
        transport.failures_before_success.store(2, Ordering::SeqCst);
        let transport = Arc::new(transport);
        let cache = open(&dir, 1024, transport.clone()).await;

        cache.fetch(&descriptor("a")).await.unwrap();
        assert_eq!(transport.opens(), 3);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index_and_drops_stale_temp() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new(&[("https://cdn.test/a.mp4", 32)]));
        {
            let cache = open(&dir, 1024, transport.clone()).await;
            cache.fetch(&descriptor("a")).await.unwrap();
            std::fs::write(cache.tmp_dir().join("leftover.part"), b"junk").unwrap();
        }

        let cache = open(&dir, 1024, transport.clone()).await;
        assert!(tmp_is_empty(&cache));
        assert!(cache.contains("a"));
        assert_eq!(cache.cached_size("a"), Some(32));
        assert!(cache.fetch(&descriptor("a")).await.unwrap().from_cache);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new(&[
            ("https://cdn.test/a.mp4", 8),
            ("https://cdn.test/b.mp4", 8),
        ]));
        let cache = open(&dir, 1024, transport).await;
        let a = cache.fetch(&descriptor("a")).await.unwrap();
        cache.fetch(&descriptor("b")).await.unwrap();

        assert!(cache.invalidate("a").await);
        assert!(!a.path.exists());
        assert!(!cache.invalidate("a").await);

        assert_eq!(cache.clear().await, 1);
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_open_rejects_zero_budget() {
        let dir = TempDir::new().unwrap();
        let result = AssetCache::open(config(&dir, 0), Arc::new(FakeTransport::new(&[]))).await;
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
