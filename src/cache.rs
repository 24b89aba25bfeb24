//! Per-run knowledge about imagery sources shared by concurrent renders.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use moka::future::Cache;

/// Default number of open raster readers kept around.
pub const DEFAULT_READER_CAPACITY: u64 = 256;

/// Snapshot of cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Band counts read from an opened source.
    pub misses: u64,
    /// Band counts recorded.
    pub inspections: u64,
    /// Sources with a known band count.
    pub known_sources: usize,
    /// Sources never retried this run.
    pub failed_sources: usize,
}

/// Per-run knowledge about imagery sources, shared by all render tasks.
///
/// Advisory only: losing an entry costs a second inspection, never correctness. A URL in the
/// failure set is never opened again and a known band count is never inspected again.
/// Two tasks may inspect the same URL concurrently; both record the same answer.
pub struct RenderCache<H> {
    band_counts: RwLock<HashMap<String, usize>>,
    failed: RwLock<HashSet<String>>,
    readers: Cache<String, Arc<H>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inspections: AtomicU64,
}

impl<H: Send + Sync + 'static> Default for RenderCache<H> {
    fn default() -> Self {
        Self::new(DEFAULT_READER_CAPACITY)
    }
}

impl<H: Send + Sync + 'static> RenderCache<H> {
    /// Keeps at most `reader_capacity` open readers.
    #[must_use]
    pub fn new(reader_capacity: u64) -> Self {
        Self {
            band_counts: RwLock::default(),
            failed: RwLock::default(),
            readers: Cache::new(reader_capacity),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inspections: AtomicU64::new(0),
        }
    }

    /// Cached band count, counting a hit or a miss.
    pub fn band_count(&self, url: &str) -> Option<usize> {
        // Panic if the lock is poisoned is not something the user can handle
        #[expect(clippy::unwrap_used)]
        let known = self.band_counts.read().unwrap().get(url).copied();
        let counter = if known.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        known
    }

    /// Records the band count of an opened source.
    pub fn record_band_count(&self, url: &str, bands: usize) {
        self.inspections.fetch_add(1, Ordering::Relaxed);
        #[expect(clippy::unwrap_used)]
        let mut band_counts = self.band_counts.write().unwrap();
        band_counts.insert(url.to_string(), bands);
    }

    /// Whether `url` was marked failed.
    pub fn is_failed(&self, url: &str) -> bool {
        #[expect(clippy::unwrap_used)]
        let failed = self.failed.read().unwrap();
        failed.contains(url)
    }

    /// Marks a URL as permanently unusable for the rest of the run.
    pub fn mark_failed(&self, url: &str) {
        #[expect(clippy::unwrap_used)]
        let inserted = self.failed.write().unwrap().insert(url.to_string());
        if inserted {
            log::debug!("Marked imagery source {url} as failed");
        }
    }

    /// Open reader of `url`, if still cached.
    pub async fn reader(&self, url: &str) -> Option<Arc<H>> {
        self.readers.get(url).await
    }

    /// Caches an open reader of `url`.
    pub async fn insert_reader(&self, url: &str, reader: Arc<H>) {
        self.readers.insert(url.to_string(), reader).await;
    }

    /// Drops the cached reader of `url`.
    pub async fn invalidate_reader(&self, url: &str) {
        self.readers.invalidate(url).await;
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        #[expect(clippy::unwrap_used)]
        let known_sources = self.band_counts.read().unwrap().len();
        #[expect(clippy::unwrap_used)]
        let failed_sources = self.failed.read().unwrap().len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inspections: self.inspections.load(Ordering::Relaxed),
            known_sources,
            failed_sources,
        }
    }
}
