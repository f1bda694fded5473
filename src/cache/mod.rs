//! # Tile Cache
//!
//! Process-wide, byte-bounded LRU over decompressed tiles, keyed by
//! `(fragment uid, file slot, tile id)`. The cache sits between the cell
//! iterators and the filesystem: a hit hands back an `Arc<DecodedTile>`
//! shared with every concurrent reader; a miss reads and decompresses the
//! frame exactly once per key thanks to per-key single-flight.
//!
//! ## Locking Discipline
//!
//! One mutex protects the map and the recency list. Decompression happens
//! OUTSIDE that mutex: a miss registers itself in the in-flight table,
//! releases the cache lock, does the I/O and codec work, then re-locks to
//! insert. Concurrent misses on the same key find the in-flight entry and
//! block on its condvar instead of duplicating the work; every other key
//! proceeds untouched.
//!
//! ## Eviction
//!
//! Least-recently-used entries are evicted until a new insertion fits. The
//! recency list is a queue of `(key, stamp)` pairs; touching a key pushes
//! a fresh stamp and the eviction scan skips stale pairs. An entry larger
//! than the whole cache is returned to the caller but never inserted.

use std::collections::VecDeque;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::tile::DecodedTile;

/// `(fragment uid, file slot, tile id)`.
pub type TileKey = (u64, usize, u64);

struct Entry {
    tile: Arc<DecodedTile>,
    stamp: u64,
}

struct Inner {
    map: HashMap<TileKey, Entry>,
    recency: VecDeque<(TileKey, u64)>,
    used_bytes: usize,
    next_stamp: u64,
}

impl Inner {
    fn touch(&mut self, key: TileKey) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some(entry) = self.map.get_mut(&key) {
            entry.stamp = stamp;
            self.recency.push_back((key, stamp));
        }
        // Hit-heavy workloads append a pair per touch; drop the stale ones
        // once they dominate the queue.
        if self.recency.len() > self.map.len() * 8 + 64 {
            let map = &self.map;
            self.recency
                .retain(|(key, stamp)| map.get(key).is_some_and(|e| e.stamp == *stamp));
        }
    }

    fn evict_until(&mut self, needed: usize, capacity: usize) {
        while self.used_bytes + needed > capacity {
            let Some((key, stamp)) = self.recency.pop_front() else {
                return;
            };
            // Stale pair: the key was touched again after this one was
            // queued, or already evicted.
            let current = match self.map.get(&key) {
                Some(entry) if entry.stamp == stamp => true,
                _ => false,
            };
            if current {
                let entry = self.map.remove(&key).expect("checked above"); // INVARIANT: current implies present
                self.used_bytes -= entry.tile.nbytes();
                trace!("tile cache evicted {:?} ({} bytes)", key, entry.tile.nbytes());
            }
        }
    }
}

enum FlightResult {
    Pending,
    Ready(Arc<DecodedTile>),
    Failed(String),
}

struct Flight {
    result: Mutex<FlightResult>,
    cv: Condvar,
}

/// Shared cache of decompressed tiles. Construct once per
/// `StorageManager` and share by reference.
pub struct TileCache {
    capacity_bytes: usize,
    inner: Mutex<Inner>,
    inflight: Mutex<HashMap<TileKey, Arc<Flight>>>,
}

impl TileCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                recency: VecDeque::new(),
                used_bytes: 0,
                next_stamp: 0,
            }),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached tile or loads it with `load`, de-duplicating
    /// concurrent loads of the same key.
    pub fn get_or_load<F>(&self, key: TileKey, load: F) -> Result<Arc<DecodedTile>>
    where
        F: FnOnce() -> Result<DecodedTile>,
    {
        {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.map.get(&key) {
                let tile = Arc::clone(&entry.tile);
                inner.touch(key);
                trace!("tile cache hit {:?}", key);
                return Ok(tile);
            }
        }
        trace!("tile cache miss {:?}", key);

        // Join or start the flight for this key.
        let (flight, leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight {
                        result: Mutex::new(FlightResult::Pending),
                        cv: Condvar::new(),
                    });
                    inflight.insert(key, Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            let mut result = flight.result.lock();
            while matches!(*result, FlightResult::Pending) {
                flight.cv.wait(&mut result);
            }
            return match &*result {
                FlightResult::Ready(tile) => Ok(Arc::clone(tile)),
                FlightResult::Failed(message) => Err(eyre::eyre!("{}", message)),
                FlightResult::Pending => unreachable!("woken while pending"),
            };
        }

        let loaded = load().map(Arc::new);

        // Publish to followers and leave the flight table before touching
        // the cache, so a failed load never wedges the key.
        {
            let mut result = flight.result.lock();
            *result = match &loaded {
                Ok(tile) => FlightResult::Ready(Arc::clone(tile)),
                Err(report) => FlightResult::Failed(format!("{:#}", report)),
            };
            flight.cv.notify_all();
        }
        self.inflight.lock().remove(&key);

        let tile = loaded?;
        let nbytes = tile.nbytes();
        if nbytes <= self.capacity_bytes {
            let mut inner = self.inner.lock();
            if !inner.map.contains_key(&key) {
                inner.evict_until(nbytes, self.capacity_bytes);
                inner.used_bytes += nbytes;
                inner.map.insert(
                    key,
                    Entry {
                        tile: Arc::clone(&tile),
                        stamp: 0,
                    },
                );
                inner.touch(key);
            }
        }
        Ok(tile)
    }

    /// Drops every cached tile of one fragment; used when a fragment is
    /// deleted by consolidation.
    pub fn evict_fragment(&self, fragment_uid: u64) {
        let mut inner = self.inner.lock();
        let keys: Vec<TileKey> = inner
            .map
            .keys()
            .filter(|&&(uid, _, _)| uid == fragment_uid)
            .copied()
            .collect();
        for key in keys {
            if let Some(entry) = inner.map.remove(&key) {
                inner.used_bytes -= entry.tile.nbytes();
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.recency.clear();
        inner.used_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tile_of(bytes: usize) -> DecodedTile {
        DecodedTile::fixed(vec![7u8; bytes], 1).unwrap()
    }

    #[test]
    fn hit_after_load() {
        let cache = TileCache::new(1024);
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let tile = cache
                .get_or_load((1, 0, 0), || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(tile_of(16))
                })
                .unwrap();
            assert_eq!(tile.cell_count(), 16);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.used_bytes(), 16);
    }

    #[test]
    fn lru_eviction_under_pressure() {
        let cache = TileCache::new(100);
        for tile_id in 0..10u64 {
            cache.get_or_load((1, 0, tile_id), || Ok(tile_of(30))).unwrap();
        }
        assert!(cache.used_bytes() <= 100);
        assert!(cache.len() <= 3);
    }

    #[test]
    fn touched_entries_survive_eviction() {
        let cache = TileCache::new(90);
        cache.get_or_load((1, 0, 0), || Ok(tile_of(30))).unwrap();
        cache.get_or_load((1, 0, 1), || Ok(tile_of(30))).unwrap();
        cache.get_or_load((1, 0, 2), || Ok(tile_of(30))).unwrap();
        // Touch tile 0 so tile 1 is now the least recently used.
        cache
            .get_or_load((1, 0, 0), || panic!("should be cached"))
            .unwrap();
        cache.get_or_load((1, 0, 3), || Ok(tile_of(30))).unwrap();

        let reloaded = AtomicUsize::new(0);
        cache
            .get_or_load((1, 0, 0), || {
                reloaded.fetch_add(1, Ordering::SeqCst);
                Ok(tile_of(30))
            })
            .unwrap();
        assert_eq!(reloaded.load(Ordering::SeqCst), 0, "tile 0 was touched, must survive");
    }

    #[test]
    fn oversized_entry_is_returned_not_cached() {
        let cache = TileCache::new(64);
        let tile = cache.get_or_load((1, 0, 0), || Ok(tile_of(128))).unwrap();
        assert_eq!(tile.cell_count(), 128);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn failed_load_does_not_wedge_the_key() {
        let cache = TileCache::new(1024);
        let result = cache.get_or_load((1, 0, 0), || eyre::bail!("disk on fire"));
        assert!(result.is_err());
        let tile = cache.get_or_load((1, 0, 0), || Ok(tile_of(8))).unwrap();
        assert_eq!(tile.cell_count(), 8);
    }

    #[test]
    fn concurrent_misses_load_once() {
        let cache = Arc::new(TileCache::new(1 << 20));
        let loads = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            handles.push(std::thread::spawn(move || {
                cache
                    .get_or_load((9, 1, 4), || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok(tile_of(64))
                    })
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap().cell_count(), 64);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn evict_fragment_drops_only_that_fragment() {
        let cache = TileCache::new(1024);
        cache.get_or_load((1, 0, 0), || Ok(tile_of(8))).unwrap();
        cache.get_or_load((2, 0, 0), || Ok(tile_of(8))).unwrap();
        cache.evict_fragment(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 8);
    }
}
