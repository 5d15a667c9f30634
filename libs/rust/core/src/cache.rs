//! Memoizing result store keyed by canonical position.
//!
//! Backed by a sled tree named `results`; each row is a JSON encoded
//! [`CacheEntry`]. A second tree, `progress`, holds one [`ParticleProgress`]
//! row per particle; score rows are shared between particles, so epoch
//! counters and personal bests for a later resume come from there.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::canonical::{canonical_key, decode_key, Position, Velocity};
use crate::error::CacheError;

const RESULTS_TREE: &str = "results";
const PROGRESS_TREE: &str = "progress";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub epoch: u64,
    pub particle_id: usize,
    pub position_key: String,
    pub velocity_key: String,
    pub score: f64,
    /// Unix millis.
    pub recorded_at: i64,
}

impl CacheEntry {
    pub fn new(epoch: u64, particle_id: usize, position: &Position, velocity: &Velocity, score: f64) -> Self {
        Self {
            epoch,
            particle_id,
            position_key: canonical_key(position),
            velocity_key: canonical_key(velocity),
            score,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn position(&self) -> Result<Position, CacheError> { Ok(decode_key(&self.position_key)?) }
    pub fn velocity(&self) -> Result<Velocity, CacheError> { Ok(decode_key(&self.velocity_key)?) }
}

/// Where one particle stood after its last completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleProgress {
    pub particle_id: usize,
    pub epochs_completed: u64,
    pub position_key: String,
    pub velocity_key: String,
    pub score: f64,
    pub best_score: f64,
    pub best_position_key: String,
    pub best_velocity_key: String,
    /// Unix millis.
    pub recorded_at: i64,
}

impl ParticleProgress {
    pub fn position(&self) -> Result<Position, CacheError> { Ok(decode_key(&self.position_key)?) }
    pub fn velocity(&self) -> Result<Velocity, CacheError> { Ok(decode_key(&self.velocity_key)?) }
    pub fn best_position(&self) -> Result<Position, CacheError> { Ok(decode_key(&self.best_position_key)?) }
    pub fn best_velocity(&self) -> Result<Velocity, CacheError> { Ok(decode_key(&self.best_velocity_key)?) }
}

fn progress_key(particle_id: usize) -> [u8; 8] {
    (particle_id as u64).to_be_bytes()
}

#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Exclusive claim on one position key. Released on drop.
pub struct KeyGuard {
    key: String,
    locks: Arc<KeyLocks>,
    _held: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut slots = self.locks.slots.lock();
        // map + our guard are the only holders -> nobody is waiting on this key
        if slots.get(&self.key).map_or(false, |slot| Arc::strong_count(slot) <= 2) {
            slots.remove(&self.key);
        }
    }
}

#[derive(Clone)]
pub struct ResultCache {
    db: sled::Db,
    results: sled::Tree,
    progress: sled::Tree,
    path: Option<PathBuf>,
    locks: Arc<KeyLocks>,
}

impl ResultCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() { std::fs::create_dir_all(parent)?; }
        }
        let db = sled::open(path)?;
        let results = db.open_tree(RESULTS_TREE)?;
        let progress = db.open_tree(PROGRESS_TREE)?;
        debug!(path=%path.display(), rows=results.len(), particles=progress.len(), "result_cache_opened");
        Ok(Self { db, results, progress, path: Some(path.to_path_buf()), locks: Arc::default() })
    }

    /// In-memory store removed on drop.
    pub fn temporary() -> Result<Self, CacheError> {
        let db = sled::Config::new().temporary(true).open()?;
        let results = db.open_tree(RESULTS_TREE)?;
        let progress = db.open_tree(PROGRESS_TREE)?;
        Ok(Self { db, results, progress, path: None, locks: Arc::default() })
    }

    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        match self.results.get(key.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn lookup(&self, key: &str) -> Result<Option<f64>, CacheError> {
        Ok(self.get(key)?.map(|e| e.score))
    }

    /// Insert or replace the row for `entry.position_key`.
    pub fn upsert(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(entry)?;
        self.results.insert(entry.position_key.as_bytes(), raw)?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        self.results
            .iter()
            .map(|kv| -> Result<CacheEntry, CacheError> {
                let (_, raw) = kv?;
                Ok(serde_json::from_slice(&raw)?)
            })
            .collect()
    }

    /// Replace the progress row of `progress.particle_id`.
    pub fn record_progress(&self, progress: &ParticleProgress) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(progress)?;
        self.progress.insert(progress_key(progress.particle_id), raw)?;
        Ok(())
    }

    pub fn progress_of(&self, particle_id: usize) -> Result<Option<ParticleProgress>, CacheError> {
        match self.progress.get(progress_key(particle_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Progress rows in particle order.
    pub fn progress(&self) -> Result<Vec<ParticleProgress>, CacheError> {
        self.progress
            .iter()
            .map(|kv| -> Result<ParticleProgress, CacheError> {
                let (_, raw) = kv?;
                Ok(serde_json::from_slice(&raw)?)
            })
            .collect()
    }

    pub fn len(&self) -> usize { self.results.len() }
    pub fn is_empty(&self) -> bool { self.results.is_empty() }

    pub fn flush(&self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }

    /// Waits until no other caller holds `key`. Lookup, evaluation and upsert
    /// for one position run under this guard so a position is scored once.
    pub async fn reserve(&self, key: &str) -> KeyGuard {
        let slot = self.locks.slots.lock().entry(key.to_string()).or_default().clone();
        let held = slot.lock_owned().await;
        KeyGuard { key: key.to_string(), locks: self.locks.clone(), _held: held }
    }

    /// Copy every row of each source store into this one and return the number
    /// of score rows copied. Later sources win on conflicting positions; a
    /// progress row is only replaced by one at least as far along. Missing
    /// sources and this store's own path are skipped.
    pub fn merge(&self, sources: &[PathBuf]) -> Result<usize, CacheError> {
        let mut merged = 0usize;
        for source in sources {
            if !source.exists() {
                warn!(source=%source.display(), "merge_source_missing");
                continue;
            }
            if self.is_same_store(source) { continue; }
            let other = ResultCache::open(source)?;
            for entry in other.entries()? {
                self.upsert(&entry)?;
                merged += 1;
            }
            for progress in other.progress()? {
                let behind = self.progress_of(progress.particle_id)?.map_or(true, |own| own.epochs_completed <= progress.epochs_completed);
                if behind { self.record_progress(&progress)?; }
            }
            debug!(source=%source.display(), rows=other.len(), particles=other.progress.len(), "merge_source_done");
        }
        Ok(merged)
    }

    /// Merge `sources` into the store at `target`, flush it, and optionally
    /// delete the sources afterwards.
    pub fn consolidate(target: &Path, sources: &[PathBuf], discard_sources: bool) -> Result<usize, CacheError> {
        let merged = {
            let store = ResultCache::open(target)?;
            let merged = store.merge(sources)?;
            store.flush()?;
            merged
        };
        if discard_sources {
            for source in sources {
                if !source.exists() || same_path(source, target) { continue; }
                std::fs::remove_dir_all(source)?;
            }
        }
        info!(target=%target.display(), sources=sources.len(), merged, discard_sources, "cache_consolidated");
        Ok(merged)
    }

    fn is_same_store(&self, other: &Path) -> bool {
        self.path.as_deref().map_or(false, |own| same_path(own, other))
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pos(x: f64, y: f64) -> Position {
        [("X".to_string(), x), ("Y".to_string(), y)].into_iter().collect()
    }

    fn scratch(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pso-cache-{tag}-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn upsert_replaces_row_for_same_position() {
        let cache = ResultCache::temporary().unwrap();
        let p = pos(1.0, 2.0);
        let v = pos(0.0, 0.0);
        cache.upsert(&CacheEntry::new(0, 3, &p, &v, 5.0)).unwrap();
        cache.upsert(&CacheEntry::new(4, 7, &p, &v, 5.0)).unwrap();
        assert_eq!(cache.len(), 1);
        let row = cache.get(&canonical_key(&p)).unwrap().unwrap();
        assert_eq!((row.epoch, row.particle_id), (4, 7));
        assert_eq!(row.position().unwrap(), p);
        assert_eq!(cache.lookup(&canonical_key(&pos(9.0, 9.0))).unwrap(), None);
    }

    #[test]
    fn merge_and_consolidate_across_stores() {
        let a = scratch("a");
        let b = scratch("b");
        let target = scratch("target");
        {
            let ca = ResultCache::open(&a).unwrap();
            ca.upsert(&CacheEntry::new(0, 0, &pos(1.0, 1.0), &pos(0.0, 0.0), 1.0)).unwrap();
            ca.upsert(&CacheEntry::new(0, 1, &pos(2.0, 2.0), &pos(0.0, 0.0), 2.0)).unwrap();
            ca.flush().unwrap();
            let cb = ResultCache::open(&b).unwrap();
            cb.upsert(&CacheEntry::new(5, 1, &pos(2.0, 2.0), &pos(1.0, 0.0), 2.5)).unwrap();
            cb.flush().unwrap();
        }
        let merged = ResultCache::consolidate(&target, &[a.clone(), b.clone(), scratch("missing")], true).unwrap();
        assert_eq!(merged, 3);
        assert!(!a.exists() && !b.exists());
        let store = ResultCache::open(&target).unwrap();
        assert_eq!(store.len(), 2);
        // b was listed after a, so its row for (2,2) survives
        let row = store.get(&canonical_key(&pos(2.0, 2.0))).unwrap().unwrap();
        assert_eq!((row.epoch, row.score), (5, 2.5));
        assert_eq!(store.lookup(&canonical_key(&pos(1.0, 1.0))).unwrap(), Some(1.0));
        drop(store);
        let _ = std::fs::remove_dir_all(&target);
    }

    fn progress(particle_id: usize, epochs_completed: u64, score: f64) -> ParticleProgress {
        let here = canonical_key(&pos(score, 0.0));
        let still = canonical_key(&pos(0.0, 0.0));
        ParticleProgress {
            particle_id,
            epochs_completed,
            position_key: here.clone(),
            velocity_key: still.clone(),
            score,
            best_score: score,
            best_position_key: here,
            best_velocity_key: still,
            recorded_at: 0,
        }
    }

    #[test]
    fn progress_rows_are_per_particle() {
        let cache = ResultCache::temporary().unwrap();
        cache.record_progress(&progress(3, 1, 9.0)).unwrap();
        cache.record_progress(&progress(0, 4, 2.0)).unwrap();
        cache.record_progress(&progress(3, 2, 7.0)).unwrap();
        let rows = cache.progress().unwrap();
        assert_eq!(rows.iter().map(|p| (p.particle_id, p.epochs_completed)).collect::<Vec<_>>(), vec![(0, 4), (3, 2)]);
        assert_eq!(rows[1].position().unwrap(), pos(7.0, 0.0));
        // score rows are a separate tree
        assert!(cache.is_empty());
        assert_eq!(cache.progress_of(5).unwrap(), None);
    }

    #[test]
    fn merge_keeps_the_furthest_progress() {
        let src = scratch("progress");
        {
            let store = ResultCache::open(&src).unwrap();
            store.record_progress(&progress(0, 3, 4.0)).unwrap();
            store.record_progress(&progress(1, 8, 1.0)).unwrap();
            store.flush().unwrap();
        }
        let live = ResultCache::temporary().unwrap();
        live.record_progress(&progress(0, 6, 5.0)).unwrap();
        live.record_progress(&progress(1, 2, 3.0)).unwrap();
        live.merge(&[src.clone()]).unwrap();
        assert_eq!(live.progress_of(0).unwrap().unwrap().epochs_completed, 6);
        assert_eq!(live.progress_of(1).unwrap().unwrap().epochs_completed, 8);
        std::fs::remove_dir_all(&src).ok();
    }

    #[tokio::test]
    async fn reserve_serializes_same_key() {
        let cache = ResultCache::temporary().unwrap();
        let first = cache.reserve("k").await;
        let c2 = cache.clone();
        let waiter = tokio::spawn(async move { let _g = c2.reserve("k").await; });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        // other keys are not blocked
        let _other = cache.reserve("other").await;
        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        drop(_other);
        assert!(cache.locks.slots.lock().is_empty());
    }
}
