// src/cache.rs
//! Fixed-memory, set-associative prediction cache.
//!
//! Maps a position's Zobrist key to its network evaluation: a parent
//! perspective value plus up to [`MAX_CACHED_MOVES`] (move, prior) pairs.
//! Buckets are cache-line-aligned chunks scanned linearly; eviction is a
//! per-bucket age scheme, no global lock anywhere. All fields are atomic
//! words: a store publishes the key last with `Release`, a probe reads the
//! key around the body copy so a torn entry is detected and rejected.

use crate::game::Mv;
use std::array;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Branch limit: positions keep at most this many moves in the cache (and in
/// the tree, when the evaluation goes through the cache).
pub const MAX_CACHED_MOVES: usize = 52;

const ENTRY_COUNT: usize = 7;

#[repr(C, align(64))]
struct PredictionCacheEntry {
    key: AtomicU64,
    value: AtomicU32,
    move_count: AtomicU32,
    moves: [AtomicU16; MAX_CACHED_MOVES],
    priors: [AtomicU8; MAX_CACHED_MOVES],
}

// Entry spans three cache lines; the chunk pads to a power-of-two boundary
// so chunks never straddle each other.
const _: () = assert!(std::mem::size_of::<PredictionCacheEntry>() == 192);
const _: () = assert!(std::mem::size_of::<PredictionCacheChunk>() == 2048);

impl PredictionCacheEntry {
    fn new() -> Self {
        PredictionCacheEntry {
            key: AtomicU64::new(0),
            value: AtomicU32::new(0),
            move_count: AtomicU32::new(0),
            moves: array::from_fn(|_| AtomicU16::new(0)),
            priors: array::from_fn(|_| AtomicU8::new(0)),
        }
    }

    fn clear(&self) {
        self.key.store(0, Ordering::Relaxed);
        self.value.store(0, Ordering::Relaxed);
        self.move_count.store(0, Ordering::Relaxed);
        for mv in &self.moves {
            mv.store(0, Ordering::Relaxed);
        }
        for prior in &self.priors {
            prior.store(0, Ordering::Relaxed);
        }
    }
}

#[repr(C, align(2048))]
pub struct PredictionCacheChunk {
    entries: [PredictionCacheEntry; ENTRY_COUNT],
    ages: [AtomicU32; ENTRY_COUNT],
}

impl PredictionCacheChunk {
    fn new() -> Self {
        PredictionCacheChunk {
            entries: array::from_fn(|_| PredictionCacheEntry::new()),
            ages: array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn touch(&self) {
        for age in &self.ages {
            age.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Bucket handle returned by a probe and consumed by the matching store, so
/// the store does not re-hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHandle(usize);

pub struct CacheHit {
    pub value: f32,
    pub move_count: usize,
}

pub struct PredictionCache {
    chunks: Vec<PredictionCacheChunk>,

    probe_count: AtomicU64,
    hit_count: AtomicU64,
    eviction_count: AtomicU64,
    entry_count: AtomicU64,
}

impl PredictionCache {
    pub fn new(size_gb: usize) -> Self {
        Self::with_bytes(size_gb << 30)
    }

    pub fn with_bytes(bytes: usize) -> Self {
        let chunk_count = (bytes / std::mem::size_of::<PredictionCacheChunk>()).max(1);
        let mut chunks = Vec::with_capacity(chunk_count);
        chunks.resize_with(chunk_count, PredictionCacheChunk::new);
        log::info!(
            "prediction cache: {} chunks, {} entries, {} MiB",
            chunk_count,
            chunk_count * ENTRY_COUNT,
            chunk_count * std::mem::size_of::<PredictionCacheChunk>() >> 20
        );
        PredictionCache {
            chunks,
            probe_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
        }
    }

    pub fn entry_capacity(&self) -> usize {
        self.chunks.len() * ENTRY_COUNT
    }

    /// Look `key` up in its bucket. On a hit the cached moves and dequantized
    /// priors are copied into `moves`/`priors`. Either way the bucket handle
    /// comes back for the follow-up store.
    pub fn probe(
        &self,
        key: u64,
        moves: &mut Vec<Mv>,
        priors: &mut Vec<f32>,
    ) -> (ChunkHandle, Option<CacheHit>) {
        let chunk_index = (key % self.chunks.len() as u64) as usize;
        let chunk = &self.chunks[chunk_index];
        let handle = ChunkHandle(chunk_index);

        self.probe_count.fetch_add(1, Ordering::Relaxed);
        chunk.touch();

        for entry in &chunk.entries {
            if key == 0 || entry.key.load(Ordering::Acquire) != key {
                continue;
            }
            let value = f32::from_bits(entry.value.load(Ordering::Relaxed));
            let move_count = entry.move_count.load(Ordering::Relaxed) as usize;
            if move_count > MAX_CACHED_MOVES {
                continue;
            }
            moves.clear();
            priors.clear();
            for i in 0..move_count {
                moves.push(Mv(entry.moves[i].load(Ordering::Relaxed)));
                priors.push(entry.priors[i].load(Ordering::Relaxed) as f32 / 255.0);
            }
            // Re-check the key: a concurrent store rewrites it (via zero)
            // before publishing, so a changed key means we read a torn body.
            if entry.key.load(Ordering::Acquire) != key {
                continue;
            }
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return (handle, Some(CacheHit { value, move_count }));
        }

        (handle, None)
    }

    /// Write an evaluation into the bucket from a prior probe. Prefers an
    /// empty slot; otherwise evicts the minimum-age entry, lowest index on
    /// ties. The new entry's age resets to zero.
    pub fn store(&self, handle: ChunkHandle, key: u64, value: f32, moves: &[Mv], priors: &[f32]) {
        debug_assert!(moves.len() <= MAX_CACHED_MOVES);
        debug_assert_eq!(moves.len(), priors.len());
        if key == 0 || moves.len() > MAX_CACHED_MOVES {
            return;
        }

        let chunk = &self.chunks[handle.0];
        chunk.touch();

        let mut slot = None;
        for (i, entry) in chunk.entries.iter().enumerate() {
            if entry.key.load(Ordering::Relaxed) == 0 {
                slot = Some(i);
                break;
            }
        }
        let index = match slot {
            Some(i) => {
                self.entry_count.fetch_add(1, Ordering::Relaxed);
                i
            }
            None => {
                let mut min_index = 0;
                let mut min_age = u32::MAX;
                for (i, age) in chunk.ages.iter().enumerate() {
                    let age = age.load(Ordering::Relaxed);
                    if age < min_age {
                        min_age = age;
                        min_index = i;
                    }
                }
                self.eviction_count.fetch_add(1, Ordering::Relaxed);
                min_index
            }
        };

        let entry = &chunk.entries[index];
        // Invalidate first so concurrent probes cannot accept a half-written
        // body under the old or new key.
        entry.key.store(0, Ordering::Release);
        entry.value.store(value.to_bits(), Ordering::Relaxed);
        entry
            .move_count
            .store(moves.len() as u32, Ordering::Relaxed);
        for (i, (mv, prior)) in moves.iter().zip(priors).enumerate() {
            entry.moves[i].store(mv.0, Ordering::Relaxed);
            entry.priors[i].store(quantize_prior(*prior), Ordering::Relaxed);
        }
        chunk.ages[index].store(0, Ordering::Relaxed);
        entry.key.store(key, Ordering::Release);
    }

    pub fn clear(&self) {
        for chunk in &self.chunks {
            for entry in &chunk.entries {
                entry.clear();
            }
            for age in &chunk.ages {
                age.store(0, Ordering::Relaxed);
            }
        }
        self.entry_count.store(0, Ordering::Relaxed);
    }

    pub fn reset_probe_metrics(&self) {
        self.probe_count.store(0, Ordering::Relaxed);
        self.hit_count.store(0, Ordering::Relaxed);
        self.eviction_count.store(0, Ordering::Relaxed);
    }

    pub fn permille_full(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed) * 1000 / self.entry_capacity() as u64
    }

    pub fn permille_hits(&self) -> u64 {
        permille(
            self.hit_count.load(Ordering::Relaxed),
            self.probe_count.load(Ordering::Relaxed),
        )
    }

    pub fn permille_evictions(&self) -> u64 {
        permille(
            self.eviction_count.load(Ordering::Relaxed),
            self.probe_count.load(Ordering::Relaxed),
        )
    }
}

fn permille(part: u64, whole: u64) -> u64 {
    if whole == 0 {
        0
    } else {
        part * 1000 / whole
    }
}

fn quantize_prior(prior: f32) -> u8 {
    (prior.clamp(0.0, 1.0) * 255.0).round() as u8
}
