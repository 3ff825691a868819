use crate::builder::cache::ChunkCache;
use crate::builder::chunk::Chunk;
use crate::builder::heuristics::MAX_DEPTH;
use crate::shared::{ChunkKey, Xyz};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-worker front end over the chunk cache. Three aging tiers per depth:
/// `fast` is the most recently used chunk, `slow` holds chunks still hot,
/// `aged` is released on the next clip. Each tier membership holds exactly
/// one cache pin; promotion moves the entry (and its pin) without touching
/// the refcount, so promote/demote churn can never double-release.
pub struct Clipper {
    fast: Vec<Option<(Xyz, Arc<Chunk>)>>,
    slow: Vec<HashMap<Xyz, Arc<Chunk>>>,
    aged: Vec<HashMap<Xyz, Arc<Chunk>>>,
}

impl Clipper {
    pub fn new() -> Self {
        Self {
            fast: (0..MAX_DEPTH).map(|_| None).collect(),
            slow: (0..MAX_DEPTH).map(|_| HashMap::new()).collect(),
            aged: (0..MAX_DEPTH).map(|_| HashMap::new()).collect(),
        }
    }

    /// Constant-time hit on the hot chunk, else a probe through the colder
    /// tiers; any hit is promoted back to `fast`.
    pub fn get(&mut self, ck: &ChunkKey) -> Option<Arc<Chunk>> {
        let depth = ck.depth() as usize;
        let xyz = ck.xyz();

        if let Some((fast_xyz, chunk)) = &self.fast[depth] {
            if *fast_xyz == xyz {
                return Some(Arc::clone(chunk));
            }
        }

        let found = self.slow[depth]
            .remove(&xyz)
            .or_else(|| self.aged[depth].remove(&xyz))?;
        self.install(depth, xyz, Arc::clone(&found));
        Some(found)
    }

    /// Adopt a freshly pinned chunk as the hot entry for its depth.
    pub fn set(&mut self, ck: &ChunkKey, chunk: Arc<Chunk>) {
        self.install(ck.depth() as usize, ck.xyz(), chunk);
    }

    fn install(&mut self, depth: usize, xyz: Xyz, chunk: Arc<Chunk>) {
        if let Some((old_xyz, old_chunk)) = self.fast[depth].take() {
            self.slow[depth].insert(old_xyz, old_chunk);
        }
        self.fast[depth] = Some((xyz, chunk));
    }

    /// Release the aged tier and rotate: chunks untouched for two clip
    /// windows lose this worker's pin. `fast` survives rotation.
    pub fn clip(&mut self, cache: &Arc<ChunkCache>) {
        for depth in 0..MAX_DEPTH {
            let stale = std::mem::take(&mut self.aged[depth]);
            if !stale.is_empty() {
                cache.clip(depth, stale);
            }
            self.aged[depth] = std::mem::take(&mut self.slow[depth]);
        }
        cache.clipped();
    }

    /// Drop every remaining pin. Workers call this on success and error
    /// paths alike before the cache is joined.
    pub fn release(&mut self, cache: &Arc<ChunkCache>) {
        for depth in 0..MAX_DEPTH {
            let mut stale = std::mem::take(&mut self.aged[depth]);
            stale.extend(std::mem::take(&mut self.slow[depth]));
            if let Some((xyz, chunk)) = self.fast[depth].take() {
                stale.insert(xyz, chunk);
            }
            if !stale.is_empty() {
                cache.clip(depth, stale);
            }
        }
        cache.clipped();
    }

    #[cfg(test)]
    pub fn pinned_count(&self) -> usize {
        let fast = self.fast.iter().filter(|slot| slot.is_some()).count();
        let slow: usize = self.slow.iter().map(|m| m.len()).sum();
        let aged: usize = self.aged.iter().map(|m| m.len()).sum();
        fast + slow + aged
    }
}

impl Default for Clipper {
    fn default() -> Self {
        Self::new()
    }
}
