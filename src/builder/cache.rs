use crate::builder::chunk::Chunk;
use crate::builder::clipper::Clipper;
use crate::builder::heuristics::{self, MAX_DEPTH};
use crate::builder::hierarchy::Hierarchy;
use crate::endpoint::Endpoints;
use crate::metadata::Metadata;
use crate::pool::Pool;
use crate::shared::bounds::dir_of;
use crate::shared::{ChunkKey, Dxyz, Key, SpinLock, Voxel, Xyz};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static WRITTEN: AtomicU64 = AtomicU64::new(0);
static READ: AtomicU64 = AtomicU64::new(0);
static ALIVE: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, Default)]
pub struct CacheInfo {
    pub written: u64,
    pub read: u64,
    pub alive: u64,
}

/// Resident chunk plus its pin count. The refcount tracks clipper tier
/// memberships plus in-flight reloads, not `Arc` clones.
#[derive(Default)]
struct ReffedChunk {
    refs: u64,
    saving: bool,
    chunk: Option<Arc<Chunk>>,
}

/// Process-wide chunk residency. Slices are per-depth maps under their own
/// spin locks; `owned` records nodes whose tiles live on disk so a future
/// reference pages them back in. Serialization and eviction run on the clip
/// pool, concurrently with inserts at other chunks.
///
/// Slice locks are only ever taken in increasing depth order: descent goes
/// downward and a reload re-inserts into its own node (via the clipper) or
/// deeper ones.
pub struct ChunkCache {
    endpoints: Endpoints,
    metadata: Arc<Metadata>,
    hierarchy: Arc<Hierarchy>,
    pool: Pool,
    cache_size: u64,
    slices: Vec<SpinLock<HashMap<Xyz, ReffedChunk>>>,
    owned: SpinLock<HashSet<Dxyz>>,
    error: SpinLock<Option<io::Error>>,
}

impl ChunkCache {
    pub fn new(
        endpoints: Endpoints,
        metadata: Arc<Metadata>,
        hierarchy: Arc<Hierarchy>,
        clip_threads: u64,
    ) -> Arc<Self> {
        // Nodes already counted in the hierarchy have tiles on disk; a
        // resumed build must page them back in before inserting more.
        let owned: HashSet<Dxyz> = hierarchy
            .snapshot()
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(dxyz, _)| dxyz)
            .collect();

        Arc::new(Self {
            endpoints,
            metadata,
            hierarchy,
            pool: Pool::new(clip_threads),
            cache_size: heuristics::CACHE_SIZE,
            slices: (0..MAX_DEPTH).map(|_| SpinLock::default()).collect(),
            owned: SpinLock::new(owned),
            error: SpinLock::new(None),
        })
    }

    /// Route one point downward from `ck` until a chunk keeps it.
    pub fn insert(
        self: &Arc<Self>,
        voxel: &mut Voxel,
        key: &mut Key,
        ck: &ChunkKey,
        clipper: &mut Clipper,
    ) -> io::Result<()> {
        let mut ck = *ck;
        loop {
            let chunk = self.add_ref(&ck, clipper)?;
            if chunk.insert(self, clipper, voxel, key)? {
                return Ok(());
            }
            let dir = dir_of(ck.bounds().mid(), voxel.point());
            ck = *chunk.child_at(dir);
            key.step(voxel.point());
        }
    }

    /// Find or create the chunk at `ck`, pin it for `clipper`, and page its
    /// tile back in if it was previously serialized.
    fn add_ref(self: &Arc<Self>, ck: &ChunkKey, clipper: &mut Clipper) -> io::Result<Arc<Chunk>> {
        if let Some(chunk) = clipper.get(ck) {
            return Ok(chunk);
        }

        let depth = ck.depth() as usize;
        let mut slice = self.slices[depth].lock();
        let entry = slice.entry(ck.xyz()).or_default();
        entry.refs += 1;

        if let Some(chunk) = &entry.chunk {
            let chunk = Arc::clone(chunk);
            drop(slice);
            clipper.set(ck, Arc::clone(&chunk));
            return Ok(chunk);
        }

        let chunk = Arc::new(Chunk::new(
            Arc::clone(&self.metadata),
            *ck,
            &self.hierarchy,
        ));
        entry.chunk = Some(Arc::clone(&chunk));
        ALIVE.fetch_add(1, Ordering::Relaxed);

        // Register the pin before any reload so the reload's re-inserts hit
        // the clipper fast path instead of re-entering this slice.
        clipper.set(ck, Arc::clone(&chunk));

        let np = if self.owned.lock().contains(&ck.dxyz()) {
            self.hierarchy.get(ck.dxyz())
        } else {
            0
        };
        if np > 0 {
            READ.fetch_add(1, Ordering::Relaxed);
            chunk.load(self, clipper, &self.endpoints, np)?;
        }
        drop(slice);
        Ok(chunk)
    }

    /// Drop one pin for each stale chunk at `depth`. Reaching zero makes the
    /// chunk a candidate for eviction; it stays resident until purged.
    pub fn clip(&self, depth: usize, stale: HashMap<Xyz, Arc<Chunk>>) {
        let mut slice = self.slices[depth].lock();
        for (xyz, _chunk) in stale {
            let entry = slice
                .get_mut(&xyz)
                .expect("clipped chunk missing from its slice");
            assert!(entry.refs > 0, "chunk refcount underflow");
            entry.refs -= 1;
        }
    }

    pub fn clipped(self: &Arc<Self>) {
        self.maybe_purge(self.cache_size);
    }

    /// Schedule serialize+erase for the oldest unpinned chunks once more
    /// than `max_cache_size` are resident. The root slice is exempt.
    fn maybe_purge(self: &Arc<Self>, max_cache_size: u64) {
        let mut candidates = Vec::new();
        let mut resident = 0u64;
        for depth in (1..MAX_DEPTH).rev() {
            let mut slice = self.slices[depth].lock();
            for (xyz, entry) in slice.iter_mut() {
                if entry.refs == 0 && entry.chunk.is_some() {
                    resident += 1;
                    if !entry.saving {
                        candidates.push(Dxyz {
                            d: depth as u64,
                            xyz: *xyz,
                        });
                    }
                }
            }
        }
        if resident <= max_cache_size {
            return;
        }

        let excess = (resident - max_cache_size) as usize;
        for dxyz in candidates.into_iter().take(excess) {
            {
                let mut slice = self.slices[dxyz.d as usize].lock();
                match slice.get_mut(&dxyz.xyz) {
                    Some(entry) if entry.refs == 0 && entry.chunk.is_some() && !entry.saving => {
                        entry.saving = true;
                    }
                    _ => continue,
                }
            }
            let cache = Arc::clone(self);
            self.pool.add(move || {
                if let Err(e) = cache.reclaim(dxyz) {
                    cache.latch_error(e);
                }
            });
        }
    }

    /// Serialize one unpinned chunk and erase it. If the chunk was re-pinned
    /// while the tile was being written, the erase is abandoned and a later
    /// eviction rewrites the tile.
    fn reclaim(self: &Arc<Self>, dxyz: Dxyz) -> io::Result<()> {
        let depth = dxyz.d as usize;
        let chunk = {
            let mut slice = self.slices[depth].lock();
            let Some(entry) = slice.get_mut(&dxyz.xyz) else {
                return Ok(());
            };
            if entry.refs > 0 || entry.chunk.is_none() {
                entry.saving = false;
                return Ok(());
            }
            Arc::clone(entry.chunk.as_ref().expect("resident chunk"))
        };

        let np = chunk.save(&self.endpoints)?;

        let mut slice = self.slices[depth].lock();
        let Some(entry) = slice.get_mut(&dxyz.xyz) else {
            return Ok(());
        };
        entry.saving = false;
        if entry.refs > 0 {
            return Ok(());
        }

        if np > 0 {
            self.hierarchy.set(dxyz, np);
            self.owned.lock().insert(dxyz);
            WRITTEN.fetch_add(1, Ordering::Relaxed);
        }
        slice.remove(&dxyz.xyz);
        ALIVE.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drain outstanding eviction work, then serialize every still-resident
    /// chunk and publish its final count.
    pub fn join(self: &Arc<Self>) -> io::Result<()> {
        self.pool.join();
        self.take_error()?;

        for depth in (0..MAX_DEPTH).rev() {
            let drained: Vec<(Xyz, ReffedChunk)> =
                self.slices[depth].lock().drain().collect();
            for (xyz, entry) in drained {
                assert_eq!(entry.refs, 0, "chunk still pinned at join");
                let Some(chunk) = entry.chunk else { continue };
                let np = chunk.save(&self.endpoints)?;
                if np > 0 {
                    let dxyz = Dxyz {
                        d: depth as u64,
                        xyz,
                    };
                    self.hierarchy.set(dxyz, np);
                    self.owned.lock().insert(dxyz);
                    WRITTEN.fetch_add(1, Ordering::Relaxed);
                }
                ALIVE.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.take_error()
    }

    fn latch_error(&self, e: io::Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn take_error(&self) -> io::Result<()> {
        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Swap out the interval counters for the monitor; `alive` is a level,
    /// not a rate.
    pub fn latch_info() -> CacheInfo {
        CacheInfo {
            written: WRITTEN.swap(0, Ordering::Relaxed),
            read: READ.swap(0, Ordering::Relaxed),
            alive: ALIVE.load(Ordering::Relaxed),
        }
    }
}
