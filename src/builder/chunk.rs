use crate::builder::cache::ChunkCache;
use crate::builder::clipper::Clipper;
use crate::builder::heuristics;
use crate::builder::hierarchy::Hierarchy;
use crate::endpoint::Endpoints;
use crate::metadata::Metadata;
use crate::shared::bounds::dir_of;
use crate::shared::{schema, ChunkKey, Key, MemBlock, Slot, SpinLock, Voxel};
use crate::tile::{self, PointTable};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

/// One (x, y) column of a chunk's voxel grid, keyed by the key z coordinate.
struct VoxelTube {
    map: SpinLock<BTreeMap<u64, Slot>>,
}

/// Spill buffer for one child octant: points that collided in the grid and
/// belong to a child subtree that does not exist on disk yet.
pub struct Overflow {
    chunk_key: ChunkKey,
    block: MemBlock,
    list: Vec<OverflowEntry>,
}

struct OverflowEntry {
    key: Key,
    slot: Slot,
}

impl Overflow {
    fn new(chunk_key: ChunkKey, point_size: usize) -> Self {
        Self {
            chunk_key,
            block: MemBlock::new(point_size, heuristics::OVERFLOW_BLOCK_PAGE),
            list: Vec::new(),
        }
    }

    fn insert(&mut self, voxel: &Voxel, key: &Key) {
        let slot = self.block.alloc();
        voxel.write_to(self.block.record_mut(slot));
        self.list.push(OverflowEntry { key: *key, slot });
    }

    fn size(&self) -> u64 {
        self.block.size()
    }
}

struct OverflowState {
    slots: [Option<Box<Overflow>>; 8],
    count: u64,
}

/// One octree node: a span-by-span grid of voxel tubes backed by a bump
/// arena, plus eight optional overflow buffers.
pub struct Chunk {
    metadata: Arc<Metadata>,
    span: u64,
    point_size: usize,
    chunk_key: ChunkKey,
    child_keys: [ChunkKey; 8],
    grid: Vec<VoxelTube>,
    grid_block: SpinLock<MemBlock>,
    overflow: SpinLock<OverflowState>,
}

impl Chunk {
    pub fn new(metadata: Arc<Metadata>, chunk_key: ChunkKey, hierarchy: &Hierarchy) -> Self {
        let span = metadata.span;
        let point_size = metadata.point_size();
        let child_keys = std::array::from_fn(|dir| chunk_key.get_step(dir as u8));

        // A child that already has points on disk gets no overflow buffer:
        // its points route downward instead.
        let slots = std::array::from_fn(|dir| {
            let child: &ChunkKey = &child_keys[dir];
            if hierarchy.get(child.dxyz()) > 0 {
                None
            } else {
                Some(Box::new(Overflow::new(*child, point_size)))
            }
        });

        Self {
            metadata,
            span,
            point_size,
            chunk_key,
            child_keys,
            grid: (0..span * span)
                .map(|_| VoxelTube {
                    map: SpinLock::default(),
                })
                .collect(),
            grid_block: SpinLock::new(MemBlock::new(point_size, heuristics::GRID_BLOCK_PAGE)),
            overflow: SpinLock::new(OverflowState { slots, count: 0 }),
        }
    }

    pub fn chunk_key(&self) -> &ChunkKey {
        &self.chunk_key
    }

    pub fn child_at(&self, dir: u8) -> &ChunkKey {
        &self.child_keys[dir as usize]
    }

    /// Place a point in this chunk. Returns false when the caller must
    /// descend and retry at the child containing the point.
    pub fn insert(
        &self,
        cache: &Arc<ChunkCache>,
        clipper: &mut Clipper,
        voxel: &mut Voxel,
        key: &mut Key,
    ) -> io::Result<bool> {
        let pos = key.position();
        let index = ((pos.y % self.span) * self.span + (pos.x % self.span)) as usize;
        let tube = &self.grid[index];

        let mut map = tube.map.lock();
        match map.entry(pos.z) {
            Entry::Vacant(vacant) => {
                let mut block = self.grid_block.lock();
                let slot = block.alloc();
                voxel.write_to(block.record_mut(slot));
                drop(block);
                vacant.insert(slot);
                return Ok(true);
            }
            Entry::Occupied(occupied) => {
                let slot = *occupied.get();
                let mut block = self.grid_block.lock();
                let mid = key.bounds().mid();
                let resident = schema::read_point(block.record(slot));
                if voxel.point().distance_squared(mid) < resident.distance_squared(mid) {
                    // The closer point takes the slot; the displaced record
                    // continues onward in the voxel.
                    voxel.swap_deep(block.record_mut(slot));
                }
            }
        }
        drop(map);

        self.insert_overflow(cache, clipper, voxel, key)
    }

    fn insert_overflow(
        &self,
        cache: &Arc<ChunkCache>,
        clipper: &mut Clipper,
        voxel: &mut Voxel,
        key: &mut Key,
    ) -> io::Result<bool> {
        // Above the shared depth multiple subsets may feed one node, so
        // nothing may linger in overflow; the point descends instead.
        if self.chunk_key.depth() < self.metadata.shared_depth() {
            return Ok(false);
        }

        let dir = dir_of(self.chunk_key.bounds().mid(), voxel.point());
        let should_split;
        {
            let mut state = self.overflow.lock();
            let Some(buffer) = state.slots[dir as usize].as_mut() else {
                // Already split into that child; descend and retry there.
                return Ok(false);
            };
            buffer.insert(voxel, key);
            state.count += 1;
            should_split = state.count >= self.metadata.min_node_size;
        }

        if should_split {
            self.maybe_overflow(cache, clipper)?;
        }
        Ok(true)
    }

    /// Split the largest overflow into its child if this chunk has outgrown
    /// `max_node_size`. The buffer is detached under the lock and its points
    /// re-inserted after release, each stepped one level down.
    fn maybe_overflow(&self, cache: &Arc<ChunkCache>, clipper: &mut Clipper) -> io::Result<()> {
        if self.chunk_key.depth() + 1 >= heuristics::MAX_DEPTH as u64 {
            return Ok(());
        }

        let grid_size = self.grid_block.lock().size();

        let detached = {
            let mut state = self.overflow.lock();
            if grid_size + state.count < self.metadata.max_node_size {
                return Ok(());
            }

            let mut selected = 0;
            let mut selected_size = 0;
            for dir in 0..state.slots.len() {
                if let Some(buffer) = &state.slots[dir] {
                    if buffer.size() > selected_size {
                        selected = dir;
                        selected_size = buffer.size();
                    }
                }
            }

            // The largest buffer must itself be worth a node.
            if selected_size < self.metadata.min_node_size {
                return Ok(());
            }

            let buffer = state.slots[selected].take().expect("selected overflow");
            state.count -= buffer.size();
            buffer
        };

        let child = detached.chunk_key;
        for entry in &detached.list {
            let record = detached.block.record(entry.slot);
            let mut voxel = Voxel::init_shallow(schema::read_point(record), record);
            let mut key = entry.key;
            key.step(voxel.point());
            cache.insert(&mut voxel, &mut key, &child, clipper)?;
        }
        Ok(())
    }

    /// Serialize this chunk's grid and overflow records as one tile.
    /// Returns the point count written; an empty chunk writes nothing.
    pub fn save(&self, endpoints: &Endpoints) -> io::Result<u64> {
        let table = {
            let block = self.grid_block.lock();
            let state = self.overflow.lock();

            let mut np = block.size();
            for buffer in state.slots.iter().flatten() {
                np += buffer.size();
            }
            if np == 0 {
                return Ok(0);
            }

            let mut table = PointTable::reserve(self.point_size, np);
            for record in block.iter() {
                table.append(record);
            }
            for buffer in state.slots.iter().flatten() {
                for record in buffer.block.iter() {
                    table.append(record);
                }
            }
            table
        };

        let stem = format!(
            "{}{}",
            self.chunk_key,
            self.metadata.postfix_at_depth(self.chunk_key.depth())
        );
        tile::write(
            self.metadata.data_type,
            &endpoints.data,
            &stem,
            &table,
            self.chunk_key.bounds(),
        )?;
        Ok(table.len())
    }

    /// Re-insert a persisted tile's points through the cache; the reopen and
    /// merge path.
    pub fn load(
        &self,
        cache: &Arc<ChunkCache>,
        clipper: &mut Clipper,
        endpoints: &Endpoints,
        np: u64,
    ) -> io::Result<()> {
        let stem = format!(
            "{}{}",
            self.chunk_key,
            self.metadata.postfix_at_depth(self.chunk_key.depth())
        );
        let table = tile::read(
            self.metadata.data_type,
            &endpoints.data,
            &stem,
            self.point_size,
        )?;
        if table.len() != np {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "tile {stem} holds {} points but the hierarchy records {np}",
                    table.len()
                ),
            ));
        }

        let mut key = Key::new(self.metadata.bounds, self.metadata.span_shift());
        for record in table.iter() {
            let point = schema::read_point(record);
            let mut voxel = Voxel::init_shallow(point, record);
            key.init(point, self.chunk_key.depth());
            cache.insert(&mut voxel, &mut key, &self.chunk_key, clipper)?;
        }
        Ok(())
    }
}
