// Tunables for the build loop. The clip cadence and node sizes are
// configurable through the build config; the rest are fixed.

/// After this many points, a worker clips: reference-decrementing the chunks
/// it has not touched in the past two clip windows, which makes them
/// eligible for serialization.
pub const SLEEP_COUNT: u64 = 65_536 * 32;

/// How many unreferenced chunks the cache keeps resident.
pub const CACHE_SIZE: u64 = 64;

/// Serialization costs more than tree work, so a bare thread count is split
/// roughly one work thread to two clip threads.
pub const WORK_TO_CLIP_RATIO: f64 = 0.33;

/// Max nodes stored in a single hierarchy file before it is stepped.
pub const MAX_HIERARCHY_NODES_PER_FILE: u64 = 32_768;

/// Depth cap: bounds the cache's slice array and stops overflow splits, so
/// coincident points terminate in the deepest chunk's overflow.
pub const MAX_DEPTH: usize = 32;

/// Grid arenas grow in large pages, overflow arenas in small ones.
pub const GRID_BLOCK_PAGE: usize = 4096;
pub const OVERFLOW_BLOCK_PAGE: usize = 256;

pub const DEFAULT_SPAN: u64 = 128;
pub const MIN_NODE_SIZE: u64 = 32_768;
pub const MAX_NODE_SIZE: u64 = 65_536;
