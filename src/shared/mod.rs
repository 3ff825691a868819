pub mod bounds;
pub mod key;
pub mod schema;
pub mod spin;
pub mod voxel;

pub use bounds::{dir_of, Bounds, Dir, DIR_END};
pub use key::{ChunkKey, Dxyz, Key, Xyz};
pub use schema::{DimType, Dimension, Schema};
pub use spin::{SpinGuard, SpinLock};
pub use voxel::{MemBlock, Slot, Voxel};
