//! Out-of-core octree indexing for arbitrarily large point clouds.
//!
//! The builder streams points from input readers, routes each one to its
//! node in a bounded octree, resolves voxel collisions by midpoint distance,
//! spills dense nodes into children, and serializes cold nodes through a
//! byte-addressed storage endpoint. The output is a depth-indexed hierarchy
//! plus one binary tile per node, traversable by any EPT reader.

pub mod builder;
pub mod config;
pub mod endpoint;
pub mod manifest;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod shared;
pub mod tile;
