//! Geometry of the translation tree.
//!
//! A tree of height `h` with degree `d` maps the virtual block addresses
//! `0..d^h` to physical block addresses. Inner nodes live at levels
//! `1..=h`, leaves (data blocks) at level 0. The index of the child to
//! follow at each level is a fixed bit field of the VBA, so the degree
//! must be a power of two.

use static_assertions::const_assert;

/// Physical block address.
pub type Pba = u64;
/// Virtual block address.
pub type Vba = u64;
/// Monotonic generation number of a tree update.
pub type Generation = u64;
/// Identifier of an encryption key epoch.
pub type KeyId = u32;
/// Level within the tree, 0 for leaves.
pub type TreeLevel = usize;
/// Number of children per inner node.
pub type TreeDegree = u64;

/// Size of every block, node or leaf, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Highest level an inner node can live at.
pub const TREE_MAX_LEVEL: TreeLevel = 6;
/// Number of levels including the leaf level.
pub const TREE_MAX_NR_OF_LEVELS: usize = TREE_MAX_LEVEL + 1;
/// Largest supported node degree.
pub const TREE_MAX_DEGREE: TreeDegree = 64;

/// Number of slots in a snapshot table.
pub const MAX_SNAPSHOTS: usize = 48;

/// Generation of nodes created by tree extension, never by a write.
pub const INITIAL_GENERATION: Generation = 0;
/// Marker for a physical address that does not reference a block.
pub const INVALID_PBA: Pba = Pba::MAX;

const_assert!(TREE_MAX_DEGREE.is_power_of_two());

/// Whether `degree` is usable as a node degree.
pub fn degree_is_valid(degree: TreeDegree) -> bool {
    degree.is_power_of_two() && degree >= 2 && degree <= TREE_MAX_DEGREE
}

/// Index of the child to follow at `level` when resolving `vba`.
///
/// `level` counts from 1 (the nodes directly above the leaves).
pub fn node_index(vba: Vba, level: TreeLevel, degree: TreeDegree) -> usize {
    debug_assert!(level >= 1 && degree.is_power_of_two());
    let bits_per_level = degree.trailing_zeros() as usize;
    ((vba >> (bits_per_level * (level - 1))) & (degree - 1)) as usize
}

/// Highest VBA addressable by a tree of the given degree and height.
pub fn max_vba(degree: TreeDegree, height: TreeLevel) -> Vba {
    degree.pow(height as u32) - 1
}
