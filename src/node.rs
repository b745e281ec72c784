//! On-disk data model of the translation tree.
//!
//! An inner node block stores one `Type1Node` per child. The node of a
//! child carries the physical address of the child block, the generation
//! that last rewrote it, and the digest of the child block as it lies on
//! disk (for leaves, the digest of the ciphertext). Snapshots root the
//! hash chain.

use serde::{Deserialize, Serialize};

use crate::crypto::Hash;
use crate::prelude::*;
use crate::tree::{MAX_SNAPSHOTS, TREE_MAX_NR_OF_LEVELS};

/// One block of data, the unit of every transfer.
#[derive(Clone)]
pub struct Block(pub [u8; BLOCK_SIZE]);

impl Block {
    pub const fn zeroed() -> Self {
        Self([0u8; BLOCK_SIZE])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl Eq for Block {}

impl Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:02x?}..)", &self.0[..8])
    }
}

/// Reference to one child block within an inner node.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Type1Node {
    pub pba: Pba,
    pub gen: Generation,
    pub hash: Hash,
}

impl Type1Node {
    /// An all-zero node marks an unused child slot.
    pub fn is_valid(&self) -> bool {
        self.pba != 0 || self.gen != 0 || !self.hash.is_zero()
    }
}

/// The decoded content of one inner node block: one entry per child.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NodeBlock {
    nodes: Vec<Type1Node>,
}

impl NodeBlock {
    pub fn new(degree: TreeDegree) -> Self {
        Self {
            nodes: alloc::vec![Type1Node::default(); degree as usize],
        }
    }

    pub fn node(&self, idx: usize) -> Result<&Type1Node> {
        self.nodes
            .get(idx)
            .ok_or(Error::with_msg(InvalidArgs, "child index out of range"))
    }

    pub fn node_mut(&mut self, idx: usize) -> Result<&mut Type1Node> {
        self.nodes
            .get_mut(idx)
            .ok_or(Error::with_msg(InvalidArgs, "child index out of range"))
    }

    /// Encode into a zero-padded block.
    ///
    /// The padding is part of the block content, so encoding the same
    /// nodes always yields the same digest.
    pub fn encode(&self) -> Result<Block> {
        let mut block = Block::zeroed();
        postcard::to_slice(&self.nodes, block.as_mut_slice())
            .map_err(|_| Error::with_msg(InvalidArgs, "node block does not fit one block"))?;
        Ok(block)
    }

    pub fn decode(block: &Block) -> Result<Self> {
        let nodes: Vec<Type1Node> = postcard::from_bytes(block.as_slice())
            .map_err(|_| Error::with_msg(InvalidArgs, "malformed node block"))?;
        Ok(Self { nodes })
    }
}

/// The branch of nodes walked from the root down to a leaf reference.
///
/// Slot `level` holds the node read from the block at `level + 1`
/// (slot `max_level` holds the snapshot's root reference).
#[derive(Clone, Copy, Default, Debug)]
pub struct NodeWalk {
    pub nodes: [Type1Node; TREE_MAX_NR_OF_LEVELS],
}

/// One physical address per tree level, 0 meaning "not assigned yet".
#[derive(Clone, Copy, Default, Debug)]
pub struct TreeWalkPbas {
    pub pbas: [Pba; TREE_MAX_NR_OF_LEVELS],
}

/// Root of one version of the tree.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Snapshot {
    pub hash: Hash,
    pub pba: Pba,
    pub gen: Generation,
    pub nr_of_leaves: u64,
    pub max_level: TreeLevel,
    pub valid: bool,
}

impl Snapshot {
    pub fn contains_vba(&self, vba: Vba) -> bool {
        vba < self.nr_of_leaves
    }
}

/// Fixed table of snapshot slots.
#[derive(Clone, Copy, Debug)]
pub struct Snapshots {
    pub items: [Snapshot; MAX_SNAPSHOTS],
}

impl Default for Snapshots {
    fn default() -> Self {
        Self {
            items: [Snapshot::default(); MAX_SNAPSHOTS],
        }
    }
}

impl Snapshots {
    /// Slot of the valid snapshot with the highest generation.
    pub fn newest_idx(&self) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, snap)| snap.valid)
            .max_by_key(|(_, snap)| snap.gen)
            .map(|(idx, _)| idx)
    }

    /// Slot of the newest valid snapshot whose tree covers `vba`.
    pub fn newest_containing(&self, vba: Vba) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, snap)| snap.valid && snap.contains_vba(vba))
            .max_by_key(|(_, snap)| snap.gen)
            .map(|(idx, _)| idx)
    }

    /// Slot of the next snapshot older than `gen` that covers `vba`.
    pub fn next_older_containing(&self, vba: Vba, gen: Generation) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, snap)| snap.valid && snap.gen < gen && snap.contains_vba(vba))
            .max_by_key(|(_, snap)| snap.gen)
            .map(|(idx, _)| idx)
    }

    /// Slot a new snapshot may be committed into: the first invalid one,
    /// or else the lowest-generation slot that is neither the current nor
    /// the last secured generation.
    pub fn evictable_slot(
        &self,
        curr_gen: Generation,
        last_secured_gen: Generation,
    ) -> Option<usize> {
        if let Some((idx, _)) = self
            .items
            .iter()
            .enumerate()
            .find(|(_, snap)| !snap.valid)
        {
            return Some(idx);
        }
        self.items
            .iter()
            .enumerate()
            .filter(|(_, snap)| snap.gen != curr_gen && snap.gen != last_secured_gen)
            .min_by_key(|(_, snap)| snap.gen)
            .map(|(idx, _)| idx)
    }
}
