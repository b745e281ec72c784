//! Formatting a fresh tree.

use crate::bio::BlockIo;
use crate::crypto::digest;
use crate::node::{NodeBlock, Snapshot};
use crate::prelude::*;
use crate::tree::{degree_is_valid, TREE_MAX_LEVEL};

/// Write an empty root node block at `root_pba` and return the snapshot
/// rooting it.
///
/// The snapshot is valid but covers zero leaves; extension steps grow it
/// into a usable tree.
pub fn format<B: BlockIo>(
    bio: &B,
    degree: TreeDegree,
    max_level: TreeLevel,
    root_pba: Pba,
) -> Result<Snapshot> {
    if !degree_is_valid(degree) {
        return_errno_with_msg!(InvalidArgs, "unsupported tree degree");
    }
    if max_level == 0 || max_level > TREE_MAX_LEVEL {
        return_errno_with_msg!(InvalidArgs, "unsupported tree height");
    }
    if root_pba == 0 || root_pba == INVALID_PBA {
        return_errno_with_msg!(InvalidArgs, "unusable root pba");
    }

    let root_blk = NodeBlock::new(degree).encode()?;
    bio.write(root_pba, &root_blk)?;

    Ok(Snapshot {
        hash: digest(&root_blk),
        pba: root_pba,
        gen: INITIAL_GENERATION,
        nr_of_leaves: 0,
        max_level,
        valid: true,
    })
}
