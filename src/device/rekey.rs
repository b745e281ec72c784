//! Moving the branches of one VBA to the current key, in every snapshot.
//!
//! Rekeying walks the snapshots newest to oldest. The first pass reads,
//! decrypts under the previous key, re-encrypts under the current key
//! and relocates the whole branch. Older passes compare the physical
//! addresses they encounter with those recorded by the newer pass: a
//! matching address means the subtree below it is shared and already
//! relocated, so the pass only relinks it. Leaves of the initial
//! generation carry no data and are relocated without re-encryption.
//! Snapshots whose root is already part of a relocated branch, the whole
//! root of a newer snapshot or, for a shorter tree, one of its inner
//! blocks, are updated directly without another walk. Generations are
//! never touched, so the snapshots keep their identity.

use crate::crypto::digest;
use crate::device::channel::{Channel, ChannelState, RekeyRoute, SubOp};
use crate::free::AllocPolicy;
use crate::node::Type1Node;
use crate::prelude::*;
use crate::request::Request;
use crate::tree::{degree_is_valid, node_index};

pub(crate) fn execute(chan: &mut Channel, req: &mut Request) -> bool {
    match chan.state {
        ChannelState::Submitted => {
            chan.vba = req.vba;
            if !degree_is_valid(req.degree) {
                chan.mark_failed(req, "check tree degree");
                return true;
            }
            let Some(first_idx) = req.snapshots.newest_idx() else {
                chan.mark_failed(req, "find first snapshot");
                return true;
            };
            let snap = req.snapshots.items[first_idx];
            if !snap.contains_vba(chan.vba) {
                chan.mark_failed(req, "check vba in newest snapshot");
                return true;
            }
            chan.snap_idx = first_idx;
            chan.first_snapshot = true;
            chan.lvl = snap.max_level;
            chan.old_pbas[chan.lvl] = snap.pba;
            debug!(
                "rekey_vba {}: snapshot {}, root pba {}",
                chan.vba, chan.snap_idx, snap.pba
            );
            chan.generate(
                SubOp::ReadNodeBlock { pba: snap.pba },
                ChannelState::ReadBlockDone,
            );
            true
        }
        ChannelState::ReadBlockDone if chan.lvl >= 1 => {
            if let Err(step) = chan.check_read_node_block(req) {
                chan.mark_failed(req, step);
                return true;
            }
            if let Err(step) = chan.decode_read_node_block() {
                chan.mark_failed(req, step);
                return true;
            }
            let child = match chan.child_node(req, chan.lvl) {
                Ok(child) => child,
                Err(step) => {
                    chan.mark_failed(req, step);
                    return true;
                }
            };
            if chan.lvl > 1 {
                let child_lvl = chan.lvl - 1;
                if !chan.first_snapshot && chan.old_pbas[child_lvl] == child.pba {
                    // Subtree shared with an already rekeyed snapshot.
                    chan.lvl = child_lvl;
                    if let Err(step) =
                        generate_alloc(chan, req, child_lvl + 1, RekeyRoute::SkipInner)
                    {
                        chan.mark_failed(req, step);
                    }
                } else {
                    chan.old_pbas[child_lvl] = child.pba;
                    chan.lvl = child_lvl;
                    chan.generate(
                        SubOp::ReadNodeBlock { pba: child.pba },
                        ChannelState::ReadBlockDone,
                    );
                }
            } else if !chan.first_snapshot && chan.data_old_pba == child.pba {
                // Leaf shared with an already rekeyed snapshot.
                if let Err(step) = generate_alloc(chan, req, 1, RekeyRoute::SkipLeaf) {
                    chan.mark_failed(req, step);
                }
            } else if child.gen == INITIAL_GENERATION {
                // Unused leaf, reads yield zeroes under any key.
                if let Err(step) = generate_alloc(chan, req, 0, RekeyRoute::NoRekeyLeaf) {
                    chan.mark_failed(req, step);
                }
            } else {
                chan.data_old_pba = child.pba;
                chan.lvl = 0;
                chan.generate(
                    SubOp::ReadLeafBlock { pba: child.pba },
                    ChannelState::ReadBlockDone,
                );
            }
            true
        }
        ChannelState::ReadBlockDone => {
            let leaf = match chan.child_node(req, 1) {
                Ok(leaf) => leaf,
                Err(step) => {
                    chan.mark_failed(req, step);
                    return true;
                }
            };
            if digest(&chan.data_blk) != leaf.hash {
                chan.mark_failed(req, "check leaf hash");
                return true;
            }
            chan.generate(
                SubOp::DecryptLeaf {
                    key_id: req.prev_key,
                    pba: chan.data_old_pba,
                },
                ChannelState::DecryptDone,
            );
            true
        }
        ChannelState::DecryptDone => {
            if let Err(step) = generate_alloc(chan, req, 0, RekeyRoute::Reencrypt) {
                chan.mark_failed(req, step);
            }
            true
        }
        ChannelState::AllocDone => {
            match chan.rekey_route {
                RekeyRoute::Reencrypt => {
                    chan.generate(
                        SubOp::EncryptLeaf {
                            key_id: req.curr_key,
                            pba: chan.new_pbas.pbas[0],
                        },
                        ChannelState::EncryptDone,
                    );
                }
                RekeyRoute::SkipLeaf => {
                    // The relocated ciphertext of the newer pass is still
                    // in the data buffer.
                    chan.lvl = 0;
                    if let Err(step) = relink_child(chan, req, Some(digest(&chan.data_blk))) {
                        chan.mark_failed(req, step);
                    }
                }
                RekeyRoute::NoRekeyLeaf => {
                    chan.lvl = 0;
                    if let Err(step) = relink_child(chan, req, None) {
                        chan.mark_failed(req, step);
                    }
                }
                RekeyRoute::SkipInner => {
                    let encoded = match chan.t1_blks[chan.lvl].encode() {
                        Ok(encoded) => encoded,
                        Err(_) => {
                            chan.mark_failed(req, "encode node block");
                            return true;
                        }
                    };
                    if let Err(step) = relink_child(chan, req, Some(digest(&encoded))) {
                        chan.mark_failed(req, step);
                    }
                }
            }
            true
        }
        ChannelState::EncryptDone => {
            chan.lvl = 0;
            chan.generate(
                SubOp::WriteLeafBlock {
                    pba: chan.new_pbas.pbas[0],
                },
                ChannelState::WriteBlockDone,
            );
            true
        }
        ChannelState::WriteBlockDone => {
            let snap = req.snapshots.items[chan.snap_idx];
            if chan.lvl == snap.max_level {
                finish_pass(chan, req);
                return true;
            }
            let hash = if chan.lvl == 0 {
                digest(&chan.data_blk)
            } else {
                digest(&chan.encoded_blk)
            };
            if let Err(step) = relink_child(chan, req, Some(hash)) {
                chan.mark_failed(req, step);
            }
            true
        }
        _ => false,
    }
}

/// Point the parent entry of the block at level `chan.lvl` at its new
/// address (and hash, when the content changed), then write the parent.
fn relink_child(
    chan: &mut Channel,
    req: &Request,
    child_hash: Option<crate::crypto::Hash>,
) -> core::result::Result<(), &'static str> {
    let child_lvl = chan.lvl;
    let parent_lvl = child_lvl + 1;
    let idx = node_index(chan.vba, parent_lvl, req.degree);
    let node = chan.t1_blks[parent_lvl]
        .node_mut(idx)
        .map_err(|_| "malformed node block")?;
    node.pba = chan.new_pbas.pbas[child_lvl];
    if let Some(hash) = child_hash {
        node.hash = hash;
    }
    chan.lvl = parent_lvl;
    chan.generate(
        SubOp::WriteNodeBlock {
            pba: chan.new_pbas.pbas[parent_lvl],
            lvl: parent_lvl,
        },
        ChannelState::WriteBlockDone,
    );
    Ok(())
}

/// Prepare the allocation of new addresses for the levels
/// `min_lvl..=max_level`; levels below keep the addresses the newer
/// pass settled on.
fn generate_alloc(
    chan: &mut Channel,
    req: &Request,
    min_lvl: TreeLevel,
    route: RekeyRoute,
) -> core::result::Result<(), &'static str> {
    let snap = req.snapshots.items[chan.snap_idx];
    if min_lvl > snap.max_level {
        return Err("check min level for alloc");
    }
    let free_gen = if chan.first_snapshot {
        req.curr_gen
    } else {
        snap.gen + 1
    };
    let mut nr_of_blks = 0;
    for lvl in 0..TREE_MAX_NR_OF_LEVELS {
        if lvl > snap.max_level {
            chan.walk.nodes[lvl] = Type1Node::default();
            chan.new_pbas.pbas[lvl] = 0;
        } else if lvl == snap.max_level {
            nr_of_blks += 1;
            chan.new_pbas.pbas[lvl] = 0;
            chan.walk.nodes[lvl] = Type1Node {
                pba: snap.pba,
                gen: snap.gen,
                hash: snap.hash,
            };
        } else if lvl >= min_lvl {
            nr_of_blks += 1;
            chan.new_pbas.pbas[lvl] = 0;
            chan.walk.nodes[lvl] = chan.child_node(req, lvl + 1)?;
        } else {
            let child = chan.child_node(req, lvl + 1)?;
            chan.walk.nodes[lvl] = Type1Node {
                pba: chan.new_pbas.pbas[lvl],
                gen: child.gen,
                hash: child.hash,
            };
        }
    }
    let policy = if chan.first_snapshot {
        AllocPolicy::RekeyingCurrentGen
    } else {
        AllocPolicy::RekeyingOldGen
    };
    chan.rekey_route = route;
    chan.generate(
        SubOp::AllocPbas {
            policy,
            nr_of_blks,
            free_gen,
        },
        ChannelState::AllocDone,
    );
    Ok(())
}

/// The root of the current pass is written. Update the snapshot, fold in
/// every snapshot sharing that root, and start the next pass or finish.
fn finish_pass(chan: &mut Channel, req: &mut Request) {
    let root_lvl = chan.lvl;
    let root_hash = digest(&chan.encoded_blk);
    {
        let snap = &mut req.snapshots.items[chan.snap_idx];
        snap.pba = chan.new_pbas.pbas[root_lvl];
        snap.hash = root_hash;
    }
    loop {
        let pass_gen = req.snapshots.items[chan.snap_idx].gen;
        let Some(next_idx) = req.snapshots.next_older_containing(chan.vba, pass_gen) else {
            chan.mark_successful(req);
            return;
        };
        chan.first_snapshot = false;
        chan.snap_idx = next_idx;
        let next_snap = req.snapshots.items[next_idx];
        chan.lvl = next_snap.max_level;
        if chan.old_pbas[chan.lvl] == next_snap.pba {
            // Already relocated as part of the newest branch. A snapshot
            // of lower height roots at an inner block of that branch, so
            // its digest is the one relinked into the parent entry, not
            // the taller root's.
            let hash = if chan.lvl == root_lvl {
                root_hash
            } else {
                match chan.child_node(req, chan.lvl + 1) {
                    Ok(node) => node.hash,
                    Err(step) => {
                        chan.mark_failed(req, step);
                        return;
                    }
                }
            };
            let snap = &mut req.snapshots.items[next_idx];
            snap.pba = chan.new_pbas.pbas[chan.lvl];
            snap.hash = hash;
            continue;
        }
        chan.old_pbas[chan.lvl] = next_snap.pba;
        debug!(
            "rekey_vba {}: snapshot {}, root pba {}",
            chan.vba, chan.snap_idx, next_snap.pba
        );
        chan.generate(
            SubOp::ReadNodeBlock { pba: next_snap.pba },
            ChannelState::ReadBlockDone,
        );
        return;
    }
}
