//! Growing the newest snapshot's tree by one branch.
//!
//! The step walks the branch of the first VBA beyond the current leaves.
//! Where it meets an unused child slot it grafts a fresh branch whose
//! blocks are drawn from the PBA contingent carried in the request, then
//! copy-on-writes the existing ancestors and commits a snapshot with the
//! grown leaf count. When the tree is full a new root level is added
//! first, wrapping the old root as child 0 of the new root. An exhausted
//! contingent bounds the number of leaves added, never fails the step.

use crate::crypto::digest;
use crate::device::channel::{Channel, ChannelState, SubOp};
use crate::free::AllocPolicy;
use crate::node::{NodeBlock, Snapshot, Type1Node};
use crate::prelude::*;
use crate::request::Request;
use crate::tree::{degree_is_valid, max_vba, node_index, TREE_MAX_LEVEL};

pub(crate) fn execute(chan: &mut Channel, req: &mut Request) -> bool {
    match chan.state {
        ChannelState::Submitted => {
            req.nr_of_leaves = 0;
            if !degree_is_valid(req.degree) {
                chan.mark_failed(req, "check tree degree");
                return true;
            }
            let Some(first_idx) = req.snapshots.newest_idx() else {
                chan.mark_failed(req, "find newest snapshot");
                return true;
            };
            chan.snap_idx = first_idx;
            if req.nr_of_pbas == 0 {
                chan.mark_successful(req);
                return true;
            }
            let snap = req.snapshots.items[chan.snap_idx];
            chan.vba = snap.nr_of_leaves;
            chan.lvl = snap.max_level;
            chan.old_pbas[chan.lvl] = snap.pba;

            if chan.vba <= max_vba(req.degree, snap.max_level) {
                debug!(
                    "extension_step: grow snapshot {} at vba {}",
                    chan.snap_idx, chan.vba
                );
                chan.generate(
                    SubOp::ReadNodeBlock { pba: snap.pba },
                    ChannelState::ReadBlockDone,
                );
            } else {
                // Tree full, wrap the old root into a new root level.
                if let Err(step) = add_new_root_lvl(chan, req) {
                    chan.mark_failed(req, step);
                    return true;
                }
                let mount_lvl = req.snapshots.items[chan.snap_idx].max_level;
                if let Err(step) = add_new_branch(chan, req, mount_lvl, 1) {
                    chan.mark_failed(req, step);
                    return true;
                }
                if let Err(step) = set_new_pbas_identical_to_current(chan, req) {
                    chan.mark_failed(req, step);
                    return true;
                }
                chan.generate(
                    SubOp::WriteNodeBlock {
                        pba: chan.new_pbas.pbas[chan.lvl],
                        lvl: chan.lvl,
                    },
                    ChannelState::WriteBlockDone,
                );
            }
            true
        }
        ChannelState::ReadBlockDone => {
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
            if chan.lvl > 1 && child.is_valid() {
                chan.lvl -= 1;
                chan.old_pbas[chan.lvl] = child.pba;
                chan.generate(
                    SubOp::ReadNodeBlock { pba: child.pba },
                    ChannelState::ReadBlockDone,
                );
                return true;
            }
            // Graft a new branch below this block.
            let mount_lvl = chan.lvl;
            let mount_child_idx = node_index(chan.vba, mount_lvl, req.degree);
            if let Err(step) = add_new_branch(chan, req, mount_lvl, mount_child_idx) {
                chan.mark_failed(req, step);
                return true;
            }
            if let Err(step) = generate_alloc(chan, req, mount_lvl) {
                chan.mark_failed(req, step);
            }
            true
        }
        ChannelState::AllocDone => {
            chan.generate(
                SubOp::WriteNodeBlock {
                    pba: chan.new_pbas.pbas[chan.lvl],
                    lvl: chan.lvl,
                },
                ChannelState::WriteBlockDone,
            );
            true
        }
        ChannelState::WriteBlockDone => {
            let snap = req.snapshots.items[chan.snap_idx];
            if chan.lvl < snap.max_level {
                let child_lvl = chan.lvl;
                let parent_lvl = child_lvl + 1;
                let hash = digest(&chan.encoded_blk);
                let idx = node_index(chan.vba, parent_lvl, req.degree);
                let node = match chan.t1_blks[parent_lvl].node_mut(idx) {
                    Ok(node) => node,
                    Err(_) => {
                        chan.mark_failed(req, "malformed node block");
                        return true;
                    }
                };
                node.pba = chan.new_pbas.pbas[child_lvl];
                node.hash = hash;
                chan.lvl = parent_lvl;
                chan.generate(
                    SubOp::WriteNodeBlock {
                        pba: chan.new_pbas.pbas[parent_lvl],
                        lvl: parent_lvl,
                    },
                    ChannelState::WriteBlockDone,
                );
                return true;
            }
            commit_snapshot(chan, req);
            true
        }
        _ => false,
    }
}

fn take_contingent_pba(req: &mut Request) -> core::result::Result<Pba, &'static str> {
    if req.nr_of_pbas == 0 {
        return Err("take pba from contingent");
    }
    let pba = req.first_pba;
    req.first_pba += 1;
    req.nr_of_pbas -= 1;
    Ok(pba)
}

/// Make the old root child 0 of a new, one-level-higher root drawn from
/// the contingent. The grown snapshot lands in a fresh slot when the old
/// one is of an older generation.
fn add_new_root_lvl(chan: &mut Channel, req: &mut Request) -> core::result::Result<(), &'static str> {
    let old_snap = req.snapshots.items[chan.snap_idx];
    if old_snap.max_level >= TREE_MAX_LEVEL {
        return Err("add new root level");
    }
    let new_lvl = old_snap.max_level + 1;
    chan.t1_blks[new_lvl] = NodeBlock::new(req.degree);
    *chan.t1_blks[new_lvl]
        .node_mut(0)
        .map_err(|_| "malformed node block")? = Type1Node {
        pba: old_snap.pba,
        gen: old_snap.gen,
        hash: old_snap.hash,
    };
    if old_snap.gen < req.curr_gen {
        chan.snap_idx = req
            .snapshots
            .evictable_slot(req.curr_gen, req.last_secured_gen)
            .ok_or("alloc snapshot slot")?;
    }
    let new_root_pba = take_contingent_pba(req)?;
    req.snapshots.items[chan.snap_idx] = Snapshot {
        hash: Default::default(),
        pba: new_root_pba,
        gen: req.curr_gen,
        nr_of_leaves: old_snap.nr_of_leaves,
        max_level: new_lvl,
        valid: true,
    };
    Ok(())
}

/// Build the new branch in memory, drawing every block's address from
/// the contingent, from the mount point down to the leaves. Leaves are
/// only referenced, not written; their entries stay at the initial
/// generation with an empty hash.
fn add_new_branch(
    chan: &mut Channel,
    req: &mut Request,
    mount_at_lvl: TreeLevel,
    mount_at_child_idx: usize,
) -> core::result::Result<(), &'static str> {
    req.nr_of_leaves = 0;
    chan.lvl = mount_at_lvl;
    for lvl in 1..mount_at_lvl {
        chan.t1_blks[lvl] = NodeBlock::new(req.degree);
    }
    if req.nr_of_pbas == 0 {
        return Ok(());
    }
    for lvl in (1..=mount_at_lvl).rev() {
        chan.lvl = lvl;
        let first_child_idx = if lvl == mount_at_lvl {
            mount_at_child_idx
        } else {
            0
        };
        if lvl > 1 {
            if req.nr_of_pbas == 0 {
                return Ok(());
            }
            let pba = take_contingent_pba(req)?;
            *chan.t1_blks[lvl]
                .node_mut(first_child_idx)
                .map_err(|_| "malformed node block")? = Type1Node {
                pba,
                gen: INITIAL_GENERATION,
                hash: Default::default(),
            };
        } else {
            for child_idx in first_child_idx..req.degree as usize {
                if req.nr_of_pbas == 0 {
                    return Ok(());
                }
                let pba = take_contingent_pba(req)?;
                *chan.t1_blks[1]
                    .node_mut(child_idx)
                    .map_err(|_| "malformed node block")? = Type1Node {
                    pba,
                    gen: INITIAL_GENERATION,
                    hash: Default::default(),
                };
                req.nr_of_leaves += 1;
            }
        }
    }
    Ok(())
}

/// The added root level reuses the addresses the contingent assigned,
/// no allocator involvement.
fn set_new_pbas_identical_to_current(
    chan: &mut Channel,
    req: &Request,
) -> core::result::Result<(), &'static str> {
    let snap = req.snapshots.items[chan.snap_idx];
    for lvl in 0..TREE_MAX_NR_OF_LEVELS {
        if lvl > snap.max_level {
            chan.new_pbas.pbas[lvl] = 0;
        } else if lvl == snap.max_level {
            chan.new_pbas.pbas[lvl] = snap.pba;
        } else {
            chan.new_pbas.pbas[lvl] = chan.child_node(req, lvl + 1)?.pba;
        }
    }
    Ok(())
}

/// Copy-on-write the existing ancestors of the graft point; the new
/// branch below it keeps its contingent addresses.
fn generate_alloc(
    chan: &mut Channel,
    req: &Request,
    min_lvl: TreeLevel,
) -> core::result::Result<(), &'static str> {
    let snap = req.snapshots.items[chan.snap_idx];
    if min_lvl > snap.max_level {
        return Err("check min level for alloc");
    }
    let mut nr_of_blks = 0;
    for lvl in 0..TREE_MAX_NR_OF_LEVELS {
        if lvl > snap.max_level {
            chan.new_pbas.pbas[lvl] = 0;
            chan.walk.nodes[lvl] = Type1Node::default();
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
            if child.pba == 0 {
                // A depleted contingent left this part of the branch
                // unbuilt; keep the allocator away from the slot.
                chan.new_pbas.pbas[lvl] = INVALID_PBA;
                chan.walk.nodes[lvl] = Type1Node {
                    pba: INVALID_PBA,
                    gen: child.gen,
                    hash: child.hash,
                };
            } else {
                chan.new_pbas.pbas[lvl] = child.pba;
                chan.walk.nodes[lvl] = child;
            }
        }
    }
    chan.generate(
        SubOp::AllocPbas {
            policy: AllocPolicy::NonRekeying,
            nr_of_blks,
            free_gen: req.curr_gen,
        },
        ChannelState::AllocDone,
    );
    Ok(())
}

fn commit_snapshot(chan: &mut Channel, req: &mut Request) {
    let old_snap = req.snapshots.items[chan.snap_idx];
    if old_snap.gen < req.curr_gen {
        let Some(new_idx) = req
            .snapshots
            .evictable_slot(req.curr_gen, req.last_secured_gen)
        else {
            chan.mark_failed(req, "alloc snapshot slot");
            return;
        };
        chan.snap_idx = new_idx;
    }
    req.snapshots.items[chan.snap_idx] = Snapshot {
        hash: digest(&chan.encoded_blk),
        pba: chan.new_pbas.pbas[chan.lvl],
        gen: req.curr_gen,
        nr_of_leaves: old_snap.nr_of_leaves + req.nr_of_leaves,
        max_level: old_snap.max_level,
        valid: true,
    };
    req.curr_snap_idx = chan.snap_idx;
    chan.mark_successful(req);
}
