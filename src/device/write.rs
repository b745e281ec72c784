//! Writing a leaf at a VBA, copy-on-write along its branch.
//!
//! The branch is read and verified top-down, then new physical addresses
//! are settled: blocks already rewritten in the current generation are
//! updated in place, a leaf of the initial generation keeps its reserved
//! address, everything else is allocated fresh. The leaf is encrypted
//! and written, the in-memory branch is relinked bottom-up with new
//! hashes, and the node blocks are written back up to the root. The
//! commit lands in the active snapshot slot if it is of the current
//! generation, otherwise in an evicted slot while the superseded
//! snapshot stays readable.

use crate::crypto::digest;
use crate::device::channel::{Channel, ChannelState, SubOp};
use crate::free::AllocPolicy;
use crate::node::Type1Node;
use crate::prelude::*;
use crate::request::Request;
use crate::tree::{degree_is_valid, node_index};

pub(crate) fn execute(chan: &mut Channel, req: &mut Request) -> bool {
    match chan.state {
        ChannelState::Submitted => {
            chan.vba = req.vba;
            chan.snap_idx = req.curr_snap_idx;
            if !degree_is_valid(req.degree) {
                chan.mark_failed(req, "check tree degree");
                return true;
            }
            let snap = req.snapshots.items[chan.snap_idx];
            if !snap.valid || !snap.contains_vba(chan.vba) {
                chan.mark_failed(req, "check vba in snapshot");
                return true;
            }
            if snap.gen > req.curr_gen {
                chan.mark_failed(req, "check snapshot generation");
                return true;
            }
            chan.lvl = snap.max_level;
            debug!("write_vba {}: load branch, root pba {}", chan.vba, snap.pba);
            chan.generate(
                SubOp::ReadNodeBlock { pba: snap.pba },
                ChannelState::ReadBlockDone,
            );
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
            if chan.lvl > 1 {
                let child = match chan.child_node(req, chan.lvl) {
                    Ok(child) => child,
                    Err(step) => {
                        chan.mark_failed(req, step);
                        return true;
                    }
                };
                chan.lvl -= 1;
                chan.generate(
                    SubOp::ReadNodeBlock { pba: child.pba },
                    ChannelState::ReadBlockDone,
                );
                return true;
            }
            let nr_of_blks = match settle_new_pbas(chan, req) {
                Ok(nr) => nr,
                Err(step) => {
                    chan.mark_failed(req, step);
                    return true;
                }
            };
            if nr_of_blks > 0 {
                if let Err(step) = fill_alloc_walk(chan, req) {
                    chan.mark_failed(req, step);
                    return true;
                }
                chan.generate(
                    SubOp::AllocPbas {
                        policy: AllocPolicy::NonRekeying,
                        nr_of_blks,
                        free_gen: req.curr_gen,
                    },
                    ChannelState::AllocDone,
                );
            } else {
                start_leaf_encrypt(chan, req);
            }
            true
        }
        ChannelState::AllocDone => {
            start_leaf_encrypt(chan, req);
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
        ChannelState::WriteBlockDone if chan.lvl == 0 => {
            if let Err(step) = commit_branch(chan, req) {
                chan.mark_failed(req, step);
                return true;
            }
            chan.lvl = 1;
            chan.generate(
                SubOp::WriteNodeBlock {
                    pba: chan.new_pbas.pbas[1],
                    lvl: 1,
                },
                ChannelState::WriteBlockDone,
            );
            true
        }
        ChannelState::WriteBlockDone => {
            let snap = req.snapshots.items[chan.snap_idx];
            if chan.lvl < snap.max_level {
                chan.lvl += 1;
                chan.generate(
                    SubOp::WriteNodeBlock {
                        pba: chan.new_pbas.pbas[chan.lvl],
                        lvl: chan.lvl,
                    },
                    ChannelState::WriteBlockDone,
                );
            } else {
                chan.mark_successful(req);
            }
            true
        }
        _ => false,
    }
}

/// Decide the physical address of every level of the written branch and
/// return how many must be allocated fresh. A slot of 0 marks a level
/// the allocator has to fill.
fn settle_new_pbas(chan: &mut Channel, req: &Request) -> core::result::Result<u64, &'static str> {
    let snap = req.snapshots.items[chan.snap_idx];
    let mut nr_of_blks = 0;
    for lvl in 0..TREE_MAX_NR_OF_LEVELS {
        if lvl > snap.max_level {
            chan.new_pbas.pbas[lvl] = 0;
        } else if lvl == snap.max_level {
            if snap.gen < req.curr_gen {
                nr_of_blks += 1;
                chan.new_pbas.pbas[lvl] = 0;
            } else {
                chan.new_pbas.pbas[lvl] = snap.pba;
            }
        } else {
            let idx = node_index(chan.vba, lvl + 1, req.degree);
            let child = *chan.t1_blks[lvl + 1]
                .node(idx)
                .map_err(|_| "malformed node block")?;
            if child.gen == req.curr_gen {
                chan.new_pbas.pbas[lvl] = child.pba;
            } else if lvl == 0 && child.gen == INITIAL_GENERATION {
                // The extension step reserved this address, no older
                // snapshot can reference it.
                chan.new_pbas.pbas[lvl] = child.pba;
            } else if child.gen < req.curr_gen {
                nr_of_blks += 1;
                chan.new_pbas.pbas[lvl] = 0;
            } else {
                return Err("check child generation");
            }
        }
    }
    Ok(nr_of_blks)
}

/// Hand the allocator the branch that is being superseded.
fn fill_alloc_walk(chan: &mut Channel, req: &Request) -> core::result::Result<(), &'static str> {
    let snap = req.snapshots.items[chan.snap_idx];
    for lvl in 0..TREE_MAX_NR_OF_LEVELS {
        if lvl > snap.max_level {
            chan.walk.nodes[lvl] = Type1Node::default();
        } else if lvl == snap.max_level {
            chan.walk.nodes[lvl] = Type1Node {
                pba: snap.pba,
                gen: snap.gen,
                hash: snap.hash,
            };
        } else {
            chan.walk.nodes[lvl] = chan.child_node(req, lvl + 1)?;
        }
    }
    Ok(())
}

fn start_leaf_encrypt(chan: &mut Channel, req: &Request) {
    chan.data_blk = req.data.clone();
    chan.generate(
        SubOp::EncryptLeaf {
            key_id: req.curr_key,
            pba: chan.new_pbas.pbas[0],
        },
        ChannelState::EncryptDone,
    );
}

/// Relink the in-memory branch onto the new physical addresses and
/// commit the snapshot, choosing a fresh slot for a cross-generation
/// write so the superseded snapshot stays readable.
fn commit_branch(chan: &mut Channel, req: &mut Request) -> core::result::Result<(), &'static str> {
    if req.snapshots.items[chan.snap_idx].gen < req.curr_gen {
        let new_idx = req
            .snapshots
            .evictable_slot(req.curr_gen, req.last_secured_gen)
            .ok_or("alloc snapshot slot")?;
        req.snapshots.items[new_idx] = req.snapshots.items[chan.snap_idx];
        chan.snap_idx = new_idx;
        req.curr_snap_idx = new_idx;
    }
    let max_level = req.snapshots.items[chan.snap_idx].max_level;
    for lvl in 0..=max_level {
        if lvl == 0 {
            let idx = node_index(chan.vba, 1, req.degree);
            let node = chan.t1_blks[1]
                .node_mut(idx)
                .map_err(|_| "malformed node block")?;
            node.pba = chan.new_pbas.pbas[0];
            node.gen = req.curr_gen;
            node.hash = digest(&chan.data_blk);
        } else if lvl < max_level {
            let encoded = chan.t1_blks[lvl]
                .encode()
                .map_err(|_| "encode node block")?;
            let idx = node_index(chan.vba, lvl + 1, req.degree);
            let node = chan.t1_blks[lvl + 1]
                .node_mut(idx)
                .map_err(|_| "malformed node block")?;
            node.pba = chan.new_pbas.pbas[lvl];
            node.gen = req.curr_gen;
            node.hash = digest(&encoded);
        } else {
            let encoded = chan.t1_blks[lvl]
                .encode()
                .map_err(|_| "encode node block")?;
            let snap = &mut req.snapshots.items[chan.snap_idx];
            snap.pba = chan.new_pbas.pbas[lvl];
            snap.gen = req.curr_gen;
            snap.hash = digest(&encoded);
        }
    }
    Ok(())
}
