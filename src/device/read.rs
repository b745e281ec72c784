//! Reading the leaf of a VBA out of a snapshot.
//!
//! The branch is walked from the snapshot root down to the leaf
//! reference, verifying the digest of every block read against the hash
//! stored in its parent. The leaf ciphertext is verified the same way
//! before it is decrypted. Leaves no write has reached yet are answered
//! from the plaintext supply without touching storage.

use crate::crypto::digest;
use crate::device::channel::{Channel, ChannelState, SubOp};
use crate::prelude::*;
use crate::request::Request;
use crate::tree::degree_is_valid;

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
            chan.lvl = snap.max_level;
            debug!("read_vba {}: load branch, root pba {}", chan.vba, snap.pba);
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
                chan.lvl -= 1;
                chan.generate(
                    SubOp::ReadNodeBlock { pba: child.pba },
                    ChannelState::ReadBlockDone,
                );
            } else if child.gen == INITIAL_GENERATION {
                // Never written, the stored bytes carry no data.
                chan.generate(
                    SubOp::SupplyLeaf { vba: chan.vba },
                    ChannelState::DecryptDone,
                );
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
                    key_id: req.curr_key,
                    pba: chan.data_old_pba,
                },
                ChannelState::DecryptDone,
            );
            true
        }
        ChannelState::DecryptDone => {
            req.data = chan.data_blk.clone();
            chan.mark_successful(req);
            true
        }
        _ => false,
    }
}
