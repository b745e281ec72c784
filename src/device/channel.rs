//! Per-request execution state.
//!
//! A channel drives one request at a time through a small state machine.
//! Whenever the request needs a collaborator (block I/O, cipher,
//! allocator, plaintext supply) the channel records the pending
//! sub-operation together with the state to resume in, then suspends.
//! The device services the sub-operation and re-enters the handler.

use array_init::array_init;

use crate::crypto::digest;
use crate::free::AllocPolicy;
use crate::node::{Block, NodeBlock, NodeWalk, TreeWalkPbas, Type1Node};
use crate::prelude::*;
use crate::request::Request;
use crate::tree::{node_index, TREE_MAX_NR_OF_LEVELS};

/// Where a request stands between two sub-operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelState {
    Submitted,
    ReadBlockDone,
    WriteBlockDone,
    AllocDone,
    DecryptDone,
    EncryptDone,
    Complete,
}

/// One suspended sub-operation, serviced by the device's collaborators.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SubOp {
    ReadNodeBlock { pba: Pba },
    WriteNodeBlock { pba: Pba, lvl: TreeLevel },
    ReadLeafBlock { pba: Pba },
    WriteLeafBlock { pba: Pba },
    DecryptLeaf { key_id: KeyId, pba: Pba },
    EncryptLeaf { key_id: KeyId, pba: Pba },
    AllocPbas {
        policy: AllocPolicy,
        nr_of_blks: u64,
        free_gen: Generation,
    },
    SupplyLeaf { vba: Vba },
}

impl SubOp {
    pub(crate) fn step_label(&self) -> &'static str {
        match self {
            SubOp::ReadNodeBlock { .. } => "read node block",
            SubOp::WriteNodeBlock { .. } => "write node block",
            SubOp::ReadLeafBlock { .. } => "read leaf block",
            SubOp::WriteLeafBlock { .. } => "write leaf block",
            SubOp::DecryptLeaf { .. } => "decrypt leaf block",
            SubOp::EncryptLeaf { .. } => "encrypt leaf block",
            SubOp::AllocPbas { .. } => "alloc pbas",
            SubOp::SupplyLeaf { .. } => "supply leaf plaintext",
        }
    }
}

/// How a completed rekey allocation continues.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RekeyRoute {
    /// Leaf was read and decrypted, re-encrypt and write it.
    Reencrypt,
    /// Leaf already relocated by a newer pass, relink it.
    SkipLeaf,
    /// Leaf never written, relocate the reference without touching data.
    NoRekeyLeaf,
    /// Whole subtree already relocated by a newer pass, relink it.
    SkipInner,
}

pub(crate) struct Channel {
    pub(crate) request: Option<Request>,
    pub(crate) state: ChannelState,
    pub(crate) pending: Option<(SubOp, ChannelState)>,
    pub(crate) vba: Vba,
    pub(crate) snap_idx: usize,
    pub(crate) lvl: TreeLevel,
    pub(crate) t1_blks: [NodeBlock; TREE_MAX_NR_OF_LEVELS],
    pub(crate) old_pbas: [Pba; TREE_MAX_NR_OF_LEVELS],
    pub(crate) data_old_pba: Pba,
    pub(crate) walk: NodeWalk,
    pub(crate) new_pbas: TreeWalkPbas,
    pub(crate) encoded_blk: Block,
    pub(crate) data_blk: Block,
    pub(crate) first_snapshot: bool,
    pub(crate) rekey_route: RekeyRoute,
}

impl Channel {
    pub(crate) fn idle() -> Self {
        Self {
            request: None,
            state: ChannelState::Complete,
            pending: None,
            vba: 0,
            snap_idx: 0,
            lvl: 0,
            t1_blks: array_init(|_| NodeBlock::default()),
            old_pbas: [0; TREE_MAX_NR_OF_LEVELS],
            data_old_pba: 0,
            walk: NodeWalk::default(),
            new_pbas: TreeWalkPbas::default(),
            encoded_blk: Block::zeroed(),
            data_blk: Block::zeroed(),
            first_snapshot: false,
            rekey_route: RekeyRoute::Reencrypt,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.request.is_none()
    }

    pub(crate) fn begin(&mut self, req: Request) {
        *self = Self::idle();
        self.request = Some(req);
        self.state = ChannelState::Submitted;
    }

    /// Record a sub-operation and the state to resume in once it is done.
    pub(crate) fn generate(&mut self, op: SubOp, resume: ChannelState) {
        self.pending = Some((op, resume));
    }

    pub(crate) fn mark_failed(&mut self, req: &mut Request, step: &'static str) {
        error!("{} request failed at step \"{}\"", req.kind_name(), step);
        req.success = false;
        self.state = ChannelState::Complete;
    }

    pub(crate) fn mark_successful(&mut self, req: &mut Request) {
        req.success = true;
        self.state = ChannelState::Complete;
    }

    /// Verify the node block just read against the hash of its reference,
    /// the snapshot's for the root, the parent's child entry otherwise.
    pub(crate) fn check_read_node_block(
        &self,
        req: &Request,
    ) -> core::result::Result<(), &'static str> {
        let snap = &req.snapshots.items[self.snap_idx];
        let expected = if self.lvl == snap.max_level {
            snap.hash
        } else {
            self.child_node(req, self.lvl + 1)?.hash
        };
        if digest(&self.encoded_blk) != expected {
            if self.lvl == snap.max_level {
                return Err("check root node hash");
            }
            return Err("check inner node hash");
        }
        Ok(())
    }

    pub(crate) fn decode_read_node_block(&mut self) -> core::result::Result<(), &'static str> {
        self.t1_blks[self.lvl] =
            NodeBlock::decode(&self.encoded_blk).map_err(|_| "decode node block")?;
        Ok(())
    }

    /// The child entry the request's VBA selects in the node block at
    /// `parent_lvl`.
    pub(crate) fn child_node(
        &self,
        req: &Request,
        parent_lvl: TreeLevel,
    ) -> core::result::Result<Type1Node, &'static str> {
        let idx = node_index(self.vba, parent_lvl, req.degree);
        self.t1_blks[parent_lvl]
            .node(idx)
            .copied()
            .map_err(|_| "malformed node block")
    }
}
