//! Client requests and their results.

use crate::node::{Block, Snapshots};
use crate::prelude::*;

/// The operation a request asks for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestKind {
    /// Read the leaf at a VBA out of a snapshot.
    ReadVba,
    /// Write a leaf at a VBA, copy-on-write along the branch.
    WriteVba,
    /// Move the branches of one VBA, in every snapshot, to the current key.
    RekeyVba,
    /// Grow the newest snapshot's tree using a contingent of fresh PBAs.
    ExtensionStep,
}

/// One client operation, carrying its inputs and, once complete, its
/// outputs. The snapshot table travels with the request; the caller
/// commits the returned table if the request succeeded.
#[derive(Clone, Debug)]
pub struct Request {
    pub(crate) kind: RequestKind,
    pub(crate) vba: Vba,
    pub(crate) snapshots: Snapshots,
    pub(crate) curr_snap_idx: usize,
    pub(crate) degree: TreeDegree,
    pub(crate) curr_gen: Generation,
    pub(crate) last_secured_gen: Generation,
    pub(crate) curr_key: KeyId,
    pub(crate) prev_key: KeyId,
    pub(crate) first_pba: Pba,
    pub(crate) nr_of_pbas: u64,
    pub(crate) data: Block,
    pub(crate) nr_of_leaves: u64,
    pub(crate) success: bool,
}

impl Request {
    fn new(kind: RequestKind, snapshots: Snapshots, degree: TreeDegree) -> Self {
        Self {
            kind,
            vba: 0,
            snapshots,
            curr_snap_idx: 0,
            degree,
            curr_gen: 0,
            last_secured_gen: 0,
            curr_key: 0,
            prev_key: 0,
            first_pba: 0,
            nr_of_pbas: 0,
            data: Block::zeroed(),
            nr_of_leaves: 0,
            success: false,
        }
    }

    pub fn read(
        vba: Vba,
        snapshots: Snapshots,
        curr_snap_idx: usize,
        degree: TreeDegree,
        key_id: KeyId,
    ) -> Self {
        let mut req = Self::new(RequestKind::ReadVba, snapshots, degree);
        req.vba = vba;
        req.curr_snap_idx = curr_snap_idx;
        req.curr_key = key_id;
        req
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write(
        vba: Vba,
        snapshots: Snapshots,
        curr_snap_idx: usize,
        degree: TreeDegree,
        curr_gen: Generation,
        last_secured_gen: Generation,
        key_id: KeyId,
        data: Block,
    ) -> Self {
        let mut req = Self::new(RequestKind::WriteVba, snapshots, degree);
        req.vba = vba;
        req.curr_snap_idx = curr_snap_idx;
        req.curr_gen = curr_gen;
        req.last_secured_gen = last_secured_gen;
        req.curr_key = key_id;
        req.data = data;
        req
    }

    #[allow(clippy::too_many_arguments)]
    pub fn rekey(
        vba: Vba,
        snapshots: Snapshots,
        degree: TreeDegree,
        curr_gen: Generation,
        last_secured_gen: Generation,
        curr_key: KeyId,
        prev_key: KeyId,
    ) -> Self {
        let mut req = Self::new(RequestKind::RekeyVba, snapshots, degree);
        req.vba = vba;
        req.curr_gen = curr_gen;
        req.last_secured_gen = last_secured_gen;
        req.curr_key = curr_key;
        req.prev_key = prev_key;
        req
    }

    #[allow(clippy::too_many_arguments)]
    pub fn extension_step(
        snapshots: Snapshots,
        curr_snap_idx: usize,
        degree: TreeDegree,
        curr_gen: Generation,
        last_secured_gen: Generation,
        first_pba: Pba,
        nr_of_pbas: u64,
    ) -> Self {
        let mut req = Self::new(RequestKind::ExtensionStep, snapshots, degree);
        req.curr_snap_idx = curr_snap_idx;
        req.curr_gen = curr_gen;
        req.last_secured_gen = last_secured_gen;
        req.first_pba = first_pba;
        req.nr_of_pbas = nr_of_pbas;
        req
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self.kind {
            RequestKind::ReadVba => "read_vba",
            RequestKind::WriteVba => "write_vba",
            RequestKind::RekeyVba => "rekey_vba",
            RequestKind::ExtensionStep => "extension_step",
        }
    }

    pub fn vba(&self) -> Vba {
        self.vba
    }

    /// Whether the operation ran to completion.
    pub fn success(&self) -> bool {
        self.success
    }

    /// The plaintext produced by a completed read.
    pub fn data(&self) -> &Block {
        &self.data
    }

    /// The snapshot table as updated by the operation.
    pub fn snapshots(&self) -> &Snapshots {
        &self.snapshots
    }

    /// Slot of the snapshot the operation committed to.
    pub fn curr_snap_idx(&self) -> usize {
        self.curr_snap_idx
    }

    /// Leaves added by a completed extension step.
    pub fn nr_of_leaves(&self) -> u64 {
        self.nr_of_leaves
    }

    /// The unconsumed remainder of the extension PBA contingent.
    pub fn remaining_contingent(&self) -> (Pba, u64) {
        (self.first_pba, self.nr_of_pbas)
    }
}
