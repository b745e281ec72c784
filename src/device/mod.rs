//! The device: a pool of cooperative channels over shared collaborators.
//!
//! Each channel drives one request. A scheduling round services every
//! channel's pending sub-operation against the collaborators and then
//! lets the request's handler advance one step. Rounds are repeated
//! until no channel can make progress, at which point every in-flight
//! request has either completed or suspended on a sub-operation result
//! that will never change (there are no asynchronous collaborators
//! here, so quiescence means completion).

mod channel;
mod extend;
mod read;
mod rekey;
mod write;

pub use channel::ChannelState;

use crate::bio::{BlockIo, PlaintextSupply};
use crate::crypto::Cipher;
use crate::free::FreeTree;
use crate::prelude::*;
use crate::request::{Request, RequestKind};
use channel::{Channel, SubOp};

pub const DEFAULT_NR_OF_CHANNELS: usize = 4;

pub struct Device<B, C, F, S> {
    bio: B,
    cipher: C,
    free_tree: F,
    supply: S,
    channels: Vec<Channel>,
}

impl<B: BlockIo, C: Cipher, F: FreeTree, S: PlaintextSupply> Device<B, C, F, S> {
    pub fn new(bio: B, cipher: C, free_tree: F, supply: S, nr_of_channels: usize) -> Self {
        let channels = (0..nr_of_channels.max(1)).map(|_| Channel::idle()).collect();
        Self {
            bio,
            cipher,
            free_tree,
            supply,
            channels,
        }
    }

    pub fn ready_to_submit(&self) -> bool {
        self.channels.iter().any(Channel::is_idle)
    }

    /// Hand a request to an idle channel. A fully occupied device hands
    /// the request back instead of failing it.
    pub fn submit(&mut self, req: Request) -> core::result::Result<(), Request> {
        match self.channels.iter_mut().find(|chan| chan.is_idle()) {
            Some(chan) => {
                chan.begin(req);
                Ok(())
            }
            None => Err(req),
        }
    }

    /// Retrieve one completed request, if any.
    pub fn poll(&mut self) -> Option<Request> {
        for chan in self.channels.iter_mut() {
            if chan.request.is_some() && chan.state == ChannelState::Complete {
                chan.pending = None;
                return chan.request.take();
            }
        }
        None
    }

    /// One scheduling round over all channels. Returns whether any
    /// channel made progress.
    pub fn execute_round(&mut self) -> bool {
        let mut progress = false;
        let Self {
            bio,
            cipher,
            free_tree,
            supply,
            channels,
        } = self;
        for chan in channels.iter_mut() {
            let Some(mut req) = chan.request.take() else {
                continue;
            };
            if let Some((op, resume)) = chan.pending.take() {
                match Self::service(bio, cipher, free_tree, supply, chan, &req, &op) {
                    Ok(()) => {
                        chan.state = resume;
                        progress = true;
                    }
                    Err(_) => {
                        chan.mark_failed(&mut req, op.step_label());
                        progress = true;
                        chan.request = Some(req);
                        continue;
                    }
                }
            }
            if chan.state != ChannelState::Complete {
                progress |= match req.kind() {
                    RequestKind::ReadVba => read::execute(chan, &mut req),
                    RequestKind::WriteVba => write::execute(chan, &mut req),
                    RequestKind::RekeyVba => rekey::execute(chan, &mut req),
                    RequestKind::ExtensionStep => extend::execute(chan, &mut req),
                };
            }
            chan.request = Some(req);
        }
        progress
    }

    /// Drive all in-flight requests until nothing advances anymore.
    pub fn execute(&mut self) {
        while self.execute_round() {}
    }

    fn service(
        bio: &B,
        cipher: &C,
        free_tree: &F,
        supply: &S,
        chan: &mut Channel,
        req: &Request,
        op: &SubOp,
    ) -> Result<()> {
        match *op {
            SubOp::ReadNodeBlock { pba } => bio.read(pba, &mut chan.encoded_blk),
            SubOp::WriteNodeBlock { pba, lvl } => {
                chan.encoded_blk = chan.t1_blks[lvl].encode()?;
                bio.write(pba, &chan.encoded_blk)
            }
            SubOp::ReadLeafBlock { pba } => bio.read(pba, &mut chan.data_blk),
            SubOp::WriteLeafBlock { pba } => bio.write(pba, &chan.data_blk),
            SubOp::DecryptLeaf { key_id, pba } => cipher.decrypt(key_id, pba, &mut chan.data_blk),
            SubOp::EncryptLeaf { key_id, pba } => cipher.encrypt(key_id, pba, &mut chan.data_blk),
            SubOp::AllocPbas {
                policy,
                nr_of_blks,
                free_gen,
            } => {
                let max_level = req.snapshots.items[chan.snap_idx].max_level;
                free_tree.alloc_pbas(
                    policy,
                    &chan.walk,
                    nr_of_blks,
                    req.curr_gen,
                    free_gen,
                    max_level,
                    &mut chan.new_pbas,
                )
            }
            SubOp::SupplyLeaf { vba } => supply.supply(vba, &mut chan.data_blk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{MemBlockIo, ZeroSupply};
    use crate::crypto::{digest, AesCtrCipher, KEY_SIZE};
    use crate::free::BumpAllocator;
    use crate::init;
    use crate::node::{Block, NodeBlock, Snapshot, Snapshots, Type1Node};
    use crate::request::Request;
    use crate::tree::node_index;

    const ROOT_PBA: Pba = 1;
    const CONTINGENT_FIRST: Pba = 2;
    const ALLOC_FIRST: Pba = 200;
    const KEY_1: KeyId = 1;
    const KEY_2: KeyId = 2;

    type TestDevice = Device<Arc<MemBlockIo>, Arc<AesCtrCipher>, Arc<BumpAllocator>, ZeroSupply>;

    struct Fixture {
        device: TestDevice,
        bio: Arc<MemBlockIo>,
        alloc: Arc<BumpAllocator>,
    }

    fn fixture_with_alloc(alloc_len: u64) -> Fixture {
        let bio = Arc::new(MemBlockIo::create(4096));
        let cipher = Arc::new(AesCtrCipher::new());
        cipher.insert_key(KEY_1, [0x11; KEY_SIZE]);
        cipher.insert_key(KEY_2, [0x22; KEY_SIZE]);
        let alloc = Arc::new(BumpAllocator::new(ALLOC_FIRST, alloc_len));
        let device = Device::new(bio.clone(), cipher, alloc.clone(), ZeroSupply, 2);
        Fixture { device, bio, alloc }
    }

    fn fixture() -> Fixture {
        fixture_with_alloc(1000)
    }

    fn run(device: &mut TestDevice, req: Request) -> Request {
        assert!(device.submit(req).is_ok());
        device.execute();
        device.poll().unwrap()
    }

    struct Volume {
        snaps: Snapshots,
        snap_idx: usize,
        degree: TreeDegree,
        contingent: (Pba, u64),
    }

    /// Format a tree and grow it to `nr_of_leaves` via extension steps
    /// at generation 1.
    fn bootstrap(
        fix: &mut Fixture,
        degree: TreeDegree,
        max_level: TreeLevel,
        nr_of_leaves: u64,
        contingent_len: u64,
    ) -> Volume {
        let snap = init::format(fix.bio.as_ref(), degree, max_level, ROOT_PBA).unwrap();
        let mut snaps = Snapshots::default();
        snaps.items[0] = snap;
        let mut vol = Volume {
            snaps,
            snap_idx: 0,
            degree,
            contingent: (CONTINGENT_FIRST, contingent_len),
        };
        while vol.snaps.items[vol.snap_idx].nr_of_leaves < nr_of_leaves {
            let req = Request::extension_step(
                vol.snaps,
                vol.snap_idx,
                degree,
                1,
                0,
                vol.contingent.0,
                vol.contingent.1,
            );
            let done = run(&mut fix.device, req);
            assert!(done.success());
            vol.snaps = *done.snapshots();
            vol.snap_idx = done.curr_snap_idx();
            vol.contingent = done.remaining_contingent();
        }
        vol
    }

    fn block_of(byte: u8) -> Block {
        Block([byte; BLOCK_SIZE])
    }

    fn write_vba(
        fix: &mut Fixture,
        vol: &mut Volume,
        vba: Vba,
        byte: u8,
        curr_gen: Generation,
        last_secured_gen: Generation,
    ) {
        let req = Request::write(
            vba,
            vol.snaps,
            vol.snap_idx,
            vol.degree,
            curr_gen,
            last_secured_gen,
            KEY_1,
            block_of(byte),
        );
        let done = run(&mut fix.device, req);
        assert!(done.success());
        vol.snaps = *done.snapshots();
        vol.snap_idx = done.curr_snap_idx();
    }

    fn read_vba(
        fix: &mut Fixture,
        vol: &Volume,
        snap_idx: usize,
        vba: Vba,
        key_id: KeyId,
    ) -> Request {
        run(
            &mut fix.device,
            Request::read(vba, vol.snaps, snap_idx, vol.degree, key_id),
        )
    }

    /// Walk the on-disk tree of `snap` down to the leaf reference of
    /// `vba`, verifying the hash chain along the way.
    fn leaf_node_on_disk(
        bio: &MemBlockIo,
        snap: &Snapshot,
        vba: Vba,
        degree: TreeDegree,
    ) -> Type1Node {
        let mut blk = Block::zeroed();
        let mut node = Type1Node {
            pba: snap.pba,
            gen: snap.gen,
            hash: snap.hash,
        };
        for lvl in (1..=snap.max_level).rev() {
            bio.read(node.pba, &mut blk).unwrap();
            assert_eq!(digest(&blk), node.hash, "hash chain broken at lvl {}", lvl);
            let decoded = NodeBlock::decode(&blk).unwrap();
            node = *decoded.node(node_index(vba, lvl, degree)).unwrap();
        }
        node
    }

    #[test]
    fn extension_grows_the_tree_monotonically() {
        let mut fix = fixture();
        let vol = bootstrap(&mut fix, 4, 2, 16, 100);

        let snap = vol.snaps.items[vol.snap_idx];
        assert_eq!(snap.nr_of_leaves, 16);
        assert_eq!(snap.max_level, 2);
        assert_eq!(snap.gen, 1);
        // The formatted zero-leaf snapshot survived in its own slot.
        assert!(vol.snaps.items[0].valid);
        assert_eq!(vol.snaps.items[0].nr_of_leaves, 0);
        // One node plus degree leaves drawn per step.
        assert_eq!(vol.contingent.1, 100 - 4 * 5);
    }

    #[test]
    fn extension_with_empty_contingent_is_a_successful_noop() {
        let mut fix = fixture();
        let vol = bootstrap(&mut fix, 4, 2, 4, 100);

        let req = Request::extension_step(vol.snaps, vol.snap_idx, 4, 1, 0, 0, 0);
        let done = run(&mut fix.device, req);
        assert!(done.success());
        assert_eq!(done.nr_of_leaves(), 0);
        assert_eq!(
            done.snapshots().items[done.curr_snap_idx()].nr_of_leaves,
            4
        );
    }

    #[test]
    fn extension_with_short_contingent_bounds_the_added_leaves() {
        let mut fix = fixture();
        let snap = init::format(fix.bio.as_ref(), 4, 2, ROOT_PBA).unwrap();
        let mut snaps = Snapshots::default();
        snaps.items[0] = snap;

        // Three blocks: one inner node and two of four possible leaves.
        let req = Request::extension_step(snaps, 0, 4, 1, 0, CONTINGENT_FIRST, 3);
        let done = run(&mut fix.device, req);
        assert!(done.success());
        assert_eq!(done.nr_of_leaves(), 2);
        assert_eq!(done.remaining_contingent().1, 0);
        let snaps = *done.snapshots();
        let snap_idx = done.curr_snap_idx();
        assert_eq!(snaps.items[snap_idx].nr_of_leaves, 2);

        // The next step continues where the contingent ran out.
        let req = Request::extension_step(snaps, snap_idx, 4, 1, 0, CONTINGENT_FIRST + 3, 10);
        let done = run(&mut fix.device, req);
        assert!(done.success());
        assert_eq!(done.snapshots().items[done.curr_snap_idx()].nr_of_leaves, 4);
    }

    #[test]
    fn extension_adds_a_root_level_when_the_tree_is_full() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 2, 1, 2, 100);
        assert_eq!(vol.snaps.items[vol.snap_idx].max_level, 1);

        let req = Request::extension_step(
            vol.snaps,
            vol.snap_idx,
            2,
            1,
            0,
            vol.contingent.0,
            vol.contingent.1,
        );
        let done = run(&mut fix.device, req);
        assert!(done.success());
        assert_eq!(done.nr_of_leaves(), 2);
        vol.snaps = *done.snapshots();
        vol.snap_idx = done.curr_snap_idx();

        let snap = vol.snaps.items[vol.snap_idx];
        assert_eq!(snap.max_level, 2);
        assert_eq!(snap.nr_of_leaves, 4);

        // All four leaves are reachable and read as zeroes.
        for vba in 0..4 {
            let done = read_vba(&mut fix, &vol, vol.snap_idx, vba, KEY_1);
            assert!(done.success());
            assert_eq!(*done.data(), Block::zeroed());
        }
        write_vba(&mut fix, &mut vol, 3, b'X', 2, 1);
        let done = read_vba(&mut fix, &vol, vol.snap_idx, 3, KEY_1);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'X'));
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);

        write_vba(&mut fix, &mut vol, 5, b'A', 2, 1);
        let done = read_vba(&mut fix, &vol, vol.snap_idx, 5, KEY_1);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'A'));

        // Untouched neighbours still read as zeroes.
        for vba in [4, 6, 15] {
            let done = read_vba(&mut fix, &vol, vol.snap_idx, vba, KEY_1);
            assert!(done.success());
            assert_eq!(*done.data(), Block::zeroed());
        }
    }

    #[test]
    fn cross_generation_write_keeps_the_old_snapshot_readable() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);

        write_vba(&mut fix, &mut vol, 5, b'A', 2, 1);
        let snap_a = vol.snap_idx;

        write_vba(&mut fix, &mut vol, 5, b'B', 3, 2);
        let snap_b = vol.snap_idx;
        assert_ne!(snap_a, snap_b);
        assert!(vol.snaps.items[snap_a].valid);
        assert_eq!(vol.snaps.items[snap_a].gen, 2);
        assert_eq!(vol.snaps.items[snap_b].gen, 3);

        let done = read_vba(&mut fix, &vol, snap_a, 5, KEY_1);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'A'));
        let done = read_vba(&mut fix, &vol, snap_b, 5, KEY_1);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'B'));
    }

    #[test]
    fn same_generation_write_updates_the_snapshot_in_place() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);

        write_vba(&mut fix, &mut vol, 5, b'A', 2, 1);
        let snap_idx = vol.snap_idx;
        let calls_before = fix.alloc.nr_of_calls();

        // vba 6 shares the branch of vba 5; every block of it is already
        // of generation 2 or reserved, so no allocation happens at all.
        write_vba(&mut fix, &mut vol, 6, b'C', 2, 1);
        assert_eq!(vol.snap_idx, snap_idx);
        assert_eq!(fix.alloc.nr_of_calls(), calls_before);

        for (vba, byte) in [(5, b'A'), (6, b'C')] {
            let done = read_vba(&mut fix, &vol, vol.snap_idx, vba, KEY_1);
            assert!(done.success());
            assert_eq!(*done.data(), block_of(byte));
        }
    }

    #[test]
    fn read_beyond_the_leaves_fails() {
        let mut fix = fixture();
        let vol = bootstrap(&mut fix, 4, 2, 16, 100);

        let done = read_vba(&mut fix, &vol, vol.snap_idx, 16, KEY_1);
        assert!(!done.success());
        let done = run(
            &mut fix.device,
            Request::write(16, vol.snaps, vol.snap_idx, 4, 2, 1, KEY_1, block_of(b'A')),
        );
        assert!(!done.success());
    }

    #[test]
    fn corrupted_blocks_are_rejected() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);
        write_vba(&mut fix, &mut vol, 5, b'A', 2, 1);

        // Corrupt the leaf ciphertext.
        let leaf = leaf_node_on_disk(
            fix.bio.as_ref(),
            &vol.snaps.items[vol.snap_idx],
            5,
            vol.degree,
        );
        fix.bio.corrupt(leaf.pba);
        let done = read_vba(&mut fix, &vol, vol.snap_idx, 5, KEY_1);
        assert!(!done.success());

        // Corrupt the root node block of the snapshot.
        fix.bio.corrupt(vol.snaps.items[vol.snap_idx].pba);
        let done = read_vba(&mut fix, &vol, vol.snap_idx, 4, KEY_1);
        assert!(!done.success());
    }

    #[test]
    fn the_on_disk_hash_chain_matches_the_snapshot() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);
        write_vba(&mut fix, &mut vol, 9, b'D', 2, 1);

        let snap = vol.snaps.items[vol.snap_idx];
        let leaf = leaf_node_on_disk(fix.bio.as_ref(), &snap, 9, vol.degree);
        assert_eq!(leaf.gen, 2);

        let mut stored = Block::zeroed();
        fix.bio.read(leaf.pba, &mut stored).unwrap();
        assert_eq!(digest(&stored), leaf.hash);
    }

    #[test]
    fn rekey_moves_every_snapshot_to_the_current_key() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);
        write_vba(&mut fix, &mut vol, 3, b'A', 2, 1);
        let snap_a = vol.snap_idx;
        // A write to an unrelated subtree shares the branch of vba 3.
        write_vba(&mut fix, &mut vol, 12, b'E', 3, 2);
        let snap_b = vol.snap_idx;

        let roots_before: Vec<Pba> = vol.snaps.items.iter().map(|snap| snap.pba).collect();

        let req = Request::rekey(3, vol.snaps, vol.degree, 4, 3, KEY_2, KEY_1);
        let done = run(&mut fix.device, req);
        assert!(done.success());
        vol.snaps = *done.snapshots();

        // Every snapshot containing the vba got a relocated root.
        for idx in [snap_a, snap_b] {
            assert_ne!(vol.snaps.items[idx].pba, roots_before[idx]);
        }

        // The data is reachable under the new key in both snapshots.
        let done = read_vba(&mut fix, &vol, snap_a, 3, KEY_2);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'A'));
        let done = read_vba(&mut fix, &vol, snap_b, 3, KEY_2);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'A'));

        // The bootstrap snapshot never wrote vba 3, it still reads zero.
        let bootstrap_idx = vol
            .snaps
            .items
            .iter()
            .enumerate()
            .find(|(_, snap)| snap.valid && snap.gen == 1)
            .map(|(idx, _)| idx)
            .unwrap();
        let done = read_vba(&mut fix, &vol, bootstrap_idx, 3, KEY_2);
        assert!(done.success());
        assert_eq!(*done.data(), Block::zeroed());

        // Decrypting with the retired key yields different plaintext.
        let done = read_vba(&mut fix, &vol, snap_b, 3, KEY_1);
        assert!(done.success());
        assert_ne!(*done.data(), block_of(b'A'));

        // Unrelated data is untouched.
        let done = read_vba(&mut fix, &vol, snap_b, 12, KEY_1);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'E'));
    }

    #[test]
    fn rekey_shares_relocated_subtrees_between_snapshots() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);
        write_vba(&mut fix, &mut vol, 3, b'A', 2, 1);
        let snap_a = vol.snap_idx;
        write_vba(&mut fix, &mut vol, 12, b'E', 3, 2);
        let snap_b = vol.snap_idx;

        let req = Request::rekey(3, vol.snaps, vol.degree, 4, 3, KEY_2, KEY_1);
        let done = run(&mut fix.device, req);
        assert!(done.success());
        let snaps = *done.snapshots();

        // Both snapshots reference the same relocated leaf for vba 3.
        let leaf_a = leaf_node_on_disk(fix.bio.as_ref(), &snaps.items[snap_a], 3, 4);
        let leaf_b = leaf_node_on_disk(fix.bio.as_ref(), &snaps.items[snap_b], 3, 4);
        assert_eq!(leaf_a.pba, leaf_b.pba);
    }

    #[test]
    fn rekey_keeps_a_shorter_shared_root_snapshot_readable() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 2, 1, 2, 100);
        write_vba(&mut fix, &mut vol, 0, b'A', 2, 1);
        let low_snap = vol.snap_idx;

        // Growing the tree at a newer generation roots the new snapshot
        // one level above the old one, with the old root as its child 0.
        let req = Request::extension_step(
            vol.snaps,
            vol.snap_idx,
            2,
            3,
            2,
            vol.contingent.0,
            vol.contingent.1,
        );
        let done = run(&mut fix.device, req);
        assert!(done.success());
        vol.snaps = *done.snapshots();
        vol.snap_idx = done.curr_snap_idx();
        let high_snap = vol.snap_idx;
        assert_ne!(low_snap, high_snap);
        assert_eq!(vol.snaps.items[low_snap].max_level, 1);
        assert_eq!(vol.snaps.items[high_snap].max_level, 2);

        let req = Request::rekey(0, vol.snaps, vol.degree, 4, 3, KEY_2, KEY_1);
        let done = run(&mut fix.device, req);
        assert!(done.success());
        vol.snaps = *done.snapshots();

        for idx in [low_snap, high_snap] {
            let done = read_vba(&mut fix, &vol, idx, 0, KEY_2);
            assert!(done.success());
            assert_eq!(*done.data(), block_of(b'A'));
        }

        // The relocated shorter root carries its own digest, not the
        // taller root's.
        let low = vol.snaps.items[low_snap];
        let mut stored = Block::zeroed();
        fix.bio.read(low.pba, &mut stored).unwrap();
        assert_eq!(digest(&stored), low.hash);
    }

    #[test]
    fn rekey_shares_a_relocated_leaf_when_the_branch_diverged() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);
        write_vba(&mut fix, &mut vol, 3, b'A', 2, 1);
        let snap_a = vol.snap_idx;
        // A later write to a neighbour leaf copies the level-1 block
        // while the leaf of vba 3 keeps its address.
        write_vba(&mut fix, &mut vol, 2, b'C', 3, 2);
        let snap_b = vol.snap_idx;

        let req = Request::rekey(3, vol.snaps, vol.degree, 4, 3, KEY_2, KEY_1);
        let done = run(&mut fix.device, req);
        assert!(done.success());
        vol.snaps = *done.snapshots();

        for idx in [snap_a, snap_b] {
            let done = read_vba(&mut fix, &vol, idx, 3, KEY_2);
            assert!(done.success());
            assert_eq!(*done.data(), block_of(b'A'));
        }

        // Both snapshots reference the one relocated leaf.
        let leaf_a = leaf_node_on_disk(fix.bio.as_ref(), &vol.snaps.items[snap_a], 3, 4);
        let leaf_b = leaf_node_on_disk(fix.bio.as_ref(), &vol.snaps.items[snap_b], 3, 4);
        assert_eq!(leaf_a.pba, leaf_b.pba);

        // The neighbour leaf is untouched, still under the old key.
        let done = read_vba(&mut fix, &vol, snap_b, 2, KEY_1);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'C'));
    }

    #[test]
    fn failed_rekey_commits_nothing_and_can_be_retried() {
        // The allocator budget covers the bootstrap and one write, so
        // the rekey fails on its first allocation, before any block of
        // it hits the disk.
        let mut fix = fixture_with_alloc(6);
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);
        write_vba(&mut fix, &mut vol, 3, b'A', 2, 1);
        let calls_before = fix.alloc.nr_of_calls();

        let req = Request::rekey(3, vol.snaps, vol.degree, 3, 2, KEY_2, KEY_1);
        let done = run(&mut fix.device, req);
        assert!(!done.success());
        assert_eq!(fix.alloc.nr_of_calls(), calls_before + 1);

        // Retry with the pristine snapshot table after making room.
        fix.alloc.extend(100);
        let req = Request::rekey(3, vol.snaps, vol.degree, 3, 2, KEY_2, KEY_1);
        let done = run(&mut fix.device, req);
        assert!(done.success());
        vol.snaps = *done.snapshots();

        let done = read_vba(&mut fix, &vol, vol.snap_idx, 3, KEY_2);
        assert!(done.success());
        assert_eq!(*done.data(), block_of(b'A'));
    }

    #[test]
    fn a_full_device_hands_the_request_back() {
        let bio = Arc::new(MemBlockIo::create(1024));
        let cipher = Arc::new(AesCtrCipher::new());
        cipher.insert_key(KEY_1, [0x11; KEY_SIZE]);
        let alloc = Arc::new(BumpAllocator::new(ALLOC_FIRST, 10));
        let mut device: TestDevice = Device::new(bio.clone(), cipher, alloc, ZeroSupply, 1);

        let snap = init::format(bio.as_ref(), 4, 1, ROOT_PBA).unwrap();
        let mut snaps = Snapshots::default();
        snaps.items[0] = snap;

        let first = Request::extension_step(snaps, 0, 4, 1, 0, CONTINGENT_FIRST, 10);
        assert!(device.submit(first).is_ok());
        assert!(!device.ready_to_submit());

        let second = Request::extension_step(snaps, 0, 4, 1, 0, CONTINGENT_FIRST, 10);
        let rejected = device.submit(second).unwrap_err();
        assert_eq!(rejected.kind(), RequestKind::ExtensionStep);

        device.execute();
        assert!(device.poll().unwrap().success());
        assert!(device.ready_to_submit());
    }

    #[test]
    fn two_channels_progress_in_the_same_rounds() {
        let mut fix = fixture();
        let mut vol = bootstrap(&mut fix, 4, 2, 16, 100);
        write_vba(&mut fix, &mut vol, 1, b'A', 2, 1);
        write_vba(&mut fix, &mut vol, 10, b'B', 2, 1);

        let req_a = Request::read(1, vol.snaps, vol.snap_idx, 4, KEY_1);
        let req_b = Request::read(10, vol.snaps, vol.snap_idx, 4, KEY_1);
        assert!(fix.device.submit(req_a).is_ok());
        assert!(fix.device.submit(req_b).is_ok());
        fix.device.execute();

        let mut seen = Vec::new();
        while let Some(done) = fix.device.poll() {
            assert!(done.success());
            seen.push((done.vba(), done.data().clone()));
        }
        seen.sort_by_key(|(vba, _)| *vba);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (1, block_of(b'A')));
        assert_eq!(seen[1], (10, block_of(b'B')));
    }

    #[test]
    fn an_invalid_degree_is_rejected() {
        let mut fix = fixture();
        let vol = bootstrap(&mut fix, 4, 2, 16, 100);

        let done = run(
            &mut fix.device,
            Request::read(0, vol.snaps, vol.snap_idx, 3, KEY_1),
        );
        assert!(!done.success());
    }
}
