//! Free-space allocation contract.
//!
//! The device itself does not own free-space accounting. It hands the
//! walked branch and a partially filled PBA table to a `FreeTree`, which
//! fills the open slots with fresh physical addresses. The policy tells
//! the allocator what the freed counterparts of those slots are: blocks
//! of the current generation, or blocks kept alive until the snapshot of
//! generation `free_gen` is dropped.

use spin::Mutex;

use crate::node::{NodeWalk, TreeWalkPbas};
use crate::prelude::*;

/// What kind of update the allocation serves.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocPolicy {
    /// Copy-on-write for a data write or a tree extension.
    NonRekeying,
    /// Rekeying the newest snapshot's branch.
    RekeyingCurrentGen,
    /// Rekeying the branch of an older snapshot.
    RekeyingOldGen,
}

/// Allocator of physical blocks.
///
/// `alloc_pbas` must fill exactly the zero slots of
/// `new_pbas.pbas[..=max_level]`, `nr_of_blks` in total; occupied slots
/// carry addresses the caller reuses in place. Returned addresses are
/// never 0 and never `INVALID_PBA`.
pub trait FreeTree: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn alloc_pbas(
        &self,
        policy: AllocPolicy,
        walk: &NodeWalk,
        nr_of_blks: u64,
        curr_gen: Generation,
        free_gen: Generation,
        max_level: TreeLevel,
        new_pbas: &mut TreeWalkPbas,
    ) -> Result<()>;
}

impl<T: FreeTree> FreeTree for Arc<T> {
    fn alloc_pbas(
        &self,
        policy: AllocPolicy,
        walk: &NodeWalk,
        nr_of_blks: u64,
        curr_gen: Generation,
        free_gen: Generation,
        max_level: TreeLevel,
        new_pbas: &mut TreeWalkPbas,
    ) -> Result<()> {
        (**self).alloc_pbas(
            policy, walk, nr_of_blks, curr_gen, free_gen, max_level, new_pbas,
        )
    }
}

struct BumpState {
    next: Pba,
    end: Pba,
    nr_of_calls: u64,
}

/// A bounded sequential allocator, mainly for testing.
///
/// It never reclaims freed blocks, so every allocated address is unique
/// for the lifetime of the allocator. The call counter makes allocation
/// activity observable to tests.
pub struct BumpAllocator {
    state: Mutex<BumpState>,
}

impl BumpAllocator {
    pub fn new(first_pba: Pba, nr_of_pbas: u64) -> Self {
        debug_assert!(first_pba != 0);
        Self {
            state: Mutex::new(BumpState {
                next: first_pba,
                end: first_pba + nr_of_pbas,
                nr_of_calls: 0,
            }),
        }
    }

    /// Number of `alloc_pbas` invocations so far.
    pub fn nr_of_calls(&self) -> u64 {
        self.state.lock().nr_of_calls
    }

    /// Grow the allocatable range by `nr_of_pbas` blocks.
    pub fn extend(&self, nr_of_pbas: u64) {
        self.state.lock().end += nr_of_pbas;
    }
}

impl FreeTree for BumpAllocator {
    fn alloc_pbas(
        &self,
        _policy: AllocPolicy,
        _walk: &NodeWalk,
        nr_of_blks: u64,
        _curr_gen: Generation,
        _free_gen: Generation,
        max_level: TreeLevel,
        new_pbas: &mut TreeWalkPbas,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.nr_of_calls += 1;

        if state.end - state.next < nr_of_blks {
            return_errno_with_msg!(NotEnoughSpace, "free blocks exhausted");
        }
        let mut remaining = nr_of_blks;
        for slot in new_pbas.pbas[..=max_level].iter_mut() {
            if *slot != 0 {
                continue;
            }
            if remaining == 0 {
                return_errno_with_msg!(InvalidArgs, "more open slots than requested blocks");
            }
            *slot = state.next;
            state.next += 1;
            remaining -= 1;
        }
        if remaining != 0 {
            return_errno_with_msg!(InvalidArgs, "fewer open slots than requested blocks");
        }
        Ok(())
    }
}
