//! Raw block I/O and plaintext supply.

use spin::Mutex;

use crate::node::Block;
use crate::prelude::*;

/// A fixed set of physical blocks supporting random reads and writes.
///
/// # Thread safety
///
/// `BlockIo` is a data structure of interior mutability. It is ok to
/// perform I/O on a `BlockIo` concurrently in multiple threads, with
/// per-block atomicity.
pub trait BlockIo: Send + Sync {
    /// Read the block at `pba`.
    fn read(&self, pba: Pba, block: &mut Block) -> Result<()>;

    /// Write the block at `pba`.
    fn write(&self, pba: Pba, block: &Block) -> Result<()>;

    /// Returns the number of blocks.
    fn nblocks(&self) -> usize;
}

impl<T: BlockIo> BlockIo for Arc<T> {
    fn read(&self, pba: Pba, block: &mut Block) -> Result<()> {
        (**self).read(pba, block)
    }

    fn write(&self, pba: Pba, block: &Block) -> Result<()> {
        (**self).write(pba, block)
    }

    fn nblocks(&self) -> usize {
        (**self).nblocks()
    }
}

/// Source of the plaintext for leaves no write has reached yet.
pub trait PlaintextSupply: Send + Sync {
    fn supply(&self, vba: Vba, block: &mut Block) -> Result<()>;
}

impl<T: PlaintextSupply> PlaintextSupply for Arc<T> {
    fn supply(&self, vba: Vba, block: &mut Block) -> Result<()> {
        (**self).supply(vba, block)
    }
}

/// Supplies all-zero plaintext, the content of untouched leaves.
pub struct ZeroSupply;

impl PlaintextSupply for ZeroSupply {
    fn supply(&self, _vba: Vba, block: &mut Block) -> Result<()> {
        block.as_mut_slice().fill(0);
        Ok(())
    }
}

/// An in-memory `BlockIo`, mainly for testing.
pub struct MemBlockIo {
    blocks: Mutex<Vec<Block>>,
}

impl MemBlockIo {
    pub fn create(nblocks: usize) -> Self {
        Self {
            blocks: Mutex::new(alloc::vec![Block::zeroed(); nblocks]),
        }
    }

    /// Flip one byte of the stored block, to exercise integrity checks.
    pub fn corrupt(&self, pba: Pba) {
        let mut blocks = self.blocks.lock();
        if let Some(block) = blocks.get_mut(pba as usize) {
            block.as_mut_slice()[0] ^= 0xff;
        }
    }
}

impl BlockIo for MemBlockIo {
    fn read(&self, pba: Pba, block: &mut Block) -> Result<()> {
        let blocks = self.blocks.lock();
        let stored = blocks
            .get(pba as usize)
            .ok_or(Error::with_msg(IoFailed, "read beyond device"))?;
        *block = stored.clone();
        Ok(())
    }

    fn write(&self, pba: Pba, block: &Block) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let stored = blocks
            .get_mut(pba as usize)
            .ok_or(Error::with_msg(IoFailed, "write beyond device"))?;
        *stored = block.clone();
        Ok(())
    }

    fn nblocks(&self) -> usize {
        self.blocks.lock().len()
    }
}
