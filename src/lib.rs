//! treedisk
//!
//! A logical-to-physical translation layer for a content-addressed,
//! encrypted, copy-on-write block store. A Merkle tree of fixed-degree
//! inner nodes maps every virtual block address to the physical address
//! of its encrypted leaf, parents store the digest of their children,
//! and every version of the tree is rooted by a snapshot. Updates never
//! overwrite blocks an older snapshot still references.
//!
//! The [`Device`] drives client requests (read, write, rekey, tree
//! extension) through a pool of cooperative channels, delegating block
//! I/O, encryption, allocation, and plaintext supply to the traits at
//! its seams.

extern crate alloc;

mod bio;
mod crypto;
mod device;
mod error;
mod free;
mod init;
mod node;
mod prelude;
mod request;
mod tree;

pub use self::bio::{BlockIo, MemBlockIo, PlaintextSupply, ZeroSupply};
pub use self::crypto::{digest, AesCtrCipher, Cipher, Hash, HASH_SIZE, KEY_SIZE};
pub use self::device::{ChannelState, Device, DEFAULT_NR_OF_CHANNELS};
pub use self::error::{Errno, Error};
pub use self::free::{AllocPolicy, BumpAllocator, FreeTree};
pub use self::init::format;
pub use self::node::{Block, NodeBlock, NodeWalk, Snapshot, Snapshots, TreeWalkPbas, Type1Node};
pub use self::request::{Request, RequestKind};
pub use self::tree::{
    degree_is_valid, max_vba, node_index, Generation, KeyId, Pba, TreeDegree, TreeLevel, Vba,
    BLOCK_SIZE, INITIAL_GENERATION, INVALID_PBA, MAX_SNAPSHOTS, TREE_MAX_DEGREE, TREE_MAX_LEVEL,
    TREE_MAX_NR_OF_LEVELS,
};
