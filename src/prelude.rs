pub(crate) use crate::error::{Errno::*, Error};
pub(crate) use crate::tree::{
    Generation, KeyId, Pba, TreeDegree, TreeLevel, Vba, BLOCK_SIZE, INITIAL_GENERATION,
    INVALID_PBA, TREE_MAX_LEVEL, TREE_MAX_NR_OF_LEVELS,
};
pub(crate) use crate::{return_errno, return_errno_with_msg};

pub(crate) type Result<T> = core::result::Result<T, Error>;

pub(crate) use alloc::sync::Arc;
pub(crate) use alloc::vec::Vec;

pub(crate) use core::fmt::{self, Debug};
pub(crate) use log::{debug, error};
