//! Shared error taxonomy and hashing primitives used across every HashFS
//! storage crate.

mod error;
mod hash;
mod limits;

pub use error::{
    eagain, eexist, efault, einval, enoent, enospc, eperm, emsgsize, fail_badblocksize, fail_einit,
    fail_einternal, fail_etoomany, fail_locked, fail_volume_eexist, iter_no_more, Category, Code,
    HfsError, Result,
};
pub use hash::{from_hex, hash_buf, hash_parts, to_hex, Hash, HASH_BYTES};
pub use limits::{
    block_size_for, nblocks, BLOCK_SIZES, BLOCK_SIZE_LARGE, BLOCK_SIZE_MEDIUM, BLOCK_SIZE_SMALL,
    FILE_NAME_MAX, FILE_NAME_MIN, MAX_PENDING_JOBS, META_ITEMS_MAX, META_KEY_MAX, META_KEY_MIN,
    META_VALUE_MAX, REVISIONS_MAX, REVISIONS_MIN, VOLUME_NAME_MAX, VOLUME_NAME_MIN,
};
