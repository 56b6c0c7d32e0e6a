//! Deduplicated, content-addressed block storage (§4.2): three fixed size
//! classes, 16 shards each, a SQLite index per shard backed by a flat data
//! file of fixed-size slots.
//!
//! Generalizes a ref-counted overlay's insert/remove-with-latent-removal
//! semantics from a trie-node `HashDB` onto on-disk, fixed-size,
//! content-addressed slots with an explicit `use` refcount table instead of
//! an in-memory journal.

mod datafile;
mod store;

use hashfs_util::{einval, fail_badblocksize, BLOCK_SIZE_LARGE, BLOCK_SIZE_MEDIUM, BLOCK_SIZE_SMALL, Result};

pub use store::{BlockStore, HashOp};

pub const SHARD_COUNT: usize = 16;

/// `hashfs.c: sizedirs = "sml"` / `sizelongnames`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSize {
    Small,
    Medium,
    Large,
}

impl BlockSize {
    pub fn for_payload_size(size: u64) -> BlockSize {
        if size < BLOCK_SIZE_MEDIUM {
            BlockSize::Small
        } else if size > 128 * 1024 * 1024 {
            BlockSize::Large
        } else {
            BlockSize::Medium
        }
    }

    pub fn from_bytes(bytes: u64) -> Result<BlockSize> {
        match bytes {
            BLOCK_SIZE_SMALL => Ok(BlockSize::Small),
            BLOCK_SIZE_MEDIUM => Ok(BlockSize::Medium),
            BLOCK_SIZE_LARGE => Ok(BlockSize::Large),
            other => Err(fail_badblocksize(format!("{other} is not a configured block size"))),
        }
    }

    pub fn bytes(self) -> u64 {
        match self {
            BlockSize::Small => BLOCK_SIZE_SMALL,
            BlockSize::Medium => BLOCK_SIZE_MEDIUM,
            BlockSize::Large => BLOCK_SIZE_LARGE,
        }
    }

    /// `hashfs.c: sizedirs`.
    pub fn letter(self) -> char {
        match self {
            BlockSize::Small => 's',
            BlockSize::Medium => 'm',
            BlockSize::Large => 'l',
        }
    }
}

/// Selects one of the 16 shards for `hash`. Any deterministic, evenly
/// spread byte would do; the low nibble of the first hash byte is cheapest.
pub fn shard_index(hash: &hashfs_util::Hash) -> usize {
    (hash[0] & 0x0f) as usize
}

/// `h[sml]0000000[0-f]`, the on-disk shard name shared by the `.db` index
/// and `.bin` data file for one `(size, shard)` pair.
pub fn shard_name(size: BlockSize, shard: usize) -> Result<String> {
    if shard >= SHARD_COUNT {
        return Err(einval(format!("shard {shard} out of range 0..{SHARD_COUNT}")));
    }
    Ok(format!("h{}0000000{:x}", size.letter(), shard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_name_matches_layout_convention() {
        assert_eq!(shard_name(BlockSize::Small, 0).unwrap(), "hs00000000");
        assert_eq!(shard_name(BlockSize::Medium, 15).unwrap(), "hm0000000f");
        assert_eq!(shard_name(BlockSize::Large, 10).unwrap(), "hl0000000a");
    }

    #[test]
    fn shard_out_of_range_is_einval() {
        assert!(shard_name(BlockSize::Small, 16).is_err());
    }

    #[test]
    fn size_class_selection_matches_limits() {
        assert_eq!(BlockSize::for_payload_size(0), BlockSize::Small);
        assert_eq!(BlockSize::for_payload_size(BLOCK_SIZE_MEDIUM), BlockSize::Medium);
        assert_eq!(BlockSize::for_payload_size(BLOCK_SIZE_LARGE), BlockSize::Large);
    }
}
