//! Bounded maintenance sweeps (§4.6) and the block-rebalance driver (§4.7).
//!
//! Every sweep here is deliberately small and side-effect-local: it reads
//! one `BlockStore`/`UploadStore` shard, does a bounded amount of work, and
//! returns a count. The engine facade is the one that loops this over all
//! 48 block shards and decides how often to call it — this crate holds no
//! timer and no cross-shard state.

use std::collections::HashSet;

use hashfs_blockstore::BlockStore;
use hashfs_hdist::{Distribution, NodeId, Which};
use hashfs_upload::UploadStore;
use hashfs_util::{fail_einternal, Hash, Result};

/// Tally from one pass of [`run_block_sweep`] over a single shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reservations_expired_by_ttl: usize,
    pub reservations_expired_by_age: usize,
    pub operations_expired: usize,
    pub blocks_reclaimed: usize,
}

/// Drops reservations past their `ttl_at` (abandoned `putblock` uploads
/// that never reached `gettoken`).
pub fn sweep_reservations_by_ttl(store: &BlockStore, now: i64) -> Result<usize> {
    let expired = store.expired_reservations_by_ttl(now)?;
    for (reserve_id, hash) in &expired {
        store.expire_reservation(reserve_id, hash)?;
    }
    Ok(expired.len())
}

/// Drops reservations whose underlying block has sat unpromoted past
/// `grace` seconds — the slower-moving companion to the ttl sweep, keyed
/// off the block's `created_at` rather than the reservation itself.
pub fn sweep_reservations_by_block_age(store: &BlockStore, now: i64, grace: i64) -> Result<usize> {
    let expired = store.expired_reservations_by_block_age(now, grace)?;
    for (reserve_id, hash) in &expired {
        store.expire_reservation(reserve_id, hash)?;
    }
    Ok(expired.len())
}

/// Drops `use` operations past their `ttl_at` without ever being
/// reconfirmed — e.g. a job whose flush step never landed.
pub fn sweep_operations(store: &BlockStore, now: i64) -> Result<usize> {
    let expired = store.expired_operations(now)?;
    for (token_id, hash, replica) in &expired {
        store.expire_operation(token_id, hash, *replica)?;
    }
    Ok(expired.len())
}

/// Reclaims blocks with no reservations and a zero summed refcount.
///
/// Refuses to run at all if any `use` row in this shard has gone negative
/// — a negative refcount means a `Delete` op landed without a matching
/// prior `InUse`, which means the accounting for this shard cannot be
/// trusted right now. Running the sweep anyway risks freeing a block a
/// client still expects to read. The caller should alert and leave the
/// shard alone until the negative row is understood.
pub fn sweep_refcounts(store: &BlockStore) -> Result<usize> {
    if store.has_negative_use()? {
        return Err(fail_einternal(
            "refcount sweep refused: shard has a negative `use` row, refcounts cannot be trusted",
        ));
    }
    let collectible = store.collectible_blocks()?;
    for hash in &collectible {
        store.reclaim_block(hash)?;
    }
    Ok(collectible.len())
}

/// Runs the three bounded, always-safe sweeps, then the refcount sweep if
/// the shard's accounting looks sound. A refused refcount sweep still
/// returns `Ok` with `blocks_reclaimed: 0` — the caller decides whether a
/// zero count plus a separate negative-use alert warrants escalation.
pub fn run_block_sweep(store: &BlockStore, now: i64, reservation_grace: i64) -> Result<SweepReport> {
    let reservations_expired_by_ttl = sweep_reservations_by_ttl(store, now)?;
    let reservations_expired_by_age = sweep_reservations_by_block_age(store, now, reservation_grace)?;
    let operations_expired = sweep_operations(store, now)?;
    let blocks_reclaimed = match sweep_refcounts(store) {
        Ok(n) => n,
        Err(e) => {
            log::warn!("refcount sweep skipped: {e}");
            0
        }
    };
    Ok(SweepReport {
        reservations_expired_by_ttl,
        reservations_expired_by_age,
        operations_expired,
        blocks_reclaimed,
    })
}

/// Drops upload tokens abandoned before `gettoken`/`commitjob` ever
/// completed, oldest-expiry first, capped at `limit` per call so a GC pass
/// never blocks an upload shard for longer than one bounded batch.
pub fn sweep_expired_tokens(store: &UploadStore, now: i64, limit: usize) -> Result<usize> {
    let expired = store.expired_tokens(now, limit)?;
    for tid in &expired {
        store.delete_token(*tid)?;
    }
    Ok(expired.len())
}

/// What a rebalance pass needs to know about one block: whether this node
/// must keep holding it (it is this node's responsibility under the
/// outgoing or incoming distribution, or both), and whether it must be
/// pushed to another node before it can be dropped locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlacement {
    pub hash: Hash,
    pub hold: bool,
    pub push: bool,
}

/// Classifies every block a shard currently stores against a
/// (possibly rebalancing) distribution.
///
/// `hold` blocks must be excluded from [`sweep_refcounts`] regardless of
/// what their `use` rows say — a block that is between reservations
/// during a rebalance can have a momentarily zero refcount without being
/// garbage. `push` blocks are ones this node owned under the outgoing
/// distribution but not the incoming one: once a replica has confirmed
/// receipt, the engine facade can stop holding it and let the refcount
/// sweep take it on a later pass.
pub fn plan_block_rebalance(
    store: &BlockStore,
    dist: &Distribution,
    self_node: NodeId,
    replica_count: usize,
) -> Result<Vec<BlockPlacement>> {
    let hashes = store.all_block_hashes()?;
    let mut out = Vec::with_capacity(hashes.len());
    for hash in hashes {
        let next_nodes = dist.hashnodes_all(Which::Next, &hash, replica_count)?;
        let on_next = next_nodes.contains(&self_node);
        let on_prev = if dist.is_rebalancing() {
            dist.hashnodes_all(Which::Prev, &hash, replica_count)?.contains(&self_node)
        } else {
            on_next
        };
        out.push(BlockPlacement {
            hash,
            hold: on_next || on_prev,
            push: on_prev && !on_next,
        });
    }
    Ok(out)
}

/// Convenience extraction of the hold set alone, for a caller that only
/// needs to exclude blocks from the refcount sweep and does not care
/// which ones additionally need pushing.
pub fn hold_set(placements: &[BlockPlacement]) -> HashSet<Hash> {
    placements.iter().filter(|p| p.hold).map(|p| p.hash).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashfs_blockstore::{BlockSize, HashOp};
    use hashfs_hdist::{Build, NodeEntry};

    fn node(id: u8) -> NodeId {
        [id; 16]
    }

    fn cluster() -> [u8; 16] {
        [7u8; 16]
    }

    fn hash_of(n: u8) -> Hash {
        hashfs_util::hash_buf("cluster", &[n])
    }

    #[test]
    fn ttl_sweep_drops_only_expired_reservations() {
        let store = BlockStore::open_memory(BlockSize::Small, cluster()).unwrap();
        let fresh = hash_of(1);
        let stale = hash_of(2);
        store.hashop(HashOp::Reserve, &fresh, &[1u8; 20], 0, 0, 1_000).unwrap();
        store.hashop(HashOp::Reserve, &stale, &[2u8; 20], 0, 0, 10).unwrap();

        let n = sweep_reservations_by_ttl(&store, 100).unwrap();
        assert_eq!(n, 1);
        assert!(store.has_reservations(&fresh).unwrap());
        assert!(!store.has_reservations(&stale).unwrap());
    }

    #[test]
    fn refcount_sweep_refuses_on_negative_use() {
        let store = BlockStore::open_memory(BlockSize::Small, cluster()).unwrap();
        let hash = hash_of(3);
        store.block_put(&hash, b"payload", 0).unwrap();
        // A bare Delete with no prior InUse drives `use` negative.
        store.hashop(HashOp::Delete, &hash, &[9u8; 20], 0, 0, 0).unwrap();

        assert!(store.has_negative_use().unwrap());
        assert!(sweep_refcounts(&store).is_err());
    }

    #[test]
    fn refcount_sweep_reclaims_unreferenced_block() {
        let store = BlockStore::open_memory(BlockSize::Small, cluster()).unwrap();
        let hash = hash_of(4);
        store.block_put(&hash, b"payload", 0).unwrap();

        let n = sweep_refcounts(&store).unwrap();
        assert_eq!(n, 1);
        assert!(store.block_get(&hash).is_err());
    }

    #[test]
    fn run_block_sweep_skips_refcounts_but_still_reports_reservation_sweeps() {
        let store = BlockStore::open_memory(BlockSize::Small, cluster()).unwrap();
        let bad = hash_of(5);
        store.block_put(&bad, b"payload", 0).unwrap();
        store.hashop(HashOp::Delete, &bad, &[9u8; 20], 0, 0, 0).unwrap();
        let stale_reservation = hash_of(6);
        store
            .hashop(HashOp::Reserve, &stale_reservation, &[1u8; 20], 0, 0, 5)
            .unwrap();

        let report = run_block_sweep(&store, 100, 0).unwrap();
        assert_eq!(report.reservations_expired_by_ttl, 1);
        assert_eq!(report.blocks_reclaimed, 0);
    }

    fn build(nodes: &[u8]) -> Build {
        Build {
            seed: 1,
            nodes: nodes
                .iter()
                .map(|&n| NodeEntry {
                    node: node(n),
                    public_addr: String::new(),
                    internal_addr: String::new(),
                    capacity: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn stable_distribution_holds_everything_placed_on_self() {
        let store = BlockStore::open_memory(BlockSize::Small, cluster()).unwrap();
        let hash = hash_of(7);
        store.block_put(&hash, b"payload", 0).unwrap();
        let dist = Distribution::stable(1, build(&[1, 2, 3]));
        let nodes = dist.hashnodes_all(Which::Next, &hash, 1).unwrap();
        let self_node = nodes[0];

        let placements = plan_block_rebalance(&store, &dist, self_node, 1).unwrap();
        assert_eq!(placements.len(), 1);
        assert!(placements[0].hold);
        assert!(!placements[0].push);
    }

    #[test]
    fn rebalancing_distribution_marks_blocks_leaving_self_for_push() {
        let store = BlockStore::open_memory(BlockSize::Small, cluster()).unwrap();
        let hash = hash_of(8);
        store.block_put(&hash, b"payload", 0).unwrap();

        let prev = build(&[1]);
        let next = build(&[1, 2]);
        let dist = Distribution::rebalancing(2, prev, next);

        // With replica_count 1 and only node 1 in `prev`, self holds the
        // block under `prev`; find a target where `next` moves it away.
        let prev_nodes = dist.hashnodes_all(Which::Prev, &hash, 1).unwrap();
        let self_node = prev_nodes[0];
        let next_nodes = dist.hashnodes_all(Which::Next, &hash, 1).unwrap();

        let placements = plan_block_rebalance(&store, &dist, self_node, 1).unwrap();
        assert_eq!(placements.len(), 1);
        assert!(placements[0].hold);
        assert_eq!(placements[0].push, !next_nodes.contains(&self_node));
    }

    #[test]
    fn expired_tokens_are_removed_up_to_limit() {
        let store = UploadStore::open_memory().unwrap();
        let dist = Distribution::stable(1, build(&[1]));
        let mut rng = rand::rngs::mock::StepRng::new(1, 1);
        let tid1 = store.putfile_begin(1, "a", 1, &mut rng, 0).unwrap();
        store
            .putfile_gettoken_final(tid1, 1, &dist, &[0u8; 32], 0, 1_000_000, 0, 0)
            .unwrap();

        let n = sweep_expired_tokens(&store, 1_000_000, 10).unwrap();
        assert_eq!(n, 1);
    }
}
