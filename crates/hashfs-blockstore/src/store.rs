use std::path::Path;

use hashfs_db::{params, Handle, Migration};
use hashfs_util::{eagain, enoent, Hash, Result};

use crate::datafile::DataFile;
use crate::{shard_name, BlockSize};

const MIGRATIONS: &[Migration] = &[Migration::new(
    1,
    "CREATE TABLE blocks (
        hash BLOB PRIMARY KEY,
        slot INTEGER UNIQUE,
        len INTEGER,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE alloc (id INTEGER PRIMARY KEY CHECK (id = 0), next_slot INTEGER NOT NULL);
    INSERT INTO alloc (id, next_slot) VALUES (0, 1);
    CREATE TABLE freelist (slot INTEGER PRIMARY KEY);
    CREATE TABLE reservations (
        reserve_id BLOB NOT NULL,
        hash BLOB NOT NULL,
        ttl_at INTEGER NOT NULL,
        PRIMARY KEY (reserve_id, hash)
    );
    CREATE TABLE operations (
        token_id BLOB NOT NULL,
        hash BLOB NOT NULL,
        replica INTEGER NOT NULL,
        delta INTEGER NOT NULL,
        ttl_at INTEGER NOT NULL,
        PRIMARY KEY (token_id, hash, replica)
    );
    CREATE TABLE \"use\" (
        hash BLOB NOT NULL,
        replica INTEGER NOT NULL,
        age INTEGER NOT NULL,
        used INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (hash, replica, age)
    );",
)];

/// The four named block operations of §4.2: probe presence, reserve a slot
/// ahead of upload, promote a reservation to a live reference, or drop one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOp {
    Check,
    Reserve,
    InUse,
    Delete,
}

/// One (size class, shard) slice of the block store: an index database and
/// its flat data file.
pub struct BlockStore {
    db: Handle,
    data: DataFile,
    block_size: u64,
}

impl BlockStore {
    pub fn open(dir: &Path, size: BlockSize, shard: usize, cluster_uuid: [u8; 16]) -> Result<BlockStore> {
        let name = shard_name(size, shard)?;
        let db = Handle::open(&dir.join(format!("{name}.db")), MIGRATIONS)?;
        let data = DataFile::open_or_create(&dir.join(format!("{name}.bin")), &name, size.bytes(), cluster_uuid)?;
        Ok(BlockStore {
            db,
            data,
            block_size: size.bytes(),
        })
    }

    pub fn open_memory(size: BlockSize, cluster_uuid: [u8; 16]) -> Result<BlockStore> {
        let dir = tempfile::tempdir().unwrap();
        let name = "test-shard".to_string();
        let db = Handle::open_memory(MIGRATIONS)?;
        let data = DataFile::open_or_create(&dir.path().join("test.bin"), &name, size.bytes(), cluster_uuid)?;
        std::mem::forget(dir);
        Ok(BlockStore {
            db,
            data,
            block_size: size.bytes(),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_exists(&self, hash: &Hash) -> Result<bool> {
        let slot: Option<Option<i64>> = self
            .db
            .query_row_cached("SELECT slot FROM blocks WHERE hash = ?1", params![hash.to_vec()], |r| {
                r.get(0)
            })?;
        Ok(matches!(slot, Some(Some(_))))
    }

    fn allocate_slot(&self, tx: &rusqlite::Transaction, hash: &Hash, len: usize, now: i64) -> Result<u64> {
        let freed: Option<i64> = optional(tx.query_row(
            "SELECT slot FROM freelist ORDER BY slot LIMIT 1",
            [],
            |r| r.get(0),
        ))?;
        let slot = match freed {
            Some(s) => {
                tx.execute("DELETE FROM freelist WHERE slot = ?1", params![s])
                    .map_err(hashfs_util::HfsError::from)?;
                s as u64
            }
            None => {
                let next: i64 = tx
                    .query_row("SELECT next_slot FROM alloc WHERE id = 0", [], |r| r.get(0))
                    .map_err(hashfs_util::HfsError::from)?;
                tx.execute("UPDATE alloc SET next_slot = next_slot + 1 WHERE id = 0", [])
                    .map_err(hashfs_util::HfsError::from)?;
                next as u64
            }
        };
        tx.execute(
            "INSERT INTO blocks (hash, slot, len, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(hash) DO UPDATE SET slot = excluded.slot, len = excluded.len",
            params![hash.to_vec(), slot as i64, len as i64, now],
        )
        .map_err(hashfs_util::HfsError::from)?;
        Ok(slot)
    }

    /// Store a freshly-hashed block's payload. Writes the payload before
    /// the index row so a crash in between only wastes a slot, reclaimed
    /// later by GC. A block already indexed with a slot returns `EAGAIN`
    /// (this is a duplicate `put`, not an error the caller need treat as
    /// fatal); a placeholder row left behind by an earlier `reserve` is
    /// filled in rather than rejected.
    pub fn block_put(&self, hash: &Hash, payload: &[u8], now: i64) -> Result<()> {
        if payload.len() as u64 > self.block_size {
            return Err(hashfs_util::emsgsize(format!(
                "payload of {} bytes exceeds block size {}",
                payload.len(),
                self.block_size
            )));
        }
        self.db.with_tx(|tx| {
            let existing: Option<Option<i64>> =
                optional(tx.query_row("SELECT slot FROM blocks WHERE hash = ?1", params![hash.to_vec()], |r| {
                    r.get(0)
                }))?;
            if let Some(Some(_)) = existing {
                return Err(eagain(format!("block {} already stored", hashfs_util::to_hex(hash))));
            }
            let slot = self.allocate_slot(tx, hash, payload.len(), now)?;
            self.data.write_slot(slot, payload)?;
            Ok(())
        })
    }

    pub fn block_get(&self, hash: &Hash) -> Result<Vec<u8>> {
        let row: Option<(Option<i64>, Option<i64>)> = self.db.query_row_cached(
            "SELECT slot, len FROM blocks WHERE hash = ?1",
            params![hash.to_vec()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        match row {
            Some((Some(slot), Some(len))) => self.data.read_slot(slot as u64, len as usize),
            _ => Err(enoent(format!("no such block {}", hashfs_util::to_hex(hash)))),
        }
    }

    /// Apply one of the four named operations (§4.2). `id` is 20 bytes (a
    /// group/file id) or 40 bytes (group id followed by a token id); the
    /// token id, when present, is the idempotency key for `InUse`/`Delete`
    /// so a retried flush applies its refcount delta at most once.
    pub fn hashop(&self, op: HashOp, hash: &Hash, id: &[u8], replica: u32, age: u64, ttl_at: i64) -> Result<bool> {
        if id.len() != 20 && id.len() != 40 {
            return Err(hashfs_util::einval("hashop id must be 20 or 40 bytes"));
        }
        let dedupe_key = if id.len() == 40 { &id[20..40] } else { &id[0..20] };

        match op {
            HashOp::Check => self.block_exists(hash),
            HashOp::Reserve => self.db.with_tx(|tx| {
                tx.execute(
                    "INSERT OR REPLACE INTO reservations (reserve_id, hash, ttl_at) VALUES (?1, ?2, ?3)",
                    params![&id[0..20], hash.to_vec(), ttl_at],
                )
                .map_err(hashfs_util::HfsError::from)?;
                let present: Option<Option<i64>> =
                    optional(tx.query_row("SELECT slot FROM blocks WHERE hash = ?1", params![hash.to_vec()], |r| {
                        r.get(0)
                    }))?;
                if present.is_none() {
                    tx.execute(
                        "INSERT INTO blocks (hash, slot, len, created_at) VALUES (?1, NULL, NULL, ?2)",
                        params![hash.to_vec(), ttl_at],
                    )
                    .map_err(hashfs_util::HfsError::from)?;
                }
                Ok(matches!(present, Some(Some(_))))
            }),
            HashOp::InUse => self.db.with_tx(|tx| {
                if !block_row_exists(tx, hash)? {
                    return Err(enoent(format!("no such block {}", hashfs_util::to_hex(hash))));
                }
                let applied = apply_operation(tx, dedupe_key, hash, replica, 1, ttl_at)?;
                if applied {
                    bump_use(tx, hash, replica, age, 1)?;
                }
                Ok(true)
            }),
            HashOp::Delete => self.db.with_tx(|tx| {
                let applied = apply_operation(tx, dedupe_key, hash, replica, -1, ttl_at)?;
                if applied {
                    bump_use(tx, hash, replica, age, -1)?;
                }
                Ok(true)
            }),
        }
    }

    /// Reservations whose `ttl_at`, or whose block's `created_at`, has
    /// passed `now` — the two reservation-expiry sweeps of §4.6.
    pub fn expired_reservations_by_ttl(&self, now: i64) -> Result<Vec<(Vec<u8>, Hash)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT reserve_id, hash FROM reservations WHERE ttl_at < ?1")
                .map_err(hashfs_util::HfsError::from)?;
            collect_reservations(&mut stmt, params![now])
        })
    }

    pub fn expired_reservations_by_block_age(&self, now: i64, grace: i64) -> Result<Vec<(Vec<u8>, Hash)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT r.reserve_id, r.hash FROM reservations r
                     JOIN blocks b ON b.hash = r.hash
                     WHERE b.created_at < ?1",
                )
                .map_err(hashfs_util::HfsError::from)?;
            collect_reservations(&mut stmt, params![now - grace])
        })
    }

    pub fn expire_reservation(&self, reserve_id: &[u8], hash: &Hash) -> Result<()> {
        self.db.execute_cached(
            "DELETE FROM reservations WHERE reserve_id = ?1 AND hash = ?2",
            params![reserve_id, hash.to_vec()],
        )?;
        Ok(())
    }

    pub fn expired_operations(&self, now: i64) -> Result<Vec<(Vec<u8>, Hash, u32)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT token_id, hash, replica FROM operations WHERE ttl_at < ?1")
                .map_err(hashfs_util::HfsError::from)?;
            let rows = stmt
                .query_map(params![now], |r| {
                    let hash: Vec<u8> = r.get(1)?;
                    Ok((r.get::<_, Vec<u8>>(0)?, hash, r.get::<_, u32>(2)?))
                })
                .map_err(hashfs_util::HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                let (token, hash, replica) = row.map_err(hashfs_util::HfsError::from)?;
                let hash = to_hash(hash)?;
                out.push((token, hash, replica));
            }
            Ok(out)
        })
    }

    pub fn expire_operation(&self, token_id: &[u8], hash: &Hash, replica: u32) -> Result<()> {
        self.db.execute_cached(
            "DELETE FROM operations WHERE token_id = ?1 AND hash = ?2 AND replica = ?3",
            params![token_id, hash.to_vec(), replica],
        )?;
        Ok(())
    }

    pub fn used_sum(&self, hash: &Hash) -> Result<i64> {
        let sum: i64 = self
            .db
            .query_row_cached(
                "SELECT COALESCE(SUM(used), 0) FROM \"use\" WHERE hash = ?1",
                params![hash.to_vec()],
                |r| r.get(0),
            )?
            .unwrap_or(0);
        Ok(sum)
    }

    pub fn has_reservations(&self, hash: &Hash) -> Result<bool> {
        let any: Option<i64> = self.db.query_row_cached(
            "SELECT 1 FROM reservations WHERE hash = ?1 LIMIT 1",
            params![hash.to_vec()],
            |r| r.get(0),
        )?;
        Ok(any.is_some())
    }

    /// Count of reservation rows in this shard, expired or not — the
    /// `reservations_open` gauge's per-shard contribution.
    pub fn reservation_count(&self) -> Result<i64> {
        let count: i64 = self
            .db
            .query_row_cached("SELECT COUNT(*) FROM reservations", [], |r| r.get(0))?
            .unwrap_or(0);
        Ok(count)
    }

    pub fn has_negative_use(&self) -> Result<bool> {
        let any: Option<i64> =
            self.db
                .query_row_cached("SELECT 1 FROM \"use\" WHERE used < 0 LIMIT 1", [], |r| r.get(0))?;
        Ok(any.is_some())
    }

    /// Drop a `blocks` row with no remaining references and free its slot
    /// for reuse, leaving the payload in place until the next allocation
    /// overwrites it (§4.6 refcount sweep).
    pub fn reclaim_block(&self, hash: &Hash) -> Result<()> {
        self.db.with_tx(|tx| {
            if let Some(Some(slot)) = optional(tx.query_row(
                "SELECT slot FROM blocks WHERE hash = ?1",
                params![hash.to_vec()],
                |r| r.get::<_, Option<i64>>(0),
            ))? {
                tx.execute("INSERT INTO freelist (slot) VALUES (?1)", params![slot])
                    .map_err(hashfs_util::HfsError::from)?;
            }
            tx.execute("DELETE FROM blocks WHERE hash = ?1", params![hash.to_vec()])
                .map_err(hashfs_util::HfsError::from)?;
            tx.execute("DELETE FROM \"use\" WHERE hash = ?1", params![hash.to_vec()])
                .map_err(hashfs_util::HfsError::from)?;
            Ok(())
        })
    }

    /// Every hash with a stored payload, for the rebalance driver to
    /// compare against a new [`hashfs_hdist::Distribution`]. Unlike
    /// [`BlockStore::collectible_blocks`] this includes blocks still
    /// referenced — rebalancing must not wait for a block to become
    /// garbage before deciding whether it needs to move.
    pub fn all_block_hashes(&self) -> Result<Vec<Hash>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT hash FROM blocks WHERE slot IS NOT NULL")
                .map_err(hashfs_util::HfsError::from)?;
            let rows = stmt
                .query_map([], |r| r.get::<_, Vec<u8>>(0))
                .map_err(hashfs_util::HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(to_hash(row.map_err(hashfs_util::HfsError::from)?)?);
            }
            Ok(out)
        })
    }

    /// Block hashes eligible for the refcount sweep: no reservations, and
    /// either no `use` rows or they sum to zero.
    pub fn collectible_blocks(&self) -> Result<Vec<Hash>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT b.hash FROM blocks b
                     WHERE b.slot IS NOT NULL
                       AND NOT EXISTS (SELECT 1 FROM reservations r WHERE r.hash = b.hash)
                       AND COALESCE((SELECT SUM(used) FROM \"use\" WHERE hash = b.hash), 0) = 0",
                )
                .map_err(hashfs_util::HfsError::from)?;
            let rows = stmt
                .query_map([], |r| r.get::<_, Vec<u8>>(0))
                .map_err(hashfs_util::HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(to_hash(row.map_err(hashfs_util::HfsError::from)?)?);
            }
            Ok(out)
        })
    }
}

fn block_row_exists(tx: &rusqlite::Transaction, hash: &Hash) -> Result<bool> {
    let row: Option<i64> = optional(tx.query_row(
        "SELECT 1 FROM blocks WHERE hash = ?1",
        params![hash.to_vec()],
        |r| r.get(0),
    ))?;
    Ok(row.is_some())
}

/// Insert the operation row if its dedupe key hasn't been seen for this
/// `(hash, replica)` yet. Returns whether this call actually applied the
/// delta (`false` means a retried, already-applied flush).
fn apply_operation(
    tx: &rusqlite::Transaction,
    token_id: &[u8],
    hash: &Hash,
    replica: u32,
    delta: i64,
    ttl_at: i64,
) -> Result<bool> {
    let n = tx
        .execute(
            "INSERT OR IGNORE INTO operations (token_id, hash, replica, delta, ttl_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![token_id, hash.to_vec(), replica, delta, ttl_at],
        )
        .map_err(hashfs_util::HfsError::from)?;
    Ok(n > 0)
}

fn bump_use(tx: &rusqlite::Transaction, hash: &Hash, replica: u32, age: u64, delta: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO \"use\" (hash, replica, age, used) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(hash, replica, age) DO UPDATE SET used = used + excluded.used",
        params![hash.to_vec(), replica, age as i64, delta],
    )
    .map_err(hashfs_util::HfsError::from)?;
    Ok(())
}

fn collect_reservations(
    stmt: &mut rusqlite::Statement,
    params: impl rusqlite::Params,
) -> Result<Vec<(Vec<u8>, Hash)>> {
    let rows = stmt
        .query_map(params, |r| Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?)))
        .map_err(hashfs_util::HfsError::from)?;
    let mut out = Vec::new();
    for row in rows {
        let (reserve_id, hash) = row.map_err(hashfs_util::HfsError::from)?;
        out.push((reserve_id, to_hash(hash)?));
    }
    Ok(out)
}

fn to_hash(v: Vec<u8>) -> Result<Hash> {
    v.try_into()
        .map_err(|_| hashfs_util::fail_einternal("corrupt 20-byte hash column"))
}

fn optional<T>(r: rusqlite::Result<T>) -> Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(hashfs_util::HfsError::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> Hash {
        let mut h = [0u8; 20];
        h[0] = b;
        h
    }

    fn id20(b: u8) -> [u8; 20] {
        [b; 20]
    }

    #[test]
    fn put_get_roundtrip() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        store.block_put(&hash(1), b"payload", 1000).unwrap();
        assert_eq!(store.block_get(&hash(1)).unwrap(), b"payload");
    }

    #[test]
    fn missing_block_is_enoent() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        let err = store.block_get(&hash(9)).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::ENoEnt);
    }

    #[test]
    fn duplicate_put_is_eagain() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        store.block_put(&hash(2), b"x", 1000).unwrap();
        let err = store.block_put(&hash(2), b"x", 1000).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::EAgain);
    }

    #[test]
    fn reserve_creates_placeholder_then_put_fills_it_in() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        let present = store.hashop(HashOp::Reserve, &hash(3), &id20(1), 1, 1, 1000).unwrap();
        assert!(!present);
        assert!(!store.block_exists(&hash(3)).unwrap());
        store.block_put(&hash(3), b"data", 500).unwrap();
        assert!(store.block_exists(&hash(3)).unwrap());
    }

    #[test]
    fn reservation_count_reflects_open_rows() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        assert_eq!(store.reservation_count().unwrap(), 0);
        store.hashop(HashOp::Reserve, &hash(3), &id20(1), 1, 1, 1000).unwrap();
        store.hashop(HashOp::Reserve, &hash(4), &id20(2), 1, 1, 1000).unwrap();
        assert_eq!(store.reservation_count().unwrap(), 2);
        store.expire_reservation(&id20(1), &hash(3)).unwrap();
        assert_eq!(store.reservation_count().unwrap(), 1);
    }

    #[test]
    fn inuse_then_delete_is_idempotent_per_token() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        store.block_put(&hash(4), b"data", 500).unwrap();
        let mut id = [0u8; 40];
        id[..20].copy_from_slice(&id20(9));
        id[20..].copy_from_slice(&id20(7));

        store.hashop(HashOp::InUse, &hash(4), &id, 1, 1, 1000).unwrap();
        assert_eq!(store.used_sum(&hash(4)).unwrap(), 1);
        // Retried flush with the same token id: no double increment.
        store.hashop(HashOp::InUse, &hash(4), &id, 1, 1, 1000).unwrap();
        assert_eq!(store.used_sum(&hash(4)).unwrap(), 1);

        store.hashop(HashOp::Delete, &hash(4), &id20(9), 1, 1, 1000).unwrap();
        assert_eq!(store.used_sum(&hash(4)).unwrap(), 0);
    }

    #[test]
    fn inuse_on_absent_block_is_enoent() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        let err = store
            .hashop(HashOp::InUse, &hash(5), &id20(1), 1, 1, 1000)
            .unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::ENoEnt);
    }

    #[test]
    fn reclaim_frees_slot_for_reuse() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        store.block_put(&hash(6), b"data", 500).unwrap();
        assert!(store.collectible_blocks().unwrap().contains(&hash(6)));
        store.reclaim_block(&hash(6)).unwrap();
        assert!(!store.block_exists(&hash(6)).unwrap());
        // A later put for a new hash should be able to reuse the freed slot
        // without error.
        store.block_put(&hash(7), b"other", 500).unwrap();
    }

    #[test]
    fn expiry_sweeps_find_stale_reservations_and_operations() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        store.hashop(HashOp::Reserve, &hash(8), &id20(1), 1, 1, 100).unwrap();
        assert_eq!(store.expired_reservations_by_ttl(200).unwrap().len(), 1);
        assert!(store.expired_reservations_by_ttl(50).unwrap().is_empty());

        store.block_put(&hash(8), b"v", 500).unwrap();
        store
            .hashop(HashOp::InUse, &hash(8), &id20(2), 1, 1, 100)
            .unwrap();
        assert_eq!(store.expired_operations(200).unwrap().len(), 1);
    }

    #[test]
    fn negative_use_is_detected() {
        let store = BlockStore::open_memory(BlockSize::Small, [1u8; 16]).unwrap();
        store.block_put(&hash(9), b"v", 500).unwrap();
        // A delete arriving before its matching increment, as can happen
        // mid-rebalance: legal per the safety-gate note in §4.6.
        store
            .hashop(HashOp::Delete, &hash(9), &id20(3), 1, 1, 1000)
            .unwrap();
        assert!(store.has_negative_use().unwrap());
    }
}
