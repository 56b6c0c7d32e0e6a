//! Upload state machine (§4.4): `IDLE -> OPEN -> EXTENDING* -> FLUSHED ->
//! COMMITTED`. A row is created already `Open` (there is no durable `Idle`
//! state to persist) and is deleted on commit, so `Committed` likewise
//! never appears as a stored state — only the transitions in between do.
//!
//! This crate owns the bookkeeping only: placement decisions come from a
//! caller-supplied [`hashfs_hdist::Distribution`], and the actual network
//! fan-out (presence probes, reserve RPCs, job creation) is left to the
//! engine facade that holds both this store and the transfer/job queues,
//! the same split `hashfs-metastore` uses for its block-store effects.

pub mod token;

use hashfs_db::{params, Handle, Migration};
use hashfs_hdist::{Distribution, NodeId, Which};
use hashfs_util::{
    block_size_for, eagain, einval, enoent, nblocks, HfsError, Hash, Result, HASH_BYTES,
};
use rand::RngCore;

pub use token::{derive_hmac_key, format_uuid, Token};

const MIGRATIONS: &[Migration] = &[Migration::new(
    1,
    "CREATE TABLE tmpfiles (
        tid BLOB PRIMARY KEY,
        volume_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        rand BLOB NOT NULL,
        replica INTEGER NOT NULL,
        size INTEGER,
        block_size INTEGER,
        content BLOB NOT NULL DEFAULT x'',
        processed_blocks INTEGER NOT NULL DEFAULT 0,
        flushed INTEGER NOT NULL DEFAULT 0,
        expiry INTEGER,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE tmp_blocks (
        tid BLOB NOT NULL REFERENCES tmpfiles(tid) ON DELETE CASCADE,
        hash BLOB NOT NULL,
        position INTEGER NOT NULL,
        first_replica BLOB NOT NULL,
        available INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (tid, hash)
    );
    CREATE TABLE tmp_meta (
        tid BLOB NOT NULL REFERENCES tmpfiles(tid) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value BLOB,
        PRIMARY KEY (tid, key)
    );",
)];

/// One block newly assigned a first-replica placement by a `gettoken` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueBlock {
    pub hash: Hash,
    pub position: u64,
    pub first_replica: NodeId,
}

/// What a caller needs to create the `REPLICATE_BLOCKS`/`FLUSH_FILE` job
/// pair once a token has flushed (§4.4 `putfile_commitjob`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub volume_id: u64,
    pub name: String,
    pub size: u64,
    pub content: Vec<u8>,
    pub replica: u32,
    pub meta: Vec<(String, Option<Vec<u8>>)>,
}

pub struct UploadStore {
    handle: Handle,
}

impl UploadStore {
    pub fn open(path: &std::path::Path) -> Result<UploadStore> {
        Ok(UploadStore {
            handle: Handle::open(path, MIGRATIONS)?,
        })
    }

    pub fn open_memory() -> Result<UploadStore> {
        Ok(UploadStore {
            handle: Handle::open_memory(MIGRATIONS)?,
        })
    }

    /// `putfile_begin`: opens a token row and returns its primary key, the
    /// 16 bytes a caller formats as the token's `uuid` field.
    pub fn putfile_begin(
        &self,
        volume_id: u64,
        name: &str,
        replica: u32,
        rng: &mut impl RngCore,
        now: i64,
    ) -> Result<[u8; 16]> {
        let mut tid = [0u8; 16];
        rng.fill_bytes(&mut tid);
        let mut rand = [0u8; 16];
        rng.fill_bytes(&mut rand);
        self.handle.execute_cached(
            "INSERT INTO tmpfiles (tid, volume_id, name, rand, replica, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![tid.to_vec(), volume_id as i64, name, rand.to_vec(), replica, now],
        )?;
        Ok(tid)
    }

    /// `putfile_putblock`: appends one block hash to the token's pending
    /// content list. Repeatable; rejected once flushed.
    pub fn putfile_putblock(&self, tid: [u8; 16], hash: Hash) -> Result<()> {
        self.handle.with_tx(|tx| {
            let (flushed, mut content): (bool, Vec<u8>) = tx
                .query_row(
                    "SELECT flushed, content FROM tmpfiles WHERE tid = ?1",
                    params![tid.to_vec()],
                    |r| Ok((r.get::<_, i64>(0)? != 0, r.get(1)?)),
                )
                .map_err(no_such_token)?;
            if flushed {
                return Err(einval("token already flushed"));
            }
            content.extend_from_slice(&hash);
            tx.execute(
                "UPDATE tmpfiles SET content = ?1 WHERE tid = ?2",
                params![content, tid.to_vec()],
            )
            .map_err(HfsError::from)?;
            Ok(())
        })
    }

    /// `putfile_putmeta`: upserts a metadata key, or (with `value = None`)
    /// tombstones it for deletion at commit time.
    pub fn putfile_putmeta(&self, tid: [u8; 16], key: &str, value: Option<&[u8]>) -> Result<()> {
        self.handle.with_tx(|tx| {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM tmpfiles WHERE tid = ?1", params![tid.to_vec()], |r| r.get(0))
                .ok();
            if exists.is_none() {
                return Err(enoent("no such upload token"));
            }
            tx.execute(
                "INSERT INTO tmp_meta (tid, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tid, key) DO UPDATE SET value = excluded.value",
                params![tid.to_vec(), key, value],
            )
            .map_err(HfsError::from)?;
            Ok(())
        })
    }

    /// First `putfile_gettoken` call: fixes the final size and block size,
    /// derives the grace-window expiry, and signs a token over every block
    /// appended so far.
    #[allow(clippy::too_many_arguments)]
    pub fn putfile_gettoken_final(
        &self,
        tid: [u8; 16],
        size: u64,
        distribution: &Distribution,
        hmac_key: &[u8],
        grace_secs: u64,
        min_speed_bytes_per_sec: u64,
        latency_term_secs: u64,
        now: i64,
    ) -> Result<(String, Vec<UniqueBlock>)> {
        self.handle.with_tx(|tx| {
            let row = read_for_gettoken(tx, tid)?;
            if row.flushed {
                return Err(einval("token already flushed"));
            }
            if row.size.is_some() {
                return Err(einval("final size already set; use extend"));
            }
            let bs = block_size_for(size);
            let n = nblocks(size, bs);
            let expiry = now as u64
                + grace_secs
                + (bs * n) / min_speed_bytes_per_sec.max(1)
                + latency_term_secs;
            tx.execute(
                "UPDATE tmpfiles SET size = ?1, block_size = ?2, expiry = ?3 WHERE tid = ?4",
                params![size as i64, bs as i64, expiry as i64, tid.to_vec()],
            )
            .map_err(HfsError::from)?;
            issue_token(tx, tid, &row, 0, distribution, hmac_key, expiry)
        })
    }

    /// Subsequent `putfile_gettoken` calls during the `EXTENDING` state:
    /// `extend_from` must equal the block count already processed by a
    /// prior `gettoken` call (the CAS guard); only the blocks appended
    /// since then are newly placed and signed over.
    pub fn putfile_gettoken_extend(
        &self,
        tid: [u8; 16],
        extend_from: u64,
        distribution: &Distribution,
        hmac_key: &[u8],
        now: i64,
    ) -> Result<(String, Vec<UniqueBlock>)> {
        self.handle.with_tx(|tx| {
            let row = read_for_gettoken(tx, tid)?;
            if row.flushed {
                return Err(einval("token already flushed"));
            }
            let expiry = row
                .expiry
                .ok_or_else(|| einval("no final size set; call gettoken once before extending"))?;
            if extend_from != row.processed_blocks {
                return Err(einval(format!(
                    "extend_from {extend_from} does not match processed block count {}",
                    row.processed_blocks
                )));
            }
            if now as u64 > expiry {
                return Err(einval("token already expired"));
            }
            issue_token(tx, tid, &row, extend_from, distribution, hmac_key, expiry)
        })
    }

    /// Marks one unique block's first replica as confirmed present, the
    /// "callback" half of `putfile_getblock`'s presence drain.
    pub fn putfile_mark_available(&self, tid: [u8; 16], hash: Hash) -> Result<()> {
        let n = self.handle.execute_cached(
            "UPDATE tmp_blocks SET available = 1 WHERE tid = ?1 AND hash = ?2",
            params![tid.to_vec(), hash.to_vec()],
        )?;
        if n == 0 {
            return Err(enoent("no such block on this upload token"));
        }
        Ok(())
    }

    /// Blocks still awaiting a presence confirmation; an empty result means
    /// the presence batch has drained and reserve requests may be issued.
    pub fn putfile_pending_blocks(&self, tid: [u8; 16]) -> Result<Vec<Hash>> {
        self.handle.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT hash FROM tmp_blocks WHERE tid = ?1 AND available = 0 ORDER BY position")
                .map_err(HfsError::from)?;
            let rows = stmt
                .query_map(params![tid.to_vec()], |r| r.get::<_, Vec<u8>>(0))
                .map_err(HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(to_hash(row.map_err(HfsError::from)?)?);
            }
            Ok(out)
        })
    }

    /// Once the presence batch has drained, groups replicas `2..=R` for
    /// every unique block by target node, for the caller to issue `reserve`
    /// hashop calls against. Returns `EAGAIN` if blocks are still pending.
    pub fn putfile_reserve_targets(
        &self,
        tid: [u8; 16],
        distribution: &Distribution,
    ) -> Result<Vec<(NodeId, Vec<Hash>)>> {
        let pending = self.putfile_pending_blocks(tid)?;
        if !pending.is_empty() {
            return Err(eagain("presence batch has not drained"));
        }
        let (replica, blocks): (u32, Vec<(Vec<u8>, u64)>) = self.handle.with_conn(|conn| {
            let replica: u32 = conn
                .query_row("SELECT replica FROM tmpfiles WHERE tid = ?1", params![tid.to_vec()], |r| {
                    r.get::<_, i64>(0).map(|v| v as u32)
                })
                .map_err(no_such_token)?;
            let mut stmt = conn
                .prepare("SELECT hash, position FROM tmp_blocks WHERE tid = ?1 ORDER BY position")
                .map_err(HfsError::from)?;
            let rows = stmt
                .query_map(params![tid.to_vec()], |r| Ok((r.get(0)?, r.get::<_, i64>(1)? as u64)))
                .map_err(HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(HfsError::from)?);
            }
            Ok((replica, out))
        })?;

        let mut by_node: std::collections::BTreeMap<NodeId, Vec<Hash>> = std::collections::BTreeMap::new();
        for (hash, _) in blocks {
            let hash = to_hash(hash)?;
            for r in 2..=replica as usize {
                if let Ok(nodes) = distribution.hashnodes(Which::Next, &hash, r) {
                    by_node.entry(nodes[0]).or_default().push(hash);
                }
            }
        }
        Ok(by_node.into_iter().collect())
    }

    /// Caller calls this once the reserve batch above has succeeded;
    /// transitions the token to `FLUSHED`.
    pub fn putfile_flush(&self, tid: [u8; 16], now: i64) -> Result<()> {
        self.handle.with_tx(|tx| {
            let flushed: bool = tx
                .query_row(
                    "SELECT flushed FROM tmpfiles WHERE tid = ?1",
                    params![tid.to_vec()],
                    |r| r.get::<_, i64>(0).map(|v| v != 0),
                )
                .map_err(no_such_token)?;
            if flushed {
                return Err(einval("token already flushed"));
            }
            let pending: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM tmp_blocks WHERE tid = ?1 AND available = 0",
                    params![tid.to_vec()],
                    |r| r.get(0),
                )
                .map_err(HfsError::from)?;
            if pending > 0 {
                return Err(eagain("blocks still awaiting presence confirmation"));
            }
            let _ = now;
            tx.execute(
                "UPDATE tmpfiles SET flushed = 1 WHERE tid = ?1",
                params![tid.to_vec()],
            )
            .map_err(HfsError::from)?;
            Ok(())
        })
    }

    /// `putfile_commitjob`: reads back everything the job queue needs to
    /// create the `REPLICATE_BLOCKS`/`FLUSH_FILE` pair, then deletes the
    /// token row (cascading its blocks and metadata) — the COMMITTED state
    /// has no durable row of its own.
    pub fn putfile_commitjob(&self, tid: [u8; 16]) -> Result<CommitRequest> {
        self.handle.with_tx(|tx| {
            let (volume_id, name, size, content, replica, flushed): (i64, String, Option<i64>, Vec<u8>, i64, i64) = tx
                .query_row(
                    "SELECT volume_id, name, size, content, replica, flushed FROM tmpfiles WHERE tid = ?1",
                    params![tid.to_vec()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
                )
                .map_err(no_such_token)?;
            if flushed == 0 {
                return Err(einval("token has not flushed"));
            }
            let size = size.ok_or_else(|| einval("token has no final size"))?;
            let mut meta_stmt = tx
                .prepare("SELECT key, value FROM tmp_meta WHERE tid = ?1")
                .map_err(HfsError::from)?;
            let meta_rows = meta_stmt
                .query_map(params![tid.to_vec()], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, Option<Vec<u8>>>(1)?))
                })
                .map_err(HfsError::from)?;
            let mut meta = Vec::new();
            for row in meta_rows {
                meta.push(row.map_err(HfsError::from)?);
            }
            drop(meta_stmt);
            tx.execute("DELETE FROM tmpfiles WHERE tid = ?1", params![tid.to_vec()])
                .map_err(HfsError::from)?;
            Ok(CommitRequest {
                volume_id: volume_id as u64,
                name,
                size: size as u64,
                content,
                replica: replica as u32,
                meta,
            })
        })
    }

    /// Tmpfiles past their expiry, oldest first, bounded by `limit` (GC's
    /// per-shard batch bound). Flushed-but-uncommitted tokens are deleted
    /// by GC this way; unflushed ones never reached a committed state to
    /// begin with, so deleting the row is enough — there is nothing else
    /// to cascade into the block store.
    pub fn expired_tokens(&self, now: i64, limit: usize) -> Result<Vec<[u8; 16]>> {
        self.handle.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT tid FROM tmpfiles WHERE expiry IS NOT NULL AND expiry < ?1 ORDER BY expiry LIMIT ?2")
                .map_err(HfsError::from)?;
            let rows = stmt
                .query_map(params![now, limit as i64], |r| r.get::<_, Vec<u8>>(0))
                .map_err(HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(to_array16(row.map_err(HfsError::from)?)?);
            }
            Ok(out)
        })
    }

    pub fn delete_token(&self, tid: [u8; 16]) -> Result<()> {
        self.handle
            .execute_cached("DELETE FROM tmpfiles WHERE tid = ?1", params![tid.to_vec()])?;
        Ok(())
    }

    /// Count of all open tokens, expired or not — the superset
    /// [`UploadStore::expired_tokens`] filters against, and the
    /// `upload_tokens_open` gauge's source.
    pub fn open_token_count(&self) -> Result<i64> {
        let count: i64 = self
            .handle
            .query_row_cached("SELECT COUNT(*) FROM tmpfiles", [], |r| r.get(0))?
            .unwrap_or(0);
        Ok(count)
    }
}

struct TokenRow {
    rand: [u8; 16],
    replica: u32,
    content: Vec<u8>,
    processed_blocks: u64,
    size: Option<u64>,
    flushed: bool,
    expiry: Option<u64>,
}

fn read_for_gettoken(tx: &rusqlite::Transaction, tid: [u8; 16]) -> Result<TokenRow> {
    tx.query_row(
        "SELECT rand, replica, content, processed_blocks, size, flushed, expiry FROM tmpfiles WHERE tid = ?1",
        params![tid.to_vec()],
        |r| {
            Ok((
                r.get::<_, Vec<u8>>(0)?,
                r.get::<_, i64>(1)? as u32,
                r.get::<_, Vec<u8>>(2)?,
                r.get::<_, i64>(3)? as u64,
                r.get::<_, Option<i64>>(4)?,
                r.get::<_, i64>(5)? != 0,
                r.get::<_, Option<i64>>(6)?,
            ))
        },
    )
    .map(|(rand, replica, content, processed_blocks, size, flushed, expiry)| TokenRow {
        rand: rand.try_into().unwrap_or([0u8; 16]),
        replica,
        content,
        processed_blocks,
        size: size.map(|s| s as u64),
        flushed,
        expiry: expiry.map(|e| e as u64),
    })
    .map_err(no_such_token)
}

/// Dedupes the blocks appended since `from_block`, assigns each a
/// first-replica placement, persists them, and signs a fresh token over
/// everything processed so far.
fn issue_token(
    tx: &rusqlite::Transaction,
    tid: [u8; 16],
    row: &TokenRow,
    from_block: u64,
    distribution: &Distribution,
    hmac_key: &[u8],
    expiry: u64,
) -> Result<(String, Vec<UniqueBlock>)> {
    let start = (from_block as usize) * HASH_BYTES;
    let new_blocks = &row.content[start.min(row.content.len())..];
    let mut unique = Vec::new();
    for (i, chunk) in new_blocks.chunks(HASH_BYTES).enumerate() {
        let hash: Hash = chunk.try_into().map_err(|_| einval("truncated block hash in content"))?;
        let position = from_block + i as u64;
        let first_replica = distribution.hashnodes(Which::Next, &hash, 1)?[0];
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO tmp_blocks (tid, hash, position, first_replica) VALUES (?1, ?2, ?3, ?4)",
                params![tid.to_vec(), hash.to_vec(), position as i64, first_replica.to_vec()],
            )
            .map_err(HfsError::from)?;
        if inserted == 1 {
            unique.push(UniqueBlock { hash, position, first_replica });
        }
    }
    unique.sort_by(|a, b| a.first_replica.cmp(&b.first_replica).then(a.position.cmp(&b.position)));

    let total_blocks = row.content.len() as u64 / HASH_BYTES as u64;
    tx.execute(
        "UPDATE tmpfiles SET processed_blocks = ?1 WHERE tid = ?2",
        params![total_blocks as i64, tid.to_vec()],
    )
    .map_err(HfsError::from)?;

    let token = Token {
        uuid: format_uuid(&tid),
        rand: row.rand,
        replica: row.replica,
        expiry,
    };
    Ok((token.encode(hmac_key), unique))
}

fn no_such_token(e: rusqlite::Error) -> HfsError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => enoent("no such upload token"),
        other => HfsError::from(other),
    }
}

fn to_hash(bytes: Vec<u8>) -> Result<Hash> {
    bytes
        .try_into()
        .map_err(|_| hashfs_util::fail_einternal("stored hash is not 20 bytes"))
}

fn to_array16(bytes: Vec<u8>) -> Result<[u8; 16]> {
    bytes
        .try_into()
        .map_err(|_| hashfs_util::fail_einternal("stored id is not 16 bytes"))
}

/// `tmp_id = SHA1(node_uuid ∥ token_text)`, the id a flush's `hashop`
/// reserve/inuse calls dedupe against.
pub fn tmp_id(node_uuid: [u8; 16], token_text: &str) -> Hash {
    hashfs_util::hash_parts(&[&node_uuid, token_text.as_bytes()])
}

/// `reserve_id = SHA1(cluster_uuid ∥ volume_id:le64 ∥ name ∥ 0)` (no
/// revision) — the id an in-flight reservation's `hashop` calls dedupe
/// against, distinct from the eventual `file_id` once a revision is known.
pub fn reserve_id(cluster_uuid: [u8; 16], volume_id: u64, name: &str) -> Hash {
    hashfs_util::hash_parts(&[&cluster_uuid, &volume_id.to_le_bytes(), name.as_bytes(), &[0u8]])
}
