//! Sharded metadata store (§4.3): 16 databases mapping `(volume, name,
//! revision) -> (size, content)` where `content` is the concatenation of
//! 20-byte block hashes in file order, plus per-file metadata and a
//! relocation queue populated during rebalance.

pub mod glob;

use hashfs_db::{params, Handle, Migration};
use hashfs_hdist::{murmur64a, HDIST_SEED};
use hashfs_util::{eexist, einval, enoent, hash_parts, Hash, Result, HASH_BYTES};

pub const SHARD_COUNT: usize = 16;

/// `murmur(sha1(name)) mod 16`, selecting which of the 16 metadata shards
/// owns a given file name.
pub fn shard_for_name(name: &str) -> usize {
    let digest = hash_parts(&[name.as_bytes()]);
    (murmur64a(&digest, HDIST_SEED) % SHARD_COUNT as u64) as usize
}

const MIGRATIONS: &[Migration] = &[Migration::new(
    1,
    "CREATE TABLE files (
        fid BLOB PRIMARY KEY,
        volume_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        revision TEXT NOT NULL,
        size INTEGER NOT NULL,
        content BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (volume_id, name, revision)
    );
    CREATE INDEX files_by_volume_name ON files (volume_id, name, revision);
    CREATE TABLE file_meta (
        fid BLOB NOT NULL REFERENCES files(fid) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (fid, key)
    );
    CREATE TABLE relocations (
        volume_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        target_node BLOB NOT NULL,
        PRIMARY KEY (volume_id, name, target_node)
    );",
)];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub fid: Hash,
    pub volume_id: u64,
    pub name: String,
    pub revision: String,
    pub size: u64,
    pub content: Vec<u8>,
}

impl FileRecord {
    /// The block hashes this revision references, in file order.
    pub fn block_hashes(&self) -> Vec<Hash> {
        self.content
            .chunks(HASH_BYTES)
            .map(|c| c.try_into().expect("content length is a multiple of HASH_BYTES"))
            .collect()
    }
}

pub struct ListEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

pub struct MetaShard {
    handle: Handle,
}

impl MetaShard {
    pub fn open(path: &std::path::Path) -> Result<MetaShard> {
        Ok(MetaShard {
            handle: Handle::open(path, MIGRATIONS)?,
        })
    }

    pub fn open_memory() -> Result<MetaShard> {
        Ok(MetaShard {
            handle: Handle::open_memory(MIGRATIONS)?,
        })
    }

    /// Write path for a file commit (§4.3). `revs_kept` bounds how many
    /// revisions of `(volume_id, name)` may coexist; when the bound is
    /// already reached the oldest revision is evicted provided the new one
    /// sorts later, otherwise the write is rejected outright. Returns the
    /// new file id and, when a revision was evicted, that revision's block
    /// content so the caller can issue the matching `delete` decrements
    /// against the block store (this crate has no block-store dependency
    /// of its own).
    #[allow(clippy::too_many_arguments)]
    pub fn create_file(
        &self,
        cluster_uuid: [u8; 16],
        volume_id: u64,
        name: &str,
        revision: &str,
        size: u64,
        content: &[u8],
        revs_kept: u32,
        now: i64,
    ) -> Result<(Hash, Option<Vec<u8>>)> {
        if content.len() % HASH_BYTES != 0 {
            return Err(einval("content length must be a multiple of the hash size"));
        }
        self.handle.with_tx(|tx| {
            let revisions: Vec<String> = {
                let mut stmt = tx
                    .prepare("SELECT revision FROM files WHERE volume_id = ?1 AND name = ?2 ORDER BY revision")
                    .map_err(hashfs_util::HfsError::from)?;
                let rows = stmt
                    .query_map(params![volume_id as i64, name], |r| r.get(0))
                    .map_err(hashfs_util::HfsError::from)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(hashfs_util::HfsError::from)?);
                }
                out
            };

            let mut evicted_content = None;
            if revisions.len() as u32 >= revs_kept.max(1) {
                let oldest = revisions.first().cloned().unwrap_or_default();
                if revision <= oldest.as_str() {
                    return Err(einval("Newer copies of this file already exist"));
                }
                let old_content: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT content FROM files WHERE volume_id = ?1 AND name = ?2 AND revision = ?3",
                        params![volume_id as i64, name, oldest],
                        |r| r.get(0),
                    )
                    .map_err(hashfs_util::HfsError::from)?;
                tx.execute(
                    "DELETE FROM files WHERE volume_id = ?1 AND name = ?2 AND revision = ?3",
                    params![volume_id as i64, name, oldest],
                )
                .map_err(hashfs_util::HfsError::from)?;
                evicted_content = old_content;
            }

            let fid = hash_parts(&[
                &cluster_uuid,
                &volume_id.to_le_bytes(),
                name.as_bytes(),
                &[0u8],
                revision.as_bytes(),
            ]);
            let inserted = tx
                .execute(
                    "INSERT INTO files (fid, volume_id, name, revision, size, content, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![fid.to_vec(), volume_id as i64, name, revision, size as i64, content, now],
                )
                .map_err(hashfs_util::HfsError::from);
            match inserted {
                Ok(_) => Ok((fid, evicted_content)),
                Err(e) if is_unique_violation(&e) => Err(eexist(format!(
                    "revision {revision:?} of {name:?} already exists"
                ))),
                Err(e) => Err(e),
            }
        })
    }

    /// Read path (§4.3). Without an explicit revision, the lexicographically
    /// greatest revision wins; ties are impossible since `(volume_id, name,
    /// revision)` is unique.
    pub fn getfile(&self, volume_id: u64, name: &str, revision: Option<&str>) -> Result<FileRecord> {
        let row: Option<(Vec<u8>, String, i64, Vec<u8>)> = match revision {
            Some(rev) => self.handle.query_row_cached(
                "SELECT fid, revision, size, content FROM files
                 WHERE volume_id = ?1 AND name = ?2 AND revision = ?3",
                params![volume_id as i64, name, rev],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?,
            None => self.handle.query_row_cached(
                "SELECT fid, revision, size, content FROM files
                 WHERE volume_id = ?1 AND name = ?2 ORDER BY revision DESC LIMIT 1",
                params![volume_id as i64, name],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?,
        };
        let (fid, revision, size, content) =
            row.ok_or_else(|| enoent(format!("no such file {name:?} in volume {volume_id}")))?;
        Ok(FileRecord {
            fid: to_hash(fid)?,
            volume_id,
            name: name.to_string(),
            revision,
            size: size as u64,
            content,
        })
    }

    pub fn delete_file(&self, volume_id: u64, name: &str, revision: &str) -> Result<Vec<u8>> {
        self.handle.with_tx(|tx| {
            let content: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT content FROM files WHERE volume_id = ?1 AND name = ?2 AND revision = ?3",
                    params![volume_id as i64, name, revision],
                    |r| r.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(hashfs_util::HfsError::from(other)),
                })?;
            let content = content.ok_or_else(|| enoent("no such revision"))?;
            tx.execute(
                "DELETE FROM files WHERE volume_id = ?1 AND name = ?2 AND revision = ?3",
                params![volume_id as i64, name, revision],
            )
            .map_err(hashfs_util::HfsError::from)?;
            Ok(content)
        })
    }

    pub fn set_file_meta(&self, fid: &Hash, key: &str, value: &[u8]) -> Result<()> {
        self.handle.execute_cached(
            "INSERT INTO file_meta (fid, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(fid, key) DO UPDATE SET value = excluded.value",
            params![fid.to_vec(), key, value],
        )?;
        Ok(())
    }

    pub fn get_file_meta(&self, fid: &Hash, key: &str) -> Result<Option<Vec<u8>>> {
        self.handle.query_row_cached(
            "SELECT value FROM file_meta WHERE fid = ?1 AND key = ?2",
            params![fid.to_vec(), key],
            |r| r.get(0),
        )
    }

    /// Listing against this shard's slice of one volume's namespace.
    /// Non-recursive listings collapse any entry past the pattern's slash
    /// count into a synthetic, zero-size directory entry.
    pub fn list(&self, volume_id: u64, pattern: &str, recursive: bool) -> Result<Vec<ListEntry>> {
        let prefix = glob::fixed_prefix(pattern);
        let depth = pattern.matches('/').count();
        let names: Vec<(String, i64)> = self.handle.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT name, MAX(size) FROM files
                     WHERE volume_id = ?1 AND name >= ?2 AND name < ?2 || char(65535)
                     GROUP BY name ORDER BY name",
                )
                .map_err(hashfs_util::HfsError::from)?;
            let rows = stmt
                .query_map(params![volume_id as i64, prefix], |r| Ok((r.get(0)?, r.get(1)?)))
                .map_err(hashfs_util::HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(hashfs_util::HfsError::from)?);
            }
            Ok(out)
        })?;

        let mut seen_dirs = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (name, size) in names {
            let parts: Vec<&str> = name.splitn(depth + 2, '/').collect();
            if !recursive && parts.len() > depth + 1 {
                let dir_name = parts[..depth + 1].join("/") + "/";
                if glob::matches(pattern, &dir_name) || glob::fixed_prefix(pattern) == glob::fixed_prefix(&dir_name) {
                    if seen_dirs.insert(dir_name.clone()) {
                        out.push(ListEntry {
                            name: dir_name,
                            size: 0,
                            is_dir: true,
                        });
                    }
                    continue;
                }
            }
            if glob::matches(pattern, &name) {
                out.push(ListEntry {
                    name,
                    size: size as u64,
                    is_dir: false,
                });
            }
        }
        Ok(out)
    }

    // -- relocation queue (§4.7) ----------------------------------------

    pub fn enqueue_relocation(&self, volume_id: u64, name: &str, target_node: [u8; 16]) -> Result<()> {
        self.handle.execute_cached(
            "INSERT OR IGNORE INTO relocations (volume_id, name, target_node) VALUES (?1, ?2, ?3)",
            params![volume_id as i64, name, target_node.to_vec()],
        )?;
        Ok(())
    }

    pub fn pending_relocations(&self, limit: usize) -> Result<Vec<(u64, String, [u8; 16])>> {
        self.handle.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT volume_id, name, target_node FROM relocations LIMIT ?1")
                .map_err(hashfs_util::HfsError::from)?;
            let rows = stmt
                .query_map(params![limit as i64], |r| {
                    let target: Vec<u8> = r.get(2)?;
                    Ok((r.get::<_, i64>(0)? as u64, r.get::<_, String>(1)?, target))
                })
                .map_err(hashfs_util::HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                let (vid, name, target) = row.map_err(hashfs_util::HfsError::from)?;
                let target: [u8; 16] = target
                    .try_into()
                    .map_err(|_| hashfs_util::fail_einternal("corrupt relocation target node id"))?;
                out.push((vid, name, target));
            }
            Ok(out)
        })
    }

    pub fn complete_relocation(&self, volume_id: u64, name: &str, target_node: [u8; 16]) -> Result<()> {
        self.handle.execute_cached(
            "DELETE FROM relocations WHERE volume_id = ?1 AND name = ?2 AND target_node = ?3",
            params![volume_id as i64, name, target_node.to_vec()],
        )?;
        Ok(())
    }
}

fn is_unique_violation(e: &hashfs_util::HfsError) -> bool {
    e.reason.contains("UNIQUE constraint failed")
}

fn to_hash(v: Vec<u8>) -> Result<Hash> {
    v.try_into()
        .map_err(|_| hashfs_util::fail_einternal("corrupt file id column"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(hashes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in hashes {
            out.extend_from_slice(&[b; HASH_BYTES]);
        }
        out
    }

    #[test]
    fn create_and_read_file() {
        let shard = MetaShard::open_memory().unwrap();
        let content = blob(&[1, 2]);
        let (fid, evicted) = shard
            .create_file([0u8; 16], 1, "hello.txt", "2024-01-01 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", 10000, &content, 2, 1000)
            .unwrap();
        assert!(evicted.is_none());
        let file = shard.getfile(1, "hello.txt", None).unwrap();
        assert_eq!(file.fid, fid);
        assert_eq!(file.content, content);
        assert_eq!(file.block_hashes().len(), 2);
    }

    #[test]
    fn duplicate_revision_is_eexist() {
        let shard = MetaShard::open_memory().unwrap();
        let content = blob(&[1]);
        let rev = "2024-01-01 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        shard.create_file([0u8; 16], 1, "a", rev, 8192, &content, 4, 0).unwrap();
        let err = shard.create_file([0u8; 16], 1, "a", rev, 8192, &content, 4, 0).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::EExist);
    }

    #[test]
    fn revision_eviction_keeps_only_newest_revs_kept() {
        let shard = MetaShard::open_memory().unwrap();
        let r1 = "2024-01-01 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let r2 = "2024-01-02 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let r3 = "2024-01-03 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        shard.create_file([0u8; 16], 1, "f", r1, 8192, &blob(&[1]), 2, 0).unwrap();
        shard.create_file([0u8; 16], 1, "f", r2, 8192, &blob(&[2]), 2, 0).unwrap();
        let (_, evicted) = shard.create_file([0u8; 16], 1, "f", r3, 8192, &blob(&[3]), 2, 0).unwrap();
        assert_eq!(evicted, Some(blob(&[1])));
        assert!(shard.getfile(1, "f", Some(r1)).is_err());
        assert_eq!(shard.getfile(1, "f", None).unwrap().revision, r3);
    }

    #[test]
    fn older_revision_after_eviction_is_rejected() {
        let shard = MetaShard::open_memory().unwrap();
        let r1 = "2024-01-01 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let r2 = "2024-01-02 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let r3 = "2024-01-03 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let r0 = "2023-12-31 00:00:00.000:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        shard.create_file([0u8; 16], 1, "f", r1, 8192, &blob(&[1]), 2, 0).unwrap();
        shard.create_file([0u8; 16], 1, "f", r2, 8192, &blob(&[2]), 2, 0).unwrap();
        shard.create_file([0u8; 16], 1, "f", r3, 8192, &blob(&[3]), 2, 0).unwrap();
        let err = shard.create_file([0u8; 16], 1, "f", r0, 8192, &blob(&[9]), 2, 0).unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::EInval);
        assert!(err.reason.contains("Newer copies"));
    }

    #[test]
    fn relocation_queue_roundtrip() {
        let shard = MetaShard::open_memory().unwrap();
        shard.enqueue_relocation(1, "f", [9u8; 16]).unwrap();
        let pending = shard.pending_relocations(10).unwrap();
        assert_eq!(pending.len(), 1);
        shard.complete_relocation(1, "f", [9u8; 16]).unwrap();
        assert!(shard.pending_relocations(10).unwrap().is_empty());
    }

    #[test]
    fn shard_selection_is_deterministic() {
        let a = shard_for_name("same-file");
        let b = shard_for_name("same-file");
        assert_eq!(a, b);
        assert!(a < SHARD_COUNT);
    }
}
