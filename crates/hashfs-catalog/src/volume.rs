//! Volumes: named, replicated namespaces that own files (§3 "Volume").

use hashfs_db::params;
use hashfs_util::{
    eexist, einval, enoent, enospc, Result, META_ITEMS_MAX, META_KEY_MAX, META_KEY_MIN,
    META_VALUE_MAX, REVISIONS_MAX, REVISIONS_MIN, VOLUME_NAME_MAX, VOLUME_NAME_MIN,
};

use crate::Catalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub vid: u64,
    pub name: String,
    pub replica_count: u32,
    pub revs_kept: u32,
    pub cur_size: u64,
    pub max_size: u64,
    pub owner_uid: u64,
    pub enabled: bool,
}

fn validate_name(name: &str) -> Result<()> {
    if name.starts_with('.') {
        return Err(einval("volume name must not start with '.'"));
    }
    let len = name.chars().count();
    if !(VOLUME_NAME_MIN..=VOLUME_NAME_MAX).contains(&len) {
        return Err(einval(format!(
            "volume name length {len} out of range {VOLUME_NAME_MIN}..={VOLUME_NAME_MAX}"
        )));
    }
    Ok(())
}

impl Catalog {
    /// Admit a new volume. `nodes_size` is the total usable capacity across
    /// the current distribution's nodes, supplied by the caller so this
    /// crate never depends on `hashfs-hdist`'s node-scoring internals — only
    /// on the one number the admission rule needs (Open Question #1: the
    /// working rule is `max_size * replica_count <= nodes_size`, a coarse
    /// bound that does not yet account for existing volumes' usage).
    #[allow(clippy::too_many_arguments)]
    pub fn create_volume(
        &self,
        name: &str,
        replica_count: u32,
        revs_kept: u32,
        max_size: u64,
        owner_uid: u64,
        nodes_size: u64,
    ) -> Result<u64> {
        validate_name(name)?;
        if !(REVISIONS_MIN..=REVISIONS_MAX).contains(&revs_kept) {
            return Err(einval(format!(
                "revisions {revs_kept} out of range {REVISIONS_MIN}..={REVISIONS_MAX}"
            )));
        }
        if replica_count == 0 {
            return Err(einval("replica_count must be at least 1"));
        }
        if max_size.saturating_mul(replica_count as u64) > nodes_size {
            return Err(enospc(format!(
                "volume of size {max_size} x{replica_count} replicas exceeds cluster capacity {nodes_size}"
            )));
        }

        self.handle().with_tx(|tx| {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM volumes WHERE name = ?1", params![name], |r| r.get(0))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(hashfs_util::HfsError::from(other)),
                })?;
            if exists.is_some() {
                return Err(hashfs_util::fail_volume_eexist(format!(
                    "volume {name:?} already exists"
                )));
            }
            tx.execute(
                "INSERT INTO volumes (name, replica_count, revs_kept, cur_size, max_size, owner_uid, enabled)
                 VALUES (?1, ?2, ?3, 0, ?4, ?5, 1)",
                params![name, replica_count, revs_kept, max_size, owner_uid as i64],
            )
            .map_err(hashfs_util::HfsError::from)?;
            Ok(tx.last_insert_rowid() as u64)
        })
    }

    pub fn get_volume(&self, name: &str) -> Result<Volume> {
        self.handle()
            .query_row_cached(
                "SELECT vid, name, replica_count, revs_kept, cur_size, max_size, owner_uid, enabled
                 FROM volumes WHERE name = ?1",
                params![name],
                row_to_volume,
            )?
            .ok_or_else(|| enoent(format!("no such volume {name:?}")))
    }

    pub fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.handle().with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT vid, name, replica_count, revs_kept, cur_size, max_size, owner_uid, enabled
                     FROM volumes ORDER BY vid",
                )
                .map_err(hashfs_util::HfsError::from)?;
            let rows = stmt
                .query_map([], row_to_volume)
                .map_err(hashfs_util::HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(hashfs_util::HfsError::from)?);
            }
            Ok(out)
        })
    }

    /// Apply a signed size delta to a volume's running usage, clamped at
    /// zero. Callers pass a negative delta when a revision is evicted or a
    /// file deleted.
    pub fn adjust_cur_size(&self, vid: u64, delta: i64) -> Result<()> {
        self.handle().with_tx(|tx| {
            let cur: i64 = tx
                .query_row("SELECT cur_size FROM volumes WHERE vid = ?1", params![vid as i64], |r| {
                    r.get(0)
                })
                .map_err(|_| enoent(format!("no such volume id {vid}")))?;
            let next = (cur + delta).max(0);
            tx.execute(
                "UPDATE volumes SET cur_size = ?1 WHERE vid = ?2",
                params![next, vid as i64],
            )
            .map_err(hashfs_util::HfsError::from)?;
            Ok(())
        })
    }

    pub fn set_volume_enabled(&self, vid: u64, enabled: bool) -> Result<()> {
        let n = self.handle().execute_cached(
            "UPDATE volumes SET enabled = ?1 WHERE vid = ?2",
            params![enabled, vid as i64],
        )?;
        if n == 0 {
            return Err(enoent(format!("no such volume id {vid}")));
        }
        Ok(())
    }

    // -- volume metadata -----------------------------------------------------

    pub fn set_volume_meta(&self, vid: u64, key: &str, value: &[u8]) -> Result<()> {
        let klen = key.chars().count();
        if !(META_KEY_MIN..=META_KEY_MAX).contains(&klen) {
            return Err(einval(format!("metadata key length {klen} out of range")));
        }
        if value.len() > META_VALUE_MAX {
            return Err(einval(format!(
                "metadata value {} bytes exceeds {META_VALUE_MAX}",
                value.len()
            )));
        }
        self.handle().with_tx(|tx| {
            let count: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM volume_meta WHERE vid = ?1 AND key <> ?2",
                    params![vid as i64, key],
                    |r| r.get(0),
                )
                .map_err(hashfs_util::HfsError::from)?;
            if count as usize >= META_ITEMS_MAX {
                return Err(eexist(format!("volume already has {META_ITEMS_MAX} metadata items")));
            }
            tx.execute(
                "INSERT INTO volume_meta (vid, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(vid, key) DO UPDATE SET value = excluded.value",
                params![vid as i64, key, value],
            )
            .map_err(hashfs_util::HfsError::from)?;
            Ok(())
        })
    }

    pub fn get_volume_meta(&self, vid: u64, key: &str) -> Result<Option<Vec<u8>>> {
        self.handle().query_row_cached(
            "SELECT value FROM volume_meta WHERE vid = ?1 AND key = ?2",
            params![vid as i64, key],
            |r| r.get(0),
        )
    }

    pub fn delete_volume_meta(&self, vid: u64, key: &str) -> Result<()> {
        self.handle().execute_cached(
            "DELETE FROM volume_meta WHERE vid = ?1 AND key = ?2",
            params![vid as i64, key],
        )?;
        Ok(())
    }

    pub fn list_volume_meta(&self, vid: u64) -> Result<Vec<(String, Vec<u8>)>> {
        self.handle().with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value FROM volume_meta WHERE vid = ?1 ORDER BY key")
                .map_err(hashfs_util::HfsError::from)?;
            let rows = stmt
                .query_map(params![vid as i64], |r| Ok((r.get(0)?, r.get(1)?)))
                .map_err(hashfs_util::HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(hashfs_util::HfsError::from)?);
            }
            Ok(out)
        })
    }
}

fn row_to_volume(r: &hashfs_db::Row) -> rusqlite::Result<Volume> {
    let vid: i64 = r.get(0)?;
    let name: String = r.get(1)?;
    let replica_count: i64 = r.get(2)?;
    let revs_kept: i64 = r.get(3)?;
    let cur_size: i64 = r.get(4)?;
    let max_size: i64 = r.get(5)?;
    let owner_uid: i64 = r.get(6)?;
    let enabled: bool = r.get(7)?;
    Ok(Volume {
        vid: vid as u64,
        name,
        replica_count: replica_count as u32,
        revs_kept: revs_kept as u32,
        cur_size: cur_size as u64,
        max_size: max_size as u64,
        owner_uid: owner_uid as u64,
        enabled,
    })
}
