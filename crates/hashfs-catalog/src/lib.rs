//! The global catalog: one database per node holding volumes, users, node
//! identity, and the current (and, mid-rebalance, previous) distribution
//! blob. Every other store is sharded; this one is not, because its rows
//! are small and globally consistent decisions (create a volume, admit a
//! new distribution) are rare enough to afford a single writer.

mod user;
mod volume;

use std::path::Path;

use hashfs_db::{params, Handle, Migration};
use hashfs_hdist::{wire, Distribution};
use hashfs_util::{einval, fail_einternal, Result};

pub use user::{Role, User};
pub use volume::Volume;

const MIGRATIONS: &[Migration] = &[Migration::new(
    1,
    "CREATE TABLE node_identity (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        cluster_uuid BLOB,
        node_uuid BLOB NOT NULL
    );
    CREATE TABLE users (
        uid INTEGER PRIMARY KEY AUTOINCREMENT,
        user_hash BLOB NOT NULL UNIQUE,
        name TEXT NOT NULL UNIQUE,
        key BLOB NOT NULL,
        role TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE volumes (
        vid INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        replica_count INTEGER NOT NULL,
        revs_kept INTEGER NOT NULL,
        cur_size INTEGER NOT NULL DEFAULT 0,
        max_size INTEGER NOT NULL,
        owner_uid INTEGER NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE volume_meta (
        vid INTEGER NOT NULL REFERENCES volumes(vid) ON DELETE CASCADE,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (vid, key)
    );
    CREATE TABLE distribution (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        blob BLOB NOT NULL
    );
    CREATE TABLE kv (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );",
)];

pub struct NodeIdentity {
    pub cluster_uuid: Option<[u8; 16]>,
    pub node_uuid: [u8; 16],
}

impl NodeIdentity {
    pub fn is_bare(&self) -> bool {
        self.cluster_uuid.is_none()
    }
}

pub struct Catalog {
    handle: Handle,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Catalog> {
        Ok(Catalog {
            handle: Handle::open(path, MIGRATIONS)?,
        })
    }

    pub fn open_memory() -> Result<Catalog> {
        Ok(Catalog {
            handle: Handle::open_memory(MIGRATIONS)?,
        })
    }

    // -- node identity -----------------------------------------------------

    /// Record a bare node: it has a node uuid but no cluster assignment yet.
    pub fn init_bare(&self, node_uuid: [u8; 16]) -> Result<()> {
        self.handle.execute_cached(
            "INSERT OR REPLACE INTO node_identity (id, cluster_uuid, node_uuid) VALUES (0, NULL, ?1)",
            params![node_uuid.to_vec()],
        )?;
        Ok(())
    }

    /// Join a cluster: a bare node becomes active under `cluster_uuid`.
    pub fn activate(&self, cluster_uuid: [u8; 16]) -> Result<()> {
        self.handle.with_tx(|tx| {
            let node_uuid: Vec<u8> = tx
                .query_row("SELECT node_uuid FROM node_identity WHERE id = 0", [], |r| r.get(0))
                .map_err(|_| fail_einternal("node identity not initialized"))?;
            tx.execute(
                "UPDATE node_identity SET cluster_uuid = ?1 WHERE id = 0",
                params![cluster_uuid.to_vec()],
            )
            .map_err(hashfs_util::HfsError::from)?;
            let _ = node_uuid;
            Ok(())
        })
    }

    pub fn identity(&self) -> Result<NodeIdentity> {
        self.handle
            .query_row_cached(
                "SELECT cluster_uuid, node_uuid FROM node_identity WHERE id = 0",
                [],
                |r| {
                    let cluster: Option<Vec<u8>> = r.get(0)?;
                    let node: Vec<u8> = r.get(1)?;
                    Ok((cluster, node))
                },
            )?
            .map(|(cluster, node)| {
                Ok(NodeIdentity {
                    cluster_uuid: cluster.map(|v| to_array16(&v)).transpose()?,
                    node_uuid: to_array16(&node)?,
                })
            })
            .unwrap_or_else(|| Err(fail_einternal("node identity not initialized")))
    }

    // -- small scalar kv -----------------------------------------------------

    pub fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.handle
            .query_row_cached("SELECT value FROM kv WHERE key = ?1", params![key], |r| r.get(0))
    }

    pub fn kv_set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.handle.execute_cached(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<()> {
        self.handle
            .execute_cached("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    // -- distribution --------------------------------------------------------

    pub fn get_distribution(&self) -> Result<Option<Distribution>> {
        let blob: Option<Vec<u8>> = self
            .handle
            .query_row_cached("SELECT blob FROM distribution WHERE id = 0", [], |r| r.get(0))?;
        blob.map(|b| wire::decode(&b)).transpose()
    }

    /// Replace the distribution blob atomically. Readers always see either
    /// the old or the new blob in full, never a partial write, because the
    /// row update happens inside one transaction.
    pub fn set_distribution(&self, d: &Distribution) -> Result<()> {
        let bytes = wire::encode(d);
        self.handle.execute_cached(
            "INSERT INTO distribution (id, blob) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET blob = excluded.blob",
            params![bytes],
        )?;
        Ok(())
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

fn to_array16(v: &[u8]) -> Result<[u8; 16]> {
    v.try_into()
        .map_err(|_| einval(format!("expected 16-byte uuid, got {} bytes", v.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_node_then_activate() {
        let cat = Catalog::open_memory().unwrap();
        cat.init_bare([1u8; 16]).unwrap();
        assert!(cat.identity().unwrap().is_bare());
        cat.activate([2u8; 16]).unwrap();
        let id = cat.identity().unwrap();
        assert!(!id.is_bare());
        assert_eq!(id.cluster_uuid, Some([2u8; 16]));
        assert_eq!(id.node_uuid, [1u8; 16]);
    }

    #[test]
    fn kv_roundtrip_and_overwrite() {
        let cat = Catalog::open_memory().unwrap();
        cat.kv_set("lockedby", b"admin").unwrap();
        assert_eq!(cat.kv_get("lockedby").unwrap(), Some(b"admin".to_vec()));
        cat.kv_set("lockedby", b"other").unwrap();
        assert_eq!(cat.kv_get("lockedby").unwrap(), Some(b"other".to_vec()));
        cat.kv_delete("lockedby").unwrap();
        assert_eq!(cat.kv_get("lockedby").unwrap(), None);
    }

    #[test]
    fn distribution_roundtrip() {
        use hashfs_hdist::{Build, NodeEntry};
        let cat = Catalog::open_memory().unwrap();
        assert!(cat.get_distribution().unwrap().is_none());
        let build = Build {
            seed: 0x1337,
            nodes: vec![NodeEntry {
                node: [9u8; 16],
                public_addr: "a".into(),
                internal_addr: "b".into(),
                capacity: 1,
            }],
        };
        let d = Distribution::stable(1, build);
        cat.set_distribution(&d).unwrap();
        let back = cat.get_distribution().unwrap().unwrap();
        assert_eq!(back.version(), 1);
    }
}
