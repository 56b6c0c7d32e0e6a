//! Users: the principals that own volumes and sign upload tokens (§3 "User").

use std::fmt;

use hashfs_db::params;
use hashfs_util::{eexist, einval, enoent, Hash, Result};

use crate::Catalog;

/// A user's privilege level. `Cluster` is the implicit superuser created at
/// bootstrap; `Admin` may create and enable volumes; `User` may only read
/// and write within volumes it has been granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Cluster,
    Admin,
    User,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Role::Cluster => "cluster",
            Role::Admin => "admin",
            Role::User => "user",
        })
    }
}

impl std::str::FromStr for Role {
    type Err = hashfs_util::HfsError;

    fn from_str(s: &str) -> Result<Role> {
        match s {
            "cluster" => Ok(Role::Cluster),
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(einval(format!("unknown role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub uid: u64,
    pub user_hash: Hash,
    pub name: String,
    pub key: [u8; 20],
    pub role: Role,
    pub enabled: bool,
}

impl Catalog {
    pub fn create_user(
        &self,
        name: &str,
        user_hash: Hash,
        key: [u8; 20],
        role: Role,
    ) -> Result<u64> {
        if name.is_empty() {
            return Err(einval("user name must not be empty"));
        }
        self.handle().with_tx(|tx| {
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM users WHERE name = ?1", params![name], |r| r.get(0))
                .optional_or_internal()?;
            if exists.is_some() {
                return Err(eexist(format!("user {name:?} already exists")));
            }
            tx.execute(
                "INSERT INTO users (user_hash, name, key, role, enabled) VALUES (?1, ?2, ?3, ?4, 1)",
                params![user_hash.to_vec(), name, key.to_vec(), role.to_string()],
            )
            .map_err(hashfs_util::HfsError::from)?;
            Ok(tx.last_insert_rowid() as u64)
        })
    }

    pub fn find_user_by_hash(&self, user_hash: &Hash) -> Result<Option<User>> {
        self.handle().query_row_cached(
            "SELECT uid, user_hash, name, key, role, enabled FROM users WHERE user_hash = ?1",
            params![user_hash.to_vec()],
            row_to_user,
        )
    }

    pub fn find_user_by_name(&self, name: &str) -> Result<Option<User>> {
        self.handle().query_row_cached(
            "SELECT uid, user_hash, name, key, role, enabled FROM users WHERE name = ?1",
            params![name],
            row_to_user,
        )
    }

    pub fn get_user(&self, uid: u64) -> Result<User> {
        self.handle()
            .query_row_cached(
                "SELECT uid, user_hash, name, key, role, enabled FROM users WHERE uid = ?1",
                params![uid as i64],
                row_to_user,
            )?
            .ok_or_else(|| enoent(format!("no such user {uid}")))
    }

    pub fn set_user_enabled(&self, uid: u64, enabled: bool) -> Result<()> {
        let n = self.handle().execute_cached(
            "UPDATE users SET enabled = ?1 WHERE uid = ?2",
            params![enabled, uid as i64],
        )?;
        if n == 0 {
            return Err(enoent(format!("no such user {uid}")));
        }
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        self.handle().with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT uid, user_hash, name, key, role, enabled FROM users ORDER BY uid")
                .map_err(hashfs_util::HfsError::from)?;
            let rows = stmt
                .query_map([], row_to_user)
                .map_err(hashfs_util::HfsError::from)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(hashfs_util::HfsError::from)?);
            }
            Ok(out)
        })
    }
}

fn row_to_user(r: &hashfs_db::Row) -> rusqlite::Result<User> {
    let uid: i64 = r.get(0)?;
    let user_hash: Vec<u8> = r.get(1)?;
    let name: String = r.get(2)?;
    let key: Vec<u8> = r.get(3)?;
    let role: String = r.get(4)?;
    let enabled: bool = r.get(5)?;
    Ok(User {
        uid: uid as u64,
        user_hash: user_hash.try_into().unwrap_or([0u8; 20]),
        name,
        key: key.try_into().unwrap_or([0u8; 20]),
        role: role.parse().unwrap_or(Role::User),
        enabled,
    })
}

trait OptionalOrInternal<T> {
    fn optional_or_internal(self) -> Result<Option<T>>;
}

impl<T> OptionalOrInternal<T> for rusqlite::Result<T> {
    fn optional_or_internal(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(hashfs_util::HfsError::from(e)),
        }
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

    #[test]
    fn create_find_and_disable_user() {
        let cat = Catalog::open_memory().unwrap();
        let uid = cat
            .create_user("alice", hash(1), [7u8; 20], Role::Admin)
            .unwrap();
        let found = cat.find_user_by_name("alice").unwrap().unwrap();
        assert_eq!(found.uid, uid);
        assert_eq!(found.role, Role::Admin);
        assert!(found.enabled);

        cat.set_user_enabled(uid, false).unwrap();
        assert!(!cat.get_user(uid).unwrap().enabled);
    }

    #[test]
    fn duplicate_name_is_eexist() {
        let cat = Catalog::open_memory().unwrap();
        cat.create_user("alice", hash(1), [0u8; 20], Role::User).unwrap();
        let err = cat
            .create_user("alice", hash(2), [0u8; 20], Role::User)
            .unwrap_err();
        assert_eq!(err.code, hashfs_util::Code::EExist);
    }

    #[test]
    fn find_by_hash_matches_created_user() {
        let cat = Catalog::open_memory().unwrap();
        cat.create_user("bob", hash(9), [1u8; 20], Role::User).unwrap();
        let found = cat.find_user_by_hash(&hash(9)).unwrap().unwrap();
        assert_eq!(found.name, "bob");
    }
}
