//! Row-level operations for the five tables (§4.2). Every public method
//! here runs its writes in a single transaction; callers above this layer
//! never see a partially-applied mutation.

mod schema;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    humantime_iso8601(secs)
}

/// Minimal ISO-8601 UTC formatter (`YYYY-MM-DDTHH:MM:SSZ`) — no timezone
/// database lookups, just the fixed UTC offset the store always writes.
fn humantime_iso8601(unix_secs: u64) -> String {
    const DAYS_IN_400Y: i64 = 146097;
    let days = (unix_secs / 86400) as i64;
    let rem = (unix_secs % 86400) as i64;
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    // civil_from_days, Howard Hinnant's algorithm.
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - DAYS_IN_400Y + 1 } / DAYS_IN_400Y;
    let doe = (z - era * DAYS_IN_400Y) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m_num = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m_num <= 2 { y + 1 } else { y };

    format!("{y:04}-{m_num:02}-{d:02}T{h:02}:{m:02}:{s:02}Z")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub auth_salt: [u8; 16],
    pub encryption_salt: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VaultEntryRow {
    pub id: i64,
    pub entry_uuid: String,
    pub label: String,
    pub data_blob: Vec<u8>,
    pub nonce: Vec<u8>,
    pub profile_id: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
    pub sync_version: i64,
}

impl VaultEntryRow {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairedDevice {
    pub device_id: String,
    pub device_name: String,
    pub public_key: Vec<u8>,
    pub shared_secret: Option<Vec<u8>>,
    pub paired_at: String,
    pub last_sync_at: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    Push,
    Pull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub device_id: String,
    pub direction: SyncDirection,
    pub entries_sent: i64,
    pub entries_received: i64,
    pub status: SyncStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
}

/// Owns the single SQLite connection. A single writer at a time is
/// enforced by serializing all access behind `Mutex<Store>` at the call
/// site (see `Vault`); reads and writes both go through this handle.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> VaultResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        schema::init(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> VaultResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::init(&conn)?;
        Ok(Self { conn })
    }

    // ---- users ----

    pub fn is_registered(&self) -> VaultResult<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        Ok(count > 0)
    }

    pub fn register(&self, user: &User) -> VaultResult<()> {
        if self.is_registered()? {
            return Err(VaultError::AlreadyRegistered);
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO users (username, password_hash, auth_salt, encryption_salt)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user.username,
                user.password_hash,
                user.auth_salt.to_vec(),
                user.encryption_salt
            ],
        )?;
        tx.execute(
            "INSERT INTO profiles (name, created_at) VALUES ('default', ?1)",
            params![now_iso8601()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_user(&self, username: &str) -> VaultResult<User> {
        self.conn
            .query_row(
                "SELECT username, password_hash, auth_salt, encryption_salt FROM users WHERE username = ?1",
                params![username],
                |r| {
                    let auth_salt_vec: Vec<u8> = r.get(2)?;
                    let mut auth_salt = [0u8; 16];
                    if auth_salt_vec.len() == 16 {
                        auth_salt.copy_from_slice(&auth_salt_vec);
                    }
                    Ok(User {
                        username: r.get(0)?,
                        password_hash: r.get(1)?,
                        auth_salt,
                        encryption_salt: r.get(3)?,
                    })
                },
            )
            .optional()?
            .ok_or(VaultError::NotRegistered)
    }

    // ---- profiles ----

    pub fn create_profile(&self, name: &str) -> VaultResult<Profile> {
        if name.trim().is_empty() {
            return Err(VaultError::validation("name", "must not be empty"));
        }
        let created_at = now_iso8601();
        self.conn
            .execute(
                "INSERT INTO profiles (name, created_at) VALUES (?1, ?2)",
                params![name, created_at],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref se, _)
                    if se.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    VaultError::Conflict
                }
                other => other.into(),
            })?;
        let id = self.conn.last_insert_rowid();
        Ok(Profile {
            id,
            name: name.to_string(),
            created_at,
        })
    }

    pub fn get_all_profiles(&self) -> VaultResult<Vec<Profile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, created_at FROM profiles ORDER BY id")?;
        let rows = stmt.query_map([], |r| {
            Ok(Profile {
                id: r.get(0)?,
                name: r.get(1)?,
                created_at: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn rename_profile(&self, id: i64, name: &str) -> VaultResult<()> {
        if name.trim().is_empty() {
            return Err(VaultError::validation("name", "must not be empty"));
        }
        let affected = self
            .conn
            .execute("UPDATE profiles SET name = ?1 WHERE id = ?2", params![name, id])?;
        if affected == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    /// Fails with `Conflict` if any non-deleted entry still belongs to this
    /// profile — a profile with live entries cannot be destroyed.
    pub fn delete_profile(&self, id: i64) -> VaultResult<()> {
        let live: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM vault_entries WHERE profile_id = ?1 AND deleted_at IS NULL",
            params![id],
            |r| r.get(0),
        )?;
        if live > 0 {
            return Err(VaultError::Conflict);
        }
        let affected = self.conn.execute("DELETE FROM profiles WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    // ---- vault entries ----

    #[allow(clippy::too_many_arguments)]
    pub fn save_entry(
        &self,
        entry_uuid: &str,
        label: &str,
        data_blob: &[u8],
        nonce: &[u8],
        profile_id: i64,
    ) -> VaultResult<i64> {
        let now = now_iso8601();
        self.conn.execute(
            "INSERT INTO vault_entries
                (entry_uuid, label, data_blob, nonce, profile_id, created_at, updated_at, deleted_at, sync_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL, 1)",
            params![entry_uuid, label, data_blob, nonce, profile_id, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_entry(&self, id: i64, label: &str, data_blob: &[u8], nonce: &[u8]) -> VaultResult<()> {
        let now = now_iso8601();
        let affected = self.conn.execute(
            "UPDATE vault_entries
             SET label = ?1, data_blob = ?2, nonce = ?3, updated_at = ?4, sync_version = sync_version + 1
             WHERE id = ?5 AND deleted_at IS NULL",
            params![label, data_blob, nonce, now, id],
        )?;
        if affected == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    pub fn soft_delete(&self, id: i64) -> VaultResult<()> {
        let now = now_iso8601();
        let affected = self.conn.execute(
            "UPDATE vault_entries
             SET deleted_at = ?1, updated_at = ?1, sync_version = sync_version + 1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        if affected == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    pub fn get_entry(&self, id: i64) -> VaultResult<VaultEntryRow> {
        self.conn
            .query_row(
                "SELECT id, entry_uuid, label, data_blob, nonce, profile_id, created_at, updated_at, deleted_at, sync_version
                 FROM vault_entries WHERE id = ?1",
                params![id],
                row_to_entry,
            )
            .optional()?
            .ok_or(VaultError::NotFound)
    }

    pub fn get_active_entries(&self, profile_id: i64) -> VaultResult<Vec<VaultEntryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entry_uuid, label, data_blob, nonce, profile_id, created_at, updated_at, deleted_at, sync_version
             FROM vault_entries WHERE profile_id = ?1 AND deleted_at IS NULL ORDER BY id",
        )?;
        let rows = stmt.query_map(params![profile_id], row_to_entry)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Includes tombstones; used by sync, scoped to one profile (§4.7 step
    /// 4 bundles "for the active profile"). `since_version` of 0 returns
    /// every row in that profile (first-sync bundling, per spec — every
    /// sync in this revision is full).
    pub fn get_all_entries_since(&self, profile_id: i64, since_version: i64) -> VaultResult<Vec<VaultEntryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entry_uuid, label, data_blob, nonce, profile_id, created_at, updated_at, deleted_at, sync_version
             FROM vault_entries WHERE profile_id = ?1 AND sync_version > ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![profile_id, since_version], row_to_entry)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn find_entry_by_uuid(&self, entry_uuid: &str) -> VaultResult<Option<VaultEntryRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, entry_uuid, label, data_blob, nonce, profile_id, created_at, updated_at, deleted_at, sync_version
                 FROM vault_entries WHERE entry_uuid = ?1",
                params![entry_uuid],
                row_to_entry,
            )
            .optional()?)
    }

    /// Write an incoming merge winner verbatim: the receiver does not bump
    /// the clock or the version, it writes what arrived (§4.8).
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_by_uuid(
        &self,
        entry_uuid: &str,
        profile_id: i64,
        label: &str,
        data_blob: &[u8],
        nonce: &[u8],
        updated_at: &str,
        deleted_at: Option<&str>,
        sync_version: i64,
    ) -> VaultResult<()> {
        let existing = self.find_entry_by_uuid(entry_uuid)?;
        if let Some(row) = existing {
            self.conn.execute(
                "UPDATE vault_entries
                 SET label = ?1, data_blob = ?2, nonce = ?3, updated_at = ?4, deleted_at = ?5, sync_version = ?6
                 WHERE id = ?7",
                params![label, data_blob, nonce, updated_at, deleted_at, sync_version, row.id],
            )?;
        } else {
            let created_at = updated_at.to_string();
            self.conn.execute(
                "INSERT INTO vault_entries
                    (entry_uuid, label, data_blob, nonce, profile_id, created_at, updated_at, deleted_at, sync_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry_uuid, label, data_blob, nonce, profile_id, created_at, updated_at, deleted_at, sync_version
                ],
            )?;
        }
        Ok(())
    }

    // ---- paired devices ----

    pub fn upsert_paired_device(&self, device: &PairedDevice) -> VaultResult<()> {
        self.conn.execute(
            "INSERT INTO paired_devices (device_id, device_name, public_key, shared_secret, paired_at, last_sync_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id) DO UPDATE SET
                device_name = excluded.device_name,
                public_key = excluded.public_key,
                shared_secret = excluded.shared_secret,
                last_sync_at = excluded.last_sync_at",
            params![
                device.device_id,
                device.device_name,
                device.public_key,
                device.shared_secret,
                device.paired_at,
                device.last_sync_at
            ],
        )?;
        Ok(())
    }

    pub fn touch_device_sync(&self, device_id: &str, at: &str) -> VaultResult<()> {
        let affected = self.conn.execute(
            "UPDATE paired_devices SET last_sync_at = ?1 WHERE device_id = ?2",
            params![at, device_id],
        )?;
        if affected == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    pub fn get_paired_devices(&self) -> VaultResult<Vec<PairedDevice>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, device_name, public_key, shared_secret, paired_at, last_sync_at FROM paired_devices ORDER BY paired_at",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(PairedDevice {
                device_id: r.get(0)?,
                device_name: r.get(1)?,
                public_key: r.get(2)?,
                shared_secret: r.get(3)?,
                paired_at: r.get(4)?,
                last_sync_at: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn forget_device(&self, device_id: &str) -> VaultResult<()> {
        let affected = self
            .conn
            .execute("DELETE FROM paired_devices WHERE device_id = ?1", params![device_id])?;
        if affected == 0 {
            return Err(VaultError::NotFound);
        }
        Ok(())
    }

    // ---- sync log ----

    pub fn append_sync_log(&self, entry: &SyncLogEntry) -> VaultResult<i64> {
        self.conn.execute(
            "INSERT INTO sync_log
                (device_id, direction, entries_sent, entries_received, status, started_at, completed_at, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.device_id,
                direction_str(entry.direction),
                entry.entries_sent,
                entry.entries_received,
                status_str(entry.status),
                entry.started_at,
                entry.completed_at,
                entry.error_message
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_sync_history(&self, limit: i64) -> VaultResult<Vec<SyncLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, device_id, direction, entries_sent, entries_received, status, started_at, completed_at, error_message
             FROM sync_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |r| {
            let direction: String = r.get(2)?;
            let status: String = r.get(5)?;
            Ok(SyncLogEntry {
                id: r.get(0)?,
                device_id: r.get(1)?,
                direction: parse_direction(&direction),
                entries_sent: r.get(3)?,
                entries_received: r.get(4)?,
                status: parse_status(&status),
                started_at: r.get(6)?,
                completed_at: r.get(7)?,
                error_message: r.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn row_to_entry(r: &rusqlite::Row) -> rusqlite::Result<VaultEntryRow> {
    Ok(VaultEntryRow {
        id: r.get(0)?,
        entry_uuid: r.get(1)?,
        label: r.get(2)?,
        data_blob: r.get(3)?,
        nonce: r.get(4)?,
        profile_id: r.get(5)?,
        created_at: r.get(6)?,
        updated_at: r.get(7)?,
        deleted_at: r.get(8)?,
        sync_version: r.get(9)?,
    })
}

fn direction_str(d: SyncDirection) -> &'static str {
    match d {
        SyncDirection::Push => "push",
        SyncDirection::Pull => "pull",
    }
}

fn parse_direction(s: &str) -> SyncDirection {
    match s {
        "pull" => SyncDirection::Pull,
        _ => SyncDirection::Push,
    }
}

fn status_str(s: SyncStatus) -> &'static str {
    match s {
        SyncStatus::Success => "success",
        SyncStatus::Partial => "partial",
        SyncStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> SyncStatus {
    match s {
        "success" => SyncStatus::Success,
        "failed" => SyncStatus::Failed,
        _ => SyncStatus::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            username: "alice".into(),
            password_hash: "phc-string".into(),
            auth_salt: [1u8; 16],
            encryption_salt: vec![2u8; 32],
        }
    }

    #[test]
    fn register_creates_default_profile() {
        let store = Store::open_in_memory().unwrap();
        store.register(&sample_user()).unwrap();
        let profiles = store.get_all_profiles().unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "default");
    }

    #[test]
    fn register_twice_fails() {
        let store = Store::open_in_memory().unwrap();
        store.register(&sample_user()).unwrap();
        assert!(matches!(
            store.register(&sample_user()),
            Err(VaultError::AlreadyRegistered)
        ));
    }

    #[test]
    fn save_update_soft_delete_version_increments() {
        let store = Store::open_in_memory().unwrap();
        store.register(&sample_user()).unwrap();
        let profile = store.get_all_profiles().unwrap().remove(0);

        let id = store
            .save_entry("uuid-1", "github.com", b"ct", b"n12", profile.id)
            .unwrap();
        let row = store.get_entry(id).unwrap();
        assert_eq!(row.sync_version, 1);

        store.update_entry(id, "github.com", b"ct2", b"n34").unwrap();
        let row = store.get_entry(id).unwrap();
        assert_eq!(row.sync_version, 2);

        store.soft_delete(id).unwrap();
        let row = store.get_entry(id).unwrap();
        assert_eq!(row.sync_version, 3);
        assert!(row.is_tombstone());
    }

    #[test]
    fn get_active_entries_excludes_tombstones() {
        let store = Store::open_in_memory().unwrap();
        store.register(&sample_user()).unwrap();
        let profile = store.get_all_profiles().unwrap().remove(0);
        let id = store
            .save_entry("uuid-1", "github.com", b"ct", b"n12", profile.id)
            .unwrap();
        store.soft_delete(id).unwrap();
        assert!(store.get_active_entries(profile.id).unwrap().is_empty());
        assert_eq!(store.get_all_entries_since(profile.id, 0).unwrap().len(), 1);
    }

    #[test]
    fn delete_profile_with_live_entries_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.register(&sample_user()).unwrap();
        let profile = store.get_all_profiles().unwrap().remove(0);
        store
            .save_entry("uuid-1", "github.com", b"ct", b"n12", profile.id)
            .unwrap();
        assert!(matches!(store.delete_profile(profile.id), Err(VaultError::Conflict)));
    }

    #[test]
    fn upsert_by_uuid_inserts_then_overwrites_verbatim() {
        let store = Store::open_in_memory().unwrap();
        store.register(&sample_user()).unwrap();
        let profile = store.get_all_profiles().unwrap().remove(0);

        store
            .upsert_by_uuid("uuid-1", profile.id, "site", b"ct", b"n12", "2024-01-01T00:00:00Z", None, 5)
            .unwrap();
        let row = store.find_entry_by_uuid("uuid-1").unwrap().unwrap();
        assert_eq!(row.sync_version, 5);

        store
            .upsert_by_uuid("uuid-1", profile.id, "site", b"ct2", b"n34", "2024-02-01T00:00:00Z", None, 3)
            .unwrap();
        let row = store.find_entry_by_uuid("uuid-1").unwrap().unwrap();
        // upsert_by_uuid writes verbatim; ordering/merge policy lives in the merge module.
        assert_eq!(row.sync_version, 3);
    }
}
