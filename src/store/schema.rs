//! Five tables matching the data model: `users`, `profiles`,
//! `vault_entries`, `paired_devices`, `sync_log`. Migrations are additive
//! and run idempotently at first open — see [`upgrade_from`] for the one
//! worked example of backfilling a column on rows written under an older
//! schema.

use rusqlite::Connection;

use crate::error::VaultResult;

pub(super) const VERSION: i64 = 2;

const CREATE_USERS_V1: &str = "
    CREATE TABLE IF NOT EXISTS users (
        username         TEXT PRIMARY KEY,
        password_hash    TEXT NOT NULL,
        auth_salt        BLOB NOT NULL,
        encryption_salt  BLOB NOT NULL
    )
";

const CREATE_PROFILES_V1: &str = "
    CREATE TABLE IF NOT EXISTS profiles (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        name        TEXT NOT NULL UNIQUE,
        created_at  TEXT NOT NULL
    )
";

// v1 shape: no entry_uuid, sync_version, or deleted_at yet — those are
// backfilled by upgrade_from(1).
const CREATE_VAULT_ENTRIES_V1: &str = "
    CREATE TABLE IF NOT EXISTS vault_entries (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        label       TEXT NOT NULL,
        data_blob   BLOB NOT NULL,
        nonce       BLOB NOT NULL,
        profile_id  INTEGER NOT NULL REFERENCES profiles(id),
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
";

const CREATE_PAIRED_DEVICES_V1: &str = "
    CREATE TABLE IF NOT EXISTS paired_devices (
        device_id    TEXT PRIMARY KEY,
        device_name  TEXT NOT NULL,
        public_key   BLOB NOT NULL,
        paired_at    TEXT NOT NULL,
        last_sync_at TEXT
    )
";

const CREATE_SYNC_LOG_V1: &str = "
    CREATE TABLE IF NOT EXISTS sync_log (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id         TEXT NOT NULL,
        direction         TEXT NOT NULL,
        entries_sent      INTEGER NOT NULL,
        entries_received  INTEGER NOT NULL,
        status            TEXT NOT NULL,
        started_at        TEXT NOT NULL,
        completed_at      TEXT,
        error_message     TEXT
    )
";

pub(super) fn init(db: &Connection) -> VaultResult<()> {
    let user_version: i64 = db.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if user_version == 0 {
        return create(db);
    }
    if user_version < VERSION {
        upgrade(db, user_version)?;
    } else if user_version > VERSION {
        tracing::warn!(
            found = user_version,
            understood = VERSION,
            "database schema is newer than this build understands"
        );
    }
    Ok(())
}

fn create(db: &Connection) -> VaultResult<()> {
    db.execute_batch(CREATE_USERS_V1)?;
    db.execute_batch(CREATE_PROFILES_V1)?;
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS vault_entries (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_uuid    TEXT NOT NULL UNIQUE,
            label         TEXT NOT NULL,
            data_blob     BLOB NOT NULL,
            nonce         BLOB NOT NULL,
            profile_id    INTEGER NOT NULL REFERENCES profiles(id),
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            deleted_at    TEXT,
            sync_version  INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_vault_entries_uuid ON vault_entries(entry_uuid);
        CREATE INDEX IF NOT EXISTS idx_vault_entries_profile ON vault_entries(profile_id, deleted_at);",
    )?;
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS paired_devices (
            device_id      TEXT PRIMARY KEY,
            device_name    TEXT NOT NULL,
            public_key     BLOB NOT NULL,
            shared_secret  BLOB,
            paired_at      TEXT NOT NULL,
            last_sync_at   TEXT
        )",
    )?;
    db.execute_batch(CREATE_SYNC_LOG_V1)?;
    db.execute_batch(&format!("PRAGMA user_version = {VERSION}"))?;
    Ok(())
}

fn upgrade(db: &Connection, from: i64) -> VaultResult<()> {
    for version in from..VERSION {
        upgrade_from(db, version)?;
    }
    db.execute_batch(&format!("PRAGMA user_version = {VERSION}"))?;
    Ok(())
}

fn upgrade_from(db: &Connection, from: i64) -> VaultResult<()> {
    match from {
        // v1 -> v2: add sync bookkeeping columns to vault_entries, backfill
        // existing rows with a fresh UUID and sync_version=1, and add the
        // paired_devices.shared_secret column reserved for future re-pairing.
        1 => {
            db.execute_batch(
                "ALTER TABLE vault_entries ADD COLUMN entry_uuid TEXT;
                 ALTER TABLE vault_entries ADD COLUMN sync_version INTEGER NOT NULL DEFAULT 1;
                 ALTER TABLE vault_entries ADD COLUMN deleted_at TEXT;",
            )?;
            let ids: Vec<i64> = {
                let mut stmt = db.prepare("SELECT id FROM vault_entries WHERE entry_uuid IS NULL")?;
                let rows = stmt.query_map([], |r| r.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            for id in ids {
                let fresh_uuid = uuid::Uuid::new_v4().to_string();
                db.execute(
                    "UPDATE vault_entries SET entry_uuid = ?1 WHERE id = ?2",
                    rusqlite::params![fresh_uuid, id],
                )?;
            }
            db.execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_vault_entries_uuid ON vault_entries(entry_uuid);
                 CREATE INDEX IF NOT EXISTS idx_vault_entries_profile ON vault_entries(profile_id, deleted_at);
                 ALTER TABLE paired_devices ADD COLUMN shared_secret BLOB;",
            )?;
            Ok(())
        }
        _ => Err(crate::error::VaultError::Store(format!(
            "no migration path from schema version {from}"
        ))),
    }
}
