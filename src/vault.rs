//! Vault service (§4.4): encrypt on save, decrypt on read, never expose
//! plaintext without a valid session. Every function here takes a session
//! token and goes through [`crate::auth::SessionRegistry`] first — there is
//! no code path that reaches the store with a caller-supplied key.

use serde::{Deserialize, Serialize};

use crate::auth::SessionRegistry;
use crate::error::{VaultError, VaultResult};
use crate::store::{Store, VaultEntryRow};
use crate::{crypto, totp};

/// The plaintext JSON shape inside `data_blob` (§3). Every field is
/// nullable; the core never requires any of them to be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntryPayload {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub totp_secret: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// One decrypted entry as returned to the UI boundary.
#[derive(Debug, Clone, Serialize)]
pub struct VaultEntryView {
    pub id: i64,
    pub entry_uuid: String,
    pub label: String,
    pub profile_id: i64,
    pub payload: EntryPayload,
}

fn decrypt_row(key: &[u8; 32], row: &VaultEntryRow) -> VaultResult<EntryPayload> {
    let plaintext = crypto::decrypt(key, &row.nonce, &row.data_blob)?;
    serde_json::from_slice(&plaintext).map_err(|e| {
        tracing::error!(error = %e, entry_uuid = %row.entry_uuid, "stored payload is not valid JSON");
        VaultError::Decrypt
    })
}

/// Confirms the entry belongs to the session's active profile, if one is
/// pinned. A session with no active profile selected can see every
/// profile's entries by id — scoping then applies only to `list`, which
/// always takes an explicit profile.
fn check_profile_visibility(sessions: &SessionRegistry, token: &str, row: &VaultEntryRow) -> VaultResult<()> {
    if let Some(active) = sessions.active_profile_id(token)? {
        if active != row.profile_id {
            return Err(VaultError::NotFound);
        }
    }
    Ok(())
}

/// `save_entry` (§6): serializes, encrypts under the session key with a
/// fresh nonce, and inserts a new row with `sync_version = 1`.
pub fn save(
    store: &Store,
    sessions: &SessionRegistry,
    token: &str,
    label: &str,
    payload: &EntryPayload,
    profile_id: i64,
) -> VaultResult<String> {
    if label.trim().is_empty() {
        return Err(VaultError::validation("label", "must not be empty"));
    }
    let key = sessions.encryption_key(token)?;
    let plaintext = serde_json::to_vec(payload).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize entry payload");
        VaultError::Store("serialization failed".into())
    })?;
    let (nonce, ciphertext) = crypto::encrypt(&key, &plaintext)?;
    let entry_uuid = uuid::Uuid::new_v4().to_string();
    store.save_entry(&entry_uuid, label, &ciphertext, &nonce, profile_id)?;
    tracing::info!(event = "entry_saved", %entry_uuid, "vault entry created");
    Ok(entry_uuid)
}

/// `update_entry` (§6): re-encrypts under a fresh nonce and bumps
/// `sync_version`.
pub fn update(
    store: &Store,
    sessions: &SessionRegistry,
    token: &str,
    id: i64,
    label: &str,
    payload: &EntryPayload,
) -> VaultResult<()> {
    if label.trim().is_empty() {
        return Err(VaultError::validation("label", "must not be empty"));
    }
    let key = sessions.encryption_key(token)?;
    let row = store.get_entry(id)?;
    check_profile_visibility(sessions, token, &row)?;

    let plaintext = serde_json::to_vec(payload).map_err(|e| {
        tracing::error!(error = %e, "failed to serialize entry payload");
        VaultError::Store("serialization failed".into())
    })?;
    let (nonce, ciphertext) = crypto::encrypt(&key, &plaintext)?;
    store.update_entry(id, label, &ciphertext, &nonce)?;
    tracing::info!(event = "entry_updated", id, "vault entry updated");
    Ok(())
}

/// `delete_entry` (§6): soft-delete — tombstones the row, never a hard
/// delete.
pub fn soft_delete(store: &Store, sessions: &SessionRegistry, token: &str, id: i64) -> VaultResult<()> {
    sessions.touch(token)?;
    let row = store.get_entry(id)?;
    check_profile_visibility(sessions, token, &row)?;
    store.soft_delete(id)?;
    tracing::info!(event = "entry_deleted", id, "vault entry soft-deleted");
    Ok(())
}

/// `get_all_entries` (§6), scoped to one profile. Rows that fail to
/// decrypt are dropped and logged rather than surfaced as an error,
/// unless every row in the set fails (§4.4).
pub fn list(store: &Store, sessions: &SessionRegistry, token: &str, profile_id: i64) -> VaultResult<Vec<VaultEntryView>> {
    let key = sessions.encryption_key(token)?;
    let rows = store.get_active_entries(profile_id)?;
    let total = rows.len();
    let mut out = Vec::with_capacity(total);
    for row in rows {
        match decrypt_row(&key, &row) {
            Ok(payload) => out.push(VaultEntryView {
                id: row.id,
                entry_uuid: row.entry_uuid,
                label: row.label,
                profile_id: row.profile_id,
                payload,
            }),
            Err(_) => {
                tracing::warn!(entry_uuid = %row.entry_uuid, "dropping entry that failed to decrypt");
            }
        }
    }
    if total > 0 && out.is_empty() {
        return Err(VaultError::Decrypt);
    }
    Ok(out)
}

/// `get_all_entries`/single-entry read by id.
pub fn get(store: &Store, sessions: &SessionRegistry, token: &str, id: i64) -> VaultResult<VaultEntryView> {
    let key = sessions.encryption_key(token)?;
    let row = store.get_entry(id)?;
    check_profile_visibility(sessions, token, &row)?;
    if row.is_tombstone() {
        return Err(VaultError::NotFound);
    }
    let payload = decrypt_row(&key, &row)?;
    Ok(VaultEntryView {
        id: row.id,
        entry_uuid: row.entry_uuid,
        label: row.label,
        profile_id: row.profile_id,
        payload,
    })
}

/// `get_totp_token` (§6): no session-held secret involved — the UI passes
/// the decrypted secret it already has for this entry.
pub fn get_totp_token(sessions: &SessionRegistry, token: &str, secret: &str) -> VaultResult<totp::TotpToken> {
    sessions.touch(token)?;
    totp::generate(secret)
}
