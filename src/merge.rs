//! Per-entry last-writer-wins merge (§4.8). The decision function is pure
//! and deterministic so both ends of a sync reach the same outcome
//! independent of transmission order — applying the same envelope twice,
//! or applying `{A, B}` then `{B, A}`, must produce identical state.

use std::cmp::Ordering;

use crate::store::VaultEntryRow;
use crate::wire::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No local row for this `entry_uuid` — the envelope is inserted.
    Insert,
    /// The envelope's version is strictly ahead of the local row.
    Overwrite,
    /// The local row is ahead, or wins the tie-break — no change.
    Ignore,
}

/// Decide what to do with one inbound envelope given the current local
/// row (if any). Pure: no I/O, no mutation — callers apply the decision.
pub fn resolve(local: Option<&VaultEntryRow>, inbound: &Envelope) -> MergeOutcome {
    let Some(local) = local else {
        return MergeOutcome::Insert;
    };

    match inbound.sync_version.cmp(&(local.sync_version as u64)) {
        Ordering::Greater => MergeOutcome::Overwrite,
        Ordering::Less => MergeOutcome::Ignore,
        Ordering::Equal => match inbound.updated_at.cmp(&local.updated_at) {
            Ordering::Greater => MergeOutcome::Overwrite,
            Ordering::Less => MergeOutcome::Ignore,
            // Still tied: break symmetrically on entry_uuid byte order so
            // both ends reach the same answer regardless of which side
            // is "local" and which is "inbound". Both sides compared as
            // the same hyphenated-string representation.
            Ordering::Equal => {
                if inbound.entry_uuid_string().as_bytes() > local.entry_uuid.as_bytes() {
                    MergeOutcome::Overwrite
                } else {
                    MergeOutcome::Ignore
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(entry_uuid: &str, sync_version: i64, updated_at: &str) -> VaultEntryRow {
        VaultEntryRow {
            id: 1,
            entry_uuid: entry_uuid.to_string(),
            label: "x".to_string(),
            data_blob: vec![],
            nonce: vec![],
            profile_id: 1,
            created_at: updated_at.to_string(),
            updated_at: updated_at.to_string(),
            deleted_at: None,
            sync_version,
        }
    }

    fn envelope(uuid_bytes: [u8; 16], sync_version: u64, updated_at: &str, tombstone: bool) -> Envelope {
        Envelope {
            entry_uuid: uuid_bytes,
            profile_id: 1,
            sync_version,
            updated_at: updated_at.to_string(),
            label: "x".to_string(),
            is_tombstone: tombstone,
            nonce: [0u8; 12],
            ciphertext: vec![],
        }
    }

    #[test]
    fn no_local_row_inserts() {
        let e = envelope([1; 16], 1, "2024-01-01T00:00:00Z", false);
        assert_eq!(resolve(None, &e), MergeOutcome::Insert);
    }

    #[test]
    fn higher_version_overwrites() {
        let uuid = uuid::Uuid::from_bytes([1; 16]);
        let local = row(&uuid.to_string(), 3, "2024-01-01T00:00:00Z");
        let e = envelope([1; 16], 4, "2024-01-01T00:00:00Z", false);
        assert_eq!(resolve(Some(&local), &e), MergeOutcome::Overwrite);
    }

    #[test]
    fn lower_version_is_ignored() {
        let uuid = uuid::Uuid::from_bytes([1; 16]);
        let local = row(&uuid.to_string(), 5, "2024-01-01T00:00:00Z");
        let e = envelope([1; 16], 4, "2024-01-01T00:00:00Z", false);
        assert_eq!(resolve(Some(&local), &e), MergeOutcome::Ignore);
    }

    #[test]
    fn tie_breaks_on_updated_at_then_uuid() {
        let uuid = uuid::Uuid::from_bytes([1; 16]);
        let local = row(&uuid.to_string(), 5, "2024-01-01T00:00:00Z");
        let later = envelope([1; 16], 5, "2024-06-01T00:00:00Z", false);
        assert_eq!(resolve(Some(&local), &later), MergeOutcome::Overwrite);

        let same_time_lower_uuid = envelope([0; 16], 5, "2024-01-01T00:00:00Z", false);
        assert_eq!(resolve(Some(&local), &same_time_lower_uuid), MergeOutcome::Ignore);
    }

    #[test]
    fn exact_tie_breaks_on_uuid_byte_order_not_string_length() {
        // Equal sync_version AND equal updated_at: the uuid byte-order
        // tie-break is the only thing left to decide the outcome.
        let local_uuid = uuid::Uuid::from_bytes([0xaa; 16]);
        let local = row(&local_uuid.to_string(), 5, "2024-01-01T00:00:00Z");

        let higher_uuid = envelope([0xbb; 16], 5, "2024-01-01T00:00:00Z", false);
        assert_eq!(resolve(Some(&local), &higher_uuid), MergeOutcome::Overwrite);

        let lower_uuid = envelope([0x11; 16], 5, "2024-01-01T00:00:00Z", false);
        assert_eq!(resolve(Some(&local), &lower_uuid), MergeOutcome::Ignore);
    }

    #[test]
    fn applying_same_envelope_twice_is_idempotent() {
        let uuid = uuid::Uuid::from_bytes([3; 16]);
        let mut local = row(&uuid.to_string(), 1, "2024-01-01T00:00:00Z");
        let e = envelope([3; 16], 2, "2024-02-01T00:00:00Z", false);
        assert_eq!(resolve(Some(&local), &e), MergeOutcome::Overwrite);
        // After applying, local now matches the envelope; applying again is a no-op.
        local.sync_version = e.sync_version as i64;
        local.updated_at = e.updated_at.clone();
        assert_eq!(resolve(Some(&local), &e), MergeOutcome::Ignore);
    }

    #[test]
    fn order_of_application_does_not_matter() {
        let uuid = uuid::Uuid::from_bytes([5; 16]);
        let a = envelope([5; 16], 2, "2024-01-01T00:00:00Z", false);
        let b = envelope([5; 16], 7, "2024-03-01T00:00:00Z", true);

        // apply a then b
        let after_a = row(&uuid.to_string(), a.sync_version as i64, &a.updated_at);
        assert_eq!(resolve(Some(&after_a), &b), MergeOutcome::Overwrite);

        // apply b then a
        let after_b = row(&uuid.to_string(), b.sync_version as i64, &b.updated_at);
        assert_eq!(resolve(Some(&after_b), &a), MergeOutcome::Ignore);
    }

    #[test]
    fn tombstone_propagates_when_local_not_ahead() {
        let uuid = uuid::Uuid::from_bytes([4; 16]);
        let local = row(&uuid.to_string(), 3, "2024-01-01T00:00:00Z");
        let tombstone = envelope([4; 16], 4, "2024-02-01T00:00:00Z", true);
        assert_eq!(resolve(Some(&local), &tombstone), MergeOutcome::Overwrite);
    }
}
