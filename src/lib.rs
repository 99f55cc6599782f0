//! VibeVault core: key derivation and authentication, encrypted storage
//! with soft-delete/versioning, TOTP, and BLE pairing/sync between two
//! authenticated devices (§1). This crate is a library — no UI shell,
//! command dispatcher, keystore integration, or installer plumbing lives
//! here; every one of those is an external collaborator driving the
//! [`Vault`] handle below.
//!
//! [`Vault`] is the single entry point an embedding application talks to.
//! It owns the store, the session registry, the rate limiter, and the
//! inactivity sweeper, and exposes the core API (§6) as plain methods.
//! Nothing below this surface is reachable without a valid session token
//! except `check_registration`, `register_user`, and `unlock_vault`.

pub mod auth;
pub mod ble;
pub mod config;
pub mod crypto;
pub mod error;
pub mod merge;
pub mod store;
pub mod sync;
pub mod totp;
pub mod vault;
pub mod wire;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::auth::{InactivitySweeper, RateLimiter, SessionRegistry};
use crate::ble::{BleEvent, DiscoveredPeer, GattAdapter, Mode};
use crate::config::VaultConfig;
use crate::error::SyncErrorKind;
use crate::store::{PairedDevice, Profile, Store, SyncDirection, SyncLogEntry, SyncStatus};
use crate::sync::{IngestSummary, SyncEngine, SyncSnapshot};
use crate::vault::{EntryPayload, VaultEntryView};

pub use crate::error::{VaultError, VaultResult};

/// One active sync session, owned exclusively by the `Vault` while
/// non-idle — the engine holds its BLE peripheral/central role
/// exclusively until it reaches `Complete` or `Error` (§5).
struct ActiveSync {
    engine: SyncEngine,
    peer: DiscoveredPeer,
}

/// The single handle an embedding application holds. Thread-safe: every
/// method takes `&self` and serializes through the store mutex and the
/// session registry's own internal lock (§5: single writer at a time for
/// the store, all session access serialized through a mutex).
pub struct Vault {
    config: VaultConfig,
    store: Mutex<Store>,
    limiter: RateLimiter,
    sessions: Arc<SessionRegistry>,
    _sweeper: InactivitySweeper,
    active_sync: Mutex<Option<ActiveSync>>,
}

impl Vault {
    /// Opens (or creates) the database under `config.data_dir` and starts
    /// the inactivity sweeper. Fails only if the database file can't be
    /// opened or migrated.
    pub fn open(config: VaultConfig) -> VaultResult<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            tracing::error!(error = %e, "failed to create app data directory");
            VaultError::Store(e.to_string())
        })?;
        let db_path = config.data_dir.join("vibevault.db");
        let store = Store::open(&db_path)?;
        let sessions = Arc::new(SessionRegistry::new(config.idle_timeout));
        let sweeper = InactivitySweeper::spawn(Arc::clone(&sessions), config.sweep_interval);
        Ok(Self {
            config,
            store: Mutex::new(store),
            limiter: RateLimiter::new(),
            sessions,
            _sweeper: sweeper,
            active_sync: Mutex::new(None),
        })
    }

    /// A handle backed by an in-memory database, for tests and short-lived
    /// embeddings (e.g. a CLI demo) that don't need persistence.
    pub fn open_in_memory(idle_timeout: Duration) -> VaultResult<Self> {
        let store = Store::open_in_memory()?;
        let sessions = Arc::new(SessionRegistry::new(idle_timeout));
        let sweeper = InactivitySweeper::spawn(Arc::clone(&sessions), Duration::from_secs(30));
        Ok(Self {
            config: VaultConfig {
                idle_timeout,
                ..VaultConfig::default()
            },
            store: Mutex::new(store),
            limiter: RateLimiter::new(),
            sessions,
            _sweeper: sweeper,
            active_sync: Mutex::new(None),
        })
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().expect("store mutex poisoned")
    }

    fn resolve_profile_id(&self, token: &str, profile_id: Option<i64>) -> VaultResult<i64> {
        if let Some(id) = profile_id {
            return Ok(id);
        }
        if let Some(active) = self.sessions.active_profile_id(token)? {
            return Ok(active);
        }
        let profiles = self.store().get_all_profiles()?;
        profiles
            .first()
            .map(|p| p.id)
            .ok_or(VaultError::NotFound)
    }

    // ---- registration / session (§6) ----

    pub fn check_registration(&self) -> VaultResult<bool> {
        self.store().is_registered()
    }

    pub fn register_user(&self, username: &str, password: &str) -> VaultResult<()> {
        auth::register(&self.store(), username, password)
    }

    pub fn unlock_vault(&self, username: &str, password: &str) -> VaultResult<String> {
        auth::unlock(&self.store(), &self.limiter, &self.sessions, username, password)
    }

    pub fn lock_vault(&self, token: &str) -> VaultResult<()> {
        self.sessions.invalidate(token);
        Ok(())
    }

    pub fn touch_activity(&self, token: &str) -> VaultResult<()> {
        self.sessions.touch(token)
    }

    // ---- vault entries (§6) ----

    pub fn save_entry(
        &self,
        token: &str,
        label: &str,
        payload: &EntryPayload,
        profile_id: Option<i64>,
    ) -> VaultResult<String> {
        let profile_id = self.resolve_profile_id(token, profile_id)?;
        vault::save(&self.store(), &self.sessions, token, label, payload, profile_id)
    }

    pub fn update_entry(&self, token: &str, id: i64, label: &str, payload: &EntryPayload) -> VaultResult<()> {
        vault::update(&self.store(), &self.sessions, token, id, label, payload)
    }

    pub fn delete_entry(&self, token: &str, id: i64) -> VaultResult<()> {
        vault::soft_delete(&self.store(), &self.sessions, token, id)
    }

    pub fn get_all_entries(&self, token: &str, profile_id: Option<i64>) -> VaultResult<Vec<VaultEntryView>> {
        let profile_id = self.resolve_profile_id(token, profile_id)?;
        vault::list(&self.store(), &self.sessions, token, profile_id)
    }

    pub fn get_entry(&self, token: &str, id: i64) -> VaultResult<VaultEntryView> {
        vault::get(&self.store(), &self.sessions, token, id)
    }

    pub fn get_totp_token(&self, token: &str, secret: &str) -> VaultResult<totp::TotpToken> {
        vault::get_totp_token(&self.sessions, token, secret)
    }

    // ---- profiles (§6) ----

    pub fn create_profile(&self, token: &str, name: &str) -> VaultResult<Profile> {
        self.sessions.touch(token)?;
        self.store().create_profile(name)
    }

    pub fn get_all_profiles(&self, token: &str) -> VaultResult<Vec<Profile>> {
        self.sessions.touch(token)?;
        self.store().get_all_profiles()
    }

    pub fn rename_profile(&self, token: &str, id: i64, name: &str) -> VaultResult<()> {
        self.sessions.touch(token)?;
        self.store().rename_profile(id, name)
    }

    pub fn delete_profile(&self, token: &str, id: i64) -> VaultResult<()> {
        self.sessions.touch(token)?;
        self.store().delete_profile(id)
    }

    pub fn get_active_profile(&self, token: &str) -> VaultResult<Option<i64>> {
        self.sessions.active_profile_id(token)
    }

    pub fn set_active_profile(&self, token: &str, id: i64) -> VaultResult<()> {
        self.sessions.set_active_profile_id(token, id)
    }

    // ---- paired devices / sync history (§6) ----

    pub fn get_paired_devices(&self, token: &str) -> VaultResult<Vec<PairedDevice>> {
        self.sessions.touch(token)?;
        self.store().get_paired_devices()
    }

    pub fn forget_device(&self, token: &str, device_id: &str) -> VaultResult<()> {
        self.sessions.touch(token)?;
        self.store().forget_device(device_id)
    }

    pub fn get_sync_history(&self, token: &str, limit: i64) -> VaultResult<Vec<SyncLogEntry>> {
        self.sessions.touch(token)?;
        self.store().get_sync_history(limit)
    }

    // ---- sync (§6, §4.7) ----
    //
    // The tagged `SyncEngine` (`crate::sync`) models pairing and the
    // receiver side of chunked transfer as a pure `(state, event) ->
    // (state, actions)` function, independent of any concrete BLE stack.
    // These methods are the thin, session-and-busy-aware wrapper around it
    // that an embedding application (desktop or mobile UI) actually calls,
    // dispatching the returned `BleAction`s to whatever `GattAdapter` it
    // has wired up to its platform's GATT stack.
    //
    // The bundle-sending side is not event-driven: once pairing completes
    // and this device is determined to be the sender for the active mode
    // (§4.6), `feed_ble_event` builds the bundle, chunks it, and
    // writes every frame through the adapter in one pass rather than
    // waiting on a per-chunk ACK round-trip — an embedding that needs
    // interleaved ACK back-pressure over real hardware drives
    // `sync::ChunkSender`/`ChunkReceiver` directly instead of through this
    // facade (see `sync::simulate_push_sync` for the reference shape).

    fn start_sync(&self, token: &str, peer: DiscoveredPeer, mode: Mode, adapter: &mut dyn GattAdapter) -> VaultResult<SyncSnapshot> {
        self.sessions.touch(token)?;
        let mut active = self.active_sync.lock().expect("active sync mutex poisoned");
        if active.as_ref().is_some_and(|a| a.engine.is_busy()) {
            return Err(VaultError::Sync(SyncErrorKind::Busy));
        }
        let mut engine = SyncEngine::new(adapter.role(), self.config.sync_session_timeout);
        for action in engine.start(mode) {
            adapter.dispatch(action)?;
        }
        let snapshot = engine.snapshot();
        *active = Some(ActiveSync { engine, peer });
        Ok(snapshot)
    }

    pub fn start_push(&self, token: &str, peer: DiscoveredPeer, adapter: &mut dyn GattAdapter) -> VaultResult<SyncSnapshot> {
        self.start_sync(token, peer, Mode::Push, adapter)
    }

    pub fn start_pull(&self, token: &str, peer: DiscoveredPeer, adapter: &mut dyn GattAdapter) -> VaultResult<SyncSnapshot> {
        self.start_sync(token, peer, Mode::Pull, adapter)
    }

    pub fn sync_state(&self, _token: &str) -> VaultResult<SyncSnapshot> {
        let active = self.active_sync.lock().expect("active sync mutex poisoned");
        Ok(active.as_ref().map(|a| a.engine.snapshot()).unwrap_or(SyncSnapshot::Idle))
    }

    /// Feeds one transport-level occurrence into the active sync's state
    /// machine, dispatching whatever `BleAction`s it produces, and — once
    /// pairing completes and this device is the sender — immediately
    /// transmits the bundle. Returns the resulting snapshot.
    pub fn feed_ble_event(&self, token: &str, event: BleEvent, adapter: &mut dyn GattAdapter) -> VaultResult<SyncSnapshot> {
        self.sessions.touch(token)?;
        let vault_key = self.sessions.encryption_key(token)?;
        let profile_id = self.resolve_profile_id(token, None)?;
        let mut active = self.active_sync.lock().expect("active sync mutex poisoned");
        let Some(slot) = active.as_mut() else {
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        };

        let was_paired = matches!(slot.engine.snapshot(), SyncSnapshot::Paired);
        for action in slot.engine.handle_event(event)? {
            adapter.dispatch(action)?;
        }

        if !was_paired && matches!(slot.engine.snapshot(), SyncSnapshot::Paired) && slot.engine.is_sender() {
            self.send_bundle(slot, profile_id, &vault_key, adapter)?;
        }

        let snapshot = slot.engine.snapshot();
        if matches!(snapshot, SyncSnapshot::Complete { .. } | SyncSnapshot::Error { .. }) {
            self.finalize_sync(&slot.peer, &snapshot);
            *active = None;
        }
        Ok(snapshot)
    }

    fn send_bundle(&self, slot: &mut ActiveSync, profile_id: i64, vault_key: &[u8; 32], adapter: &mut dyn GattAdapter) -> VaultResult<()> {
        use crate::ble::{Characteristic, ControlOp};

        let session_key = *slot.engine.session_key().ok_or(VaultError::Sync(SyncErrorKind::CryptoMismatch))?;
        let bundle = sync::build_bundle(&self.store(), profile_id, vault_key, &session_key)?;
        let sent = wire::decode_bundle(&bundle)?.len();
        let mut sender = sync::ChunkSender::new(&bundle);

        adapter.dispatch(crate::ble::BleAction::WriteCharacteristic {
            characteristic: Characteristic::SyncControl,
            value: vec![ControlOp::Start.to_byte()],
        })?;
        while let Some(frame) = sender.next_frame() {
            adapter.dispatch(crate::ble::BleAction::WriteCharacteristic {
                characteristic: Characteristic::DataTransfer,
                value: frame,
            })?;
        }
        adapter.dispatch(crate::ble::BleAction::WriteCharacteristic {
            characteristic: Characteristic::SyncControl,
            value: vec![ControlOp::Complete.to_byte()],
        })?;

        slot.engine.force_complete(IngestSummary { received: sent, applied: 0 });
        Ok(())
    }

    /// Convenience wrapper for the central-side prompt: the person typed
    /// in the code shown on the peripheral's display.
    pub fn submit_pairing_code(&self, token: &str, code: &str, adapter: &mut dyn GattAdapter) -> VaultResult<SyncSnapshot> {
        self.feed_ble_event(token, BleEvent::PairingCodeEntered(code.to_string()), adapter)
    }

    /// User-initiated cancel (§4.7 "Cancellation"): either side
    /// may abort at any moment. Always releases the busy slot, even if the
    /// engine was already idle.
    pub fn cancel_sync(&self, token: &str, adapter: &mut dyn GattAdapter) -> VaultResult<()> {
        self.sessions.touch(token)?;
        let mut active = self.active_sync.lock().expect("active sync mutex poisoned");
        if let Some(slot) = active.as_mut() {
            let _ = slot.engine.handle_event(BleEvent::Cancel).map(|actions| {
                for action in actions {
                    let _ = adapter.dispatch(action);
                }
            });
            let snapshot = slot.engine.snapshot();
            self.finalize_sync(&slot.peer, &snapshot);
        }
        *active = None;
        Ok(())
    }

    /// Called by the receiving side once its transport layer has
    /// delivered every chunk of the bundle (the final `DataTransfer`
    /// write/notification already drove `feed_ble_event`'s reassembler to
    /// completion) — ingests the bundle through merge and finalizes the
    /// session. A no-op `Busy` source of confusion if called on the
    /// sender: the sender's engine is never in `Transferring`, since only
    /// the receiver's reassembler occupies that phase.
    pub fn complete_transfer(&self, token: &str) -> VaultResult<SyncSnapshot> {
        let vault_key = self.sessions.encryption_key(token)?;
        let mut active = self.active_sync.lock().expect("active sync mutex poisoned");
        let Some(mut slot) = active.take() else {
            return Err(VaultError::Sync(SyncErrorKind::FramingError));
        };
        let store = self.store();
        let result = slot.engine.finish_transfer(|session_key, bundle| sync::ingest_bundle(&store, &vault_key, session_key, &bundle));
        drop(store);
        let snapshot = slot.engine.snapshot();
        self.finalize_sync(&slot.peer, &snapshot);
        result?;
        Ok(snapshot)
    }

    /// Records the paired device and a `SyncLogEntry` for the just-ended
    /// session (§4.7 step 7). Best-effort: a logging failure
    /// must never mask the sync's real outcome to the caller.
    fn finalize_sync(&self, peer: &DiscoveredPeer, snapshot: &SyncSnapshot) {
        let now = store::now_iso8601();
        let store = self.store();
        if matches!(snapshot, SyncSnapshot::Complete { .. }) {
            let _ = store.upsert_paired_device(&PairedDevice {
                device_id: peer.device_id.clone(),
                device_name: peer.device_name.clone(),
                public_key: Vec::new(),
                shared_secret: None,
                paired_at: now.clone(),
                last_sync_at: Some(now.clone()),
            });
        }
        let (status, entries_sent, entries_received) = match snapshot {
            SyncSnapshot::Complete { entries_sent, entries_received } => (SyncStatus::Success, *entries_sent as i64, *entries_received as i64),
            SyncSnapshot::Error { .. } => (SyncStatus::Failed, 0, 0),
            _ => (SyncStatus::Partial, 0, 0),
        };
        let error_message = match snapshot {
            SyncSnapshot::Error { kind } => Some(kind.to_string()),
            _ => None,
        };
        let _ = store.append_sync_log(&SyncLogEntry {
            id: 0,
            device_id: peer.device_id.clone(),
            direction: SyncDirection::Push,
            entries_sent,
            entries_received,
            status,
            started_at: now.clone(),
            completed_at: Some(now),
            error_message,
        });
    }
}
