//! Sync state machine (§4.7, §9): pairing with a short authentication
//! string, session-key derivation, bundle preparation, chunked transfer,
//! and ingestion through merge. The protocol-level functions here are
//! pure with respect to BLE — they take and return plain bytes/keys — so
//! they're exercised directly in tests without any transport. The
//! `SyncEngine` tagged state machine wraps them behind the explicit
//! `(state, event) -> (state, actions)` shape called for in §9, driven by
//! whatever `crate::ble::GattAdapter` the embedding application wires up.

use std::mem;
use zeroize::Zeroizing;

use crate::ble::{BleAction, BleEvent, Characteristic, ControlOp, Mode, Role};
use crate::crypto::{self, EphemeralKeypair};
use crate::error::{SyncErrorKind, VaultError, VaultResult};
use crate::merge::{self, MergeOutcome};
use crate::store::{self, PairedDevice, Store, SyncDirection, SyncLogEntry, SyncStatus};
use crate::wire::{self, Chunk, Envelope, Reassembler};

const PAIRING_MAC_LEN: usize = 32;
const PUBLIC_KEY_LEN: usize = 33;
/// Receiver ACKs every this-many chunks, or at end-of-message (§4.7 step 5).
const ACK_WINDOW: usize = 16;

// ---------------------------------------------------------------------
// Pairing (short authentication string)
// ---------------------------------------------------------------------

/// Peripheral-side pairing state: the ephemeral keypair and the code
/// displayed to the person using the device.
pub struct PairingInit {
    pub keypair: EphemeralKeypair,
    pub code: String,
}

fn random_six_digit_code() -> String {
    let bytes = crypto::random_bytes::<4>();
    let n = u32::from_be_bytes(bytes) % 1_000_000;
    format!("{n:06}")
}

/// Peripheral begins pairing: fresh ephemeral keypair, fresh random code.
pub fn peripheral_init_pairing() -> PairingInit {
    PairingInit {
        keypair: EphemeralKeypair::generate(),
        code: random_six_digit_code(),
    }
}

/// Central's response once the peripheral's public key has been read and
/// the person has typed in the displayed code: a fresh keypair plus the
/// `public_key || hmac` value written back to the Pairing characteristic.
pub struct CentralPairingResponse {
    pub keypair: EphemeralKeypair,
    pub wire_value: Vec<u8>,
}

/// `hmac = HMAC_SHA256(code, its_own_public_key)` (§4.7 step 3).
pub fn central_respond_to_pairing(code: &str) -> CentralPairingResponse {
    let keypair = EphemeralKeypair::generate();
    let own_public = keypair.public_key_compressed();
    let hmac = crypto::hmac_sha256(code.as_bytes(), &own_public);
    let mut wire_value = Vec::with_capacity(PUBLIC_KEY_LEN + PAIRING_MAC_LEN);
    wire_value.extend_from_slice(&own_public);
    wire_value.extend_from_slice(&hmac);
    CentralPairingResponse { keypair, wire_value }
}

/// Peripheral recomputes the HMAC from the received `public_key || hmac`
/// value using its own locally displayed code; mismatch is a
/// `CryptoMismatch` abort, never silently accepted.
pub fn peripheral_verify_and_derive(
    init: &PairingInit,
    received: &[u8],
) -> VaultResult<([u8; PUBLIC_KEY_LEN], Zeroizing<[u8; 32]>)> {
    if received.len() != PUBLIC_KEY_LEN + PAIRING_MAC_LEN {
        return Err(VaultError::Sync(SyncErrorKind::FramingError));
    }
    let mut central_public = [0u8; PUBLIC_KEY_LEN];
    central_public.copy_from_slice(&received[..PUBLIC_KEY_LEN]);
    let received_mac = &received[PUBLIC_KEY_LEN..];

    let expected_mac = crypto::hmac_sha256(init.code.as_bytes(), &central_public);
    if !crypto::constant_time_eq(&expected_mac, received_mac) {
        tracing::warn!(event = "pairing_mac_mismatch", "pairing code did not match");
        return Err(VaultError::Sync(SyncErrorKind::CryptoMismatch));
    }
    let session_key = init.keypair.derive_session_key(&central_public)?;
    Ok((central_public, session_key))
}

/// Central derives the same session key once it knows the peripheral's
/// public key (read from the Pairing characteristic before the code was
/// even entered).
pub fn central_derive_session_key(
    response: &CentralPairingResponse,
    peripheral_public: &[u8; PUBLIC_KEY_LEN],
) -> VaultResult<Zeroizing<[u8; 32]>> {
    response.keypair.derive_session_key(peripheral_public)
}

// ---------------------------------------------------------------------
// Bundle preparation / ingestion (§4.7 steps 4 and 6, §4.8)
// ---------------------------------------------------------------------

/// Collects every entry (including tombstones) belonging to the active
/// profile and re-encrypts each under the session key with a fresh nonce,
/// producing the wire bundle. Every sync in this revision is full
/// (`get_all_entries_since(profile_id, 0)`); an incremental mode keyed on
/// the peer's last known `sync_version` is not part of this protocol.
pub fn build_bundle(store: &Store, profile_id: i64, vault_key: &[u8; 32], session_key: &[u8; 32]) -> VaultResult<Vec<u8>> {
    let rows = store.get_all_entries_since(profile_id, 0)?;
    let mut envelopes = Vec::with_capacity(rows.len());
    for row in &rows {
        let plaintext = crypto::decrypt(vault_key, &row.nonce, &row.data_blob)?;
        let (nonce, ciphertext) = crypto::encrypt(session_key, &plaintext)?;
        envelopes.push(Envelope::from_row(row, nonce, ciphertext)?);
    }
    Ok(wire::encode_bundle(&envelopes))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestSummary {
    pub received: usize,
    pub applied: usize,
}

/// Decrypts each envelope under the session key, re-encrypts it under the
/// local vault key with a fresh nonce, and hands it to [`merge::resolve`].
/// Ingestion is per-envelope transactional — a failure partway through
/// leaves everything already applied in place (a partial sync), never a
/// half-written row.
pub fn ingest_bundle(
    store: &Store,
    vault_key: &[u8; 32],
    session_key: &[u8; 32],
    bundle: &[u8],
) -> VaultResult<IngestSummary> {
    let envelopes = wire::decode_bundle(bundle)?;
    let mut applied = 0usize;
    for envelope in &envelopes {
        let plaintext = crypto::decrypt(session_key, &envelope.nonce, &envelope.ciphertext)?;
        let (local_nonce, local_ciphertext) = crypto::encrypt(vault_key, &plaintext)?;
        let entry_uuid = envelope.entry_uuid_string();
        let local_row = store.find_entry_by_uuid(&entry_uuid)?;
        match merge::resolve(local_row.as_ref(), envelope) {
            MergeOutcome::Ignore => {}
            MergeOutcome::Insert | MergeOutcome::Overwrite => {
                let deleted_at = envelope.is_tombstone.then_some(envelope.updated_at.as_str());
                store.upsert_by_uuid(
                    &entry_uuid,
                    envelope.profile_id as i64,
                    &envelope.label,
                    &local_ciphertext,
                    &local_nonce,
                    &envelope.updated_at,
                    deleted_at,
                    envelope.sync_version as i64,
                )?;
                applied += 1;
            }
        }
    }
    Ok(IngestSummary {
        received: envelopes.len(),
        applied,
    })
}

// ---------------------------------------------------------------------
// Chunked transfer (§4.6)
// ---------------------------------------------------------------------

pub struct ChunkSender {
    chunks: Vec<Chunk>,
    next: usize,
}

impl ChunkSender {
    pub fn new(bundle: &[u8]) -> Self {
        Self {
            chunks: wire::chunk(bundle),
            next: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.chunks.len()
    }

    /// The next on-wire frame to write to `DataTransfer`, or `None` once
    /// every chunk has been handed out.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.get(self.next)?;
        let frame = chunk.encode();
        self.next += 1;
        Some(frame)
    }
}

pub struct ChunkReceiver {
    reassembler: Reassembler,
    since_last_ack: usize,
}

impl ChunkReceiver {
    pub fn new() -> Self {
        Self {
            reassembler: Reassembler::new(),
            since_last_ack: 0,
        }
    }

    /// Feed one on-wire frame. Returns `(message_complete, should_ack)` —
    /// `should_ack` fires every [`ACK_WINDOW`] chunks or at completion
    /// (§4.7 step 5); a framing error propagates as `FramingError` and the
    /// caller is expected to send `ABORT`.
    pub fn accept_frame(&mut self, frame: &[u8]) -> VaultResult<(bool, bool)> {
        let chunk = Chunk::decode(frame)?;
        let done = self.reassembler.accept(chunk)?;
        self.since_last_ack += 1;
        let should_ack = done || self.since_last_ack >= ACK_WINDOW;
        if should_ack {
            self.since_last_ack = 0;
        }
        Ok((done, should_ack))
    }

    pub fn finish(self) -> VaultResult<Vec<u8>> {
        self.reassembler.finish()
    }
}

impl Default for ChunkReceiver {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Tagged state machine (§9 redesign note)
// ---------------------------------------------------------------------

/// Internal engine state. Holds key material directly (never cloned out
/// except into a single encrypt/decrypt call) and is never handed to the
/// UI as-is — see [`SyncSnapshot`] for what the UI actually reads.
enum Phase {
    Idle,
    Discovering,
    Connected,
    ModeKnown(Mode),
    AwaitingPeerPublicKey(PairingInit),
    AwaitingCodeEntry { peer_public: [u8; PUBLIC_KEY_LEN] },
    Paired { session_key: Zeroizing<[u8; 32]>, peer_public: [u8; PUBLIC_KEY_LEN] },
    Transferring { session_key: Zeroizing<[u8; 32]>, receiver: ChunkReceiver },
    Complete { summary: IngestSummary },
    Error(SyncErrorKind),
}

/// What the UI reads back via a single snapshot call (§9 "tagged sync
/// state with data payload") — never exposes key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSnapshot {
    Idle,
    Discovering,
    Connected,
    ConfirmCode { code: String },
    EnterCode,
    Paired,
    Transferring,
    Complete { entries_sent: usize, entries_received: usize },
    Error { kind: SyncErrorKind },
}

/// Drives one sync session end to end. Owns its adapter handle exclusively
/// while non-idle (§5) — a caller attempting to start a second sync while
/// one is active gets `Busy` from the owning `Vault`, not from here.
pub struct SyncEngine {
    role: Role,
    mode: Option<Mode>,
    phase: Phase,
    started_at: std::time::Instant,
    overall_timeout: std::time::Duration,
}

impl SyncEngine {
    pub fn new(role: Role, overall_timeout: std::time::Duration) -> Self {
        Self {
            role,
            mode: None,
            phase: Phase::Idle,
            started_at: std::time::Instant::now(),
            overall_timeout,
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        match &self.phase {
            Phase::Idle => SyncSnapshot::Idle,
            Phase::Discovering => SyncSnapshot::Discovering,
            Phase::Connected | Phase::ModeKnown(_) => SyncSnapshot::Connected,
            Phase::AwaitingPeerPublicKey(init) => SyncSnapshot::ConfirmCode { code: init.code.clone() },
            Phase::AwaitingCodeEntry { .. } => SyncSnapshot::EnterCode,
            Phase::Paired { .. } => SyncSnapshot::Paired,
            Phase::Transferring { .. } => SyncSnapshot::Transferring,
            Phase::Complete { summary } => SyncSnapshot::Complete {
                entries_sent: summary.received,
                entries_received: summary.applied,
            },
            Phase::Error(kind) => SyncSnapshot::Error { kind: *kind },
        }
    }

    /// Start discovery. Peripheral advertises with `mode` fixed for this
    /// session; central scans and orients off whatever `Mode` it reads
    /// back once connected.
    pub fn start(&mut self, mode: Mode) -> Vec<BleAction> {
        self.mode = Some(mode);
        self.started_at = std::time::Instant::now();
        self.phase = Phase::Discovering;
        match self.role {
            Role::Peripheral => vec![BleAction::StartAdvertising],
            Role::Central => vec![BleAction::StartScanning],
        }
    }

    fn abort(&mut self, kind: SyncErrorKind) -> Vec<BleAction> {
        self.phase = Phase::Error(kind);
        vec![
            BleAction::WriteCharacteristic {
                characteristic: Characteristic::SyncControl,
                value: vec![ControlOp::Abort.to_byte()],
            },
            BleAction::Disconnect,
        ]
    }

    /// Consumes one inbound event and returns the actions the adapter
    /// should perform next. `Cancel` and `Timeout` are accepted from any
    /// non-idle phase.
    pub fn handle_event(&mut self, event: BleEvent) -> VaultResult<Vec<BleAction>> {
        let mid_session = !matches!(self.phase, Phase::Idle | Phase::Complete { .. } | Phase::Error(_));
        if mid_session && self.started_at.elapsed() > self.overall_timeout {
            return Ok(self.abort(SyncErrorKind::Timeout));
        }

        match event {
            BleEvent::Cancel => Ok(self.abort(SyncErrorKind::Cancelled)),
            BleEvent::Timeout => Ok(self.abort(SyncErrorKind::Timeout)),
            BleEvent::Discovered(_) => Ok(vec![]),

            BleEvent::Connected => {
                self.phase = Phase::Connected;
                match self.role {
                    Role::Central => Ok(vec![BleAction::ReadCharacteristic { characteristic: Characteristic::Mode }]),
                    Role::Peripheral => {
                        let init = peripheral_init_pairing();
                        let write_value = init.keypair.public_key_compressed().to_vec();
                        let code = init.code.clone();
                        self.phase = Phase::AwaitingPeerPublicKey(init);
                        Ok(vec![
                            BleAction::DisplayPairingCode { code },
                            BleAction::WriteCharacteristic {
                                characteristic: Characteristic::Pairing,
                                value: write_value,
                            },
                        ])
                    }
                }
            }

            BleEvent::CharacteristicValue { characteristic: Characteristic::Mode, value } => {
                let mode = value
                    .first()
                    .and_then(|b| Mode::from_byte(*b))
                    .ok_or(VaultError::Sync(SyncErrorKind::FramingError))?;
                self.mode = Some(mode);
                self.phase = Phase::ModeKnown(mode);
                Ok(vec![BleAction::ReadCharacteristic { characteristic: Characteristic::Pairing }])
            }

            BleEvent::CharacteristicValue { characteristic: Characteristic::Pairing, value } => {
                match mem::replace(&mut self.phase, Phase::Idle) {
                    Phase::ModeKnown(mode) if self.role == Role::Central => {
                        if value.len() != PUBLIC_KEY_LEN {
                            self.phase = Phase::Error(SyncErrorKind::FramingError);
                            return Ok(vec![BleAction::Disconnect]);
                        }
                        let mut peer_public = [0u8; PUBLIC_KEY_LEN];
                        peer_public.copy_from_slice(&value);
                        self.mode = Some(mode);
                        self.phase = Phase::AwaitingCodeEntry { peer_public };
                        Ok(vec![BleAction::PromptForPairingCode])
                    }
                    Phase::AwaitingPeerPublicKey(init) if self.role == Role::Peripheral => {
                        match peripheral_verify_and_derive(&init, &value) {
                            Ok((peer_public, session_key)) => {
                                self.phase = Phase::Paired { session_key, peer_public };
                                Ok(vec![])
                            }
                            Err(VaultError::Sync(kind)) => Ok(self.abort(kind)),
                            Err(e) => Err(e),
                        }
                    }
                    other => {
                        self.phase = other;
                        Err(VaultError::Sync(SyncErrorKind::FramingError))
                    }
                }
            }

            BleEvent::PairingCodeEntered(code) => match mem::replace(&mut self.phase, Phase::Idle) {
                Phase::AwaitingCodeEntry { peer_public } if self.role == Role::Central => {
                    let response = central_respond_to_pairing(&code);
                    let session_key = response.keypair.derive_session_key(&peer_public)?;
                    let wire_value = response.wire_value.clone();
                    self.phase = Phase::Paired { session_key, peer_public };
                    Ok(vec![BleAction::WriteCharacteristic {
                        characteristic: Characteristic::Pairing,
                        value: wire_value,
                    }])
                }
                other => {
                    self.phase = other;
                    Err(VaultError::Conflict)
                }
            },

            BleEvent::CharacteristicValue { characteristic: Characteristic::SyncControl, value }
            | BleEvent::Notification { characteristic: Characteristic::SyncControl, value } => {
                match value.first().copied().and_then(ControlOp::from_byte) {
                    Some(ControlOp::Abort) => Ok(self.abort(SyncErrorKind::PeerAbort)),
                    Some(ControlOp::Start) => {
                        if let Phase::Paired { session_key, .. } = mem::replace(&mut self.phase, Phase::Idle) {
                            self.phase = Phase::Transferring {
                                session_key,
                                receiver: ChunkReceiver::new(),
                            };
                        }
                        Ok(vec![])
                    }
                    Some(ControlOp::Complete) => Ok(vec![]),
                    // Unknown or ACK opcodes require no phase change here;
                    // ACK bookkeeping lives with the sender driving
                    // `ChunkSender` directly, not in this transition.
                    Some(ControlOp::Ack) | None => Ok(vec![]),
                }
            }

            BleEvent::CharacteristicValue { characteristic: Characteristic::DataTransfer, value }
            | BleEvent::Notification { characteristic: Characteristic::DataTransfer, value } => match &mut self.phase {
                Phase::Transferring { receiver, .. } => match receiver.accept_frame(&value) {
                    Ok((false, should_ack)) => Ok(if should_ack {
                        vec![BleAction::WriteCharacteristic {
                            characteristic: Characteristic::SyncControl,
                            value: vec![ControlOp::Ack.to_byte()],
                        }]
                    } else {
                        vec![]
                    }),
                    Ok((true, _)) => Ok(vec![BleAction::WriteCharacteristic {
                        characteristic: Characteristic::SyncControl,
                        value: vec![ControlOp::Ack.to_byte()],
                    }]),
                    Err(VaultError::Sync(kind)) => Ok(self.abort(kind)),
                    Err(e) => Err(e),
                },
                _ => Err(VaultError::Sync(SyncErrorKind::FramingError)),
            },

            BleEvent::Notification { .. } | BleEvent::CharacteristicValue { .. } => Ok(vec![]),
            BleEvent::Disconnected => {
                if !matches!(self.phase, Phase::Complete { .. } | Phase::Error(_)) {
                    self.phase = Phase::Error(SyncErrorKind::PeerAbort);
                }
                Ok(vec![])
            }
        }
    }

    /// Take ownership of the reassembled bundle once the transfer phase
    /// has seen its final chunk, decrypting and merging it via `ingest`.
    /// Leaves the engine `Complete`.
    pub fn finish_transfer(&mut self, ingest: impl FnOnce(&[u8; 32], Vec<u8>) -> VaultResult<IngestSummary>) -> VaultResult<IngestSummary> {
        match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Transferring { session_key, receiver } => {
                let bundle = receiver.finish()?;
                match ingest(&session_key, bundle) {
                    Ok(summary) => {
                        self.phase = Phase::Complete { summary };
                        Ok(summary)
                    }
                    Err(e) => {
                        self.phase = Phase::Error(SyncErrorKind::FramingError);
                        Err(e)
                    }
                }
            }
            other => {
                self.phase = other;
                Err(VaultError::Sync(SyncErrorKind::FramingError))
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Complete { .. } | Phase::Error(_))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// True when this end is the one that pushes the bundle onto the wire
    /// for the active `mode` (§4.6: peripheral sends on push, central
    /// sends on pull). Only meaningful once `mode` is known.
    pub fn is_sender(&self) -> bool {
        match (self.role, self.mode) {
            (Role::Peripheral, Some(Mode::Push)) => true,
            (Role::Central, Some(Mode::Pull)) => true,
            _ => false,
        }
    }

    /// The session key once pairing has completed, for a caller driving
    /// the sender side directly (building and chunking the bundle is not
    /// modeled inside `handle_event` — see module docs).
    pub fn session_key(&self) -> Option<&[u8; 32]> {
        match &self.phase {
            Phase::Paired { session_key, .. } | Phase::Transferring { session_key, .. } => Some(session_key),
            _ => None,
        }
    }

    pub fn peer_public_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        match &self.phase {
            Phase::Paired { peer_public, .. } => Some(*peer_public),
            Phase::Transferring { .. } | Phase::Complete { .. } => None,
            _ => None,
        }
    }

    /// Used by the sender side once it has written every chunk and seen
    /// the receiver's final ACK (or, for the receiver, once
    /// `finish_transfer` has ingested the bundle): moves the engine to
    /// `Complete` so `is_busy` releases and the snapshot reflects the
    /// outcome.
    pub fn force_complete(&mut self, summary: IngestSummary) {
        self.phase = Phase::Complete { summary };
    }
}

// ---------------------------------------------------------------------
// In-process orchestration (used by integration tests and a same-host
// embedding that skips real BLE transport)
// ---------------------------------------------------------------------

pub struct SyncPeer<'a> {
    pub device_id: String,
    pub device_name: String,
    pub store: &'a Store,
    pub vault_key: &'a [u8; 32],
    /// The sender's active profile — only entries in this profile are
    /// collected into the bundle (§4.7 step 4).
    pub profile_id: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    pub entries_sent: usize,
    pub entries_received: usize,
    pub status: SyncStatus,
}

/// Runs one complete push sync (sender -> receiver) in-process: pairing,
/// bundle build, chunked transfer (optionally corrupting one chunk), and
/// ingestion, recording a `SyncLogEntry` on both sides. `entered_code` is
/// what the receiver's user typed in — pass the sender's real code for
/// the happy path, anything else to exercise §4.7 step 3's mismatch path.
pub fn simulate_push_sync(
    sender: &SyncPeer,
    receiver: &SyncPeer,
    entered_code: &str,
    corrupt_chunk_index: Option<usize>,
) -> VaultResult<(SyncOutcome, SyncOutcome)> {
    let started_at = store::now_iso8601();
    let init = peripheral_init_pairing();
    let peripheral_public = init.keypair.public_key_compressed();
    let central = central_respond_to_pairing(entered_code);

    let (peripheral_public_confirmed, session_key_sender) = match peripheral_verify_and_derive(&init, &central.wire_value) {
        Ok(v) => v,
        Err(VaultError::Sync(kind)) => return Ok(log_both_failed(sender, receiver, &started_at, kind, None)),
        Err(e) => return Err(e),
    };
    let session_key_receiver = central_derive_session_key(&central, &peripheral_public)?;
    debug_assert_eq!(*session_key_sender, *session_key_receiver);

    let bundle = build_bundle(sender.store, sender.profile_id, sender.vault_key, &session_key_sender)?;
    let sent_envelopes = wire::decode_bundle(&bundle)?.len();

    let mut chunk_sender = ChunkSender::new(&bundle);
    let mut chunk_receiver = ChunkReceiver::new();
    let mut index = 0usize;
    let transfer_result: VaultResult<()> = loop {
        let Some(mut frame) = chunk_sender.next_frame() else {
            break Ok(());
        };
        if Some(index) == corrupt_chunk_index {
            let last = frame.len() - 1;
            frame[last] ^= 0xFF;
        }
        match chunk_receiver.accept_frame(&frame) {
            Ok((true, _)) => break Ok(()),
            Ok((false, _)) => {}
            Err(e) => break Err(e),
        }
        index += 1;
    };

    if let Err(VaultError::Sync(kind)) = transfer_result {
        return Ok(log_both_failed(sender, receiver, &started_at, kind, Some(peripheral_public_confirmed)));
    }
    transfer_result?;

    let reassembled = chunk_receiver.finish()?;
    let summary = ingest_bundle(receiver.store, receiver.vault_key, &session_key_receiver, &reassembled)?;

    let completed_at = store::now_iso8601();
    upsert_peers(sender, receiver, &peripheral_public_confirmed, &completed_at);

    sender.store.append_sync_log(&SyncLogEntry {
        id: 0,
        device_id: receiver.device_id.clone(),
        direction: SyncDirection::Push,
        entries_sent: sent_envelopes as i64,
        entries_received: 0,
        status: SyncStatus::Success,
        started_at: started_at.clone(),
        completed_at: Some(completed_at.clone()),
        error_message: None,
    })?;
    receiver.store.append_sync_log(&SyncLogEntry {
        id: 0,
        device_id: sender.device_id.clone(),
        direction: SyncDirection::Pull,
        entries_sent: 0,
        entries_received: summary.applied as i64,
        status: SyncStatus::Success,
        started_at,
        completed_at: Some(completed_at),
        error_message: None,
    })?;

    Ok((
        SyncOutcome {
            entries_sent: sent_envelopes,
            entries_received: 0,
            status: SyncStatus::Success,
        },
        SyncOutcome {
            entries_sent: 0,
            entries_received: summary.applied,
            status: SyncStatus::Success,
        },
    ))
}

fn upsert_peers(sender: &SyncPeer, receiver: &SyncPeer, peripheral_public: &[u8; PUBLIC_KEY_LEN], at: &str) {
    let _ = sender.store.upsert_paired_device(&PairedDevice {
        device_id: receiver.device_id.clone(),
        device_name: receiver.device_name.clone(),
        public_key: peripheral_public.to_vec(),
        shared_secret: None,
        paired_at: at.to_string(),
        last_sync_at: Some(at.to_string()),
    });
    let _ = receiver.store.upsert_paired_device(&PairedDevice {
        device_id: sender.device_id.clone(),
        device_name: sender.device_name.clone(),
        public_key: peripheral_public.to_vec(),
        shared_secret: None,
        paired_at: at.to_string(),
        last_sync_at: Some(at.to_string()),
    });
}

fn log_both_failed(
    sender: &SyncPeer,
    receiver: &SyncPeer,
    started_at: &str,
    kind: SyncErrorKind,
    pairing_confirmed: Option<[u8; PUBLIC_KEY_LEN]>,
) -> (SyncOutcome, SyncOutcome) {
    let completed_at = store::now_iso8601();
    if let Some(peripheral_public) = pairing_confirmed {
        upsert_peers(sender, receiver, &peripheral_public, &completed_at);
    }
    let _ = sender.store.append_sync_log(&SyncLogEntry {
        id: 0,
        device_id: receiver.device_id.clone(),
        direction: SyncDirection::Push,
        entries_sent: 0,
        entries_received: 0,
        status: SyncStatus::Failed,
        started_at: started_at.to_string(),
        completed_at: Some(completed_at.clone()),
        error_message: Some(kind.to_string()),
    });
    let _ = receiver.store.append_sync_log(&SyncLogEntry {
        id: 0,
        device_id: sender.device_id.clone(),
        direction: SyncDirection::Pull,
        entries_sent: 0,
        entries_received: 0,
        status: SyncStatus::Failed,
        started_at: started_at.to_string(),
        completed_at: Some(completed_at),
        error_message: Some(kind.to_string()),
    });
    let outcome = SyncOutcome {
        entries_sent: 0,
        entries_received: 0,
        status: SyncStatus::Failed,
    };
    (outcome, outcome)
}
