//! GATT identifiers and the transport-facing types the sync state machine
//! (`crate::sync`) is driven by (§4.6, §9). The state machine itself is a
//! pure `(state, event) -> (state, actions)` function; everything here is
//! either a wire constant or a side-effect description — no I/O happens in
//! this module except inside the optional `ble-hardware` adapter.

use uuid::Uuid;

fn uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).expect("hardcoded UUID literal is well-formed")
}

pub fn service_uuid() -> Uuid {
    uuid("A1B2C3D4-E5F6-7890-ABCD-EF0123456789")
}

/// The four fixed GATT characteristics, bit-compatible across both
/// platform implementations of this protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Mode,
    Pairing,
    SyncControl,
    DataTransfer,
}

impl Characteristic {
    pub fn uuid(self) -> Uuid {
        let s = match self {
            Characteristic::Mode => "A1B2C3D4-E5F6-7890-ABCD-EF012345678A",
            Characteristic::Pairing => "A1B2C3D4-E5F6-7890-ABCD-EF012345678B",
            Characteristic::SyncControl => "A1B2C3D4-E5F6-7890-ABCD-EF012345678C",
            Characteristic::DataTransfer => "A1B2C3D4-E5F6-7890-ABCD-EF012345678D",
        };
        uuid(s)
    }
}

/// The byte written to the `Mode` characteristic: which direction the
/// peripheral intends for this sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Push = 0x01,
    Pull = 0x02,
}

impl Mode {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Mode::Push),
            0x02 => Some(Mode::Pull),
            _ => None,
        }
    }
}

/// Opcodes on the `SyncControl` characteristic. Unknown opcodes MUST be
/// ignored by the receiver rather than treated as an error (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Start = 0x01,
    Ack = 0x02,
    Abort = 0x03,
    Complete = 0x04,
}

impl ControlOp {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(ControlOp::Start),
            0x02 => Some(ControlOp::Ack),
            0x03 => Some(ControlOp::Abort),
            0x04 => Some(ControlOp::Complete),
            _ => None,
        }
    }
}

/// Which of the two roles a device is acting as for this connection.
/// Desktop is always a peripheral/advertiser; mobile is always a
/// central/scanner (§4.6) — the roles are not negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Peripheral,
    Central,
}

/// One candidate peer surfaced during discovery, before a connection is
/// made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub device_id: String,
    pub device_name: String,
}

/// Inbound occurrences fed into the sync state machine's transition
/// function. An adapter (real BLE or a test fake) translates platform
/// callbacks into this enum; the state machine never touches a BLE API
/// directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleEvent {
    Discovered(DiscoveredPeer),
    Connected,
    Disconnected,
    /// A central's read of one of the peripheral's characteristics
    /// completed, or a peripheral observed a central's write.
    CharacteristicValue { characteristic: Characteristic, value: Vec<u8> },
    /// A notification arrived on a subscribed characteristic.
    Notification { characteristic: Characteristic, value: Vec<u8> },
    /// The pairing code, as entered by the person using the central.
    PairingCodeEntered(String),
    Timeout,
    Cancel,
}

/// Outbound side effects the state machine asks its adapter to perform.
/// Pure — the transition function returns these instead of calling out
/// directly, so the core logic is testable without any BLE hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleAction {
    StartAdvertising,
    StartScanning,
    Connect { device_id: String },
    ReadCharacteristic { characteristic: Characteristic },
    WriteCharacteristic { characteristic: Characteristic, value: Vec<u8> },
    Subscribe { characteristic: Characteristic },
    Notify { characteristic: Characteristic, value: Vec<u8> },
    Disconnect,
    /// Surface the locally generated pairing code to the person using the
    /// peripheral device.
    DisplayPairingCode { code: String },
    /// Ask the person using the central device to type in the code shown
    /// on the peripheral.
    PromptForPairingCode,
}

/// Abstraction over the platform GATT stack. A real implementation lives
/// behind the `ble-hardware` feature; tests drive the state machine with
/// an in-memory fake that loops `BleAction`s from one side into
/// `BleEvent`s on the other.
pub trait GattAdapter {
    fn role(&self) -> Role;
    fn dispatch(&mut self, action: BleAction) -> crate::error::VaultResult<()>;
}

#[cfg(feature = "ble-hardware")]
pub mod hardware {
    //! Production adapter over `btleplug`. Exercising this requires live
    //! BLE hardware the crate's own test suite never has; it is compiled
    //! only under the `ble-hardware` feature and is not part of the
    //! unit/integration test surface.
    use super::*;
    use crate::error::{SyncErrorKind, VaultError, VaultResult};
    use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
    use btleplug::platform::Manager;

    /// Central-role adapter: scans for the fixed service UUID and talks to
    /// whichever device the application layer selects from the discovery
    /// list.
    pub struct CentralAdapter {
        manager: Manager,
    }

    impl CentralAdapter {
        pub async fn new() -> VaultResult<Self> {
            let manager = Manager::new().await.map_err(|e| {
                tracing::error!(error = %e, "failed to initialize BLE manager");
                VaultError::Sync(SyncErrorKind::Timeout)
            })?;
            Ok(Self { manager })
        }

        pub async fn scan(&self) -> VaultResult<()> {
            let adapters = self.manager.adapters().await.map_err(|e| {
                tracing::error!(error = %e, "no BLE adapter available");
                VaultError::Sync(SyncErrorKind::Timeout)
            })?;
            let adapter = adapters
                .into_iter()
                .next()
                .ok_or(VaultError::Sync(SyncErrorKind::Timeout))?;
            adapter
                .start_scan(ScanFilter {
                    services: vec![service_uuid()],
                })
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "BLE scan failed to start");
                    VaultError::Sync(SyncErrorKind::Timeout)
                })
        }
    }

    impl GattAdapter for CentralAdapter {
        fn role(&self) -> Role {
            Role::Central
        }

        fn dispatch(&mut self, _action: BleAction) -> VaultResult<()> {
            // Real dispatch requires an async executor at the call site;
            // the synchronous `GattAdapter` surface is satisfied by the
            // in-memory fake used in tests. A production embedder drives
            // `scan`/characteristic I/O directly against `btleplug` from
            // its own async runtime and feeds results back as `BleEvent`s.
            Ok(())
        }
    }
}
