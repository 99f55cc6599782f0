use std::path::PathBuf;
use std::time::Duration;

/// Tunables for one [`crate::Vault`] instance. The embedding application
/// constructs this; there is no file- or environment-backed config layer.
#[derive(Clone, Debug)]
pub struct VaultConfig {
    /// Directory holding the SQLite database file.
    pub data_dir: PathBuf,
    /// Sessions idle longer than this are swept and invalidated.
    pub idle_timeout: Duration,
    /// How often the inactivity sweeper checks for idle sessions.
    pub sweep_interval: Duration,
    /// BLE scan timeout (§5).
    pub scan_timeout: Duration,
    /// Pairing-code entry timeout (§5).
    pub pairing_timeout: Duration,
    /// Per-chunk ACK timeout (§5).
    pub chunk_ack_timeout: Duration,
    /// Overall sync-session timeout (§5).
    pub sync_session_timeout: Duration,
}

impl VaultConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Self::default()
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(30),
            pairing_timeout: Duration::from_secs(60),
            chunk_ack_timeout: Duration::from_secs(5),
            sync_session_timeout: Duration::from_secs(2 * 60),
        }
    }
}
