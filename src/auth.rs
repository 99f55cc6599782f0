//! Registration, unlock, session ownership, rate limiting, and the
//! inactivity sweeper (§4.3, §5, §9 "shared mutable session registry").
//!
//! The token -> key map lives behind one mutex-guarded [`SessionRegistry`]
//! rather than an ambient singleton; every call that needs the
//! encryption key goes through it explicitly. Key material never leaves
//! as a `&[u8; 32]` borrow held across a store call — callers take a
//! short-lived [`zeroize::Zeroizing`] copy and let it drop.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use data_encoding::HEXLOWER;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{VaultError, VaultResult};
use crate::store::{Store, User};

/// Minimum lockout after the 5th consecutive failure, doubling per
/// additional failure and capped at 15 minutes (§4.3).
const BASE_COOLDOWN_SECS: u64 = 30;
const MAX_COOLDOWN_SECS: u64 = 15 * 60;
const FAILURES_BEFORE_LOCKOUT: u32 = 5;

fn new_token() -> String {
    HEXLOWER.encode(&crypto::random_bytes::<16>())
}

struct RateLimitState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl RateLimitState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    /// Seconds still remaining in the cooldown, if any.
    fn cooldown_remaining(&self) -> Option<u64> {
        if self.consecutive_failures < FAILURES_BEFORE_LOCKOUT {
            return None;
        }
        let extra = self.consecutive_failures - FAILURES_BEFORE_LOCKOUT;
        let window = BASE_COOLDOWN_SECS
            .saturating_mul(1u64 << extra.min(16))
            .min(MAX_COOLDOWN_SECS);
        let last = self.last_failure?;
        let elapsed = last.elapsed().as_secs();
        if elapsed >= window {
            None
        } else {
            Some(window - elapsed)
        }
    }
}

/// Sliding per-username failure counter guarding `unlock_vault` (§4.3).
pub struct RateLimiter {
    state: Mutex<HashMap<String, RateLimitState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    fn check(&self, username: &str) -> VaultResult<()> {
        let state = self.state.lock().expect("rate limiter mutex poisoned");
        if let Some(entry) = state.get(username) {
            if let Some(remaining) = entry.cooldown_remaining() {
                return Err(VaultError::TooManyAttempts(remaining));
            }
        }
        Ok(())
    }

    fn record_failure(&self, username: &str) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        let entry = state.entry(username.to_string()).or_insert_with(RateLimitState::new);
        entry.consecutive_failures += 1;
        entry.last_failure = Some(Instant::now());
    }

    fn record_success(&self, username: &str) {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        state.remove(username);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory session state held by the registry. Never serialized, never
/// logged; the key is zeroized when the entry is dropped.
struct Session {
    username: String,
    key: Zeroizing<[u8; 32]>,
    active_profile_id: Option<i64>,
    last_activity: Instant,
}

/// Token -> session map, serialized behind one mutex (§5 "session table").
/// The session's key never crosses the UI boundary — only the opaque
/// token does.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    fn create(&self, username: &str, key: Zeroizing<[u8; 32]>) -> String {
        let token = new_token();
        let session = Session {
            username: username.to_string(),
            key,
            active_profile_id: None,
            last_activity: Instant::now(),
        };
        self.sessions
            .lock()
            .expect("session registry mutex poisoned")
            .insert(token.clone(), session);
        token
    }

    /// Validate the token is present and not idle-expired, bumping its
    /// activity clock. Does not hold the session lock across return.
    pub fn touch(&self, token: &str) -> VaultResult<()> {
        let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");
        let session = sessions.get_mut(token).ok_or(VaultError::SessionExpired)?;
        if session.last_activity.elapsed() > self.idle_timeout {
            sessions.remove(token);
            return Err(VaultError::SessionExpired);
        }
        session.last_activity = Instant::now();
        Ok(())
    }

    /// Validate the token and return a short-lived copy of the encryption
    /// key. Every authenticated vault operation both validates and
    /// refreshes the activity clock through this call.
    pub fn encryption_key(&self, token: &str) -> VaultResult<Zeroizing<[u8; 32]>> {
        self.touch(token)?;
        let sessions = self.sessions.lock().expect("session registry mutex poisoned");
        let session = sessions.get(token).ok_or(VaultError::SessionExpired)?;
        Ok(Zeroizing::new(*session.key))
    }

    pub fn username(&self, token: &str) -> VaultResult<String> {
        self.touch(token)?;
        let sessions = self.sessions.lock().expect("session registry mutex poisoned");
        Ok(sessions.get(token).ok_or(VaultError::SessionExpired)?.username.clone())
    }

    pub fn active_profile_id(&self, token: &str) -> VaultResult<Option<i64>> {
        self.touch(token)?;
        let sessions = self.sessions.lock().expect("session registry mutex poisoned");
        Ok(sessions.get(token).ok_or(VaultError::SessionExpired)?.active_profile_id)
    }

    pub fn set_active_profile_id(&self, token: &str, profile_id: i64) -> VaultResult<()> {
        self.touch(token)?;
        let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");
        let session = sessions.get_mut(token).ok_or(VaultError::SessionExpired)?;
        session.active_profile_id = Some(profile_id);
        Ok(())
    }

    /// Eagerly destroy a session, zeroizing its key.
    pub fn invalidate(&self, token: &str) {
        self.sessions.lock().expect("session registry mutex poisoned").remove(token);
    }

    /// Remove every session idle longer than `idle_timeout`. Run
    /// periodically by [`InactivitySweeper`].
    fn sweep(&self) {
        let mut sessions = self.sessions.lock().expect("session registry mutex poisoned");
        sessions.retain(|_, s| s.last_activity.elapsed() <= self.idle_timeout);
    }

    #[cfg(test)]
    fn backdate(&self, token: &str, age: Duration) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(s) = sessions.get_mut(token) {
            s.last_activity = Instant::now() - age;
        }
    }
}

/// Background thread sweeping expired sessions on a fixed interval, shut
/// down cleanly on drop via a condvar rather than a detached loop.
pub struct InactivitySweeper {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl InactivitySweeper {
    pub fn spawn(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown_clone = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*shutdown_clone;
            let mut stopped = lock.lock().expect("sweeper shutdown mutex poisoned");
            loop {
                let (guard, timeout_result) = cvar
                    .wait_timeout(stopped, interval)
                    .expect("sweeper shutdown mutex poisoned");
                stopped = guard;
                if *stopped {
                    return;
                }
                if timeout_result.timed_out() {
                    registry.sweep();
                }
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for InactivitySweeper {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.shutdown;
        *lock.lock().expect("sweeper shutdown mutex poisoned") = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// `register_user` (§6): generates both salts, stores the authentication
/// hash, never stores the password itself.
pub fn register(store: &Store, username: &str, password: &str) -> VaultResult<()> {
    if username.trim().is_empty() {
        return Err(VaultError::validation("username", "must not be empty"));
    }
    if store.is_registered()? {
        return Err(VaultError::AlreadyRegistered);
    }
    let auth_salt = crypto::random_bytes::<16>();
    let encryption_salt = crypto::random_bytes::<32>().to_vec();
    let password_hash = crypto::hash_password(password, &auth_salt)?;
    store.register(&User {
        username: username.to_string(),
        password_hash,
        auth_salt,
        encryption_salt,
    })?;
    tracing::info!(event = "registered", %username, "new user registered");
    Ok(())
}

/// `unlock_vault` (§6): verifies the password, derives the encryption key,
/// and mints a session token. Never returns the key itself.
pub fn unlock(
    store: &Store,
    limiter: &RateLimiter,
    sessions: &SessionRegistry,
    username: &str,
    password: &str,
) -> VaultResult<String> {
    limiter.check(username)?;

    let user = match store.get_user(username) {
        Ok(u) => u,
        Err(VaultError::NotRegistered) => {
            limiter.record_failure(username);
            return Err(VaultError::InvalidCredentials);
        }
        Err(e) => return Err(e),
    };

    if !crypto::verify_password(password, &user.password_hash) {
        limiter.record_failure(username);
        tracing::warn!(event = "unlock_failed", %username, "invalid credentials");
        return Err(VaultError::InvalidCredentials);
    }

    let key = crypto::derive_encryption_key(password, &user.encryption_salt)?;
    limiter.record_success(username);
    let token = sessions.create(username, key);
    tracing::info!(event = "unlocked", %username, "session established");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fresh_store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn register_then_unlock_roundtrip() {
        let store = fresh_store();
        register(&store, "alice", "correct horse battery staple").unwrap();
        let limiter = RateLimiter::new();
        let sessions = SessionRegistry::new(Duration::from_secs(600));
        let token = unlock(&store, &limiter, &sessions, "alice", "correct horse battery staple").unwrap();
        assert!(sessions.encryption_key(&token).is_ok());
    }

    #[test]
    fn register_twice_fails() {
        let store = fresh_store();
        register(&store, "alice", "pw").unwrap();
        assert!(matches!(register(&store, "alice", "pw2"), Err(VaultError::AlreadyRegistered)));
    }

    #[test]
    fn unlock_with_wrong_password_fails() {
        let store = fresh_store();
        register(&store, "alice", "correct horse battery staple").unwrap();
        let limiter = RateLimiter::new();
        let sessions = SessionRegistry::new(Duration::from_secs(600));
        assert!(matches!(
            unlock(&store, &limiter, &sessions, "alice", "wrong"),
            Err(VaultError::InvalidCredentials)
        ));
    }

    #[test]
    fn rate_limit_kicks_in_on_sixth_failure() {
        let store = fresh_store();
        register(&store, "alice", "correct horse battery staple").unwrap();
        let limiter = RateLimiter::new();
        let sessions = SessionRegistry::new(Duration::from_secs(600));
        for _ in 0..5 {
            assert!(unlock(&store, &limiter, &sessions, "alice", "wrong").is_err());
        }
        match unlock(&store, &limiter, &sessions, "alice", "wrong") {
            Err(VaultError::TooManyAttempts(secs)) => assert!(secs >= 30),
            other => panic!("expected TooManyAttempts, got {other:?}"),
        }
    }

    #[test]
    fn successful_unlock_resets_failure_counter() {
        let store = fresh_store();
        register(&store, "alice", "correct horse battery staple").unwrap();
        let limiter = RateLimiter::new();
        let sessions = SessionRegistry::new(Duration::from_secs(600));
        for _ in 0..4 {
            assert!(unlock(&store, &limiter, &sessions, "alice", "wrong").is_err());
        }
        assert!(unlock(&store, &limiter, &sessions, "alice", "correct horse battery staple").is_ok());
        // Counter reset — five more failures are needed before lockout again.
        for _ in 0..4 {
            assert!(unlock(&store, &limiter, &sessions, "alice", "wrong").is_err());
        }
        assert!(limiter.check("alice").is_ok());
    }

    #[test]
    fn expired_session_is_rejected() {
        let sessions = SessionRegistry::new(Duration::from_millis(10));
        let token = sessions.create("alice", Zeroizing::new([1u8; 32]));
        sessions.backdate(&token, Duration::from_secs(1));
        assert!(matches!(sessions.encryption_key(&token), Err(VaultError::SessionExpired)));
    }

    #[test]
    fn touch_activity_extends_session() {
        let sessions = SessionRegistry::new(Duration::from_millis(200));
        let token = sessions.create("alice", Zeroizing::new([1u8; 32]));
        sessions.backdate(&token, Duration::from_millis(150));
        // Still within the window — touching should succeed and refresh it.
        assert!(sessions.touch(&token).is_ok());
        assert!(sessions.encryption_key(&token).is_ok());
    }

    #[test]
    fn lock_vault_destroys_session_immediately() {
        let sessions = SessionRegistry::new(Duration::from_secs(600));
        let token = sessions.create("alice", Zeroizing::new([1u8; 32]));
        sessions.invalidate(&token);
        assert!(matches!(sessions.encryption_key(&token), Err(VaultError::SessionExpired)));
    }

    #[test]
    fn sweeper_evicts_idle_sessions_in_the_background() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_millis(20)));
        let token = registry.create("alice", Zeroizing::new([1u8; 32]));
        registry.backdate(&token, Duration::from_millis(100));
        let _sweeper = InactivitySweeper::spawn(Arc::clone(&registry), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(100));
        assert!(matches!(registry.encryption_key(&token), Err(VaultError::SessionExpired)));
    }
}
