//! Cryptographic primitives. Every other module in this crate builds on
//! exactly these functions; nothing reaches for a cipher or a hash
//! directly.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::{EncodedPoint, PublicKey};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{VaultError, VaultResult};

type HmacSha256 = Hmac<Sha256>;

/// Argon2id parameters mandated for both the authentication hash and the
/// encryption-key derivation. Both devices MUST agree on these for
/// cross-device compatibility; they are not configurable.
const ARGON2_MEMORY_KIB: u32 = 19456;
const ARGON2_TIME_COST: u32 = 2;
const ARGON2_PARALLELISM: u32 = 1;
const ARGON2_OUTPUT_LEN: usize = 32;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

fn argon2() -> VaultResult<Argon2<'static>> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(ARGON2_OUTPUT_LEN),
    )
    .map_err(|e| {
        tracing::error!(error = %e, "argon2 params construction failed");
        VaultError::Store("key derivation unavailable".into())
    })?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password for storage as an authentication credential. Returns a
/// PHC-encoded string; verify by re-parsing it with [`verify_password`].
pub fn hash_password(password: &str, salt: &[u8; 16]) -> VaultResult<String> {
    let salt_string = SaltString::encode_b64(salt).map_err(|e| {
        tracing::error!(error = %e, "salt encoding failed");
        VaultError::Store("key derivation unavailable".into())
    })?;
    let hash = argon2()?
        .hash_password(password.as_bytes(), &salt_string)
        .map_err(|e| {
            tracing::error!(error = %e, "password hash failed");
            VaultError::Store("key derivation unavailable".into())
        })?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, phc: &str) -> bool {
    let Ok(hash) = PasswordHash::new(phc) else {
        return false;
    };
    argon2()
        .map(|a| a.verify_password(password.as_bytes(), &hash).is_ok())
        .unwrap_or(false)
}

/// Derive the 32-byte at-rest encryption key from the master password and
/// the user's `encryption_salt`. Independent of [`hash_password`]'s salt so
/// the authentication hash can never be used to recover the data key.
pub fn derive_encryption_key(password: &str, encryption_salt: &[u8]) -> VaultResult<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    argon2()?
        .hash_password_into(password.as_bytes(), encryption_salt, &mut *key)
        .map_err(|e| {
            tracing::error!(error = %e, "encryption key derivation failed");
            VaultError::Store("key derivation unavailable".into())
        })?;
    Ok(key)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// AES-256-GCM encrypt. Returns a fresh random nonce and a single
/// contiguous ciphertext-with-tag buffer (tag is the last 16 bytes).
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> VaultResult<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce_bytes = random_bytes::<NONCE_LEN>();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|e| {
        tracing::error!(error = %e, "encryption failed");
        VaultError::Decrypt
    })?;
    Ok((nonce_bytes, ciphertext))
}

/// AES-256-GCM decrypt. Fails closed (`Decrypt`) on any tag mismatch,
/// truncated nonce, or truncated ciphertext — never distinguishes the
/// cause.
pub fn decrypt(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(VaultError::Decrypt);
    }
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::Decrypt)
}

/// HMAC-SHA256 over `data`, keyed by `key`. Used for the pairing MAC
/// (§4.1) and anywhere else a plain authentication tag is needed.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// An ephemeral P-256 keypair, generated fresh per pairing attempt.
pub struct EphemeralKeypair {
    secret: EphemeralSecret,
    public_compressed: [u8; 33],
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = EncodedPoint::from(secret.public_key());
        let compressed = public.compress();
        let mut public_compressed = [0u8; 33];
        public_compressed.copy_from_slice(compressed.as_bytes());
        Self {
            secret,
            public_compressed,
        }
    }

    pub fn public_key_compressed(&self) -> [u8; 33] {
        self.public_compressed
    }

    /// Perform ECDH against a peer's compressed public key and derive the
    /// 32-byte session key via HKDF-SHA256 (empty salt,
    /// `info = "vibevault-sync-v1"`).
    pub fn derive_session_key(&self, peer_public_compressed: &[u8; 33]) -> VaultResult<Zeroizing<[u8; 32]>> {
        let encoded = EncodedPoint::from_bytes(peer_public_compressed).map_err(|e| {
            tracing::warn!(error = %e, "invalid peer public key encoding");
            VaultError::Sync(crate::error::SyncErrorKind::CryptoMismatch)
        })?;
        let peer_public = PublicKey::from_sec1_bytes(encoded.as_bytes()).map_err(|e| {
            tracing::warn!(error = %e, "invalid peer public key point");
            VaultError::Sync(crate::error::SyncErrorKind::CryptoMismatch)
        })?;
        let shared = self.secret.diffie_hellman(&peer_public);
        let mut okm = Zeroizing::new([0u8; 32]);
        let hk = Hkdf::<Sha256>::new(None, shared.raw_secret_bytes());
        hk.expand(b"vibevault-sync-v1", &mut *okm).map_err(|e| {
            tracing::error!(error = %e, "HKDF expand failed");
            VaultError::Sync(crate::error::SyncErrorKind::CryptoMismatch)
        })?;
        Ok(okm)
    }
}

/// IEEE CRC32 (poly 0xEDB88320, init/final-XOR 0xFFFFFFFF), little-endian
/// on the wire.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
