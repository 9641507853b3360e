// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Encryption and integrity checksums for cache values.
//!
//! - **AES-256-GCM** (ring) with a random 96-bit nonce per value. Sealed
//!   layout is `nonce || ciphertext || tag`.
//! - **HMAC-SHA256** checksums over length-prefixed parts, hex encoded.
//! - Both keys are derived from one master secret with HKDF-SHA256, so the
//!   encryption key is never used as a MAC key.

use std::fmt;

use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted master secret length.
pub const MIN_SECRET_LEN: usize = 32;

const HKDF_SALT: &[u8] = b"opguard.cache.v1";
const ENCRYPTION_INFO: &[u8] = b"encryption";
const CHECKSUM_INFO: &[u8] = b"checksum";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("master secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("random nonce generation failed")]
    Randomness,

    #[error("encryption failed")]
    Seal,

    /// Ciphertext was truncated, tampered with, or sealed under another key.
    #[error("decryption failed")]
    Open,
}

struct KeyLen(usize);

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn derive_key(secret: &[u8], info: &[u8]) -> Result<[u8; 32], CipherError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT).extract(secret);
    let info = [info];
    let okm = prk
        .expand(&info, KeyLen(32))
        .map_err(|_| CipherError::KeyDerivation)?;
    let mut key = [0u8; 32];
    okm.fill(&mut key).map_err(|_| CipherError::KeyDerivation)?;
    Ok(key)
}

/// Authenticated encryption plus keyed checksums.
pub struct Cipher {
    key: LessSafeKey,
    mac: HmacSha256,
    rng: SystemRandom,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Derive encryption and checksum keys from a master secret.
    pub fn from_secret(secret: &[u8]) -> Result<Self, CipherError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(CipherError::WeakSecret);
        }
        let enc_key = derive_key(secret, ENCRYPTION_INFO)?;
        let mac_key = derive_key(secret, CHECKSUM_INFO)?;
        let unbound =
            UnboundKey::new(&AES_256_GCM, &enc_key).map_err(|_| CipherError::KeyDerivation)?;
        let mac = <HmacSha256 as Mac>::new_from_slice(&mac_key)
            .map_err(|_| CipherError::KeyDerivation)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            mac,
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt `plaintext`, binding it to `aad` (the cache key).
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CipherError::Randomness)?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| CipherError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    /// Decrypt a value produced by [`Cipher::encrypt`] with the same `aad`.
    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CipherError::Open);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CipherError::Open)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| CipherError::Open)?;
        Ok(plaintext.to_vec())
    }

    fn mac(&self, parts: &[&[u8]]) -> HmacSha256 {
        let mut mac = self.mac.clone();
        for part in parts {
            mac.update(&(part.len() as u64).to_be_bytes());
            mac.update(part);
        }
        mac
    }

    /// Keyed checksum over `parts`, hex encoded.
    pub fn checksum(&self, parts: &[&[u8]]) -> String {
        hex::encode(self.mac(parts).finalize().into_bytes())
    }

    /// Constant-time comparison against a checksum produced by [`Cipher::checksum`].
    pub fn verify_checksum(&self, parts: &[&[u8]], expected_hex: &str) -> bool {
        match hex::decode(expected_hex) {
            Ok(expected) => self.mac(parts).verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}
