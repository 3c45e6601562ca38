// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Identity key material: the master seed, the derivation tree hanging
//! off it, and the two recovery paths (credentials via Argon2id, and a
//! BIP39 mnemonic).

use argon2::{Algorithm, Argon2, Params, Version};
use bip39::Mnemonic;
use ed25519_dalek::SigningKey;
use rand::RngExt;
use thiserror::Error;

use crate::{cfg::config::IdentityConfig, models::keys::CubeKey};

/// Derivation context for identity extension cubes. The root signing
/// and encryption contexts are configurable; extension derivation is
/// part of the wire contract and fixed.
pub const EXTENSION_CONTEXT: &str = "MUC extension key";

pub const MASTER_SEED_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    Kdf(&'static str),

    #[error("mnemonic rejected: {0}")]
    Mnemonic(String),

    #[error("master seed does not produce this identity's public key")]
    KeyMismatch,
}

/// The 32-byte root secret every identity key derives from.
#[derive(Clone)]
pub struct MasterSeed([u8; MASTER_SEED_LEN]);

impl MasterSeed {
    pub fn random() -> Self {
        let mut seed = [0u8; MASTER_SEED_LEN];
        rand::rng().fill(&mut seed);
        Self(seed)
    }

    pub const fn from_bytes(bytes: [u8; MASTER_SEED_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_SEED_LEN] {
        &self.0
    }

    /// Recover the seed from login credentials with a memory-hard KDF.
    /// Hardness is configurable; the defaults cost ~64 MiB per guess.
    /// The salt is the blake3 hash of the username, so equal credentials
    /// always recover the same identity.
    pub fn from_credentials(
        username: &str,
        password: &str,
        cpu_hardness: u32,
        memory_hardness_kib: u32,
    ) -> Result<Self, CryptoError> {
        let params = Params::new(memory_hardness_kib, cpu_hardness, 1, Some(MASTER_SEED_LEN))
            .map_err(|_| CryptoError::Kdf("invalid Argon2 parameters"))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let salt = blake3::hash(username.as_bytes());
        let mut seed = [0u8; MASTER_SEED_LEN];
        argon
            .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut seed)
            .map_err(|_| CryptoError::Kdf("Argon2id hashing failed"))?;
        Ok(Self(seed))
    }

    /// Render the seed as a 24-word recovery phrase.
    pub fn to_mnemonic(&self) -> Result<String, CryptoError> {
        Mnemonic::from_entropy(&self.0)
            .map(|m| m.to_string())
            .map_err(|e| CryptoError::Mnemonic(e.to_string()))
    }

    /// Recover the seed from a 24-word phrase.
    pub fn from_mnemonic(phrase: &str) -> Result<Self, CryptoError> {
        let mnemonic = Mnemonic::parse_normalized(phrase)
            .map_err(|e| CryptoError::Mnemonic(e.to_string()))?;
        let entropy = mnemonic.to_entropy();
        let bytes: [u8; MASTER_SEED_LEN] = entropy
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Mnemonic("phrase must carry 256 bits".to_string()))?;
        Ok(Self(bytes))
    }
}

/// One derived subkey: blake3 in derive-key mode over
/// `master ‖ index`, namespaced by the context string.
fn derive_subkey(master: &MasterSeed, context: &str, index: u32) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(master.as_bytes());
    hasher.update(&index.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// The full key set of an owned identity.
pub struct IdentityKeys {
    master: MasterSeed,
    signing: SigningKey,
    encryption: [u8; 32],
    extension_context: &'static str,
}

impl IdentityKeys {
    /// Derive the root signing key (subkey 0 under the identity
    /// context) and the encryption key from a master seed.
    pub fn derive(master: MasterSeed, cfg: &IdentityConfig) -> Self {
        let signing_seed = derive_subkey(&master, &cfg.context_string, 0);
        let encryption = derive_subkey(&master, &cfg.encryption_context_string, 0);
        Self {
            master,
            signing: SigningKey::from_bytes(&signing_seed),
            encryption,
            extension_context: EXTENSION_CONTEXT,
        }
    }

    pub fn signing(&self) -> &SigningKey {
        &self.signing
    }

    /// The identity key: the root verify key.
    pub fn public_key(&self) -> CubeKey {
        CubeKey::new(self.signing.verifying_key().to_bytes())
    }

    pub fn encryption(&self) -> &[u8; 32] {
        &self.encryption
    }

    pub fn master(&self) -> &MasterSeed {
        &self.master
    }

    /// Signing key for the extension cube at `index` (1-based; index 0
    /// is the root itself under a different context).
    pub fn extension_signer(&self, index: u32) -> SigningKey {
        SigningKey::from_bytes(&derive_subkey(
            &self.master,
            self.extension_context,
            index,
        ))
    }

    /// Key of the extension cube at `index` without exposing its
    /// secret half.
    pub fn extension_key(&self, index: u32) -> CubeKey {
        CubeKey::new(self.extension_signer(index).verifying_key().to_bytes())
    }
}
