// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::models::family::ParserTable;

/// Default Argon2id memory hardness: 64 MiB expressed in KiB.
const DEFAULT_ARGON_MEMORY_KIB: u32 = 64 * 1024;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Admission gate for every cube entering the store.
    #[serde(default)]
    pub pow: PowConfig,
    /// CubeStore and persistence backend parameters.
    #[serde(default)]
    pub store: StoreConfig,
    /// Request scheduler knobs.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Identity aggregate behaviour and key-derivation namespaces.
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Proof-of-work admission threshold.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PowConfig {
    #[serde(rename = "RequiredDifficulty", default)]
    /// Minimum leading zero bits of the core hash.
    pub required_difficulty: u8,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StoreConfig {
    #[serde(rename = "EnableCubePersistence", default = "default_true")]
    /// Keep cubes in the on-disk backend as well as in memory.
    pub enable_cube_persistence: bool,

    #[serde(rename = "Path", default = "default_store_path")]
    /// Database directory.
    pub path: PathBuf,

    #[serde(rename = "Parser", default)]
    /// Default field table used to parse incoming cubes.
    pub parser: ParserTable,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enable_cube_persistence: true,
            path: default_store_path(),
            parser: ParserTable::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NetworkConfig {
    #[serde(rename = "RequestTimeout", with = "serde_secs", default = "default_request_timeout")]
    /// Deadline for a single scheduled cube request.
    pub request_timeout: Duration,

    #[serde(rename = "RequestRetries", default = "default_request_retries")]
    /// Re-dispatch attempts against fresh peers before the request
    /// times out.
    pub request_retries: u32,

    #[serde(rename = "ScheduleIn", with = "serde_millis", default)]
    /// Delay between accepting a request and dispatching it, allowing
    /// callers to batch.
    pub schedule_in: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            request_retries: default_request_retries(),
            schedule_in: Duration::ZERO,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IdentityConfig {
    #[serde(rename = "MinMucRebuildDelay", with = "serde_secs", default = "default_rebuild_delay")]
    /// Minimum pause between successive Identity republishes.
    pub min_muc_rebuild_delay: Duration,

    #[serde(rename = "ArgonCpuHardness", default = "default_argon_cpu")]
    /// Argon2id passes for username/password recovery.
    pub argon_cpu_hardness: u32,

    #[serde(rename = "ArgonMemoryHardness", default = "default_argon_memory")]
    /// Argon2id memory cost in KiB.
    pub argon_memory_hardness: u32,

    #[serde(rename = "ContextString", default = "default_context_string")]
    /// Key-derivation context for the root signing key.
    pub context_string: String,

    #[serde(rename = "EncryptionContextString", default = "default_encryption_context")]
    /// Key-derivation context for the encryption key.
    pub encryption_context_string: String,

    #[serde(rename = "ApplicationString", default = "default_application_string")]
    /// APPLICATION tag written into identity root cubes.
    pub application_string: String,

    #[serde(rename = "SubscriptionRecursionDepth", default = "default_recursion_depth")]
    /// Default depth for recursive post streams.
    pub subscription_recursion_depth: u32,

    #[serde(rename = "SubscribeRemoteChanges", default = "default_true")]
    /// React to remote MUC updates of owned identities.
    pub subscribe_remote_changes: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            min_muc_rebuild_delay: default_rebuild_delay(),
            argon_cpu_hardness: default_argon_cpu(),
            argon_memory_hardness: default_argon_memory(),
            context_string: default_context_string(),
            encryption_context_string: default_encryption_context(),
            application_string: default_application_string(),
            subscription_recursion_depth: default_recursion_depth(),
            subscribe_remote_changes: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_store_path() -> PathBuf {
    PathBuf::from("verity.db")
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_request_retries() -> u32 {
    2
}
fn default_rebuild_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_argon_cpu() -> u32 {
    3
}
fn default_argon_memory() -> u32 {
    DEFAULT_ARGON_MEMORY_KIB
}
fn default_context_string() -> String {
    "CCI Identity".to_string()
}
fn default_encryption_context() -> String {
    "CCI Encryption".to_string()
}
fn default_application_string() -> String {
    "ID".to_string()
}
fn default_recursion_depth() -> u32 {
    1
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.identity.context_string.is_empty(),
            "ContextString must not be empty"
        );
        ensure!(
            !self.identity.encryption_context_string.is_empty(),
            "EncryptionContextString must not be empty"
        );
        ensure!(
            !self.identity.application_string.is_empty(),
            "ApplicationString must not be empty"
        );

        // Following remote changes is pointless when post streams never
        // descend into subscriptions; reject the mismatch instead of
        // silently watching nothing.
        ensure!(
            !(self.identity.subscription_recursion_depth == 0
                && self.identity.subscribe_remote_changes),
            "SubscribeRemoteChanges requires SubscriptionRecursionDepth >= 1"
        );

        // Argon2 refuses memory below 8 KiB per lane; normalize instead
        // of failing a recovery much later.
        if self.identity.argon_memory_hardness < 8 {
            self.identity.argon_memory_hardness = 8;
        }
        ensure!(
            self.identity.argon_cpu_hardness >= 1,
            "ArgonCpuHardness must be >= 1"
        );

        ensure!(
            self.network.request_timeout > Duration::ZERO,
            "RequestTimeout must be positive"
        );

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helpers for representing `Duration` as milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
