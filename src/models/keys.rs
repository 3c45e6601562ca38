// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use crate::models::errors::CubeError;

/// Length of every cube key in bytes.
pub const KEY_LEN: usize = 32;

/// 32-byte cube identifier.
///
/// For FROZEN/PIC cubes this is the blake3 hash of the canonical binary
/// (content addressing); for the MUC family it is the owner's Ed25519
/// verify key, so every revision of a mutable cube shares one key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CubeKey([u8; KEY_LEN]);

/// A notification routing tag is key-shaped: 32 opaque bytes a cube may
/// carry in its NOTIFY field and subscribers filter on.
pub type NotifyKey = CubeKey;

impl CubeKey {
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Canonical 64-char lowercase hex form, used as the map and
    /// persistence key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CubeError> {
        let raw = hex::decode(s).map_err(|_| CubeError::BadKeyLength(s.len() / 2))?;
        Self::try_from(raw.as_slice())
    }
}

impl TryFrom<&[u8]> for CubeKey {
    type Error = CubeError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; KEY_LEN] = value
            .try_into()
            .map_err(|_| CubeError::BadKeyLength(value.len()))?;
        Ok(Self(arr))
    }
}

impl AsRef<[u8]> for CubeKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for CubeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CubeKey {
    /// Abbreviated form for logs; the full key is 64 chars of noise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CubeKey({}..)", &self.to_hex()[..8])
    }
}
