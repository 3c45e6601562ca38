// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-family positional layout of the 1024-byte cube.
//!
//! ```text
//! +------+----------------+--------------------+------+-------+-----------+
//! | TYPE | PUBLIC_KEY (*) |     TLV region     | DATE | NONCE | SIG (*)   |
//! | 1 B  | 32 B           |                    | 5 B  | 4 B   | 64 B      |
//! +------+----------------+--------------------+------+-------+-----------+
//! ```
//!
//! (*) MUC family only. Positional offsets are fixed per family; the TLV
//! region fills whatever the positional fields leave free.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::cube_type::CubeKind;

/// Hard size of every cube.
pub const CUBE_SIZE: usize = 1024;

/// Positional back field sizes.
pub const DATE_LEN: usize = 5;
pub const NONCE_LEN: usize = 4;
pub const SIGNATURE_LEN: usize = 64;

/// Front positional public key size (MUC family).
pub const PUBLIC_KEY_LEN: usize = 32;

/// Which field table decodes the TLV body.
///
/// Forwarding-only nodes run the core table: positional fields are
/// parsed, the TLV body stays an opaque blob. Full nodes run the
/// complete TLV grammar. The store records the table a cube was parsed
/// with so dormant cubes re-parse identically.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserTable {
    #[serde(rename = "core", alias = "Core", alias = "CORE")]
    Core,
    #[default]
    #[serde(rename = "full", alias = "Full", alias = "FULL", alias = "cci")]
    Full,
}

/// Raw wire view of the unsigned back positional region.
#[repr(C)]
#[derive(Debug, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawCubeTail {
    /// Unix seconds, big-endian, 40 bits.
    pub date: [u8; DATE_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl RawCubeTail {
    pub fn date_secs(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[3..].copy_from_slice(&self.date);
        u64::from_be_bytes(buf)
    }

    pub fn set_date_secs(&mut self, secs: u64) {
        self.date.copy_from_slice(&secs.to_be_bytes()[3..]);
    }
}

/// Fixed positional layout of one cube family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyLayout {
    /// 32-byte verify key at bytes 1..33.
    pub has_public_key: bool,
    /// 64-byte signature closing the cube.
    pub has_signature: bool,
}

impl FamilyLayout {
    pub const FROZEN: Self = Self {
        has_public_key: false,
        has_signature: false,
    };
    pub const MUC: Self = Self {
        has_public_key: true,
        has_signature: true,
    };

    pub fn for_kind(kind: CubeKind) -> Self {
        if kind.is_mutable() { Self::MUC } else { Self::FROZEN }
    }

    /// First byte of the TLV region.
    #[inline]
    pub fn tlv_start(&self) -> usize {
        1 + if self.has_public_key { PUBLIC_KEY_LEN } else { 0 }
    }

    /// One past the last byte of the TLV region; the back positional
    /// fields begin here.
    #[inline]
    pub fn tlv_end(&self) -> usize {
        CUBE_SIZE - self.tail_len()
    }

    /// Combined size of the back positional fields.
    #[inline]
    pub fn tail_len(&self) -> usize {
        DATE_LEN
            + NONCE_LEN
            + if self.has_signature { SIGNATURE_LEN } else { 0 }
    }

    /// Bytes available to TLV fields.
    #[inline]
    pub fn tlv_capacity(&self) -> usize {
        self.tlv_end() - self.tlv_start()
    }

    /// One past the last byte covered by the signature (and by the
    /// proof-of-work hash). Everything for unsigned families.
    #[inline]
    pub fn signable_end(&self) -> usize {
        if self.has_signature {
            CUBE_SIZE - SIGNATURE_LEN
        } else {
            CUBE_SIZE
        }
    }

    /// Byte offset of the NONCE back field.
    #[inline]
    pub fn nonce_offset(&self) -> usize {
        self.tlv_end() + DATE_LEN
    }
}
