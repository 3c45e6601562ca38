// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Helpers for encoding / decoding the very first byte of every cube.
//!
//! The byte layout:
//!
//! ```text
//!  7   6   5   4   3   2   1   0      bit position
//! +---------------+-------+---+---+
//! |  VERSION (4)  | KIND  | 0 | N |  ← first cube octet
//! +---------------+-------+---+---+
//! ```
//!
//! * **VERSION** – wire format version, currently always 1.
//! * **KIND** – 2-bit cube kind (FROZEN / PIC / MUC / PMUC).
//! * **N** – *notify* flag: the cube carries a NOTIFY routing field.

use core::fmt;

use crate::models::errors::CubeError;

/// Current (and only) cube wire format version.
pub const CUBE_VERSION: u8 = 1;

const VERSION_SHIFT: u8 = 4;
const KIND_SHIFT: u8 = 2;
const KIND_MASK: u8 = 0b0000_1100;
const NOTIFY_MASK: u8 = 0b0000_0001;

/// The four cube kinds.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeKind {
    /// Immutable, content-addressed.
    #[default]
    Frozen = 0,
    /// Persistent immutable container (reserved; layout fixed, semantics
    /// still content-addressed).
    Pic = 1,
    /// Mutable user cube, key = author public key, signed.
    Muc = 2,
    /// MUC with a monotonic update counter.
    Pmuc = 3,
}

impl CubeKind {
    #[inline]
    pub fn from_u2(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Frozen,
            1 => Self::Pic,
            2 => Self::Muc,
            3 => Self::Pmuc,
            _ => return None,
        })
    }

    /// MUC family cubes are owner-addressed and signed.
    #[inline]
    pub fn is_mutable(self) -> bool {
        matches!(self, Self::Muc | Self::Pmuc)
    }

    /// PMUC revisions carry a PMUC_UPDATE_COUNT field that dominates the
    /// contest.
    #[inline]
    pub fn has_update_count(self) -> bool {
        matches!(self, Self::Pmuc)
    }
}

/// Typed representation of the cube's first byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CubeType {
    pub kind: CubeKind,
    /// Set when the cube carries a NOTIFY routing field.
    pub notify: bool,
}

impl CubeType {
    pub const fn new(kind: CubeKind, notify: bool) -> Self {
        Self { kind, notify }
    }
}

impl TryFrom<u8> for CubeType {
    type Error = CubeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        if byte >> VERSION_SHIFT != CUBE_VERSION || byte & 0b0000_0010 != 0 {
            return Err(CubeError::UnknownCubeType(byte));
        }
        let kind = CubeKind::from_u2((byte & KIND_MASK) >> KIND_SHIFT)
            .ok_or(CubeError::UnknownCubeType(byte))?;
        Ok(Self {
            kind,
            notify: byte & NOTIFY_MASK != 0,
        })
    }
}

impl From<&CubeType> for u8 {
    fn from(t: &CubeType) -> u8 {
        let mut raw = (CUBE_VERSION << VERSION_SHIFT) | ((t.kind as u8) << KIND_SHIFT);
        if t.notify {
            raw |= NOTIFY_MASK;
        }
        raw
    }
}

impl fmt::Display for CubeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.kind {
            CubeKind::Frozen => "FROZEN",
            CubeKind::Pic => "PIC",
            CubeKind::Muc => "MUC",
            CubeKind::Pmuc => "PMUC",
        };
        if self.notify {
            write!(f, "{name}_NOTIFY")
        } else {
            f.write_str(name)
        }
    }
}
