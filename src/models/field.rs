// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The TLV field grammar used inside the cube body.
//!
//! Every variable field is a two-byte little-endian header packing
//! `type:6 | length:10`, followed by `length` value bytes:
//!
//! ```text
//!  15                    6 5         0
//! +-----------------------+-----------+
//! |      LENGTH (10)      | TYPE (6)  |   u16, little-endian on the wire
//! +-----------------------+-----------+
//! ```
//!
//! Types 0..=11 are assigned below; 32..=63 belong to applications.
//! Unassigned types inside the 6-bit range are preserved verbatim so a
//! cube always round-trips byte-exactly through nodes that do not know
//! the field.

use bytes::Bytes;

use crate::models::errors::CubeError;

/// Size of the packed TLV header.
pub const FIELD_HEADER_LEN: usize = 2;

/// Largest value length expressible in the 10 length bits.
pub const MAX_FIELD_LEN: usize = 1023;

/// First type code of the application-specific range.
pub const APPLICATION_RANGE_START: u8 = 32;

const TYPE_MASK: u16 = 0x003f;
const LENGTH_SHIFT: u16 = 6;

/// Field type tag. Core codes are named; anything else in the 6-bit
/// range travels as [`FieldType::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Padding,
    Application,
    ContentName,
    Description,
    Payload,
    MediaType,
    Username,
    RelatesTo,
    Notify,
    Date,
    PmucUpdateCount,
    SubkeySeed,
    /// Application-specific (>= 32) or not-yet-assigned core code.
    Other(u8),
}

impl FieldType {
    /// The 6-bit wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Padding => 0,
            Self::Application => 1,
            Self::ContentName => 2,
            Self::Description => 3,
            Self::Payload => 4,
            Self::MediaType => 5,
            Self::Username => 6,
            Self::RelatesTo => 7,
            Self::Notify => 8,
            Self::Date => 9,
            Self::PmucUpdateCount => 10,
            Self::SubkeySeed => 11,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Padding,
            1 => Self::Application,
            2 => Self::ContentName,
            3 => Self::Description,
            4 => Self::Payload,
            5 => Self::MediaType,
            6 => Self::Username,
            7 => Self::RelatesTo,
            8 => Self::Notify,
            9 => Self::Date,
            10 => Self::PmucUpdateCount,
            11 => Self::SubkeySeed,
            other => Self::Other(other & 0x3f),
        }
    }
}

/// Packs a TLV header. `len` must already be validated against
/// [`MAX_FIELD_LEN`].
#[inline]
pub fn pack_header(field_type: FieldType, len: usize) -> [u8; FIELD_HEADER_LEN] {
    let raw = (field_type.code() as u16 & TYPE_MASK) | ((len as u16) << LENGTH_SHIFT);
    raw.to_le_bytes()
}

/// Splits a TLV header into `(type, length)`.
#[inline]
pub fn unpack_header(buf: [u8; FIELD_HEADER_LEN]) -> (FieldType, usize) {
    let raw = u16::from_le_bytes(buf);
    (
        FieldType::from_code((raw & TYPE_MASK) as u8),
        (raw >> LENGTH_SHIFT) as usize,
    )
}

/// One typed, length-prefixed unit inside a cube body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub field_type: FieldType,
    pub value: Bytes,
}

impl Field {
    pub fn new(field_type: FieldType, value: impl Into<Bytes>) -> Result<Self, CubeError> {
        let value = value.into();
        if value.len() > MAX_FIELD_LEN {
            return Err(CubeError::FieldTooLong(value.len()));
        }
        Ok(Self { field_type, value })
    }

    pub fn payload(value: impl Into<Bytes>) -> Result<Self, CubeError> {
        Self::new(FieldType::Payload, value)
    }

    pub fn application(tag: &str) -> Result<Self, CubeError> {
        Self::new(FieldType::Application, Bytes::copy_from_slice(tag.as_bytes()))
    }

    pub fn username(name: &str) -> Result<Self, CubeError> {
        Self::new(FieldType::Username, Bytes::copy_from_slice(name.as_bytes()))
    }

    /// Total wire footprint: header plus value.
    #[inline]
    pub fn wire_len(&self) -> usize {
        FIELD_HEADER_LEN + self.value.len()
    }

    /// Interpret the value as UTF-8, lossily.
    pub fn as_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    /// Interpret the value as a big-endian u32 (PMUC_UPDATE_COUNT,
    /// SUBKEY_SEED). `None` when the length does not match.
    pub fn as_u32(&self) -> Option<u32> {
        let arr: [u8; 4] = self.value.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(arr))
    }
}
