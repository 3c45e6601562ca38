// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed references from one cube to another, encoded as RELATES_TO
//! fields: a one-byte relationship type followed by the 32-byte remote
//! key.

use core::fmt;

use bytes::Bytes;
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::{
    errors::CubeError,
    field::{Field, FieldType},
    keys::{CubeKey, KEY_LEN},
};

/// Wire size of a RELATES_TO value.
pub const RELATIONSHIP_LEN: usize = 1 + KEY_LEN;

/// All assigned relationship type codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipType {
    ReplyTo = 1,
    Quotation = 2,
    MyPost = 3,
    Mention = 4,
    ContinuedIn = 5,
    ReplacedBy = 6,
    Illustration = 7,
    SubscriptionRecommendation = 8,
}

impl RelationshipType {
    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::ReplyTo,
            2 => Self::Quotation,
            3 => Self::MyPost,
            4 => Self::Mention,
            5 => Self::ContinuedIn,
            6 => Self::ReplacedBy,
            7 => Self::Illustration,
            8 => Self::SubscriptionRecommendation,
            _ => return None,
        })
    }

    /// How many relationships of this type a single cube may carry.
    ///
    /// The open bound is the most 35-byte RELATES_TO fields a MUC body
    /// can physically hold.
    pub fn cardinality(self) -> usize {
        match self {
            Self::ContinuedIn | Self::ReplacedBy => 1,
            Self::Illustration => 4,
            _ => 28,
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReplyTo => "REPLY_TO",
            Self::Quotation => "QUOTATION",
            Self::MyPost => "MYPOST",
            Self::Mention => "MENTION",
            Self::ContinuedIn => "CONTINUED_IN",
            Self::ReplacedBy => "REPLACED_BY",
            Self::Illustration => "ILLUSTRATION",
            Self::SubscriptionRecommendation => "SUBSCRIPTION_RECOMMENDATION",
        })
    }
}

/// Raw wire view of a RELATES_TO value.
#[repr(C)]
#[derive(Debug, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawRelationship {
    pub rel_type: u8,
    pub remote_key: [u8; KEY_LEN],
}

/// A typed reference `(RelationshipType, remoteKey)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Relationship {
    pub rel_type: RelationshipType,
    pub remote_key: CubeKey,
}

impl Relationship {
    pub fn new(rel_type: RelationshipType, remote_key: CubeKey) -> Self {
        Self {
            rel_type,
            remote_key,
        }
    }

    /// Encode as a RELATES_TO field.
    pub fn to_field(&self) -> Result<Field, CubeError> {
        let raw = RawRelationship {
            rel_type: self.rel_type as u8,
            remote_key: *self.remote_key.as_bytes(),
        };
        Field::new(
            FieldType::RelatesTo,
            Bytes::copy_from_slice(raw.as_bytes()),
        )
    }

    /// Decode a RELATES_TO value. Unknown relationship type codes yield
    /// `None` rather than an error so future codes pass through
    /// unharmed.
    pub fn from_field(field: &Field) -> Result<Option<Self>, CubeError> {
        let raw = RawRelationship::ref_from_bytes(field.value.as_ref()).map_err(|_| {
            CubeError::MalformedField {
                offset: 0,
                reason: "RELATES_TO value must be 33 bytes",
            }
        })?;
        Ok(RelationshipType::from_u8(raw.rel_type).map(|rel_type| Self {
            rel_type,
            remote_key: CubeKey::new(raw.remote_key),
        }))
    }
}
