// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

use crate::models::{cube_type::CubeType, relationship::RelationshipType};

/// Everything that can go wrong while parsing, assembling or admitting a
/// single cube. Violations surface at the store boundary as a rejected
/// admission; they are never allowed to panic.
#[derive(Debug, Error)]
pub enum CubeError {
    #[error("cube must be exactly {expected} bytes, got {got}")]
    BadSize { expected: usize, got: usize },

    #[error("unknown cube type byte 0x{0:02x}")]
    UnknownCubeType(u8),

    #[error("cube key must be 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("field value of {0} bytes exceeds the 10-bit wire maximum")]
    FieldTooLong(usize),

    #[error("{needed} field bytes do not fit, only {available} free")]
    FieldOverflow { needed: usize, available: usize },

    #[error("malformed field at offset {offset}: {reason}")]
    MalformedField { offset: usize, reason: &'static str },

    #[error("proof of work too weak: {got} leading zero bits, {required} required")]
    InsufficientDifficulty { got: u8, required: u8 },

    #[error("signature does not verify against the embedded public key")]
    SignatureInvalid,

    #[error("cube type {0} requires a signing key to sculpt")]
    SigningKeyRequired(CubeType),

    #[error("at most {limit} {rel_type} relationships per cube")]
    TooManyRelationships {
        rel_type: RelationshipType,
        limit: usize,
    },
}
