// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The cube itself: decoding the canonical 1024-byte form, and the
//! builder that assembles, proof-of-works and signs new cubes.

use core::fmt;

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use once_cell::sync::OnceCell;
use rand::RngExt;
use zerocopy::FromBytes as ZFromBytes;

use crate::{
    models::{
        cube_type::{CubeKind, CubeType},
        errors::CubeError,
        family::{
            CUBE_SIZE, FamilyLayout, NONCE_LEN, ParserTable, PUBLIC_KEY_LEN, RawCubeTail,
            SIGNATURE_LEN,
        },
        field::{FIELD_HEADER_LEN, Field, FieldType, pack_header, unpack_header},
        keys::{CubeKey, NotifyKey},
        relationship::{Relationship, RelationshipType},
    },
    utils::{leading_zero_bits, unix_now},
};

/// Nonce attempts between cooperative yields, so a difficult sculpt does
/// not starve the rest of the runtime.
const POW_YIELD_INTERVAL: u32 = 2048;

/// A fully decoded cube, backed by its canonical 1024-byte form.
///
/// A `Cube` is only ever obtained from [`Cube::decode`] or
/// [`CubeBuilder::sculpt`], so the binary and the parsed view never
/// diverge.
#[derive(Debug, Clone)]
pub struct Cube {
    cube_type: CubeType,
    public_key: Option<[u8; PUBLIC_KEY_LEN]>,
    /// TLV fields in wire order, padding stripped. Empty when the cube
    /// was parsed with the core table.
    fields: Vec<Field>,
    /// Opaque TLV region, kept only by the core parser table.
    raw_body: Option<Bytes>,
    date: u64,
    nonce: [u8; NONCE_LEN],
    signature: Option<[u8; SIGNATURE_LEN]>,
    binary: Bytes,
    core_hash: OnceCell<[u8; 32]>,
}

impl PartialEq for Cube {
    fn eq(&self, other: &Self) -> bool {
        self.binary == other.binary
    }
}
impl Eq for Cube {}

impl Cube {
    /// Parse the canonical binary form.
    ///
    /// Only the grammar is checked here; proof-of-work and signature
    /// gates are the store's admission policy (see [`Cube::verify`]).
    pub fn decode(binary: Bytes, parser: ParserTable) -> Result<Self, CubeError> {
        if binary.len() != CUBE_SIZE {
            return Err(CubeError::BadSize {
                expected: CUBE_SIZE,
                got: binary.len(),
            });
        }

        let cube_type = CubeType::try_from(binary[0])?;
        let layout = FamilyLayout::for_kind(cube_type.kind);

        let public_key = if layout.has_public_key {
            let mut pk = [0u8; PUBLIC_KEY_LEN];
            pk.copy_from_slice(&binary[1..1 + PUBLIC_KEY_LEN]);
            Some(pk)
        } else {
            None
        };

        let tail_start = layout.tlv_end();
        let (tail, _) = RawCubeTail::ref_from_prefix(&binary[tail_start..]).map_err(
            |_| CubeError::MalformedField {
                offset: tail_start,
                reason: "back positional region truncated",
            },
        )?;
        let date = tail.date_secs();
        let nonce = tail.nonce;

        let signature = if layout.has_signature {
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(&binary[layout.signable_end()..]);
            Some(sig)
        } else {
            None
        };

        let (fields, raw_body) = match parser {
            ParserTable::Core => {
                (Vec::new(), Some(binary.slice(layout.tlv_start()..tail_start)))
            },
            ParserTable::Full => {
                (parse_tlv_region(&binary, layout.tlv_start(), tail_start)?, None)
            },
        };

        Ok(Self {
            cube_type,
            public_key,
            fields,
            raw_body,
            date,
            nonce,
            signature,
            binary,
            core_hash: OnceCell::new(),
        })
    }

    /// The canonical 1024 bytes.
    #[inline]
    pub fn binary(&self) -> &Bytes {
        &self.binary
    }

    #[inline]
    pub fn cube_type(&self) -> CubeType {
        self.cube_type
    }

    #[inline]
    pub fn kind(&self) -> CubeKind {
        self.cube_type.kind
    }

    /// Sculpt date, Unix seconds.
    #[inline]
    pub fn date(&self) -> u64 {
        self.date
    }

    #[inline]
    pub fn public_key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.public_key.as_ref()
    }

    /// The proof-of-work nonce that satisfied the difficulty search.
    #[inline]
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// blake3 over the signable region: the full cube for FROZEN/PIC,
    /// everything before the signature for the MUC family. Serves as the
    /// content key, the difficulty measure and the contest tiebreak.
    pub fn core_hash(&self) -> &[u8; 32] {
        self.core_hash.get_or_init(|| {
            let layout = FamilyLayout::for_kind(self.cube_type.kind);
            *blake3::hash(&self.binary[..layout.signable_end()]).as_bytes()
        })
    }

    /// The 32-byte cube key: content hash for immutable kinds, owner
    /// verify key for the MUC family.
    pub fn key(&self) -> CubeKey {
        match self.public_key {
            Some(pk) => CubeKey::new(pk),
            None => CubeKey::new(*self.core_hash()),
        }
    }

    /// Leading zero bits of the core hash.
    pub fn difficulty(&self) -> u8 {
        leading_zero_bits(self.core_hash())
    }

    /// Admission gate: difficulty threshold plus, for the MUC family,
    /// the embedded signature.
    pub fn verify(&self, required_difficulty: u8) -> Result<(), CubeError> {
        let got = self.difficulty();
        if got < required_difficulty {
            return Err(CubeError::InsufficientDifficulty {
                got,
                required: required_difficulty,
            });
        }
        if self.cube_type.kind.is_mutable() {
            self.verify_signature()?;
        }
        Ok(())
    }

    /// Check the Ed25519 signature against the embedded public key.
    pub fn verify_signature(&self) -> Result<(), CubeError> {
        let (Some(pk), Some(sig)) = (self.public_key, self.signature) else {
            return Err(CubeError::SignatureInvalid);
        };
        let verifying =
            VerifyingKey::from_bytes(&pk).map_err(|_| CubeError::SignatureInvalid)?;
        let layout = FamilyLayout::for_kind(self.cube_type.kind);
        verifying
            .verify_strict(
                &self.binary[..layout.signable_end()],
                &Signature::from_bytes(&sig),
            )
            .map_err(|_| CubeError::SignatureInvalid)
    }

    /// All TLV fields in wire order (padding stripped). Empty for cubes
    /// parsed with the core table.
    #[inline]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The opaque TLV region, when the core table parsed this cube.
    #[inline]
    pub fn raw_body(&self) -> Option<&Bytes> {
        self.raw_body.as_ref()
    }

    pub fn first_field(&self, field_type: FieldType) -> Option<&Field> {
        self.fields.iter().find(|f| f.field_type == field_type)
    }

    pub fn fields_of(
        &self,
        field_type: FieldType,
    ) -> impl Iterator<Item = &Field> + '_ {
        self.fields.iter().filter(move |f| f.field_type == field_type)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.first_field(FieldType::Payload).map(|f| f.value.as_ref())
    }

    pub fn application(&self) -> Option<String> {
        self.first_field(FieldType::Application).map(Field::as_str)
    }

    pub fn username(&self) -> Option<String> {
        self.first_field(FieldType::Username).map(Field::as_str)
    }

    /// The 32-byte notification routing key, when present and well
    /// formed.
    pub fn notify_key(&self) -> Option<NotifyKey> {
        let field = self.first_field(FieldType::Notify)?;
        NotifyKey::try_from(field.value.as_ref()).ok()
    }

    /// PMUC_UPDATE_COUNT, defaulting to zero for kinds without one.
    pub fn update_count(&self) -> u32 {
        self.first_field(FieldType::PmucUpdateCount)
            .and_then(Field::as_u32)
            .unwrap_or(0)
    }

    /// SUBKEY_SEED index of an identity extension cube.
    pub fn subkey_seed(&self) -> Option<u32> {
        self.first_field(FieldType::SubkeySeed).and_then(Field::as_u32)
    }

    /// All decodable RELATES_TO references, in wire order. Values with
    /// unknown relationship codes are skipped; a stored cube has
    /// already passed the grammar.
    pub fn relationships(&self) -> Vec<Relationship> {
        self.fields_of(FieldType::RelatesTo)
            .filter_map(|f| Relationship::from_field(f).ok().flatten())
            .collect()
    }

    pub fn relationships_of(&self, rel_type: RelationshipType) -> Vec<Relationship> {
        self.relationships()
            .into_iter()
            .filter(|r| r.rel_type == rel_type)
            .collect()
    }
}

impl fmt::Display for Cube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({} fields, difficulty {})",
            self.cube_type,
            self.key(),
            self.fields.len(),
            self.difficulty()
        )
    }
}

/// Walk the TLV region. The declared lengths must land exactly on the
/// back positional boundary; a single trailing zero byte is accepted as
/// degenerate padding.
fn parse_tlv_region(
    binary: &Bytes,
    start: usize,
    end: usize,
) -> Result<Vec<Field>, CubeError> {
    let mut fields = Vec::new();
    let mut cursor = start;
    while cursor < end {
        if end - cursor == 1 {
            if binary[cursor] != 0 {
                return Err(CubeError::MalformedField {
                    offset: cursor,
                    reason: "trailing byte is not padding",
                });
            }
            break;
        }
        let header: [u8; FIELD_HEADER_LEN] = binary[cursor..cursor + FIELD_HEADER_LEN]
            .try_into()
            .map_err(|_| CubeError::MalformedField {
                offset: cursor,
                reason: "field header truncated",
            })?;
        let (field_type, len) = unpack_header(header);
        let value_start = cursor + FIELD_HEADER_LEN;
        if value_start + len > end {
            return Err(CubeError::MalformedField {
                offset: cursor,
                reason: "declared length crosses the positional region",
            });
        }
        if field_type != FieldType::Padding {
            fields.push(Field {
                field_type,
                value: binary.slice(value_start..value_start + len),
            });
        }
        cursor = value_start + len;
    }
    Ok(fields)
}

/// Assembles a cube field by field, then sculpts it: serialize, pad,
/// date, proof-of-work nonce search, and (MUC family) signature.
#[derive(Debug, Default)]
pub struct CubeBuilder {
    cube_type: CubeType,
    fields: Vec<Field>,
    date: Option<u64>,
}

impl CubeBuilder {
    pub fn new(kind: CubeKind) -> Self {
        Self {
            cube_type: CubeType::new(kind, false),
            fields: Vec::new(),
            date: None,
        }
    }

    pub fn frozen() -> Self {
        Self::new(CubeKind::Frozen)
    }

    pub fn muc() -> Self {
        Self::new(CubeKind::Muc)
    }

    pub fn pmuc() -> Self {
        Self::new(CubeKind::Pmuc)
    }

    /// Append a pre-built field; insertion order is wire order.
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn payload(self, value: impl Into<Bytes>) -> Result<Self, CubeError> {
        Ok(self.field(Field::payload(value)?))
    }

    pub fn application(self, tag: &str) -> Result<Self, CubeError> {
        Ok(self.field(Field::application(tag)?))
    }

    pub fn username(self, name: &str) -> Result<Self, CubeError> {
        Ok(self.field(Field::username(name)?))
    }

    /// Append a RELATES_TO reference, enforcing the per-type cardinality
    /// limit.
    pub fn relates_to(
        mut self,
        rel_type: RelationshipType,
        remote_key: CubeKey,
    ) -> Result<Self, CubeError> {
        let present = self
            .fields
            .iter()
            .filter(|f| f.field_type == FieldType::RelatesTo)
            .filter_map(|f| Relationship::from_field(f).ok().flatten())
            .filter(|r| r.rel_type == rel_type)
            .count();
        if present >= rel_type.cardinality() {
            return Err(CubeError::TooManyRelationships {
                rel_type,
                limit: rel_type.cardinality(),
            });
        }
        let field = Relationship::new(rel_type, remote_key).to_field()?;
        self.fields.push(field);
        Ok(self)
    }

    /// Attach a NOTIFY routing key; flips the notify bit in the type
    /// byte.
    pub fn notify(mut self, key: NotifyKey) -> Result<Self, CubeError> {
        self.cube_type.notify = true;
        let field = Field::new(FieldType::Notify, Bytes::copy_from_slice(key.as_ref()))?;
        self.fields.push(field);
        Ok(self)
    }

    /// PMUC revision counter.
    pub fn update_count(self, count: u32) -> Result<Self, CubeError> {
        Ok(self.field(Field::new(
            FieldType::PmucUpdateCount,
            Bytes::copy_from_slice(&count.to_be_bytes()),
        )?))
    }

    /// Identity extension subkey index.
    pub fn subkey_seed(self, index: u32) -> Result<Self, CubeError> {
        Ok(self.field(Field::new(
            FieldType::SubkeySeed,
            Bytes::copy_from_slice(&index.to_be_bytes()),
        )?))
    }

    /// Explicit sculpt date; defaults to the current time.
    pub fn date(mut self, secs: u64) -> Self {
        self.date = Some(secs);
        self
    }

    /// Wire bytes the queued fields already occupy.
    pub fn occupied(&self) -> usize {
        self.fields.iter().map(Field::wire_len).sum()
    }

    /// Free TLV bytes left for further fields.
    pub fn remaining_capacity(&self) -> usize {
        FamilyLayout::for_kind(self.cube_type.kind)
            .tlv_capacity()
            .saturating_sub(self.occupied())
    }

    /// Serialize, pad, stamp the date, search a nonce satisfying the
    /// difficulty, and sign (MUC family).
    ///
    /// The nonce scan starts at a random offset and yields to the
    /// runtime between batches; any satisfying nonce is acceptable.
    pub async fn sculpt(
        self,
        required_difficulty: u8,
        signer: Option<&SigningKey>,
    ) -> Result<Cube, CubeError> {
        let layout = FamilyLayout::for_kind(self.cube_type.kind);
        let mut buf = vec![0u8; CUBE_SIZE];
        buf[0] = u8::from(&self.cube_type);

        if layout.has_public_key {
            let signer = signer
                .ok_or(CubeError::SigningKeyRequired(self.cube_type))?;
            buf[1..1 + PUBLIC_KEY_LEN]
                .copy_from_slice(signer.verifying_key().as_bytes());
        }

        // TLV fields in insertion order, then padding to the tail.
        let end = layout.tlv_end();
        let mut cursor = layout.tlv_start();
        for field in &self.fields {
            let needed = field.wire_len();
            if cursor + needed > end {
                return Err(CubeError::FieldOverflow {
                    needed,
                    available: end - cursor,
                });
            }
            buf[cursor..cursor + FIELD_HEADER_LEN]
                .copy_from_slice(&pack_header(field.field_type, field.value.len()));
            cursor += FIELD_HEADER_LEN;
            buf[cursor..cursor + field.value.len()].copy_from_slice(&field.value);
            cursor += field.value.len();
        }
        let free = end - cursor;
        if free >= FIELD_HEADER_LEN {
            buf[cursor..cursor + FIELD_HEADER_LEN]
                .copy_from_slice(&pack_header(FieldType::Padding, free - FIELD_HEADER_LEN));
        }
        // A single leftover byte stays zero and parses as degenerate padding.

        // Back positional region: date, then the nonce the search owns.
        let date = self.date.unwrap_or_else(unix_now);
        let mut tail = RawCubeTail {
            date: [0; 5],
            nonce: [0; NONCE_LEN],
        };
        tail.set_date_secs(date);
        buf[end..end + 5].copy_from_slice(&tail.date);

        let nonce_off = layout.nonce_offset();
        let signable_end = layout.signable_end();
        let mut nonce = rand::rng().random::<u32>();
        let mut tries = 0u32;
        loop {
            buf[nonce_off..nonce_off + NONCE_LEN].copy_from_slice(&nonce.to_le_bytes());
            let hash = blake3::hash(&buf[..signable_end]);
            if leading_zero_bits(hash.as_bytes()) >= required_difficulty {
                break;
            }
            nonce = nonce.wrapping_add(1);
            tries = tries.wrapping_add(1);
            if tries % POW_YIELD_INTERVAL == 0 {
                tokio::task::yield_now().await;
            }
        }

        if layout.has_signature {
            let signer = signer
                .ok_or(CubeError::SigningKeyRequired(self.cube_type))?;
            let signature = signer.sign(&buf[..signable_end]);
            buf[signable_end..].copy_from_slice(&signature.to_bytes());
        }

        // Re-decoding the finished buffer keeps the parsed view and the
        // canonical bytes from ever diverging.
        Cube::decode(Bytes::from(buf), ParserTable::Full)
    }
}
