// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use ed25519_dalek::Signer;
use verity::models::{
    cube::{Cube, CubeBuilder},
    cube_type::{CubeKind, CubeType},
    errors::CubeError,
    family::{CUBE_SIZE, FamilyLayout, ParserTable},
    field::{Field, FieldType, MAX_FIELD_LEN},
    keys::CubeKey,
    relationship::RelationshipType,
};

use crate::unit_tests::{frozen, muc, redecode, test_signer};

#[tokio::test]
async fn frozen_round_trip() -> Result<()> {
    // Scenario: FROZEN cube with PAYLOAD "hello", fixed date, zero
    // difficulty.
    let cube = frozen(b"hello", 1_700_000_000).await;

    assert_eq!(cube.binary().len(), CUBE_SIZE);
    assert_eq!(cube.date(), 1_700_000_000);
    assert_eq!(cube.payload(), Some(&b"hello"[..]));

    let decoded = redecode(&cube, ParserTable::Full);
    assert_eq!(decoded, cube);
    assert_eq!(decoded.fields(), cube.fields());
    assert_eq!(decoded.date(), cube.date());
    assert_eq!(decoded.key(), cube.key());
    Ok(())
}

#[tokio::test]
async fn muc_round_trip_and_ownership() -> Result<()> {
    let signer = test_signer(7);
    let cube = muc(&signer, b"owned", 1_700_000_001).await;

    // Key is the verify key, and the signature holds.
    assert_eq!(
        cube.key().as_bytes(),
        signer.verifying_key().as_bytes()
    );
    cube.verify_signature()?;

    let decoded = redecode(&cube, ParserTable::Full);
    assert_eq!(decoded, cube);
    decoded.verify_signature()?;
    assert_eq!(decoded.key(), cube.key());
    Ok(())
}

#[tokio::test]
async fn content_addressing_distinguishes_payloads() {
    // Byte-identical cubes share a key, differing cubes never do.
    let a = frozen(b"same", 1000).await;
    let b = Cube::decode(a.binary().clone(), ParserTable::Full).expect("decode");
    assert_eq!(a.key(), b.key());

    let c = frozen(b"different", 1000).await;
    assert_ne!(a.key(), c.key());
}

#[tokio::test]
async fn type_byte_encodings() {
    let cube = frozen(b"x", 1).await;
    assert_eq!(cube.binary()[0], 0x10);

    let signer = test_signer(1);
    let m = muc(&signer, b"x", 1).await;
    assert_eq!(m.binary()[0], 0x18);
    assert_eq!(m.cube_type(), CubeType::new(CubeKind::Muc, false));
}

#[tokio::test]
async fn frozen_wire_prefix_is_bit_exact() {
    use hex_literal::hex;

    // Type byte 0x10 (version 1, FROZEN), then the PAYLOAD TLV:
    // header 0x0144 little-endian (type 4, length 5), then "hello".
    let cube = frozen(b"hello", 1_700_000_000).await;
    assert_eq!(
        &cube.binary()[..8],
        hex!("10 44 01 68 65 6c 6c 6f")
    );

    // Positional DATE sits at the tail: 1_700_000_000 big-endian in
    // five bytes.
    let layout = FamilyLayout::for_kind(CubeKind::Frozen);
    let tail = layout.tlv_end();
    assert_eq!(&cube.binary()[tail..tail + 5], hex!("00 65 53 f1 00"));
}

#[tokio::test]
async fn unknown_tlv_types_round_trip() -> Result<()> {
    // An unassigned type code must survive decode/encode verbatim.
    let cube = CubeBuilder::frozen()
        .field(Field::new(FieldType::Other(29), Bytes::from_static(b"opaque"))?)
        .payload(Bytes::from_static(b"known"))?
        .date(42)
        .sculpt(0, None)
        .await?;

    let decoded = redecode(&cube, ParserTable::Full);
    let other = decoded
        .first_field(FieldType::Other(29))
        .expect("unknown field preserved");
    assert_eq!(other.value.as_ref(), b"opaque");
    // Field order is wire order.
    assert_eq!(decoded.fields()[0].field_type, FieldType::Other(29));
    assert_eq!(decoded.fields()[1].field_type, FieldType::Payload);
    Ok(())
}

#[tokio::test]
async fn core_table_keeps_body_opaque() -> Result<()> {
    let cube = frozen(b"hidden from forwarders", 77).await;
    let core = redecode(&cube, ParserTable::Core);

    assert!(core.fields().is_empty());
    assert!(core.payload().is_none());
    let body = core.raw_body().expect("core table keeps the blob");
    let layout = FamilyLayout::for_kind(CubeKind::Frozen);
    assert_eq!(body.len(), layout.tlv_capacity());
    // Same canonical bytes either way.
    assert_eq!(core.binary(), cube.binary());
    assert_eq!(core.key(), cube.key());
    Ok(())
}

#[tokio::test]
async fn single_byte_padding_edge() -> Result<()> {
    // Fill the TLV region so exactly one byte is left: capacity 1014,
    // one field of 2 + 1011 leaves 1.
    let cube = CubeBuilder::frozen()
        .field(Field::new(
            FieldType::Payload,
            Bytes::from(vec![0xAA; 1011]),
        )?)
        .date(1)
        .sculpt(0, None)
        .await?;

    let decoded = redecode(&cube, ParserTable::Full);
    assert_eq!(decoded.fields().len(), 1);
    assert_eq!(decoded.payload().map(|p| p.len()), Some(1011));
    Ok(())
}

#[tokio::test]
async fn oversize_field_rejected_at_sculpt() {
    // 918 bytes of MUC capacity cannot hold a 1000-byte payload.
    let signer = test_signer(2);
    let err = CubeBuilder::muc()
        .payload(Bytes::from(vec![0u8; 1000]))
        .expect("within wire maximum")
        .sculpt(0, Some(&signer))
        .await;
    assert!(matches!(err, Err(CubeError::FieldOverflow { .. })));

    // And the wire maximum itself is enforced at field construction.
    assert!(matches!(
        Field::new(FieldType::Payload, vec![0u8; MAX_FIELD_LEN + 1]),
        Err(CubeError::FieldTooLong(_))
    ));
}

#[test]
fn truncated_and_oversized_binaries_rejected() {
    let short = Bytes::from(vec![0x10; 100]);
    assert!(matches!(
        Cube::decode(short, ParserTable::Full),
        Err(CubeError::BadSize { got: 100, .. })
    ));

    let long = Bytes::from(vec![0x10; CUBE_SIZE + 1]);
    assert!(matches!(
        Cube::decode(long, ParserTable::Full),
        Err(CubeError::BadSize { .. })
    ));
}

#[test]
fn malformed_tlv_length_rejected() {
    // A FROZEN frame whose first field claims to run past the back
    // positional region.
    let mut raw = vec![0u8; CUBE_SIZE];
    raw[0] = 0x10;
    // type PAYLOAD(4), length 1023: crosses into the tail.
    let header = (4u16 | (1023u16 << 6)).to_le_bytes();
    raw[1] = header[0];
    raw[2] = header[1];
    assert!(matches!(
        Cube::decode(Bytes::from(raw), ParserTable::Full),
        Err(CubeError::MalformedField { .. })
    ));
}

#[tokio::test]
async fn tampered_signature_fails_verification() {
    let signer = test_signer(3);
    let cube = muc(&signer, b"signed", 123).await;

    let mut raw = cube.binary().to_vec();
    let sig_byte = CUBE_SIZE - 1;
    raw[sig_byte] ^= 0xFF;
    let tampered = Cube::decode(Bytes::from(raw), ParserTable::Full).expect("grammar ok");
    assert!(matches!(
        tampered.verify_signature(),
        Err(CubeError::SignatureInvalid)
    ));
}

#[tokio::test]
async fn signature_from_wrong_key_fails() {
    // Hand-build a frame carrying A's public key but B's signature.
    let a = test_signer(4);
    let b = test_signer(5);
    let cube = muc(&a, b"forged", 99).await;

    let mut raw = cube.binary().to_vec();
    let layout = FamilyLayout::for_kind(CubeKind::Muc);
    let forged = b.sign(&raw[..layout.signable_end()]);
    raw[layout.signable_end()..].copy_from_slice(&forged.to_bytes());

    let forged_cube =
        Cube::decode(Bytes::from(raw), ParserTable::Full).expect("grammar ok");
    assert!(forged_cube.verify_signature().is_err());
}

#[tokio::test]
async fn difficulty_gate() {
    // Zero-difficulty sculpt virtually never clears 16 bits.
    let cube = frozen(b"weak", 1).await;
    if cube.difficulty() < 16 {
        assert!(matches!(
            cube.verify(16),
            Err(CubeError::InsufficientDifficulty { required: 16, .. })
        ));
    }
    // And a real search clears a small threshold.
    let strong = CubeBuilder::frozen()
        .payload(Bytes::from_static(b"strong"))
        .expect("fits")
        .sculpt(8, None)
        .await
        .expect("sculpt");
    assert!(strong.difficulty() >= 8);
    strong.verify(8).expect("clears its own threshold");
}

#[tokio::test]
async fn relationship_cardinality_enforced() -> Result<()> {
    let mut builder = CubeBuilder::frozen();
    builder = builder
        .relates_to(RelationshipType::ContinuedIn, CubeKey::new([1; 32]))?;
    // CONTINUED_IN is single-valued.
    let err = builder.relates_to(RelationshipType::ContinuedIn, CubeKey::new([2; 32]));
    assert!(matches!(
        err,
        Err(CubeError::TooManyRelationships {
            rel_type: RelationshipType::ContinuedIn,
            ..
        })
    ));
    Ok(())
}

#[tokio::test]
async fn relationships_decode_in_order() -> Result<()> {
    let k1 = CubeKey::new([1; 32]);
    let k2 = CubeKey::new([2; 32]);
    let cube = CubeBuilder::frozen()
        .relates_to(RelationshipType::ReplyTo, k1)?
        .relates_to(RelationshipType::Mention, k2)?
        .date(5)
        .sculpt(0, None)
        .await?;

    let rels = redecode(&cube, ParserTable::Full).relationships();
    assert_eq!(rels.len(), 2);
    assert_eq!(rels[0].rel_type, RelationshipType::ReplyTo);
    assert_eq!(rels[0].remote_key, k1);
    assert_eq!(rels[1].rel_type, RelationshipType::Mention);
    assert_eq!(rels[1].remote_key, k2);
    Ok(())
}

#[tokio::test]
async fn notify_bit_and_field_agree() -> Result<()> {
    let nk = CubeKey::new([9; 32]);
    let cube = CubeBuilder::frozen()
        .notify(nk)?
        .payload(Bytes::from_static(b"ping"))?
        .sculpt(0, None)
        .await?;

    assert_eq!(cube.binary()[0], 0x11); // FROZEN_NOTIFY
    assert_eq!(cube.notify_key(), Some(nk));
    let decoded = redecode(&cube, ParserTable::Full);
    assert!(decoded.cube_type().notify);
    assert_eq!(decoded.notify_key(), Some(nk));
    Ok(())
}
