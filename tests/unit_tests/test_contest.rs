// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use verity::{
    models::{cube_info::{CubeInfo, contest}, family::ParserTable},
    store::cube_store::CubeStore,
};

use crate::unit_tests::{memory_config, muc, test_signer};

#[tokio::test]
async fn newer_date_wins_either_order() -> Result<()> {
    // Scenario: two revisions under one key, added in both orders.
    let signer = test_signer(10);
    let v1 = muc(&signer, b"v1", 1000).await;
    let v2 = muc(&signer, b"v2", 1001).await;
    let key = v1.key();

    let store = CubeStore::new_in_memory(&memory_config(0));
    store.add_cube(v1.clone()).expect("v1 admitted");
    store.add_cube(v2.clone()).expect("v2 admitted");
    let held = store.get_cube(&key, None)?.expect("present");
    assert_eq!(held.payload(), Some(&b"v2"[..]));

    // Reversed order converges to the same winner.
    let store = CubeStore::new_in_memory(&memory_config(0));
    store.add_cube(v2).expect("v2 admitted");
    // The stale revision loses the contest and is dropped silently.
    assert!(store.add_cube(v1).is_none());
    let held = store.get_cube(&key, None)?.expect("present");
    assert_eq!(held.payload(), Some(&b"v2"[..]));
    Ok(())
}

#[tokio::test]
async fn update_count_dominates_date() -> Result<()> {
    let signer = test_signer(11);
    let newer_date = verity::models::cube::CubeBuilder::pmuc()
        .payload(bytes::Bytes::from_static(b"count1"))?
        .update_count(1)?
        .date(5000)
        .sculpt(0, Some(&signer))
        .await?;
    let higher_count = verity::models::cube::CubeBuilder::pmuc()
        .payload(bytes::Bytes::from_static(b"count9"))?
        .update_count(9)?
        .date(1000)
        .sculpt(0, Some(&signer))
        .await?;

    let a = CubeInfo::from_cube(newer_date, ParserTable::Full);
    let b = CubeInfo::from_cube(higher_count, ParserTable::Full);
    // The older cube with the higher counter wins regardless of date.
    assert_eq!(contest(&a, &b).key_hex, b.key_hex);
    assert_eq!(contest(&a, &b).update_count, 9);
    assert_eq!(contest(&b, &a).update_count, 9);
    Ok(())
}

#[tokio::test]
async fn date_tie_breaks_on_smaller_hash() {
    let signer = test_signer(12);
    let m1 = muc(&signer, b"tie-a", 777).await;
    let m2 = muc(&signer, b"tie-b", 777).await;

    let a = CubeInfo::from_cube(m1, ParserTable::Full);
    let b = CubeInfo::from_cube(m2, ParserTable::Full);
    let expected = if a.core_hash < b.core_hash {
        a.core_hash
    } else {
        b.core_hash
    };
    assert_eq!(contest(&a, &b).core_hash, expected);
    assert_eq!(contest(&b, &a).core_hash, expected);
}

#[tokio::test]
async fn contest_is_symmetric_across_inputs() {
    // Determinism sweep over a small revision matrix: the winner only
    // depends on (update_count, date, hash), never on argument order.
    let signer = test_signer(13);
    let mut infos = Vec::new();
    for (payload, date) in [
        (&b"a"[..], 100u64),
        (&b"b"[..], 100),
        (&b"c"[..], 200),
        (&b"d"[..], 300),
    ] {
        let cube = muc(&signer, payload, date).await;
        infos.push(CubeInfo::from_cube(cube, ParserTable::Full));
    }

    for x in &infos {
        for y in &infos {
            let xy = contest(x, y);
            let yx = contest(y, x);
            assert_eq!(xy.core_hash, yx.core_hash, "contest must be symmetric");
        }
    }
}

#[tokio::test]
async fn losing_revision_leaves_store_untouched() -> Result<()> {
    let signer = test_signer(14);
    let winner = muc(&signer, b"keep", 2000).await;
    let loser = muc(&signer, b"drop", 1999).await;
    let key = winner.key();

    let store = CubeStore::new_in_memory(&memory_config(0));
    store.add_cube(winner).expect("admitted");
    assert_eq!(store.cube_count(), 1);

    // A contest loss is soft: no error, nothing replaced.
    let out = store.add_cube(loser);
    assert!(out.is_none());
    assert_eq!(store.cube_count(), 1);
    let held = store.get_cube(&key, None)?.expect("present");
    assert_eq!(held.payload(), Some(&b"keep"[..]));
    Ok(())
}
