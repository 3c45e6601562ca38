// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use serial_test::serial;
use verity::store::persistence::{CubeDb, PersistenceError};

fn fake_cube(fill: u8) -> Vec<u8> {
    vec![fill; 1024]
}

fn hex_key(fill: u8) -> String {
    hex::encode([fill; 32])
}

#[tokio::test]
#[serial]
async fn put_get_del_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = CubeDb::open(dir.path().join("db"))?;

    let key = hex_key(0x11);
    assert!(db.get(&key)?.is_none());

    db.put(&key, &fake_cube(0xAB))?;
    let got = db.get(&key)?.expect("stored");
    assert_eq!(got.len(), 1024);
    assert_eq!(got[0], 0xAB);
    assert_eq!(db.count(), 1);

    assert!(db.del(&key)?);
    assert!(!db.del(&key)?);
    assert!(db.get(&key)?.is_none());
    db.close().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn iteration_is_key_ordered() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = CubeDb::open(dir.path().join("db"))?;

    for fill in [0x30u8, 0x10, 0x20] {
        db.put(&hex_key(fill), &fake_cube(fill))?;
    }

    let all = db.iterate(None, 16)?;
    let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec![hex_key(0x10), hex_key(0x20), hex_key(0x30)]);

    // Bounded iteration from a midpoint.
    let tail = db.iterate(Some(&hex_key(0x20)), 16)?;
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].0, hex_key(0x20));
    db.close().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn succeeding_keys_wraps_around() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = CubeDb::open(dir.path().join("db"))?;

    for fill in [0x10u8, 0x20, 0x30] {
        db.put(&hex_key(fill), &fake_cube(fill))?;
    }

    // Plain successor walk.
    let next = db.succeeding_keys(&hex_key(0x10), 2, false)?;
    assert_eq!(next, vec![hex_key(0x20), hex_key(0x30)]);

    // Wraparound restarts at the first key but never re-yields the
    // cursor.
    let wrapped = db.succeeding_keys(&hex_key(0x20), 3, true)?;
    assert_eq!(wrapped, vec![hex_key(0x30), hex_key(0x10)]);

    // From the last key everything else comes back in order.
    let from_end = db.succeeding_keys(&hex_key(0x30), 8, true)?;
    assert_eq!(from_end, vec![hex_key(0x10), hex_key(0x20)]);
    db.close().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn key_at_position_indexes_sorted_order() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = CubeDb::open(dir.path().join("db"))?;

    for fill in [0x50u8, 0x40] {
        db.put(&hex_key(fill), &fake_cube(fill))?;
    }
    assert_eq!(db.key_at_position(0)?, Some(hex_key(0x40)));
    assert_eq!(db.key_at_position(1)?, Some(hex_key(0x50)));
    assert_eq!(db.key_at_position(2)?, None);
    db.close().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn closed_database_returns_typed_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = CubeDb::open(dir.path().join("db"))?;
    db.put(&hex_key(0x60), &fake_cube(1))?;
    db.close().await;

    assert!(db.is_closed());
    assert!(matches!(
        db.put(&hex_key(0x61), &fake_cube(2)),
        Err(PersistenceError::Closed)
    ));
    assert!(matches!(db.get(&hex_key(0x60)), Err(PersistenceError::Closed)));
    // Closing twice is harmless.
    db.close().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn header_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db");
    {
        let db = CubeDb::open(&path)?;
        db.put(&hex_key(0x70), &fake_cube(7))?;
        db.close().await;
    }
    // Reopening a current-version database keeps its contents.
    let db = CubeDb::open(&path)?;
    assert_eq!(db.count(), 1);
    assert!(db.get(&hex_key(0x70))?.is_some());
    db.close().await;
    Ok(())
}
