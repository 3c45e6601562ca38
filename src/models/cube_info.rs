// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-cube store metadata, the dormant-cube handle and the contest
//! that picks one winner among MUC revisions sharing a key.

use core::fmt;
use std::{cmp::Ordering, sync::Arc};

use bytes::Bytes;
use chrono::DateTime;
use once_cell::sync::OnceCell;

use crate::models::{
    cube::Cube,
    cube_type::CubeType,
    errors::CubeError,
    family::ParserTable,
    keys::{CubeKey, NotifyKey},
};

/// Lightweight metadata for one stored cube.
///
/// The parsed [`Cube`] is materialized lazily: a `CubeInfo` freshly
/// loaded from persistence holds only the raw 1024 bytes (*dormant*)
/// and re-parses on first access, with the same parser table that
/// admitted it.
#[derive(Clone)]
pub struct CubeInfo {
    pub key: CubeKey,
    /// Canonical map / persistence key: 64-char lowercase hex.
    pub key_hex: String,
    pub cube_type: CubeType,
    /// Sculpt date, Unix seconds.
    pub date: u64,
    /// PMUC revision counter; zero for every other kind.
    pub update_count: u32,
    /// Leading zero bits of the core hash.
    pub difficulty: u8,
    /// Contest tiebreak value and FROZEN/PIC content key.
    pub core_hash: [u8; 32],
    /// NOTIFY routing key, when the cube carries one.
    pub notify_key: Option<NotifyKey>,
    /// Which field table parsed this cube on admission.
    pub parser: ParserTable,
    binary: Bytes,
    cube: OnceCell<Arc<Cube>>,
}

impl CubeInfo {
    /// Wrap an already-parsed cube.
    ///
    /// The parsed object is only cached when it matches the recorded
    /// parser table; a core-table store drops it so rehydration goes
    /// through the core grammar like any other dormant cube.
    pub fn from_cube(cube: Cube, parser: ParserTable) -> Self {
        let key = cube.key();
        let info = Self {
            key,
            key_hex: key.to_hex(),
            cube_type: cube.cube_type(),
            date: cube.date(),
            update_count: cube.update_count(),
            difficulty: cube.difficulty(),
            core_hash: *cube.core_hash(),
            notify_key: cube.notify_key(),
            parser,
            binary: cube.binary().clone(),
            cube: OnceCell::new(),
        };
        if parser == ParserTable::Full {
            let _ = info.cube.set(Arc::new(cube));
        }
        info
    }

    /// Index raw persisted bytes without keeping the parsed object: the
    /// cube is decoded once for its metadata and immediately dropped.
    pub fn dormant(binary: Bytes, parser: ParserTable) -> Result<Self, CubeError> {
        // Metadata extraction needs the full grammar even for cubes that
        // will later rehydrate through the core table.
        let cube = Cube::decode(binary.clone(), ParserTable::Full)?;
        let key = cube.key();
        Ok(Self {
            key,
            key_hex: key.to_hex(),
            cube_type: cube.cube_type(),
            date: cube.date(),
            update_count: cube.update_count(),
            difficulty: cube.difficulty(),
            core_hash: *cube.core_hash(),
            notify_key: cube.notify_key(),
            parser,
            binary,
            cube: OnceCell::new(),
        })
    }

    /// The raw 1024 bytes.
    #[inline]
    pub fn binary(&self) -> &Bytes {
        &self.binary
    }

    /// Whether the parsed object is currently materialized.
    pub fn is_dormant(&self) -> bool {
        self.cube.get().is_none()
    }

    /// Materialize the cube, re-parsing dormant bytes with the recorded
    /// table.
    pub fn cube(&self) -> Result<Arc<Cube>, CubeError> {
        self.cube
            .get_or_try_init(|| {
                Cube::decode(self.binary.clone(), self.parser).map(Arc::new)
            })
            .cloned()
    }

    /// Materialize with an explicit parser table instead of the
    /// recorded one. Bypasses the dormancy cache.
    pub fn cube_with(&self, parser: ParserTable) -> Result<Arc<Cube>, CubeError> {
        if parser == self.parser {
            return self.cube();
        }
        Cube::decode(self.binary.clone(), parser).map(Arc::new)
    }

    /// Deterministic total order among revisions sharing a key: higher
    /// update count wins, then newer date, then the lexicographically
    /// smaller core hash (byte-wise, i.e. big-endian unsigned).
    pub fn contest_order(&self, other: &Self) -> Ordering {
        self.update_count
            .cmp(&other.update_count)
            .then(self.date.cmp(&other.date))
            .then_with(|| other.core_hash.cmp(&self.core_hash))
    }

    /// True when `self` beats (or equals) `other` in the contest.
    pub fn wins_contest_against(&self, other: &Self) -> bool {
        self.contest_order(other) != Ordering::Less
    }
}

/// Pick the contest winner among two revisions. Symmetric:
/// `contest(a, b)` and `contest(b, a)` name the same cube.
pub fn contest<'a>(a: &'a CubeInfo, b: &'a CubeInfo) -> &'a CubeInfo {
    match a.contest_order(b) {
        Ordering::Less => b,
        _ => a,
    }
}

impl fmt::Debug for CubeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CubeInfo")
            .field("key", &self.key)
            .field("type", &self.cube_type)
            .field("date", &self.date)
            .field("update_count", &self.update_count)
            .field("difficulty", &self.difficulty)
            .field("dormant", &self.is_dormant())
            .finish()
    }
}

impl fmt::Display for CubeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = DateTime::from_timestamp(self.date as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| self.date.to_string());
        write!(f, "{} {} sculpted {}", self.cube_type, self.key, when)
    }
}
