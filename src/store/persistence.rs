// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Append-only key/value backend for cube binaries, backed by sled.
//!
//! Keys are the 64-char hex form of the cube key, values the raw 1024
//! bytes. Cubes live in their own tree; the default tree holds a single
//! versioned header so a schema bump can trigger a rebuild on open.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Schema version written into the database header.
pub const SCHEMA_VERSION: u32 = 1;

const HEADER_KEY: &str = "header";
const CUBE_TREE: &str = "cubes";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database is closed")]
    Closed,

    #[error("database header is corrupt")]
    CorruptHeader,

    #[error("database schema version {0} is newer than this build supports")]
    VersionFromTheFuture(u32),

    #[error(transparent)]
    Backend(#[from] sled::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct DbHeader {
    version: u32,
}

/// Handle to the on-disk cube backend. Cheap to clone; all clones share
/// the closed flag.
#[derive(Clone)]
pub struct CubeDb {
    db: sled::Db,
    cubes: sled::Tree,
    closed: Arc<AtomicBool>,
}

impl CubeDb {
    /// Open (or create) the database, verifying the schema header and
    /// migrating older layouts. Returns only once the backend is ready
    /// for operations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        let cubes = db.open_tree(CUBE_TREE)?;

        match db.get(HEADER_KEY)? {
            None => {
                let header = DbHeader {
                    version: SCHEMA_VERSION,
                };
                let raw = serde_json::to_vec(&header)
                    .map_err(|_| PersistenceError::CorruptHeader)?;
                db.insert(HEADER_KEY, raw)?;
            },
            Some(raw) => {
                let header: DbHeader = serde_json::from_slice(&raw)
                    .map_err(|_| PersistenceError::CorruptHeader)?;
                if header.version > SCHEMA_VERSION {
                    return Err(PersistenceError::VersionFromTheFuture(header.version));
                }
                if header.version < SCHEMA_VERSION {
                    Self::migrate(&db, &cubes, header.version)?;
                }
            },
        }

        info!(cube_count = cubes.len(), "cube database ready");
        Ok(Self {
            db,
            cubes,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Rebuild derived state for an older schema and bump the header.
    /// Version 1 is the first schema, so today this only rewrites the
    /// header; the hook is where index rebuilds for later bumps go.
    fn migrate(
        db: &sled::Db,
        cubes: &sled::Tree,
        from: u32,
    ) -> Result<(), PersistenceError> {
        info!(from, to = SCHEMA_VERSION, cubes = cubes.len(), "migrating cube database");
        let raw = serde_json::to_vec(&DbHeader {
            version: SCHEMA_VERSION,
        })
        .map_err(|_| PersistenceError::CorruptHeader)?;
        db.insert(HEADER_KEY, raw)?;
        Ok(())
    }

    fn guard(&self) -> Result<(), PersistenceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistenceError::Closed);
        }
        Ok(())
    }

    pub fn put(&self, key_hex: &str, binary: &[u8]) -> Result<(), PersistenceError> {
        self.guard()?;
        self.cubes.insert(key_hex, binary)?;
        Ok(())
    }

    pub fn get(&self, key_hex: &str) -> Result<Option<Bytes>, PersistenceError> {
        self.guard()?;
        Ok(self
            .cubes
            .get(key_hex)?
            .map(|ivec| Bytes::copy_from_slice(&ivec)))
    }

    pub fn del(&self, key_hex: &str) -> Result<bool, PersistenceError> {
        self.guard()?;
        Ok(self.cubes.remove(key_hex)?.is_some())
    }

    pub fn contains(&self, key_hex: &str) -> Result<bool, PersistenceError> {
        self.guard()?;
        Ok(self.cubes.contains_key(key_hex)?)
    }

    pub fn count(&self) -> usize {
        self.cubes.len()
    }

    /// Iterate `(key, binary)` pairs in key order, starting at
    /// `start` (inclusive) when given, up to `limit` entries.
    pub fn iterate(
        &self,
        start: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Bytes)>, PersistenceError> {
        self.guard()?;
        let iter = match start {
            Some(s) => self.cubes.range(s.as_bytes().to_vec()..),
            None => self.cubes.range::<Vec<u8>, _>(..),
        };
        let mut out = Vec::new();
        for entry in iter.take(limit) {
            let (k, v) = entry?;
            out.push((
                String::from_utf8_lossy(&k).into_owned(),
                Bytes::copy_from_slice(&v),
            ));
        }
        Ok(out)
    }

    /// Up to `count` keys strictly after `start_key`, optionally
    /// wrapping around to the beginning of the keyspace. The cursor
    /// never yields `start_key` itself.
    pub fn succeeding_keys(
        &self,
        start_key: &str,
        count: usize,
        wraparound: bool,
    ) -> Result<Vec<String>, PersistenceError> {
        self.guard()?;
        let mut out = Vec::with_capacity(count);

        let mut lower = start_key.as_bytes().to_vec();
        lower.push(0); // strictly-greater bound
        for entry in self.cubes.range(lower..).take(count) {
            let (k, _) = entry?;
            out.push(String::from_utf8_lossy(&k).into_owned());
        }

        if wraparound && out.len() < count {
            let missing = count - out.len();
            for entry in self.cubes.iter().take(missing) {
                let (k, _) = entry?;
                let key = String::from_utf8_lossy(&k).into_owned();
                // The wrapped pass covers only the keyspace before the
                // cursor; the cursor key itself is never yielded.
                if key.as_str() >= start_key {
                    break;
                }
                out.push(key);
            }
        }

        Ok(out)
    }

    /// The n-th key in sort order, if the database holds that many.
    pub fn key_at_position(&self, n: usize) -> Result<Option<String>, PersistenceError> {
        self.guard()?;
        match self.cubes.iter().nth(n) {
            Some(entry) => {
                let (k, _) = entry?;
                Ok(Some(String::from_utf8_lossy(&k).into_owned()))
            },
            None => Ok(None),
        }
    }

    /// Flush dirty pages to disk.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        self.guard()?;
        self.cubes.flush_async().await?;
        self.db.flush_async().await?;
        Ok(())
    }

    /// Flush and refuse all further operations. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.cubes.flush_async().await {
            warn!("cube tree flush on close failed: {e}");
        }
        if let Err(e) = self.db.flush_async().await {
            warn!("database flush on close failed: {e}");
        }
        debug!("cube database closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
