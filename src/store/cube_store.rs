// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The authoritative in-process cube index: admission gating, the MUC
//! contest, the notification index and the `cube_added` event stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    models::{
        cube::Cube,
        cube_info::CubeInfo,
        errors::CubeError,
        family::ParserTable,
        keys::{CubeKey, NotifyKey},
    },
    store::persistence::CubeDb,
};

/// Buffered admissions a lagging event listener may fall behind by
/// before it starts losing the oldest ones.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out from the store to its listeners, in admission order.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A cube was admitted, or a MUC revision replaced a stored one.
    CubeAdded(CubeInfo),
    /// An admitted cube carries a NOTIFY routing field.
    NotificationAdded {
        notify_key: NotifyKey,
        info: CubeInfo,
    },
}

/// Outcome of one admission attempt. The soft outcomes (`Duplicate`,
/// `ContestLost`) are not errors; callers that only care about success
/// use [`Admission::accepted`].
#[derive(Debug)]
pub enum Admission {
    /// New key, cube stored and announced.
    Stored(CubeInfo),
    /// Same key, incoming revision won the contest and replaced the
    /// stored cube.
    Replaced(CubeInfo),
    /// Byte-identical cube already present; nothing re-emitted.
    Duplicate(CubeInfo),
    /// Same key, the stored revision won; it is returned unchanged.
    ContestLost(CubeInfo),
    /// Validation failed; the store is untouched.
    Rejected(CubeError),
    /// The store no longer accepts writes.
    ShuttingDown,
}

impl Admission {
    /// The cube now (or already) held under the key, if admission did
    /// not fail outright.
    pub fn accepted(&self) -> Option<&CubeInfo> {
        match self {
            Self::Stored(info) | Self::Replaced(info) | Self::Duplicate(info) => {
                Some(info)
            },
            Self::ContestLost(_) | Self::Rejected(_) | Self::ShuttingDown => None,
        }
    }
}

/// Key→cube index with persistence bridge and event fan-out.
///
/// The store is the sole writer to its map and to persistence; every
/// lookup observes a consistent snapshot.
pub struct CubeStore {
    cubes: DashMap<String, CubeInfo>,
    /// notify-key hex → cube keys carrying it, in admission order.
    notify_index: DashMap<String, Vec<CubeKey>>,
    db: Option<CubeDb>,
    parser: ParserTable,
    required_difficulty: u8,
    events: broadcast::Sender<StoreEvent>,
    shutdown: CancellationToken,
}

impl CubeStore {
    /// Open the store, loading every persisted cube as a dormant
    /// `CubeInfo` when persistence is enabled.
    pub fn open(cfg: &Config) -> Result<Arc<Self>> {
        let db = if cfg.store.enable_cube_persistence {
            Some(CubeDb::open(&cfg.store.path).context("failed to open cube database")?)
        } else {
            None
        };
        let store = Self::with_db(cfg, db);

        if let Some(db) = &store.db {
            let mut cursor: Option<String> = None;
            loop {
                let batch = db.iterate(cursor.as_deref(), 1024)?;
                let Some((last, _)) = batch.last() else { break };
                cursor = Some(format!("{last}\0"));
                for (key_hex, binary) in &batch {
                    match CubeInfo::dormant(binary.clone(), store.parser) {
                        Ok(info) => {
                            if let Some(nk) = info.notify_key {
                                store
                                    .notify_index
                                    .entry(nk.to_hex())
                                    .or_default()
                                    .push(info.key);
                            }
                            store.cubes.insert(key_hex.clone(), info);
                        },
                        Err(e) => {
                            warn!(key = %key_hex, "skipping undecodable persisted cube: {e}");
                        },
                    }
                }
            }
            debug!(count = store.cubes.len(), "store re-indexed from persistence");
        }

        Ok(Arc::new(store))
    }

    /// A memory-only store; nothing survives the process.
    pub fn new_in_memory(cfg: &Config) -> Arc<Self> {
        Arc::new(Self::with_db(cfg, None))
    }

    fn with_db(cfg: &Config, db: Option<CubeDb>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            cubes: DashMap::new(),
            notify_index: DashMap::new(),
            db,
            parser: cfg.store.parser,
            required_difficulty: cfg.pow.required_difficulty,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Admit a parsed cube. Failures are logged and reported as `None`;
    /// admission never panics and never propagates codec errors.
    pub fn add_cube(&self, cube: Cube) -> Option<CubeInfo> {
        self.admit(cube).accepted().cloned()
    }

    /// Admit a raw 1024-byte frame.
    pub fn add_binary(&self, binary: Bytes) -> Option<CubeInfo> {
        self.admit_binary(binary).accepted().cloned()
    }

    pub fn admit_binary(&self, binary: Bytes) -> Admission {
        match Cube::decode(binary, ParserTable::Full) {
            Ok(cube) => self.admit(cube),
            Err(e) => {
                warn!("rejecting undecodable cube: {e}");
                Admission::Rejected(e)
            },
        }
    }

    /// Full admission pipeline: difficulty and signature gates, then
    /// the per-key contest, persistence and event fan-out.
    pub fn admit(&self, cube: Cube) -> Admission {
        if self.shutdown.is_cancelled() {
            debug!("admission refused: store is shutting down");
            return Admission::ShuttingDown;
        }

        if let Err(e) = cube.verify(self.required_difficulty) {
            warn!(key = %cube.key(), "cube rejected: {e}");
            return Admission::Rejected(e);
        }

        let info = CubeInfo::from_cube(cube, self.parser);

        let outcome = match self.cubes.entry(info.key_hex.clone()) {
            dashmap::Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.binary() == info.binary() {
                    debug!(key = %info.key, "duplicate admission ignored");
                    return Admission::Duplicate(existing.clone());
                }
                if !info.cube_type.kind.is_mutable() {
                    // Differing bytes can only share an immutable key on
                    // a hash collision; keep what we have.
                    warn!(key = %info.key, "immutable key collision ignored");
                    return Admission::Duplicate(existing.clone());
                }
                if info.wins_contest_against(existing) {
                    occupied.insert(info.clone());
                    Admission::Replaced(info)
                } else {
                    debug!(key = %info.key, "incoming revision lost the cube contest");
                    return Admission::ContestLost(existing.clone());
                }
            },
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(info.clone());
                Admission::Stored(info)
            },
        };

        // Stored or Replaced past this point.
        let info = match &outcome {
            Admission::Stored(i) | Admission::Replaced(i) => i.clone(),
            _ => return outcome,
        };

        if let Some(db) = &self.db
            && let Err(e) = db.put(&info.key_hex, info.binary())
        {
            // In-memory state stays authoritative until the backend
            // recovers.
            warn!(key = %info.key, "cube persistence failed: {e}");
        }

        let _ = self.events.send(StoreEvent::CubeAdded(info.clone()));
        if let Some(nk) = info.notify_key {
            self.notify_index
                .entry(nk.to_hex())
                .or_default()
                .push(info.key);
            let _ = self.events.send(StoreEvent::NotificationAdded {
                notify_key: nk,
                info: info.clone(),
            });
        }

        outcome
    }

    pub fn has_cube(&self, key: &CubeKey) -> bool {
        self.cubes.contains_key(&key.to_hex())
    }

    pub fn get_cube_info(&self, key: &CubeKey) -> Option<CubeInfo> {
        self.cubes.get(&key.to_hex()).map(|r| r.value().clone())
    }

    /// Materialize the stored cube, rehydrating a dormant one with its
    /// recorded parser table (or `parser` when given).
    pub fn get_cube(
        &self,
        key: &CubeKey,
        parser: Option<ParserTable>,
    ) -> Result<Option<Arc<Cube>>, CubeError> {
        let Some(info) = self.get_cube_info(key) else {
            return Ok(None);
        };
        let cube = match parser {
            Some(table) => info.cube_with(table)?,
            None => info.cube()?,
        };
        Ok(Some(cube))
    }

    pub fn cube_count(&self) -> usize {
        self.cubes.len()
    }

    /// Snapshot iteration over currently held cubes, in no particular
    /// order.
    pub fn all_cube_infos(&self) -> impl Iterator<Item = CubeInfo> + '_ {
        self.cubes.iter().map(|r| r.value().clone())
    }

    /// Cubes whose NOTIFY field matches, in admission order.
    pub fn notification_cube_infos(&self, notify_key: &NotifyKey) -> Vec<CubeInfo> {
        let Some(keys) = self.notify_index.get(&notify_key.to_hex()) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|k| self.get_cube_info(k))
            .collect()
    }

    /// Subscribe to the admission event stream. A receiver that lags
    /// more than the channel capacity loses oldest events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancelled once shutdown begins; listeners use this to unhook
    /// without keeping the store alive.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting admissions, flush persistence and drain
    /// listeners.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        if let Some(db) = &self.db {
            db.close().await;
        }
        debug!("cube store shut down");
    }
}
