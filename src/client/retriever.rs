// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Local-first fetch façade over `(CubeStore, RequestScheduler)`.
//! Never mutates cubes, never persists; misses are routed to the
//! network and a timeout comes back as `None`.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_stream::stream;
use tokio_stream::Stream;
use tracing::debug;

use crate::{
    client::scheduler::{RequestScheduler, RetrievalError},
    models::{
        cube::Cube,
        cube_info::CubeInfo,
        errors::CubeError,
        family::ParserTable,
        keys::{CubeKey, NotifyKey},
    },
    store::cube_store::CubeStore,
};

/// Per-call retrieval knobs; `None` falls back to the configured
/// scheduler defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetrievalOptions {
    pub timeout: Option<Duration>,
    pub schedule_in: Option<Duration>,
    /// Parser table for materializing the fetched cube.
    pub parser: Option<ParserTable>,
}

/// Drops the scheduler-side subscription registration once the stream
/// consumer goes away.
struct SubscriptionGuard {
    scheduler: Arc<RequestScheduler>,
    notify_key: NotifyKey,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.scheduler.release_notifications(&self.notify_key);
    }
}

pub struct CubeRetriever {
    store: Arc<CubeStore>,
    scheduler: Arc<RequestScheduler>,
}

impl CubeRetriever {
    pub fn new(store: Arc<CubeStore>, scheduler: Arc<RequestScheduler>) -> Arc<Self> {
        Arc::new(Self { store, scheduler })
    }

    pub fn store(&self) -> &Arc<CubeStore> {
        &self.store
    }

    /// Local hit when present, otherwise one scheduled network fetch.
    /// Timeouts and missing peers resolve to `None`.
    pub async fn get_cube_info(
        &self,
        key: &CubeKey,
        options: RetrievalOptions,
    ) -> Option<CubeInfo> {
        if let Some(info) = self.store.get_cube_info(key) {
            return Some(info);
        }
        match self
            .scheduler
            .request_cube(*key, options.schedule_in, options.timeout)
            .await
        {
            Ok(info) => Some(info),
            Err(RetrievalError::Timeout) | Err(RetrievalError::Unavailable) => {
                debug!(key = %key, "cube not retrievable");
                None
            },
            Err(RetrievalError::ShuttingDown) => None,
        }
    }

    /// Convenience wrapper materializing the cube object.
    pub async fn get_cube(
        &self,
        key: &CubeKey,
        options: RetrievalOptions,
    ) -> Result<Option<Arc<Cube>>, CubeError> {
        let Some(info) = self.get_cube_info(key, options).await else {
            return Ok(None);
        };
        let cube = match options.parser {
            Some(table) => info.cube_with(table)?,
            None => info.cube()?,
        };
        Ok(Some(cube))
    }

    /// Existing local matches only; no network subscription.
    pub fn get_notifications(
        &self,
        notify_key: &NotifyKey,
    ) -> impl Stream<Item = CubeInfo> + Send + use<> {
        tokio_stream::iter(self.store.notification_cube_infos(notify_key))
    }

    /// Backlog of local matches, then the live scheduler stream,
    /// deduplicated by `(key, revision)`. Runs until the consumer drops
    /// the stream, which also releases the scheduler registration.
    ///
    /// The scheduler registration is opened here, not on first poll, so
    /// cubes arriving between subscribing and polling are not lost.
    pub fn subscribe_notifications(
        &self,
        notify_key: NotifyKey,
    ) -> impl Stream<Item = CubeInfo> + Send + use<> {
        let store = Arc::clone(&self.store);
        let scheduler = Arc::clone(&self.scheduler);
        let live = scheduler.request_notifications(&notify_key);
        let guard = SubscriptionGuard {
            scheduler,
            notify_key,
        };
        stream! {
            let mut live = live;
            let _guard = guard;

            let mut seen: HashSet<(String, [u8; 32])> = HashSet::new();
            for info in store.notification_cube_infos(&notify_key) {
                seen.insert((info.key_hex.clone(), info.core_hash));
                yield info;
            }

            loop {
                match live.recv().await {
                    Ok(info) => {
                        if seen.insert((info.key_hex.clone(), info.core_hash)) {
                            yield info;
                        }
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "notification stream lagged");
                        continue;
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
