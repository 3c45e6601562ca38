// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dedup cache of `Identity` objects, plus discovery of identities
//! through a shared notification key.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::{
    cfg::config::IdentityConfig,
    client::retriever::CubeRetriever,
    identity::identity::Identity,
    models::{cube_info::CubeInfo, keys::{CubeKey, NotifyKey}},
};

/// One in-flight retrieval, shared by every caller that arrives while
/// the fetch is still running.
type PendingRetrieve = Arc<OnceCell<Option<Arc<Identity>>>>;

/// `key → Identity` map. Concurrent retrievals of the same key share
/// one fetch and resolve to the same object.
pub struct IdentityStore {
    cfg: IdentityConfig,
    required_difficulty: u8,
    identities: DashMap<String, Arc<Identity>>,
    /// In-flight retrievals, keyed like `identities`. The cell makes a
    /// second caller await the first fetch instead of starting its own.
    pending: DashMap<String, PendingRetrieve>,
}

impl IdentityStore {
    pub fn new(cfg: IdentityConfig, required_difficulty: u8) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            required_difficulty,
            identities: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    pub fn get(&self, key: &CubeKey) -> Option<Arc<Identity>> {
        self.identities
            .get(&key.to_hex())
            .map(|r| Arc::clone(r.value()))
    }

    /// Register an identity created elsewhere (e.g. an owned one). An
    /// existing entry for the key wins; the returned object is the one
    /// the store holds.
    pub fn insert(&self, identity: Arc<Identity>) -> Arc<Identity> {
        let hex = identity.key().to_hex();
        Arc::clone(self.identities.entry(hex).or_insert(identity).value())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Fetch-or-return the identity for `key`. A second caller arriving
    /// while the first fetch is still in flight awaits the same fetch
    /// and sees the same object.
    pub async fn retrieve(
        &self,
        retriever: &Arc<CubeRetriever>,
        key: CubeKey,
    ) -> Option<Arc<Identity>> {
        let hex = key.to_hex();
        if let Some(existing) = self.identities.get(&hex) {
            return Some(Arc::clone(existing.value()));
        }

        let cell = self
            .pending
            .entry(hex.clone())
            .or_default()
            .clone();
        let result = cell
            .get_or_init(|| async {
                Identity::retrieve(
                    retriever,
                    key,
                    self.cfg.clone(),
                    self.required_difficulty,
                )
                .await
            })
            .await
            .clone();

        if let Some(identity) = &result {
            self.identities
                .entry(hex.clone())
                .or_insert_with(|| Arc::clone(identity));
        }
        self.pending.remove(&hex);
        self.identities
            .get(&hex)
            .map(|r| Arc::clone(r.value()))
            .or(result)
    }

    /// Wrap an already-admitted root cube, deduplicating by key. The
    /// existing object absorbs the revision instead of being replaced.
    pub async fn observe_root(
        &self,
        retriever: &Arc<CubeRetriever>,
        info: &CubeInfo,
    ) -> Option<Arc<Identity>> {
        let root = match info.cube() {
            Ok(cube) => cube,
            Err(e) => {
                debug!(key = %info.key, "notifying cube failed to parse: {e}");
                return None;
            },
        };
        if let Some(existing) = self.get(&info.key) {
            existing.absorb_root(&root).await;
            return Some(existing);
        }
        let identity = Identity::from_root(
            retriever,
            &root,
            self.cfg.clone(),
            self.required_difficulty,
        )
        .await;
        Some(self.insert(identity))
    }
}

/// Async stream of identities whose root cubes carry `notify_key`,
/// deduplicated by identity key. With `subscribe` the stream never
/// terminates; new identities appear as their roots arrive.
pub fn notifying_identities(
    retriever: Arc<CubeRetriever>,
    notify_key: NotifyKey,
    store: Arc<IdentityStore>,
    subscribe: bool,
) -> impl Stream<Item = Arc<Identity>> + Send {
    async_stream::stream! {
        let application = store.cfg.application_string.clone();
        let mut seen: std::collections::HashSet<CubeKey> =
            std::collections::HashSet::new();

        if subscribe {
            let mut source =
                std::pin::pin!(retriever.subscribe_notifications(notify_key));
            while let Some(info) = source.next().await {
                if let Some(identity) =
                    identity_from_notification(&retriever, &store, &application, &info)
                        .await
                    && seen.insert(identity.key())
                {
                    yield identity;
                }
            }
        } else {
            let mut source = std::pin::pin!(retriever.get_notifications(&notify_key));
            while let Some(info) = source.next().await {
                if let Some(identity) =
                    identity_from_notification(&retriever, &store, &application, &info)
                        .await
                    && seen.insert(identity.key())
                {
                    yield identity;
                }
            }
        }
    }
}

/// Filter one notification hit down to an identity root: mutable kind,
/// matching application tag, then materialize through the store.
async fn identity_from_notification(
    retriever: &Arc<CubeRetriever>,
    store: &Arc<IdentityStore>,
    application: &str,
    info: &CubeInfo,
) -> Option<Arc<Identity>> {
    if !info.cube_type.kind.is_mutable() {
        return None;
    }
    let cube = info.cube().ok()?;
    if cube.application().as_deref() != Some(application) {
        return None;
    }
    store.observe_root(retriever, info).await
}
