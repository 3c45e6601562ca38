// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The identity aggregate: a root mutable cube plus derived extension
//! cubes, together naming a user, their posts and their subscriptions.

use std::{
    collections::{HashSet, VecDeque},
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context as TaskContext, Poll},
};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::{
    sync::{Mutex, broadcast, watch},
    time::{Instant, sleep},
};
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::IdentityConfig,
    client::retriever::{CubeRetriever, RetrievalOptions},
    identity::keys::{CryptoError, IdentityKeys, MasterSeed},
    models::{
        cube::{Cube, CubeBuilder},
        cube_info::CubeInfo,
        field::{FIELD_HEADER_LEN, Field, FieldType},
        keys::{CubeKey, NotifyKey},
        relationship::{RELATIONSHIP_LEN, Relationship, RelationshipType},
    },
    store::cube_store::StoreEvent,
};

/// Application-specific field code carrying the avatar seed in identity
/// root cubes.
pub const AVATAR_FIELD: FieldType = FieldType::Other(32);

/// Wire footprint of one RELATES_TO field: TLV header plus the
/// 33-byte value.
const REL_WIRE_LEN: usize = FIELD_HEADER_LEN + RELATIONSHIP_LEN;

/// Extension chains longer than this are assumed cyclic and abandoned.
const MAX_EXTENSION_CHAIN: usize = 64;

/// Events an identity fans out to its listeners.
#[derive(Debug, Clone)]
pub enum IdentityEvent {
    /// A post key appeared in this identity's lists.
    PostAdded(CubeKey),
    /// Name, avatar or subscription state changed.
    Updated,
}

/// One item of a post stream: the post cube and who authored it.
#[derive(Clone)]
pub struct Post {
    pub author: Arc<Identity>,
    pub key: CubeKey,
    pub info: CubeInfo,
}

/// Mutable aggregate state, serialized behind one lock per identity.
#[derive(Default)]
struct IdentityState {
    name: String,
    avatar_seed: Option<Bytes>,
    notify_key: Option<NotifyKey>,
    /// Post keys in insertion order; the set mirrors it for O(1)
    /// membership.
    posts: Vec<CubeKey>,
    post_set: HashSet<CubeKey>,
    /// Subscribed identity keys, insertion ordered.
    subscriptions: Vec<CubeKey>,
    subscription_set: HashSet<CubeKey>,
    /// Advertised SUBSCRIPTION_RECOMMENDATION keys beyond the followed
    /// set. On the wire the two are indistinguishable; observed roots
    /// land everything in `subscriptions`.
    recommendations: Vec<CubeKey>,
    update_count: u32,
    last_store: Option<Instant>,
}

/// A user: one root mutable cube plus optional derived extensions.
///
/// Owned identities hold the master-seed-derived key set and can
/// publish; observed identities are read-only until
/// [`Identity::supply_master_key`] upgrades them.
pub struct Identity {
    key: CubeKey,
    keys: once_cell::sync::OnceCell<IdentityKeys>,
    cfg: IdentityConfig,
    required_difficulty: u8,
    retriever: Weak<CubeRetriever>,
    state: Mutex<IdentityState>,
    /// Serializes `store()` calls so the rebuild delay is a real gap.
    store_gate: Mutex<()>,
    events: broadcast::Sender<IdentityEvent>,
    ready: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl Identity {
    /// Create an owned identity from a master seed. The root cube does
    /// not exist until the first [`Identity::store`].
    pub fn owned(
        retriever: &Arc<CubeRetriever>,
        master: MasterSeed,
        name: &str,
        cfg: IdentityConfig,
        required_difficulty: u8,
    ) -> Arc<Self> {
        let keys = IdentityKeys::derive(master, &cfg);
        let identity = Self::bare(retriever, keys.public_key(), cfg, required_difficulty);
        let _ = identity.keys.set(keys);
        {
            // No awaits can race: nobody else holds the new identity.
            let mut state = identity
                .state
                .try_lock()
                .expect("freshly created identity state is uncontended");
            state.name = name.to_string();
        }
        let _ = identity.ready.send(true);
        let arc = Arc::new(identity);
        arc.spawn_remote_listener();
        arc
    }

    /// Wrap an observed root cube into a read-only identity.
    pub async fn from_root(
        retriever: &Arc<CubeRetriever>,
        root: &Cube,
        cfg: IdentityConfig,
        required_difficulty: u8,
    ) -> Arc<Self> {
        let identity = Arc::new(Self::bare(
            retriever,
            root.key(),
            cfg,
            required_difficulty,
        ));
        identity.absorb_root(root).await;
        let _ = identity.ready.send(true);
        identity.spawn_remote_listener();
        identity
    }

    /// Fetch the root cube for `key` and wrap it. `None` when the root
    /// is not retrievable.
    pub async fn retrieve(
        retriever: &Arc<CubeRetriever>,
        key: CubeKey,
        cfg: IdentityConfig,
        required_difficulty: u8,
    ) -> Option<Arc<Self>> {
        let root = retriever
            .get_cube(&key, RetrievalOptions::default())
            .await
            .ok()
            .flatten()?;
        if !root.kind().is_mutable() {
            warn!(key = %key, "identity root must be a mutable cube");
            return None;
        }
        Some(Self::from_root(retriever, &root, cfg, required_difficulty).await)
    }

    /// Recover an owned identity from login credentials.
    pub fn from_credentials(
        retriever: &Arc<CubeRetriever>,
        username: &str,
        password: &str,
        cfg: IdentityConfig,
        required_difficulty: u8,
    ) -> Result<Arc<Self>, CryptoError> {
        let master = MasterSeed::from_credentials(
            username,
            password,
            cfg.argon_cpu_hardness,
            cfg.argon_memory_hardness,
        )?;
        Ok(Self::owned(retriever, master, username, cfg, required_difficulty))
    }

    fn bare(
        retriever: &Arc<CubeRetriever>,
        key: CubeKey,
        cfg: IdentityConfig,
        required_difficulty: u8,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (ready, _) = watch::channel(false);
        Self {
            key,
            keys: once_cell::sync::OnceCell::new(),
            cfg,
            required_difficulty,
            retriever: Arc::downgrade(retriever),
            state: Mutex::new(IdentityState::default()),
            store_gate: Mutex::new(()),
            events,
            ready,
            shutdown: CancellationToken::new(),
        }
    }

    /// The identity key (== the root verify key).
    pub fn key(&self) -> CubeKey {
        self.key
    }

    pub fn is_owned(&self) -> bool {
        self.keys.get().is_some()
    }

    /// Upgrade a read-only identity with its master seed. Fails when
    /// the seed does not derive this identity's public key.
    pub fn supply_master_key(&self, master: MasterSeed) -> Result<(), CryptoError> {
        let keys = IdentityKeys::derive(master, &self.cfg);
        if keys.public_key() != self.key {
            return Err(CryptoError::KeyMismatch);
        }
        let _ = self.keys.set(keys);
        Ok(())
    }

    /// Resolves once the root cube has been absorbed (immediately for
    /// owned identities).
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<IdentityEvent> {
        self.events.subscribe()
    }

    pub async fn name(&self) -> String {
        self.state.lock().await.name.clone()
    }

    pub async fn set_name(&self, name: &str) {
        self.state.lock().await.name = name.to_string();
    }

    pub async fn avatar_seed(&self) -> Option<Bytes> {
        self.state.lock().await.avatar_seed.clone()
    }

    pub async fn set_avatar_seed(&self, seed: impl Into<Bytes>) {
        self.state.lock().await.avatar_seed = Some(seed.into());
    }

    pub async fn notify_key(&self) -> Option<NotifyKey> {
        self.state.lock().await.notify_key
    }

    pub async fn set_notify_key(&self, key: Option<NotifyKey>) {
        self.state.lock().await.notify_key = key;
    }

    /// Post keys in insertion order.
    pub async fn post_keys(&self) -> Vec<CubeKey> {
        self.state.lock().await.posts.clone()
    }

    pub async fn subscription_keys(&self) -> Vec<CubeKey> {
        self.state.lock().await.subscriptions.clone()
    }

    pub async fn recommendation_keys(&self) -> Vec<CubeKey> {
        self.state.lock().await.recommendations.clone()
    }

    /// Record a post key. The cube itself is published separately; the
    /// reference travels with the next [`Identity::store`].
    pub async fn add_post(&self, key: CubeKey) {
        let mut state = self.state.lock().await;
        if state.post_set.insert(key) {
            state.posts.push(key);
        }
        drop(state);
        let _ = self.events.send(IdentityEvent::PostAdded(key));
    }

    pub async fn add_subscription(&self, key: CubeKey) {
        let mut state = self.state.lock().await;
        if state.subscription_set.insert(key) {
            state.subscriptions.push(key);
        }
    }

    pub async fn remove_subscription(&self, key: CubeKey) {
        let mut state = self.state.lock().await;
        if state.subscription_set.remove(&key) {
            state.subscriptions.retain(|k| *k != key);
        }
    }

    pub async fn add_recommendation(&self, key: CubeKey) {
        let mut state = self.state.lock().await;
        if !state.recommendations.contains(&key) {
            state.recommendations.push(key);
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Detach listeners; the identity object stays usable for reads.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ── Publishing ──────────────────────────────────────────────────

    /// Compile the aggregate into a fresh root revision (plus extension
    /// cubes when the lists overflow one cube) and admit everything to
    /// the store.
    ///
    /// Successive calls serialize through `min_muc_rebuild_delay`.
    pub async fn store(&self) -> Result<Vec<CubeInfo>> {
        let keys = self
            .keys
            .get()
            .context("cannot publish a read-only identity")?;
        let retriever = self
            .retriever
            .upgrade()
            .context("retriever has shut down")?;

        let _gate = self.store_gate.lock().await;

        // Honor the rebuild delay before touching state.
        let wait = {
            let state = self.state.lock().await;
            state.last_store.map(|t| {
                self.cfg
                    .min_muc_rebuild_delay
                    .saturating_sub(t.elapsed())
            })
        };
        if let Some(wait) = wait
            && !wait.is_zero()
        {
            debug!(key = %self.key, ?wait, "delaying identity republish");
            sleep(wait).await;
        }

        let (snapshot, update_count) = {
            let mut state = self.state.lock().await;
            state.update_count += 1;
            (StateSnapshot::of(&state), state.update_count)
        };

        let cubes = self
            .sculpt_aggregate(keys, &snapshot, update_count)
            .await
            .context("failed to sculpt identity cubes")?;

        let store = retriever.store();
        let mut infos = Vec::with_capacity(cubes.len());
        for cube in cubes {
            let key = cube.key();
            let info = store
                .add_cube(cube)
                .with_context(|| format!("store refused identity cube {key}"))?;
            infos.push(info);
        }

        self.state.lock().await.last_store = Some(Instant::now());
        Ok(infos)
    }

    /// Build the root (and overflow extension) cubes for the current
    /// state. Newest posts first; whatever does not fit spills into a
    /// CONTINUED_IN chain of extension cubes under derived subkeys.
    async fn sculpt_aggregate(
        &self,
        keys: &IdentityKeys,
        snapshot: &StateSnapshot,
        update_count: u32,
    ) -> Result<Vec<Cube>> {
        let mut remaining: VecDeque<Relationship> = VecDeque::new();
        for key in snapshot.posts.iter().rev() {
            remaining.push_back(Relationship::new(RelationshipType::MyPost, *key));
        }
        for key in snapshot
            .subscriptions
            .iter()
            .chain(snapshot.recommendations.iter())
        {
            remaining.push_back(Relationship::new(
                RelationshipType::SubscriptionRecommendation,
                *key,
            ));
        }

        let mut cubes = Vec::new();
        let mut ext_index = 0u32;

        let mut builder = CubeBuilder::pmuc()
            .application(&self.cfg.application_string)?
            .username(&snapshot.name)?
            .update_count(update_count)?;
        if let Some(avatar) = &snapshot.avatar_seed {
            builder = builder.field(Field::new(AVATAR_FIELD, avatar.clone())?);
        }
        if let Some(nk) = snapshot.notify_key {
            builder = builder.notify(nk)?;
        }

        loop {
            builder = fill_with_relationships(builder, &mut remaining)?;

            if remaining.is_empty() {
                let signer = if ext_index == 0 {
                    keys.signing().clone()
                } else {
                    keys.extension_signer(ext_index)
                };
                cubes.push(
                    builder
                        .sculpt(self.required_difficulty, Some(&signer))
                        .await?,
                );
                break;
            }

            // Chain to the next extension cube; its key is derivable
            // before it is sculpted.
            let next_index = ext_index + 1;
            let next_key = keys.extension_key(next_index);
            builder =
                builder.relates_to(RelationshipType::ContinuedIn, next_key)?;
            let signer = if ext_index == 0 {
                keys.signing().clone()
            } else {
                keys.extension_signer(ext_index)
            };
            cubes.push(
                builder
                    .sculpt(self.required_difficulty, Some(&signer))
                    .await?,
            );

            ext_index = next_index;
            builder = CubeBuilder::muc()
                .application(&self.cfg.application_string)?
                .subkey_seed(ext_index)?;
        }

        Ok(cubes)
    }

    // ── Remote updates ──────────────────────────────────────────────

    /// Parse a root revision into state: name, avatar, notify key,
    /// post and subscription lists, following the extension chain.
    /// Emits `PostAdded` per newly referenced post and `Updated` when
    /// anything changed.
    pub async fn absorb_root(&self, root: &Cube) {
        let mut posts: Vec<CubeKey> = Vec::new();
        let mut subscriptions: Vec<CubeKey> = Vec::new();

        let mut name = root.username().unwrap_or_default();
        let avatar_seed = root
            .first_field(AVATAR_FIELD)
            .map(|f| f.value.clone());
        let notify_key = root.notify_key();
        let update_count = root.update_count();

        collect_relationships(root, &mut posts, &mut subscriptions);

        // Follow the CONTINUED_IN chain through extension cubes.
        let mut hops = 0usize;
        let mut visited: HashSet<CubeKey> = HashSet::from([root.key()]);
        let mut next = root
            .relationships_of(RelationshipType::ContinuedIn)
            .first()
            .map(|r| r.remote_key);
        while let Some(ext_key) = next {
            if hops >= MAX_EXTENSION_CHAIN || !visited.insert(ext_key) {
                warn!(key = %self.key, "identity extension chain is cyclic or too long");
                break;
            }
            hops += 1;
            let Some(retriever) = self.retriever.upgrade() else { break };
            let ext = match retriever
                .get_cube(&ext_key, RetrievalOptions::default())
                .await
            {
                Ok(Some(cube)) => cube,
                Ok(None) => {
                    debug!(key = %self.key, ext = %ext_key, "extension cube unavailable");
                    break;
                },
                Err(e) => {
                    warn!(key = %self.key, ext = %ext_key, "extension cube undecodable: {e}");
                    break;
                },
            };
            if name.is_empty()
                && let Some(ext_name) = ext.username()
            {
                name = ext_name;
            }
            collect_relationships(&ext, &mut posts, &mut subscriptions);
            next = ext
                .relationships_of(RelationshipType::ContinuedIn)
                .first()
                .map(|r| r.remote_key);
        }

        // Merge into state under the lock; removed entries stay
        // referenced, cubes do not disappear.
        let (new_posts, changed) = {
            let mut state = self.state.lock().await;
            let mut new_posts = Vec::new();
            for key in &posts {
                if state.post_set.insert(*key) {
                    state.posts.push(*key);
                    new_posts.push(*key);
                }
            }
            let mut changed = !new_posts.is_empty();
            for key in &subscriptions {
                if state.subscription_set.insert(*key) {
                    state.subscriptions.push(*key);
                    changed = true;
                }
            }
            if !name.is_empty() && state.name != name {
                state.name = name;
                changed = true;
            }
            if avatar_seed.is_some() && state.avatar_seed != avatar_seed {
                state.avatar_seed = avatar_seed;
                changed = true;
            }
            if notify_key.is_some() && state.notify_key != notify_key {
                state.notify_key = notify_key;
                changed = true;
            }
            if update_count > state.update_count {
                state.update_count = update_count;
            }
            (new_posts, changed)
        };

        for key in new_posts {
            let _ = self.events.send(IdentityEvent::PostAdded(key));
        }
        if changed {
            let _ = self.events.send(IdentityEvent::Updated);
        }
    }

    /// Follow store admissions for this identity's root key, merging
    /// contest winners into local state.
    fn spawn_remote_listener(self: &Arc<Self>) {
        if !self.cfg.subscribe_remote_changes {
            return;
        }
        let Some(retriever) = self.retriever.upgrade() else {
            return;
        };
        let mut events = retriever.store().subscribe_events();
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => event,
                };
                let info = match event {
                    Ok(StoreEvent::CubeAdded(info)) => info,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(missed = n, "identity listener lagged");
                        continue;
                    },
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(identity) = weak.upgrade() else { return };
                if info.key != identity.key {
                    continue;
                }
                match info.cube() {
                    Ok(root) => identity.absorb_root(&root).await,
                    Err(e) => {
                        warn!(key = %identity.key, "stored root failed to parse: {e}")
                    },
                }
            }
        });
    }

    // ── Post streams ────────────────────────────────────────────────

    /// Stream this identity's posts and, down to `subscription_depth`,
    /// the posts of subscribed identities. Cycles are cut by the
    /// exclusion set; in subscribe mode the stream follows new
    /// admissions after the backlog.
    pub fn get_posts(self: &Arc<Self>, options: GetPostsOptions) -> PostStream {
        let (existing_tx, existing_rx) = watch::channel(false);
        let identity = Arc::clone(self);

        let stream = async_stream::stream! {
            let Some(retriever) = identity.retriever.upgrade() else {
                let _ = existing_tx.send(true);
                return;
            };

            let mut exclude = options.recursion_exclude.clone();
            let mut yielded: HashSet<CubeKey> = HashSet::new();
            // Identities whose roots we watch in subscribe mode, with
            // the post keys already seen per identity.
            let mut watched: Vec<Arc<Identity>> = Vec::new();

            // Breadth-first backlog walk, depth-bounded.
            let depth = options
                .subscription_depth
                .unwrap_or(identity.cfg.subscription_recursion_depth);
            let mut queue: VecDeque<(Arc<Identity>, u32)> = VecDeque::new();
            if exclude.insert(identity.key()) {
                queue.push_back((Arc::clone(&identity), depth));
            }

            while let Some((author, depth)) = queue.pop_front() {
                author.ready().await;
                for post_key in author.post_keys().await {
                    if !yielded.insert(post_key) {
                        continue;
                    }
                    match retriever
                        .get_cube_info(&post_key, RetrievalOptions::default())
                        .await
                    {
                        Some(info) => {
                            yield Post {
                                author: Arc::clone(&author),
                                key: post_key,
                                info,
                            };
                        },
                        None => {
                            debug!(post = %post_key, "post cube unresolvable, skipping");
                        },
                    }
                }

                if depth > 0 {
                    for sub_key in author.subscription_keys().await {
                        if !exclude.insert(sub_key) {
                            continue;
                        }
                        match Identity::retrieve(
                            &retriever,
                            sub_key,
                            author.cfg.clone(),
                            author.required_difficulty,
                        )
                        .await
                        {
                            Some(sub) => queue.push_back((sub, depth - 1)),
                            None => {
                                debug!(key = %sub_key, "subscribed identity unavailable");
                            },
                        }
                    }
                }
                watched.push(author);
            }

            let _ = existing_tx.send(true);
            if !options.subscribe {
                return;
            }

            // Live phase: react to root revisions of watched identities.
            let mut events = retriever.store().subscribe_events();
            loop {
                let event = tokio::select! {
                    _ = identity.shutdown.cancelled() => return,
                    event = events.recv() => event,
                };
                let info = match event {
                    Ok(StoreEvent::CubeAdded(info)) => info,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(author) = watched.iter().find(|w| w.key() == info.key).cloned()
                else {
                    continue;
                };
                // Give the author's own listener a chance to merge, then
                // pull whatever is new.
                if let Ok(root) = info.cube() {
                    author.absorb_root(&root).await;
                }
                for post_key in author.post_keys().await {
                    if !yielded.insert(post_key) {
                        continue;
                    }
                    if let Some(post_info) = retriever
                        .get_cube_info(&post_key, RetrievalOptions::default())
                        .await
                    {
                        yield Post {
                            author: Arc::clone(&author),
                            key: post_key,
                            info: post_info,
                        };
                    }
                }
            }
        };

        PostStream {
            inner: Box::pin(stream),
            existing_yielded: existing_rx,
        }
    }
}

/// Options for [`Identity::get_posts`].
#[derive(Debug, Default, Clone)]
pub struct GetPostsOptions {
    /// How deep to follow subscription edges; zero streams only the
    /// identity's own posts. Falls back to the configured
    /// `SubscriptionRecursionDepth` when unset.
    pub subscription_depth: Option<u32>,
    /// Keep the stream open and follow new admissions.
    pub subscribe: bool,
    /// Identity keys never descended into (cycle prevention across
    /// nested walks).
    pub recursion_exclude: HashSet<CubeKey>,
}

/// A pull-based post stream with a marker future for the
/// backlog/live boundary.
pub struct PostStream {
    inner: Pin<Box<dyn Stream<Item = Post> + Send>>,
    existing_yielded: watch::Receiver<bool>,
}

impl PostStream {
    /// Resolves once every backlog post has been yielded; in subscribe
    /// mode the stream then continues with live posts.
    pub async fn existing_yielded(&self) {
        let mut rx = self.existing_yielded.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Stream for PostStream {
    type Item = Post;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Owned snapshot of the serializable parts of the state, taken under
/// the lock and released before sculpting.
struct StateSnapshot {
    name: String,
    avatar_seed: Option<Bytes>,
    notify_key: Option<NotifyKey>,
    posts: Vec<CubeKey>,
    subscriptions: Vec<CubeKey>,
    recommendations: Vec<CubeKey>,
}

impl StateSnapshot {
    fn of(state: &IdentityState) -> Self {
        Self {
            name: state.name.clone(),
            avatar_seed: state.avatar_seed.clone(),
            notify_key: state.notify_key,
            posts: state.posts.clone(),
            subscriptions: state.subscriptions.clone(),
            recommendations: state.recommendations.clone(),
        }
    }
}

fn collect_relationships(
    cube: &Cube,
    posts: &mut Vec<CubeKey>,
    subscriptions: &mut Vec<CubeKey>,
) {
    for rel in cube.relationships() {
        match rel.rel_type {
            RelationshipType::MyPost => posts.push(rel.remote_key),
            RelationshipType::SubscriptionRecommendation => {
                subscriptions.push(rel.remote_key)
            },
            _ => {},
        }
    }
}

/// Move relationships from `remaining` into the builder while they fit,
/// leaving room for a CONTINUED_IN link whenever a remainder will need
/// one, and respecting per-type cardinality.
fn fill_with_relationships(
    mut builder: CubeBuilder,
    remaining: &mut VecDeque<Relationship>,
) -> Result<CubeBuilder> {
    let mut counts: std::collections::HashMap<RelationshipType, usize> =
        std::collections::HashMap::new();
    while let Some(&rel) = remaining.front() {
        let count = counts.entry(rel.rel_type).or_insert(0);
        if *count >= rel.rel_type.cardinality() {
            break;
        }
        let available = builder.remaining_capacity();
        let last = remaining.len() == 1;
        let reserve = if last { 0 } else { REL_WIRE_LEN };
        if available < REL_WIRE_LEN + reserve {
            break;
        }
        remaining.pop_front();
        builder = builder.relates_to(rel.rel_type, rel.remote_key)?;
        *count += 1;
    }
    Ok(builder)
}
