// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The pending-request multiplexer: at most one outbound request per
//! key, every concurrent caller attached as a waiter, bounded retries
//! against fresh peers, and long-lived notification subscriptions that
//! rebind when their peer drops.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::{
    select,
    sync::{broadcast, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    client::peer::{
        NetworkTransport, PeerId, PeerSelectionStrategy, RandomStrategy, select_avoiding,
    },
    models::{
        cube_info::CubeInfo,
        keys::{CubeKey, NotifyKey},
    },
    store::cube_store::{Admission, CubeStore},
};

/// Buffered deliveries a lagging subscription consumer may fall behind
/// by.
const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 64;

/// Why a retrieval did not produce a cube.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("request deadline elapsed")]
    Timeout,

    #[error("no peers available to route to")]
    Unavailable,

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// One outstanding request record. Owned by the scheduler; the futures
/// callers hold are back-references resolved through `waiters`.
struct PendingRequest {
    waiters: Vec<oneshot::Sender<Result<CubeInfo, RetrievalError>>>,
    peer: Option<PeerId>,
    /// Cancelled when the entry resolves, aborting the driver task.
    done: CancellationToken,
}

struct NotifySubscription {
    tx: broadcast::Sender<CubeInfo>,
    peer: Option<PeerId>,
}

/// Outstanding-request table plus peer bookkeeping. The transport
/// calls back into [`deliver_cubes`], [`peer_online`] and
/// [`peer_offline`]; everything else is driven by retrieval callers.
///
/// [`deliver_cubes`]: RequestScheduler::deliver_cubes
/// [`peer_online`]: RequestScheduler::peer_online
/// [`peer_offline`]: RequestScheduler::peer_offline
pub struct RequestScheduler {
    store: Arc<CubeStore>,
    transport: Arc<dyn NetworkTransport>,
    strategy: Box<dyn PeerSelectionStrategy>,
    peers: DashSet<PeerId>,
    pending: DashMap<String, PendingRequest>,
    subscriptions: DashMap<String, NotifySubscription>,
    request_timeout: Duration,
    request_retries: u32,
    schedule_in: Duration,
    shutdown: CancellationToken,
}

impl RequestScheduler {
    pub fn new(
        cfg: &Config,
        store: Arc<CubeStore>,
        transport: Arc<dyn NetworkTransport>,
    ) -> Arc<Self> {
        Self::with_strategy(cfg, store, transport, Box::new(RandomStrategy))
    }

    pub fn with_strategy(
        cfg: &Config,
        store: Arc<CubeStore>,
        transport: Arc<dyn NetworkTransport>,
        strategy: Box<dyn PeerSelectionStrategy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            strategy,
            peers: DashSet::new(),
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            request_timeout: cfg.network.request_timeout,
            request_retries: cfg.network.request_retries,
            schedule_in: cfg.network.schedule_in,
            shutdown: CancellationToken::new(),
        })
    }

    /// Request one cube from the network.
    ///
    /// If a request for `key` is already outstanding the caller is
    /// attached as another waiter; everyone attached to the same entry
    /// receives the same resolution.
    pub async fn request_cube(
        self: &Arc<Self>,
        key: CubeKey,
        schedule_in: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<CubeInfo, RetrievalError> {
        if self.shutdown.is_cancelled() {
            return Err(RetrievalError::ShuttingDown);
        }

        let key_hex = key.to_hex();
        let (tx, rx) = oneshot::channel();
        let driver_token = {
            let mut fresh = None;
            let mut entry = self.pending.entry(key_hex).or_insert_with(|| {
                let done = self.shutdown.child_token();
                fresh = Some(done.clone());
                PendingRequest {
                    waiters: Vec::new(),
                    peer: None,
                    done,
                }
            });
            entry.waiters.push(tx);
            fresh
        };

        if let Some(done) = driver_token {
            let scheduler = Arc::clone(self);
            let schedule_in = schedule_in.unwrap_or(self.schedule_in);
            let timeout = timeout.unwrap_or(self.request_timeout);
            tokio::spawn(async move {
                scheduler.drive_request(key, done, schedule_in, timeout).await;
            });
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped without resolving: shutdown teardown.
            Err(_) => Err(RetrievalError::ShuttingDown),
        }
    }

    /// Dispatch / retry / deadline loop for one pending entry. Runs
    /// until the entry resolves (token cancelled) or retries run out.
    async fn drive_request(
        self: Arc<Self>,
        key: CubeKey,
        done: CancellationToken,
        schedule_in: Duration,
        timeout: Duration,
    ) {
        let key_hex = key.to_hex();

        if !schedule_in.is_zero() {
            select! {
                _ = done.cancelled() => return,
                _ = sleep(schedule_in) => {},
            }
        }

        let mut last_peer: Option<PeerId> = None;
        for attempt in 0..=self.request_retries {
            let online: Vec<PeerId> = self.peers.iter().map(|p| *p).collect();
            let Some(peer) = select_avoiding(self.strategy.as_ref(), &online, last_peer)
            else {
                debug!(key = %key, "no peers online, rejecting request");
                self.fail_request(&key_hex, RetrievalError::Unavailable);
                return;
            };
            last_peer = Some(peer);

            if let Some(mut entry) = self.pending.get_mut(&key_hex) {
                entry.peer = Some(peer);
            } else {
                return; // resolved in the meantime
            }

            debug!(key = %key, %peer, attempt, "dispatching key request");
            self.transport.send_key_request(peer, &[key]).await;

            select! {
                _ = done.cancelled() => return,
                _ = sleep(timeout) => {},
            }

            // Deadline elapsed. Drop waiters that went away and give up
            // on the entry entirely if nobody is listening anymore.
            if let Some(mut entry) = self.pending.get_mut(&key_hex) {
                entry.waiters.retain(|w| !w.is_closed());
                if entry.waiters.is_empty() {
                    drop(entry);
                    debug!(key = %key, "all waiters cancelled, dropping request");
                    self.pending.remove(&key_hex);
                    return;
                }
            } else {
                return;
            }
            debug!(key = %key, %peer, attempt, "request timed out");
        }

        self.fail_request(&key_hex, RetrievalError::Timeout);
    }

    fn fail_request(&self, key_hex: &str, error: RetrievalError) {
        if let Some((_, mut entry)) = self.pending.remove(key_hex) {
            entry.done.cancel();
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(Err(error));
            }
        }
    }

    /// Ingress path: the transport hands over raw frames it received
    /// from `peer`. Each frame runs the full store admission; pending
    /// requests and matching subscriptions resolve off the admitted
    /// cube.
    pub fn deliver_cubes(&self, frames: Vec<Bytes>, peer: PeerId) {
        for frame in frames {
            let admission = self.store.admit_binary(frame);
            let info = match &admission {
                Admission::Stored(i)
                | Admission::Replaced(i)
                | Admission::Duplicate(i)
                | Admission::ContestLost(i) => i.clone(),
                Admission::Rejected(e) => {
                    warn!(%peer, "peer delivered an inadmissible cube: {e}");
                    continue;
                },
                Admission::ShuttingDown => return,
            };
            self.resolve_pending(&info);
            self.feed_subscriptions(&info);
        }
    }

    fn resolve_pending(&self, info: &CubeInfo) {
        if let Some((_, mut entry)) = self.pending.remove(&info.key_hex) {
            entry.done.cancel();
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(Ok(info.clone()));
            }
        }
    }

    fn feed_subscriptions(&self, info: &CubeInfo) {
        if let Some(nk) = info.notify_key
            && let Some(sub) = self.subscriptions.get(&nk.to_hex())
        {
            let _ = sub.tx.send(info.clone());
        }
    }

    /// Open (or join) the long-lived notification stream for
    /// `notify_key`. Matching cubes delivered by any peer fan out to
    /// every receiver.
    pub fn request_notifications(
        self: &Arc<Self>,
        notify_key: &NotifyKey,
    ) -> broadcast::Receiver<CubeInfo> {
        let hex = notify_key.to_hex();
        let (rx, needs_bind) = {
            let entry = self.subscriptions.entry(hex).or_insert_with(|| {
                let (tx, _) = broadcast::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
                NotifySubscription { tx, peer: None }
            });
            (entry.tx.subscribe(), entry.peer.is_none())
        };
        if needs_bind {
            self.bind_subscription(*notify_key);
        }
        rx
    }

    /// Drop the stream registration once the last receiver is gone.
    pub fn release_notifications(&self, notify_key: &NotifyKey) {
        let hex = notify_key.to_hex();
        let empty = self
            .subscriptions
            .get(&hex)
            .map(|s| s.tx.receiver_count() == 0)
            .unwrap_or(false);
        if empty {
            self.subscriptions.remove(&hex);
            debug!(notify = %notify_key, "notification subscription released");
        }
    }

    /// Pick a peer for a subscription and tell it to start forwarding.
    fn bind_subscription(self: &Arc<Self>, notify_key: NotifyKey) {
        let online: Vec<PeerId> = self.peers.iter().map(|p| *p).collect();
        let Some(peer) = self.strategy.select(&online) else {
            debug!(notify = %notify_key, "no peer for subscription yet");
            return;
        };
        if let Some(mut sub) = self.subscriptions.get_mut(&notify_key.to_hex()) {
            sub.peer = Some(peer);
        } else {
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler
                .transport
                .send_notification_subscribe(peer, &notify_key)
                .await;
        });
    }

    /// Transport lifecycle: a peer came online. Unbound subscriptions
    /// get a home.
    pub fn peer_online(self: &Arc<Self>, peer: PeerId) {
        self.peers.insert(peer);
        debug!(%peer, "peer online");
        let unbound: Vec<NotifyKey> = self
            .subscriptions
            .iter()
            .filter(|s| s.peer.is_none())
            .filter_map(|s| NotifyKey::from_hex(s.key()).ok())
            .collect();
        for nk in unbound {
            self.bind_subscription(nk);
        }
    }

    /// Transport lifecycle: a peer went away. Its subscriptions rebind
    /// elsewhere; its in-flight cube requests run into their deadline
    /// and retry on another peer.
    pub fn peer_offline(self: &Arc<Self>, peer: PeerId) {
        self.peers.remove(&peer);
        debug!(%peer, "peer offline");
        let orphaned: Vec<NotifyKey> = self
            .subscriptions
            .iter()
            .filter(|s| s.peer == Some(peer))
            .filter_map(|s| NotifyKey::from_hex(s.key()).ok())
            .collect();
        for nk in orphaned {
            if let Some(mut sub) = self.subscriptions.get_mut(&nk.to_hex()) {
                sub.peer = None;
            }
            self.bind_subscription(nk);
        }
    }

    /// Transport-wide connectivity events.
    pub fn online(&self) {
        debug!("transport online");
    }

    pub fn offline(self: &Arc<Self>) {
        debug!("transport offline, clearing peer set");
        let all: Vec<PeerId> = self.peers.iter().map(|p| *p).collect();
        for peer in all {
            self.peer_offline(peer);
        }
    }

    pub fn online_peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Reject every outstanding waiter and refuse new requests.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.fail_request(&key, RetrievalError::ShuttingDown);
        }
        self.subscriptions.clear();
        debug!("request scheduler shut down");
    }
}
