// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The contract the core consumes from the peer-to-peer transport, and
//! the pluggable strategy that picks which online peer serves a
//! request.

use core::fmt;

use async_trait::async_trait;
use rand::RngExt;

use crate::models::keys::{CubeKey, NotifyKey};

/// Opaque handle to one connected peer. The scheduler never looks
/// inside; the transport owns the mapping to sockets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Outbound half of the transport contract. Both calls are
/// fire-and-forget; responses flow back through
/// [`RequestScheduler::deliver_cubes`] and the peer lifecycle
/// notifications.
///
/// [`RequestScheduler::deliver_cubes`]: crate::client::scheduler::RequestScheduler::deliver_cubes
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    /// Ask `peer` for the cubes named by `keys`.
    async fn send_key_request(&self, peer: PeerId, keys: &[CubeKey]);

    /// Open a long-lived notification subscription on `peer`: any cube
    /// it sees whose NOTIFY field matches is forwarded to us.
    async fn send_notification_subscribe(&self, peer: PeerId, notify_key: &NotifyKey);
}

/// Picks the peer that serves the next request. Strategies see only
/// the currently-online handles; no scheduler state leaks in.
pub trait PeerSelectionStrategy: Send + Sync {
    fn select(&self, online: &[PeerId]) -> Option<PeerId>;
}

/// Default strategy: uniform choice over online peers.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl PeerSelectionStrategy for RandomStrategy {
    fn select(&self, online: &[PeerId]) -> Option<PeerId> {
        if online.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..online.len());
        Some(online[idx])
    }
}

/// Round-robin-ish alternative used by retry paths: picks the first
/// online peer other than `avoid`, falling back to `avoid` itself when
/// it is the only one left.
pub fn select_avoiding(
    strategy: &dyn PeerSelectionStrategy,
    online: &[PeerId],
    avoid: Option<PeerId>,
) -> Option<PeerId> {
    let filtered: Vec<PeerId> = match avoid {
        Some(a) => online.iter().copied().filter(|p| *p != a).collect(),
        None => online.to_vec(),
    };
    if filtered.is_empty() {
        strategy.select(online)
    } else {
        strategy.select(&filtered)
    }
}
