// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    pin::pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use verity::{
    cfg::config::Config,
    client::{
        peer::{NetworkTransport, PeerId},
        retriever::{CubeRetriever, RetrievalOptions},
        scheduler::RequestScheduler,
    },
    models::keys::{CubeKey, NotifyKey},
    store::cube_store::CubeStore,
};

use crate::unit_tests::{frozen, key_of, memory_config};

/// Records outbound traffic; delivery is injected by the test.
#[derive(Default)]
struct MockTransport {
    key_requests: Mutex<Vec<(PeerId, Vec<CubeKey>)>>,
    subscriptions: Mutex<Vec<(PeerId, NotifyKey)>>,
}

impl MockTransport {
    fn request_count(&self) -> usize {
        self.key_requests.lock().expect("lock").len()
    }

    fn requests(&self) -> Vec<(PeerId, Vec<CubeKey>)> {
        self.key_requests.lock().expect("lock").clone()
    }

    fn subscription_log(&self) -> Vec<(PeerId, NotifyKey)> {
        self.subscriptions.lock().expect("lock").clone()
    }
}

#[async_trait]
impl NetworkTransport for MockTransport {
    async fn send_key_request(&self, peer: PeerId, keys: &[CubeKey]) {
        self.key_requests
            .lock()
            .expect("lock")
            .push((peer, keys.to_vec()));
    }

    async fn send_notification_subscribe(&self, peer: PeerId, notify_key: &NotifyKey) {
        self.subscriptions
            .lock()
            .expect("lock")
            .push((peer, *notify_key));
    }
}

fn network_config(timeout_ms: u64, retries: u32) -> Config {
    let mut cfg = memory_config(0);
    cfg.network.request_timeout = Duration::from_millis(timeout_ms);
    cfg.network.request_retries = retries;
    cfg
}

struct Rig {
    store: Arc<CubeStore>,
    transport: Arc<MockTransport>,
    scheduler: Arc<RequestScheduler>,
    retriever: Arc<CubeRetriever>,
}

fn rig(cfg: &Config) -> Rig {
    let store = CubeStore::new_in_memory(cfg);
    let transport = Arc::new(MockTransport::default());
    let scheduler = RequestScheduler::new(
        cfg,
        Arc::clone(&store),
        Arc::clone(&transport) as Arc<dyn NetworkTransport>,
    );
    let retriever = CubeRetriever::new(Arc::clone(&store), Arc::clone(&scheduler));
    Rig {
        store,
        transport,
        scheduler,
        retriever,
    }
}

#[tokio::test]
async fn concurrent_requests_share_one_outbound() -> Result<()> {
    // Scenario 4: three concurrent fetches, one wire request, one
    // shared resolution.
    let cfg = network_config(2_000, 0);
    let rig = rig(&cfg);
    rig.scheduler.peer_online(PeerId(1));

    let cube = frozen(b"fetched once", 500).await;
    let key = cube.key();

    let r1 = {
        let retriever = Arc::clone(&rig.retriever);
        tokio::spawn(
            async move { retriever.get_cube_info(&key, Default::default()).await },
        )
    };
    let r2 = {
        let retriever = Arc::clone(&rig.retriever);
        tokio::spawn(
            async move { retriever.get_cube_info(&key, Default::default()).await },
        )
    };
    let r3 = {
        let retriever = Arc::clone(&rig.retriever);
        tokio::spawn(
            async move { retriever.get_cube_info(&key, Default::default()).await },
        )
    };

    sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.transport.request_count(), 1, "requests are deduplicated");
    assert_eq!(rig.transport.requests()[0].1, vec![key]);

    rig.scheduler
        .deliver_cubes(vec![cube.binary().clone()], PeerId(1));

    let (a, b, c) = (r1.await?, r2.await?, r3.await?);
    for resolved in [a, b, c] {
        let info = resolved.expect("resolved");
        assert_eq!(info.key, key);
    }
    assert!(rig.store.has_cube(&key));
    assert_eq!(rig.scheduler.pending_request_count(), 0);
    Ok(())
}

#[tokio::test]
async fn local_hit_never_touches_the_network() -> Result<()> {
    let cfg = network_config(1_000, 0);
    let rig = rig(&cfg);
    rig.scheduler.peer_online(PeerId(1));

    let cube = frozen(b"already here", 1).await;
    let key = cube.key();
    rig.store.add_cube(cube).expect("admitted");

    let info = rig
        .retriever
        .get_cube_info(&key, RetrievalOptions::default())
        .await
        .expect("local hit");
    assert_eq!(info.key, key);
    assert_eq!(rig.transport.request_count(), 0);
    Ok(())
}

#[tokio::test]
async fn timeout_resolves_to_none() {
    let cfg = network_config(150, 0);
    let rig = rig(&cfg);
    rig.scheduler.peer_online(PeerId(1));

    let key = key_of([0xEE; 32]);
    let got = rig
        .retriever
        .get_cube_info(&key, RetrievalOptions::default())
        .await;
    assert!(got.is_none());
    assert_eq!(rig.scheduler.pending_request_count(), 0);
}

#[tokio::test]
async fn no_peers_resolves_immediately() {
    let cfg = network_config(5_000, 3);
    let rig = rig(&cfg);

    // No peer ever came online; this must not wait for the deadline.
    let key = key_of([0xDD; 32]);
    let got = timeout(
        Duration::from_millis(500),
        rig.retriever.get_cube_info(&key, RetrievalOptions::default()),
    )
    .await
    .expect("resolves fast");
    assert!(got.is_none());
}

#[tokio::test]
async fn timeout_retries_against_another_peer() -> Result<()> {
    let cfg = network_config(150, 1);
    let rig = rig(&cfg);
    rig.scheduler.peer_online(PeerId(1));
    rig.scheduler.peer_online(PeerId(2));

    let cube = frozen(b"second try", 2).await;
    let key = cube.key();

    let fetch = {
        let retriever = Arc::clone(&rig.retriever);
        tokio::spawn(
            async move { retriever.get_cube_info(&key, Default::default()).await },
        )
    };

    // Let the first dispatch time out once.
    sleep(Duration::from_millis(250)).await;
    let requests = rig.transport.requests();
    assert_eq!(requests.len(), 2, "one retry after the deadline");
    assert_ne!(requests[0].0, requests[1].0, "retry goes to a fresh peer");

    rig.scheduler
        .deliver_cubes(vec![cube.binary().clone()], requests[1].0);
    let resolved = fetch.await?;
    assert_eq!(resolved.expect("resolved").key, key);
    Ok(())
}

#[tokio::test]
async fn notification_stream_yields_matches_in_order() -> Result<()> {
    // Scenario 5: three matching cubes stream through, the unrelated
    // one is stored but not yielded.
    let cfg = network_config(1_000, 0);
    let rig = rig(&cfg);
    rig.scheduler.peer_online(PeerId(1));

    let n = key_of([0xAA; 32]);
    let other = key_of([0xBB; 32]);

    let mut stream = pin!(rig.retriever.subscribe_notifications(n));

    let mut matching = Vec::new();
    for i in 0..3u8 {
        let cube = verity::models::cube::CubeBuilder::frozen()
            .notify(n)?
            .payload(bytes::Bytes::from(vec![i]))?
            .sculpt(0, None)
            .await?;
        matching.push(cube);
    }
    let unrelated = verity::models::cube::CubeBuilder::frozen()
        .notify(other)?
        .payload(bytes::Bytes::from_static(b"noise"))?
        .sculpt(0, None)
        .await?;

    for cube in &matching {
        rig.scheduler
            .deliver_cubes(vec![cube.binary().clone()], PeerId(1));
    }
    rig.scheduler
        .deliver_cubes(vec![unrelated.binary().clone()], PeerId(1));

    for expected in &matching {
        let info = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream progresses")
            .expect("stream open");
        assert_eq!(info.key, expected.key(), "delivery order preserved");
    }
    // Nothing else is pending on the stream.
    assert!(
        timeout(Duration::from_millis(200), stream.next())
            .await
            .is_err()
    );
    assert_eq!(rig.store.cube_count(), 4);
    Ok(())
}

#[tokio::test]
async fn notification_backlog_replays_before_live() -> Result<()> {
    let cfg = network_config(1_000, 0);
    let rig = rig(&cfg);
    rig.scheduler.peer_online(PeerId(1));

    let n = key_of([0xCC; 32]);
    let early = verity::models::cube::CubeBuilder::frozen()
        .notify(n)?
        .payload(bytes::Bytes::from_static(b"early"))?
        .sculpt(0, None)
        .await?;
    rig.store.add_cube(early.clone()).expect("admitted");

    let mut stream = pin!(rig.retriever.subscribe_notifications(n));
    let first = timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("backlog yields")
        .expect("stream open");
    assert_eq!(first.key, early.key());
    Ok(())
}

#[tokio::test]
async fn subscription_rebinds_when_peer_drops() {
    let cfg = network_config(1_000, 0);
    let rig = rig(&cfg);
    rig.scheduler.peer_online(PeerId(1));
    rig.scheduler.peer_online(PeerId(2));

    let n = key_of([0x99; 32]);
    let _rx = rig.scheduler.request_notifications(&n);
    sleep(Duration::from_millis(50)).await;

    let log = rig.transport.subscription_log();
    assert_eq!(log.len(), 1);
    let bound = log[0].0;

    let survivor = if bound == PeerId(1) { PeerId(2) } else { PeerId(1) };
    rig.scheduler.peer_offline(bound);
    sleep(Duration::from_millis(50)).await;

    let log = rig.transport.subscription_log();
    assert_eq!(log.len(), 2, "subscription re-sent after peer loss");
    assert_eq!(log[1].0, survivor);
}

#[tokio::test]
async fn shutdown_rejects_pending_and_new_requests() {
    let cfg = network_config(10_000, 0);
    let rig = rig(&cfg);
    rig.scheduler.peer_online(PeerId(1));

    let key = key_of([0x77; 32]);
    let pending = {
        let retriever = Arc::clone(&rig.retriever);
        tokio::spawn(
            async move { retriever.get_cube_info(&key, Default::default()).await },
        )
    };
    sleep(Duration::from_millis(50)).await;

    rig.scheduler.shutdown();
    let resolved = timeout(Duration::from_millis(500), pending)
        .await
        .expect("waiter released promptly")
        .expect("task join");
    assert!(resolved.is_none());
    assert!(rig.scheduler.shutting_down());

    let late = rig
        .retriever
        .get_cube_info(&key_of([0x78; 32]), RetrievalOptions::default())
        .await;
    assert!(late.is_none());
}
