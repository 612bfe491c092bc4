// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// Connection scenarios driven through the public API: concurrent
// invocations answered out of order, and active connection management
// (idle close, heartbeats, forceful close of stuck invocations) with the
// monitor clock advanced by hand.

#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rpcwire::transceiver::{stream_pair, ReadinessPoller};
use rpcwire::{
    AcmClose, AcmConfig, AcmHeartbeat, Config, Connection, Dispatcher, Endpoint, Engine, Error,
    Identity, IncomingRequest, MemoryConnectionFactory, OperationMode, Reference, Responder, Role,
    State,
};

const WAIT: Duration = Duration::from_secs(5);

fn encaps(byte: u8) -> Vec<u8> {
    vec![7, 0, 0, 0, 1, 1, byte]
}

fn echo() -> Arc<dyn Dispatcher> {
    Arc::new(|request: IncomingRequest, responder: Responder| {
        responder.ok(&request.params)
    })
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Validated client/server pair; only the client runs `acm`.
async fn pair(poller: &ReadinessPoller, acm: AcmConfig) -> (Arc<Connection>, Arc<Connection>) {
    let (a, b) = stream_pair("scenario");
    let client_config = Arc::new(Config::default().with_acm(acm));
    let server_config = Arc::new(Config::default().with_acm(AcmConfig::disabled()));
    let client = Connection::new(Box::new(a), client_config, Role::Outgoing, None, poller);
    let server = Connection::new(
        Box::new(b),
        server_config,
        Role::Incoming,
        Some(echo()),
        poller,
    );
    let (c, s) = tokio::join!(client.start(), server.start());
    c.unwrap();
    s.unwrap();
    (client, server)
}

// ============================================================================
// Out-of-order replies
// ============================================================================

#[tokio::test]
async fn test_concurrent_invocations_complete_out_of_order() {
    let parked: Arc<Mutex<Vec<(IncomingRequest, Responder)>>> = Arc::default();
    let sink = parked.clone();
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(move |request: IncomingRequest, responder: Responder| {
            sink.lock().push((request, responder));
        });

    let config = Arc::new(
        Config::default()
            .with_acm(AcmConfig::disabled())
            .with_retry_intervals(Vec::new()),
    );
    let factory = MemoryConnectionFactory::new(config.clone()).unwrap();
    factory.add_server("shop", dispatcher).unwrap();
    let engine = Engine::new(config.clone(), factory.clone());
    let proxy = engine.proxy(Reference::direct(
        Identity::new("cart"),
        vec![Endpoint::stream("shop")],
        &config,
    ));

    // One connection shared by all three invocations.
    let conn = proxy.get_connection().await.unwrap();

    let answer = parked.clone();
    let answering = tokio::spawn(async move {
        wait_until(|| answer.lock().len() == 3).await;
        let mut requests: Vec<_> = answer.lock().drain(..).collect();
        // Newest request first.
        while let Some((request, responder)) = requests.pop() {
            responder.ok(&request.params);
        }
    });

    let (e1, e2, e3) = (encaps(1), encaps(2), encaps(3));
    let (a, b, c) = tokio::join!(
        proxy.invoke("add", OperationMode::Normal, &e1, None),
        proxy.invoke("add", OperationMode::Normal, &e2, None),
        proxy.invoke("add", OperationMode::Normal, &e3, None),
    );
    answering.await.unwrap();

    assert_eq!(a.unwrap().encaps, encaps(1));
    assert_eq!(b.unwrap().encaps, encaps(2));
    assert_eq!(c.unwrap().encaps, encaps(3));
    assert_eq!(factory.connect_count(), 1);
    assert_eq!(conn.pending_requests(), 0);
}

// ============================================================================
// Active connection management
// ============================================================================

#[tokio::test]
async fn test_idle_connection_closed_gracefully_after_timeout() {
    let poller = ReadinessPoller::new().unwrap();
    let acm = AcmConfig::new(Duration::from_secs(4), AcmClose::OnIdle, AcmHeartbeat::Off);
    let (client, server) = pair(&poller, acm).await;
    let t0 = Instant::now();

    client.monitor(t0 + Duration::from_secs(3));
    assert_eq!(client.state(), State::Active);

    client.monitor(t0 + Duration::from_secs(4));
    assert!(client.state() >= State::Closing);
    assert_eq!(client.exception(), Some(Error::ConnectionTimeout));

    // Graceful: the peer sees the close and both sides finish.
    tokio::time::timeout(WAIT, client.wait_until_finished())
        .await
        .unwrap();
    tokio::time::timeout(WAIT, server.wait_until_finished())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_activity_postpones_idle_close() {
    let poller = ReadinessPoller::new().unwrap();
    let acm = AcmConfig::new(Duration::from_secs(4), AcmClose::OnIdle, AcmHeartbeat::Off);
    let (client, _server) = pair(&poller, acm).await;
    let t0 = Instant::now();

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.heartbeat().unwrap();

    client.monitor(t0 + Duration::from_secs(4));
    assert_eq!(client.state(), State::Active);

    client.monitor(Instant::now() + Duration::from_secs(4));
    assert!(client.state() >= State::Closing);
}

#[tokio::test]
async fn test_heartbeat_sent_after_quarter_timeout_idle() {
    let poller = ReadinessPoller::new().unwrap();
    let acm = AcmConfig::new(Duration::from_secs(4), AcmClose::Off, AcmHeartbeat::OnIdle);
    let (client, server) = pair(&poller, acm).await;
    let beats = Arc::new(AtomicUsize::new(0));
    let counter = beats.clone();
    server.set_heartbeat_callback(Some(Arc::new(move |_conn: &Arc<Connection>| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    let t0 = Instant::now();

    client.monitor(t0 + Duration::from_millis(500));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(beats.load(Ordering::SeqCst), 0);

    client.monitor(t0 + Duration::from_secs(1));
    wait_until(|| beats.load(Ordering::SeqCst) == 1).await;

    // The heartbeat itself counts as activity.
    client.monitor(t0 + Duration::from_millis(1500));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(beats.load(Ordering::SeqCst), 1);

    client.monitor(t0 + Duration::from_secs(2));
    wait_until(|| beats.load(Ordering::SeqCst) == 2).await;

    // Never closed: close is off.
    client.monitor(t0 + Duration::from_secs(60));
    assert_eq!(client.state(), State::Active);
}

#[tokio::test]
async fn test_forceful_idle_close_fails_pending_invocation() {
    let parked: Arc<Mutex<Vec<Responder>>> = Arc::default();
    let sink = parked.clone();
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(move |_request: IncomingRequest, responder: Responder| {
            sink.lock().push(responder);
        });

    let config = Arc::new(
        Config::default()
            .with_acm(AcmConfig::new(
                Duration::from_secs(4),
                AcmClose::OnIdleForceful,
                AcmHeartbeat::Off,
            ))
            .with_retry_intervals(Vec::new()),
    );
    let factory = MemoryConnectionFactory::new(config.clone()).unwrap();
    factory.add_server("shop", dispatcher).unwrap();
    let engine = Engine::new(config.clone(), factory.clone());
    let proxy = engine.proxy(Reference::direct(
        Identity::new("cart"),
        vec![Endpoint::stream("shop")],
        &config,
    ));

    let invocation = tokio::spawn(async move {
        proxy
            .invoke("checkout", OperationMode::Normal, &encaps(9), None)
            .await
    });
    wait_until(|| parked.lock().len() == 1).await;
    assert_eq!(factory.acm_monitor().len(), 2);

    factory
        .acm_monitor()
        .run_once(Instant::now() + Duration::from_secs(4));

    let result = tokio::time::timeout(WAIT, invocation).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), Error::ConnectionTimeout);
    assert!(factory.connections().is_empty());
}
