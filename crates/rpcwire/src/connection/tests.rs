// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::identity::{Context, Identity, OperationMode};
use crate::protocol::{MessageHeader, ReplyStatus};
use crate::stream::OutputStream;
use crate::transceiver::{datagram_pair, stream_pair, MemoryDatagram};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> Arc<Config> {
    Arc::new(Config::default().with_acm(AcmConfig::disabled()))
}

fn body(operation: &str, params: &[u8]) -> Vec<u8> {
    let mut os = OutputStream::for_protocol();
    os.write_identity(&Identity::new("echo"));
    write_facet(&mut os, "");
    os.write_string(operation);
    os.write_u8(OperationMode::Normal as u8);
    os.write_context(&Context::new());
    os.write_encapsulation(params).unwrap();
    os.into_bytes()
}

fn request(operation: &str, params: &[u8]) -> Buffer {
    let mut buf = header_only_message(MessageType::Request);
    buf.put_i32(0);
    buf.put_slice(&body(operation, params));
    buf
}

/// Encapsulation holding a single byte.
fn encaps(byte: u8) -> Vec<u8> {
    vec![7, 0, 0, 0, 1, 1, byte]
}

fn echo() -> Arc<dyn Dispatcher> {
    Arc::new(|request: IncomingRequest, responder: Responder| {
        responder.ok(&request.params)
    })
}

async fn connected_pair(
    poller: &ReadinessPoller,
    dispatcher: Arc<dyn Dispatcher>,
) -> (Arc<Connection>, Arc<Connection>) {
    let (a, b) = stream_pair("test");
    let client = Connection::new(Box::new(a), config(), Role::Outgoing, None, poller);
    let server = Connection::new(Box::new(b), config(), Role::Incoming, Some(dispatcher), poller);
    let (c, s) = tokio::join!(client.start(), server.start());
    c.unwrap();
    s.unwrap();
    (client, server)
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

fn reply_payload(mut reply: ReplyMessage) -> (ReplyStatus, Vec<u8>) {
    let status = ReplyStatus::from_u8(reply.body.get_u8().unwrap()).unwrap();
    (status, reply.body.unread().to_vec())
}

#[tokio::test]
async fn test_validation_then_request_reply() {
    let poller = ReadinessPoller::new().unwrap();
    let (client, server) = connected_pair(&poller, echo()).await;
    assert_eq!(client.state(), State::Active);
    assert_eq!(server.state(), State::Active);

    let mut pending = client
        .send_async_request(request("ping", &encaps(42)), true, 0)
        .unwrap();
    assert_eq!(pending.request_id(), 1);
    assert!(pending.sent_synchronously());
    assert!(pending.is_sent());

    let reply = tokio::time::timeout(WAIT, pending.reply()).await.unwrap().unwrap();
    assert_eq!(reply.request_id, 1);
    let (status, payload) = reply_payload(reply);
    assert_eq!(status, ReplyStatus::Ok);
    assert_eq!(payload, encaps(42));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_replies_complete_out_of_order() {
    let poller = ReadinessPoller::new().unwrap();
    let parked: Arc<parking_lot::Mutex<Vec<(IncomingRequest, Responder)>>> = Arc::default();
    let sink = parked.clone();
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(move |request: IncomingRequest, responder: Responder| {
            sink.lock().push((request, responder));
        });
    let (client, server) = connected_pair(&poller, dispatcher).await;

    let mut pending: Vec<AsyncRequest> = (0..3u8)
        .map(|i| {
            client
                .send_async_request(request("slow", &encaps(i)), true, 0)
                .unwrap()
        })
        .collect();
    wait_until(|| parked.lock().len() == 3).await;
    assert_eq!(server.dispatch_count(), 3);

    let mut parked_now: Vec<_> = parked.lock().drain(..).collect();
    while let Some((request, responder)) = parked_now.pop() {
        responder.ok(&request.params);
    }

    for (i, req) in pending.iter_mut().enumerate().rev() {
        let reply = tokio::time::timeout(WAIT, req.reply()).await.unwrap().unwrap();
        assert_eq!(reply.request_id, req.request_id());
        let (_, payload) = reply_payload(reply);
        assert_eq!(payload, encaps(i as u8));
    }
    assert_eq!(server.dispatch_count(), 0);
}

#[tokio::test]
async fn test_dropped_responder_replies_unknown_exception() {
    let poller = ReadinessPoller::new().unwrap();
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(|_request: IncomingRequest, _responder: Responder| {});
    let (client, _server) = connected_pair(&poller, dispatcher).await;

    let mut pending = client
        .send_async_request(request("lost", &encaps(0)), true, 0)
        .unwrap();
    let reply = tokio::time::timeout(WAIT, pending.reply()).await.unwrap().unwrap();
    let (status, _) = reply_payload(reply);
    assert_eq!(status, ReplyStatus::UnknownException);
}

#[tokio::test]
async fn test_missing_dispatcher_replies_object_not_exist() {
    let poller = ReadinessPoller::new().unwrap();
    let (a, b) = stream_pair("nodispatch");
    let client = Connection::new(Box::new(a), config(), Role::Outgoing, None, &poller);
    let server = Connection::new(Box::new(b), config(), Role::Incoming, None, &poller);
    let (c, s) = tokio::join!(client.start(), server.start());
    c.unwrap();
    s.unwrap();

    let mut pending = client
        .send_async_request(request("ping", &encaps(0)), true, 0)
        .unwrap();
    let reply = tokio::time::timeout(WAIT, pending.reply()).await.unwrap().unwrap();
    assert_eq!(reply_payload(reply).0, ReplyStatus::ObjectNotExist);
}

#[tokio::test]
async fn test_graceful_close_reaches_finished_on_both_sides() {
    let poller = ReadinessPoller::new().unwrap();
    let (client, server) = connected_pair(&poller, echo()).await;

    client.close(CloseMode::GracefullyWithWait);
    tokio::time::timeout(WAIT, client.wait_until_finished())
        .await
        .unwrap();
    tokio::time::timeout(WAIT, server.wait_until_finished())
        .await
        .unwrap();

    assert_eq!(
        client.exception(),
        Some(Error::ConnectionManuallyClosed { graceful: true })
    );
    assert_eq!(server.exception(), Some(Error::CloseConnection));
    assert!(matches!(
        client.send_async_request(request("late", &encaps(0)), true, 0),
        Err(Error::Retry(_))
    ));
}

#[tokio::test]
async fn test_close_with_wait_lets_pending_request_complete() {
    let poller = ReadinessPoller::new().unwrap();
    let parked: Arc<parking_lot::Mutex<Vec<(IncomingRequest, Responder)>>> = Arc::default();
    let sink = parked.clone();
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(move |request: IncomingRequest, responder: Responder| {
            sink.lock().push((request, responder));
        });
    let (client, server) = connected_pair(&poller, dispatcher).await;

    let mut pending = client
        .send_async_request(request("slow", &encaps(5)), true, 0)
        .unwrap();
    wait_until(|| parked.lock().len() == 1).await;

    client.close(CloseMode::GracefullyWithWait);
    assert_eq!(client.state(), State::Active);

    let (request, responder) = parked.lock().remove(0);
    responder.ok(&request.params);

    let reply = tokio::time::timeout(WAIT, pending.reply()).await.unwrap().unwrap();
    assert_eq!(reply_payload(reply).1, encaps(5));
    tokio::time::timeout(WAIT, client.wait_until_finished())
        .await
        .unwrap();
    tokio::time::timeout(WAIT, server.wait_until_finished())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_forceful_close_fails_pending_requests() {
    let poller = ReadinessPoller::new().unwrap();
    let dispatcher: Arc<dyn Dispatcher> = {
        let parked: Arc<parking_lot::Mutex<Vec<Responder>>> = Arc::default();
        Arc::new(move |_request: IncomingRequest, responder: Responder| {
            parked.lock().push(responder);
        })
    };
    let (client, _server) = connected_pair(&poller, dispatcher).await;

    let mut pending = client
        .send_async_request(request("slow", &encaps(0)), true, 0)
        .unwrap();
    client.close(CloseMode::Forcefully);

    let err = pending.reply().await.unwrap_err();
    assert_eq!(err, Error::ConnectionManuallyClosed { graceful: false });
    assert_eq!(client.state(), State::Finished);
}

#[tokio::test]
async fn test_partial_writes_are_queued() {
    let poller = ReadinessPoller::new().unwrap();
    let (a, b) = stream_pair("chunked");
    let client = Connection::new(
        Box::new(a.with_write_chunk(8)),
        config(),
        Role::Outgoing,
        None,
        &poller,
    );
    let server = Connection::new(Box::new(b), config(), Role::Incoming, Some(echo()), &poller);
    let (c, s) = tokio::join!(client.start(), server.start());
    c.unwrap();
    s.unwrap();

    let mut first = client
        .send_async_request(request("big", &encaps(1)), true, 0)
        .unwrap();
    let mut second = client
        .send_async_request(request("big", &encaps(2)), true, 0)
        .unwrap();
    assert!(!first.sent_synchronously());
    assert!(!second.sent_synchronously());

    tokio::time::timeout(WAIT, second.sent()).await.unwrap().unwrap();
    let r1 = tokio::time::timeout(WAIT, first.reply()).await.unwrap().unwrap();
    let r2 = tokio::time::timeout(WAIT, second.reply()).await.unwrap().unwrap();
    assert_eq!(reply_payload(r1).1, encaps(1));
    assert_eq!(reply_payload(r2).1, encaps(2));
}

#[tokio::test]
async fn test_batch_requests_dispatch_each_body() {
    let poller = ReadinessPoller::new().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(move |request: IncomingRequest, responder: Responder| {
            assert!(!request.is_twoway());
            counter.fetch_add(1, Ordering::SeqCst);
            responder.ok(&[]);
        });
    let (client, server) = connected_pair(&poller, dispatcher).await;

    client.queue_batch_request(&body("a", &encaps(1))).unwrap();
    client.queue_batch_request(&body("b", &encaps(2))).unwrap();
    assert_eq!(client.batch_request_count(), 2);

    let sent = client.flush_batch_requests().unwrap();
    assert!(sent.is_some());
    assert_eq!(client.batch_request_count(), 0);
    assert!(client.flush_batch_requests().unwrap().is_none());

    wait_until(|| seen.load(Ordering::SeqCst) == 2).await;
    wait_until(|| server.dispatch_count() == 0).await;
}

#[tokio::test]
async fn test_batch_refused_before_validation() {
    let poller = ReadinessPoller::new().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(move |_request: IncomingRequest, responder: Responder| {
            counter.fetch_add(1, Ordering::SeqCst);
            responder.ok(&[]);
        });
    let (a, b) = stream_pair("test");
    // Auto flush on every second request.
    let tiny = Arc::new(
        Config::default()
            .with_acm(AcmConfig::disabled())
            .with_batch_auto_flush_size(1),
    );
    let client = Connection::new(Box::new(a), tiny, Role::Outgoing, None, &poller);
    let server = Connection::new(Box::new(b), config(), Role::Incoming, Some(dispatcher), &poller);

    for _ in 0..2 {
        assert_eq!(
            client.queue_batch_request(&body("early", &encaps(1))),
            Err(Error::ConnectionNotValidated)
        );
    }
    assert_eq!(client.batch_request_count(), 0);
    assert!(matches!(
        client.flush_batch_requests(),
        Err(Error::ConnectionNotValidated)
    ));

    let (c, s) = tokio::join!(client.start(), server.start());
    c.unwrap();
    s.unwrap();

    client.queue_batch_request(&body("a", &encaps(1))).unwrap();
    client.queue_batch_request(&body("b", &encaps(2))).unwrap();
    assert_eq!(client.batch_request_count(), 1);
    client.flush_batch_requests().unwrap();
    wait_until(|| seen.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn test_heartbeat_reaches_peer_callback() {
    let poller = ReadinessPoller::new().unwrap();
    let (client, server) = connected_pair(&poller, echo()).await;
    let beats = Arc::new(AtomicUsize::new(0));
    let counter = beats.clone();
    server.set_heartbeat_callback(Some(Arc::new(move |_conn: &Arc<Connection>| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    client.heartbeat().unwrap();
    wait_until(|| beats.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_hold_stops_reading_until_activate() {
    let poller = ReadinessPoller::new().unwrap();
    let (client, server) = connected_pair(&poller, echo()).await;

    server.hold();
    assert_eq!(server.state(), State::Holding);
    let mut pending = client
        .send_async_request(request("held", &encaps(3)), true, 0)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.pending_requests(), 1);

    server.activate();
    let reply = tokio::time::timeout(WAIT, pending.reply()).await.unwrap().unwrap();
    assert_eq!(reply_payload(reply).1, encaps(3));
}

#[tokio::test]
async fn test_bad_magic_closes_connection() {
    let poller = ReadinessPoller::new().unwrap();
    let (a, mut peer) = stream_pair("garbage");
    let client = Connection::new(Box::new(a), config(), Role::Outgoing, None, &poller);

    let mut garbage = Buffer::from_vec(b"NOPE\x01\x00\x01\x00\x03\x00\x0e\x00\x00\x00".to_vec());
    peer.write(&mut garbage).unwrap();

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, Error::BadMagic { .. }));
    assert_eq!(client.state(), State::Finished);
}

#[tokio::test]
async fn test_oversized_message_rejected() {
    let poller = ReadinessPoller::new().unwrap();
    let (a, b) = stream_pair("limit");
    let small = Arc::new(
        Config::default()
            .with_acm(AcmConfig::disabled())
            .with_message_size_max(64),
    );
    let client = Connection::new(Box::new(a), config(), Role::Outgoing, None, &poller);
    let server = Connection::new(Box::new(b), small, Role::Incoming, Some(echo()), &poller);
    let (c, s) = tokio::join!(client.start(), server.start());
    c.unwrap();
    s.unwrap();

    let big = vec![0u8; 100];
    let mut params = vec![(6 + big.len()) as u8, 0, 0, 0, 1, 1];
    params.extend_from_slice(&big);
    let mut pending = client
        .send_async_request(request("big", &params), true, 0)
        .unwrap();
    tokio::time::timeout(WAIT, server.wait_until_finished())
        .await
        .unwrap();
    assert!(matches!(
        server.exception(),
        Some(Error::MemoryLimit { max: 64, .. })
    ));
    assert!(pending.reply().await.is_err());
}

#[tokio::test]
async fn test_close_callback_runs_once_closed() {
    let poller = ReadinessPoller::new().unwrap();
    let (client, _server) = connected_pair(&poller, echo()).await;
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    client.set_close_callback(Box::new(move |_conn: &Arc<Connection>| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    client.close(CloseMode::Forcefully);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    // Installed after closure: runs immediately.
    let counter = closed.clone();
    client.set_close_callback(Box::new(move |_conn: &Arc<Connection>| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(closed.load(Ordering::SeqCst), 2);
}

fn framed(mut buf: Buffer) -> Buffer {
    let size = buf.limit() as i32;
    buf.put_i32_at(SIZE_OFFSET, size).unwrap();
    buf.set_position(0);
    buf
}

#[tokio::test]
async fn test_datagram_drops_malformed_packets() {
    let poller = ReadinessPoller::new().unwrap();
    let (mut raw, b): (MemoryDatagram, MemoryDatagram) = datagram_pair("udp");
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(move |_request: IncomingRequest, responder: Responder| {
            counter.fetch_add(1, Ordering::SeqCst);
            responder.ok(&[]);
        });
    let cfg = Arc::new(
        Config::default()
            .with_acm(AcmConfig::disabled())
            .with_warn_datagrams(true),
    );
    let server = Connection::new(Box::new(b), cfg, Role::Incoming, Some(dispatcher), &poller);
    server.start().await.unwrap();
    assert!(server.is_datagram());

    raw.write(&mut Buffer::from_vec(vec![1, 2, 3])).unwrap();
    raw.write(&mut framed(header_only_message(MessageType::CloseConnection)))
        .unwrap();
    raw.write(&mut framed(request("udp", &encaps(9)))).unwrap();

    wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
    assert_eq!(server.state(), State::Active);
}

#[tokio::test]
async fn test_twoway_over_datagram_rejected() {
    let poller = ReadinessPoller::new().unwrap();
    let (a, _b) = datagram_pair("udp2");
    let client = Connection::new(Box::new(a), config(), Role::Outgoing, None, &poller);
    client.start().await.unwrap();
    assert!(matches!(
        client.send_async_request(request("x", &encaps(0)), true, 0),
        Err(Error::IllegalArgument { .. })
    ));
    assert!(client
        .send_async_request(request("x", &encaps(0)), false, 0)
        .unwrap()
        .sent_synchronously());
}

#[test]
fn test_request_id_wraps() {
    let (a, _b) = stream_pair("ids");
    let poller = ReadinessPoller::new().unwrap();
    let conn = Connection::new(Box::new(a), config(), Role::Outgoing, None, &poller);
    let mut inner = conn.inner.lock();
    inner.next_request_id = i32::MAX;
    assert_eq!(inner.allocate_request_id(), i32::MAX);
    assert_eq!(inner.allocate_request_id(), 1);
}

#[test]
fn test_header_decode_for_reply() {
    let mut buf = framed(header_only_message(MessageType::Reply));
    let header = MessageHeader::decode(&mut buf).unwrap();
    assert_eq!(header.kind(), Some(MessageType::Reply));
}
