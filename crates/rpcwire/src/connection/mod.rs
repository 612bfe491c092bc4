// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection state machine.
//!
//! A [`Connection`] frames messages over a [`Transceiver`], correlates
//! replies with pending requests, dispatches incoming requests and runs the
//! graceful close handshake.
//!
//! # States
//!
//! ```text
//! NotInitialized -> NotValidated -> Active <-> Holding
//!                                     |
//!                                     v
//!                                  Closing -> ClosingPending -> Closed -> Finished
//! ```
//!
//! `Closing` waits for running dispatches, then sends a close message;
//! `ClosingPending` waits for the peer to close the transport (bounded by
//! the close timeout); `Finished` is reached once the transport is closed
//! and every dispatch has completed.
//!
//! # Locking
//!
//! All state lives behind one mutex, held for the processing of a single
//! event (readiness, send, response, timer). Anything that may call back
//! into user code (reply and sent notifications, dispatch, callbacks) is
//! collected in an [`Effects`] outbox and run after the lock is released.
//!
//! The first error recorded on a connection is the one reported to every
//! pending invocation; later errors are only logged.

mod acm;
mod batch;
mod dispatch;

pub use acm::AcmMonitor;
pub use dispatch::{Dispatcher, IncomingRequest, Responder};

pub(crate) use dispatch::{read_facet, write_facet};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use self::batch::BatchRequestQueue;
use crate::buffer::Buffer;
use crate::config::{AcmConfig, Config};
use crate::error::{Error, Result};
use crate::protocol::{
    header_only_message, MessageHeader, MessageType, CURRENT_PROTOCOL_ENCODING, HEADER_SIZE,
    REQUEST_ID_OFFSET, SIZE_OFFSET,
};
use crate::stream::InputStream;
use crate::trace;
use crate::transceiver::{ReadinessPoller, Transceiver};

/// Largest UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    NotInitialized,
    NotValidated,
    Active,
    /// Validated, incoming messages are not read.
    Holding,
    Closing,
    ClosingPending,
    Closed,
    Finished,
}

/// Which side opened the connection. The incoming side sends the validate
/// message, the outgoing side waits for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Close the transport at once, failing pending requests.
    Forcefully,
    /// Start the close handshake; pending requests fail.
    Gracefully,
    /// Start the close handshake once no request is pending.
    GracefullyWithWait,
}

/// Called when a validate message (heartbeat) is received.
pub type HeartbeatCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Called once the connection is closed.
pub type CloseCallback = Box<dyn FnOnce(&Arc<Connection>) + Send>;

/// A reply, positioned after its request id.
#[derive(Debug)]
pub struct ReplyMessage {
    pub request_id: i32,
    pub body: Buffer,
}

/// Handle on a request handed to [`Connection::send_async_request`].
#[derive(Debug)]
pub struct AsyncRequest {
    request_id: i32,
    sent_synchronously: bool,
    sent: Option<oneshot::Receiver<Result<()>>>,
    sent_ok: bool,
    reply: Option<oneshot::Receiver<Result<ReplyMessage>>>,
    connection: Weak<Connection>,
}

impl AsyncRequest {
    /// 0 for oneway and batch requests.
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// True when the whole message was written by the sending call.
    pub fn sent_synchronously(&self) -> bool {
        self.sent_synchronously
    }

    /// Wait until the message is fully written.
    pub async fn sent(&mut self) -> Result<()> {
        if self.sent_ok {
            return Ok(());
        }
        let Some(rx) = self.sent.take() else {
            return Err(dropped());
        };
        let result = rx.await.unwrap_or_else(|_| Err(dropped()));
        self.sent_ok = result.is_ok();
        result
    }

    /// True once the message is known to be fully written.
    pub fn is_sent(&mut self) -> bool {
        if !self.sent_ok {
            if let Some(rx) = self.sent.as_mut() {
                if let Ok(Ok(())) = rx.try_recv() {
                    self.sent_ok = true;
                    self.sent = None;
                }
            }
        }
        self.sent_ok
    }

    /// Wait for the reply of a twoway request.
    pub async fn reply(&mut self) -> Result<ReplyMessage> {
        let rx = self.reply.as_mut().ok_or_else(|| Error::IllegalArgument {
            reason: "no reply expected for this request".into(),
        })?;
        let result = rx.await.unwrap_or_else(|_| Err(dropped()));
        self.reply = None;
        result
    }

    /// Forget the pending reply; a reply arriving later is discarded.
    /// Dropping a request that still waits for its reply abandons it.
    pub fn abandon(&mut self) {
        if self.reply.take().is_some() {
            if let Some(conn) = self.connection.upgrade() {
                conn.abandon_request(self.request_id);
            }
        }
    }
}

impl Drop for AsyncRequest {
    fn drop(&mut self) {
        self.abandon();
    }
}

fn dropped() -> Error {
    Error::ConnectionLost {
        reason: "connection dropped".into(),
    }
}

struct OutgoingMessage {
    buf: Buffer,
    sent: Option<oneshot::Sender<Result<()>>>,
}

impl OutgoingMessage {
    fn new(buf: Buffer) -> Self {
        Self { buf, sent: None }
    }
}

struct ConnectionInner {
    state: State,
    transceiver: Box<dyn Transceiver>,
    exception: Option<Error>,
    started: bool,
    read_header: bool,
    read_buf: Buffer,
    write_queue: VecDeque<OutgoingMessage>,
    requests: HashMap<i32, oneshot::Sender<Result<ReplyMessage>>>,
    next_request_id: i32,
    dispatch_count: usize,
    batch: BatchRequestQueue,
    acm: AcmConfig,
    last_activity: Instant,
    shutdown_initiated: bool,
    close_deadline: Option<Instant>,
    close_after_requests: bool,
    heartbeat_callback: Option<HeartbeatCallback>,
    close_callback: Option<CloseCallback>,
    start_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ConnectionInner {
    fn allocate_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    fn is_reading(&self) -> bool {
        !self.read_header || self.read_buf.position() > 0
    }
}

/// Work deferred until the connection lock is released.
#[derive(Default)]
struct Effects {
    sent: Vec<(oneshot::Sender<Result<()>>, Result<()>)>,
    replies: Vec<(oneshot::Sender<Result<ReplyMessage>>, Result<ReplyMessage>)>,
    started: Vec<(oneshot::Sender<Result<()>>, Result<()>)>,
    dispatches: Vec<IncomingRequest>,
    heartbeat: Option<HeartbeatCallback>,
    closed: Option<CloseCallback>,
}

pub struct Connection {
    id: u64,
    protocol: String,
    datagram: bool,
    role: Role,
    config: Arc<Config>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    inner: Mutex<ConnectionInner>,
    state_tx: watch::Sender<State>,
    weak_self: Weak<Connection>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("role", &self.role)
            .finish()
    }
}

impl Connection {
    /// Wrap a transceiver. Readiness is driven by `poller`; nothing happens
    /// on the wire until [`start`](Self::start).
    pub fn new(
        mut transceiver: Box<dyn Transceiver>,
        config: Arc<Config>,
        role: Role,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        poller: &ReadinessPoller,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(State::NotInitialized);
        Arc::new_cyclic(|weak: &Weak<Connection>| {
            transceiver.register(poller.notifier(weak.clone()));
            Connection {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                protocol: transceiver.protocol().to_string(),
                datagram: transceiver.is_datagram(),
                role,
                dispatcher,
                inner: Mutex::new(ConnectionInner {
                    state: State::NotInitialized,
                    transceiver,
                    exception: None,
                    started: false,
                    read_header: true,
                    read_buf: Buffer::with_size(HEADER_SIZE),
                    write_queue: VecDeque::new(),
                    requests: HashMap::new(),
                    next_request_id: 1,
                    dispatch_count: 0,
                    batch: BatchRequestQueue::new(config.batch_auto_flush_size),
                    acm: config.acm,
                    last_activity: Instant::now(),
                    shutdown_initiated: false,
                    close_deadline: None,
                    close_after_requests: false,
                    heartbeat_callback: None,
                    close_callback: None,
                    start_waiters: Vec::new(),
                }),
                config,
                state_tx,
                weak_self: weak.clone(),
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn is_datagram(&self) -> bool {
        self.datagram
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn description(&self) -> String {
        self.inner.lock().transceiver.description()
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// The error that closed (or is closing) the connection.
    pub fn exception(&self) -> Option<Error> {
        self.inner.lock().exception.clone()
    }

    /// Twoway requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Incoming requests whose responder is still alive.
    pub fn dispatch_count(&self) -> usize {
        self.inner.lock().dispatch_count
    }

    /// Batched requests not yet flushed.
    pub fn batch_request_count(&self) -> usize {
        self.inner.lock().batch.len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Initialize and validate the connection.
    ///
    /// Resolves once the connection is active, or with the error that
    /// closed it.
    pub async fn start(&self) -> Result<()> {
        let rx = {
            let mut inner = self.inner.lock();
            if let Some(ex) = &inner.exception {
                return Err(ex.clone());
            }
            if inner.state >= State::Active {
                return Ok(());
            }
            inner.started = true;
            let (tx, rx) = oneshot::channel();
            inner.start_waiters.push(tx);
            rx
        };
        self.poll_ready();
        rx.await.unwrap_or_else(|_| Err(dropped()))
    }

    /// Make progress on whatever the transceiver is ready for: initialize,
    /// validation, pending writes, then incoming messages.
    pub fn poll_ready(&self) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            loop {
                match self.process(inner, &mut effects) {
                    Ok(()) => break,
                    Err(ex) => {
                        if self.drop_datagram(inner, &ex) {
                            continue;
                        }
                        self.set_state(inner, State::Closed, Some(ex), &mut effects);
                        break;
                    }
                }
            }
        }
        self.run_effects(effects);
    }

    /// Resume reading incoming messages.
    pub fn activate(&self) {
        self.with_inner(|conn, inner, effects| {
            conn.set_state(inner, State::Active, None, effects);
        });
        self.poll_ready();
    }

    /// Stop reading incoming messages; writes and replies continue.
    pub fn hold(&self) {
        self.with_inner(|conn, inner, effects| {
            conn.set_state(inner, State::Holding, None, effects);
        });
    }

    pub fn close(&self, mode: CloseMode) {
        self.with_inner(|conn, inner, effects| match mode {
            CloseMode::Forcefully => conn.set_state(
                inner,
                State::Closed,
                Some(Error::ConnectionManuallyClosed { graceful: false }),
                effects,
            ),
            CloseMode::Gracefully => conn.set_state(
                inner,
                State::Closing,
                Some(Error::ConnectionManuallyClosed { graceful: true }),
                effects,
            ),
            CloseMode::GracefullyWithWait => {
                if inner.requests.is_empty() {
                    conn.set_state(
                        inner,
                        State::Closing,
                        Some(Error::ConnectionManuallyClosed { graceful: true }),
                        effects,
                    );
                } else {
                    inner.close_after_requests = true;
                }
            }
        });
    }

    /// Resolves once the connection reached [`State::Finished`].
    pub async fn wait_until_finished(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == State::Finished).await;
    }

    pub fn set_heartbeat_callback(&self, callback: Option<HeartbeatCallback>) {
        self.inner.lock().heartbeat_callback = callback;
    }

    /// Install the close callback; runs at once when already closed.
    pub fn set_close_callback(&self, callback: CloseCallback) {
        let run_now = {
            let mut inner = self.inner.lock();
            if inner.state >= State::Closed {
                Some(callback)
            } else {
                inner.close_callback = Some(callback);
                None
            }
        };
        if let (Some(callback), Some(conn)) = (run_now, self.weak_self.upgrade()) {
            callback(&conn);
        }
    }

    /// Override the ACM settings of this connection; `None` restores the
    /// configured ones.
    pub fn set_acm(&self, acm: Option<AcmConfig>) {
        let mut inner = self.inner.lock();
        inner.acm = acm.unwrap_or(self.config.acm);
        inner.last_activity = Instant::now();
    }

    pub fn acm(&self) -> AcmConfig {
        self.inner.lock().acm
    }

    /// Send a validate message now.
    pub fn heartbeat(&self) -> Result<()> {
        let mut effects = Effects::default();
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(ex) = &inner.exception {
                Err(ex.clone())
            } else if inner.state < State::Active {
                Err(Error::ConnectionNotValidated)
            } else {
                self.send_heartbeat(inner, &mut effects)
            }
        };
        self.run_effects(effects);
        result
    }

    // ========================================================================
    // Outgoing requests
    // ========================================================================

    /// Send a framed request message (header, request id placeholder and
    /// body). The request id (twoway) or batch count and the message size
    /// are filled in here.
    ///
    /// A connection that already failed returns [`Error::Retry`]: the
    /// request was never sent and may be repeated on another connection.
    pub fn send_async_request(
        &self,
        msg: Buffer,
        twoway: bool,
        batch_count: i32,
    ) -> Result<AsyncRequest> {
        let mut effects = Effects::default();
        let result = {
            let mut guard = self.inner.lock();
            self.send_request(&mut guard, msg, twoway, batch_count, &mut effects)
        };
        self.run_effects(effects);
        result
    }

    fn send_request(
        &self,
        inner: &mut ConnectionInner,
        mut msg: Buffer,
        twoway: bool,
        batch_count: i32,
        effects: &mut Effects,
    ) -> Result<AsyncRequest> {
        if let Some(ex) = &inner.exception {
            return Err(Error::Retry(Box::new(ex.clone())));
        }
        if !matches!(inner.state, State::Active | State::Holding) {
            return Err(Error::ConnectionNotValidated);
        }
        if twoway && self.datagram {
            return Err(Error::IllegalArgument {
                reason: "twoway request over a datagram connection".into(),
            });
        }
        if self.datagram && msg.limit() > MAX_DATAGRAM_SIZE {
            return Err(Error::DatagramLimit);
        }

        let request_id = if twoway {
            inner.allocate_request_id()
        } else {
            0
        };
        if twoway {
            msg.put_i32_at(REQUEST_ID_OFFSET, request_id)?;
        } else if batch_count > 0 {
            msg.put_i32_at(REQUEST_ID_OFFSET, batch_count)?;
        }
        msg.put_i32_at(SIZE_OFFSET, msg.limit() as i32)?;
        msg.set_position(0);

        let reply = if twoway {
            let (tx, rx) = oneshot::channel();
            inner.requests.insert(request_id, tx);
            Some(rx)
        } else {
            None
        };
        let (sent_tx, sent_rx) = oneshot::channel();
        let message = OutgoingMessage {
            buf: msg,
            sent: Some(sent_tx),
        };
        match self.send_message(inner, message, effects) {
            Ok(sent_synchronously) => Ok(AsyncRequest {
                request_id,
                sent_synchronously,
                sent: (!sent_synchronously).then_some(sent_rx),
                sent_ok: sent_synchronously,
                reply,
                connection: self.weak_self.clone(),
            }),
            Err(ex) => {
                inner.requests.remove(&request_id);
                self.set_state(inner, State::Closed, Some(ex.clone()), effects);
                Err(inner.exception.clone().unwrap_or(ex))
            }
        }
    }

    /// Append a request body (without request id) to the batch. The batch
    /// is flushed first when it would exceed the auto flush size. Refused
    /// until the connection is validated.
    pub fn queue_batch_request(&self, body: &[u8]) -> Result<()> {
        let mut effects = Effects::default();
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(ex) = &inner.exception {
                Err(ex.clone())
            } else if !matches!(inner.state, State::Active | State::Holding) {
                Err(Error::ConnectionNotValidated)
            } else {
                match inner.batch.enqueue(body) {
                    Some((batch, count)) => self
                        .send_request(inner, batch, false, count, &mut effects)
                        .map(|_| ()),
                    None => Ok(()),
                }
            }
        };
        self.run_effects(effects);
        result
    }

    /// Send the queued batch, if any.
    pub fn flush_batch_requests(&self) -> Result<Option<AsyncRequest>> {
        let mut effects = Effects::default();
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(ex) = &inner.exception {
                Err(ex.clone())
            } else if !matches!(inner.state, State::Active | State::Holding) {
                Err(Error::ConnectionNotValidated)
            } else {
                match inner.batch.take() {
                    Some((batch, count)) => self
                        .send_request(inner, batch, false, count, &mut effects)
                        .map(Some),
                    None => Ok(None),
                }
            }
        };
        self.run_effects(effects);
        result
    }

    /// Drop the pending entry of a twoway request (timeout, cancellation).
    pub fn abandon_request(&self, request_id: i32) {
        self.with_inner(|conn, inner, effects| {
            if inner.requests.remove(&request_id).is_some() {
                log::trace!("[Protocol] abandoned request {}", request_id);
            }
            conn.check_close_after_requests(inner, effects);
        });
    }

    /// Completion of an incoming request; `reply` is `None` for oneway.
    pub(crate) fn send_response(&self, reply: Option<Buffer>) {
        self.with_inner(|conn, inner, effects| {
            if let Some(buf) = reply {
                if inner.state < State::Closed {
                    if let Err(ex) = conn.send_reply(inner, buf, effects) {
                        conn.set_state(inner, State::Closed, Some(ex), effects);
                    }
                }
            }
            inner.dispatch_count = inner.dispatch_count.saturating_sub(1);
            if inner.dispatch_count == 0 {
                match inner.state {
                    State::Closing => {
                        if let Err(ex) = conn.initiate_shutdown(inner, effects) {
                            conn.set_state(inner, State::Closed, Some(ex), effects);
                        }
                    }
                    State::Closed => conn.set_state(inner, State::Finished, None, effects),
                    _ => {}
                }
            }
        });
    }

    fn send_reply(
        &self,
        inner: &mut ConnectionInner,
        mut buf: Buffer,
        effects: &mut Effects,
    ) -> Result<()> {
        let size = buf.limit() as i32;
        buf.put_i32_at(SIZE_OFFSET, size)?;
        buf.set_position(0);
        self.send_message(inner, OutgoingMessage::new(buf), effects)?;
        Ok(())
    }

    // ========================================================================
    // Event processing (lock held)
    // ========================================================================

    fn with_inner<F>(&self, f: F)
    where
        F: FnOnce(&Self, &mut ConnectionInner, &mut Effects),
    {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.lock();
            f(self, &mut guard, &mut effects);
        }
        self.run_effects(effects);
    }

    fn process(&self, inner: &mut ConnectionInner, effects: &mut Effects) -> Result<()> {
        match inner.state {
            State::NotInitialized | State::NotValidated => {
                if !inner.started || !self.validate(inner, effects)? {
                    return Ok(());
                }
            }
            State::Closed | State::Finished => return Ok(()),
            _ => {}
        }
        if !inner.write_queue.is_empty() {
            self.flush_writes(inner, effects)?;
        }
        self.read_messages(inner, effects)
    }

    /// Returns true once the connection is active.
    fn validate(&self, inner: &mut ConnectionInner, effects: &mut Effects) -> Result<bool> {
        if inner.state == State::NotInitialized {
            if !inner.transceiver.initialize()?.is_none() {
                return Ok(false);
            }
            self.set_state(inner, State::NotValidated, None, effects);
            if !self.datagram && self.role == Role::Incoming {
                let msg = header_only_message(MessageType::ValidateConnection);
                self.send_message(inner, OutgoingMessage::new(msg), effects)?;
            }
        }

        if !self.datagram {
            match self.role {
                Role::Incoming => {
                    if !inner.write_queue.is_empty() {
                        self.flush_writes(inner, effects)?;
                        if !inner.write_queue.is_empty() {
                            return Ok(false);
                        }
                    }
                }
                Role::Outgoing => {
                    if !inner.transceiver.read(&mut inner.read_buf)?.is_none() {
                        return Ok(false);
                    }
                    inner.read_buf.set_position(0);
                    let header = MessageHeader::decode(&mut inner.read_buf)?;
                    if header.kind() != Some(MessageType::ValidateConnection) {
                        return Err(Error::ConnectionNotValidated);
                    }
                    if header.size != HEADER_SIZE as i32 {
                        return Err(Error::IllegalMessageSize { size: header.size });
                    }
                    trace::trace_recv(&self.config.trace, inner.read_buf.as_slice(), &self.protocol);
                    inner.read_buf = Buffer::with_size(HEADER_SIZE);
                }
            }
        }

        if self.config.trace.network >= 1 {
            log::debug!(
                "[Network] established {} connection\n{}",
                self.protocol,
                inner.transceiver.description()
            );
        }
        inner.last_activity = Instant::now();
        self.set_state(inner, State::Active, None, effects);
        for tx in inner.start_waiters.drain(..) {
            effects.started.push((tx, Ok(())));
        }
        Ok(true)
    }

    /// Returns true when the message went out entirely within this call.
    fn send_message(
        &self,
        inner: &mut ConnectionInner,
        mut msg: OutgoingMessage,
        effects: &mut Effects,
    ) -> Result<bool> {
        trace::trace_send(&self.config.trace, msg.buf.as_slice(), &self.protocol);
        if !inner.write_queue.is_empty() {
            inner.write_queue.push_back(msg);
            return Ok(false);
        }
        let op = inner.transceiver.write(&mut msg.buf)?;
        self.trace_io(inner, "sent", msg.buf.position());
        if !op.is_none() {
            inner.write_queue.push_back(msg);
            return Ok(false);
        }
        inner.last_activity = Instant::now();
        if let Some(tx) = msg.sent {
            effects.sent.push((tx, Ok(())));
        }
        self.check_close_sent(inner, effects);
        Ok(true)
    }

    fn flush_writes(&self, inner: &mut ConnectionInner, effects: &mut Effects) -> Result<()> {
        while let Some(front) = inner.write_queue.front_mut() {
            let before = front.buf.position();
            let op = inner.transceiver.write(&mut front.buf)?;
            let written = front.buf.position() - before;
            self.trace_io(inner, "sent", written);
            if !op.is_none() {
                return Ok(());
            }
            inner.last_activity = Instant::now();
            if let Some(msg) = inner.write_queue.pop_front() {
                if let Some(tx) = msg.sent {
                    effects.sent.push((tx, Ok(())));
                }
            }
        }
        self.check_close_sent(inner, effects);
        Ok(())
    }

    fn read_messages(&self, inner: &mut ConnectionInner, effects: &mut Effects) -> Result<()> {
        loop {
            if inner.state == State::Holding || inner.state >= State::Closed {
                return Ok(());
            }
            let before = inner.read_buf.position();
            let op = inner.transceiver.read(&mut inner.read_buf)?;
            let read = inner.read_buf.position().saturating_sub(before);
            self.trace_io(inner, "received", read);
            if read > 0 {
                inner.last_activity = Instant::now();
            }
            if !op.is_none() {
                return Ok(());
            }

            if inner.read_header {
                let available = inner.read_buf.position();
                if available < HEADER_SIZE {
                    return Err(Error::IllegalMessageSize {
                        size: available as i32,
                    });
                }
                inner.read_buf.set_position(0);
                let header = MessageHeader::decode(&mut inner.read_buf)?;
                let size = header.size as usize;
                if self.config.exceeds_message_size(size) {
                    return Err(Error::MemoryLimit {
                        size,
                        max: self.config.message_size_max,
                    });
                }
                inner.read_header = false;
                if self.datagram {
                    if size > inner.read_buf.limit() {
                        return Err(Error::DatagramLimit);
                    }
                    inner.read_buf.resize(size);
                } else {
                    inner.read_buf.resize(size);
                    if inner.read_buf.has_remaining() {
                        continue;
                    }
                }
            }

            let mut msg = std::mem::replace(&mut inner.read_buf, Buffer::with_size(HEADER_SIZE));
            inner.read_header = true;
            msg.set_position(0);
            self.parse_message(inner, msg, effects)?;
        }
    }

    fn parse_message(
        &self,
        inner: &mut ConnectionInner,
        mut msg: Buffer,
        effects: &mut Effects,
    ) -> Result<()> {
        trace::trace_recv(&self.config.trace, msg.as_slice(), &self.protocol);
        let header = MessageHeader::decode(&mut msg)?;
        match header.kind() {
            Some(MessageType::CloseConnection) => {
                if self.datagram {
                    if self.config.warn_datagrams {
                        log::warn!(
                            "[Network] ignoring close connection message for datagram connection:\n{}",
                            inner.transceiver.description()
                        );
                    }
                } else {
                    self.enter_closing_pending(
                        inner,
                        false,
                        Some(Error::CloseConnection),
                        effects,
                    );
                }
            }
            Some(MessageType::Request) => {
                if inner.state >= State::Closing {
                    log::trace!(
                        "[Protocol] received request during closing (ignored, the peer retries)"
                    );
                } else {
                    let request_id = msg.get_i32()?;
                    let mut is = InputStream::from_buffer(CURRENT_PROTOCOL_ENCODING, msg);
                    let request = IncomingRequest::read(&mut is, request_id)?;
                    inner.dispatch_count += 1;
                    effects.dispatches.push(request);
                }
            }
            Some(MessageType::RequestBatch) => {
                if inner.state >= State::Closing {
                    log::trace!(
                        "[Protocol] received batch request during closing (ignored, the peer retries)"
                    );
                } else {
                    let count = msg.get_i32()?;
                    if count < 0 {
                        return Err(Error::UnmarshalOutOfBounds {
                            reason: format!("negative batch request count {}", count),
                        });
                    }
                    let mut is = InputStream::from_buffer(CURRENT_PROTOCOL_ENCODING, msg);
                    for _ in 0..count {
                        let request = IncomingRequest::read(&mut is, 0)?;
                        inner.dispatch_count += 1;
                        effects.dispatches.push(request);
                    }
                }
            }
            Some(MessageType::Reply) => {
                let request_id = msg.get_i32()?;
                match inner.requests.remove(&request_id) {
                    Some(tx) => effects.replies.push((
                        tx,
                        Ok(ReplyMessage {
                            request_id,
                            body: msg,
                        }),
                    )),
                    None => log::trace!("[Protocol] discarding reply for request {}", request_id),
                }
                self.check_close_after_requests(inner, effects);
            }
            Some(MessageType::ValidateConnection) => {
                effects.heartbeat = inner.heartbeat_callback.clone();
            }
            None => {
                return Err(Error::UnknownMessage {
                    message_type: header.message_type,
                })
            }
        }
        Ok(())
    }

    /// A malformed datagram is dropped without closing the connection.
    fn drop_datagram(&self, inner: &mut ConnectionInner, ex: &Error) -> bool {
        if !self.datagram || ex.is_socket() || inner.state >= State::Closing {
            return false;
        }
        if inner.state < State::Active {
            return false;
        }
        if self.config.warn_datagrams {
            log::warn!(
                "[Network] datagram connection exception:\n{}\n{}",
                ex,
                inner.transceiver.description()
            );
        }
        inner.read_header = true;
        inner.read_buf = Buffer::with_size(HEADER_SIZE);
        true
    }

    fn send_heartbeat(&self, inner: &mut ConnectionInner, effects: &mut Effects) -> Result<()> {
        if self.datagram {
            return Ok(());
        }
        let msg = header_only_message(MessageType::ValidateConnection);
        if let Err(ex) = self.send_message(inner, OutgoingMessage::new(msg), effects) {
            self.set_state(inner, State::Closed, Some(ex.clone()), effects);
            return Err(ex);
        }
        Ok(())
    }

    fn check_close_after_requests(&self, inner: &mut ConnectionInner, effects: &mut Effects) {
        if inner.close_after_requests && inner.requests.is_empty() {
            inner.close_after_requests = false;
            self.set_state(
                inner,
                State::Closing,
                Some(Error::ConnectionManuallyClosed { graceful: true }),
                effects,
            );
        }
    }

    /// Close message fully written: wait for the peer to close.
    fn check_close_sent(&self, inner: &mut ConnectionInner, effects: &mut Effects) {
        if inner.state == State::Closing
            && inner.shutdown_initiated
            && inner.write_queue.is_empty()
        {
            self.enter_closing_pending(inner, true, None, effects);
        }
    }

    fn enter_closing_pending(
        &self,
        inner: &mut ConnectionInner,
        initiator: bool,
        ex: Option<Error>,
        effects: &mut Effects,
    ) {
        self.set_state(inner, State::ClosingPending, ex, effects);
        if inner.state != State::ClosingPending {
            return;
        }
        if inner.transceiver.closing(initiator).is_none() {
            self.set_state(inner, State::Closed, None, effects);
        }
    }

    fn initiate_shutdown(&self, inner: &mut ConnectionInner, effects: &mut Effects) -> Result<()> {
        if inner.shutdown_initiated {
            return Ok(());
        }
        inner.shutdown_initiated = true;
        if self.datagram {
            return Ok(());
        }
        if !self.config.close_timeout.is_zero() {
            inner.close_deadline = Some(Instant::now() + self.config.close_timeout);
        }
        let msg = header_only_message(MessageType::CloseConnection);
        self.send_message(inner, OutgoingMessage::new(msg), effects)?;
        Ok(())
    }

    /// Record `ex` (first error wins) and move to `state`.
    fn set_state(
        &self,
        inner: &mut ConnectionInner,
        state: State,
        ex: Option<Error>,
        effects: &mut Effects,
    ) {
        if let Some(ex) = ex {
            if inner.state >= State::Closed || inner.state == state {
                return;
            }
            if inner.exception.is_none() {
                if self.config.warn_connections && !self.is_benign(inner, &ex) {
                    log::warn!(
                        "[Network] connection exception:\n{}\n{}",
                        ex,
                        inner.transceiver.description()
                    );
                }
                inner.exception = Some(ex);
            }
        }
        self.transition(inner, state, effects);
    }

    fn is_benign(&self, inner: &ConnectionInner, ex: &Error) -> bool {
        match ex {
            Error::CloseConnection
            | Error::ConnectionManuallyClosed { .. }
            | Error::ConnectionTimeout
            | Error::CommunicatorDestroyed
            | Error::ObjectAdapterDeactivated { .. } => true,
            Error::ConnectionLost { .. } => inner.state >= State::Closing,
            _ => false,
        }
    }

    fn transition(&self, inner: &mut ConnectionInner, state: State, effects: &mut Effects) {
        let mut state = state;
        if state == State::Closing && (self.datagram || inner.state < State::Active) {
            state = State::Closed;
        }
        if inner.state == state {
            return;
        }
        let allowed = match state {
            State::NotInitialized => false,
            State::NotValidated => inner.state == State::NotInitialized,
            State::Active => matches!(inner.state, State::NotValidated | State::Holding),
            State::Holding => inner.state == State::Active,
            State::Closing | State::ClosingPending => inner.state < state,
            State::Closed => inner.state < State::Closed,
            State::Finished => inner.state == State::Closed,
        };
        if !allowed {
            return;
        }

        inner.state = state;
        self.state_tx.send_replace(state);

        match state {
            State::Closing => {
                if inner.dispatch_count == 0 {
                    if let Err(ex) = self.initiate_shutdown(inner, effects) {
                        self.set_state(inner, State::Closed, Some(ex), effects);
                    }
                }
            }
            State::Closed => {
                inner.transceiver.unregister();
                inner.transceiver.close();
                let ex = inner.exception.clone().unwrap_or_else(|| Error::ConnectionLost {
                    reason: "connection closed".into(),
                });
                if self.config.trace.network >= 1 {
                    log::debug!(
                        "[Network] closed {} connection\n{}\n{}",
                        self.protocol,
                        inner.transceiver.description(),
                        ex
                    );
                }
                for (_, tx) in inner.requests.drain() {
                    effects.replies.push((tx, Err(ex.clone())));
                }
                for msg in inner.write_queue.drain(..) {
                    if let Some(tx) = msg.sent {
                        effects.sent.push((tx, Err(ex.clone())));
                    }
                }
                for tx in inner.start_waiters.drain(..) {
                    effects.started.push((tx, Err(ex.clone())));
                }
                inner.batch.clear();
                inner.close_deadline = None;
                effects.closed = inner.close_callback.take();
                if inner.dispatch_count == 0 {
                    self.transition(inner, State::Finished, effects);
                }
            }
            State::Finished => {
                inner.read_buf = Buffer::new();
                inner.heartbeat_callback = None;
            }
            _ => {}
        }
    }

    fn trace_io(&self, inner: &ConnectionInner, verb: &str, n: usize) {
        if self.config.trace.network >= 2 {
            trace::trace_bytes(&self.config.trace, verb, n, &inner.transceiver.description());
        }
    }

    fn run_effects(&self, effects: Effects) {
        for (tx, result) in effects.sent {
            let _ = tx.send(result);
        }
        for (tx, result) in effects.replies {
            let _ = tx.send(result);
        }
        for (tx, result) in effects.started {
            let _ = tx.send(result);
        }
        let has_callbacks = effects.heartbeat.is_some() || effects.closed.is_some();
        if effects.dispatches.is_empty() && !has_callbacks {
            return;
        }
        let Some(conn) = self.weak_self.upgrade() else {
            return;
        };
        if let Some(heartbeat) = effects.heartbeat {
            heartbeat(&conn);
        }
        for request in effects.dispatches {
            let responder = Responder::new(self.weak_self.clone(), &request);
            match &self.dispatcher {
                Some(dispatcher) => dispatcher.dispatch(request, responder),
                None => responder.object_not_exist(),
            }
        }
        if let Some(closed) = effects.closed {
            closed(&conn);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state < State::Closed {
            inner.transceiver.unregister();
            inner.transceiver.close();
        }
    }
}

#[cfg(test)]
mod tests;
