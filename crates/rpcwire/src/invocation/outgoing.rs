// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One outgoing invocation and its attempts.
//!
//! ```text
//! Idle --send--> Sent            (oneway, datagram, batch)
//!      --send--> AwaitingReply   (twoway) --reply--> Completed
//! ```
//!
//! A failed attempt goes back to `Idle` when the retry policy allows
//! another one.

use std::sync::Arc;

use super::proxy::Proxy;
use super::retry::{check_retry_after_exception, unwrap_retry};
use crate::buffer::Buffer;
use crate::connection::{read_facet, write_facet, Connection, ReplyMessage};
use crate::error::{Error, RequestFailed, Result};
use crate::identity::{Context, OperationMode};
use crate::protocol::{header_only_message, MessageType, ReplyStatus, CURRENT_PROTOCOL_ENCODING};
use crate::reference::InvocationMode;
use crate::stream::{InputStream, OutputStream, TypeRegistry, UserException};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Sent,
    AwaitingReply,
    Completed,
}

/// Outcome of a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    /// False when `encaps` carries a user exception.
    pub ok: bool,
    /// Reply encapsulation; empty for oneway and batch invocations.
    pub encaps: Vec<u8>,
}

impl InvocationResult {
    fn empty() -> Self {
        Self {
            ok: true,
            encaps: Vec::new(),
        }
    }

    /// Stream positioned inside the reply encapsulation.
    pub fn params(&self, registry: Arc<TypeRegistry>) -> Result<InputStream> {
        let mut is =
            InputStream::new(CURRENT_PROTOCOL_ENCODING, self.encaps.clone()).with_registry(registry);
        is.start_encapsulation()?;
        Ok(is)
    }

    /// Decode the user exception of a failed invocation.
    pub fn read_user_exception(&self, registry: Arc<TypeRegistry>) -> Result<Box<dyn UserException>> {
        if self.ok {
            return Err(Error::IllegalArgument {
                reason: "invocation completed without a user exception".into(),
            });
        }
        let mut is = self.params(registry)?;
        let ex = is.read_exception()?;
        is.end_encapsulation()?;
        Ok(ex)
    }
}

/// Failed attempt; `sent` tells whether the request may have reached the
/// peer.
struct Failure {
    error: Error,
    sent: bool,
}

impl Failure {
    fn unsent(error: Error) -> Self {
        Self { error, sent: false }
    }
}

pub struct OutgoingAsync<'a> {
    proxy: &'a Proxy,
    operation: &'a str,
    mode: OperationMode,
    params: &'a [u8],
    context: Option<&'a Context>,
    state: InvocationState,
    sent_synchronously: bool,
    attempts: usize,
}

impl<'a> OutgoingAsync<'a> {
    pub(crate) fn new(
        proxy: &'a Proxy,
        operation: &'a str,
        mode: OperationMode,
        params: &'a [u8],
        context: Option<&'a Context>,
    ) -> Self {
        Self {
            proxy,
            operation,
            mode,
            params,
            context,
            state: InvocationState::Idle,
            sent_synchronously: false,
            attempts: 0,
        }
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// True when the last attempt wrote the whole request from the
    /// sending call.
    pub fn sent_synchronously(&self) -> bool {
        self.sent_synchronously
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Run attempts until one completes or the retry policy gives up. The
    /// invocation timeout of the reference bounds all attempts together.
    pub async fn invoke(&mut self) -> Result<InvocationResult> {
        match self.proxy.reference().invocation_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.run())
                .await
                .unwrap_or(Err(Error::InvocationTimeout)),
            None => self.run().await,
        }
    }

    async fn run(&mut self) -> Result<InvocationResult> {
        let mut cnt = 0;
        loop {
            self.attempts += 1;
            match self.attempt().await {
                Ok(result) => {
                    self.state = InvocationState::Completed;
                    return Ok(result);
                }
                Err(Failure { error, sent }) => {
                    self.proxy.clear_connection();
                    self.state = InvocationState::Idle;
                    let delay = check_retry_after_exception(
                        self.proxy.reference(),
                        error,
                        sent,
                        self.mode,
                        &mut cnt,
                        self.proxy.engine().config(),
                    )
                    .map_err(unwrap_retry)?;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    fn body(&self) -> Result<Vec<u8>> {
        let reference = self.proxy.reference();
        let mut os = OutputStream::for_protocol();
        os.write_identity(reference.identity());
        write_facet(&mut os, reference.facet());
        os.write_string(self.operation);
        os.write_u8(self.mode as u8);
        os.write_context(self.context.unwrap_or_else(|| reference.context()));
        os.write_encapsulation(self.params)?;
        Ok(os.into_bytes())
    }

    async fn attempt(&mut self) -> std::result::Result<InvocationResult, Failure> {
        let conn = self.proxy.get_connection().await.map_err(Failure::unsent)?;
        let body = self.body().map_err(Failure::unsent)?;

        match self.proxy.reference().mode() {
            InvocationMode::BatchOneway | InvocationMode::BatchDatagram => {
                conn.queue_batch_request(&body).map_err(Failure::unsent)?;
                self.sent_synchronously = true;
                self.state = InvocationState::Sent;
                Ok(InvocationResult::empty())
            }
            InvocationMode::Oneway | InvocationMode::Datagram => {
                let mut request = conn
                    .send_async_request(request_message(&body), false, 0)
                    .map_err(Failure::unsent)?;
                self.sent_synchronously = request.sent_synchronously();
                request.sent().await.map_err(Failure::unsent)?;
                self.state = InvocationState::Sent;
                Ok(InvocationResult::empty())
            }
            InvocationMode::Twoway => {
                let mut request = conn
                    .send_async_request(request_message(&body), true, 0)
                    .map_err(Failure::unsent)?;
                self.sent_synchronously = request.sent_synchronously();
                self.state = InvocationState::AwaitingReply;
                match request.reply().await {
                    Ok(reply) => self.read_reply(&conn, reply).map_err(|error| Failure {
                        error,
                        sent: true,
                    }),
                    Err(error) => Err(Failure {
                        error,
                        sent: request.is_sent(),
                    }),
                }
            }
        }
    }

    fn read_reply(&self, conn: &Connection, reply: ReplyMessage) -> Result<InvocationResult> {
        let engine = self.proxy.engine();
        let mut is = InputStream::for_protocol(reply.body, conn.config(), engine.registry().clone());
        let status = ReplyStatus::from_u8(is.read_u8()?)?;
        match status {
            ReplyStatus::Ok | ReplyStatus::UserException => {
                let (encaps, _) = is.read_encapsulation()?;
                Ok(InvocationResult {
                    ok: status == ReplyStatus::Ok,
                    encaps,
                })
            }
            ReplyStatus::ObjectNotExist
            | ReplyStatus::FacetNotExist
            | ReplyStatus::OperationNotExist => {
                let mut failed = RequestFailed {
                    identity: is.read_identity()?,
                    facet: read_facet(&mut is)?,
                    operation: is.read_string()?,
                };
                // Peers may leave the operation empty; report ours.
                if failed.operation.is_empty() {
                    failed.operation = self.operation.to_string();
                }
                Err(match status {
                    ReplyStatus::ObjectNotExist => Error::ObjectNotExist(failed),
                    ReplyStatus::FacetNotExist => Error::FacetNotExist(failed),
                    _ => Error::OperationNotExist(failed),
                })
            }
            ReplyStatus::UnknownLocalException => Err(Error::UnknownLocal {
                unknown: is.read_string()?,
            }),
            ReplyStatus::UnknownUserException => Err(Error::UnknownUser {
                unknown: is.read_string()?,
            }),
            ReplyStatus::UnknownException => Err(Error::Unknown {
                unknown: is.read_string()?,
            }),
        }
    }
}

fn request_message(body: &[u8]) -> Buffer {
    let mut buf = header_only_message(MessageType::Request);
    buf.put_i32(0);
    buf.put_slice(body);
    buf
}
