// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incoming request dispatch.
//!
//! Every request read from a connection is handed to the connection's
//! [`Dispatcher`] together with a [`Responder`]. The responder sends the
//! reply (twoway requests only) and releases the dispatch slot the request
//! holds on the connection; the connection only finishes once every
//! responder is gone.

use std::sync::{Arc, Weak};

use super::Connection;
use crate::buffer::Buffer;
use crate::error::Result;
use crate::identity::{Context, Identity, OperationMode};
use crate::protocol::{EncodingVersion, MessageHeader, MessageType, ReplyStatus};
use crate::stream::{InputStream, OutputStream, TypeRegistry};

/// A request as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    /// 0 for oneway and batched requests.
    pub request_id: i32,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    /// In-parameters encapsulation, size and encoding included.
    pub params: Vec<u8>,
    pub encoding: EncodingVersion,
}

impl IncomingRequest {
    /// Read one request body (everything after the request id).
    pub(crate) fn read(is: &mut InputStream, request_id: i32) -> Result<Self> {
        let identity = is.read_identity()?;
        let facet = read_facet(is)?;
        let operation = is.read_string()?;
        let mode = is.read_u8()?;
        let mode = OperationMode::from_u8(mode).ok_or_else(|| {
            crate::error::Error::marshal(format!("invalid operation mode {}", mode))
        })?;
        let context = is.read_context()?;
        let (params, encoding) = is.read_encapsulation()?;
        Ok(Self {
            request_id,
            identity,
            facet,
            operation,
            mode,
            context,
            params,
            encoding,
        })
    }

    pub fn is_twoway(&self) -> bool {
        self.request_id != 0
    }

    /// Stream positioned at the start of the parameters encapsulation.
    pub fn params_stream(&self, registry: Arc<TypeRegistry>) -> InputStream {
        InputStream::new(self.encoding, self.params.clone()).with_registry(registry)
    }
}

/// Facets travel as a sequence holding zero or one name.
pub(crate) fn read_facet(is: &mut InputStream) -> Result<String> {
    let mut facet = is.read_string_seq()?;
    match facet.len() {
        0 => Ok(String::new()),
        1 => Ok(facet.remove(0)),
        n => Err(crate::error::Error::marshal(format!(
            "facet sequence with {} entries",
            n
        ))),
    }
}

pub(crate) fn write_facet(os: &mut OutputStream, facet: &str) {
    if facet.is_empty() {
        os.write_size(0);
    } else {
        os.write_string_seq(&[facet]);
    }
}

/// Servant-side handler for incoming requests.
///
/// Called on the connection's readiness thread, without any connection
/// lock held. Long-running work should be moved elsewhere, keeping the
/// responder.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, request: IncomingRequest, responder: Responder);
}

impl<F> Dispatcher for F
where
    F: Fn(IncomingRequest, Responder) + Send + Sync,
{
    fn dispatch(&self, request: IncomingRequest, responder: Responder) {
        self(request, responder)
    }
}

/// Completes one incoming request.
///
/// Dropping a twoway responder without answering replies with an unknown
/// exception.
pub struct Responder {
    connection: Weak<Connection>,
    request_id: i32,
    identity: Identity,
    facet: String,
    operation: String,
    done: bool,
}

impl Responder {
    pub(crate) fn new(connection: Weak<Connection>, request: &IncomingRequest) -> Self {
        Self {
            connection,
            request_id: request.request_id,
            identity: request.identity.clone(),
            facet: request.facet.clone(),
            operation: request.operation.clone(),
            done: false,
        }
    }

    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn is_twoway(&self) -> bool {
        self.request_id != 0
    }

    /// Successful reply carrying the out-parameters encapsulation.
    pub fn ok(mut self, encaps: &[u8]) {
        self.complete(ReplyStatus::Ok, |os| os.write_encapsulation(encaps));
    }

    /// Reply carrying an encapsulated user exception.
    pub fn user_exception(mut self, encaps: &[u8]) {
        self.complete(ReplyStatus::UserException, |os| {
            os.write_encapsulation(encaps)
        });
    }

    pub fn object_not_exist(mut self) {
        self.request_failed(ReplyStatus::ObjectNotExist);
    }

    pub fn facet_not_exist(mut self) {
        self.request_failed(ReplyStatus::FacetNotExist);
    }

    pub fn operation_not_exist(mut self) {
        self.request_failed(ReplyStatus::OperationNotExist);
    }

    pub fn unknown_local_exception(mut self, message: &str) {
        self.unknown(ReplyStatus::UnknownLocalException, message);
    }

    pub fn unknown_user_exception(mut self, message: &str) {
        self.unknown(ReplyStatus::UnknownUserException, message);
    }

    pub fn unknown_exception(mut self, message: &str) {
        self.unknown(ReplyStatus::UnknownException, message);
    }

    fn request_failed(&mut self, status: ReplyStatus) {
        let identity = self.identity.clone();
        let facet = self.facet.clone();
        let operation = self.operation.clone();
        self.complete(status, |os| {
            os.write_identity(&identity);
            write_facet(os, &facet);
            os.write_string(&operation);
            Ok(())
        });
    }

    fn unknown(&mut self, status: ReplyStatus, message: &str) {
        self.complete(status, |os| {
            os.write_string(message);
            Ok(())
        });
    }

    fn complete<F>(&mut self, status: ReplyStatus, body: F)
    where
        F: FnOnce(&mut OutputStream) -> Result<()>,
    {
        if self.done {
            return;
        }
        self.done = true;
        let Some(conn) = self.connection.upgrade() else {
            return;
        };
        if !self.is_twoway() {
            conn.send_response(None);
            return;
        }
        let reply = match reply_message(self.request_id, status, body) {
            Ok(buf) => buf,
            Err(e) => {
                log::debug!(
                    "[Protocol] failed to marshal reply for `{}': {}",
                    self.operation,
                    e
                );
                let message = e.to_string();
                match reply_message(self.request_id, ReplyStatus::UnknownLocalException, |os| {
                    os.write_string(&message);
                    Ok(())
                }) {
                    Ok(buf) => buf,
                    Err(_) => {
                        conn.send_response(None);
                        return;
                    }
                }
            }
        };
        conn.send_response(Some(reply));
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.done {
            let operation = self.operation.clone();
            self.unknown(
                ReplyStatus::UnknownException,
                &format!("dispatch of `{}' completed without a response", operation),
            );
        }
    }
}

fn reply_message<F>(request_id: i32, status: ReplyStatus, body: F) -> Result<Buffer>
where
    F: FnOnce(&mut OutputStream) -> Result<()>,
{
    let mut os = OutputStream::for_protocol();
    MessageHeader::new(MessageType::Reply).encode(os.buffer_mut());
    os.write_i32(request_id);
    os.write_u8(status as u8);
    body(&mut os)?;
    Ok(os.into_buffer())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ENCODING_1_1, HEADER_SIZE};

    fn request_body() -> Vec<u8> {
        let mut os = OutputStream::for_protocol();
        os.write_identity(&Identity::with_category("hello", "demo"));
        write_facet(&mut os, "admin");
        os.write_string("sayHello");
        os.write_u8(OperationMode::Idempotent as u8);
        let mut ctx = Context::new();
        ctx.insert("k".into(), "v".into());
        os.write_context(&ctx);
        os.write_empty_encapsulation(ENCODING_1_1).unwrap();
        os.into_bytes()
    }

    #[test]
    fn test_read_request_body() {
        let mut is = InputStream::new(crate::protocol::CURRENT_PROTOCOL_ENCODING, request_body());
        let request = IncomingRequest::read(&mut is, 7).unwrap();
        assert_eq!(request.identity.to_string(), "demo/hello");
        assert_eq!(request.facet, "admin");
        assert_eq!(request.operation, "sayHello");
        assert_eq!(request.mode, OperationMode::Idempotent);
        assert_eq!(request.context.get("k").map(String::as_str), Some("v"));
        assert_eq!(request.params, vec![6, 0, 0, 0, 1, 1]);
        assert!(request.is_twoway());
        assert_eq!(is.remaining(), 0);
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let mut bytes = request_body();
        // identity, facet sequence and operation precede the mode.
        let mode_pos = (1 + 5) + (1 + 4) + (1 + 1 + 5) + (1 + 8);
        bytes[mode_pos] = 9;
        let mut is = InputStream::new(crate::protocol::CURRENT_PROTOCOL_ENCODING, bytes);
        assert!(IncomingRequest::read(&mut is, 0).is_err());
    }

    #[test]
    fn test_reply_message_layout() {
        let buf = reply_message(3, ReplyStatus::UnknownException, |os| {
            os.write_string("boom");
            Ok(())
        })
        .unwrap();
        let bytes = buf.as_slice();
        assert_eq!(bytes[8], MessageType::Reply as u8);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + 4], &3i32.to_le_bytes());
        assert_eq!(bytes[HEADER_SIZE + 4], ReplyStatus::UnknownException as u8);
        assert_eq!(&bytes[HEADER_SIZE + 5..], &[4, b'b', b'o', b'o', b'm']);
    }
}
