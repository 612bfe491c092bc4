// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol trace helpers.
//!
//! Messages are only decoded for tracing when the protocol trace level is
//! enabled; a message that cannot be decoded is described up to the first
//! malformed field.

use std::fmt::Write as _;

use crate::buffer::Buffer;
use crate::config::TraceLevels;
use crate::error::Result;
use crate::identity::OperationMode;
use crate::protocol::{MessageHeader, MessageType, ReplyStatus, CURRENT_PROTOCOL_ENCODING};
use crate::stream::InputStream;

/// Log a message about to be written.
pub(crate) fn trace_send(levels: &TraceLevels, bytes: &[u8], transport: &str) {
    if levels.protocol >= 1 {
        log::debug!(
            "[Protocol] sending {}\n{}",
            transport,
            describe_message(bytes)
        );
    }
}

/// Log a message just read.
pub(crate) fn trace_recv(levels: &TraceLevels, bytes: &[u8], transport: &str) {
    if levels.protocol >= 1 {
        log::debug!(
            "[Protocol] received {}\n{}",
            transport,
            describe_message(bytes)
        );
    }
}

/// Log a byte count moved by the transport.
pub(crate) fn trace_bytes(levels: &TraceLevels, verb: &str, n: usize, description: &str) {
    if levels.network >= 2 && n > 0 {
        log::trace!("[Network] {} {} bytes via {}", verb, n, description);
    }
}

/// Human readable summary of a framed message.
pub fn describe_message(bytes: &[u8]) -> String {
    let mut out = String::new();
    if let Err(e) = describe_into(&mut out, bytes) {
        let _ = write!(out, "\n(malformed: {})", e);
    }
    out
}

fn describe_into(out: &mut String, bytes: &[u8]) -> Result<()> {
    let mut buf = Buffer::from_vec(bytes.to_vec());
    let header = MessageHeader::decode(&mut buf)?;
    let kind = header.kind();
    match kind {
        Some(kind) => {
            let _ = write!(out, "message type = {}", kind);
        }
        None => {
            let _ = write!(out, "message type = {} (unknown)", header.message_type);
        }
    }
    let _ = write!(
        out,
        "\ncompression status = {}\nmessage size = {}",
        header.compression, header.size
    );

    let mut is = InputStream::from_buffer(CURRENT_PROTOCOL_ENCODING, buf);
    match kind {
        Some(MessageType::Request) => {
            let request_id = is.read_i32()?;
            let _ = write!(out, "\nrequest id = {}", request_id);
            if request_id == 0 {
                out.push_str(" (oneway)");
            }
            describe_request(out, &mut is)?;
        }
        Some(MessageType::RequestBatch) => {
            let count = is.read_i32()?;
            let _ = write!(out, "\nnumber of requests = {}", count);
            for i in 0..count.max(0) {
                let _ = write!(out, "\nrequest #{}:", i);
                describe_request(out, &mut is)?;
            }
        }
        Some(MessageType::Reply) => {
            let request_id = is.read_i32()?;
            let status = ReplyStatus::from_u8(is.read_u8()?)?;
            let _ = write!(out, "\nrequest id = {}\nreply status = {}", request_id, status);
            match status {
                ReplyStatus::Ok | ReplyStatus::UserException => {
                    let encoding = is.skip_encapsulation()?;
                    let _ = write!(out, "\nencoding = {}", encoding);
                }
                ReplyStatus::ObjectNotExist
                | ReplyStatus::FacetNotExist
                | ReplyStatus::OperationNotExist => {
                    let identity = is.read_identity()?;
                    let facet = is.read_string_seq()?;
                    let operation = is.read_string()?;
                    let _ = write!(
                        out,
                        "\nidentity = {}\nfacet = {}\noperation = {}",
                        identity,
                        facet.first().map(String::as_str).unwrap_or(""),
                        operation
                    );
                }
                ReplyStatus::UnknownLocalException
                | ReplyStatus::UnknownUserException
                | ReplyStatus::UnknownException => {
                    let unknown = is.read_string()?;
                    let _ = write!(out, "\nunknown = {}", unknown);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn describe_request(out: &mut String, is: &mut InputStream) -> Result<()> {
    let identity = is.read_identity()?;
    let facet = is.read_string_seq()?;
    let operation = is.read_string()?;
    let mode = is.read_u8()?;
    let context = is.read_context()?;
    let encoding = is.skip_encapsulation()?;
    let _ = write!(
        out,
        "\nidentity = {}\nfacet = {}\noperation = {}\nmode = {}",
        identity,
        facet.first().map(String::as_str).unwrap_or(""),
        operation,
        OperationMode::from_u8(mode)
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("{} (unknown)", mode))
    );
    if !context.is_empty() {
        out.push_str("\ncontext = ");
        let entries: Vec<String> = context.iter().map(|(k, v)| format!("{}/{}", k, v)).collect();
        out.push_str(&entries.join(", "));
    }
    let _ = write!(out, "\nencoding = {}", encoding);
    Ok(())
}
