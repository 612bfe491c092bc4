// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed 14-byte message header.
//!
//! ```text
//! 0       4     6     8    9    10          14
//! +-------+-----+-----+----+----+-----------+
//! | magic | pv  | ev  | mt | cs |   size    |
//! +-------+-----+-----+----+----+-----------+
//! ```
//!
//! `size` is a little-endian i32 covering the whole message, header included.

use std::fmt;

use super::version::{
    check_supported_protocol, check_supported_protocol_encoding, EncodingVersion, ProtocolVersion,
    CURRENT_PROTOCOL, CURRENT_PROTOCOL_ENCODING,
};
use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Message magic: `I`, `c`, `e`, `P`.
pub const MAGIC: [u8; 4] = [0x49, 0x63, 0x65, 0x50];

/// Size of the message header.
pub const HEADER_SIZE: usize = 14;

/// Offset of the size field inside the header.
pub const SIZE_OFFSET: usize = 10;

/// Offset of the request id / batch count following the header.
pub const REQUEST_ID_OFFSET: usize = HEADER_SIZE;

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    RequestBatch = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::RequestBatch),
            2 => Some(MessageType::Reply),
            3 => Some(MessageType::ValidateConnection),
            4 => Some(MessageType::CloseConnection),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "request",
            MessageType::RequestBatch => "batch request",
            MessageType::Reply => "reply",
            MessageType::ValidateConnection => "validate connection",
            MessageType::CloseConnection => "close connection",
        };
        write!(f, "{} ({})", *self as u8, name)
    }
}

/// Compression status byte.
///
/// 0: not compressed, sender cannot accept compressed replies.
/// 1: not compressed, sender accepts compressed replies.
/// 2: compressed (unsupported).
pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_SUPPORTED: u8 = 1;
pub const COMPRESSION_COMPRESSED: u8 = 2;

/// Reply status carried after the request id of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl ReplyStatus {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::UserException),
            2 => Ok(ReplyStatus::ObjectNotExist),
            3 => Ok(ReplyStatus::FacetNotExist),
            4 => Ok(ReplyStatus::OperationNotExist),
            5 => Ok(ReplyStatus::UnknownLocalException),
            6 => Ok(ReplyStatus::UnknownUserException),
            7 => Ok(ReplyStatus::UnknownException),
            other => Err(Error::UnknownReplyStatus { status: other }),
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::UserException => "user exception",
            ReplyStatus::ObjectNotExist => "object does not exist",
            ReplyStatus::FacetNotExist => "facet does not exist",
            ReplyStatus::OperationNotExist => "operation does not exist",
            ReplyStatus::UnknownLocalException => "unknown local exception",
            ReplyStatus::UnknownUserException => "unknown user exception",
            ReplyStatus::UnknownException => "unknown exception",
        };
        write!(f, "{} ({})", *self as u8, name)
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub protocol: ProtocolVersion,
    pub encoding: EncodingVersion,
    pub message_type: u8,
    pub compression: u8,
    pub size: i32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            protocol: CURRENT_PROTOCOL,
            encoding: CURRENT_PROTOCOL_ENCODING,
            message_type: message_type as u8,
            compression: COMPRESSION_NONE,
            size: HEADER_SIZE as i32,
        }
    }

    /// Append the header at the buffer cursor.
    pub fn encode(&self, buf: &mut Buffer) {
        buf.put_slice(&MAGIC);
        buf.put_u8(self.protocol.major);
        buf.put_u8(self.protocol.minor);
        buf.put_u8(self.encoding.major);
        buf.put_u8(self.encoding.minor);
        buf.put_u8(self.message_type);
        buf.put_u8(self.compression);
        buf.put_i32(self.size);
    }

    /// Read and validate a header at the buffer cursor.
    ///
    /// Checks magic, protocol and protocol encoding, compression status and
    /// the lower size bound. The message type is only checked when the
    /// message is parsed.
    pub fn decode(buf: &mut Buffer) -> Result<Self> {
        let magic = buf.get_slice(4).map_err(Error::from)?;
        if magic != MAGIC {
            let mut bad = [0u8; 4];
            bad.copy_from_slice(magic);
            return Err(Error::BadMagic { magic: bad });
        }

        let protocol = ProtocolVersion {
            major: buf.get_u8()?,
            minor: buf.get_u8()?,
        };
        check_supported_protocol(protocol)?;

        let encoding = EncodingVersion {
            major: buf.get_u8()?,
            minor: buf.get_u8()?,
        };
        check_supported_protocol_encoding(encoding)?;

        let message_type = buf.get_u8()?;
        let compression = buf.get_u8()?;
        if compression == COMPRESSION_COMPRESSED {
            return Err(Error::FeatureNotSupported {
                feature: "Cannot uncompress compressed message".into(),
            });
        }

        let size = buf.get_i32()?;
        if size < HEADER_SIZE as i32 {
            return Err(Error::IllegalMessageSize { size });
        }

        Ok(Self {
            protocol,
            encoding,
            message_type,
            compression,
            size,
        })
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.message_type)
    }
}

/// A complete header-only message (validate or close connection).
pub fn header_only_message(message_type: MessageType) -> Buffer {
    let mut buf = Buffer::new();
    MessageHeader::new(message_type).encode(&mut buf);
    buf
}
