// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol constants: versions, message header, reply status.
//!
//! # Message Layouts
//!
//! ```text
//! request:        header | requestId:i32 | request body
//! batch request:  header | count:i32     | count x request body
//! reply:          header | requestId:i32 | status:u8 | status payload
//! validate:       header
//! close:          header
//!
//! request body:   identity | facet:seq<string> | operation:string
//!                 | mode:u8 | context:dict<string,string> | encapsulation
//! ```

pub mod header;
pub mod version;

pub use header::{
    header_only_message, MessageHeader, MessageType, ReplyStatus, COMPRESSION_COMPRESSED,
    COMPRESSION_NONE, COMPRESSION_SUPPORTED, HEADER_SIZE, MAGIC, REQUEST_ID_OFFSET, SIZE_OFFSET,
};
pub use version::{
    check_supported_encoding, check_supported_protocol, check_supported_protocol_encoding,
    EncodingVersion, ProtocolVersion, CURRENT_ENCODING, CURRENT_PROTOCOL,
    CURRENT_PROTOCOL_ENCODING, ENCODING_1_0, ENCODING_1_1, PROTOCOL_1_0,
};

/// Size of a request header: message header plus the request id.
pub const REQUEST_HEADER_SIZE: usize = HEADER_SIZE + 4;
