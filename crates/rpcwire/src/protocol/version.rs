// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol and encoding versions.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Version of the message protocol carried in every message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// Version of the encapsulation encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
pub const ENCODING_1_0: EncodingVersion = EncodingVersion { major: 1, minor: 0 };
pub const ENCODING_1_1: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

/// Highest protocol version this crate speaks.
pub const CURRENT_PROTOCOL: ProtocolVersion = PROTOCOL_1_0;
/// Encoding used for message headers and request/reply bodies.
pub const CURRENT_PROTOCOL_ENCODING: EncodingVersion = ENCODING_1_0;
/// Highest encapsulation encoding this crate reads and writes.
pub const CURRENT_ENCODING: EncodingVersion = ENCODING_1_1;

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl EncodingVersion {
    pub fn is_1_0(self) -> bool {
        self == ENCODING_1_0
    }
}

fn parse_major_minor(s: &str) -> Option<(u8, u8)> {
    let (major, minor) = s.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

impl FromStr for EncodingVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_major_minor(s)
            .map(|(major, minor)| EncodingVersion { major, minor })
            .ok_or_else(|| Error::Marshal {
                reason: format!("invalid encoding version `{}`", s),
            })
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_major_minor(s)
            .map(|(major, minor)| ProtocolVersion { major, minor })
            .ok_or_else(|| Error::Marshal {
                reason: format!("invalid protocol version `{}`", s),
            })
    }
}

pub fn check_supported_protocol(v: ProtocolVersion) -> Result<()> {
    if v.major != CURRENT_PROTOCOL.major || v.minor > CURRENT_PROTOCOL.minor {
        return Err(Error::UnsupportedProtocol {
            bad: v,
            supported: CURRENT_PROTOCOL,
        });
    }
    Ok(())
}

pub fn check_supported_protocol_encoding(v: EncodingVersion) -> Result<()> {
    if v.major != CURRENT_PROTOCOL_ENCODING.major || v.minor > CURRENT_PROTOCOL_ENCODING.minor {
        return Err(Error::UnsupportedEncoding {
            bad: v,
            supported: CURRENT_PROTOCOL_ENCODING,
        });
    }
    Ok(())
}

pub fn check_supported_encoding(v: EncodingVersion) -> Result<()> {
    if v.major != CURRENT_ENCODING.major || v.minor > CURRENT_ENCODING.minor {
        return Err(Error::UnsupportedEncoding {
            bad: v,
            supported: CURRENT_ENCODING,
        });
    }
    Ok(())
}
