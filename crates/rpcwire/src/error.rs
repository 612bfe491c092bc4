// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the wire layer.
//!
//! Every local failure is an [`Error`] variant. [`Error::kind`] groups the
//! variants into the families the retry policy and the connection state
//! machine reason about:
//!
//! ```text
//! Marshal             malformed bytes, size mismatch, bad tags, underflow
//! UnknownType         no factory for a class or exception type id
//! ConnectionLifecycle close, forced close, timeout, lost, destroyed
//! RequestFailed       object / facet / operation not found on the peer
//! InvocationControl   invocation timeout, cancellation
//! Other               everything else
//! ```
//!
//! Errors are `Clone`: a connection failure is handed to every invocation
//! pending on that connection.

use std::fmt;
use std::io;

use crate::buffer::BufferError;
use crate::identity::Identity;
use crate::protocol::{EncodingVersion, ProtocolVersion};

/// Target of a request that the peer could not dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFailed {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
}

impl fmt::Display for RequestFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identity: `{}'", self.identity)?;
        if !self.facet.is_empty() {
            write!(f, " facet: {}", self.facet)?;
        }
        write!(f, " operation: {}", self.operation)
    }
}

/// Error families, see the module documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Marshal,
    UnknownType,
    ConnectionLifecycle,
    RequestFailed,
    InvocationControl,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Marshal Errors
    // ========================================================================
    /// Generic protocol violation while encoding or decoding.
    Marshal { reason: String },
    /// A read ran past the end of the available bytes.
    UnmarshalOutOfBounds { reason: String },
    /// Encapsulation size or boundary mismatch.
    Encapsulation { reason: String },
    /// Message larger than the configured maximum.
    MemoryLimit { size: usize, max: usize },
    /// Message did not start with the protocol magic.
    BadMagic { magic: [u8; 4] },
    UnsupportedProtocol {
        bad: ProtocolVersion,
        supported: ProtocolVersion,
    },
    UnsupportedEncoding {
        bad: EncodingVersion,
        supported: EncodingVersion,
    },
    /// Header size field smaller than the header itself.
    IllegalMessageSize { size: i32 },
    /// Unrecognized message type.
    UnknownMessage { message_type: u8 },
    UnknownReplyStatus { status: u8 },
    /// Peer sent something other than a validate message during handshake.
    ConnectionNotValidated,
    /// Datagram payload truncated or larger than the transport allows.
    DatagramLimit,
    FeatureNotSupported { feature: String },

    // ========================================================================
    // Unknown Type Errors
    // ========================================================================
    /// No factory for a class instance and slicing was not possible.
    NoValueFactory { reason: String, type_id: String },
    /// No factory for any slice of a user exception.
    UnknownUserException { type_id: String },

    // ========================================================================
    // Connection Lifecycle Errors
    // ========================================================================
    /// Peer closed the connection gracefully; outstanding requests may be
    /// repeated safely.
    CloseConnection,
    /// Application closed the connection.
    ConnectionManuallyClosed { graceful: bool },
    /// ACM closed an idle connection.
    ConnectionTimeout,
    /// Peer did not acknowledge a graceful close in time.
    CloseTimeout,
    /// Transport reported end of stream or reset.
    ConnectionLost { reason: String },
    /// Other transport failure.
    Socket { kind: io::ErrorKind, reason: String },
    /// Could not establish a connection to any endpoint.
    ConnectFailed { reason: String },
    ObjectAdapterDeactivated { name: String },
    CommunicatorDestroyed,

    // ========================================================================
    // Request Failed Errors
    // ========================================================================
    ObjectNotExist(RequestFailed),
    FacetNotExist(RequestFailed),
    OperationNotExist(RequestFailed),

    // ========================================================================
    // Invocation Control Errors
    // ========================================================================
    InvocationTimeout,
    InvocationCanceled,

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Connection already failed; the request must be retried on a new one.
    Retry(Box<Error>),
    /// Operation not applicable to a reference bound to a fixed connection.
    FixedProxy,
    /// Reference resolved to no usable endpoint.
    NoEndpoint { proxy: String },
    /// Twoway invocation attempted on a oneway-only reference.
    TwowayOnly { operation: String },
    /// Peer reported a local exception it could not marshal.
    UnknownLocal { unknown: String },
    /// Peer reported a user exception not declared by the operation.
    UnknownUser { unknown: String },
    /// Peer reported a non-protocol failure.
    Unknown { unknown: String },
    /// Factory or compact id registered twice.
    AlreadyRegistered { kind: &'static str, id: String },
    /// Invalid argument passed to an API.
    IllegalArgument { reason: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Marshal { .. }
            | Error::UnmarshalOutOfBounds { .. }
            | Error::Encapsulation { .. }
            | Error::MemoryLimit { .. }
            | Error::BadMagic { .. }
            | Error::UnsupportedProtocol { .. }
            | Error::UnsupportedEncoding { .. }
            | Error::IllegalMessageSize { .. }
            | Error::UnknownMessage { .. }
            | Error::UnknownReplyStatus { .. }
            | Error::ConnectionNotValidated
            | Error::DatagramLimit
            | Error::FeatureNotSupported { .. } => ErrorKind::Marshal,

            Error::NoValueFactory { .. } | Error::UnknownUserException { .. } => {
                ErrorKind::UnknownType
            }

            Error::CloseConnection
            | Error::ConnectionManuallyClosed { .. }
            | Error::ConnectionTimeout
            | Error::CloseTimeout
            | Error::ConnectionLost { .. }
            | Error::Socket { .. }
            | Error::ConnectFailed { .. }
            | Error::ObjectAdapterDeactivated { .. }
            | Error::CommunicatorDestroyed => ErrorKind::ConnectionLifecycle,

            Error::ObjectNotExist(_) | Error::FacetNotExist(_) | Error::OperationNotExist(_) => {
                ErrorKind::RequestFailed
            }

            Error::InvocationTimeout | Error::InvocationCanceled => ErrorKind::InvocationControl,

            Error::Retry(_)
            | Error::FixedProxy
            | Error::NoEndpoint { .. }
            | Error::TwowayOnly { .. }
            | Error::UnknownLocal { .. }
            | Error::UnknownUser { .. }
            | Error::Unknown { .. }
            | Error::AlreadyRegistered { .. }
            | Error::IllegalArgument { .. } => ErrorKind::Other,
        }
    }

    /// True for failures caused by the transport socket itself.
    pub fn is_socket(&self) -> bool {
        matches!(self, Error::ConnectionLost { .. } | Error::Socket { .. })
    }

    pub(crate) fn marshal(reason: impl Into<String>) -> Self {
        Error::Marshal {
            reason: reason.into(),
        }
    }

    pub(crate) fn encapsulation(reason: impl Into<String>) -> Self {
        Error::Encapsulation {
            reason: reason.into(),
        }
    }

    pub(crate) fn no_value_factory(reason: impl Into<String>, type_id: impl Into<String>) -> Self {
        Error::NoValueFactory {
            reason: reason.into(),
            type_id: type_id.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Marshal { reason } => write!(f, "protocol error: {}", reason),
            Error::UnmarshalOutOfBounds { reason } => {
                write!(f, "unmarshal out of bounds: {}", reason)
            }
            Error::Encapsulation { reason } => write!(f, "encapsulation error: {}", reason),
            Error::MemoryLimit { size, max } => {
                write!(f, "message size {} exceeds maximum {}", size, max)
            }
            Error::BadMagic { magic } => write!(f, "unknown magic number: {:02x?}", magic),
            Error::UnsupportedProtocol { bad, supported } => write!(
                f,
                "protocol version {} is not supported (supported: {})",
                bad, supported
            ),
            Error::UnsupportedEncoding { bad, supported } => write!(
                f,
                "encoding version {} is not supported (supported: {})",
                bad, supported
            ),
            Error::IllegalMessageSize { size } => write!(f, "illegal message size {}", size),
            Error::UnknownMessage { message_type } => {
                write!(f, "unknown message type {}", message_type)
            }
            Error::UnknownReplyStatus { status } => write!(f, "unknown reply status {}", status),
            Error::ConnectionNotValidated => write!(f, "connection not validated"),
            Error::DatagramLimit => write!(f, "datagram limit exceeded"),
            Error::FeatureNotSupported { feature } => {
                write!(f, "feature not supported: {}", feature)
            }
            Error::NoValueFactory { reason, type_id } => {
                write!(f, "no value factory for `{}': {}", type_id, reason)
            }
            Error::UnknownUserException { type_id } => {
                write!(f, "unknown user exception `{}'", type_id)
            }
            Error::CloseConnection => write!(f, "connection closed by peer"),
            Error::ConnectionManuallyClosed { graceful } => {
                if *graceful {
                    write!(f, "connection closed gracefully by the application")
                } else {
                    write!(f, "connection closed forcefully by the application")
                }
            }
            Error::ConnectionTimeout => write!(f, "connection timed out"),
            Error::CloseTimeout => write!(f, "timeout while closing connection"),
            Error::ConnectionLost { reason } => write!(f, "connection lost: {}", reason),
            Error::Socket { kind, reason } => write!(f, "socket error ({:?}): {}", kind, reason),
            Error::ConnectFailed { reason } => write!(f, "connect failed: {}", reason),
            Error::ObjectAdapterDeactivated { name } => {
                write!(f, "object adapter `{}' deactivated", name)
            }
            Error::CommunicatorDestroyed => write!(f, "communicator destroyed"),
            Error::ObjectNotExist(r) => write!(f, "object does not exist: {}", r),
            Error::FacetNotExist(r) => write!(f, "facet does not exist: {}", r),
            Error::OperationNotExist(r) => write!(f, "operation does not exist: {}", r),
            Error::InvocationTimeout => write!(f, "invocation timed out"),
            Error::InvocationCanceled => write!(f, "invocation canceled"),
            Error::Retry(inner) => write!(f, "retry: {}", inner),
            Error::FixedProxy => write!(f, "operation not supported on a fixed reference"),
            Error::NoEndpoint { proxy } => write!(f, "no suitable endpoint for `{}'", proxy),
            Error::TwowayOnly { operation } => {
                write!(f, "operation `{}' requires a twoway reference", operation)
            }
            Error::UnknownLocal { unknown } => write!(f, "unknown local exception: {}", unknown),
            Error::UnknownUser { unknown } => write!(f, "unknown user exception: {}", unknown),
            Error::Unknown { unknown } => write!(f, "unknown exception: {}", unknown),
            Error::AlreadyRegistered { kind, id } => {
                write!(f, "{} `{}' is already registered", kind, id)
            }
            Error::IllegalArgument { reason } => write!(f, "illegal argument: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Retry(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<BufferError> for Error {
    fn from(err: BufferError) -> Self {
        Error::UnmarshalOutOfBounds {
            reason: err.to_string(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::ConnectionLost {
                reason: err.to_string(),
            },
            kind => Error::Socket {
                kind,
                reason: err.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::marshal("x").kind(), ErrorKind::Marshal);
        assert_eq!(Error::DatagramLimit.kind(), ErrorKind::Marshal);
        assert_eq!(
            Error::no_value_factory("r", "::A").kind(),
            ErrorKind::UnknownType
        );
        assert_eq!(Error::CloseConnection.kind(), ErrorKind::ConnectionLifecycle);
        assert_eq!(
            Error::ObjectNotExist(RequestFailed::default()).kind(),
            ErrorKind::RequestFailed
        );
        assert_eq!(Error::InvocationTimeout.kind(), ErrorKind::InvocationControl);
        assert_eq!(Error::FixedProxy.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_io_error_mapping() {
        let lost: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(lost, Error::ConnectionLost { .. }));
        assert!(lost.is_socket());

        let other: Error = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(
            other,
            Error::Socket {
                kind: io::ErrorKind::PermissionDenied,
                ..
            }
        ));
    }

    #[test]
    fn test_display() {
        let err = Error::ObjectNotExist(RequestFailed {
            identity: Identity::with_category("hello", "demo"),
            facet: String::new(),
            operation: "sayHello".into(),
        });
        assert_eq!(
            err.to_string(),
            "object does not exist: identity: `demo/hello' operation: sayHello"
        );
        let retry = Error::Retry(Box::new(Error::CloseConnection));
        assert_eq!(retry.to_string(), "retry: connection closed by peer");
        assert!(std::error::Error::source(&retry).is_some());
    }

    #[test]
    fn test_buffer_error_maps_to_out_of_bounds() {
        let err: Error = BufferError::Underflow {
            offset: 3,
            needed: 4,
        }
        .into();
        assert!(matches!(err, Error::UnmarshalOutOfBounds { .. }));
    }
}
