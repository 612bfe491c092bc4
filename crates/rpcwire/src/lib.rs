// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rpcwire - Object RPC wire layer
//!
//! The core of an object-oriented RPC middleware: the encapsulation codec,
//! the connection state machine with active connection management, object
//! references and the outgoing invocation pipeline with its retry policy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rpcwire::{
//!     Config, Endpoint, Engine, Identity, IncomingRequest, MemoryConnectionFactory,
//!     OperationMode, Reference, Responder, Result,
//! };
//!
//! # async fn run() -> Result<()> {
//! let config = Arc::new(Config::default());
//! let factory = MemoryConnectionFactory::new(config.clone())?;
//! factory.add_server(
//!     "hello",
//!     Arc::new(|request: IncomingRequest, responder: Responder| {
//!         responder.ok(&request.params)
//!     }),
//! )?;
//!
//! let engine = Engine::new(config.clone(), factory);
//! let proxy = engine.proxy(Reference::direct(
//!     Identity::new("greeter"),
//!     vec![Endpoint::stream("hello")],
//!     &config,
//! ));
//! let reply = proxy
//!     .invoke("sayHello", OperationMode::Normal, &[6, 0, 0, 0, 1, 1], None)
//!     .await?;
//! assert!(reply.ok);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                         Invocation Layer                            |
//! |   Engine -> Proxy -> OutgoingAsync (attempts, retry, timeout)      |
//! +---------------------------------------------------------------------+
//! |                         Reference Layer                             |
//! |   Fixed | Routable (router, endpoints, locator) | ConnectionFactory |
//! +---------------------------------------------------------------------+
//! |                         Connection Layer                            |
//! |   State machine | ACM | batch queue | dispatch | request ids       |
//! +---------------------------------------------------------------------+
//! |                         Codec Layer                                 |
//! |   Buffer | message header | encapsulations 1.0/1.1 | slicing       |
//! +---------------------------------------------------------------------+
//! |                         Transport Seam                              |
//! |   Transceiver trait | in-memory stream/datagram | readiness poller |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`stream`] - encapsulation codec (start here for marshaling)
//! - [`connection`] - connection state machine and active connection management
//! - [`reference`] - references, endpoints, locator and router collaborators
//! - [`invocation`] - proxies and the retry pipeline

/// Growable byte buffer with a cursor and bounds-checked access.
pub mod buffer;
/// Runtime configuration and the YAML loader.
pub mod config;
/// Connection state machine, ACM, batching and incoming dispatch.
pub mod connection;
/// Error taxonomy.
pub mod error;
/// Object identities, request contexts and operation modes.
pub mod identity;
/// Proxies, outgoing invocations and the retry policy.
pub mod invocation;
/// Message header, versions and reply status.
pub mod protocol;
/// References, endpoints and connection establishment.
pub mod reference;
/// Encapsulation codec: primitives, sequences, optionals, classes, exceptions.
pub mod stream;
/// Diagnostics helpers gated by trace levels.
pub mod trace;
/// Transport seam and in-memory transceivers.
pub mod transceiver;

pub use buffer::{Buffer, BufferError};
pub use config::{AcmClose, AcmConfig, AcmHeartbeat, Config, EndpointSelection, TraceLevels};
pub use connection::{
    AcmMonitor, AsyncRequest, CloseMode, Connection, Dispatcher, IncomingRequest, Responder,
    Role, State,
};
pub use error::{Error, ErrorKind, RequestFailed, Result};
pub use identity::{Context, Identity, OperationMode};
pub use invocation::{Engine, InvocationResult, InvocationState, OutgoingAsync, Proxy};
pub use protocol::{EncodingVersion, ProtocolVersion, ReplyStatus};
pub use reference::{
    ConnectionFactory, Endpoint, InvocationMode, Locator, LocatorInfo, MemoryConnectionFactory,
    Reference, Router, RouterInfo,
};
pub use stream::{FormatType, InputStream, OutputStream, TypeRegistry, UserException, Value};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
