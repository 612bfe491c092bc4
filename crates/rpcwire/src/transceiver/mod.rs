// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport boundary.
//!
//! A [`Transceiver`] moves bytes for one connection without blocking: every
//! operation either completes or reports the [`SocketOperation`] it waits
//! for. Readiness is signalled through a [`ReadyCallback`] installed by the
//! connection; the [`ReadinessPoller`] turns those signals into calls to
//! `Connection::poll_ready` on a dedicated thread.

pub mod memory;
pub mod poller;

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::error::Result;

pub use memory::{datagram_pair, stream_pair, MemoryDatagram, MemoryStream};
pub use poller::ReadinessPoller;

/// Operation a transceiver waits for before it can make progress.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SocketOperation(u8);

impl SocketOperation {
    pub const NONE: SocketOperation = SocketOperation(0);
    pub const READ: SocketOperation = SocketOperation(1);
    pub const WRITE: SocketOperation = SocketOperation(2);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: SocketOperation) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for SocketOperation {
    type Output = SocketOperation;

    fn bitor(self, rhs: SocketOperation) -> SocketOperation {
        SocketOperation(self.0 | rhs.0)
    }
}

impl fmt::Debug for SocketOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "NONE"),
            1 => write!(f, "READ"),
            2 => write!(f, "WRITE"),
            _ => write!(f, "READ|WRITE"),
        }
    }
}

/// Invoked by a transceiver when it may be able to make progress.
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

pub trait Transceiver: Send {
    /// Finish establishing the transport. `NONE` means ready.
    fn initialize(&mut self) -> Result<SocketOperation>;

    /// Prepare for closure. The initiator waits for the peer to close the
    /// transport (`READ`); the other side closes at once (`NONE`).
    fn closing(&mut self, initiator: bool) -> SocketOperation;

    fn close(&mut self);

    /// Write `buf[position..limit]`, advancing the position. Returns
    /// `WRITE` when bytes remain.
    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOperation>;

    /// Fill `buf[position..limit]`, advancing the position. Returns `READ`
    /// when the buffer is not full yet. Datagram transceivers resize `buf`
    /// to the packet and leave the position at its end.
    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOperation>;

    fn is_datagram(&self) -> bool {
        false
    }

    /// Transport name, e.g. `mem`.
    fn protocol(&self) -> &str;

    /// Human readable local/remote description for traces.
    fn description(&self) -> String;

    /// Install (or replace) the readiness callback.
    fn register(&mut self, cb: ReadyCallback);

    /// Drop the readiness callback.
    fn unregister(&mut self);
}
