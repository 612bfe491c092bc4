// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process transceivers.
//!
//! [`stream_pair`] returns two connected byte streams; [`datagram_pair`]
//! two connected packet endpoints. Writing wakes the peer's readiness
//! callback. A write chunk limit on a stream forces partial writes.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ReadyCallback, SocketOperation, Transceiver};
use crate::buffer::Buffer;
use crate::error::{Error, Result};

struct Pipe<T> {
    data: VecDeque<T>,
    closed: bool,
    reader: Option<ReadyCallback>,
}

impl<T> Pipe<T> {
    fn shared() -> Arc<Mutex<Pipe<T>>> {
        Arc::new(Mutex::new(Pipe {
            data: VecDeque::new(),
            closed: false,
            reader: None,
        }))
    }
}

fn close_pipes<T>(inbound: &Mutex<Pipe<T>>, outbound: &Mutex<Pipe<T>>) {
    {
        let mut pipe = inbound.lock();
        pipe.closed = true;
        pipe.reader = None;
    }
    let peer = {
        let mut pipe = outbound.lock();
        pipe.closed = true;
        pipe.reader.clone()
    };
    if let Some(wake) = peer {
        wake();
    }
}

fn lost(reason: &str) -> Error {
    Error::ConnectionLost {
        reason: reason.to_string(),
    }
}

// ============================================================================
// Stream
// ============================================================================

pub struct MemoryStream {
    local: String,
    remote: String,
    inbound: Arc<Mutex<Pipe<u8>>>,
    outbound: Arc<Mutex<Pipe<u8>>>,
    write_chunk: Option<usize>,
    waker: Option<ReadyCallback>,
    closed: bool,
}

/// Two connected streams: `(client, server)`.
pub fn stream_pair(name: &str) -> (MemoryStream, MemoryStream) {
    let a_to_b = Pipe::shared();
    let b_to_a = Pipe::shared();
    let client = MemoryStream {
        local: format!("{}:client", name),
        remote: format!("{}:server", name),
        inbound: b_to_a.clone(),
        outbound: a_to_b.clone(),
        write_chunk: None,
        waker: None,
        closed: false,
    };
    let server = MemoryStream {
        local: format!("{}:server", name),
        remote: format!("{}:client", name),
        inbound: a_to_b,
        outbound: b_to_a,
        write_chunk: None,
        waker: None,
        closed: false,
    };
    (client, server)
}

impl MemoryStream {
    /// Accept at most `n` bytes per write call.
    pub fn with_write_chunk(mut self, n: usize) -> Self {
        self.write_chunk = Some(n.max(1));
        self
    }
}

impl Transceiver for MemoryStream {
    fn initialize(&mut self) -> Result<SocketOperation> {
        Ok(SocketOperation::NONE)
    }

    fn closing(&mut self, initiator: bool) -> SocketOperation {
        if initiator {
            SocketOperation::READ
        } else {
            SocketOperation::NONE
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.waker = None;
        close_pipes(&self.inbound, &self.outbound);
    }

    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        if self.closed {
            return Err(lost("transceiver closed"));
        }
        let peer = {
            let mut out = self.outbound.lock();
            if out.closed {
                return Err(lost("connection reset by peer"));
            }
            let n = buf.remaining().min(self.write_chunk.unwrap_or(usize::MAX));
            out.data.extend(&buf.unread()[..n]);
            buf.advance(n)?;
            out.reader.clone()
        };
        if let Some(wake) = peer {
            wake();
        }
        if buf.has_remaining() {
            // Always writable again right away.
            if let Some(wake) = &self.waker {
                wake();
            }
            return Ok(SocketOperation::WRITE);
        }
        Ok(SocketOperation::NONE)
    }

    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        if self.closed {
            return Err(lost("transceiver closed"));
        }
        if !buf.has_remaining() {
            return Ok(SocketOperation::NONE);
        }
        let mut inbound = self.inbound.lock();
        if inbound.data.is_empty() {
            if inbound.closed {
                return Err(lost("end of stream"));
            }
            return Ok(SocketOperation::READ);
        }
        let n = buf.remaining().min(inbound.data.len());
        for (dst, src) in buf.unfilled_mut().iter_mut().zip(inbound.data.drain(..n)) {
            *dst = src;
        }
        buf.advance(n)?;
        if buf.has_remaining() {
            Ok(SocketOperation::READ)
        } else {
            Ok(SocketOperation::NONE)
        }
    }

    fn protocol(&self) -> &str {
        "mem"
    }

    fn description(&self) -> String {
        format!("local = {}\nremote = {}", self.local, self.remote)
    }

    fn register(&mut self, cb: ReadyCallback) {
        self.inbound.lock().reader = Some(cb.clone());
        self.waker = Some(cb);
    }

    fn unregister(&mut self) {
        self.inbound.lock().reader = None;
        self.waker = None;
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Datagram
// ============================================================================

pub struct MemoryDatagram {
    local: String,
    remote: String,
    inbound: Arc<Mutex<Pipe<Vec<u8>>>>,
    outbound: Arc<Mutex<Pipe<Vec<u8>>>>,
    closed: bool,
}

/// Two connected packet endpoints: `(client, server)`.
pub fn datagram_pair(name: &str) -> (MemoryDatagram, MemoryDatagram) {
    let a_to_b = Pipe::shared();
    let b_to_a = Pipe::shared();
    let client = MemoryDatagram {
        local: format!("{}:client", name),
        remote: format!("{}:server", name),
        inbound: b_to_a.clone(),
        outbound: a_to_b.clone(),
        closed: false,
    };
    let server = MemoryDatagram {
        local: format!("{}:server", name),
        remote: format!("{}:client", name),
        inbound: a_to_b,
        outbound: b_to_a,
        closed: false,
    };
    (client, server)
}

impl MemoryDatagram {
    /// Inject a raw packet as if the peer had sent it.
    pub fn inject(&self, packet: Vec<u8>) {
        let reader = {
            let mut inbound = self.inbound.lock();
            inbound.data.push_back(packet);
            inbound.reader.clone()
        };
        if let Some(wake) = reader {
            wake();
        }
    }
}

impl Transceiver for MemoryDatagram {
    fn initialize(&mut self) -> Result<SocketOperation> {
        Ok(SocketOperation::NONE)
    }

    fn closing(&mut self, _initiator: bool) -> SocketOperation {
        SocketOperation::NONE
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        close_pipes(&self.inbound, &self.outbound);
    }

    fn write(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        if self.closed {
            return Err(lost("transceiver closed"));
        }
        let peer = {
            let mut out = self.outbound.lock();
            let packet = buf.unread().to_vec();
            // Packets to a closed peer are silently lost.
            if !out.closed {
                out.data.push_back(packet);
            }
            out.reader.clone()
        };
        let n = buf.remaining();
        buf.advance(n)?;
        if let Some(wake) = peer {
            wake();
        }
        Ok(SocketOperation::NONE)
    }

    fn read(&mut self, buf: &mut Buffer) -> Result<SocketOperation> {
        if self.closed {
            return Err(lost("transceiver closed"));
        }
        let packet = {
            let mut inbound = self.inbound.lock();
            match inbound.data.pop_front() {
                Some(packet) => packet,
                None if inbound.closed => return Err(lost("end of stream")),
                None => return Ok(SocketOperation::READ),
            }
        };
        buf.set_position(0);
        buf.resize(packet.len());
        buf.put_slice_at(0, &packet)?;
        buf.set_position(packet.len());
        Ok(SocketOperation::NONE)
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn protocol(&self) -> &str {
        "mem-udp"
    }

    fn description(&self) -> String {
        format!("local = {}\nremote = {}", self.local, self.remote)
    }

    fn register(&mut self, cb: ReadyCallback) {
        self.inbound.lock().reader = Some(cb);
    }

    fn unregister(&mut self) {
        self.inbound.lock().reader = None;
    }
}

impl Drop for MemoryDatagram {
    fn drop(&mut self) {
        self.close();
    }
}
