// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batch request queue.
//!
//! Batched oneway requests accumulate in a single batch message:
//!
//! ```text
//! header (type 1) | count:i32 | body | body | ...
//! ```
//!
//! The count is patched when the batch is taken for sending.

use crate::buffer::Buffer;
use crate::protocol::{header_only_message, MessageType, REQUEST_HEADER_SIZE, REQUEST_ID_OFFSET};

pub(crate) struct BatchRequestQueue {
    buf: Buffer,
    count: i32,
    auto_flush_size: usize,
}

impl BatchRequestQueue {
    pub(crate) fn new(auto_flush_size: usize) -> Self {
        Self {
            buf: empty_batch(),
            count: 0,
            auto_flush_size,
        }
    }

    /// Append one request body. When adding it would push the batch past
    /// the auto flush size, the current batch is returned for sending first.
    pub(crate) fn enqueue(&mut self, body: &[u8]) -> Option<(Buffer, i32)> {
        let flushed = if self.count > 0
            && self.auto_flush_size > 0
            && self.buf.limit() + body.len() > self.auto_flush_size
        {
            self.take()
        } else {
            None
        };
        self.buf.put_slice(body);
        self.count += 1;
        flushed
    }

    /// Take the accumulated batch with its count patched in.
    pub(crate) fn take(&mut self) -> Option<(Buffer, i32)> {
        if self.count == 0 {
            return None;
        }
        let mut batch = std::mem::replace(&mut self.buf, empty_batch());
        let count = std::mem::take(&mut self.count);
        // The placeholder lies within the header written by empty_batch.
        if batch.put_i32_at(REQUEST_ID_OFFSET, count).is_err() {
            return None;
        }
        Some((batch, count))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.count as usize
    }

    /// Drop every queued request.
    pub(crate) fn clear(&mut self) {
        if self.count > 0 {
            log::debug!("[Protocol] discarding {} batched requests", self.count);
        }
        self.buf = empty_batch();
        self.count = 0;
    }
}

fn empty_batch() -> Buffer {
    let mut buf = header_only_message(MessageType::RequestBatch);
    buf.put_i32(0);
    debug_assert_eq!(buf.limit(), REQUEST_HEADER_SIZE);
    buf
}
