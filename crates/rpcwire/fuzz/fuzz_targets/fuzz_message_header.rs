// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use libfuzzer_sys::fuzz_target;
use rpcwire::protocol::{MessageHeader, ReplyStatus};
use rpcwire::trace::describe_message;
use rpcwire::Buffer;

fuzz_target!(|data: &[u8]| {
    // Fuzz header validation
    let mut buf = Buffer::from_vec(data.to_vec());
    if let Ok(header) = MessageHeader::decode(&mut buf) {
        let _ = header.kind();
    }

    // Fuzz the protocol trace summary
    let _ = describe_message(data);

    if let Some(status) = data.get(18) {
        let _ = ReplyStatus::from_u8(*status);
    }
});
