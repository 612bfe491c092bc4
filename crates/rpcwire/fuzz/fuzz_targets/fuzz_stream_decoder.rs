// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fuzz target for the encapsulation decoder
//!
//! Feeds arbitrary bytes to InputStream under both encodings. None of these
//! operations should panic on any input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rpcwire::protocol::{ENCODING_1_0, ENCODING_1_1};
use rpcwire::stream::{InputStream, ValueSlot};

fuzz_target!(|data: &[u8]| {
    for encoding in [ENCODING_1_0, ENCODING_1_1] {
        // ----------------------------------------------------------------
        // 1. Primitives, sizes and strings - must not panic
        // ----------------------------------------------------------------
        {
            let mut is = InputStream::new(encoding, data.to_vec());
            let _ = is.read_size();
            let _ = is.read_string();
            let _ = is.read_string_seq();
            let _ = is.read_i32_seq();
            let _ = is.read_identity();
            let _ = is.read_context();
        }

        // ----------------------------------------------------------------
        // 2. Encapsulation framing and tagged members - must not panic
        // ----------------------------------------------------------------
        {
            let mut is = InputStream::new(encoding, data.to_vec());
            let _ = is.read_encapsulation();
        }
        {
            let mut is = InputStream::new(encoding, data.to_vec());
            if is.start_encapsulation().is_ok() {
                let _ = is.read_optional_i32(1);
                let _ = is.read_optional_string(5);
                let _ = is.skip_optionals();
                let _ = is.end_encapsulation();
            }
        }

        // ----------------------------------------------------------------
        // 3. Class graphs (unknown types are sliced) - must not panic
        // ----------------------------------------------------------------
        {
            let mut is = InputStream::new(encoding, data.to_vec()).with_class_graph_depth_max(16);
            if is.start_encapsulation().is_ok() {
                let slot = ValueSlot::new(None);
                if is.read_value_into(&slot).is_ok() {
                    let _ = is.read_pending_values();
                }
                let _ = is.end_encapsulation();
            }
        }

        // ----------------------------------------------------------------
        // 4. User exceptions - must not panic
        // ----------------------------------------------------------------
        {
            let mut is = InputStream::new(encoding, data.to_vec());
            if is.start_encapsulation().is_ok() {
                let _ = is.read_exception();
            }
        }
    }
});
