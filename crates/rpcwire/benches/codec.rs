// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::cast_precision_loss)] // Stats/metrics need this
#![allow(clippy::cast_sign_loss)] // Test data conversions
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::cast_possible_wrap)] // Test conversions
#![allow(clippy::unreadable_literal)] // Large test constants
#![allow(clippy::doc_markdown)] // Test documentation
#![allow(clippy::missing_panics_doc)] // Tests/examples panic on failure
#![allow(clippy::semicolon_if_nothing_returned)] // Benchmark code formatting
#![allow(clippy::redundant_closure_for_method_calls)] // Test code clarity

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rpcwire::protocol::{ENCODING_1_0, ENCODING_1_1};
use rpcwire::{Context, Identity, InputStream, OperationMode, OutputStream};

fn request_body(params: &[u8]) -> Vec<u8> {
    let mut ctx = Context::new();
    ctx.insert("trace-id".into(), "4bf92f3577b34da6".into());
    let mut os = OutputStream::for_protocol();
    os.write_identity(&Identity::with_category("inventory", "shop"));
    os.write_string_seq::<&str>(&[]);
    os.write_string("lookup");
    os.write_u8(OperationMode::Idempotent as u8);
    os.write_context(&ctx);
    os.write_encapsulation(params).unwrap();
    os.into_bytes()
}

fn params_encaps() -> Vec<u8> {
    let mut os = OutputStream::new(ENCODING_1_1);
    os.start_encapsulation();
    os.write_string("sku-000123");
    os.write_i32(42);
    os.end_encapsulation().unwrap();
    os.into_bytes()
}

// ============================================================================
// Request Body Benchmarks
// ============================================================================

/// Benchmark: marshal a request body (identity, facet, operation, mode,
/// context, parameter encapsulation)
fn bench_request_body_encode(c: &mut Criterion) {
    let params = params_encaps();
    c.bench_function("request_body_encode", |b| {
        b.iter(|| black_box(request_body(black_box(&params))))
    });
}

/// Benchmark: unmarshal a request body
fn bench_request_body_decode(c: &mut Criterion) {
    let body = request_body(&params_encaps());
    c.bench_function("request_body_decode", |b| {
        b.iter_batched(
            || InputStream::new(ENCODING_1_0, body.clone()),
            |mut is| {
                let identity = is.read_identity().unwrap();
                let facet = is.read_string_seq().unwrap();
                let operation = is.read_string().unwrap();
                let mode = is.read_u8().unwrap();
                let ctx = is.read_context().unwrap();
                let (params, _) = is.read_encapsulation().unwrap();
                black_box((identity, facet, operation, mode, ctx, params))
            },
            BatchSize::SmallInput,
        )
    });
}

// ============================================================================
// Sequence Benchmarks
// ============================================================================

/// Benchmark: 1024-element i32 sequence, encode
fn bench_i32_seq_encode(c: &mut Criterion) {
    let data: Vec<i32> = (0..1024).collect();
    c.bench_function("i32_seq_encode_1024", |b| {
        b.iter(|| {
            let mut os = OutputStream::new(ENCODING_1_1);
            os.write_i32_seq(black_box(&data));
            black_box(os.into_bytes())
        })
    });
}

/// Benchmark: 1024-element i32 sequence, decode
fn bench_i32_seq_decode(c: &mut Criterion) {
    let data: Vec<i32> = (0..1024).collect();
    let mut os = OutputStream::new(ENCODING_1_1);
    os.write_i32_seq(&data);
    let bytes = os.into_bytes();
    c.bench_function("i32_seq_decode_1024", |b| {
        b.iter_batched(
            || InputStream::new(ENCODING_1_1, bytes.clone()),
            |mut is| black_box(is.read_i32_seq().unwrap()),
            BatchSize::SmallInput,
        )
    });
}

/// Benchmark: 64 short strings, encode then decode
fn bench_string_seq_roundtrip(c: &mut Criterion) {
    let data: Vec<String> = (0..64).map(|i| format!("item-{}", i)).collect();
    c.bench_function("string_seq_roundtrip_64", |b| {
        b.iter(|| {
            let mut os = OutputStream::new(ENCODING_1_1);
            os.write_string_seq(black_box(&data));
            let mut is = InputStream::new(ENCODING_1_1, os.into_bytes());
            black_box(is.read_string_seq().unwrap())
        })
    });
}

// ============================================================================
// Tagged Member Benchmarks
// ============================================================================

fn tagged_encaps() -> Vec<u8> {
    let mut os = OutputStream::new(ENCODING_1_1);
    os.start_encapsulation();
    os.write_i32(7);
    os.write_optional_i32(1, Some(10));
    os.write_optional_string(2, Some("discount"));
    os.write_optional_i64(5, Some(1_700_000_000));
    os.write_optional_i32_seq(9, Some(&[1, 2, 3, 4]));
    os.end_encapsulation().unwrap();
    os.into_bytes()
}

/// Benchmark: encapsulation with four tagged members
fn bench_tagged_encode(c: &mut Criterion) {
    c.bench_function("tagged_encaps_encode", |b| b.iter(|| black_box(tagged_encaps())));
}

/// Benchmark: read the last tagged member only, skipping the others
fn bench_tagged_skip(c: &mut Criterion) {
    let bytes = tagged_encaps();
    c.bench_function("tagged_encaps_skip_to_last", |b| {
        b.iter_batched(
            || InputStream::new(ENCODING_1_1, bytes.clone()),
            |mut is| {
                is.start_encapsulation().unwrap();
                let required = is.read_i32().unwrap();
                let last = is.read_optional_i32_seq(9).unwrap();
                is.end_encapsulation().unwrap();
                black_box((required, last))
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    request_benches,
    bench_request_body_encode,
    bench_request_body_decode
);
criterion_group!(
    sequence_benches,
    bench_i32_seq_encode,
    bench_i32_seq_decode,
    bench_string_seq_roundtrip
);
criterion_group!(tagged_benches, bench_tagged_encode, bench_tagged_skip);

criterion_main!(request_benches, sequence_benches, tagged_benches);
