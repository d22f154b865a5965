//! Benchmarks for the per-connection hot path
//!
//! Run with: `cargo bench`
//!
//! - Policy evaluation against rule sets of growing size
//! - SO_ORIGINAL_DST record decoding
//! - Request head parsing and target rebuilding

use cgproxy::interception::destination::OriginalDestination;
use cgproxy::interception::policy::{decide, InterceptRule};
use cgproxy::interception::request::RequestHead;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Rule set with `count` enabled patterns that never match
fn build_rules(count: usize) -> Vec<InterceptRule> {
    (0..count)
        .map(|i| InterceptRule::new(format!("service{}.internal", i)))
        .collect()
}

fn bench_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_decide");
    let url = "http://api.example.com/v1/users?page=2";

    for count in [1usize, 10, 100, 1000] {
        let rules = build_rules(count);
        group.bench_with_input(BenchmarkId::new("miss", count), &rules, |b, rules| {
            b.iter(|| decide(black_box(url), black_box(rules)))
        });

        let mut matching = rules.clone();
        matching.push(InterceptRule::new("api.example.com"));
        group.bench_with_input(BenchmarkId::new("last_hit", count), &matching, |b, rules| {
            b.iter(|| decide(black_box(url), black_box(rules)))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut raw = [0u8; 16];
    raw[..2].copy_from_slice(&2u16.to_ne_bytes());
    raw[2..4].copy_from_slice(&[0x1F, 0x90]);
    raw[4..8].copy_from_slice(&[93, 184, 216, 34]);

    c.bench_function("original_dst_decode", |b| {
        b.iter(|| OriginalDestination::decode(black_box(&raw)))
    });
}

fn bench_request_head(c: &mut Criterion) {
    let raw = b"GET /v1/users?page=2 HTTP/1.1\r\n\
        Host: api.example.com\r\n\
        User-Agent: bench/1.0\r\n\
        Accept: application/json\r\n\
        Accept-Encoding: gzip\r\n\r\n";

    c.bench_function("request_head_absolute_target", |b| {
        b.iter(|| {
            let head = RequestHead::parse(black_box(raw)).ok().flatten();
            head.map(|head| head.absolute_target().is_ok())
        })
    });
}

criterion_group!(benches, bench_policy, bench_decode, bench_request_head);
criterion_main!(benches);
