use std::io::Cursor;

use bcd::bounded::BoundedString;
use bcd::protocol::{read_reply, read_request, write_reply, write_request, Reply, Request};
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_request_roundtrip(c: &mut Criterion) {
    let request = Request::KvSet {
        key: BoundedString::new("service").unwrap(),
        value: BoundedString::new("checkout-api").unwrap(),
    };
    c.bench_function("kv_set request encode+decode", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            write_request(&mut buf, &request).unwrap();
            let mut cursor = Cursor::new(buf);
            read_request(&mut cursor).unwrap()
        })
    });
}

fn bench_reply_roundtrip(c: &mut Criterion) {
    let reply = Reply::ok();
    c.bench_function("ok reply encode+decode", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            write_reply(&mut buf, &reply).unwrap();
            let mut cursor = Cursor::new(buf);
            read_reply(&mut cursor).unwrap()
        })
    });
}

criterion_group!(benches, bench_request_roundtrip, bench_reply_roundtrip);
criterion_main!(benches);
