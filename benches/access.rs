// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_kmpp::{schemas::KmppFrame, LoopbackTransport, Obj, Registry};
use std::{hint::black_box, sync::Arc};

pub fn benchmark_access(c: &mut Criterion) {
    let local = Registry::new();
    let transport = Arc::new(LoopbackTransport::new());
    KmppFrame::register(transport.kernel()).unwrap();
    let shared = Registry::with_transport(transport);

    for (label, registry) in [("local", &local), ("shared", &shared)] {
        let frame = KmppFrame::register(registry).unwrap();
        let obj = frame.get().unwrap();
        let loc = frame.def().get_entry("colorspace").unwrap();

        let mut group = c.benchmark_group(format!("access/{label}"));
        group.bench_function("name", |b| {
            b.iter(|| obj.set_u32(black_box("colorspace"), black_box(1)).unwrap())
        });
        group.bench_function("table", |b| {
            b.iter(|| obj.tbl_set_u32(black_box(&loc), black_box(1)).unwrap())
        });
        group.bench_function("schema", |b| {
            b.iter(|| frame.set_colorspace(&obj, black_box(1)).unwrap())
        });

        let mirror = frame.get_local().unwrap();
        frame.set_width(&obj, 1920).unwrap();
        frame.set_height(&obj, 1080).unwrap();
        group.bench_function("update", |b| {
            b.iter(|| Obj::update(&mirror, &obj).unwrap())
        });
        group.finish();
    }
}

criterion_group!(benches, benchmark_access);
criterion_main!(benches);
