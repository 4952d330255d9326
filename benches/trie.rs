// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_kmpp::{trie::get_info_from_root, Trie};
use std::hint::black_box;

fn build(count: usize) -> Trie {
    let mut trie = Trie::with_capacity("bench", count * 8 + 64, count * 64).unwrap();
    for i in 0..count {
        trie.add_info(&format!("rc:field_{i}"), &(i as u64).to_le_bytes())
            .unwrap();
    }
    trie.seal(&[0; 16]).unwrap();
    trie
}

pub fn benchmark_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("trie");
    for count in [8, 32, 128, 512] {
        let trie = build(count);
        let name = format!("rc:field_{}", count / 2);
        group.bench_with_input(format!("lookup/{count}"), &name, |b, name| {
            b.iter(|| trie.get_info(black_box(name)))
        });

        let root = trie.get_node_root().to_vec();
        group.bench_with_input(format!("root/{count}"), &name, |b, name| {
            b.iter(|| get_info_from_root(black_box(&root), black_box(name)))
        });

        group.bench_function(format!("build/{count}"), |b| b.iter(|| build(count)));
    }
    group.finish();
}

criterion_group!(benches, benchmark_lookup);
criterion_main!(benches);
