//! YCSB-style macro-benchmarks for SegmentDB.
//!
//! Measures sustained throughput under realistic mixed workloads
//! inspired by the Yahoo Cloud Serving Benchmark (YCSB).
//!
//! # Workloads
//!
//! | Name | Mix | Description |
//! |------|-----|-------------|
//! | **A** | 50% read, 50% update | Session store — heavy read/write |
//! | **B** | 95% read, 5% update | Photo tagging — read-mostly |
//! | **C** | 100% read | User profile cache — read-only |
//! | **E** | 95% scan, 5% insert | Short ranges — threaded conversations |
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench ycsb               # all workloads
//! cargo bench --bench ycsb -- "A"         # workload A only
//! ```

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use rand::Rng;
use segmentdb::{Engine, EngineConfig};
use std::hint::black_box;
use tempfile::TempDir;

const RECORD_COUNT: u64 = 10_000;
const OPS_PER_RUN: u64 = 5_000;
const VALUE_SIZE: usize = 256;
const SCAN_LENGTH: u64 = 50;

fn make_key(i: u64) -> Vec<u8> {
    format!("user{i:012}").into_bytes()
}

fn make_value(rng: &mut impl Rng) -> Vec<u8> {
    let mut buf = vec![0u8; VALUE_SIZE];
    rng.fill(&mut buf[..]);
    buf
}

fn loaded_engine(dir: &std::path::Path) -> Engine {
    let engine = Engine::open(
        dir,
        EngineConfig { write_buffer_size: 256 * 1024, ..EngineConfig::default() },
    )
    .expect("open");
    let mut rng = rand::rng();
    for i in 0..RECORD_COUNT {
        engine.put(&make_key(i), &make_value(&mut rng)).unwrap();
    }
    engine
}

fn run_mixed(engine: &Engine, read_fraction: f64, rng: &mut impl Rng) {
    for _ in 0..OPS_PER_RUN {
        let key = make_key(rng.random_range(0..RECORD_COUNT));
        if rng.random_bool(read_fraction) {
            black_box(engine.get(&key).unwrap());
        } else {
            engine.put(&key, &make_value(rng)).unwrap();
        }
    }
}

fn bench_workload_a(c: &mut Criterion) {
    c.bench_function(BenchmarkId::new("ycsb", "A_50read_50update"), |b| {
        let dir = TempDir::new().unwrap();
        let engine = loaded_engine(dir.path());
        let mut rng = rand::rng();
        b.iter(|| run_mixed(&engine, 0.5, &mut rng));
    });
}

fn bench_workload_b(c: &mut Criterion) {
    c.bench_function(BenchmarkId::new("ycsb", "B_95read_5update"), |b| {
        let dir = TempDir::new().unwrap();
        let engine = loaded_engine(dir.path());
        let mut rng = rand::rng();
        b.iter(|| run_mixed(&engine, 0.95, &mut rng));
    });
}

fn bench_workload_c(c: &mut Criterion) {
    c.bench_function(BenchmarkId::new("ycsb", "C_100read"), |b| {
        let dir = TempDir::new().unwrap();
        let engine = loaded_engine(dir.path());
        let mut rng = rand::rng();
        b.iter(|| {
            for _ in 0..OPS_PER_RUN {
                let key = make_key(rng.random_range(0..RECORD_COUNT));
                black_box(engine.get(&key).unwrap());
            }
        });
    });
}

fn bench_workload_e(c: &mut Criterion) {
    c.bench_function(BenchmarkId::new("ycsb", "E_95scan_5insert"), |b| {
        let dir = TempDir::new().unwrap();
        let engine = loaded_engine(dir.path());
        let mut rng = rand::rng();
        b.iter(|| {
            for _ in 0..(OPS_PER_RUN / 10) {
                if rng.random_bool(0.95) {
                    let start = rng.random_range(0..RECORD_COUNT - SCAN_LENGTH);
                    let end = start + SCAN_LENGTH;
                    black_box(engine.scan(&make_key(start), &make_key(end)).unwrap());
                } else {
                    let key = make_key(RECORD_COUNT + rng.random_range(0..1_000_000));
                    engine.put(&key, &make_value(&mut rng)).unwrap();
                }
            }
        });
    });
}

criterion_group!(benches, bench_workload_a, bench_workload_b, bench_workload_c, bench_workload_e);
criterion_main!(benches);
