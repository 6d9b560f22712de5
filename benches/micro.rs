//! Micro-benchmarks for TesseraDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- bloom     # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use tesseradb::bloom::{SplitBlockFilter, xxhash64};
use tesseradb::fts::FtsIndex;
use tesseradb::geo::{GeoIndex, GeoSearchOptions, encode_geohash, haversine_distance};
use tesseradb::keycodec::{Key, encode_composite};

// ------------------------------------------------------------------------------------------------
// Key codec
// ------------------------------------------------------------------------------------------------

fn bench_keycodec(c: &mut Criterion) {
    let mut group = c.benchmark_group("keycodec");

    group.bench_function("encode_composite", |b| {
        let parts = [
            Key::String("orders".to_string()),
            Key::Number(123_456.789),
            Key::Date(1_700_000_000_000),
        ];
        b.iter(|| encode_composite(black_box(&parts)));
    });

    group.bench_function("decode_string_key", |b| {
        let encoded = Key::String("a-moderately-long-entity-identifier".to_string()).encode();
        b.iter(|| Key::decode(black_box(encoded.as_bytes())).unwrap());
    });

    group.bench_function("compare", |b| {
        let x = encode_composite(&[Key::String("ns".to_string()), Key::Number(1.0)]);
        let y = encode_composite(&[Key::String("ns".to_string()), Key::Number(2.0)]);
        b.iter(|| tesseradb::keycodec::compare(black_box(&x), black_box(&y)));
    });

    group.finish();
}

// ------------------------------------------------------------------------------------------------
// xxHash64 and bloom filter
// ------------------------------------------------------------------------------------------------

fn bench_bloom(c: &mut Criterion) {
    let mut group = c.benchmark_group("bloom");

    for size in [16usize, 256, 4096] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("xxhash64", size), &data, |b, data| {
            b.iter(|| xxhash64(black_box(data), 0));
        });
    }

    group.bench_function("insert_hash", |b| {
        let mut filter = SplitBlockFilter::new(64 * 1024).unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i = i.wrapping_add(0x9E37_79B9_7F4A_7C15);
            filter.insert_hash(black_box(i));
        });
    });

    group.bench_function("check_hash_hit", |b| {
        let mut filter = SplitBlockFilter::new(64 * 1024).unwrap();
        for i in 0..10_000u64 {
            filter.insert_hash(i.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        }
        b.iter(|| filter.check_hash(black_box(4_242u64.wrapping_mul(0x9E37_79B9_7F4A_7C15))));
    });

    group.finish();
}

// ------------------------------------------------------------------------------------------------
// Full-text search
// ------------------------------------------------------------------------------------------------

fn bench_fts(c: &mut Criterion) {
    let mut group = c.benchmark_group("fts");

    let mut index = FtsIndex::default();
    for i in 0..1_000 {
        let body = format!(
            "columnar storage engine number {i} with bloom filters and \
             positional postings for phrase queries"
        );
        index.insert_document(&format!("doc-{i}"), &[("body", body.as_str())]);
    }

    group.bench_function("search_two_terms", |b| {
        b.iter(|| index.search(black_box("columnar postings")));
    });

    group.bench_function("search_phrase", |b| {
        b.iter(|| index.search_phrase(black_box("bloom filters")));
    });

    group.finish();
}

// ------------------------------------------------------------------------------------------------
// Geo
// ------------------------------------------------------------------------------------------------

fn bench_geo(c: &mut Criterion) {
    let mut group = c.benchmark_group("geo");

    group.bench_function("encode_geohash_p9", |b| {
        b.iter(|| encode_geohash(black_box(37.7749), black_box(-122.4194), 9));
    });

    group.bench_function("haversine", |b| {
        b.iter(|| {
            haversine_distance(
                black_box(37.7749),
                black_box(-122.4194),
                black_box(34.0522),
                black_box(-118.2437),
            )
        });
    });

    group.bench_function("radius_search_10k", |b| {
        let mut index = GeoIndex::new(6);
        for i in 0..10_000u32 {
            // Scatter points over the Bay Area.
            let lat = 37.3 + (i % 100) as f64 * 0.01;
            let lng = -122.5 + (i / 100) as f64 * 0.01;
            index.insert(&format!("doc-{i}"), lat, lng, 0, i);
        }
        let options = GeoSearchOptions {
            max_distance: Some(5_000.0),
            limit: Some(100),
            ..Default::default()
        };
        b.iter(|| index.search(black_box(37.7749), black_box(-122.4194), &options));
    });

    group.finish();
}

criterion_group!(benches, bench_keycodec, bench_bloom, bench_fts, bench_geo);
criterion_main!(benches);
