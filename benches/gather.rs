use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use branchwater::collection::SmallSignature;
use branchwater::encodings::HashFunctions;
use branchwater::gather::{consume_query_by_gather, prefetch};
use branchwater::search::{compare, SearchParams};
use branchwater::sketch::minhash::{max_hash_for_scaled, KmerMinHash};

use criterion::{black_box, criterion_group, criterion_main, Criterion};

const SCALED: u64 = 1000;

fn random_sketch(rng: &mut StdRng, name: &str, pool: &[u64], n: usize) -> SmallSignature {
    let max_hash = max_hash_for_scaled(SCALED);
    let mut mh = KmerMinHash::builder()
        .ksize(31)
        .hash_function(HashFunctions::murmur64_DNA)
        .max_hash(max_hash)
        .build();
    let hashes: Vec<u64> = (0..n).map(|_| pool[rng.gen_range(0..pool.len())]).collect();
    mh.add_many(&hashes);
    SmallSignature {
        location: format!("{name}.sig"),
        name: name.into(),
        md5sum: mh.md5sum(),
        minhash: mh,
    }
}

fn fixtures() -> (SmallSignature, Vec<SmallSignature>) {
    let mut rng = StdRng::seed_from_u64(42);
    let max_hash = max_hash_for_scaled(SCALED);
    let pool: Vec<u64> = (0..50_000).map(|_| rng.gen_range(0..max_hash)).collect();

    let query = random_sketch(&mut rng, "query", &pool, 20_000);
    let refs = (0..200)
        .map(|i| random_sketch(&mut rng, &format!("ref{i}"), &pool, 2_000))
        .collect();
    (query, refs)
}

fn gather_benchmarks(c: &mut Criterion) {
    let (query, refs) = fixtures();

    let mut group = c.benchmark_group("gather");
    group.sample_size(10);

    group.bench_function("prefetch", |b| {
        b.iter(|| prefetch(black_box(&query.minhash), black_box(&refs), 5))
    });

    let candidates = prefetch(&query.minhash, &refs, 5);
    group.bench_function("consume_query_by_gather", |b| {
        b.iter(|| {
            consume_query_by_gather(black_box(&query), candidates.clone(), 5)
                .expect("error running gather")
        })
    });

    let params = SearchParams::builder().threshold(0.0).estimate_ani(true).build();
    group.bench_function("compare", |b| {
        b.iter(|| {
            for r in &refs {
                black_box(compare(&query, r, &params).expect("error comparing"));
            }
        })
    });

    group.finish();
}

criterion_group!(gather, gather_benchmarks);
criterion_main!(gather);
