//! Formula evaluation benchmarks.
//!
//! Compares uncached evaluation with evaluation through a warmed result cache,
//! and measures contention on shared computations.
//! Run with: cargo bench --bench formula_benchmark

#![allow(clippy::cast_possible_truncation)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::ops::Bound;
use std::sync::Arc;
use std::thread;

use sievedb_core::{
    AttributeIndex, AttributeValue, Bitmap, CacheConfig, CacheEngine, CacheKey, CacheScope,
    EvaluationContext, FormulaId, FormulaTree, ReferenceIndex, TranslationDirection,
};

struct Fixture {
    color: Arc<AttributeIndex>,
    price: Arc<AttributeIndex>,
    brands: Arc<ReferenceIndex>,
}

impl Fixture {
    fn new(entities: u32) -> Self {
        let color = Arc::new(AttributeIndex::new("color"));
        let price = Arc::new(AttributeIndex::new("price"));
        let brands = Arc::new(ReferenceIndex::new("brand"));
        let colors = ["red", "green", "blue", "black"];
        color.insert_all(
            (0..entities).map(|pk| (AttributeValue::from(colors[(pk % 4) as usize]), pk)),
        );
        price.insert_all(
            (0..entities).map(|pk| (AttributeValue::from(i64::from(pk % 1_000)), pk)),
        );
        brands.link_all((0..entities).map(|pk| (pk, 1_000_000 + pk % 50)));
        Self {
            color,
            price,
            brands,
        }
    }

    fn query(&self, tree: &mut FormulaTree) -> FormulaId {
        let red = tree.attribute_equals(&self.color, "red");
        let cheap = tree.attribute_range(
            &self.price,
            Bound::Unbounded,
            Bound::Excluded(AttributeValue::from(300_i64)),
        );
        let brand_keys = tree.constant(Bitmap::from_range(1_000_000..1_000_010));
        let branded = tree
            .translate(&self.brands, TranslationDirection::ReferencedToOwning, brand_keys)
            .unwrap();
        tree.and(vec![red, cheap, branded]).unwrap()
    }
}

fn eager_engine() -> CacheEngine {
    CacheEngine::new(CacheConfig {
        minimal_complexity_threshold: 1,
        promotion_score_threshold: 0.0,
        cooldown_score_threshold: 0.0,
        ..CacheConfig::default()
    })
    .unwrap()
}

fn bench_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Formula-Evaluation");

    for entities in [10_000_u32, 100_000] {
        let fixture = Fixture::new(entities);
        group.throughput(Throughput::Elements(u64::from(entities)));

        group.bench_with_input(
            BenchmarkId::new("uncached", entities),
            &fixture,
            |b, fixture| {
                b.iter(|| {
                    let mut tree = FormulaTree::new();
                    let root = fixture.query(&mut tree);
                    black_box(tree.compute(root, &EvaluationContext::uncached()).unwrap())
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("cached_warm", entities),
            &fixture,
            |b, fixture| {
                let engine = eager_engine();
                let ctx = EvaluationContext::cached(&engine, CacheScope::GLOBAL);
                for _ in 0..2 {
                    let mut tree = FormulaTree::new();
                    let root = fixture.query(&mut tree);
                    tree.compute(root, &ctx).unwrap();
                }
                engine.reevaluate().unwrap();
                b.iter(|| {
                    let mut tree = FormulaTree::new();
                    let root = fixture.query(&mut tree);
                    black_box(tree.compute(root, &ctx).unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_estimation(c: &mut Criterion) {
    let fixture = Fixture::new(100_000);

    c.bench_function("Formula-Estimation/hash_and_cost", |b| {
        b.iter(|| {
            let mut tree = FormulaTree::new();
            let root = fixture.query(&mut tree);
            black_box((
                tree.structural_hash(root).unwrap(),
                tree.estimated_cost(root).unwrap(),
            ))
        });
    });
}

fn bench_single_flight_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("Cache-Contention");

    for threads in [2_usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("same_key", threads),
            &threads,
            |b, &threads| {
                let engine = Arc::new(eager_engine());
                let key = CacheKey::new(42, CacheScope::GLOBAL);
                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let engine = Arc::clone(&engine);
                            thread::spawn(move || {
                                engine
                                    .get_or_compute(key, 1_000, || {
                                        Ok(Bitmap::from_range(0..10_000))
                                    })
                                    .unwrap()
                            })
                        })
                        .collect();
                    for h in handles {
                        black_box(h.join().unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_evaluation,
    bench_estimation,
    bench_single_flight_contention,
);

criterion_main!(benches);
