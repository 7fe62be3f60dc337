use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use marginalia_core::decoration::recompute;
use marginalia_core::mapping::{Mapping, StepMap};
use marginalia_core::{AnnotationStore, ReplicaId, ReplicatedDocument};
use serde_json::json;

struct Tier {
    name: &'static str,
    blocks: usize,
    annotations_per_block: usize,
}

const TIERS: [Tier; 3] = [
    Tier {
        name: "small",
        blocks: 20,
        annotations_per_block: 1,
    },
    Tier {
        name: "medium",
        blocks: 200,
        annotations_per_block: 2,
    },
    Tier {
        name: "large",
        blocks: 1_000,
        annotations_per_block: 3,
    },
];

fn fixture(tier: &Tier) -> (ReplicatedDocument, AnnotationStore) {
    let mut html = String::from("<h1>bench</h1>");
    for i in 0..tier.blocks {
        html.push_str(&format!("<p>paragraph number {i} with some text</p>"));
    }
    let doc = ReplicatedDocument::from_html(&html, ReplicaId(1)).expect("fixture parses");
    let mut store = AnnotationStore::new("annotations", ReplicaId(1));
    let blocks = marginalia_core::DocumentView::blocks(&doc);
    for (b, block) in blocks.iter().enumerate().skip(1) {
        for k in 0..tier.annotations_per_block {
            let pos = block.content_start() + k;
            store
                .add(&doc, &format!("n{b}-{k}"), pos, json!({ "block": b }))
                .expect("anchor in range");
        }
    }
    (doc, store)
}

fn bench_recompute(c: &mut Criterion) {
    let mut group = c.benchmark_group("decorations");

    for tier in &TIERS {
        let (doc, store) = fixture(tier);
        group.throughput(Throughput::Elements(store.len() as u64));

        group.bench_with_input(BenchmarkId::new("recompute", tier.name), &(), |b, ()| {
            b.iter(|| black_box(recompute(&doc, &store).map(|out| out.set.len())));
        });

        let set = recompute(&doc, &store).expect("recompute succeeds").set;
        let mapping = Mapping::from(StepMap::insertion(2, 5));
        group.bench_with_input(BenchmarkId::new("map", tier.name), &(), |b, ()| {
            b.iter(|| black_box(set.map(&mapping).len()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_recompute);
criterion_main!(benches);
