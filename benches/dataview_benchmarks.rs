use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dataview::record::RecordWriteOptions;
use dataview::wire::TagWriter;
use dataview::*;

fn label_fields() -> FieldsTable {
    FieldsTable::new(vec![
        FieldDef::new("code", StorageAttr::Numeric, 8),
        FieldDef::new("label", StorageAttr::Alpha, 16),
    ])
}

fn label_cache(size: i64) -> TableCache {
    let fields = label_fields();
    let mut cache = TableCache::new(1, "labels", fields.clone());
    for i in 0..size {
        // scattered codes so sorting has work to do
        let code = (i * 7919) % size;
        let mut row = Record::new(i as RecId, &fields);
        row.set_field_value(0, FieldValue::numeric(code), false, &fields).unwrap();
        row.set_field_value(1, FieldValue::alpha(format!("label{}", code)), false, &fields)
            .unwrap();
        cache.add_row(row).unwrap();
    }
    cache.add_key(Key::new(1, vec![0]));
    cache
}

fn bench_heap_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_sort");

    for size in [100, 1000, 10000].iter() {
        let input: Vec<i64> = (0..*size).map(|i: i64| (i * 7919) % size).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| {
                let mut items = input.clone();
                heap_sort(black_box(&mut items));
                items
            });
        });
    }
    group.finish();
}

fn bench_table_cache_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_cache_sort");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_with_setup(
                || label_cache(size),
                |mut cache| {
                    cache.sort_table(1, SortDirection::Descending).unwrap();
                    cache
                },
            );
        });
    }
    group.finish();
}

fn bench_link_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_resolve");

    let window = FieldsTable::new(vec![
        FieldDef::new("code", StorageAttr::Numeric, 8),
        FieldDef::new("label", StorageAttr::Alpha, 16).linked_to(1, 1),
    ]);

    for size in [100, 1000, 10000].iter() {
        let mut caches = TableCacheSet::new();
        caches.insert(label_cache(*size));
        let mut link = DataviewHeader::new(1, 1, 1).with_locate(0, 0);
        let mut rec = Record::new(1, &window);
        rec.set_field_value(0, FieldValue::numeric(size / 2), false, &window)
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| link.resolve(black_box(&mut rec), &window, &mut caches).unwrap());
        });
    }
    group.finish();
}

fn bench_window_navigation(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_navigation");

    let fields = label_fields();
    for size in [100i64, 1000].iter() {
        let mut dv = DataView::new("bench", fields.clone(), EngineConfig::default());
        let mut w = TagWriter::new();
        w.start("dataview").attr("include_first", 1).attr("include_last", 1);
        let opts = RecordWriteOptions {
            encoding: WireEncoding::Hex,
            shrink: false,
            current: false,
            with_prev: false,
        };
        for i in 0..*size {
            let mut rec = Record::new(i as RecId, &fields);
            rec.set_field_value(0, FieldValue::numeric(i), false, &fields).unwrap();
            rec.write(&mut w, &fields, opts);
        }
        w.end();
        let payload = w.finish();
        dv.apply_response(&payload).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    dv.set_current_by_index(RecIndex::At(i as isize), NavOptions::default())
                        .unwrap();
                }
                dv.set_current_by_index(RecIndex::First, NavOptions::default()).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_heap_sort,
    bench_table_cache_sort,
    bench_link_resolve,
    bench_window_navigation
);
criterion_main!(benches);
