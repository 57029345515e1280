//! Account stream benchmarks: record decoding and store application.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use optiondesk_broker::Fieldset;
use optiondesk_gateway::account::AccountStore;
use optiondesk_gateway::fieldset::decode;

/// A download burst: `n_positions` portfolio records, a handful of account
/// values, then the end marker.
fn download_burst(n_positions: usize) -> Vec<Fieldset> {
    let mut records = Vec::with_capacity(n_positions + 8);
    for (tag, value) in [
        ("NetLiquidation", "100250.75"),
        ("TotalCashValue", "40120.10"),
        ("BuyingPower", "160480.40"),
        ("AvailableFunds", "40120.10"),
        ("ExcessLiquidity", "41000.00"),
        ("GrossPositionValue", "60130.65"),
    ] {
        records.push(Fieldset(vec![
            "6".into(),
            "2".into(),
            tag.into(),
            value.into(),
            "USD".into(),
            "DU123".into(),
        ]));
    }
    for i in 0..n_positions {
        let strike = 100 + (i % 50) * 5;
        records.push(Fieldset(vec![
            "7".into(),
            "8".into(),
            format!("{}", 400_000 + i),
            format!("S{:03}", i % 500),
            "OPT".into(),
            "20261120".into(),
            strike.to_string(),
            if i % 2 == 0 { "C".into() } else { "P".into() },
            "100".into(),
            "AMEX".into(),
            "USD".into(),
            format!("S{:03} 261120C{strike:05}000", i % 500),
            format!("S{:03}", i % 500),
            format!("{}", 1 + i % 10),
            "4.25".into(),
            "850".into(),
            "3.10".into(),
            "230".into(),
            "0".into(),
            "DU123".into(),
        ]));
    }
    records.push(Fieldset(vec!["54".into(), "1".into(), "DU123".into()]));
    records
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fieldset/decode");

    for n in [100, 1_000, 10_000] {
        let records = download_burst(n);
        group.throughput(Throughput::Elements(records.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &records, |b, records| {
            b.iter(|| {
                let decoded = records
                    .iter()
                    .filter_map(|r| decode(black_box(r)))
                    .count();
                black_box(decoded)
            });
        });
    }

    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("fieldset/apply");

    let records = download_burst(1_000);
    group.throughput(Throughput::Elements(records.len() as u64));
    group.bench_function("1000_positions", |b| {
        b.iter(|| {
            let store = AccountStore::new();
            for record in &records {
                store.apply(black_box(record));
            }
            black_box(store.snapshot("DU123"))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_decode, bench_apply);
criterion_main!(benches);
