use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use chrono::{TimeZone, Utc};
use grantline_core::matcher::GrantMatcher;
use grantline_core::types::{Grant, GrantStatus, ObjectKey, RequestSpec};

use std::collections::BTreeMap;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn make_grant(i: usize, status: GrantStatus) -> Grant {
    Grant {
        id: format!("tok-{i:05}"),
        amount: (i % 8) as u64 + 1,
        unit: if i % 2 == 0 { "nodes" } else { "cores" }.to_string(),
        not_before: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        not_after: Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap(),
        license_secret: ObjectKey::new("bench", format!("lic-{i}")),
        request: (status != GrantStatus::Free).then(|| ObjectKey::new("bench", format!("app-{i}"))),
        status,
    }
}

/// A pool where every grant but the last is already held.
fn make_pool(count: usize) -> BTreeMap<String, Grant> {
    (0..count)
        .map(|i| {
            let status = if i + 1 == count { GrantStatus::Free } else { GrantStatus::InUse };
            let grant = make_grant(i * 2, status);
            (grant.id.clone(), grant)
        })
        .collect()
}

// ─── Benchmarks ─────────────────────────────────────────────────────────────

fn bench_select_worst_case(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher_select");
    let request = ObjectKey::new("bench", "app");
    let spec = RequestSpec {
        entitlement: ObjectKey::new("bench", "db"),
        unit: "nodes".to_string(),
        amount: 1,
    };

    for count in [10, 100, 1000] {
        let pool = make_pool(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| GrantMatcher::select(black_box(&request), black_box(&spec), black_box(&pool)))
        });
    }

    group.finish();
}

fn bench_recompute_aggregates(c: &mut Criterion) {
    let mut status = grantline_core::types::EntitlementStatus {
        grants: (0..1000)
            .map(|i| make_grant(i, GrantStatus::Free))
            .map(|g| (g.id.clone(), g))
            .collect(),
        ..Default::default()
    };

    c.bench_function("recompute_aggregates_1000", |b| {
        b.iter(|| black_box(&mut status).recompute_aggregates())
    });
}

criterion_group!(benches, bench_select_worst_case, bench_recompute_aggregates);
criterion_main!(benches);
