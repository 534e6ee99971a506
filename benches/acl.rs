//! ACL Performance Benchmarks
//!
//! Benchmarks for grant list handling:
//! - Parsing native `aclitem[]` text
//! - Planning reconciliation between large lists

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pgctl::acl::reconcile::plan;
use pgctl::acl::{AclItem, AclList};

fn native_entries(roles: usize) -> Vec<String> {
    (0..roles).map(|i| format!("role_{i}=C*Tc/postgres")).collect()
}

fn human_list(roles: usize, privileges: &str) -> AclList {
    (0..roles)
        .map(|i| format!("role_{i}:{privileges}").parse::<AclItem>().unwrap())
        .collect()
}

fn bench_parse_native(c: &mut Criterion) {
    let entries = native_entries(200);

    c.bench_function("acl_parse_native_200", |b| {
        b.iter(|| AclList::from_native(black_box(&entries)).unwrap());
    });
}

fn bench_plan_identical(c: &mut Criterion) {
    let current = human_list(200, "CREATE,CONNECT,TEMPORARY");
    let desired = human_list(200, "TEMPORARY,CONNECT,CREATE");

    c.bench_function("acl_plan_identical_200", |b| {
        b.iter(|| {
            let steps = plan(black_box(&current), black_box(&desired));
            assert!(steps.is_empty());
            steps
        });
    });
}

fn bench_plan_changes(c: &mut Criterion) {
    let current = human_list(200, "CREATE WITH GRANT OPTION,CONNECT");
    let desired = human_list(200, "CREATE,TEMPORARY");

    c.bench_function("acl_plan_changes_200", |b| {
        b.iter(|| plan(black_box(&current), black_box(&desired)));
    });
}

criterion_group!(benches, bench_parse_native, bench_plan_identical, bench_plan_changes);
criterion_main!(benches);
