use bridge::Bridge;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rule_engine::{
    compute_fingerprint, normalize, CollectionAssembler, Ledger, MemoryLedger,
    ResolvedAddressGroups, SubmissionInput,
};
use serde_json::json;

fn submission(source_application: &str) -> SubmissionInput {
    let network_rules: Vec<_> = (0..20)
        .map(|i| {
            json!({
                "name": format!("svc-{}", i),
                "protocols": ["TCP"],
                "source_ip_groups": ["office"],
                "destination_ip_addresses": [format!("10.1.{}.0/24", i)],
                "destination_ports": [format!("{}", 8000 + i)]
            })
        })
        .collect();

    serde_json::from_value(json!({
        "collection_name": "bench-collection",
        "source_application": source_application,
        "requested_by": "bench@corp.com",
        "ip_groups": {"office": ["192.168.0.0/16", "172.16.4.0/24"]},
        "application_rules": {
            "action": "Allow",
            "rules": [{
                "name": "web",
                "protocols": ["Https:443", "Http:80"],
                "source_ip_groups": ["office"],
                "destination_fqdns": ["api.example.com", "cdn.example.com"]
            }]
        },
        "network_rules": {"action": "Allow", "rules": network_rules}
    }))
    .expect("bench submission")
}

fn assemble_into<L: Ledger>(c: &mut Criterion, label: &str, ledger: L) {
    let assembler = CollectionAssembler::new(ledger);
    let mut counter = 0u64;
    c.bench_function(label, |b| {
        b.iter(|| {
            // Fresh source per iteration keeps priorities and fingerprints apart
            counter += 1;
            let input = submission(&format!("bench-app-{}", counter));
            black_box(assembler.assemble(&input).expect("assemble"))
        })
    });
}

pub fn normalize_bench(c: &mut Criterion) {
    let input = submission("bench-app");
    c.bench_function("normalize_submission", |b| {
        b.iter(|| black_box(normalize(black_box(&input)).expect("valid")))
    });
}

pub fn fingerprint_bench(c: &mut Criterion) {
    let normalized = normalize(&submission("bench-app")).expect("valid");
    let groups = ResolvedAddressGroups::from_submission(&normalized.ip_groups);
    let entries: Vec<_> = normalized.groups().flat_map(|g| g.rules.iter()).collect();
    c.bench_function("fingerprint_entries", |b| {
        b.iter(|| {
            for entry in &entries {
                black_box(compute_fingerprint(entry, &groups));
            }
        })
    });
}

pub fn assemble_memory_bench(c: &mut Criterion) {
    assemble_into(c, "assemble_memory_ledger", MemoryLedger::new());
}

pub fn assemble_sqlite_bench(c: &mut Criterion) {
    assemble_into(
        c,
        "assemble_sqlite_ledger",
        Bridge::in_memory().expect("in-memory database"),
    );
}

criterion_group!(
    benches,
    normalize_bench,
    fingerprint_bench,
    assemble_memory_bench,
    assemble_sqlite_bench
);
criterion_main!(benches);
