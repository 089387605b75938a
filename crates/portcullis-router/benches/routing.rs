//! Route table throughput on stage-sized APIs.
//!
//! Run with: cargo bench -p portcullis-router

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use portcullis_router::{RouteEntry, RouteMatch, Router, ANY_METHOD};

/// A stage definition reduced to what the trie sees.
struct StageShape {
    routes: Vec<(&'static str, String)>,
}

impl StageShape {
    /// `services` tenants, each exposing a CRUD collection, a nested
    /// sub-resource, a literal sibling of its parameter and a greedy proxy.
    fn tenants(services: usize) -> Self {
        let mut routes = Vec::with_capacity(services * 8);
        for n in 0..services {
            let base = format!("/svc{n}");
            routes.push(("GET", format!("{base}/items")));
            routes.push(("POST", format!("{base}/items")));
            routes.push(("GET", format!("{base}/items/{{itemId}}")));
            routes.push(("PATCH", format!("{base}/items/{{itemId}}")));
            routes.push(("DELETE", format!("{base}/items/{{itemId}}")));
            routes.push(("GET", format!("{base}/items/search")));
            routes.push(("GET", format!("{base}/items/{{itemId}}/events/{{eventId}}")));
            routes.push((ANY_METHOD, format!("{base}/legacy/{{proxy+}}")));
        }
        Self { routes }
    }

    fn build(&self) -> Result<Router, portcullis_router::RouteConflict> {
        let mut router = Router::new();
        for (index, (method, path)) in self.routes.iter().enumerate() {
            router.insert(path, method, RouteEntry { route_index: index })?;
        }
        Ok(router)
    }
}

/// Requests a busy stage sees: mostly hits, some 405s and 404s.
const TRAFFIC: [(&str, &str); 8] = [
    ("GET", "/svc3/items"),
    ("GET", "/svc3/items/search"),
    ("GET", "/svc3/items/8812"),
    ("GET", "/svc3/items/8812/events/e-19"),
    ("PUT", "/svc3/legacy/v1/accounts/77/statement.pdf"),
    ("PUT", "/svc3/items"),
    ("GET", "/svc3/unknown"),
    ("GET", "/svc3//items/"),
];

fn bench_mixed_traffic(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage_traffic");
    group.throughput(Throughput::Elements(TRAFFIC.len() as u64));

    for services in [4, 32, 256] {
        let router = StageShape::tenants(services)
            .build()
            .expect("tenant routes are conflict-free");

        group.bench_with_input(BenchmarkId::from_parameter(services), &router, |b, router| {
            b.iter(|| {
                let mut found = 0usize;
                for (method, path) in TRAFFIC {
                    if let RouteMatch::Found { .. } = router.lookup(black_box(path), black_box(method)) {
                        found += 1;
                    }
                }
                found
            })
        });
    }

    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("stage_publish");

    for services in [4, 32, 256] {
        let shape = StageShape::tenants(services);
        group.throughput(Throughput::Elements(shape.routes.len() as u64));
        group.bench_with_input(BenchmarkId::new("clean", services), &shape, |b, shape| {
            b.iter(|| shape.build())
        });

        // A duplicate at the end forces a full build before the rejection.
        let mut conflicting = StageShape::tenants(services);
        conflicting
            .routes
            .push(("GET", "/svc0/items/{other}".to_string()));
        group.bench_with_input(
            BenchmarkId::new("late_conflict", services),
            &conflicting,
            |b, shape| b.iter(|| shape.build().is_err()),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_mixed_traffic, bench_publish);
criterion_main!(benches);
