use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use uuid::Uuid;

use tasklane_sync::presence::{PresenceCache, PresenceKind};
use tasklane_sync::protocol::Envelope;
use tasklane_sync::store::{EntityStore, Fields};

fn fields(value: serde_json::Value) -> Fields {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("fields() needs a JSON object"),
    }
}

fn sample_task(id: i64) -> Fields {
    fields(json!({
        "id": id,
        "workspace_id": 42,
        "title": "Benchmark task",
        "description": "A reasonably sized description field for realism",
        "status": "in_progress",
        "assignee": Uuid::new_v4(),
        "updated_at": "2025-11-02T10:00:00Z"
    }))
}

fn bench_envelope_encode(c: &mut Criterion) {
    let envelope = Envelope::new("task:updated", json!(sample_task(7)));

    c.bench_function("envelope_encode", |b| {
        b.iter(|| {
            black_box(black_box(&envelope).encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = Envelope::new("task:updated", json!(sample_task(7)))
        .encode()
        .unwrap();

    c.bench_function("envelope_decode", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_store_visible_read_no_pending(c: &mut Criterion) {
    let store = EntityStore::new();
    store.merge_remote(7, sample_task(7));

    c.bench_function("store_read_no_pending", |b| {
        b.iter(|| {
            black_box(store.get(black_box(7)));
        })
    });
}

fn bench_store_visible_read_8_pending(c: &mut Criterion) {
    let store = EntityStore::new();
    store.merge_remote(7, sample_task(7));
    for i in 0..8 {
        store.apply_optimistic(7, fields(json!({"title": format!("edit {i}")})));
    }

    c.bench_function("store_read_8_pending_overlay", |b| {
        b.iter(|| {
            black_box(store.get(black_box(7)));
        })
    });
}

fn bench_store_apply_confirm_cycle(c: &mut Criterion) {
    let store = EntityStore::new();
    store.merge_remote(7, sample_task(7));
    let server = sample_task(7);

    c.bench_function("store_apply_confirm_cycle", |b| {
        b.iter(|| {
            let token = store.apply_optimistic(7, fields(json!({"title": "cycle"})));
            store.confirm(black_box(token), server.clone());
        })
    });
}

fn bench_store_merge_remote(c: &mut Criterion) {
    let store = EntityStore::new();
    let entity = sample_task(7);

    c.bench_function("store_merge_remote", |b| {
        b.iter(|| {
            store.merge_remote(black_box(7), entity.clone());
        })
    });
}

fn bench_presence_record(c: &mut Criterion) {
    let cache = PresenceCache::with_defaults();
    let user = Uuid::new_v4();
    let value = json!({"user_id": user, "x": 100.0, "y": 200.0});

    c.bench_function("presence_record", |b| {
        b.iter(|| {
            cache.record(black_box(user), PresenceKind::Cursor, value.clone());
        })
    });
}

fn bench_presence_get_100_users(c: &mut Criterion) {
    let cache = PresenceCache::with_defaults();
    for _ in 0..100 {
        let user = Uuid::new_v4();
        cache.record(user, PresenceKind::Cursor, json!({"x": 1.0, "y": 2.0}));
    }

    c.bench_function("presence_get_100_users", |b| {
        b.iter(|| {
            black_box(cache.get(black_box(PresenceKind::Cursor)));
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_store_visible_read_no_pending,
    bench_store_visible_read_8_pending,
    bench_store_apply_confirm_cycle,
    bench_store_merge_remote,
    bench_presence_record,
    bench_presence_get_100_users,
);
criterion_main!(benches);
