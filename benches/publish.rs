//! Performance benchmarks for a3s-session
//!
//! Run with: cargo bench

use a3s_session::{EventBus, SessionEvent, TokenUsage};
use criterion::{criterion_group, criterion_main, Criterion};

fn delta(i: usize) -> SessionEvent {
    SessionEvent::ContentDelta {
        text: format!("chunk {}", i),
    }
}

fn bench_event_serialization(c: &mut Criterion) {
    let event = SessionEvent::ToolResult {
        tool_use_id: "toolu_01".to_string(),
        tool_name: "query_devices".to_string(),
        output: serde_json::json!({"devices": [{"id": "d1", "status": "offline"}]}),
        is_error: false,
    };

    c.bench_function("SessionEvent serialize", |b| {
        b.iter(|| serde_json::to_vec(&event).unwrap());
    });

    let done = SessionEvent::Done {
        usage: Some(TokenUsage {
            input_tokens: 1200,
            output_tokens: 340,
            ..Default::default()
        }),
        total_cost_usd: Some(0.0125),
    };
    let bytes = serde_json::to_vec(&done).unwrap();
    c.bench_function("SessionEvent deserialize", |b| {
        b.iter(|| serde_json::from_slice::<SessionEvent>(&bytes).unwrap());
    });
}

fn bench_publish(c: &mut Criterion) {
    c.bench_function("EventBus publish (no subscribers)", |b| {
        let bus = EventBus::new("bench", 100);
        let mut i = 0;
        b.iter(|| {
            i += 1;
            bus.publish(delta(i))
        });
    });

    let mut group = c.benchmark_group("publish_fanout");
    for subscribers in [1, 10, 100] {
        group.bench_function(format!("{} subscribers", subscribers), |b| {
            let bus = EventBus::new("bench", 100);
            let _subs: Vec<_> = (0..subscribers)
                .map(|n| bus.subscribe(&format!("tab-{}", n)))
                .collect();
            let mut i = 0;
            b.iter(|| {
                i += 1;
                bus.publish(delta(i))
            });
        });
    }
    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let bus = EventBus::new("bench", 1000);
    for i in 0..1000 {
        bus.publish(delta(i));
    }

    c.bench_function("replay (full window)", |b| {
        b.iter(|| bus.replay(0));
    });

    c.bench_function("replay (last 100)", |b| {
        b.iter(|| bus.replay(900));
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("subscribe_from + drain 100", |b| {
        b.to_async(&rt).iter(|| async {
            let mut sub = bus.subscribe_from("late-tab", Some(900));
            for _ in 0..100 {
                sub.recv().await.unwrap();
            }
            bus.unsubscribe("late-tab");
        });
    });
}

criterion_group!(
    benches,
    bench_event_serialization,
    bench_publish,
    bench_replay,
);
criterion_main!(benches);
