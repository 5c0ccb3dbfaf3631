//! Benchmarks for hierarchy stepping.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sph::{Hierarchy, HierarchyConfig, Int3, IoDesc, IoType, LayerDesc};

fn prediction_hierarchy(num_threads: Option<usize>) -> Hierarchy {
    let io_descs = vec![IoDesc {
        size: Int3::new(4, 4, 16),
        ..Default::default()
    }];
    let layer_descs = vec![
        LayerDesc {
            hidden_size: Int3::new(4, 4, 16),
            ticks_per_update: 1,
            ..Default::default()
        },
        LayerDesc {
            hidden_size: Int3::new(4, 4, 16),
            ..Default::default()
        },
    ];
    let config = HierarchyConfig {
        seed: 1,
        num_threads,
    };
    Hierarchy::init_random(&io_descs, &layer_descs, &config).unwrap()
}

fn benchmark_step(c: &mut Criterion) {
    let inputs: Vec<Vec<i32>> = (0..8)
        .map(|t| (0..16).map(|i| ((t * 5 + i) % 16) as i32).collect())
        .collect();

    let mut h = prediction_hierarchy(None);
    let mut t = 0;
    c.bench_function("step_learn", |b| {
        b.iter(|| {
            let input: &[i32] = &inputs[t % 8];
            h.step(black_box(&[input]), true, 0.0).unwrap();
            t += 1;
        })
    });

    let mut h = prediction_hierarchy(None);
    c.bench_function("step_infer", |b| {
        b.iter(|| {
            let input: &[i32] = &inputs[t % 8];
            h.step(black_box(&[input]), false, 0.0).unwrap();
            t += 1;
        })
    });

    let mut h = prediction_hierarchy(Some(1));
    c.bench_function("step_learn_single_thread", |b| {
        b.iter(|| {
            let input: &[i32] = &inputs[t % 8];
            h.step(black_box(&[input]), true, 0.0).unwrap();
            t += 1;
        })
    });
}

fn benchmark_actor_step(c: &mut Criterion) {
    let io_descs = vec![
        IoDesc {
            size: Int3::new(2, 2, 8),
            ..Default::default()
        },
        IoDesc {
            size: Int3::new(1, 1, 4),
            io_type: IoType::Action,
            ..Default::default()
        },
    ];
    let layer_descs = vec![LayerDesc {
        hidden_size: Int3::new(4, 4, 16),
        ticks_per_update: 1,
        ..Default::default()
    }];
    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();

    let obs = vec![1, 3, 5, 7];
    let mut action = vec![0];
    c.bench_function("actor_step", |b| {
        b.iter(|| {
            h.step(black_box(&[&obs[..], &action[..]]), true, 0.5).unwrap();
            action.copy_from_slice(h.get_prediction_cis(1).unwrap());
        })
    });
}

fn benchmark_serialize(c: &mut Criterion) {
    let h = prediction_hierarchy(None);

    c.bench_function("serialize", |b| b.iter(|| black_box(h.serialize())));

    let bytes = h.serialize();
    c.bench_function("from_buffer", |b| {
        b.iter(|| Hierarchy::from_buffer(black_box(&bytes), &HierarchyConfig::default()).unwrap())
    });
}

criterion_group!(benches, benchmark_step, benchmark_actor_step, benchmark_serialize);
criterion_main!(benches);
