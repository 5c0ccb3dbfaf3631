use sph::config::{HierarchyConfig, IoDesc, IoType, LayerDesc};
use sph::helpers::Int3;
use sph::hierarchy::Hierarchy;
use sph::{LayerState, SphError};

fn make_cis(size: Int3, offset: usize) -> Vec<i32> {
    let cols = size.num_columns();
    let col_size = size.z as usize;
    (0..cols).map(|i| ((i + offset) % col_size) as i32).collect()
}

fn assert_valid_csdr(cis: &[i32], size: Int3) {
    assert_eq!(cis.len(), size.num_columns());
    for &ci in cis {
        assert!(ci >= 0 && ci < size.z, "ci={ci} out of range [0,{})", size.z);
    }
}

fn prediction_io(size: Int3) -> IoDesc {
    IoDesc {
        size,
        io_type: IoType::Prediction,
        num_dendrites_per_cell: 2,
        up_radius: 2,
        down_radius: 2,
        ..Default::default()
    }
}

fn layer(hidden_size: Int3, recurrent_radius: Option<i32>, ticks_per_update: usize) -> LayerDesc {
    LayerDesc {
        hidden_size,
        num_dendrites_per_cell: 2,
        up_radius: 2,
        recurrent_radius,
        down_radius: 2,
        ticks_per_update,
        temporal_horizon: ticks_per_update.max(2),
    }
}

#[test]
fn test_hierarchy_create_and_step() {
    // Minimal 1-IO, 1-layer hierarchy
    let io_descs = vec![prediction_io(Int3::new(4, 4, 16))];
    let layer_descs = vec![layer(Int3::new(4, 4, 16), None, 1)];

    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();

    assert_eq!(h.get_num_layers(), 1);
    assert_eq!(h.get_num_io(), 1);
    assert_eq!(h.get_io_type(0).unwrap(), IoType::Prediction);

    let io_size = h.get_io_size(0).unwrap();
    let input_cis = make_cis(io_size, 0);

    for _ in 0..3 {
        h.step(&[&input_cis], true, 0.0).unwrap();
    }

    assert_valid_csdr(h.get_prediction_cis(0).unwrap(), io_size);
    assert_valid_csdr(h.get_hidden_cis(0).unwrap(), h.get_hidden_size(0).unwrap());
}

#[test]
fn test_hierarchy_two_layers() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 16))];
    let layer_descs = vec![
        layer(Int3::new(4, 4, 16), None, 1),
        layer(Int3::new(3, 3, 16), None, 2),
    ];

    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();
    assert_eq!(h.get_num_layers(), 2);

    let io_size = h.get_io_size(0).unwrap();
    for t in 0..5 {
        let input_cis = make_cis(io_size, t);
        h.step(&[&input_cis], true, 0.0).unwrap();
    }

    assert_valid_csdr(h.get_prediction_cis(0).unwrap(), io_size);
    assert_valid_csdr(h.get_layer_prediction_cis(1).unwrap(), h.get_hidden_size(0).unwrap());
}

#[test]
fn test_hierarchy_clear_state() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 8))];
    let layer_descs = vec![layer(Int3::new(4, 4, 8), None, 1), layer(Int3::new(2, 2, 8), None, 2)];

    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();
    let input_cis = make_cis(h.get_io_size(0).unwrap(), 3);

    h.step(&[&input_cis], true, 0.0).unwrap();
    h.clear_state();
    assert_eq!(h.get_ticks(1).unwrap(), 0);
    assert_eq!(h.get_layer_state(1).unwrap(), LayerState::Idle);

    // Should still be able to step after clearing state
    h.step(&[&input_cis], true, 0.0).unwrap();
}

#[test]
fn test_multiple_io() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 8)), prediction_io(Int3::new(2, 3, 5))];
    let layer_descs = vec![layer(Int3::new(4, 4, 16), None, 1)];

    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();
    assert_eq!(h.get_num_io(), 2);

    for t in 0..3 {
        let input0 = make_cis(h.get_io_size(0).unwrap(), t);
        let input1 = make_cis(h.get_io_size(1).unwrap(), t);
        h.step(&[&input0, &input1], true, 0.0).unwrap();
    }

    for i in 0..2 {
        assert_valid_csdr(h.get_prediction_cis(i).unwrap(), h.get_io_size(i).unwrap());
    }
}

#[test]
fn test_io_type_none_has_no_prediction() {
    // An IoType::None port is input-only
    let io_descs = vec![
        IoDesc {
            io_type: IoType::None,
            ..prediction_io(Int3::new(4, 4, 8))
        },
        prediction_io(Int3::new(2, 2, 4)),
    ];
    let layer_descs = vec![layer(Int3::new(4, 4, 8), None, 1)];

    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();

    let io_size1 = h.get_io_size(1).unwrap();
    for t in 0..3 {
        let input0 = make_cis(h.get_io_size(0).unwrap(), t);
        let input1 = make_cis(io_size1, t);
        h.step(&[&input0, &input1], true, 0.0).unwrap();
    }

    assert!(matches!(
        h.get_prediction_cis(0),
        Err(SphError::WrongIoType { io: 0, actual: IoType::None, .. })
    ));
    assert_valid_csdr(h.get_prediction_cis(1).unwrap(), io_size1);
}

#[test]
fn test_recurrent_layers() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 8))];
    let layer_descs = vec![
        layer(Int3::new(4, 4, 8), Some(2), 1),
        layer(Int3::new(3, 3, 8), Some(1), 2),
    ];

    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();
    assert!(h.is_layer_recurrent(0).unwrap());
    // 1 IO * horizon 2 + recurrent
    assert_eq!(h.get_num_encoder_visible_layers(0).unwrap(), 3);

    let io_size = h.get_io_size(0).unwrap();
    // Enough steps for the upper layer to fire at steps 2, 4 and 6
    for t in 0..6 {
        let input_cis = make_cis(io_size, t);
        h.step(&[&input_cis], true, 0.0).unwrap();
    }

    assert_eq!(h.get_layer_state(1).unwrap(), LayerState::TickUpdate);
    assert_valid_csdr(h.get_prediction_cis(0).unwrap(), io_size);
}

#[test]
fn test_action_port_produces_actions() {
    let io_descs = vec![
        prediction_io(Int3::new(2, 2, 8)),
        IoDesc {
            size: Int3::new(1, 2, 3),
            io_type: IoType::Action,
            value_size: 16,
            history_capacity: 32,
            ..Default::default()
        },
    ];
    let layer_descs = vec![layer(Int3::new(3, 3, 8), None, 1)];

    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &HierarchyConfig::default()).unwrap();

    let mut action = vec![0, 0];
    for t in 0..40 {
        let obs = make_cis(Int3::new(2, 2, 8), t);
        h.step(&[&obs, &action], true, (t % 3) as f32 - 1.0).unwrap();
        action = h.get_prediction_cis(1).unwrap().to_vec();
    }

    assert_valid_csdr(&action, Int3::new(1, 2, 3));
    assert_eq!(h.get_prediction_values(1).unwrap().len(), 2);
    assert_eq!(h.get_prediction_acts(1).unwrap().len(), 6);
    assert_eq!(h.get_actor_history_capacity(1).unwrap(), 32);
}

#[test]
fn test_invalid_descriptors_are_rejected() {
    let io_descs = vec![prediction_io(Int3::new(4, 4, 8))];

    let bad_horizon = vec![LayerDesc {
        ticks_per_update: 3,
        temporal_horizon: 2,
        ..layer(Int3::new(4, 4, 8), None, 1)
    }];
    assert!(matches!(
        Hierarchy::init_random(&io_descs, &bad_horizon, &HierarchyConfig::default()),
        Err(SphError::Config(_))
    ));

    assert!(matches!(
        Hierarchy::init_random(&io_descs, &[], &HierarchyConfig::default()),
        Err(SphError::Config(_))
    ));

    let zero_threads = HierarchyConfig {
        num_threads: Some(0),
        ..Default::default()
    };
    assert!(Hierarchy::init_random(&io_descs, &[layer(Int3::new(4, 4, 8), None, 1)], &zero_threads).is_err());
}

#[test]
fn test_prediction_improves_on_repeating_sequence() {
    let io_size = Int3::new(4, 4, 8);
    let io_descs = vec![IoDesc {
        num_dendrites_per_cell: 4,
        ..prediction_io(io_size)
    }];
    let layer_descs = vec![LayerDesc {
        num_dendrites_per_cell: 4,
        ..layer(Int3::new(4, 4, 16), None, 1)
    }];

    let config = HierarchyConfig::with_seed(99);
    let mut h = Hierarchy::init_random(&io_descs, &layer_descs, &config).unwrap();
    let mut fresh = Hierarchy::init_random(&io_descs, &layer_descs, &config).unwrap();

    // A repeating sequence of 4 distinct patterns
    let patterns: Vec<Vec<i32>> = (0..4).map(|p| make_cis(io_size, p * 3)).collect();

    let score = |h: &mut Hierarchy| {
        let mut correct = 0usize;
        for (i, pattern) in patterns.iter().enumerate() {
            let next = &patterns[(i + 1) % patterns.len()];
            h.step(&[pattern], false, 0.0).unwrap();
            correct += sph::csdr::matching_columns(h.get_prediction_cis(0).unwrap(), next);
        }
        correct
    };

    for _ in 0..100 {
        for pattern in &patterns {
            h.step(&[pattern], true, 0.0).unwrap();
        }
    }

    // Prime the fresh hierarchy's history the same way, without learning
    for pattern in &patterns {
        fresh.step(&[pattern], false, 0.0).unwrap();
    }

    let trained = score(&mut h);
    let untrained = score(&mut fresh);
    let total = io_size.num_columns() * patterns.len();

    assert!(
        trained > untrained && trained * 2 >= total,
        "trained={trained} untrained={untrained} out of {total}"
    );

    // Accuracy must not degrade with learning disabled
    for _ in 0..10 {
        score(&mut h);
    }
    let later = score(&mut h);
    assert!(later >= trained, "accuracy regressed: {trained} -> {later}");
}
