use std::f64::consts::PI;

use burn::backend::{Autodiff, NdArray};
use pinn::PinnError;
use pinn::advection::{ExperimentConfig, RESIDUAL, SOLUTION, SPEED};
use pinn::checkpoint::Checkpoint;
use pinn::condition::{
    Block, Condition, MeshSampler, MeshSamplerConfig, PeriodicBoundaryCondition, PeriodicBoundaryConditionConfig,
};
use pinn::config::{CheckpointConfig, TrainerConfig};
use pinn::datamodule::Stage;
use pinn::mesh::PointSource;
use pinn::trainer::{Trainer, TrainerState, predict_points};
use rand::SeedableRng;
use rand::rngs::StdRng;

type TrainBackend = Autodiff<NdArray<f32>>;

fn small_experiment() -> ExperimentConfig {
    ExperimentConfig {
        x_points: 33,
        t_points: 11,
        num_initial: 16,
        num_boundary: 8,
        num_collocation: 64,
        num_observation: 32,
        hidden_size: 10,
        num_layers: 3,
        trainer: TrainerConfig {
            max_epochs: 40,
            learning_rate: 1e-2,
            log_every_n_epochs: 1,
            check_val_every_n_epoch: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn full_scale_mesh_and_samplers() {
    let config = ExperimentConfig::default();
    let mesh = config.mesh().unwrap();
    assert_eq!(mesh.domain_bounds().lb, vec![-1.0, 0.0]);
    assert_eq!(mesh.domain_bounds().ub, vec![1.0, 1.0]);
    assert_eq!(mesh.block_shape(0).unwrap(), (256, 101));

    let mut rng = StdRng::seed_from_u64(11);
    let full = MeshSampler::new(
        "full",
        mesh.clone(),
        MeshSamplerConfig {
            solution: vec![SOLUTION.into()],
            ..Default::default()
        },
        &mut rng,
    )
    .unwrap();
    assert_eq!(full.len(), 256 * 101);
    let Block::Supervised { points, targets, .. } = full.block() else {
        panic!("メッシュサンプラーは教師ありブロックを返すはずです");
    };
    // 全点の抽出は行優先で、値は解析解そのもの
    for (row, &u) in targets[SOLUTION].iter().enumerate() {
        let (s, t) = (row / 101, row % 101);
        assert!((points.spatial[[row, 0]] - (-1.0 + 2.0 * s as f64 / 255.0)).abs() < 1e-12);
        assert!((points.time[row] - t as f64 / 100.0).abs() < 1e-12);
        let expected = (PI * (points.spatial[[row, 0]] - points.time[row])).sin();
        assert!((u - expected).abs() < 1e-12);
    }

    let dm = config.datamodule(&mesh, &mut rng).unwrap();
    let record = dm.record(Stage::Train).unwrap();
    assert_eq!(record.num_points(), 5200);
    assert_eq!(record.terms.len(), 1 + 2 + 1);
}

#[test]
fn collocation_names_need_not_exist_in_data() {
    let config = small_experiment();
    let mesh = config.mesh().unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let collocation = MeshSampler::new(
        "col",
        mesh.clone(),
        MeshSamplerConfig {
            num_sample: Some(10),
            collection_points: vec![RESIDUAL.into()],
            ..Default::default()
        },
        &mut rng,
    );
    assert!(collocation.is_ok());
    let as_solution = MeshSampler::new(
        "data",
        mesh,
        MeshSamplerConfig {
            num_sample: Some(10),
            solution: vec![RESIDUAL.into()],
            ..Default::default()
        },
        &mut rng,
    );
    assert!(matches!(as_solution, Err(PinnError::Configuration(_))));
}

#[test]
fn periodic_pairs_share_times_at_domain_extremes() {
    let config = small_experiment();
    let mesh = config.mesh().unwrap();
    let bc = PeriodicBoundaryCondition::new(
        "bc",
        mesh,
        PeriodicBoundaryConditionConfig {
            num_sample: Some(5),
            solution: vec![SOLUTION.into()],
            derivative_order: 1,
            ..Default::default()
        },
        &mut StdRng::seed_from_u64(4),
    )
    .unwrap();
    let Block::Periodic { lower, upper, .. } = bc.block() else {
        panic!("周期境界ブロックのはずです");
    };
    assert_eq!(lower.len(), 5);
    assert!(lower.spatial.iter().all(|&x| x == -1.0));
    assert!(upper.spatial.iter().all(|&x| x == 1.0));
    assert_eq!(lower.time, upper.time);
}

#[test]
fn train_checkpoint_and_predict_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_experiment();
    config.trainer.checkpoint = Some(CheckpointConfig {
        dir: dir.path().join("ckpt"),
        every_n_epochs: 1000,
    });
    let mesh = config.mesh().unwrap();
    let dm = config.datamodule(&mesh, &mut StdRng::seed_from_u64(5)).unwrap();

    let mut trainer = Trainer::<TrainBackend, _>::new(
        config.model_config(),
        config.problem(),
        config.trainer.clone(),
        Default::default(),
    )
    .unwrap();
    trainer.compile(&dm).unwrap();
    let summary = trainer.fit().unwrap();
    assert_eq!(trainer.state(), TrainerState::Finished);
    assert_eq!(summary.epochs, 40);
    let first = summary.history.first().unwrap().loss;
    let last = summary.history.last().unwrap().loss;
    assert!(last < first, "{first} -> {last}");
    assert!(summary.history[0].terms.contains_key("bc/u/d1"));
    assert!(summary.history[0].terms.contains_key("collocation/f"));
    assert_eq!(summary.validations.len(), 4);

    let predictions = trainer.predict(&dm, Stage::Predict).unwrap();
    assert_eq!(predictions.len(), 1);
    let trained = &predictions[0].outputs[SOLUTION];
    assert_eq!(trained.len(), 33 * 11);

    let device = Default::default();
    let checkpoint = Checkpoint::<NdArray<f32>>::load(dir.path().join("ckpt"), &device).unwrap();
    assert_eq!(checkpoint.meta.epoch, 40);
    let restored = predict_points(
        &checkpoint.model,
        &checkpoint.scaling(&device),
        &checkpoint.meta.model.outputs,
        &config.problem(),
        &predictions[0].points,
        &device,
    )
    .unwrap();
    for (a, b) in trained.iter().zip(restored[SOLUTION].iter()) {
        assert!((a - b).abs() < 1e-6);
    }

    trainer.save(dir.path().join("manual"), summary.final_loss).unwrap();
    assert!(dir.path().join("manual").join("checkpoint.json").exists());
}

#[test]
fn inverse_problem_updates_speed() {
    let mut config = small_experiment();
    config.inverse = true;
    config.trainer.max_epochs = 10;
    let mesh = config.mesh().unwrap();
    let dm = config.datamodule(&mesh, &mut StdRng::seed_from_u64(8)).unwrap();
    let mut trainer = Trainer::<TrainBackend, _>::new(
        config.model_config(),
        config.problem(),
        config.trainer.clone(),
        Default::default(),
    )
    .unwrap();
    assert_eq!(trainer.extra_values().unwrap()[SPEED], 0.5);
    trainer.compile(&dm).unwrap();
    let summary = trainer.fit().unwrap();
    let speed = summary.extra[SPEED];
    assert!((speed - 0.5).abs() > 1e-4, "c = {speed}");
    assert!(summary.history[0].terms.contains_key("observation/u"));
}

#[test]
fn mismatched_dimension_is_rejected_at_compile() {
    let config = small_experiment();
    let mesh = config.mesh().unwrap();
    let dm = config.datamodule(&mesh, &mut StdRng::seed_from_u64(1)).unwrap();
    let mut model = config.model_config();
    model.network.input_dim = 3;
    let mut trainer =
        Trainer::<TrainBackend, _>::new(model, config.problem(), config.trainer.clone(), Default::default()).unwrap();
    assert!(matches!(trainer.compile(&dm), Err(PinnError::Configuration(_))));
}
