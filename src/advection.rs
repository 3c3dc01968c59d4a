//! 1次元の移流方程式 `u_t + c u_x = 0` を題材にした実験の組み立て。
//!
//! `u(x, 0) = sin(πx)`、`x ∈ [-1, 1]` で周期境界。参照解は解析解
//! `u = sin(π(x - ct))` を読み込み関数として与えます。

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use burn::prelude::Backend;
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::condition::{
    Condition, InitialCondition, InitialConditionConfig, InitialFn, MeshSampler, MeshSamplerConfig,
    PeriodicBoundaryCondition, PeriodicBoundaryConditionConfig,
};
use crate::config::TrainerConfig;
use crate::datamodule::{DataModule, Stage};
use crate::domain::{Interval, SpatialDomain, TimeDomain};
use crate::error::{BoxError, PinnError, Result};
use crate::mesh::{Mesh, PointSource, SolutionData};
use crate::model::{ExtraVariable, MlpConfig, PinnModelConfig};
use crate::physics::{Axis, PdeContext, Problem};
use crate::sampling::SamplingStrategy;

/// 解の名前
pub const SOLUTION: &str = "u";
/// 残差の名前
pub const RESIDUAL: &str = "f";
/// 逆問題で学習する移流速度の名前
pub const SPEED: &str = "c";

/// 移流方程式。`learn_speed` が真なら速度を追加変数 `c` から取ります。
#[derive(Debug, Clone, Copy)]
pub struct Advection {
    pub speed: f64,
    pub learn_speed: bool,
}

impl Problem for Advection {
    fn residual_names(&self) -> Vec<String> {
        vec![RESIDUAL.into()]
    }

    fn pde_fn<B: Backend>(&self, ctx: &mut PdeContext<'_, B>) -> Result<()> {
        let u_t = ctx.derivative(SOLUTION, Axis::Time, 1)?;
        let u_x = ctx.derivative(SOLUTION, Axis::Space(0), 1)?;
        let transport = if self.learn_speed {
            u_x * ctx.extra(SPEED)?
        } else {
            u_x.mul_scalar(self.speed)
        };
        ctx.set_residual(RESIDUAL, u_t + transport)
    }
}

/// 解析解 `sin(π(x - ct))` を `(空間点数, 時刻数)` の配列で返します。
pub fn analytic_solution(
    spatial: &SpatialDomain,
    time: &TimeDomain,
    speed: f64,
) -> std::result::Result<SolutionData, BoxError> {
    if spatial.dim() != 1 {
        return Err(format!("移流の解析解は空間1次元のみ対応しています (次元 {})", spatial.dim()).into());
    }
    let xs = spatial.points().column(0).to_owned();
    let ts = time.points();
    let u = Array2::from_shape_fn((xs.len(), ts.len()), |(i, j)| (PI * (xs[i] - speed * ts[j])).sin());
    Ok(SolutionData::from([(SOLUTION.to_string(), u)]))
}

/// 実験全体の設定。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub x_interval: [f64; 2],
    pub x_points: usize,
    pub t_interval: [f64; 2],
    pub t_points: usize,
    pub advection_speed: f64,
    pub num_initial: usize,
    pub num_boundary: usize,
    pub num_collocation: usize,
    /// 逆問題で解を直接観測する点数。
    pub num_observation: usize,
    pub strategy: SamplingStrategy,
    pub hidden_size: usize,
    pub num_layers: usize,
    /// 速度 `c` を未知として観測データから推定します。
    pub inverse: bool,
    pub initial_speed: f64,
    pub sampling_seed: u64,
    pub trainer: TrainerConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            x_interval: [-1.0, 1.0],
            x_points: 256,
            t_interval: [0.0, 1.0],
            t_points: 101,
            advection_speed: 1.0,
            num_initial: 100,
            num_boundary: 100,
            num_collocation: 5000,
            num_observation: 500,
            strategy: SamplingStrategy::Uniform,
            hidden_size: 20,
            num_layers: 4,
            inverse: false,
            initial_speed: 0.5,
            sampling_seed: 0,
            trainer: TrainerConfig::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.trainer.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn problem(&self) -> Advection {
        Advection {
            speed: self.advection_speed,
            learn_speed: self.inverse,
        }
    }

    pub fn model_config(&self) -> PinnModelConfig {
        let network = MlpConfig::new(2, 1)
            .with_hidden_size(self.hidden_size)
            .with_num_layers(self.num_layers);
        let config = PinnModelConfig::new(network, vec![SOLUTION.into()]);
        if self.inverse {
            config.with_extra_variables(vec![ExtraVariable {
                name: SPEED.into(),
                init: self.initial_speed,
            }])
        } else {
            config
        }
    }

    pub fn mesh(&self) -> Result<Arc<dyn PointSource>> {
        let spatial = SpatialDomain::from_interval(Interval::new(self.x_interval, self.x_points)?)?;
        let time = TimeDomain::new(self.t_interval, self.t_points)?;
        let speed = self.advection_speed;
        let mesh = Mesh::build(&spatial, &time, |_| analytic_solution(&spatial, &time, speed), ".")?;
        Ok(Arc::new(mesh))
    }

    /// 初期条件・周期境界・コロケーション点（逆問題では観測点も）を学習に、
    /// メッシュ全体を検証・テスト・予測に割り当てます。
    pub fn datamodule<R: Rng + ?Sized>(&self, mesh: &Arc<dyn PointSource>, rng: &mut R) -> Result<DataModule> {
        if self.inverse && self.num_observation == 0 {
            return Err(PinnError::config("逆問題には観測点が必要です"));
        }
        let initial_fun: Arc<InitialFn> = Arc::new(|x: &[f64]| {
            let x0 = x.first().copied().unwrap_or_default();
            BTreeMap::from([(SOLUTION.to_string(), (PI * x0).sin())])
        });
        let ic = InitialCondition::new(
            "ic",
            mesh.clone(),
            InitialConditionConfig {
                num_sample: Some(self.num_initial),
                solution: vec![SOLUTION.into()],
                strategy: self.strategy,
                ..Default::default()
            },
            Some(initial_fun),
            rng,
        )?;
        let bc = PeriodicBoundaryCondition::new(
            "bc",
            mesh.clone(),
            PeriodicBoundaryConditionConfig {
                num_sample: Some(self.num_boundary),
                solution: vec![SOLUTION.into()],
                derivative_order: 1,
                strategy: self.strategy,
                ..Default::default()
            },
            rng,
        )?;
        let collocation = MeshSampler::new(
            "collocation",
            mesh.clone(),
            MeshSamplerConfig {
                num_sample: Some(self.num_collocation),
                collection_points: vec![RESIDUAL.into()],
                strategy: self.strategy,
                ..Default::default()
            },
            rng,
        )?;
        let mut builder = DataModule::builder()
            .add(Stage::Train, ic)
            .add(Stage::Train, bc)
            .add(Stage::Train, collocation);
        if self.inverse {
            let observation = MeshSampler::new(
                "observation",
                mesh.clone(),
                MeshSamplerConfig {
                    num_sample: Some(self.num_observation),
                    solution: vec![SOLUTION.into()],
                    strategy: self.strategy,
                    ..Default::default()
                },
                rng,
            )?;
            builder = builder.add(Stage::Train, observation);
        }
        let reference: Arc<dyn Condition> = Arc::new(MeshSampler::new(
            "reference",
            mesh.clone(),
            MeshSamplerConfig {
                solution: vec![SOLUTION.into()],
                ..Default::default()
            },
            rng,
        )?);
        builder
            .add_shared(Stage::Val, reference.clone())
            .add_shared(Stage::Test, reference.clone())
            .add_shared(Stage::Predict, reference)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Block;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn analytic_solution_is_periodic() {
        let spatial = SpatialDomain::from_interval(Interval::new([-1.0, 1.0], 21).unwrap()).unwrap();
        let time = TimeDomain::new([0.0, 1.0], 11).unwrap();
        let data = analytic_solution(&spatial, &time, 1.0).unwrap();
        let u = &data[SOLUTION];
        assert_eq!(u.dim(), (21, 11));
        for j in 0..11 {
            assert!((u[[0, j]] - u[[20, j]]).abs() < 1e-12);
        }
        assert!((u[[15, 0]] - (PI * 0.5).sin()).abs() < 1e-12);
    }

    #[test]
    fn default_experiment_layout() {
        let config = ExperimentConfig::default();
        let mesh = config.mesh().unwrap();
        assert_eq!(mesh.block_shape(0).unwrap(), (256, 101));
        let dm = config.datamodule(&mesh, &mut StdRng::seed_from_u64(0)).unwrap();
        let record = dm.record(Stage::Train).unwrap();
        assert_eq!(record.labels, vec!["ic", "bc", "collocation"]);
        assert_eq!(record.num_points(), 100 + 100 + 5000);
        assert_eq!(dm.record(Stage::Val).unwrap().num_points(), 256 * 101);
        assert!(dm.has(Stage::Predict));
    }

    #[test]
    fn initial_targets_follow_initial_fun() {
        let config = ExperimentConfig {
            x_points: 17,
            t_points: 5,
            num_initial: 8,
            num_boundary: 3,
            num_collocation: 10,
            ..Default::default()
        };
        let mesh = config.mesh().unwrap();
        let dm = config.datamodule(&mesh, &mut StdRng::seed_from_u64(3)).unwrap();
        let record = dm.record(Stage::Train).unwrap();
        let Block::Supervised { points, targets, .. } = record.blocks[0] else {
            panic!("初期条件は教師ありブロックのはずです");
        };
        for (row, &target) in targets[SOLUTION].iter().enumerate() {
            assert_eq!(points.time[row], 0.0);
            assert!((target - (PI * points.spatial[[row, 0]]).sin()).abs() < 1e-12);
        }
    }

    #[test]
    fn inverse_mode_adds_observations_and_speed() {
        let config = ExperimentConfig {
            x_points: 17,
            t_points: 5,
            num_initial: 8,
            num_boundary: 3,
            num_collocation: 10,
            num_observation: 12,
            inverse: true,
            ..Default::default()
        };
        let mesh = config.mesh().unwrap();
        let dm = config.datamodule(&mesh, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(dm.record(Stage::Train).unwrap().labels.last(), Some(&"observation"));
        assert_eq!(config.model_config().extra_names(), vec![SPEED.to_string()]);
        assert!(config.problem().learn_speed);
    }
}
