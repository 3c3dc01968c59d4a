use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Block, Condition, Points, check_block, check_unique};
use crate::error::{PinnError, Result};
use crate::mesh::PointSource;
use crate::sampling::{self, SamplingStrategy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicBoundaryConditionConfig {
    /// 抽出する時刻数。`None` なら全時刻。
    pub num_sample: Option<usize>,
    pub solution: Vec<String>,
    /// 0 なら値のみ、k なら 0..=k 階の微分まで一致させます。
    pub derivative_order: usize,
    /// 微分を取る空間軸。
    pub axis: usize,
    pub block: usize,
    pub strategy: SamplingStrategy,
}

/// 空間領域の両端で出力を一致させる周期境界条件。
pub struct PeriodicBoundaryCondition {
    label: String,
    source: Arc<dyn PointSource>,
    indices: Vec<usize>,
    block: Block,
}

impl PeriodicBoundaryCondition {
    pub fn new<R: Rng + ?Sized>(
        label: impl Into<String>,
        source: Arc<dyn PointSource>,
        config: PeriodicBoundaryConditionConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let label = label.into();
        if config.solution.is_empty() {
            return Err(PinnError::config(format!("{label}: solution が空です")));
        }
        check_unique("solution", &config.solution)?;
        check_block(source.as_ref(), config.block)?;
        let dim = source.spatial_dim();
        if config.axis >= dim {
            return Err(PinnError::config(format!(
                "{label}: 軸 {} は空間次元 {dim} の範囲外です",
                config.axis
            )));
        }

        let time_all = source.time_points(config.block)?;
        let indices = sampling::draw_flat(rng, &[time_all.len()], config.num_sample, config.strategy)?;
        let time = Array1::from_iter(indices.iter().map(|&i| time_all[i]));
        let bounds = source.domain_bounds();
        let edge = |values: &[f64]| {
            Array2::from_shape_fn((indices.len(), dim), |(_, axis)| values[axis])
        };
        let lower = Points::new(edge(bounds.spatial_lb()), time.clone())?;
        let upper = Points::new(edge(bounds.spatial_ub()), time)?;

        debug!(
            label = %label,
            points = indices.len(),
            order = config.derivative_order,
            "周期境界条件を抽出しました"
        );
        Ok(Self {
            label,
            source,
            indices,
            block: Block::Periodic {
                lower,
                upper,
                outputs: config.solution,
                derivative_order: config.derivative_order,
                axis: config.axis,
            },
        })
    }
}

impl fmt::Debug for PeriodicBoundaryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicBoundaryCondition")
            .field("label", &self.label)
            .field("points", &self.block.len())
            .finish()
    }
}

impl Condition for PeriodicBoundaryCondition {
    fn label(&self) -> &str {
        &self.label
    }

    fn block(&self) -> &Block {
        &self.block
    }

    fn source(&self) -> &Arc<dyn PointSource> {
        &self.source
    }

    /// 抽出した時刻のインデックス。
    fn indices(&self) -> &[usize] {
        &self.indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::test_support::linear_mesh;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn pairs_domain_extremes_with_shared_times() {
        let mut rng = StdRng::seed_from_u64(5);
        let config = PeriodicBoundaryConditionConfig {
            num_sample: Some(6),
            solution: vec!["u".into()],
            derivative_order: 1,
            ..Default::default()
        };
        let bc = PeriodicBoundaryCondition::new("bc", linear_mesh(4, 11), config, &mut rng).unwrap();
        let Block::Periodic { lower, upper, derivative_order, .. } = bc.block() else {
            panic!("periodic block expected");
        };
        assert_eq!(*derivative_order, 1);
        assert_eq!(lower.len(), 6);
        assert!(lower.spatial.iter().all(|&x| x == -1.0));
        assert!(upper.spatial.iter().all(|&x| x == 1.0));
        assert_eq!(lower.time, upper.time);
        assert_eq!(bc.indices().len(), 6);
    }

    #[test]
    fn axis_out_of_range_fails() {
        let mut rng = StdRng::seed_from_u64(6);
        let config = PeriodicBoundaryConditionConfig {
            solution: vec!["u".into()],
            axis: 1,
            ..Default::default()
        };
        assert!(PeriodicBoundaryCondition::new("bc", linear_mesh(4, 4), config, &mut rng).is_err());
    }
}
