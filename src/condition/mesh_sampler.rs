use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Block, Condition, Points, check_block, check_unique};
use crate::error::{PinnError, Result};
use crate::mesh::PointSource;
use crate::sampling::{self, SamplingStrategy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSamplerConfig {
    /// 抽出する点数。`None` ならブロック（または時刻断面）全体。
    pub num_sample: Option<usize>,
    /// データセットの値へ直接回帰させる解の名前。
    pub solution: Vec<String>,
    /// `pde_fn` が生成する残差の名前。目標値は常にゼロ。
    pub collection_points: Vec<String>,
    /// 指定した時刻インデックスの断面だけから抽出します。
    pub idx_t: Option<usize>,
    pub block: usize,
    pub strategy: SamplingStrategy,
}

/// メッシュ・点群から汎用的に点を抽出するサンプラー。
pub struct MeshSampler {
    label: String,
    source: Arc<dyn PointSource>,
    indices: Vec<usize>,
    block: Block,
}

impl MeshSampler {
    pub fn new<R: Rng + ?Sized>(
        label: impl Into<String>,
        source: Arc<dyn PointSource>,
        config: MeshSamplerConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let label = label.into();
        check_unique("solution", &config.solution)?;
        check_unique("collection_points", &config.collection_points)?;
        let solution: BTreeSet<&String> = config.solution.iter().collect();
        if let Some(name) = config.collection_points.iter().find(|n| solution.contains(n)) {
            return Err(PinnError::config(format!(
                "{label}: '{name}' が solution と collection_points の両方に指定されています"
            )));
        }
        check_block(source.as_ref(), config.block)?;
        if let Some(name) = config.solution.iter().find(|n| source.field(config.block, n).is_none()) {
            return Err(PinnError::config(format!(
                "{label}: 解 '{name}' がデータセットに存在しません"
            )));
        }

        let (ns, nt) = source.block_shape(config.block)?;
        let indices = match config.idx_t {
            Some(idx_t) if idx_t >= nt => {
                return Err(PinnError::config(format!(
                    "{label}: idx_t {idx_t} が時刻数 {nt} を超えています"
                )));
            }
            Some(idx_t) => sampling::draw_flat(rng, &[ns], config.num_sample, config.strategy)?
                .into_iter()
                .map(|s| s * nt + idx_t)
                .collect(),
            None => sampling::draw_flat(rng, &[ns, nt], config.num_sample, config.strategy)?,
        };
        let sampled = source.sample_fields(config.block, &indices, &config.solution)?;
        debug!(
            label = %label,
            points = indices.len(),
            solution = ?config.solution,
            collection_points = ?config.collection_points,
            "メッシュから点を抽出しました"
        );
        Ok(Self {
            label,
            source,
            indices,
            block: Block::Supervised {
                points: Points::new(sampled.spatial, sampled.time)?,
                targets: sampled.targets,
                residuals: config.collection_points,
            },
        })
    }
}

impl fmt::Debug for MeshSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshSampler")
            .field("label", &self.label)
            .field("points", &self.block.len())
            .finish()
    }
}

impl Condition for MeshSampler {
    fn label(&self) -> &str {
        &self.label
    }

    fn block(&self) -> &Block {
        &self.block
    }

    fn source(&self) -> &Arc<dyn PointSource> {
        &self.source
    }

    /// 抽出した格子点の平坦インデックス（`s * num_time + t`）。
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

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn draws_requested_count() {
        let mut rng = StdRng::seed_from_u64(8);
        let config = MeshSamplerConfig {
            num_sample: Some(17),
            solution: names(&["u"]),
            collection_points: names(&["f"]),
            ..Default::default()
        };
        let sampler = MeshSampler::new("col", linear_mesh(6, 5), config, &mut rng).unwrap();
        assert_eq!(sampler.len(), 17);
        let Block::Supervised { points, targets, residuals } = sampler.block() else {
            panic!("supervised block expected");
        };
        assert_eq!(residuals, &names(&["f"]));
        for ((x, t), u) in points.spatial.column(0).iter().zip(&points.time).zip(&targets["u"]) {
            approx::assert_relative_eq!(*u, x + 10.0 * t, epsilon = 1e-12);
        }
    }

    #[test]
    fn time_slice_uses_single_stamp() {
        let mut rng = StdRng::seed_from_u64(9);
        let config = MeshSamplerConfig {
            solution: names(&["v"]),
            idx_t: Some(2),
            ..Default::default()
        };
        let sampler = MeshSampler::new("slice", linear_mesh(6, 5), config, &mut rng).unwrap();
        let Block::Supervised { points, .. } = sampler.block() else {
            panic!("supervised block expected");
        };
        assert_eq!(points.len(), 6);
        assert!(points.time.iter().all(|&t| t == 0.5));

        let bad = MeshSamplerConfig {
            idx_t: Some(5),
            ..Default::default()
        };
        assert!(MeshSampler::new("slice", linear_mesh(6, 5), bad, &mut rng).is_err());
    }

    #[test]
    fn overlapping_names_are_rejected() {
        let mut rng = StdRng::seed_from_u64(10);
        let config = MeshSamplerConfig {
            solution: names(&["u"]),
            collection_points: names(&["u"]),
            ..Default::default()
        };
        let err = MeshSampler::new("bad", linear_mesh(3, 3), config, &mut rng).unwrap_err();
        assert!(matches!(err, PinnError::Configuration(_)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut rng = StdRng::seed_from_u64(11);
        let config = MeshSamplerConfig {
            collection_points: names(&["f", "f"]),
            ..Default::default()
        };
        assert!(MeshSampler::new("bad", linear_mesh(3, 3), config, &mut rng).is_err());
    }
}
