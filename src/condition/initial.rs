use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Block, Condition, Points, check_block, check_unique};
use crate::error::{PinnError, Result};
use crate::mesh::PointSource;
use crate::sampling::{self, SamplingStrategy};

/// 空間座標から解の初期値を返す関数。
pub type InitialFn = dyn Fn(&[f64]) -> BTreeMap<String, f64> + Send + Sync;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialConditionConfig {
    /// 抽出する点数。`None` なら初期時刻の全空間点。
    pub num_sample: Option<usize>,
    pub solution: Vec<String>,
    pub block: usize,
    pub strategy: SamplingStrategy,
}

/// 初期時刻の断面から点を抽出する条件。
///
/// `initial_fun` が与えられた場合、目標値はデータセットではなく関数から求めます。
pub struct InitialCondition {
    label: String,
    source: Arc<dyn PointSource>,
    indices: Vec<usize>,
    block: Block,
}

impl InitialCondition {
    pub fn new<R: Rng + ?Sized>(
        label: impl Into<String>,
        source: Arc<dyn PointSource>,
        config: InitialConditionConfig,
        initial_fun: Option<Arc<InitialFn>>,
        rng: &mut R,
    ) -> Result<Self> {
        let label = label.into();
        if config.solution.is_empty() {
            return Err(PinnError::config(format!("{label}: solution が空です")));
        }
        check_unique("solution", &config.solution)?;
        check_block(source.as_ref(), config.block)?;
        let (ns, nt) = source.block_shape(config.block)?;

        if initial_fun.is_none() {
            if let Some(name) = config.solution.iter().find(|n| source.field(config.block, n).is_none()) {
                return Err(PinnError::config(format!(
                    "{label}: 解 '{name}' はデータセットになく、initial_fun もありません"
                )));
            }
        }

        let indices = sampling::draw_flat(rng, &[ns], config.num_sample, config.strategy)?;
        let block = match &initial_fun {
            Some(fun) => {
                let spatial = source.spatial_points(config.block)?.select(Axis(0), &indices);
                let t0 = source.time_points(config.block)?[0];
                let mut targets: BTreeMap<String, Vec<f64>> = config
                    .solution
                    .iter()
                    .map(|name| (name.clone(), Vec::with_capacity(indices.len())))
                    .collect();
                for row in spatial.rows() {
                    let x = row.to_vec();
                    let values = (fun.as_ref())(&x);
                    for (name, column) in targets.iter_mut() {
                        let value = values.get(name).ok_or_else(|| {
                            PinnError::config(format!(
                                "{label}: initial_fun が解 '{name}' を返しませんでした"
                            ))
                        })?;
                        column.push(*value);
                    }
                }
                let time = Array1::from_elem(indices.len(), t0);
                Block::Supervised {
                    points: Points::new(spatial, time)?,
                    targets: targets.into_iter().map(|(k, v)| (k, Array1::from(v))).collect(),
                    residuals: Vec::new(),
                }
            }
            None => {
                let flat: Vec<usize> = indices.iter().map(|s| s * nt).collect();
                let sampled = source.sample_fields(config.block, &flat, &config.solution)?;
                Block::Supervised {
                    points: Points::new(sampled.spatial, sampled.time)?,
                    targets: sampled.targets,
                    residuals: Vec::new(),
                }
            }
        };
        debug!(label = %label, points = block.len(), "初期条件を抽出しました");
        Ok(Self {
            label,
            source,
            indices,
            block,
        })
    }
}

impl fmt::Debug for InitialCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitialCondition")
            .field("label", &self.label)
            .field("points", &self.block.len())
            .finish()
    }
}

impl Condition for InitialCondition {
    fn label(&self) -> &str {
        &self.label
    }

    fn block(&self) -> &Block {
        &self.block
    }

    fn source(&self) -> &Arc<dyn PointSource> {
        &self.source
    }

    /// 抽出した空間点のインデックス。
    fn indices(&self) -> &[usize] {
        &self.indices
    }
}
