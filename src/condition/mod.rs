//! 学習データを切り出す条件（初期条件・周期境界条件・メッシュサンプラー）。
//!
//! どの条件も構築時に一度だけ点を抽出し、以後は同じ点集合を使い続けます。
//! エポックごとの再抽出は行いません。

mod initial;
mod mesh_sampler;
mod periodic;

pub use initial::{InitialCondition, InitialConditionConfig, InitialFn};
pub use mesh_sampler::{MeshSampler, MeshSamplerConfig};
pub use periodic::{PeriodicBoundaryCondition, PeriodicBoundaryConditionConfig};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array2};

use crate::error::{PinnError, Result};
use crate::mesh::PointSource;

/// 入力座標の集合。
#[derive(Debug, Clone, PartialEq)]
pub struct Points {
    /// `n × d` の空間座標。
    pub spatial: Array2<f64>,
    pub time: Array1<f64>,
}

impl Points {
    pub fn new(spatial: Array2<f64>, time: Array1<f64>) -> Result<Self> {
        if spatial.nrows() != time.len() {
            return Err(PinnError::config(format!(
                "空間座標 {} 点と時刻 {} 点の数が一致しません",
                spatial.nrows(),
                time.len()
            )));
        }
        Ok(Self { spatial, time })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn spatial_dim(&self) -> usize {
        self.spatial.ncols()
    }

    /// 空間座標の後ろに時刻を並べた `n × (d + 1)` の行優先データ。
    pub fn to_row_major(&self) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.len() * (self.spatial_dim() + 1));
        for (row, &t) in self.spatial.rows().into_iter().zip(&self.time) {
            values.extend(row.iter().map(|&x| x as f32));
            values.push(t as f32);
        }
        values
    }
}

/// 条件が学習に供給するデータ。
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    /// データ値への回帰と、`pde_fn` の残差をゼロへ回帰させる項。
    Supervised {
        points: Points,
        targets: BTreeMap<String, Array1<f64>>,
        residuals: Vec<String>,
    },
    /// 下端と上端での出力（とその微分）を一致させる項。
    Periodic {
        lower: Points,
        upper: Points,
        outputs: Vec<String>,
        derivative_order: usize,
        axis: usize,
    },
}

impl Block {
    pub fn len(&self) -> usize {
        match self {
            Self::Supervised { points, .. } => points.len(),
            Self::Periodic { lower, .. } => lower.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spatial_dim(&self) -> usize {
        match self {
            Self::Supervised { points, .. } => points.spatial_dim(),
            Self::Periodic { lower, .. } => lower.spatial_dim(),
        }
    }
}

/// データモジュールに登録できる条件。
pub trait Condition: fmt::Debug + Send + Sync {
    fn label(&self) -> &str;

    fn block(&self) -> &Block;

    fn source(&self) -> &Arc<dyn PointSource>;

    /// 抽出したインデックス（条件ごとに意味が異なります）。
    fn indices(&self) -> &[usize];

    fn len(&self) -> usize {
        self.block().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 名前の重複を検査します。
fn check_unique(kind: &str, names: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(PinnError::config(format!("{kind} に '{name}' が重複しています")));
        }
    }
    Ok(())
}

fn check_block(source: &dyn PointSource, block: usize) -> Result<()> {
    if block >= source.num_blocks() {
        return Err(PinnError::config(format!(
            "ブロック {block} は存在しません (ブロック数 {})",
            source.num_blocks()
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use ndarray::Array2;

    use crate::domain::{Interval, SpatialDomain, TimeDomain};
    use crate::mesh::{Mesh, PointSource, SolutionData};

    /// `u(x, t) = x + 10 t`, `v = 2u` の小さなメッシュ。
    pub fn linear_mesh(nx: usize, nt: usize) -> Arc<dyn PointSource> {
        let spatial = SpatialDomain::from_interval(Interval::new([-1.0, 1.0], nx).unwrap()).unwrap();
        let time = TimeDomain::new([0.0, 1.0], nt).unwrap();
        let xs = spatial.points().column(0).to_owned();
        let ts = time.points();
        let u = Array2::from_shape_fn((nx, nt), |(i, j)| xs[i] + 10.0 * ts[j]);
        let v = u.mapv(|x| 2.0 * x);
        let mut data = SolutionData::new();
        data.insert("u".into(), u);
        data.insert("v".into(), v);
        Arc::new(Mesh::build(&spatial, &time, move |_| Ok(data), ".").unwrap())
    }
}
