//! 解データを保持するメッシュと点群。
//!
//! どちらも構築後は読み取り専用で、`Arc<dyn PointSource>` として
//! 複数のサンプラーから共有されます。

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use tracing::debug;

use crate::domain::{BoundingBox, SpatialDomain, TimeDomain};
use crate::error::{BoxError, PinnError, Result};

/// 解変数名から `(空間点数, 時刻数)` の配列への対応。
pub type SolutionData = BTreeMap<String, Array2<f64>>;

/// サンプリングで切り出された点と、その点での解の値。
#[derive(Debug, Clone, PartialEq)]
pub struct PointBlock {
    /// `n × d` の空間座標。
    pub spatial: Array2<f64>,
    /// 長さ `n` の時刻。
    pub time: Array1<f64>,
    pub targets: BTreeMap<String, Array1<f64>>,
}

impl PointBlock {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// サンプラーが点を取り出すデータ源。
///
/// ブロックは空間点×時刻の直積で、平坦化したインデックスは
/// `s * num_time + t` です。
pub trait PointSource: fmt::Debug + Send + Sync {
    fn num_blocks(&self) -> usize;

    fn spatial_points(&self, block: usize) -> Result<ArrayView2<'_, f64>>;

    fn time_points(&self, block: usize) -> Result<ArrayView1<'_, f64>>;

    fn field(&self, block: usize, name: &str) -> Option<ArrayView2<'_, f64>>;

    fn field_names(&self) -> Vec<String>;

    fn domain_bounds(&self) -> &BoundingBox;

    fn spatial_dim(&self) -> usize {
        self.domain_bounds().dim() - 1
    }

    /// ブロックの `(空間点数, 時刻数)`。
    fn block_shape(&self, block: usize) -> Result<(usize, usize)> {
        Ok((
            self.spatial_points(block)?.nrows(),
            self.time_points(block)?.len(),
        ))
    }

    /// 指定した名前の解だけを取り出します。
    fn sample_fields(&self, block: usize, indices: &[usize], names: &[String]) -> Result<PointBlock> {
        let spatial_all = self.spatial_points(block)?;
        let time_all = self.time_points(block)?;
        let nt = time_all.len();
        let total = spatial_all.nrows() * nt;
        if let Some(&bad) = indices.iter().find(|&&i| i >= total) {
            return Err(PinnError::config(format!(
                "インデックス {bad} がブロック {block} の点数 {total} を超えています"
            )));
        }
        let spatial_idx: Vec<usize> = indices.iter().map(|i| i / nt).collect();
        let spatial = spatial_all.select(Axis(0), &spatial_idx);
        let time = Array1::from_iter(indices.iter().map(|i| time_all[i % nt]));
        let mut targets = BTreeMap::new();
        for name in names {
            let field = self.field(block, name).ok_or_else(|| {
                PinnError::config(format!("解 '{name}' がデータセットに存在しません"))
            })?;
            let values = Array1::from_iter(indices.iter().map(|i| field[[i / nt, i % nt]]));
            targets.insert(name.clone(), values);
        }
        Ok(PointBlock {
            spatial,
            time,
            targets,
        })
    }

    /// 全ての解変数を含めて取り出します。
    fn sample(&self, block: usize, indices: &[usize]) -> Result<PointBlock> {
        self.sample_fields(block, indices, &self.field_names())
    }
}

fn check_field_shapes(solution: &SolutionData, ns: usize, nt: usize, what: &str) -> Result<()> {
    for (name, field) in solution {
        if field.dim() != (ns, nt) {
            return Err(PinnError::config(format!(
                "{what}の解 '{name}' の形状 {:?} が宣言 ({ns}, {nt}) と一致しません",
                field.dim()
            )));
        }
    }
    Ok(())
}

fn check_bounds_dim(bounds: &BoundingBox, expected: usize) -> Result<()> {
    if bounds.dim() != expected {
        return Err(PinnError::config(format!(
            "境界の次元 {} が座標次元 {expected} と一致しません",
            bounds.dim()
        )));
    }
    Ok(())
}

/// 空間格子×時刻の直積メッシュ。
#[derive(Debug, Clone)]
pub struct Mesh {
    spatial: Array2<f64>,
    time: Array1<f64>,
    solution: SolutionData,
    bounds: BoundingBox,
}

impl Mesh {
    /// 読み込み関数で解データを取得し、メッシュを構築します。
    pub fn build<F>(
        spatial: &SpatialDomain,
        time: &TimeDomain,
        read_data_fn: F,
        root_dir: impl AsRef<Path>,
    ) -> Result<Self>
    where
        F: FnOnce(&Path) -> Result<SolutionData, BoxError>,
    {
        let root = root_dir.as_ref();
        let solution = read_data_fn(root).map_err(|source| PinnError::DataLoad {
            root: root.to_path_buf(),
            source,
        })?;
        Self::from_arrays(spatial.points().clone(), time.points(), solution)
    }

    pub fn from_arrays(spatial: Array2<f64>, time: Array1<f64>, solution: SolutionData) -> Result<Self> {
        if spatial.nrows() == 0 || spatial.ncols() == 0 || time.is_empty() {
            return Err(PinnError::config("メッシュの空間点または時刻が空です"));
        }
        check_field_shapes(&solution, spatial.nrows(), time.len(), "メッシュ")?;
        let bounds = BoundingBox::enclosing(&spatial, &time);
        debug!(
            spatial = spatial.nrows(),
            time = time.len(),
            fields = solution.len(),
            "メッシュを構築しました"
        );
        Ok(Self {
            spatial,
            time,
            solution,
            bounds,
        })
    }

    /// 領域の境界を明示的に上書きします。
    pub fn with_bounds(mut self, bounds: BoundingBox) -> Result<Self> {
        check_bounds_dim(&bounds, self.spatial.ncols() + 1)?;
        self.bounds = bounds;
        Ok(self)
    }

    pub fn num_spatial(&self) -> usize {
        self.spatial.nrows()
    }

    pub fn num_time(&self) -> usize {
        self.time.len()
    }

    /// 全格子点数。
    pub fn len(&self) -> usize {
        self.num_spatial() * self.num_time()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn solution(&self) -> &SolutionData {
        &self.solution
    }

    pub fn lb(&self) -> &[f64] {
        &self.bounds.lb
    }

    pub fn ub(&self) -> &[f64] {
        &self.bounds.ub
    }
}

impl PointSource for Mesh {
    fn num_blocks(&self) -> usize {
        1
    }

    fn spatial_points(&self, block: usize) -> Result<ArrayView2<'_, f64>> {
        single_block(block)?;
        Ok(self.spatial.view())
    }

    fn time_points(&self, block: usize) -> Result<ArrayView1<'_, f64>> {
        single_block(block)?;
        Ok(self.time.view())
    }

    fn field(&self, block: usize, name: &str) -> Option<ArrayView2<'_, f64>> {
        (block == 0).then(|| self.solution.get(name).map(|field| field.view())).flatten()
    }

    fn field_names(&self) -> Vec<String> {
        self.solution.keys().cloned().collect()
    }

    fn domain_bounds(&self) -> &BoundingBox {
        &self.bounds
    }
}

fn single_block(block: usize) -> Result<()> {
    if block != 0 {
        return Err(PinnError::config(format!(
            "メッシュにはブロック0しかありません (要求: {block})"
        )));
    }
    Ok(())
}

/// 点群の1ブロック（例えば境界の一部分）。
#[derive(Debug, Clone)]
pub struct CloudBlock {
    pub spatial: Array2<f64>,
    pub time: Array1<f64>,
    pub solution: SolutionData,
}

/// 格子に乗らない散在した時空間データ。
#[derive(Debug, Clone)]
pub struct PointCloud {
    blocks: Vec<CloudBlock>,
    bounds: BoundingBox,
}

impl PointCloud {
    pub fn build<F>(read_data_fn: F, root_dir: impl AsRef<Path>) -> Result<Self>
    where
        F: FnOnce(&Path) -> Result<Vec<CloudBlock>, BoxError>,
    {
        let root = root_dir.as_ref();
        let blocks = read_data_fn(root).map_err(|source| PinnError::DataLoad {
            root: root.to_path_buf(),
            source,
        })?;
        Self::from_blocks(blocks)
    }

    pub fn from_blocks(blocks: Vec<CloudBlock>) -> Result<Self> {
        let first = blocks
            .first()
            .ok_or_else(|| PinnError::config("点群にブロックがありません"))?;
        let dim = first.spatial.ncols();
        let mut bounds: Option<BoundingBox> = None;
        for (i, block) in blocks.iter().enumerate() {
            if block.spatial.ncols() != dim {
                return Err(PinnError::config(format!(
                    "ブロック {i} の空間次元 {} が {dim} と一致しません",
                    block.spatial.ncols()
                )));
            }
            if block.spatial.nrows() == 0 || block.time.is_empty() {
                return Err(PinnError::config(format!("ブロック {i} が空です")));
            }
            check_field_shapes(
                &block.solution,
                block.spatial.nrows(),
                block.time.len(),
                &format!("ブロック {i} "),
            )?;
            let enclosing = BoundingBox::enclosing(&block.spatial, &block.time);
            bounds = Some(match bounds {
                Some(acc) => acc.union(&enclosing)?,
                None => enclosing,
            });
        }
        let bounds = bounds.ok_or_else(|| PinnError::config("点群にブロックがありません"))?;
        Ok(Self { blocks, bounds })
    }

    pub fn with_bounds(mut self, bounds: BoundingBox) -> Result<Self> {
        check_bounds_dim(&bounds, self.bounds.dim())?;
        self.bounds = bounds;
        Ok(self)
    }

    pub fn blocks(&self) -> &[CloudBlock] {
        &self.blocks
    }

    fn block(&self, block: usize) -> Result<&CloudBlock> {
        self.blocks.get(block).ok_or_else(|| {
            PinnError::config(format!(
                "ブロック {block} は存在しません (ブロック数 {})",
                self.blocks.len()
            ))
        })
    }
}

impl PointSource for PointCloud {
    fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn spatial_points(&self, block: usize) -> Result<ArrayView2<'_, f64>> {
        Ok(self.block(block)?.spatial.view())
    }

    fn time_points(&self, block: usize) -> Result<ArrayView1<'_, f64>> {
        Ok(self.block(block)?.time.view())
    }

    fn field(&self, block: usize, name: &str) -> Option<ArrayView2<'_, f64>> {
        self.blocks
            .get(block)
            .and_then(|b| b.solution.get(name))
            .map(|field| field.view())
    }

    fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .blocks
            .iter()
            .flat_map(|b| b.solution.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn sample(&self, block: usize, indices: &[usize]) -> Result<PointBlock> {
        let names: Vec<String> = self.block(block)?.solution.keys().cloned().collect();
        self.sample_fields(block, indices, &names)
    }

    fn domain_bounds(&self) -> &BoundingBox {
        &self.bounds
    }
}
