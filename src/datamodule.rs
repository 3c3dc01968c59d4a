//! 条件をフェーズ（train / val / test / predict）ごとに束ねるデータモジュール。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::condition::{Block, Condition};
use crate::domain::BoundingBox;
use crate::error::{PinnError, Result};

/// 学習のフェーズ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Train,
    Val,
    Test,
    Predict,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
            Self::Predict => "predict",
        };
        f.write_str(name)
    }
}

/// 損失項の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossGroup {
    /// データセットの値へ回帰。
    Direct,
    /// `pde_fn` の残差をゼロへ回帰。
    Residual,
    /// 周期境界での下端・上端の差をゼロへ回帰。
    BoundaryMatch { order: usize },
}

/// 1つの損失項。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossTerm {
    /// `SplitRecord::blocks` 内の位置。
    pub block: usize,
    pub name: String,
    pub group: LossGroup,
}

impl LossTerm {
    /// ブロックが持つ損失項を並べます。周期境界は階数ごとに全出力を並べます。
    pub fn of_block(index: usize, block: &Block) -> Vec<Self> {
        let term = |name: &String, group| Self {
            block: index,
            name: name.clone(),
            group,
        };
        match block {
            Block::Supervised { targets, residuals, .. } => targets
                .keys()
                .map(|name| term(name, LossGroup::Direct))
                .chain(residuals.iter().map(|name| term(name, LossGroup::Residual)))
                .collect(),
            Block::Periodic {
                outputs,
                derivative_order,
                ..
            } => (0..=*derivative_order)
                .flat_map(|order| outputs.iter().map(move |name| (name, order)))
                .map(|(name, order)| term(name, LossGroup::BoundaryMatch { order }))
                .collect(),
        }
    }

    pub fn label(&self, block_label: &str) -> String {
        match self.group {
            LossGroup::BoundaryMatch { order } => format!("{block_label}/{}/d{order}", self.name),
            _ => format!("{block_label}/{}", self.name),
        }
    }
}

/// 1フェーズ分をまとめたレコード。ブロックの区切りはそのまま保持します。
#[derive(Debug, Clone)]
pub struct SplitRecord<'a> {
    pub labels: Vec<&'a str>,
    pub blocks: Vec<&'a Block>,
    pub terms: Vec<LossTerm>,
}

impl SplitRecord<'_> {
    /// 全ブロックの点数の合計。
    pub fn num_points(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// フェーズごとの条件の集まり。構築後は変更されません。
#[derive(Debug, Default, Clone)]
pub struct DataModule {
    splits: BTreeMap<Stage, Vec<Arc<dyn Condition>>>,
}

impl DataModule {
    pub fn builder() -> DataModuleBuilder {
        DataModuleBuilder::default()
    }

    pub fn conditions(&self, stage: Stage) -> &[Arc<dyn Condition>] {
        self.splits.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has(&self, stage: Stage) -> bool {
        !self.conditions(stage).is_empty()
    }

    /// フェーズのレコードを作ります。毎回同じ内容を返します。
    pub fn record(&self, stage: Stage) -> Result<SplitRecord<'_>> {
        let conditions = self.conditions(stage);
        if conditions.is_empty() {
            return Err(PinnError::config(format!("{stage} フェーズに条件がありません")));
        }
        let mut record = SplitRecord {
            labels: Vec::with_capacity(conditions.len()),
            blocks: Vec::with_capacity(conditions.len()),
            terms: Vec::new(),
        };
        for (index, condition) in conditions.iter().enumerate() {
            let block = condition.block();
            record.terms.extend(LossTerm::of_block(index, block));
            record.labels.push(condition.label());
            record.blocks.push(block);
        }
        Ok(record)
    }

    /// フェーズ内の全データ源を覆う領域。
    pub fn bounds(&self, stage: Stage) -> Result<BoundingBox> {
        let mut bounds: Option<BoundingBox> = None;
        for condition in self.conditions(stage) {
            let b = condition.source().domain_bounds();
            bounds = Some(match bounds {
                Some(acc) => acc.union(b)?,
                None => b.clone(),
            });
        }
        bounds.ok_or_else(|| PinnError::config(format!("{stage} フェーズに条件がありません")))
    }
}

#[derive(Debug, Default)]
pub struct DataModuleBuilder {
    splits: BTreeMap<Stage, Vec<Arc<dyn Condition>>>,
}

impl DataModuleBuilder {
    pub fn add(mut self, stage: Stage, condition: impl Condition + 'static) -> Self {
        self.splits.entry(stage).or_default().push(Arc::new(condition));
        self
    }

    /// 同じ条件を複数のフェーズで共有する場合に使います。
    pub fn add_shared(mut self, stage: Stage, condition: Arc<dyn Condition>) -> Self {
        self.splits.entry(stage).or_default().push(condition);
        self
    }

    pub fn build(self) -> Result<DataModule> {
        for (stage, conditions) in &self.splits {
            let mut labels: Vec<&str> = conditions.iter().map(|c| c.label()).collect();
            labels.sort_unstable();
            if let Some(w) = labels.windows(2).find(|w| w[0] == w[1]) {
                return Err(PinnError::config(format!(
                    "{stage} フェーズでラベル '{}' が重複しています",
                    w[0]
                )));
            }
            let mut dims = conditions.iter().map(|c| c.block().spatial_dim());
            if let Some(first) = dims.next() {
                if dims.any(|d| d != first) {
                    return Err(PinnError::config(format!(
                        "{stage} フェーズに空間次元の異なる条件が混在しています"
                    )));
                }
            }
        }
        Ok(DataModule { splits: self.splits })
    }
}
