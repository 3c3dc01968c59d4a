//! 全ブロックの損失項を1つのスカラー損失にまとめます。

use std::collections::BTreeMap;

use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::condition::{Block, Points};
use crate::datamodule::{LossGroup, LossTerm, SplitRecord};
use crate::error::{PinnError, Result};
use crate::physics::{Axis, Evaluator, ExtraValues, Outputs, PdeContext, Problem};

/// 損失の縮約方法。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFn {
    /// 二乗誤差の平均。
    #[default]
    Mse,
    /// 二乗誤差の総和。
    Sse,
}

impl LossFn {
    pub fn reduce<B: Backend>(&self, prediction: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        let reduction = match self {
            Self::Mse => Reduction::Mean,
            Self::Sse => Reduction::Sum,
        };
        MseLoss::new().forward(prediction, target, reduction)
    }
}

/// デバイス上に置いた入力座標（`n × (d + 1)`）。
#[derive(Debug, Clone)]
pub struct DevicePoints<B: Backend> {
    pub input: Tensor<B, 2>,
}

impl<B: Backend> DevicePoints<B> {
    pub fn new(points: &Points, device: &B::Device) -> Self {
        let cols = points.spatial_dim() + 1;
        let input = Tensor::from_data(TensorData::new(points.to_row_major(), [points.len(), cols]), device);
        Self { input }
    }

    pub fn len(&self) -> usize {
        self.input.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn column<B: Backend>(values: &ndarray::Array1<f64>, device: &B::Device) -> Tensor<B, 2> {
    let data: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    Tensor::from_data(TensorData::new(data, [values.len(), 1]), device)
}

/// デバイス上のブロックが受け持つ1つの損失項。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTerm {
    /// 学習ログや指標に使う `LossTerm::label` の値。
    pub label: String,
    pub name: String,
    pub group: LossGroup,
}

/// 学習ステップの間ずっと再利用する、デバイス上のブロック。
#[derive(Debug, Clone)]
pub enum DeviceBlock<B: Backend> {
    Supervised {
        label: String,
        points: DevicePoints<B>,
        targets: BTreeMap<String, Tensor<B, 2>>,
        terms: Vec<DeviceTerm>,
    },
    Periodic {
        label: String,
        lower: DevicePoints<B>,
        upper: DevicePoints<B>,
        axis: usize,
        terms: Vec<DeviceTerm>,
    },
}

impl<B: Backend> DeviceBlock<B> {
    /// `terms` はこのブロックの項（`SplitRecord::terms` の該当部分）。
    pub fn upload(label: &str, block: &Block, terms: &[LossTerm], device: &B::Device) -> Self {
        let terms = terms
            .iter()
            .map(|term| DeviceTerm {
                label: term.label(label),
                name: term.name.clone(),
                group: term.group,
            })
            .collect();
        match block {
            Block::Supervised { points, targets, .. } => Self::Supervised {
                label: label.to_string(),
                points: DevicePoints::new(points, device),
                targets: targets
                    .iter()
                    .map(|(name, values)| (name.clone(), column(values, device)))
                    .collect(),
                terms,
            },
            Block::Periodic { lower, upper, axis, .. } => Self::Periodic {
                label: label.to_string(),
                lower: DevicePoints::new(lower, device),
                upper: DevicePoints::new(upper, device),
                axis: *axis,
                terms,
            },
        }
    }

    /// レコード全体をアップロードします。
    pub fn upload_all(record: &SplitRecord<'_>, device: &B::Device) -> Vec<Self> {
        record
            .labels
            .iter()
            .zip(&record.blocks)
            .enumerate()
            .map(|(index, (label, block))| {
                let terms: Vec<LossTerm> = record.terms.iter().filter(|t| t.block == index).cloned().collect();
                Self::upload(label, block, &terms, device)
            })
            .collect()
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Supervised { label, .. } | Self::Periodic { label, .. } => label,
        }
    }

    pub fn terms(&self) -> &[DeviceTerm] {
        match self {
            Self::Supervised { terms, .. } | Self::Periodic { terms, .. } => terms,
        }
    }
}

/// 教師ありブロックでの出力と残差の評価結果。
pub(crate) struct SupervisedValues<B: Backend> {
    pub outputs: BTreeMap<String, Tensor<B, 2>>,
    pub residuals: BTreeMap<String, Tensor<B, 2>>,
}

impl<B: Backend> SupervisedValues<B> {
    /// 残差の項があるときだけ `pde_fn` を呼びます。
    pub fn evaluate<P: Problem>(
        evaluator: &Evaluator<'_, B>,
        problem: &P,
        extra: &ExtraValues<B>,
        points: &DevicePoints<B>,
        terms: &[DeviceTerm],
    ) -> Result<Self> {
        let output_fn = |o: &mut Outputs<B>| problem.output_fn(o);
        let direct = terms.iter().filter(|t| t.group == LossGroup::Direct).map(|t| t.name.as_str());
        if terms.iter().any(|t| t.group == LossGroup::Residual) {
            let mut ctx = PdeContext::new(evaluator, &output_fn, extra, points.input.clone())?;
            problem.pde_fn(&mut ctx)?;
            let residuals: BTreeMap<String, Tensor<B, 2>> = terms
                .iter()
                .filter(|t| t.group == LossGroup::Residual)
                .map(|t| Ok((t.name.clone(), ctx.residual(&t.name)?)))
                .collect::<Result<_>>()?;
            Ok(Self {
                outputs: collect(ctx.outputs(), direct)?,
                residuals,
            })
        } else {
            let mut outputs = evaluator.outputs(&points.input, None, 0)?;
            output_fn(&mut outputs)?;
            Ok(Self {
                outputs: collect(&outputs, direct)?,
                residuals: BTreeMap::new(),
            })
        }
    }

    pub fn get(&self, term: &DeviceTerm) -> Result<Tensor<B, 2>> {
        let values = match term.group {
            LossGroup::Residual => &self.residuals,
            _ => &self.outputs,
        };
        values
            .get(&term.name)
            .cloned()
            .ok_or_else(|| PinnError::config(format!("'{}' の値がありません", term.label)))
    }
}

/// 1つの損失項の値。
#[derive(Debug, Clone)]
pub struct TermLoss<B: Backend> {
    pub label: String,
    pub rows: usize,
    pub loss: Tensor<B, 1>,
}

/// 合計損失と項ごとの内訳。
#[derive(Debug, Clone)]
pub struct LossBreakdown<B: Backend> {
    pub total: Tensor<B, 1>,
    pub terms: Vec<TermLoss<B>>,
}

/// 損失の組み立てに必要なものをまとめた構造体。
pub struct LossAssembler<'a, B: Backend, P: Problem> {
    pub evaluator: Evaluator<'a, B>,
    pub problem: &'a P,
    pub extra: &'a ExtraValues<B>,
    pub loss_fn: LossFn,
}

impl<B: Backend, P: Problem> LossAssembler<'_, B, P> {
    /// 全ブロックの項を等しい重みで足し合わせます。
    pub fn assemble(&self, blocks: &[DeviceBlock<B>]) -> Result<LossBreakdown<B>> {
        let mut terms = Vec::new();
        for block in blocks {
            match block {
                DeviceBlock::Supervised {
                    points, targets, terms: slots, ..
                } => self.supervised(points, targets, slots, &mut terms)?,
                DeviceBlock::Periodic {
                    lower,
                    upper,
                    axis,
                    terms: slots,
                    ..
                } => self.periodic(lower, upper, *axis, slots, &mut terms)?,
            }
        }
        let total = terms
            .iter()
            .map(|t| t.loss.clone())
            .reduce(|a, b| a + b)
            .ok_or_else(|| PinnError::config("損失項が1つもありません"))?;
        Ok(LossBreakdown { total, terms })
    }

    fn supervised(
        &self,
        points: &DevicePoints<B>,
        targets: &BTreeMap<String, Tensor<B, 2>>,
        slots: &[DeviceTerm],
        terms: &mut Vec<TermLoss<B>>,
    ) -> Result<()> {
        let values = SupervisedValues::evaluate(&self.evaluator, self.problem, self.extra, points, slots)?;
        for slot in slots {
            let prediction = values.get(slot)?;
            let target = match slot.group {
                LossGroup::Direct => targets
                    .get(&slot.name)
                    .cloned()
                    .ok_or_else(|| PinnError::config(format!("'{}' の目標値がありません", slot.label)))?,
                _ => prediction.zeros_like(),
            };
            terms.push(TermLoss {
                label: slot.label.clone(),
                rows: points.len(),
                loss: self.loss_fn.reduce(prediction, target),
            });
        }
        Ok(())
    }

    fn periodic(
        &self,
        lower: &DevicePoints<B>,
        upper: &DevicePoints<B>,
        axis: usize,
        slots: &[DeviceTerm],
        terms: &mut Vec<TermLoss<B>>,
    ) -> Result<()> {
        for (slot, a, b) in boundary_pairs(&self.evaluator, self.problem, self.extra, lower, upper, axis, slots)? {
            terms.push(TermLoss {
                label: slot.label.clone(),
                rows: lower.len(),
                loss: self.loss_fn.reduce(a, b),
            });
        }
        Ok(())
    }
}

/// 周期境界の各項について、下端・上端での `axis` 方向の導関数を組にします。
pub(crate) fn boundary_pairs<'t, B: Backend, P: Problem>(
    evaluator: &Evaluator<'_, B>,
    problem: &P,
    extra: &ExtraValues<B>,
    lower: &DevicePoints<B>,
    upper: &DevicePoints<B>,
    axis: usize,
    slots: &'t [DeviceTerm],
) -> Result<Vec<(&'t DeviceTerm, Tensor<B, 2>, Tensor<B, 2>)>> {
    let output_fn = |o: &mut Outputs<B>| problem.output_fn(o);
    let mut lo = PdeContext::new(evaluator, &output_fn, extra, lower.input.clone())?;
    let mut hi = PdeContext::new(evaluator, &output_fn, extra, upper.input.clone())?;
    slots
        .iter()
        .map(|slot| {
            let LossGroup::BoundaryMatch { order } = slot.group else {
                return Err(PinnError::config(format!("'{}' は周期境界の項ではありません", slot.label)));
            };
            let a = lo.derivative(&slot.name, Axis::Space(axis), order)?;
            let b = hi.derivative(&slot.name, Axis::Space(axis), order)?;
            Ok((slot, a, b))
        })
        .collect()
}

fn collect<'n, B: Backend>(
    outputs: &Outputs<B>,
    names: impl Iterator<Item = &'n str>,
) -> Result<BTreeMap<String, Tensor<B, 2>>> {
    names.map(|name| Ok((name.to_string(), outputs.value(name)?))).collect()
}
