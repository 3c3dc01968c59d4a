//! 学習ループ。状態遷移・最適化ステップ・検証・チェックポイントを管理します。

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, AdamWConfig, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use ndarray::Array1;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::checkpoint::{self, CheckpointMeta};
use crate::condition::{Block, Points};
use crate::config::{OptimizerKind, TrainerConfig};
use crate::datamodule::{DataModule, LossGroup, SplitRecord, Stage};
use crate::domain::BoundingBox;
use crate::error::{PinnError, Result};
use crate::loss::{DeviceBlock, DevicePoints, LossAssembler, SupervisedValues, TermLoss, boundary_pairs};
use crate::metric::MetricAccumulator;
use crate::model::{InputScaling, PinnModel, PinnModelConfig};
use crate::physics::{Evaluator, ExtraValues, Problem};
use crate::precision::{GradScaler, rescale_gradients};

/// トレーナーの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Uninitialized,
    Compiled,
    Training { epoch: usize },
    Validating { epoch: usize },
    Finished,
}

/// 外部から学習を止めるためのフラグ。エポックの境目でのみ確認されます。
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// ログ間隔ごとに記録する損失。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochLog {
    pub epoch: usize,
    pub loss: f64,
    /// 項ラベル（`ブロック/名前`）ごとの損失。
    pub terms: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub epoch: usize,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingSummary {
    /// 実行したエポック数。
    pub epochs: usize,
    pub final_loss: f64,
    pub stopped: bool,
    /// 勾配のオーバーフローで更新を飛ばした回数。
    pub skipped_steps: usize,
    pub elapsed_secs: f64,
    pub history: Vec<EpochLog>,
    pub validations: Vec<ValidationReport>,
    pub extra: BTreeMap<String, f64>,
}

/// 1ブロック分の予測。
#[derive(Debug, Clone)]
pub struct BlockPrediction {
    pub label: String,
    pub points: Points,
    /// ネットワーク出力と `output_fn` が導いた出力。
    pub outputs: BTreeMap<String, Array1<f64>>,
}

struct Compiled<B: AutodiffBackend> {
    bounds: BoundingBox,
    scaling: InputScaling<B>,
    train: Vec<DeviceBlock<B>>,
    eval_scaling: InputScaling<B::InnerBackend>,
    val: Vec<DeviceBlock<B::InnerBackend>>,
}

struct StepOutput {
    loss: f64,
    terms: Option<BTreeMap<String, f64>>,
    grads: Option<GradientsParams>,
}

/// 問題・モデル・設定をまとめて学習を進めるトレーナー。
pub struct Trainer<B: AutodiffBackend, P: Problem> {
    config: TrainerConfig,
    model_config: PinnModelConfig,
    problem: P,
    device: B::Device,
    model: Option<PinnModel<B>>,
    state: TrainerState,
    compiled: Option<Compiled<B>>,
    stop: StopHandle,
}

impl<B: AutodiffBackend, P: Problem> Trainer<B, P> {
    pub fn new(model_config: PinnModelConfig, problem: P, config: TrainerConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        model_config.validate()?;
        let derived = problem.derived_outputs();
        if let Some(name) = derived.iter().find(|n| model_config.outputs.contains(n)) {
            return Err(PinnError::config(format!(
                "output_fn の出力 '{name}' がネットワーク出力と重複しています"
            )));
        }
        B::seed(config.seed);
        let model = model_config.init::<B>(&device)?;
        Ok(Self {
            config,
            model_config,
            problem,
            device,
            model: Some(model),
            state: TrainerState::Uninitialized,
            compiled: None,
            stop: StopHandle::default(),
        })
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model_config(&self) -> &PinnModelConfig {
        &self.model_config
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn model(&self) -> Result<&PinnModel<B>> {
        self.model
            .as_ref()
            .ok_or_else(|| PinnError::State("モデルが利用できません".into()))
    }

    /// 入力正規化に使った領域。`compile` 前は `None`。
    pub fn bounds(&self) -> Option<&BoundingBox> {
        self.compiled.as_ref().map(|c| &c.bounds)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// 追加変数の現在値。
    pub fn extra_values(&self) -> Result<BTreeMap<String, f64>> {
        let values = self.model()?.extra_values()?;
        Ok(self.model_config.extra_names().into_iter().zip(values).collect())
    }

    /// 名前と次元を検証し、学習・検証ブロックをデバイスへ一度だけ転送します。
    pub fn compile(&mut self, datamodule: &DataModule) -> Result<()> {
        if self.state != TrainerState::Uninitialized {
            return Err(PinnError::State(format!(
                "compile は未初期化状態でのみ呼べます (現在: {:?})",
                self.state
            )));
        }
        let train = datamodule.record(Stage::Train)?;
        self.check_record(Stage::Train, &train)?;
        let mut bounds = datamodule.bounds(Stage::Train)?;
        let val = if datamodule.has(Stage::Val) {
            let record = datamodule.record(Stage::Val)?;
            self.check_record(Stage::Val, &record)?;
            bounds = bounds.union(&datamodule.bounds(Stage::Val)?)?;
            Some(record)
        } else {
            None
        };
        if bounds.dim() != self.model_config.network.input_dim {
            return Err(PinnError::config(format!(
                "領域の次元 {} がモデルの入力次元 {} と一致しません",
                bounds.dim(),
                self.model_config.network.input_dim
            )));
        }

        let compiled = Compiled {
            scaling: self.scaling(&bounds),
            train: DeviceBlock::upload_all(&train, &self.device),
            eval_scaling: self.scaling(&bounds),
            val: val
                .map(|record| DeviceBlock::upload_all(&record, &self.device))
                .unwrap_or_default(),
            bounds,
        };
        info!(
            train_blocks = compiled.train.len(),
            train_points = train.num_points(),
            val_blocks = compiled.val.len(),
            "コンパイルが完了しました"
        );
        self.compiled = Some(compiled);
        self.state = TrainerState::Compiled;
        Ok(())
    }

    /// 設定されたオプティマイザで `max_epochs` まで学習します。
    pub fn fit(&mut self) -> Result<TrainingSummary> {
        if self.state != TrainerState::Compiled {
            return Err(PinnError::State(format!(
                "fit はコンパイル済みの状態でのみ呼べます (現在: {:?})",
                self.state
            )));
        }
        match self.config.optimizer {
            OptimizerKind::Adam => self.fit_with(AdamConfig::new().init::<B, PinnModel<B>>()),
            OptimizerKind::AdamW => self.fit_with(AdamWConfig::new().init::<B, PinnModel<B>>()),
            OptimizerKind::Sgd => self.fit_with(SgdConfig::new().init::<B, PinnModel<B>>()),
        }
    }

    fn fit_with<O: Optimizer<PinnModel<B>, B>>(&mut self, mut optim: O) -> Result<TrainingSummary> {
        let compiled = self
            .compiled
            .take()
            .ok_or_else(|| PinnError::State("コンパイル結果がありません".into()))?;
        let result = self.run(&compiled, &mut optim);
        self.compiled = Some(compiled);
        result
    }

    fn run<O: Optimizer<PinnModel<B>, B>>(
        &mut self,
        compiled: &Compiled<B>,
        optim: &mut O,
    ) -> Result<TrainingSummary> {
        let start = Instant::now();
        let max_epochs = self.config.max_epochs;
        let mut scaler = self
            .config
            .mixed_precision
            .then(|| GradScaler::new(self.config.grad_scaler.clone()));
        let mut signature = None;
        let mut summary = TrainingSummary::default();
        info!(max_epochs, optimizer = ?self.config.optimizer, "学習を開始します");

        for epoch in 1..=max_epochs {
            if self.stop.is_stopped() {
                info!(epoch, "停止要求を受けたため学習を終了します");
                summary.stopped = true;
                break;
            }
            self.state = TrainerState::Training { epoch };
            let last = epoch == max_epochs;
            let log = epoch % self.config.log_every_n_epochs == 0 || last;
            let step = self.step(compiled, &mut scaler, &mut signature, epoch, log)?;
            summary.epochs = epoch;
            summary.final_loss = step.loss;
            match step.grads {
                Some(grads) => {
                    let model = self.take_model()?;
                    self.model = Some(optim.step(self.config.learning_rate, model, grads));
                }
                None => summary.skipped_steps += 1,
            }
            if let Some(terms) = step.terms {
                info!(epoch, loss = step.loss, "エポック完了");
                summary.history.push(EpochLog {
                    epoch,
                    loss: step.loss,
                    terms,
                });
            }

            if !compiled.val.is_empty() && (epoch % self.config.check_val_every_n_epoch == 0 || last) {
                self.state = TrainerState::Validating { epoch };
                let model = self.model()?.valid();
                let metrics = self.metrics(&model, &compiled.eval_scaling, &compiled.val)?;
                info!(epoch, ?metrics, "検証");
                summary.validations.push(ValidationReport { epoch, metrics });
            }

            if let Some(ckpt) = &self.config.checkpoint {
                if epoch % ckpt.every_n_epochs == 0 {
                    self.save_checkpoint(compiled, &ckpt.dir, epoch, step.loss)?;
                }
            }
        }

        if let Some(ckpt) = &self.config.checkpoint {
            if summary.epochs % ckpt.every_n_epochs != 0 {
                self.save_checkpoint(compiled, &ckpt.dir, summary.epochs, summary.final_loss)?;
            }
        }
        summary.elapsed_secs = start.elapsed().as_secs_f64();
        summary.extra = self.extra_values()?;
        self.state = TrainerState::Finished;
        info!(
            epochs = summary.epochs,
            loss = summary.final_loss,
            elapsed = ?start.elapsed(),
            "学習が完了しました"
        );
        Ok(summary)
    }

    fn step(
        &self,
        compiled: &Compiled<B>,
        scaler: &mut Option<GradScaler>,
        signature: &mut Option<Vec<(String, usize)>>,
        epoch: usize,
        log: bool,
    ) -> Result<StepOutput> {
        let model = self.model()?;
        let extra_names = self.model_config.extra_names();
        let extra = ExtraValues::new(model, &extra_names);
        let assembler = LossAssembler {
            evaluator: Evaluator {
                model,
                scaling: &compiled.scaling,
                output_names: &self.model_config.outputs,
            },
            problem: &self.problem,
            extra: &extra,
            loss_fn: self.config.loss_fn,
        };
        let breakdown = assembler.assemble(&compiled.train)?;
        if self.config.compiled {
            check_signature(signature, &breakdown.terms)?;
        }
        let loss = scalar(breakdown.total.clone());
        if !loss.is_finite() {
            error!(epoch, loss, "損失が非有限になったため学習を中断します");
            return Err(PinnError::Numerical(format!(
                "エポック {epoch} で損失が非有限になりました: {loss}"
            )));
        }
        let terms: Option<BTreeMap<String, f64>> = log.then(|| {
            breakdown
                .terms
                .iter()
                .map(|t| (t.label.clone(), scalar(t.loss.clone())))
                .collect()
        });

        let total = match scaler.as_ref() {
            Some(s) => s.scale_loss(breakdown.total),
            None => breakdown.total,
        };
        let mut grads = GradientsParams::from_grads(total.backward(), model);
        let apply = match scaler.as_mut() {
            Some(s) => {
                let finite = s.unscale::<B, _>(model, &mut grads);
                if !finite && s.is_exhausted() {
                    let skipped = s.consecutive_skips();
                    error!(epoch, skipped, "損失スケールを下げても勾配が有限にならないため学習を中断します");
                    return Err(PinnError::Numerical(format!(
                        "エポック {epoch} まで {skipped} 回連続で勾配が非有限になりました"
                    )));
                }
                finite
            }
            None => {
                if !rescale_gradients::<B, _>(model, &mut grads, 1.0) {
                    error!(epoch, "勾配が非有限になったため学習を中断します");
                    return Err(PinnError::Numerical(format!(
                        "エポック {epoch} で勾配が非有限になりました"
                    )));
                }
                true
            }
        };
        Ok(StepOutput {
            loss,
            terms,
            grads: apply.then_some(grads),
        })
    }

    /// `stage` の条件で誤差指標を求めます。
    pub fn evaluate(&self, datamodule: &DataModule, stage: Stage) -> Result<BTreeMap<String, f64>> {
        let compiled = self.compiled()?;
        let record = datamodule.record(stage)?;
        self.check_record(stage, &record)?;
        let blocks = DeviceBlock::upload_all(&record, &self.device);
        let model = self.model()?.valid();
        self.metrics(&model, &compiled.eval_scaling, &blocks)
    }

    /// `stage` の各ブロックの座標で予測します。周期境界は下端・上端を別々に返します。
    pub fn predict(&self, datamodule: &DataModule, stage: Stage) -> Result<Vec<BlockPrediction>> {
        let compiled = self.compiled()?;
        let conditions = datamodule.conditions(stage);
        if conditions.is_empty() {
            return Err(PinnError::config(format!("{stage} フェーズに条件がありません")));
        }
        let model = self.model()?.valid();
        let names = &self.model_config.outputs;
        let mut predictions = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let label = condition.label();
            let sides = match condition.block() {
                Block::Supervised { points, .. } => vec![(label.to_string(), points)],
                Block::Periodic { lower, upper, .. } => {
                    vec![(format!("{label}/lower"), lower), (format!("{label}/upper"), upper)]
                }
            };
            for (label, points) in sides {
                let outputs = predict_points(&model, &compiled.eval_scaling, names, &self.problem, points, &self.device)?;
                predictions.push(BlockPrediction {
                    label,
                    points: points.clone(),
                    outputs,
                });
            }
        }
        Ok(predictions)
    }

    /// 現在のモデルをチェックポイントとして書き出します。
    pub fn save(&self, dir: impl AsRef<Path>, loss: f64) -> Result<()> {
        let compiled = self.compiled()?;
        let epoch = match self.state {
            TrainerState::Training { epoch } | TrainerState::Validating { epoch } => epoch,
            _ => 0,
        };
        self.save_checkpoint(compiled, dir.as_ref(), epoch, loss)
    }

    fn save_checkpoint(&self, compiled: &Compiled<B>, dir: &Path, epoch: usize, loss: f64) -> Result<()> {
        let meta = CheckpointMeta {
            epoch,
            loss,
            model: self.model_config.clone(),
            extra: self.extra_values()?,
            bounds: compiled.bounds.clone(),
            normalize_inputs: self.config.normalize_inputs,
        };
        checkpoint::save(dir, self.model()?, &meta)
    }

    fn metrics(
        &self,
        model: &PinnModel<B::InnerBackend>,
        scaling: &InputScaling<B::InnerBackend>,
        blocks: &[DeviceBlock<B::InnerBackend>],
    ) -> Result<BTreeMap<String, f64>> {
        let extra_names = self.model_config.extra_names();
        let extra = ExtraValues::new(model, &extra_names);
        let evaluator = Evaluator {
            model,
            scaling,
            output_names: &self.model_config.outputs,
        };
        let mut acc = MetricAccumulator::default();
        for block in blocks {
            accumulate(&evaluator, &self.problem, &extra, block, &mut acc)?;
        }
        Ok(acc.finish(self.config.metric))
    }

    /// レコードの名前・次元がモデルと問題定義に合っているか確認します。
    fn check_record(&self, stage: Stage, record: &SplitRecord<'_>) -> Result<()> {
        let input_dim = self.model_config.network.input_dim;
        for (label, block) in record.labels.iter().zip(&record.blocks) {
            if block.spatial_dim() + 1 != input_dim {
                return Err(PinnError::config(format!(
                    "{stage}/{label}: 空間 {} 次元 + 時間がモデルの入力次元 {input_dim} と一致しません",
                    block.spatial_dim()
                )));
            }
        }
        let outputs: BTreeSet<String> = self
            .model_config
            .outputs
            .iter()
            .cloned()
            .chain(self.problem.derived_outputs())
            .collect();
        let residuals: BTreeSet<String> = self.problem.residual_names().into_iter().collect();
        for term in &record.terms {
            let label = record.labels[term.block];
            match term.group {
                LossGroup::Residual if !residuals.contains(&term.name) => {
                    return Err(PinnError::config(format!(
                        "{stage}/{label}: 残差 '{}' は pde_fn の残差として宣言されていません",
                        term.name
                    )));
                }
                LossGroup::Direct | LossGroup::BoundaryMatch { .. } if !outputs.contains(&term.name) => {
                    return Err(PinnError::config(format!(
                        "{stage}/{label}: '{}' はモデルの出力にありません",
                        term.name
                    )));
                }
                _ => {}
            }
        }
        debug!(%stage, terms = record.terms.len(), "レコードを検証しました");
        Ok(())
    }

    fn scaling<BB: Backend<Device = B::Device>>(&self, bounds: &BoundingBox) -> InputScaling<BB> {
        if self.config.normalize_inputs {
            InputScaling::from_bounds(bounds, &self.device)
        } else {
            InputScaling::identity(bounds.dim(), &self.device)
        }
    }

    fn compiled(&self) -> Result<&Compiled<B>> {
        self.compiled
            .as_ref()
            .ok_or_else(|| PinnError::State("先に compile を呼んでください".into()))
    }

    fn take_model(&mut self) -> Result<PinnModel<B>> {
        self.model
            .take()
            .ok_or_else(|| PinnError::State("モデルが利用できません".into()))
    }
}

/// 座標列での出力（`output_fn` 適用後）を求めます。
pub fn predict_points<B: Backend, P: Problem>(
    model: &PinnModel<B>,
    scaling: &InputScaling<B>,
    output_names: &[String],
    problem: &P,
    points: &Points,
    device: &B::Device,
) -> Result<BTreeMap<String, Array1<f64>>> {
    let input = DevicePoints::<B>::new(points, device);
    let evaluator = Evaluator {
        model,
        scaling,
        output_names,
    };
    let mut outputs = evaluator.outputs(&input.input, None, 0)?;
    problem.output_fn(&mut outputs)?;
    let names: Vec<String> = outputs.names().map(str::to_string).collect();
    names
        .into_iter()
        .map(|name| {
            let values = to_vec(outputs.value(&name)?)?;
            Ok((name, values.into_iter().map(f64::from).collect()))
        })
        .collect()
}

fn accumulate<B: Backend, P: Problem>(
    evaluator: &Evaluator<'_, B>,
    problem: &P,
    extra: &ExtraValues<B>,
    block: &DeviceBlock<B>,
    acc: &mut MetricAccumulator,
) -> Result<()> {
    match block {
        DeviceBlock::Supervised {
            points, targets, terms, ..
        } => {
            let values = SupervisedValues::evaluate(evaluator, problem, extra, points, terms)?;
            for term in terms {
                let prediction = to_vec(values.get(term)?)?;
                match (term.group, targets.get(&term.name)) {
                    (LossGroup::Direct, Some(target)) => acc.add(&term.name, &prediction, &to_vec(target.clone())?),
                    _ => acc.add_residual(&term.name, &prediction),
                }
            }
        }
        DeviceBlock::Periodic {
            lower,
            upper,
            axis,
            terms,
            ..
        } => {
            for (term, a, b) in boundary_pairs(evaluator, problem, extra, lower, upper, *axis, terms)? {
                acc.add_residual(&term.label, &to_vec(a - b)?);
            }
        }
    }
    Ok(())
}

fn check_signature<B: Backend>(signature: &mut Option<Vec<(String, usize)>>, terms: &[TermLoss<B>]) -> Result<()> {
    let current: Vec<(String, usize)> = terms.iter().map(|t| (t.label.clone(), t.rows)).collect();
    match signature {
        None => {
            *signature = Some(current);
            Ok(())
        }
        Some(expected) if *expected == current => Ok(()),
        Some(expected) => Err(PinnError::user_fn(format!(
            "コンパイル済みの損失項の構成が変化しました: {expected:?} -> {current:?}"
        ))),
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

fn to_vec<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PinnError::TensorData(format!("{e:?}")))
}
