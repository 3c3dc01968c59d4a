//! 学習ループの設定。JSON ファイルから読み込めます。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PinnError, Result};
use crate::loss::LossFn;
use crate::metric::Metric;
use crate::precision::GradScalerConfig;

/// 使用するオプティマイザ。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    AdamW,
    Sgd,
}

/// チェックポイントの保存先と間隔。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    #[serde(default = "default_checkpoint_every")]
    pub every_n_epochs: usize,
}

fn default_checkpoint_every() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub loss_fn: LossFn,
    pub metric: Metric,
    pub check_val_every_n_epoch: usize,
    pub log_every_n_epochs: usize,
    /// 損失スケーリングを有効にします。
    pub mixed_precision: bool,
    pub grad_scaler: GradScalerConfig,
    /// 最初のステップで損失項の構成を固定し、以後の変化をエラーにします。
    pub compiled: bool,
    /// 入力座標を領域の境界から `[-1, 1]` に正規化します。
    pub normalize_inputs: bool,
    pub seed: u64,
    pub checkpoint: Option<CheckpointConfig>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 8000,
            learning_rate: 1e-3,
            optimizer: OptimizerKind::default(),
            loss_fn: LossFn::default(),
            metric: Metric::default(),
            check_val_every_n_epoch: 500,
            log_every_n_epochs: 200,
            mixed_precision: false,
            grad_scaler: GradScalerConfig::default(),
            compiled: false,
            normalize_inputs: true,
            seed: 42,
            checkpoint: None,
        }
    }
}

impl TrainerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_epochs == 0 {
            return Err(PinnError::config("max_epochs は 1 以上が必要です"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(PinnError::config(format!(
                "learning_rate が不正です: {}",
                self.learning_rate
            )));
        }
        if self.check_val_every_n_epoch == 0 || self.log_every_n_epochs == 0 {
            return Err(PinnError::config("検証・ログの間隔は 1 以上が必要です"));
        }
        if self.checkpoint.as_ref().is_some_and(|c| c.every_n_epochs == 0) {
            return Err(PinnError::config("チェックポイントの間隔は 1 以上が必要です"));
        }
        let scaler = &self.grad_scaler;
        let scaler_ok = scaler.init_scale > 0.0
            && scaler.growth_factor > 1.0
            && (0.0..1.0).contains(&scaler.backoff_factor)
            && scaler.max_consecutive_skips > 0;
        if self.mixed_precision && !scaler_ok {
            return Err(PinnError::config("grad_scaler の設定が不正です"));
        }
        Ok(())
    }
}
