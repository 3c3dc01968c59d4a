//! 混合精度学習のための損失スケーリングと勾配の検査。

use std::marker::PhantomData;

use burn::module::{Module, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 動的な損失スケーリングの設定。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradScalerConfig {
    pub init_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    /// この回数だけ連続で有限な勾配が得られたらスケールを上げます。
    pub growth_interval: usize,
    /// 連続してこの回数だけ更新を飛ばしたら、勾配そのものが壊れているとみなします。
    pub max_consecutive_skips: usize,
}

impl Default for GradScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            max_consecutive_skips: 10,
        }
    }
}

/// 損失を拡大してから逆伝播し、勾配を元に戻す動的スケーラー。
#[derive(Debug, Clone)]
pub struct GradScaler {
    config: GradScalerConfig,
    scale: f64,
    good_steps: usize,
    skipped: usize,
}

impl GradScaler {
    pub fn new(config: GradScalerConfig) -> Self {
        Self {
            scale: config.init_scale,
            config,
            good_steps: 0,
            skipped: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// 直近で連続して飛ばした更新の回数。
    pub fn consecutive_skips(&self) -> usize {
        self.skipped
    }

    /// スケールを下げても有限な勾配が得られず、上限に達したかどうか。
    pub fn is_exhausted(&self) -> bool {
        self.skipped >= self.config.max_consecutive_skips
    }

    pub fn scale_loss<B: AutodiffBackend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        loss.mul_scalar(self.scale)
    }

    /// 勾配をスケールで割り戻します。
    ///
    /// 非有限な勾配があった場合はスケールを下げて `false` を返し、
    /// 呼び出し側はそのステップの更新を飛ばします。
    pub fn unscale<B: AutodiffBackend, M: Module<B>>(&mut self, module: &M, grads: &mut GradientsParams) -> bool {
        let finite = rescale_gradients::<B, M>(module, grads, 1.0 / self.scale);
        if finite {
            self.skipped = 0;
            self.good_steps += 1;
            if self.good_steps >= self.config.growth_interval {
                self.scale *= self.config.growth_factor;
                self.good_steps = 0;
                debug!(scale = self.scale, "損失スケールを上げました");
            }
        } else {
            self.scale *= self.config.backoff_factor;
            self.good_steps = 0;
            self.skipped += 1;
            warn!(scale = self.scale, skipped = self.skipped, "勾配がオーバーフローしたため更新を飛ばします");
        }
        finite
    }
}

/// 全パラメータの勾配に `factor` を掛け、全て有限かどうかを返します。
pub fn rescale_gradients<B: AutodiffBackend, M: Module<B>>(
    module: &M,
    grads: &mut GradientsParams,
    factor: f64,
) -> bool {
    let mut visitor = GradientRescaler::<B> {
        grads,
        factor,
        finite: true,
        _backend: PhantomData,
    };
    module.visit(&mut visitor);
    visitor.finite
}

struct GradientRescaler<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    factor: f64,
    finite: bool,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientRescaler<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = if self.factor == 1.0 { grad } else { grad.mul_scalar(self.factor) };
        let norm_sq = grad.clone().powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        if !norm_sq.is_finite() {
            self.finite = false;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}
