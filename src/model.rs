use std::collections::BTreeSet;

use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::{Linear, LinearConfig, Tanh};
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::domain::BoundingBox;
use crate::error::{PinnError, Result};
use crate::jet::Jet;

/// 多層パーセプトロンの設定。
#[derive(Config, Debug)]
pub struct MlpConfig {
    /// 入力次元（空間次元 + 時間）。
    pub input_dim: usize,
    pub output_dim: usize,
    #[config(default = 20)]
    pub hidden_size: usize,
    /// 線形層の数（出力層を含む）。
    #[config(default = 4)]
    pub num_layers: usize,
}

impl MlpConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        let mut linears = Vec::with_capacity(self.num_layers);
        if self.num_layers <= 1 {
            linears.push(LinearConfig::new(self.input_dim, self.output_dim).init(device));
        } else {
            linears.push(LinearConfig::new(self.input_dim, self.hidden_size).init(device));
            for _ in 1..(self.num_layers - 1) {
                linears.push(LinearConfig::new(self.hidden_size, self.hidden_size).init(device));
            }
            linears.push(LinearConfig::new(self.hidden_size, self.output_dim).init(device));
        }
        Mlp {
            linears,
            activation: Tanh::new(),
        }
    }
}

/// 座標を入力とし、その点の物理量を予測する多層パーセプトロン。
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    linears: Vec<Linear<B>>,
    activation: Tanh,
}

impl<B: Backend> Mlp<B> {
    /// 順伝播を実行します。
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.linears.len() - 1;
        let mut x = input;
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if i < last {
                x = self.activation.forward(x);
            }
        }
        x
    }

    /// ジェットを伝播させます。線形層では高次係数にバイアスを加えません。
    pub fn forward_jet(&self, input: Jet<B>) -> Jet<B> {
        let last = self.linears.len() - 1;
        let mut x = input;
        for (i, linear) in self.linears.iter().enumerate() {
            let weight = linear.weight.val();
            let coeffs = x
                .coeffs()
                .iter()
                .enumerate()
                .map(|(k, c)| {
                    if k == 0 {
                        linear.forward(c.clone())
                    } else {
                        c.clone().matmul(weight.clone())
                    }
                })
                .collect();
            x = Jet::from_coeffs(coeffs);
            if i < last {
                x = x.tanh();
            }
        }
        x
    }
}

/// 逆問題で同時に学習するスカラー変数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraVariable {
    pub name: String,
    pub init: f64,
}

/// ネットワークと出力名・追加変数の設定。
#[derive(Config, Debug)]
pub struct PinnModelConfig {
    pub network: MlpConfig,
    /// ネットワーク出力の各列の名前。
    pub outputs: Vec<String>,
    #[config(default = "Vec::new()")]
    pub extra_variables: Vec<ExtraVariable>,
}

impl PinnModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(PinnError::config("出力名が1つもありません"));
        }
        if self.outputs.len() != self.network.output_dim {
            return Err(PinnError::config(format!(
                "出力名の数 {} がネットワークの出力次元 {} と一致しません",
                self.outputs.len(),
                self.network.output_dim
            )));
        }
        if self.network.input_dim < 2 {
            return Err(PinnError::config("入力次元は空間1次元 + 時間以上が必要です"));
        }
        let mut seen = BTreeSet::new();
        let names = self
            .outputs
            .iter()
            .chain(self.extra_variables.iter().map(|v| &v.name));
        for name in names {
            if !seen.insert(name) {
                return Err(PinnError::config(format!("名前 '{name}' が重複しています")));
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<PinnModel<B>> {
        self.validate()?;
        let extra = self
            .extra_variables
            .iter()
            .map(|v| Param::from_tensor(Tensor::from_floats([v.init as f32], device)))
            .collect();
        Ok(PinnModel {
            network: self.network.init(device),
            extra,
        })
    }

    pub fn extra_names(&self) -> Vec<String> {
        self.extra_variables.iter().map(|v| v.name.clone()).collect()
    }
}

/// 学習対象のパラメータ一式。追加変数もネットワークと一緒に最適化・保存されます。
#[derive(Module, Debug)]
pub struct PinnModel<B: Backend> {
    pub network: Mlp<B>,
    pub extra: Vec<Param<Tensor<B, 1>>>,
}

impl<B: Backend> PinnModel<B> {
    /// 追加変数の現在値。
    pub fn extra_values(&self) -> Result<Vec<f64>> {
        self.extra
            .iter()
            .map(|p| {
                p.val()
                    .into_data()
                    .convert::<f32>()
                    .to_vec::<f32>()
                    .map_err(|e| PinnError::TensorData(format!("{e:?}")))
                    .map(|v| v.first().copied().unwrap_or_default() as f64)
            })
            .collect()
    }
}

/// 物理座標を `[-1, 1]` に写す入力のアフィン変換。
#[derive(Debug, Clone)]
pub struct InputScaling<B: Backend> {
    scale: Tensor<B, 2>,
    shift: Tensor<B, 2>,
}

impl<B: Backend> InputScaling<B> {
    pub fn from_bounds(bounds: &BoundingBox, device: &B::Device) -> Self {
        let dim = bounds.dim();
        let (scale, shift): (Vec<f32>, Vec<f32>) = bounds
            .lb
            .iter()
            .zip(&bounds.ub)
            .map(|(&lo, &hi)| {
                let width = hi - lo;
                if width > 0.0 {
                    ((2.0 / width) as f32, (-2.0 * lo / width - 1.0) as f32)
                } else {
                    (1.0, (-lo) as f32)
                }
            })
            .unzip();
        Self {
            scale: Tensor::from_data(TensorData::new(scale, [1, dim]), device),
            shift: Tensor::from_data(TensorData::new(shift, [1, dim]), device),
        }
    }

    pub fn identity(dim: usize, device: &B::Device) -> Self {
        Self {
            scale: Tensor::ones([1, dim], device),
            shift: Tensor::zeros([1, dim], device),
        }
    }

    pub fn apply(&self, input: &Jet<B>) -> Jet<B> {
        let coeffs = input
            .coeffs()
            .iter()
            .enumerate()
            .map(|(k, c)| {
                let scaled = c.clone() * self.scale.clone();
                if k == 0 { scaled + self.shift.clone() } else { scaled }
            })
            .collect();
        Jet::from_coeffs(coeffs)
    }
}
