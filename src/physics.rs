//! 問題定義（`output_fn` / `pde_fn`）と、それらに渡す微分ユーティリティ。

use std::collections::BTreeMap;

use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::error::{PinnError, Result};
use crate::jet::Jet;
use crate::model::{InputScaling, PinnModel};

/// 座標軸。時間は空間軸の後ろに並びます。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Space(usize),
    Time,
}

impl Axis {
    fn column(self, spatial_dim: usize) -> Result<usize> {
        match self {
            Self::Space(i) if i < spatial_dim => Ok(i),
            Self::Space(i) => Err(PinnError::user_fn(format!(
                "空間軸 {i} は空間次元 {spatial_dim} の範囲外です"
            ))),
            Self::Time => Ok(spatial_dim),
        }
    }
}

/// 名前付き出力の集合。値はすべて `n × 1` のジェットです。
///
/// 微分が不要な評価では 0 次のジェットになります。
#[derive(Debug, Clone)]
pub struct Outputs<B: Backend> {
    rows: usize,
    order: usize,
    fields: BTreeMap<String, Jet<B>>,
    coordinates: Vec<Jet<B>>,
}

impl<B: Backend> Outputs<B> {
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn spatial_dim(&self) -> usize {
        self.coordinates.len() - 1
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn jet(&self, name: &str) -> Result<&Jet<B>> {
        self.fields
            .get(name)
            .ok_or_else(|| PinnError::user_fn(format!("出力 '{name}' が存在しません")))
    }

    pub fn value(&self, name: &str) -> Result<Tensor<B, 2>> {
        Ok(self.jet(name)?.value())
    }

    /// 座標そのもののジェット。
    pub fn coordinate(&self, axis: Axis) -> Result<&Jet<B>> {
        Ok(&self.coordinates[axis.column(self.spatial_dim())?])
    }

    /// 出力を追加・上書きします。行数と次数が一致しない場合はエラーです。
    pub fn insert(&mut self, name: impl Into<String>, jet: Jet<B>) -> Result<()> {
        let name = name.into();
        let dims = jet.dims();
        if dims != [self.rows, 1] {
            return Err(PinnError::user_fn(format!(
                "出力 '{name}' の形状 {dims:?} が [{}, 1] と一致しません",
                self.rows
            )));
        }
        if jet.order() < self.order {
            return Err(PinnError::user_fn(format!(
                "出力 '{name}' のジェット次数 {} が必要な次数 {} より低いです",
                jet.order(),
                self.order
            )));
        }
        self.fields.insert(name, jet);
        Ok(())
    }
}

/// 追加変数の現在値（`1 × 1` テンソル）を名前で引けるようにしたもの。
#[derive(Debug, Clone)]
pub struct ExtraValues<B: Backend> {
    values: BTreeMap<String, Tensor<B, 2>>,
}

impl<B: Backend> ExtraValues<B> {
    pub fn new(model: &PinnModel<B>, names: &[String]) -> Self {
        let values = names
            .iter()
            .cloned()
            .zip(model.extra.iter().map(|p| p.val().reshape([1, 1])))
            .collect();
        Self { values }
    }

    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Tensor<B, 2>> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| PinnError::user_fn(format!("追加変数 '{name}' は定義されていません")))
    }
}

/// 学習する問題の定義。
///
/// `output_fn` は出力から別の名前付き出力を導くだけの純粋な後処理で、
/// `pde_fn` は `PdeContext` の微分ユーティリティを使って残差を登録します。
/// どちらも任意の `Backend` で呼ばれます（学習時は自動微分バックエンド）。
pub trait Problem {
    /// `pde_fn` が生成する残差の名前。
    fn residual_names(&self) -> Vec<String>;

    /// `output_fn` が追加する出力の名前。
    fn derived_outputs(&self) -> Vec<String> {
        Vec::new()
    }

    fn output_fn<B: Backend>(&self, outputs: &mut Outputs<B>) -> Result<()> {
        let _ = outputs;
        Ok(())
    }

    fn pde_fn<B: Backend>(&self, ctx: &mut PdeContext<'_, B>) -> Result<()>;
}

/// ネットワーク・入力変換・出力名をまとめた評価器。
pub struct Evaluator<'a, B: Backend> {
    pub model: &'a PinnModel<B>,
    pub scaling: &'a InputScaling<B>,
    pub output_names: &'a [String],
}

impl<B: Backend> Evaluator<'_, B> {
    /// `input`（`n × (d + 1)`）での出力ジェットを求めます。
    ///
    /// `direction` が `None` なら値のみ（0 次）を計算します。
    pub fn outputs(&self, input: &Tensor<B, 2>, direction: Option<&[f32]>, order: usize) -> Result<Outputs<B>> {
        let [rows, cols] = input.dims();
        let device = input.device();
        let order = if direction.is_some() { order } else { 0 };
        let coordinate = match direction {
            Some(dir) => {
                if dir.len() != cols {
                    return Err(PinnError::user_fn(format!(
                        "方向ベクトルの次元 {} が入力次元 {cols} と一致しません",
                        dir.len()
                    )));
                }
                let repeated: Vec<f32> = (0..rows).flat_map(|_| dir.iter().copied()).collect();
                let dir = Tensor::from_data(TensorData::new(repeated, [rows, cols]), &device);
                Jet::variable(input.clone(), dir, order)
            }
            None => Jet::constant(input.clone(), 0),
        };
        let network = self.model.network.forward_jet(self.scaling.apply(&coordinate));
        let [_, width] = network.dims();
        if width != self.output_names.len() {
            return Err(PinnError::config(format!(
                "ネットワーク出力の列数 {width} が出力名の数 {} と一致しません",
                self.output_names.len()
            )));
        }
        let fields = self
            .output_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), network.narrow(i, 1)))
            .collect();
        let coordinates = (0..cols).map(|i| coordinate.narrow(i, 1)).collect();
        Ok(Outputs {
            rows,
            order,
            fields,
            coordinates,
        })
    }
}

pub(crate) type OutputFn<'a, B> = dyn Fn(&mut Outputs<B>) -> Result<()> + 'a;

/// `pde_fn` に渡される文脈。微分は必要になった方向・次数だけ遅延評価します。
pub struct PdeContext<'a, B: Backend> {
    evaluator: &'a Evaluator<'a, B>,
    output_fn: &'a OutputFn<'a, B>,
    extra: &'a ExtraValues<B>,
    input: Tensor<B, 2>,
    values: Outputs<B>,
    jets: Vec<(Vec<f32>, Outputs<B>)>,
    residuals: BTreeMap<String, Tensor<B, 2>>,
}

impl<'a, B: Backend> PdeContext<'a, B> {
    pub(crate) fn new(
        evaluator: &'a Evaluator<'a, B>,
        output_fn: &'a OutputFn<'a, B>,
        extra: &'a ExtraValues<B>,
        input: Tensor<B, 2>,
    ) -> Result<Self> {
        let mut values = evaluator.outputs(&input, None, 0)?;
        output_fn(&mut values)?;
        Ok(Self {
            evaluator,
            output_fn,
            extra,
            input,
            values,
            jets: Vec::new(),
            residuals: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn spatial_dim(&self) -> usize {
        self.values.spatial_dim()
    }

    /// `output_fn` 適用後の出力値。
    pub fn value(&self, name: &str) -> Result<Tensor<B, 2>> {
        self.values.value(name)
    }

    pub fn outputs(&self) -> &Outputs<B> {
        &self.values
    }

    /// 座標の値（`n × 1`）。
    pub fn coordinate(&self, axis: Axis) -> Result<Tensor<B, 2>> {
        Ok(self.values.coordinate(axis)?.value())
    }

    /// `name` の `axis` 方向の `order` 階微分。`order == 0` は値そのもの。
    pub fn derivative(&mut self, name: &str, axis: Axis, order: usize) -> Result<Tensor<B, 2>> {
        if order == 0 {
            return self.value(name);
        }
        let column = axis.column(self.spatial_dim())?;
        let mut direction = vec![0.0; self.spatial_dim() + 1];
        direction[column] = 1.0;
        Ok(self.directional(&direction, order)?.jet(name)?.derivative(order))
    }

    /// 混合2階微分 `∂²/∂a∂b`。偏極恒等式で2つの方向微分から求めます。
    pub fn mixed(&mut self, name: &str, a: Axis, b: Axis) -> Result<Tensor<B, 2>> {
        if a == b {
            return self.derivative(name, a, 2);
        }
        let dim = self.spatial_dim() + 1;
        let (ca, cb) = (a.column(dim - 1)?, b.column(dim - 1)?);
        let mut plus = vec![0.0; dim];
        plus[ca] = 1.0;
        plus[cb] = 1.0;
        let mut minus = plus.clone();
        minus[cb] = -1.0;
        let d_plus = self.directional(&plus, 2)?.jet(name)?.coeff(2);
        let d_minus = self.directional(&minus, 2)?.jet(name)?.coeff(2);
        Ok((d_plus - d_minus).mul_scalar(0.5))
    }

    pub fn extra(&self, name: &str) -> Result<Tensor<B, 2>> {
        self.extra.get(name)
    }

    /// 残差を登録します。目標値は常にゼロです。
    pub fn set_residual(&mut self, name: impl Into<String>, residual: Tensor<B, 2>) -> Result<()> {
        let name = name.into();
        let dims = residual.dims();
        if dims != [self.len(), 1] {
            return Err(PinnError::user_fn(format!(
                "残差 '{name}' の形状 {dims:?} が [{}, 1] と一致しません",
                self.len()
            )));
        }
        self.residuals.insert(name, residual);
        Ok(())
    }

    pub fn residual(&self, name: &str) -> Result<Tensor<B, 2>> {
        self.residuals.get(name).cloned().ok_or_else(|| {
            PinnError::user_fn(format!("pde_fn が残差 '{name}' を登録しませんでした"))
        })
    }

    fn directional(&mut self, direction: &[f32], order: usize) -> Result<&Outputs<B>> {
        let cached = self
            .jets
            .iter()
            .position(|(dir, outputs)| dir.as_slice() == direction && outputs.order() >= order);
        let index = match cached {
            Some(index) => index,
            None => {
                let mut outputs = self.evaluator.outputs(&self.input, Some(direction), order)?;
                (self.output_fn)(&mut outputs)?;
                self.jets.retain(|(dir, _)| dir.as_slice() != direction);
                self.jets.push((direction.to_vec(), outputs));
                self.jets.len() - 1
            }
        };
        Ok(&self.jets[index].1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MlpConfig, PinnModelConfig};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    struct Magnitude;

    impl Problem for Magnitude {
        fn residual_names(&self) -> Vec<String> {
            vec!["f".into()]
        }

        fn derived_outputs(&self) -> Vec<String> {
            vec!["h".into()]
        }

        fn output_fn<B: Backend>(&self, outputs: &mut Outputs<B>) -> Result<()> {
            let u = outputs.jet("u")?.clone();
            let v = outputs.jet("v")?.clone();
            outputs.insert("h", u.square().add(&v.square()).sqrt())
        }

        fn pde_fn<B: Backend>(&self, ctx: &mut PdeContext<'_, B>) -> Result<()> {
            let h_t = ctx.derivative("h", Axis::Time, 1)?;
            ctx.set_residual("f", h_t)
        }
    }

    fn input(points: &[[f32; 2]]) -> Tensor<TestBackend, 2> {
        let flat: Vec<f32> = points.iter().flatten().copied().collect();
        Tensor::from_data(TensorData::new(flat, [points.len(), 2]), &Default::default())
    }

    fn scalar(t: Tensor<TestBackend, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn model() -> (PinnModel<TestBackend>, Vec<String>) {
        let config = PinnModelConfig::new(MlpConfig::new(2, 2).with_hidden_size(6).with_num_layers(3), vec![
            "u".into(),
            "v".into(),
        ]);
        (config.init(&Default::default()).unwrap(), config.outputs.clone())
    }

    #[test]
    fn derivatives_agree_with_finite_differences() {
        let (model, names) = model();
        let scaling = InputScaling::identity(2, &Default::default());
        let evaluator = Evaluator {
            model: &model,
            scaling: &scaling,
            output_names: &names,
        };
        let identity = |_: &mut Outputs<TestBackend>| -> Result<()> { Ok(()) };
        let extra = ExtraValues::empty();
        let x = [[0.3f32, 0.4]];
        let mut ctx = PdeContext::new(&evaluator, &identity, &extra, input(&x)).unwrap();
        let u_x = scalar(ctx.derivative("u", Axis::Space(0), 1).unwrap())[0];
        let u_xx = scalar(ctx.derivative("u", Axis::Space(0), 2).unwrap())[0];
        let u_xt = scalar(ctx.mixed("u", Axis::Space(0), Axis::Time).unwrap())[0];

        let eval = |p: [f32; 2]| -> f32 {
            let out = evaluator.outputs(&input(&[p]), None, 0).unwrap();
            scalar(out.value("u").unwrap())[0]
        };
        let h = 1e-2f32;
        let fd_x = (eval([0.3 + h, 0.4]) - eval([0.3 - h, 0.4])) / (2.0 * h);
        let fd_xx = (eval([0.3 + h, 0.4]) - 2.0 * eval([0.3, 0.4]) + eval([0.3 - h, 0.4])) / (h * h);
        let fd_xt = (eval([0.3 + h, 0.4 + h]) - eval([0.3 + h, 0.4 - h]) - eval([0.3 - h, 0.4 + h])
            + eval([0.3 - h, 0.4 - h]))
            / (4.0 * h * h);
        assert!((u_x - fd_x).abs() < 1e-3, "{u_x} vs {fd_x}");
        assert!((u_xx - fd_xx).abs() < 2e-2, "{u_xx} vs {fd_xx}");
        assert!((u_xt - fd_xt).abs() < 2e-2, "{u_xt} vs {fd_xt}");
    }

    #[test]
    fn derived_outputs_are_differentiable() {
        let (model, names) = model();
        let scaling = InputScaling::identity(2, &Default::default());
        let evaluator = Evaluator {
            model: &model,
            scaling: &scaling,
            output_names: &names,
        };
        let problem = Magnitude;
        let output_fn = |o: &mut Outputs<TestBackend>| problem.output_fn(o);
        let extra = ExtraValues::empty();
        let points = [[0.1f32, 0.2], [-0.4, 0.7]];
        let mut ctx = PdeContext::new(&evaluator, &output_fn, &extra, input(&points)).unwrap();
        problem.pde_fn(&mut ctx).unwrap();
        let residual = scalar(ctx.residual("f").unwrap());

        let u = scalar(ctx.value("u").unwrap());
        let v = scalar(ctx.value("v").unwrap());
        let u_t = scalar(ctx.derivative("u", Axis::Time, 1).unwrap());
        let v_t = scalar(ctx.derivative("v", Axis::Time, 1).unwrap());
        for i in 0..2 {
            let h = (u[i] * u[i] + v[i] * v[i]).sqrt();
            let expected = (u[i] * u_t[i] + v[i] * v_t[i]) / h;
            assert!((residual[i] - expected).abs() < 1e-3 * (1.0 + expected.abs()));
        }
    }

    #[test]
    fn missing_output_and_bad_shapes_are_user_errors() {
        let (model, names) = model();
        let scaling = InputScaling::identity(2, &Default::default());
        let evaluator = Evaluator {
            model: &model,
            scaling: &scaling,
            output_names: &names,
        };
        let identity = |_: &mut Outputs<TestBackend>| -> Result<()> { Ok(()) };
        let extra = ExtraValues::empty();
        let mut ctx = PdeContext::new(&evaluator, &identity, &extra, input(&[[0.0, 0.0], [1.0, 1.0]])).unwrap();
        assert!(matches!(ctx.derivative("w", Axis::Time, 1), Err(PinnError::UserFunction(_))));
        assert!(matches!(ctx.derivative("u", Axis::Space(3), 1), Err(PinnError::UserFunction(_))));
        let wrong = Tensor::<TestBackend, 2>::zeros([3, 1], &Default::default());
        assert!(matches!(ctx.set_residual("f", wrong), Err(PinnError::UserFunction(_))));
        assert!(matches!(ctx.residual("f"), Err(PinnError::UserFunction(_))));
        assert!(matches!(ctx.extra("c"), Err(PinnError::UserFunction(_))));
    }
}
