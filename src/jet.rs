//! 切断テイラー級数（ジェット）による座標微分。
//!
//! `Jet` はある方向 `v` に沿った `f(x + s v)` の正規化テイラー係数
//! `c_k = (d/ds)^k f / k!` を `k = 0..=order` まで保持します。
//! 係数は通常の burn テンソル演算で計算されるため、パラメータに関する
//! 自動微分の計算グラフはそのまま残ります。

use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 方向微分のテイラー係数列。各係数は `n × m` のテンソルです。
#[derive(Debug, Clone)]
pub struct Jet<B: Backend> {
    coeffs: Vec<Tensor<B, 2>>,
}

impl<B: Backend> Jet<B> {
    /// 定数（高次の係数がゼロ）として持ち上げます。
    pub fn constant(value: Tensor<B, 2>, order: usize) -> Self {
        let zeros = value.zeros_like();
        let mut coeffs = Vec::with_capacity(order + 1);
        coeffs.push(value);
        coeffs.extend((0..order).map(|_| zeros.clone()));
        Self { coeffs }
    }

    /// 独立変数 `x` を方向 `v` に動かしたときのジェット（`x + s v`）。
    pub fn variable(value: Tensor<B, 2>, direction: Tensor<B, 2>, order: usize) -> Self {
        let mut jet = Self::constant(value, order);
        if order >= 1 {
            jet.coeffs[1] = direction;
        }
        jet
    }

    pub fn from_coeffs(coeffs: Vec<Tensor<B, 2>>) -> Self {
        assert!(!coeffs.is_empty(), "ジェットには少なくとも1つの係数が必要です");
        Self { coeffs }
    }

    pub fn order(&self) -> usize {
        self.coeffs.len() - 1
    }

    pub fn dims(&self) -> [usize; 2] {
        self.coeffs[0].dims()
    }

    /// 値（0次の係数）。
    pub fn value(&self) -> Tensor<B, 2> {
        self.coeffs[0].clone()
    }

    pub fn coeff(&self, k: usize) -> Tensor<B, 2> {
        self.coeffs[k].clone()
    }

    pub fn coeffs(&self) -> &[Tensor<B, 2>] {
        &self.coeffs
    }

    /// `k` 階の方向微分 `k! c_k`。
    pub fn derivative(&self, k: usize) -> Tensor<B, 2> {
        let factorial: f64 = (1..=k).map(|i| i as f64).product();
        self.coeffs[k].clone().mul_scalar(factorial)
    }

    /// 係数ごとに同じ変換を適用します（線形な演算用）。
    pub fn map(&self, f: impl Fn(Tensor<B, 2>) -> Tensor<B, 2>) -> Self {
        Self {
            coeffs: self.coeffs.iter().cloned().map(f).collect(),
        }
    }

    /// 列を切り出します。
    pub fn narrow(&self, start: usize, length: usize) -> Self {
        self.map(|c| c.narrow(1, start, length))
    }

    pub fn add(&self, rhs: &Self) -> Self {
        self.zip(rhs, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Self) -> Self {
        self.zip(rhs, |a, b| a - b)
    }

    pub fn neg(&self) -> Self {
        self.map(|c| c.neg())
    }

    pub fn mul_scalar(&self, rhs: f64) -> Self {
        self.map(|c| c.mul_scalar(rhs))
    }

    pub fn add_scalar(&self, rhs: f64) -> Self {
        let mut out = self.clone();
        out.coeffs[0] = out.coeffs[0].clone().add_scalar(rhs);
        out
    }

    /// ジェット同士の積（コーシー積）。
    pub fn mul(&self, rhs: &Self) -> Self {
        let order = self.order().min(rhs.order());
        let coeffs = (0..=order)
            .map(|k| {
                (1..=k).fold(self.coeffs[0].clone() * rhs.coeffs[k].clone(), |acc, j| {
                    acc + self.coeffs[j].clone() * rhs.coeffs[k - j].clone()
                })
            })
            .collect();
        Self { coeffs }
    }

    pub fn square(&self) -> Self {
        self.mul(self)
    }

    /// `self / rhs`。`rhs` の値がゼロに近い点では発散します。
    pub fn div(&self, rhs: &Self) -> Self {
        let order = self.order().min(rhs.order());
        let b0 = rhs.coeffs[0].clone();
        let mut coeffs: Vec<Tensor<B, 2>> = Vec::with_capacity(order + 1);
        for k in 0..=order {
            let mut acc = self.coeffs[k].clone();
            for j in 1..=k {
                acc = acc - rhs.coeffs[j].clone() * coeffs[k - j].clone();
            }
            coeffs.push(acc / b0.clone());
        }
        Self { coeffs }
    }

    pub fn sqrt(&self) -> Self {
        let y0 = self.coeffs[0].clone().sqrt();
        let two_y0 = y0.clone().mul_scalar(2.0);
        let mut coeffs = vec![y0];
        for k in 1..=self.order() {
            let mut acc = self.coeffs[k].clone();
            for j in 1..k {
                acc = acc - coeffs[j].clone() * coeffs[k - j].clone();
            }
            coeffs.push(acc / two_y0.clone());
        }
        Self { coeffs }
    }

    pub fn exp(&self) -> Self {
        let mut coeffs = vec![self.coeffs[0].clone().exp()];
        for k in 1..=self.order() {
            coeffs.push(self.chain_term(k, &coeffs));
        }
        Self { coeffs }
    }

    pub fn sin(&self) -> Self {
        self.sin_cos().0
    }

    pub fn cos(&self) -> Self {
        self.sin_cos().1
    }

    /// `sin` と `cos` を同時に計算します。
    pub fn sin_cos(&self) -> (Self, Self) {
        let mut s = vec![self.coeffs[0].clone().sin()];
        let mut c = vec![self.coeffs[0].clone().cos()];
        for k in 1..=self.order() {
            let sk = self.chain_term(k, &c);
            let ck = self.chain_term(k, &s).neg();
            s.push(sk);
            c.push(ck);
        }
        (Self { coeffs: s }, Self { coeffs: c })
    }

    /// `tanh`。`y' = (1 - y^2) a'` の漸化式で係数を求めます。
    pub fn tanh(&self) -> Self {
        let y0 = self.coeffs[0].clone().tanh();
        let mut y = vec![y0.clone()];
        let mut s = vec![y0.clone().mul(y0).neg().add_scalar(1.0)];
        for k in 1..=self.order() {
            y.push(self.chain_term(k, &s));
            if k < self.order() {
                let yy = (1..=k).fold(y[0].clone() * y[k].clone(), |acc, i| acc + y[i].clone() * y[k - i].clone());
                s.push(yy.neg());
            }
        }
        Self { coeffs: y }
    }

    /// `k y_k = Σ_{j=1..k} j a_j g_{k-j}` の右辺を `k` で割ったもの。
    fn chain_term(&self, k: usize, g: &[Tensor<B, 2>]) -> Tensor<B, 2> {
        (2..=k)
            .fold(self.coeffs[1].clone() * g[k - 1].clone(), |acc, j| {
                acc + (self.coeffs[j].clone() * g[k - j].clone()).mul_scalar(j as f64)
            })
            .div_scalar(k as f64)
    }

    fn zip(&self, rhs: &Self, f: impl Fn(Tensor<B, 2>, Tensor<B, 2>) -> Tensor<B, 2>) -> Self {
        let order = self.order().min(rhs.order());
        Self {
            coeffs: (0..=order)
                .map(|k| f(self.coeffs[k].clone(), rhs.coeffs[k].clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn column(values: &[f32]) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(values.to_vec(), [values.len(), 1]), &Default::default())
    }

    fn to_vec(t: Tensor<TestBackend, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(actual: Tensor<TestBackend, 2>, expected: &[f32], tol: f32) {
        for (a, e) in to_vec(actual).iter().zip(expected) {
            assert!((a - e).abs() < tol, "{a} != {e}");
        }
    }

    fn x_jet(order: usize) -> (Vec<f32>, Jet<TestBackend>) {
        let xs = vec![-0.7f32, 0.1, 0.9];
        let jet = Jet::variable(column(&xs), column(&[1.0, 1.0, 1.0]), order);
        (xs, jet)
    }

    #[test]
    fn sin_derivatives_cycle() {
        let (xs, x) = x_jet(3);
        let s = x.sin();
        let cos: Vec<f32> = xs.iter().map(|v| v.cos()).collect();
        let neg_sin: Vec<f32> = xs.iter().map(|v| -v.sin()).collect();
        let neg_cos: Vec<f32> = xs.iter().map(|v| -v.cos()).collect();
        assert_close(s.derivative(1), &cos, 1e-5);
        assert_close(s.derivative(2), &neg_sin, 1e-5);
        assert_close(s.derivative(3), &neg_cos, 1e-5);
    }

    #[test]
    fn tanh_matches_closed_form() {
        let (xs, x) = x_jet(3);
        let y = x.tanh();
        let d1: Vec<f32> = xs.iter().map(|v| 1.0 - v.tanh().powi(2)).collect();
        let d2: Vec<f32> = xs.iter().map(|v| -2.0 * v.tanh() * (1.0 - v.tanh().powi(2))).collect();
        let d3: Vec<f32> = xs
            .iter()
            .map(|v| {
                let t = v.tanh();
                (1.0 - t * t) * (6.0 * t * t - 2.0)
            })
            .collect();
        assert_close(y.derivative(1), &d1, 1e-5);
        assert_close(y.derivative(2), &d2, 1e-5);
        assert_close(y.derivative(3), &d3, 1e-4);
    }

    #[test]
    fn products_quotients_and_roots() {
        let (xs, x) = x_jet(2);
        let shifted = x.add_scalar(2.0);
        // (x + 2)^2 -> 2(x + 2), 2
        let sq = shifted.square();
        let d1: Vec<f32> = xs.iter().map(|v| 2.0 * (v + 2.0)).collect();
        assert_close(sq.derivative(1), &d1, 1e-5);
        assert_close(sq.derivative(2), &[2.0, 2.0, 2.0], 1e-5);
        // sqrt((x + 2)^2) = x + 2
        let root = sq.sqrt();
        assert_close(root.derivative(1), &[1.0, 1.0, 1.0], 1e-5);
        assert_close(root.derivative(2), &[0.0, 0.0, 0.0], 1e-4);
        // 1 / (x + 2) -> -1/(x+2)^2, 2/(x+2)^3
        let one = Jet::constant(column(&[1.0, 1.0, 1.0]), 2);
        let inv = one.div(&shifted);
        let d2: Vec<f32> = xs.iter().map(|v| 2.0 / (v + 2.0).powi(3)).collect();
        assert_close(inv.derivative(2), &d2, 1e-4);
        // exp(2x) -> 4 exp(2x)
        let e = x.mul_scalar(2.0).exp();
        let d2: Vec<f32> = xs.iter().map(|v| 4.0 * (2.0 * v).exp()).collect();
        assert_close(e.derivative(2), &d2, 1e-3);
    }

    #[test]
    fn constants_have_zero_derivatives() {
        let c = Jet::constant(column(&[3.0, 4.0]), 2);
        assert_eq!(c.order(), 2);
        assert_close(c.derivative(1), &[0.0, 0.0], 1e-12);
        assert_close(c.sub(&c).value(), &[0.0, 0.0], 1e-12);
    }
}
