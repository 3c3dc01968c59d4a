//! 検証・テスト時の出力ごとの誤差指標。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 出力ごとに報告する誤差。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// `‖pred - target‖₂ / ‖target‖₂`
    #[default]
    RelativeL2,
    Mse,
    MaxAbs,
}

/// 複数ブロックにまたがって誤差を集計します。
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    fields: BTreeMap<String, Sums>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Sums {
    count: usize,
    err_sq: f64,
    target_sq: f64,
    max_abs: f64,
}

impl MetricAccumulator {
    pub fn add(&mut self, name: &str, prediction: &[f32], target: &[f32]) {
        let sums = self.fields.entry(name.to_string()).or_default();
        for (&p, &t) in prediction.iter().zip(target) {
            let err = (p - t) as f64;
            sums.count += 1;
            sums.err_sq += err * err;
            sums.target_sq += (t as f64) * (t as f64);
            sums.max_abs = sums.max_abs.max(err.abs());
        }
    }

    /// 目標値がゼロの残差。
    pub fn add_residual(&mut self, name: &str, residual: &[f32]) {
        let zeros = vec![0.0; residual.len()];
        self.add(name, residual, &zeros);
    }

    pub fn finish(&self, metric: Metric) -> BTreeMap<String, f64> {
        self.fields
            .iter()
            .map(|(name, s)| {
                let value = if s.count == 0 {
                    0.0
                } else {
                    match metric {
                        // 目標値が恒等的にゼロなら相対誤差は定義できないので二乗平均平方根
                        Metric::RelativeL2 if s.target_sq == 0.0 => (s.err_sq / s.count as f64).sqrt(),
                        Metric::RelativeL2 => (s.err_sq / s.target_sq).sqrt(),
                        Metric::Mse => s.err_sq / s.count as f64,
                        Metric::MaxAbs => s.max_abs,
                    }
                };
                (name.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn relative_l2_over_blocks() {
        let mut acc = MetricAccumulator::default();
        acc.add("u", &[1.0, 2.0], &[1.0, 1.0]);
        acc.add("u", &[0.0], &[1.0]);
        let metrics = acc.finish(Metric::RelativeL2);
        assert_relative_eq!(metrics["u"], (2.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(acc.finish(Metric::MaxAbs)["u"], 1.0);
        assert_relative_eq!(acc.finish(Metric::Mse)["u"], 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn residuals_use_rms() {
        let mut acc = MetricAccumulator::default();
        acc.add_residual("f", &[3.0, 4.0]);
        assert_relative_eq!(acc.finish(Metric::RelativeL2)["f"], (12.5f64).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(acc.finish(Metric::Mse)["f"], 12.5, epsilon = 1e-12);
        assert_relative_eq!(acc.finish(Metric::MaxAbs)["f"], 4.0);
    }

    #[test]
    fn zero_target_keeps_selected_metric() {
        let mut acc = MetricAccumulator::default();
        acc.add("v", &[3.0, 1.0], &[0.0, 0.0]);
        assert_relative_eq!(acc.finish(Metric::RelativeL2)["v"], 5.0f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(acc.finish(Metric::Mse)["v"], 5.0, epsilon = 1e-12);
        assert_relative_eq!(acc.finish(Metric::MaxAbs)["v"], 3.0);
    }
}
