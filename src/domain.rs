//! 時間・空間の座標範囲を表す値オブジェクト。

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{PinnError, Result};

/// 両端を含む等間隔の点列を生成します。
fn linspace(lo: f64, hi: f64, points: usize) -> Array1<f64> {
    if points == 1 {
        return Array1::from_elem(1, lo);
    }
    let step = (hi - lo) / (points - 1) as f64;
    Array1::from_iter((0..points).map(|i| if i == points - 1 { hi } else { lo + step * i as f64 }))
}

fn check_range(name: &str, lo: f64, hi: f64, points: usize) -> Result<()> {
    if !lo.is_finite() || !hi.is_finite() || lo > hi {
        return Err(PinnError::config(format!(
            "{name} の範囲 [{lo}, {hi}] が不正です"
        )));
    }
    if points == 0 {
        return Err(PinnError::config(format!("{name} の点数が0です")));
    }
    Ok(())
}

/// 時間区間と時刻点数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDomain {
    t_interval: (f64, f64),
    t_points: usize,
}

impl TimeDomain {
    pub fn new(t_interval: [f64; 2], t_points: usize) -> Result<Self> {
        check_range("t_interval", t_interval[0], t_interval[1], t_points)?;
        Ok(Self {
            t_interval: (t_interval[0], t_interval[1]),
            t_points,
        })
    }

    pub fn interval(&self) -> (f64, f64) {
        self.t_interval
    }

    pub fn len(&self) -> usize {
        self.t_points
    }

    pub fn is_empty(&self) -> bool {
        self.t_points == 0
    }

    /// 時刻の列（昇順）。
    pub fn points(&self) -> Array1<f64> {
        linspace(self.t_interval.0, self.t_interval.1, self.t_points)
    }
}

/// 1軸分の空間区間。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    x_interval: (f64, f64),
    points: usize,
}

impl Interval {
    pub fn new(x_interval: [f64; 2], points: usize) -> Result<Self> {
        check_range("x_interval", x_interval[0], x_interval[1], points)?;
        Ok(Self {
            x_interval: (x_interval[0], x_interval[1]),
            points,
        })
    }

    pub fn interval(&self) -> (f64, f64) {
        self.x_interval
    }

    pub fn len(&self) -> usize {
        self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    pub fn points(&self) -> Array1<f64> {
        linspace(self.x_interval.0, self.x_interval.1, self.points)
    }
}

/// 空間領域。軸ごとの区間の直積格子、または任意の点集合を保持します。
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialDomain {
    points: Array2<f64>,
}

impl SpatialDomain {
    /// 各軸の区間から直積格子を作ります（先頭の軸が最も遅く変化）。
    pub fn grid(axes: &[Interval]) -> Result<Self> {
        if axes.is_empty() {
            return Err(PinnError::config("空間軸が1つもありません"));
        }
        let dim = axes.len();
        let total: usize = axes.iter().map(Interval::len).product();
        let values: Vec<Array1<f64>> = axes.iter().map(Interval::points).collect();
        let mut points = Array2::zeros((total, dim));
        for row in 0..total {
            let mut rem = row;
            for axis in (0..dim).rev() {
                let n = values[axis].len();
                points[[row, axis]] = values[axis][rem % n];
                rem /= n;
            }
        }
        Ok(Self { points })
    }

    pub fn from_interval(interval: Interval) -> Result<Self> {
        Self::grid(&[interval])
    }

    /// 格子でない任意の点集合（`n × d`）から作ります。
    pub fn from_points(points: Array2<f64>) -> Result<Self> {
        if points.nrows() == 0 || points.ncols() == 0 {
            return Err(PinnError::config("空間点の集合が空です"));
        }
        if points.iter().any(|v| !v.is_finite()) {
            return Err(PinnError::config("空間点に非有限値が含まれています"));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &Array2<f64> {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.points.ncols()
    }
}

/// 座標ごとの下限・上限。最後の成分が時間です。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lb: Vec<f64>,
    pub ub: Vec<f64>,
}

impl BoundingBox {
    pub fn new(lb: Vec<f64>, ub: Vec<f64>) -> Result<Self> {
        if lb.len() != ub.len() || lb.is_empty() {
            return Err(PinnError::config(format!(
                "lb ({}) と ub ({}) の次元が一致しません",
                lb.len(),
                ub.len()
            )));
        }
        if lb.iter().zip(&ub).any(|(l, u)| l > u) {
            return Err(PinnError::config("lb が ub を上回る成分があります"));
        }
        Ok(Self { lb, ub })
    }

    /// 空間点と時刻列を覆う最小の箱。
    pub(crate) fn enclosing(spatial: &Array2<f64>, time: &Array1<f64>) -> Self {
        let dim = spatial.ncols();
        let mut lb = vec![f64::INFINITY; dim + 1];
        let mut ub = vec![f64::NEG_INFINITY; dim + 1];
        for row in spatial.rows() {
            for (axis, &v) in row.iter().enumerate() {
                lb[axis] = lb[axis].min(v);
                ub[axis] = ub[axis].max(v);
            }
        }
        for &t in time {
            lb[dim] = lb[dim].min(t);
            ub[dim] = ub[dim].max(t);
        }
        Self { lb, ub }
    }

    /// 座標の次元（空間 + 時間）。
    pub fn dim(&self) -> usize {
        self.lb.len()
    }

    pub fn spatial_lb(&self) -> &[f64] {
        &self.lb[..self.lb.len() - 1]
    }

    pub fn spatial_ub(&self) -> &[f64] {
        &self.ub[..self.ub.len() - 1]
    }

    pub fn contains(&self, point: &[f64]) -> bool {
        point.len() == self.dim()
            && point
                .iter()
                .zip(self.lb.iter().zip(&self.ub))
                .all(|(p, (l, u))| l <= p && p <= u)
    }

    pub fn union(&self, other: &Self) -> Result<Self> {
        if self.dim() != other.dim() {
            return Err(PinnError::config(format!(
                "次元の異なる領域 ({} と {}) は結合できません",
                self.dim(),
                other.dim()
            )));
        }
        let lb = self.lb.iter().zip(&other.lb).map(|(a, b)| a.min(*b)).collect();
        let ub = self.ub.iter().zip(&other.ub).map(|(a, b)| a.max(*b)).collect();
        Ok(Self { lb, ub })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn time_domain_is_inclusive_linspace() {
        let time = TimeDomain::new([0.0, 1.0], 101).unwrap();
        let points = time.points();
        assert_eq!(points.len(), 101);
        assert_eq!(points[0], 0.0);
        assert_eq!(points[100], 1.0);
        assert_relative_eq!(points[37], 0.37, epsilon = 1e-12);
    }

    #[test]
    fn rejects_empty_or_reversed_ranges() {
        assert!(TimeDomain::new([0.0, 1.0], 0).is_err());
        assert!(Interval::new([1.0, -1.0], 10).is_err());
    }

    #[test]
    fn grid_orders_first_axis_slowest() {
        let x = Interval::new([0.0, 1.0], 2).unwrap();
        let y = Interval::new([10.0, 12.0], 3).unwrap();
        let grid = SpatialDomain::grid(&[x, y]).unwrap();
        assert_eq!(grid.len(), 6);
        assert_eq!(grid.dim(), 2);
        assert_eq!(grid.points().row(0).to_vec(), vec![0.0, 10.0]);
        assert_eq!(grid.points().row(2).to_vec(), vec![0.0, 12.0]);
        assert_eq!(grid.points().row(3).to_vec(), vec![1.0, 10.0]);
    }

    #[test]
    fn bounding_box_union_and_contains() {
        let a = BoundingBox::new(vec![-1.0, 0.0], vec![0.0, 1.0]).unwrap();
        let b = BoundingBox::new(vec![0.0, 0.5], vec![2.0, 3.0]).unwrap();
        let u = a.union(&b).unwrap();
        assert_eq!(u.lb, vec![-1.0, 0.0]);
        assert_eq!(u.ub, vec![2.0, 3.0]);
        assert!(u.contains(&[1.5, 2.0]));
        assert!(!u.contains(&[1.5]));
        assert_eq!(u.spatial_lb(), &[-1.0]);
    }
}
