//! インデックスの抽出方法（一様乱択 / ラテン超方格）。

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{PinnError, Result};

/// 点の抽出方法。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// 非復元の一様乱択。
    #[default]
    Uniform,
    /// 各軸を点数で層化し、層の組み合わせをランダムに対応付ける。
    LatinHypercube,
}

/// 格子 `dims` から `count` 点の多重インデックスを抽出します。
///
/// `count` が `None` のときは全点を行優先の順で返します。
pub fn draw<R: Rng + ?Sized>(
    rng: &mut R,
    dims: &[usize],
    count: Option<usize>,
    strategy: SamplingStrategy,
) -> Result<Vec<Vec<usize>>> {
    let population: usize = dims.iter().product();
    if population == 0 {
        return Err(PinnError::config("抽出元の点数が0です"));
    }
    let Some(count) = count else {
        return Ok((0..population).map(|flat| unflatten(flat, dims)).collect());
    };
    if count == 0 {
        return Err(PinnError::config("num_sample は1以上である必要があります"));
    }
    match strategy {
        SamplingStrategy::Uniform => {
            if count > population {
                return Err(PinnError::config(format!(
                    "num_sample {count} が抽出元の点数 {population} を超えています"
                )));
            }
            Ok(rand::seq::index::sample(rng, population, count)
                .into_vec()
                .into_iter()
                .map(|flat| unflatten(flat, dims))
                .collect())
        }
        SamplingStrategy::LatinHypercube => Ok(latin_hypercube(rng, dims, count)),
    }
}

/// `draw` の結果を行優先の平坦インデックスにしたもの。
pub fn draw_flat<R: Rng + ?Sized>(
    rng: &mut R,
    dims: &[usize],
    count: Option<usize>,
    strategy: SamplingStrategy,
) -> Result<Vec<usize>> {
    Ok(draw(rng, dims, count, strategy)?
        .into_iter()
        .map(|index| flatten(&index, dims))
        .collect())
}

fn latin_hypercube<R: Rng + ?Sized>(rng: &mut R, dims: &[usize], count: usize) -> Vec<Vec<usize>> {
    let strata: Vec<Vec<usize>> = dims
        .iter()
        .map(|_| {
            let mut perm: Vec<usize> = (0..count).collect();
            perm.shuffle(rng);
            perm
        })
        .collect();
    (0..count)
        .map(|k| {
            dims.iter()
                .zip(&strata)
                .map(|(&n, perm)| {
                    let u = (perm[k] as f64 + rng.random::<f64>()) / count as f64;
                    ((u * n as f64) as usize).min(n - 1)
                })
                .collect()
        })
        .collect()
}

fn unflatten(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut index = vec![0; dims.len()];
    for axis in (0..dims.len()).rev() {
        index[axis] = flat % dims[axis];
        flat /= dims[axis];
    }
    index
}

fn flatten(index: &[usize], dims: &[usize]) -> usize {
    index.iter().zip(dims).fold(0, |acc, (&i, &n)| acc * n + i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::BTreeSet;

    #[test]
    fn all_points_in_row_major_order() {
        let mut rng = StdRng::seed_from_u64(0);
        let flat = draw_flat(&mut rng, &[3, 4], None, SamplingStrategy::Uniform).unwrap();
        assert_eq!(flat, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn uniform_draws_distinct_points() {
        let mut rng = StdRng::seed_from_u64(7);
        let flat = draw_flat(&mut rng, &[10, 10], Some(40), SamplingStrategy::Uniform).unwrap();
        assert_eq!(flat.len(), 40);
        assert_eq!(flat.iter().collect::<BTreeSet<_>>().len(), 40);
        assert!(flat.iter().all(|&i| i < 100));
        assert!(draw_flat(&mut rng, &[2, 2], Some(5), SamplingStrategy::Uniform).is_err());
        assert!(draw_flat(&mut rng, &[2, 2], Some(0), SamplingStrategy::Uniform).is_err());
    }

    #[test]
    fn latin_hypercube_hits_every_stratum() {
        let mut rng = StdRng::seed_from_u64(3);
        let points = draw(&mut rng, &[100, 50], Some(10), SamplingStrategy::LatinHypercube).unwrap();
        assert_eq!(points.len(), 10);
        let space: BTreeSet<usize> = points.iter().map(|p| p[0] / 10).collect();
        let time: BTreeSet<usize> = points.iter().map(|p| p[1] / 5).collect();
        assert_eq!(space.len(), 10);
        assert_eq!(time.len(), 10);
    }

    #[test]
    fn flatten_inverts_unflatten() {
        let dims = [3, 5, 2];
        for flat in 0..30 {
            assert_eq!(flatten(&unflatten(flat, &dims), &dims), flat);
        }
    }
}
