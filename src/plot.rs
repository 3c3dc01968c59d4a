//! 損失履歴と予測断面のPNG出力。

use std::error::Error;
use std::path::Path;

use plotters::prelude::*;

use crate::trainer::EpochLog;

/// 学習過程の損失（合計と項ごと）を log10 スケールで描画します。
pub fn plot_loss_history(path: &Path, history: &[EpochLog]) -> Result<(), Box<dyn Error>> {
    if history.is_empty() {
        return Err("損失履歴が空です".into());
    }
    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let log = |v: f64| v.max(f64::MIN_POSITIVE).log10();
    let values = history
        .iter()
        .flat_map(|h| std::iter::once(h.loss).chain(h.terms.values().copied()))
        .map(log);
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let first = history[0].epoch;
    let last = history[history.len() - 1].epoch.max(first + 1);

    let mut chart = ChartBuilder::on(&root)
        .caption("Loss History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(first..last, (min - 0.5)..(max + 0.5))?;
    chart
        .configure_mesh()
        .y_desc("Loss (log10 scale)")
        .x_desc("Epoch")
        .draw()?;

    chart
        .draw_series(LineSeries::new(history.iter().map(|h| (h.epoch, log(h.loss))), &RED))?
        .label("Total Loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

    for (i, label) in history[0].terms.keys().enumerate() {
        let color = Palette99::pick(i + 1).to_rgba();
        let points = history
            .iter()
            .filter_map(|h| h.terms.get(label).map(|&v| (h.epoch, log(v))));
        chart
            .draw_series(LineSeries::new(points, color))?
            .label(label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// ある時刻での予測と参照解の断面。
#[derive(Debug, Clone)]
pub struct Slice {
    pub time: f64,
    pub prediction: Vec<f64>,
    pub reference: Vec<f64>,
}

/// 時刻断面ごとに予測（細線）と参照解（太い半透明線）を重ねて描画します。
pub fn plot_slices(path: &Path, x: &[f64], slices: &[Slice]) -> Result<(), Box<dyn Error>> {
    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let (x_min, x_max) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let (y_min, y_max) = slices
        .iter()
        .flat_map(|s| s.prediction.iter().chain(&s.reference))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !(x_min.is_finite() && y_min.is_finite()) {
        return Err("描画するデータがありません".into());
    }
    let margin = 0.1 * (y_max - y_min).max(1e-6);

    let mut chart = ChartBuilder::on(&root)
        .caption("Prediction vs Reference", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(x_min..x_max, (y_min - margin)..(y_max + margin))?;
    chart.configure_mesh().x_desc("x").y_desc("u").draw()?;

    for (i, slice) in slices.iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(LineSeries::new(
                x.iter().copied().zip(slice.prediction.iter().copied()),
                color.stroke_width(2),
            ))?
            .label(format!("t = {:.2}", slice.time))
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        chart.draw_series(LineSeries::new(
            x.iter().copied().zip(slice.reference.iter().copied()),
            color.mix(0.35).stroke_width(4),
        ))?;
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(plot_loss_history(&dir.path().join("loss.png"), &[]).is_err());
    }
}
