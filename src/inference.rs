use std::time::Instant;

use burn::backend::NdArray;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::advection::{ExperimentConfig, SOLUTION};
use crate::checkpoint::Checkpoint;
use crate::cli::InferArgs;
use crate::condition::{Block, Condition, MeshSampler, MeshSamplerConfig};
use crate::metric::{Metric, MetricAccumulator};
use crate::plot::{Slice, plot_slices};
use crate::trainer::predict_points;
use crate::{CHECKPOINT_DIR, EXPERIMENT_FILENAME, SLICE_GRAPH_FILENAME};

type MyBackend = NdArray<f32>;

/// `infer`サブコマンドを実行します。
pub fn run(args: &InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    let device = Default::default();
    let experiment = args.run_dir.join(EXPERIMENT_FILENAME);
    if !experiment.exists() {
        return Err(format!(
            "実験設定 '{}' が見つかりません。\n最初に 'train' コマンドでモデルを学習・保存してください。",
            experiment.display()
        )
        .into());
    }
    let config = ExperimentConfig::load(&experiment)?;

    info!("推論を実行します - バックエンド: NdArray (CPU)");
    let inference_start = Instant::now();
    let checkpoint = Checkpoint::<MyBackend>::load(args.run_dir.join(CHECKPOINT_DIR), &device)?;
    info!(epoch = checkpoint.meta.epoch, loss = checkpoint.meta.loss, "チェックポイントをロードしました");

    // メッシュ全体を行優先（空間が外側）で取り出す
    let mesh = config.mesh()?;
    let reference = MeshSampler::new(
        "reference",
        mesh.clone(),
        MeshSamplerConfig {
            solution: vec![SOLUTION.into()],
            ..Default::default()
        },
        &mut StdRng::seed_from_u64(0),
    )?;
    let Block::Supervised { points, targets, .. } = reference.block() else {
        return Err("参照ブロックの種類が想定外です".into());
    };
    let outputs = predict_points(
        &checkpoint.model,
        &checkpoint.scaling(&device),
        &checkpoint.meta.model.outputs,
        &config.problem(),
        points,
        &device,
    )?;
    let inference_duration = inference_start.elapsed();

    let prediction = outputs
        .get(SOLUTION)
        .ok_or_else(|| format!("出力 '{SOLUTION}' がありません"))?;
    let target = targets
        .get(SOLUTION)
        .ok_or_else(|| format!("参照解 '{SOLUTION}' がありません"))?;
    let as_f32 = |v: &ndarray::Array1<f64>| v.iter().map(|&x| x as f32).collect::<Vec<f32>>();
    let mut acc = MetricAccumulator::default();
    acc.add(SOLUTION, &as_f32(prediction), &as_f32(target));
    let rel_l2 = acc.finish(Metric::RelativeL2)[SOLUTION];
    let max_abs = acc.finish(Metric::MaxAbs)[SOLUTION];
    info!(
        points = points.len(),
        relative_l2 = rel_l2,
        max_abs,
        elapsed = ?inference_duration,
        "推論が完了しました"
    );
    for (name, value) in &checkpoint.meta.extra {
        info!(name = %name, value, "追加変数");
    }

    let (nx, nt) = (config.x_points, config.t_points);
    let x: Vec<f64> = (0..nx).map(|i| points.spatial[[i * nt, 0]]).collect();
    let slices: Vec<Slice> = [0, nt / 2, nt - 1]
        .into_iter()
        .map(|j| Slice {
            time: points.time[j],
            prediction: (0..nx).map(|i| prediction[i * nt + j]).collect(),
            reference: (0..nx).map(|i| target[i * nt + j]).collect(),
        })
        .collect();
    let graph = args.run_dir.join(SLICE_GRAPH_FILENAME);
    match plot_slices(&graph, &x, &slices) {
        Ok(()) => info!(path = %graph.display(), "断面グラフを保存しました"),
        Err(e) => warn!(error = %e, "グラフの描画に失敗しました"),
    }
    Ok(())
}
