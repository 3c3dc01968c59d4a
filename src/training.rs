use std::fs;

use burn::backend::{Autodiff, NdArray};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::advection::ExperimentConfig;
use crate::cli::TrainArgs;
use crate::config::CheckpointConfig;
use crate::plot::plot_loss_history;
use crate::trainer::Trainer;
use crate::{CHECKPOINT_DIR, EXPERIMENT_FILENAME, LOSS_GRAPH_FILENAME, SUMMARY_FILENAME};

type MyBackend = Autodiff<NdArray<f32>>;

/// `train`サブコマンドを実行します。
pub fn run(args: &TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.trainer.max_epochs = epochs;
    }
    config.inverse |= args.inverse;
    if config.trainer.checkpoint.is_none() {
        config.trainer.checkpoint = Some(CheckpointConfig {
            dir: args.output.join(CHECKPOINT_DIR),
            every_n_epochs: config.trainer.max_epochs,
        });
    }
    fs::create_dir_all(&args.output)?;
    config.save(args.output.join(EXPERIMENT_FILENAME))?;

    // --- データセットの準備 ---
    let mut rng = StdRng::seed_from_u64(config.sampling_seed);
    let mesh = config.mesh()?;
    let datamodule = config.datamodule(&mesh, &mut rng)?;

    // --- モデルとトレーナーの初期化 ---
    let device = Default::default();
    let mut trainer = Trainer::<MyBackend, _>::new(
        config.model_config(),
        config.problem(),
        config.trainer.clone(),
        device,
    )?;
    trainer.compile(&datamodule)?;

    info!(inverse = config.inverse, "学習を開始します (移流方程式) - バックエンド: NdArray (CPU)");
    let summary = trainer.fit()?;
    info!(
        epochs = summary.epochs,
        loss = summary.final_loss,
        elapsed_secs = summary.elapsed_secs,
        "学習が完了しました"
    );
    for (name, value) in &summary.extra {
        info!(name = %name, value, "推定された追加変数");
    }
    if let Some(report) = summary.validations.last() {
        info!(metrics = ?report.metrics, "最終検証");
    }

    // --- 結果の保存と描画 ---
    let graph = args.output.join(LOSS_GRAPH_FILENAME);
    match plot_loss_history(&graph, &summary.history) {
        Ok(()) => info!(path = %graph.display(), "損失グラフを保存しました"),
        Err(e) => warn!(error = %e, "グラフの描画に失敗しました"),
    }
    fs::write(args.output.join(SUMMARY_FILENAME), serde_json::to_string_pretty(&summary)?)?;
    Ok(())
}
