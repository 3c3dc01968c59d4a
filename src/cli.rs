use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "Physics-informed neural network training with Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（train または infer）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 移流方程式のPINNを学習し、チェックポイントと損失グラフを保存します
    Train(TrainArgs),
    /// 保存されたチェックポイントを使い、メッシュ全体で推論・評価します
    Infer(InferArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// 実験設定（JSON）。省略時は既定値
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// 結果を書き出すディレクトリ
    #[arg(long, default_value = "runs/advection")]
    pub output: PathBuf,
    /// `max_epochs` を上書きします
    #[arg(long)]
    pub epochs: Option<usize>,
    /// 移流速度を未知として推定します
    #[arg(long)]
    pub inverse: bool,
}

#[derive(Args, Debug)]
pub struct InferArgs {
    /// `train` の出力ディレクトリ
    #[arg(long, default_value = "runs/advection")]
    pub run_dir: PathBuf,
}
