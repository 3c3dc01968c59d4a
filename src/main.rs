//! # 物理情報ニューラルネットワーク (PINN) 学習プログラム
//!
//! 1次元の移流方程式 `u_t + c u_x = 0` をPINNで解きます。
//!
//! ## 使い方
//!
//! ### 学習
//! ```bash
//! cargo run --release -- train --output runs/advection
//! ```
//!
//! ### 逆問題（移流速度の推定）
//! ```bash
//! cargo run --release -- train --inverse --output runs/inverse
//! ```
//!
//! ### 推論
//! ```bash
//! cargo run --release -- infer --run-dir runs/advection
//! ```
//!
//! ログの詳細度は `RUST_LOG` で変更できます（既定は `info`）。

use clap::Parser;
use pinn::cli::{Cli, Commands};
use pinn::{inference, training};
use tracing_subscriber::EnvFilter;

/// プログラムのエントリーポイント。
///
/// コマンドライン引数を解析し、`train`または`infer`の処理に振り分けます。
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => training::run(args),
        Commands::Infer(args) => inference::run(args),
    }
}
