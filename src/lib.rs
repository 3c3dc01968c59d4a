//! # 物理情報ニューラルネットワーク (PINN) ライブラリ
//!
//! `burn` フレームワークを使用して、物理情報ニューラルネットワーク（PINN）を構築・学習するための
//! 主要なコンポーネントを提供します。
//!
//! - 領域とデータ: [`domain`], [`mesh`]
//! - 学習点の抽出: [`sampling`], [`condition`], [`datamodule`]
//! - ネットワークと微分: [`model`], [`jet`], [`physics`]
//! - 学習: [`loss`], [`trainer`], [`precision`], [`metric`], [`checkpoint`], [`config`]
//! - デモ（1次元移流方程式）: [`advection`], [`training`], [`inference`], [`plot`], [`cli`]

pub mod advection;
pub mod checkpoint;
pub mod cli;
pub mod condition;
pub mod config;
pub mod datamodule;
pub mod domain;
pub mod error;
pub mod inference;
pub mod jet;
pub mod loss;
pub mod mesh;
pub mod metric;
pub mod model;
pub mod physics;
pub mod plot;
pub mod precision;
pub mod sampling;
pub mod trainer;
pub mod training;

pub use error::{PinnError, Result};

/// 実験設定を保存するファイル名
pub const EXPERIMENT_FILENAME: &str = "experiment.json";
/// チェックポイントを保存するディレクトリ名
pub const CHECKPOINT_DIR: &str = "checkpoint";
/// 学習結果の要約を保存するファイル名
pub const SUMMARY_FILENAME: &str = "summary.json";
/// 損失グラフのファイル名
pub const LOSS_GRAPH_FILENAME: &str = "loss_graph.png";
/// 予測断面グラフのファイル名
pub const SLICE_GRAPH_FILENAME: &str = "slices.png";
