//! クレート共通のエラー型。

use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

/// 読み込み関数などユーザー側から返される任意のエラー。
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// PINN処理の結果型。
pub type Result<T, E = PinnError> = std::result::Result<T, E>;

/// PINNの構築・学習で発生するエラー。
///
/// どのエラーも再試行せず、その時点で実験を停止させる前提です。
#[derive(Debug, Error)]
pub enum PinnError {
    /// 宣言された領域サイズと読み込んだデータの不一致、重複・未知の名前など。
    /// メッシュやサンプラーの構築時に検出されます。
    #[error("設定エラー: {0}")]
    Configuration(String),

    /// `pde_fn` / `output_fn` が必要なキーを返さない、または形状が合わない。
    #[error("ユーザー関数エラー: {0}")]
    UserFunction(String),

    /// 損失や勾配に非有限値が現れた。
    #[error("数値エラー: {0}")]
    Numerical(String),

    /// データ読み込み関数が失敗した。
    #[error("'{}' からのデータ読み込みに失敗しました: {source}", root.display())]
    DataLoad {
        root: PathBuf,
        #[source]
        source: BoxError,
    },

    /// トレーナーの状態遷移が不正。
    #[error("不正な状態遷移: {0}")]
    State(String),

    #[error("テンソルデータの変換に失敗しました: {0}")]
    TensorData(String),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PinnError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn user_fn(message: impl Into<String>) -> Self {
        Self::UserFunction(message.into())
    }
}
