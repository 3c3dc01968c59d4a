//! 学習済みパラメータとメタデータの保存・読み込み。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::BoundingBox;
use crate::error::Result;
use crate::model::{InputScaling, PinnModel, PinnModelConfig};

/// パラメータを保存するファイル名
pub const MODEL_FILENAME: &str = "model.mpk";
/// メタデータを保存するファイル名
pub const META_FILENAME: &str = "checkpoint.json";

/// 重みと一緒に保存する情報。推論時の入力変換もここから復元します。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub loss: f64,
    pub model: PinnModelConfig,
    /// 追加変数の学習後の値。
    pub extra: BTreeMap<String, f64>,
    pub bounds: BoundingBox,
    pub normalize_inputs: bool,
}

impl CheckpointMeta {
    pub fn scaling<B: Backend>(&self, device: &B::Device) -> InputScaling<B> {
        if self.normalize_inputs {
            InputScaling::from_bounds(&self.bounds, device)
        } else {
            InputScaling::identity(self.bounds.dim(), device)
        }
    }
}

/// `dir` に重みとメタデータを書き出します。既存の内容は上書きされます。
pub fn save<B: Backend>(dir: &Path, model: &PinnModel<B>, meta: &CheckpointMeta) -> Result<()> {
    fs::create_dir_all(dir)?;
    model
        .clone()
        .save_file(dir.join(MODEL_FILENAME), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())?;
    fs::write(dir.join(META_FILENAME), serde_json::to_string_pretty(meta)?)?;
    info!(dir = %dir.display(), epoch = meta.epoch, "チェックポイントを保存しました");
    Ok(())
}

/// 読み込んだチェックポイント。
#[derive(Debug)]
pub struct Checkpoint<B: Backend> {
    pub model: PinnModel<B>,
    pub meta: CheckpointMeta,
}

impl<B: Backend> Checkpoint<B> {
    pub fn load(dir: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let dir = dir.as_ref();
        let meta: CheckpointMeta = serde_json::from_str(&fs::read_to_string(dir.join(META_FILENAME))?)?;
        let model = meta.model.init::<B>(device)?.load_file(
            dir.join(MODEL_FILENAME),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )?;
        Ok(Self { model, meta })
    }

    pub fn scaling(&self, device: &B::Device) -> InputScaling<B> {
        self.meta.scaling(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExtraVariable, MlpConfig};
    use burn::backend::NdArray;
    use burn::tensor::{Tensor, TensorData};

    type TestBackend = NdArray<f32>;

    #[test]
    fn round_trip_restores_weights_and_extra() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = PinnModelConfig::new(MlpConfig::new(2, 1).with_hidden_size(5), vec!["u".into()])
            .with_extra_variables(vec![ExtraVariable {
                name: "c".into(),
                init: 0.75,
            }]);
        let model = config.init::<TestBackend>(&device).unwrap();
        let meta = CheckpointMeta {
            epoch: 3,
            loss: 0.5,
            model: config.clone(),
            extra: BTreeMap::from([("c".to_string(), 0.75)]),
            bounds: BoundingBox::new(vec![-1.0, 0.0], vec![1.0, 1.0]).unwrap(),
            normalize_inputs: true,
        };
        save(dir.path(), &model, &meta).unwrap();

        let loaded = Checkpoint::<TestBackend>::load(dir.path(), &device).unwrap();
        let input = Tensor::<TestBackend, 2>::from_data(TensorData::new(vec![0.2f32, 0.3], [1, 2]), &device);
        let before = model.network.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let after = loaded.model.network.forward(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(before, after);
        assert_eq!(loaded.model.extra_values().unwrap(), vec![0.75]);
        assert_eq!(loaded.meta.epoch, 3);
        assert_eq!(loaded.meta.model.outputs, vec!["u".to_string()]);
    }

    #[test]
    fn missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Checkpoint::<TestBackend>::load(dir.path().join("nothing"), &Default::default());
        assert!(matches!(result, Err(crate::error::PinnError::Io(_))));
    }
}
