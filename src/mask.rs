//! Lightweight face detector trained at 224x224 on a WIDER-FACE dataset in
//! VOC layout.

use crate::{
    config::{ExpConfig, SchedulerKind},
    data::{CacheType, Split, VocDetection},
    evaluator::VocEvaluator,
    exp::{EvalDatasetOptions, Experiment},
    heads::YoloxHead,
    layers::init_norm_layers,
    pafpn::YoloPafpn,
    transforms::{Preproc, TrainTransform, ValTransform},
    yolox::Yolox,
};
use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use std::path::Path;

const IN_CHANNELS: [usize; 3] = [256, 512, 1024];

/// Experiment name derived from a source file path: its stem.
fn exp_name_from_source(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

pub fn face_config() -> ExpConfig {
    ExpConfig {
        num_classes: 1,
        depth: 0.33,
        width: 0.25,
        input_size: (224, 224),
        data_num_workers: 2,
        test_size: (224, 224),
        enable_mixup: false,

        warmup_epochs: 2,
        max_epoch: 100,
        warmup_lr: 0.0,
        min_lr_ratio: 0.001,
        basic_lr_per_img: 0.0005 / 16.0,
        scheduler: SchedulerKind::YoloxWarmCos,
        no_aug_epochs: 2,
        ema: true,
        weight_decay: 1e-3,
        momentum: 0.9,

        exp_name: exp_name_from_source(file!()),
        data_dir: r"D:\YOLOX\datasets\wider_face".to_string(),

        print_interval: 100,
        eval_interval: 10,

        test_conf: 0.1,
        nmsthre: 0.7,
        ..ExpConfig::default()
    }
}

pub struct MaskExp<B: Backend> {
    pub config: ExpConfig,
    device: B::Device,
    model: Option<Yolox<B>>,
}

impl<B: Backend> MaskExp<B> {
    pub fn new(device: B::Device) -> Self {
        Self::with_config(face_config(), device)
    }

    pub fn with_config(config: ExpConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            model: None,
        }
    }

    fn build_model(config: &ExpConfig, device: &B::Device) -> Yolox<B> {
        // nano variant: depthwise convolutions throughout
        let backbone = YoloPafpn::new(config.depth, config.width, IN_CHANNELS, true, config.act, device);
        let head = YoloxHead::new(config.num_classes, config.width, IN_CHANNELS, true, config.act, device);
        Yolox::new(backbone, head)
    }
}

impl<B: Backend> Experiment<B> for MaskExp<B> {
    fn config(&self) -> &ExpConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut ExpConfig {
        &mut self.config
    }

    fn device(&self) -> &B::Device {
        &self.device
    }

    fn get_model(&mut self, _sublinear: bool) -> &Yolox<B> {
        let model = self
            .model
            .get_or_insert_with(|| Self::build_model(&self.config, &self.device));
        init_norm_layers(model, 1e-3, 0.03);
        model.head.initialize_biases(1e-2);
        model
    }

    fn take_model(&mut self) -> Option<Yolox<B>> {
        self.model.take()
    }

    fn get_dataset(&self, cache: bool, cache_type: CacheType) -> Result<VocDetection> {
        let preproc = Preproc::Train(TrainTransform {
            max_labels: 50,
            flip_prob: self.config.flip_prob,
            hsv_prob: self.config.hsv_prob,
        });
        VocDetection::new(&self.config.data_dir, Split::Train, self.config.input_size, preproc, cache, cache_type)
            .with_context(|| format!("Dataset d'entraînement {}", self.config.data_dir))
    }

    fn get_eval_dataset(&self, opts: EvalDatasetOptions) -> Result<VocDetection> {
        let preproc = Preproc::Val(ValTransform::new(opts.legacy));
        VocDetection::new(&self.config.data_dir, Split::Val, self.config.test_size, preproc, false, CacheType::Ram)
            .with_context(|| format!("Dataset de validation {}", self.config.data_dir))
    }

    fn get_evaluator<EB: Backend>(
        &self,
        batch_size: usize,
        is_distributed: bool,
        testdev: bool,
        legacy: bool,
    ) -> Result<VocEvaluator<EB>> {
        let loader = self.get_eval_loader(batch_size, is_distributed, testdev, legacy)?;
        Ok(VocEvaluator::new(
            loader,
            self.config.test_size,
            self.config.test_conf,
            self.config.nmsthre,
            self.config.num_classes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Layer, Layers};
    use burn::backend::NdArray;

    fn norm_settings(model: &Yolox<NdArray<f32>>) -> Vec<(f64, f64)> {
        let mut settings = Vec::new();
        model.visit_layers(&mut |layer| {
            if let Layer::BatchNorm(bn) = layer {
                settings.push((bn.epsilon, bn.momentum));
            }
        });
        settings
    }

    #[test]
    fn get_model_reapplies_init_to_cached_model() {
        let mut exp = MaskExp::<NdArray<f32>>::new(Default::default());
        exp.get_model(false);
        let mut model = exp.take_model().unwrap();
        init_norm_layers(&mut model, 1e-5, 0.1);
        exp.model = Some(model);

        let settings = norm_settings(exp.get_model(false));
        assert!(!settings.is_empty());
        assert!(settings.iter().all(|&s| s == (1e-3, 0.03)));
    }

    #[test]
    fn exp_name_is_the_source_stem() {
        assert_eq!(exp_name_from_source("src/mask.rs"), "mask");
        assert_eq!(exp_name_from_source("/abs/exps/face_tiny.rs"), "face_tiny");
        assert_eq!(face_config().exp_name, "mask");
    }
}
