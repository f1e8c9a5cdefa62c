//! The experiment seam: a run's configuration plus the factories a trainer
//! or evaluator calls back into.

use crate::{
    config::ExpConfig,
    data::{CacheType, DetectionBatch, DetectionBatcher, DetectionItem, VocDetection},
    evaluator::{EvalLoader, VocEvaluator},
    mosaic::{MosaicDetection, MosaicSwitch},
    scheduler::LrScheduler,
    yolox::Yolox,
};
use anyhow::Result;
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, SgdConfig},
    tensor::backend::Backend,
};
use std::{path::PathBuf, sync::Arc};

/// Options forwarded to [`Experiment::get_eval_dataset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalDatasetOptions {
    pub legacy: bool,
    /// Accepted for interface parity; VOC data has no test-dev split.
    pub testdev: bool,
}

pub type TrainLoader<B> = Arc<dyn DataLoader<B, DetectionBatch<B>>>;

pub trait Experiment<B: Backend> {
    fn config(&self) -> &ExpConfig;
    fn config_mut(&mut self) -> &mut ExpConfig;
    fn device(&self) -> &B::Device;

    /// Cached detector, built on first call. `sublinear` has no effect.
    fn get_model(&mut self, sublinear: bool) -> &Yolox<B>;

    /// Hands the cached detector over, e.g. to a training loop.
    fn take_model(&mut self) -> Option<Yolox<B>>;

    fn get_dataset(&self, cache: bool, cache_type: CacheType) -> Result<VocDetection>;

    fn get_eval_dataset(&self, opts: EvalDatasetOptions) -> Result<VocDetection>;

    fn get_evaluator<EB: Backend>(
        &self,
        batch_size: usize,
        is_distributed: bool,
        testdev: bool,
        legacy: bool,
    ) -> Result<VocEvaluator<EB>>;

    fn exp_name(&self) -> &str {
        &self.config().exp_name
    }

    /// `<output_dir>/<exp_name>`
    fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.config().output_dir).join(self.exp_name())
    }

    fn get_data_loader(
        &self,
        batch_size: usize,
        no_aug: bool,
        cache: bool,
        cache_type: CacheType,
    ) -> Result<(TrainLoader<B>, MosaicSwitch)> {
        let cfg = self.config();
        let dataset = self.get_dataset(cache, cache_type)?;
        let dataset = MosaicDetection::new(dataset, !no_aug, cfg.mosaic_prob, cfg.mixup_prob, cfg.enable_mixup);
        let switch = dataset.switch();

        let mut builder = DataLoaderBuilder::<B, DetectionItem, DetectionBatch<B>>::new(DetectionBatcher::new(cfg.input_size))
            .batch_size(batch_size)
            .shuffle(cfg.seed.unwrap_or(42));
        if cfg.data_num_workers > 0 {
            builder = builder.num_workers(cfg.data_num_workers);
        }
        Ok((builder.build(dataset), switch))
    }

    /// Sequential loader over [`Experiment::get_eval_dataset`].
    fn get_eval_loader<EB: Backend>(
        &self,
        batch_size: usize,
        _is_distributed: bool,
        testdev: bool,
        legacy: bool,
    ) -> Result<EvalLoader<EB>> {
        let cfg = self.config();
        let dataset = Arc::new(self.get_eval_dataset(EvalDatasetOptions { legacy, testdev })?);
        let mut builder = DataLoaderBuilder::<EB, DetectionItem, DetectionBatch<EB>>::new(DetectionBatcher::new(cfg.test_size))
            .batch_size(batch_size);
        if cfg.data_num_workers > 0 {
            builder = builder.num_workers(cfg.data_num_workers);
        }
        Ok(EvalLoader {
            loader: builder.build(dataset.clone()),
            dataset,
        })
    }

    /// SGD with nesterov momentum and weight decay.
    fn get_optimizer(&self) -> SgdConfig {
        let cfg = self.config();
        SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(cfg.momentum)
                    .with_dampening(0.0)
                    .with_nesterov(true),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(cfg.weight_decay as f32)))
    }

    fn get_lr_scheduler(&self, lr: f64, iters_per_epoch: usize) -> LrScheduler {
        let cfg = self.config();
        LrScheduler::new(cfg.scheduler, lr, iters_per_epoch, cfg.max_epoch)
            .with_warmup(cfg.warmup_epochs, cfg.warmup_lr)
            .with_no_aug_epochs(cfg.no_aug_epochs)
            .with_min_lr_ratio(cfg.min_lr_ratio)
    }

    /// Overrides configuration fields from `key value` pairs.
    fn merge(&mut self, opts: &[String]) -> Result<()> {
        self.config_mut().merge(opts)
    }
}
