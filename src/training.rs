use crate::{
    data::{CacheType, DetectionBatch},
    ema::ModelEma,
    evaluator::VocEvaluator,
    exp::{Experiment, TrainLoader},
    layers::count_layers,
    mosaic::MosaicSwitch,
    yolox::Yolox,
};
use anyhow::{anyhow, bail, Context, Result};
use burn::{
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer},
    record::{CompactRecorder, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    marker::PhantomData,
    path::{Path, PathBuf},
    time::Instant,
};

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub batch_size: usize,
    pub cache: bool,
    pub cache_type: CacheType,
    /// Checkpoint to resume from, with or without the `.mpk` extension.
    pub resume: Option<PathBuf>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            cache: false,
            cache_type: CacheType::Ram,
            resume: None,
        }
    }
}

/// Written next to every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub exp_name: String,
    /// Completed epochs; training resumes from here.
    pub epoch: usize,
    pub best_ap: f64,
    pub ema_updates: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub best_ap: f64,
    pub output_dir: PathBuf,
}

pub struct Trainer<B: AutodiffBackend, E: Experiment<B>> {
    exp: E,
    opts: TrainOptions,
    output_dir: PathBuf,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend, E: Experiment<B>> Trainer<B, E> {
    pub fn new(exp: E, opts: TrainOptions) -> Self {
        let output_dir = exp.output_dir();
        Self {
            exp,
            opts,
            output_dir,
            _backend: PhantomData,
        }
    }

    pub fn run(&mut self) -> Result<TrainReport> {
        let cfg = self.exp.config().clone();
        println!("🚀 Démarrage de l'entraînement: {}", self.exp.exp_name());
        println!("📊 Configuration:");
        println!("   - Backend: {}", std::any::type_name::<B>());
        println!("   - Device: {:?}", self.exp.device());
        println!("   - Input size: {}x{}", cfg.input_size.1, cfg.input_size.0);
        println!("   - Batch size: {}", self.opts.batch_size);
        println!("   - Depth/width: {}/{}", cfg.depth, cfg.width);
        println!("   - Scheduler: {}", cfg.scheduler);
        println!("   - Output: {}", self.output_dir.display());

        self.validate_config()?;
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Création de {}", self.output_dir.display()))?;
        cfg.save_json(self.output_dir.join("exp.json"))?;

        let (model, meta) = self.create_model()?;
        let start_epoch = meta.as_ref().map_or(0, |m| m.epoch);
        let (train_loader, switch, evaluator) = self.create_dataloaders(start_epoch)?;
        let optim = self.create_optimizer()?;

        self.train_model(model, optim, train_loader, switch, evaluator, meta)
    }

    fn validate_config(&self) -> Result<()> {
        if self.opts.batch_size == 0 {
            bail!("Batch size must be > 0");
        }
        self.exp.config().validate()
    }

    fn create_model(&mut self) -> Result<(Yolox<B>, Option<CheckpointMeta>)> {
        println!("🛠️  Création du modèle YOLOX...");
        self.exp.get_model(false);
        let mut model = self
            .exp
            .take_model()
            .ok_or_else(|| anyhow!("Experiment did not provide a model"))?;

        let (convs, norms) = count_layers(&model);
        println!("   - {} paramètres, {} convolutions, {} batch-norms", model.num_params(), convs, norms);

        let mut meta = None;
        if let Some(resume) = &self.opts.resume {
            println!("📥 Reprise depuis {}", resume.display());
            model = load_model(model, resume, self.exp.device())?;
            meta = Some(read_meta(&resume.with_extension(""))?);
        }
        Ok((model, meta))
    }

    fn create_dataloaders(&self, start_epoch: usize) -> Result<(TrainLoader<B>, MosaicSwitch, VocEvaluator<B::InnerBackend>)> {
        let cfg = self.exp.config();
        let no_aug = start_epoch >= cfg.max_epoch.saturating_sub(cfg.no_aug_epochs);
        println!("📁 Chargement du dataset depuis '{}'...", cfg.data_dir);

        let (train_loader, switch) =
            self.exp
                .get_data_loader(self.opts.batch_size, no_aug, self.opts.cache, self.opts.cache_type)?;
        if train_loader.num_items() == 0 {
            bail!("Dataset is empty");
        }
        let evaluator = self
            .exp
            .get_evaluator::<B::InnerBackend>(self.opts.batch_size, false, false, false)?;

        println!("   - Entraînement: {} images", train_loader.num_items());
        println!("   - Validation: {} images", evaluator.dataset().len());
        println!("   - Workers: {}", cfg.data_num_workers);
        println!("✅ DataLoaders créés avec succès");
        Ok((train_loader, switch, evaluator))
    }

    fn create_optimizer(&self) -> Result<impl Optimizer<Yolox<B>, B>> {
        let optim = self.exp.get_optimizer().init::<B, Yolox<B>>();
        match &self.opts.resume {
            Some(resume) => {
                let path = optim_path(&resume.with_extension(""));
                println!("📥 État de l'optimiseur: {}", path.display());
                load_optimizer(optim, &path, self.exp.device())
            }
            None => Ok(optim),
        }
    }

    fn train_model<O: Optimizer<Yolox<B>, B>>(
        &self,
        mut model: Yolox<B>,
        mut optim: O,
        train_loader: TrainLoader<B>,
        switch: MosaicSwitch,
        evaluator: VocEvaluator<B::InnerBackend>,
        meta: Option<CheckpointMeta>,
    ) -> Result<TrainReport> {
        let cfg = self.exp.config();
        let batch_size = self.opts.batch_size;
        let iters_per_epoch = train_loader.num_items().div_ceil(batch_size);
        let lr = cfg.basic_lr_per_img * batch_size as f64;
        let scheduler = self.exp.get_lr_scheduler(lr, iters_per_epoch);

        let start_epoch = meta.as_ref().map_or(0, |m| m.epoch);
        let mut best_ap = meta.as_ref().map_or(0.0, |m| m.best_ap);
        let mut ema = cfg
            .ema
            .then(|| ModelEma::<B, Yolox<B>>::new(&model, iters_per_epoch * start_epoch));
        let mut eval_interval = initial_eval_interval(cfg.eval_interval, switch.is_enabled());

        println!("🎯 Démarrage de l'entraînement pour {} époques...", cfg.max_epoch);
        println!("   - Itérations par époque: {}", iters_per_epoch);
        println!("   - Learning rate: {:.6}", lr);
        println!("   - EMA: {}", cfg.ema);

        let start_time = Instant::now();
        let mut global_iter = start_epoch * iters_per_epoch;

        for epoch in start_epoch..cfg.max_epoch {
            if switch.is_enabled() && epoch + 1 >= cfg.max_epoch.saturating_sub(cfg.no_aug_epochs) {
                println!("🔀 Mosaic désactivé à partir de l'époque {}", epoch + 1);
                switch.close();
                eval_interval = 1;
                self.save_checkpoint("last_mosaic_epoch", &model, ema.as_ref(), &optim, epoch, best_ap)?;
            }

            let epoch_start = Instant::now();
            for (iter, batch) in train_loader.iter().enumerate() {
                let DetectionBatch { images, targets, .. } = batch;
                let lr = scheduler.update_lr(global_iter + 1);

                let output = model.loss(images, &targets);
                let total = output.total.clone().into_scalar().elem::<f32>();
                let grads = GradientsParams::from_grads(output.total.backward(), &model);
                model = optim.step(lr, model, grads);
                if let Some(ema) = ema.as_mut() {
                    ema.update(&model);
                }
                global_iter += 1;

                if (iter + 1) % cfg.print_interval == 0 || iter + 1 == iters_per_epoch {
                    let elapsed = epoch_start.elapsed().as_secs_f64();
                    let per_iter = elapsed / (iter + 1) as f64;
                    let remaining = (cfg.max_epoch * iters_per_epoch).saturating_sub(global_iter);
                    println!(
                        "   epoch: {}/{}, iter: {}/{}, total_loss: {:.4}, iou_loss: {:.4}, conf_loss: {:.4}, cls_loss: {:.4}, num_fg: {}, lr: {:.3e}, ETA: {:.0}s",
                        epoch + 1,
                        cfg.max_epoch,
                        iter + 1,
                        iters_per_epoch,
                        total,
                        output.iou_loss,
                        output.obj_loss,
                        output.cls_loss,
                        output.num_fg,
                        lr,
                        per_iter * remaining as f64,
                    );
                }
            }

            self.save_checkpoint("latest_ckpt", &model, ema.as_ref(), &optim, epoch + 1, best_ap)?;

            if (epoch + 1) % eval_interval == 0 {
                let summary = match ema.as_ref() {
                    Some(ema) => evaluator.evaluate(ema.module())?,
                    None => evaluator.evaluate(&model.valid())?,
                };
                if summary.ap50_95 > best_ap {
                    best_ap = summary.ap50_95;
                    println!("🏆 Nouveau meilleur AP50:95: {:.4}", best_ap);
                    self.save_checkpoint("best_ckpt", &model, ema.as_ref(), &optim, epoch + 1, best_ap)?;
                }
                if cfg.save_history_ckpt {
                    let name = format!("epoch_{}_ckpt", epoch + 1);
                    self.save_checkpoint(&name, &model, ema.as_ref(), &optim, epoch + 1, best_ap)?;
                }
            }
        }

        let duration = start_time.elapsed();
        println!("⏱️  Entraînement terminé en {:?}", duration);
        println!("✅ Meilleur AP50:95: {:.4}", best_ap);

        Ok(TrainReport {
            epochs_run: cfg.max_epoch.saturating_sub(start_epoch),
            best_ap,
            output_dir: self.output_dir.clone(),
        })
    }

    /// Saves the averaged weights when EMA is on, the raw weights otherwise,
    /// plus optimizer state and a JSON sidecar.
    fn save_checkpoint<O: Optimizer<Yolox<B>, B>>(
        &self,
        name: &str,
        model: &Yolox<B>,
        ema: Option<&ModelEma<B, Yolox<B>>>,
        optim: &O,
        epoch: usize,
        best_ap: f64,
    ) -> Result<()> {
        let base = self.output_dir.join(name);
        match ema {
            Some(ema) => save_model(ema.module().clone(), &base)?,
            None => save_model(model.clone(), &base)?,
        }
        Recorder::<B>::record(&CompactRecorder::new(), optim.to_record(), optim_path(&base))
            .map_err(|e| anyhow!("Sauvegarde de l'optimiseur: {}", e))?;

        let meta = CheckpointMeta {
            exp_name: self.exp.exp_name().to_string(),
            epoch,
            best_ap,
            ema_updates: ema.map_or(0, |e| e.updates()),
        };
        fs::write(base.with_extension("json"), serde_json::to_string_pretty(&meta)?)?;
        println!("💾 Checkpoint sauvegardé: {}", base.display());
        Ok(())
    }
}

pub fn save_model<B2: Backend>(model: Yolox<B2>, base: &Path) -> Result<()> {
    CompactRecorder::new()
        .record(model.into_record(), base.to_path_buf())
        .map_err(|e| anyhow!("Erreur de sauvegarde {}: {}", base.display(), e))
}

pub fn load_model<B2: Backend>(model: Yolox<B2>, path: &Path, device: &B2::Device) -> Result<Yolox<B2>> {
    let base = path.with_extension("");
    let record = CompactRecorder::new()
        .load(base.clone(), device)
        .map_err(|e| anyhow!("Chargement du checkpoint {}: {}", base.display(), e))?;
    Ok(model.load_record(record))
}

/// `<dir>/<name>_optim` next to the checkpoint `<dir>/<name>`.
fn optim_path(base: &Path) -> PathBuf {
    let mut name = base.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push("_optim");
    base.with_file_name(name)
}

pub fn load_optimizer<B: AutodiffBackend, O: Optimizer<Yolox<B>, B>>(
    optim: O,
    path: &Path,
    device: &B::Device,
) -> Result<O> {
    let record = Recorder::<B>::load::<O::Record>(&CompactRecorder::new(), path.to_path_buf(), device)
        .map_err(|e| anyhow!("Chargement de l'optimiseur {}: {}", path.display(), e))?;
    Ok(optim.load_record(record))
}

/// Once mosaic is off, evaluation runs every epoch.
fn initial_eval_interval(eval_interval: usize, mosaic_enabled: bool) -> usize {
    if mosaic_enabled {
        eval_interval
    } else {
        1
    }
}

pub fn read_meta(base: &Path) -> Result<CheckpointMeta> {
    let path = base.with_extension("json");
    let text = fs::read_to_string(&path).with_context(|| format!("Lecture de {}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}
