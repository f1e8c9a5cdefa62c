mod common;

use burn::backend::{Autodiff, NdArray};
use facedet::{
    data::CacheType,
    training::{load_model, read_meta, TrainOptions, Trainer},
    Experiment, MaskExp,
};
use tempfile::tempdir;

type B = NdArray<f32>;
type AB = Autodiff<B>;

#[test]
fn untrained_model_evaluates_to_valid_ap() {
    common::with_large_stack(untrained_model_evaluates);
}

fn untrained_model_evaluates() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    common::write_voc_fixture(data.path(), 1, 2);
    let mut exp = MaskExp::<B>::with_config(common::small_config(data.path(), out.path()), Default::default());

    let evaluator = exp.get_evaluator::<B>(2, false, false, false).unwrap();
    let model = exp.get_model(false).clone();
    let summary = evaluator.evaluate(&model).unwrap();

    assert!((0.0..=1.0).contains(&summary.ap50_95));
    assert!((0.0..=1.0).contains(&summary.ap50));
    assert_eq!(summary.per_class.len(), 1);
    assert_eq!(summary.per_class[0].0, "face");
}

#[test]
fn one_epoch_writes_checkpoints_and_resumes() {
    common::with_large_stack(train_one_epoch_then_resume);
}

fn train_one_epoch_then_resume() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    common::write_voc_fixture(data.path(), 3, 2);
    let config = common::small_config(data.path(), out.path());

    let exp = MaskExp::<AB>::with_config(config.clone(), Default::default());
    let opts = TrainOptions {
        batch_size: 2,
        cache: true,
        cache_type: CacheType::Ram,
        resume: None,
    };
    let report = Trainer::<AB, _>::new(exp, opts).run().unwrap();

    assert_eq!(report.epochs_run, 1);
    let dir = out.path().join("mask");
    assert_eq!(report.output_dir, dir);
    assert!(dir.join("exp.json").is_file());
    for name in ["latest_ckpt", "last_mosaic_epoch"] {
        assert!(dir.join(format!("{name}.mpk")).is_file(), "{name}.mpk");
        assert!(dir.join(format!("{name}_optim.mpk")).is_file(), "{name}_optim.mpk");
        assert!(dir.join(format!("{name}.json")).is_file(), "{name}.json");
    }

    let meta = read_meta(&dir.join("latest_ckpt")).unwrap();
    assert_eq!(meta.exp_name, "mask");
    assert_eq!(meta.epoch, 1);
    assert_eq!(meta.ema_updates, 2);
    assert_eq!(meta.best_ap, report.best_ap);

    // the saved weights load back into a fresh inference model
    let mut infer = MaskExp::<B>::with_config(config.clone(), Default::default());
    infer.get_model(false);
    let model = infer.take_model().unwrap();
    assert!(load_model(model, &dir.join("latest_ckpt.mpk"), &Default::default()).is_ok());

    // resuming a finished run restores the optimizer and has nothing left to do
    let exp = MaskExp::<AB>::with_config(config.clone(), Default::default());
    let opts = TrainOptions {
        batch_size: 2,
        resume: Some(dir.join("latest_ckpt")),
        ..TrainOptions::default()
    };
    let report = Trainer::<AB, _>::new(exp, opts).run().unwrap();
    assert_eq!(report.epochs_run, 0);

    // without its metadata a checkpoint cannot be resumed
    std::fs::remove_file(dir.join("last_mosaic_epoch.json")).unwrap();
    let exp = MaskExp::<AB>::with_config(config, Default::default());
    let opts = TrainOptions {
        batch_size: 2,
        resume: Some(dir.join("last_mosaic_epoch")),
        ..TrainOptions::default()
    };
    assert!(Trainer::<AB, _>::new(exp, opts).run().is_err());
}
