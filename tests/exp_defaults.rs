mod common;

use burn::backend::NdArray;
use facedet::{
    config::SchedulerKind,
    data::{CacheType, Split},
    layers::{Layer, Layers},
    transforms::{Preproc, ValTransform},
    EvalDatasetOptions, Experiment, MaskExp,
};
use tempfile::tempdir;

type B = NdArray<f32>;

fn exp() -> MaskExp<B> {
    MaskExp::new(Default::default())
}

#[test]
fn face_defaults() {
    let exp = exp();
    let cfg = exp.config();
    assert_eq!(cfg.num_classes, 1);
    assert_eq!(cfg.depth, 0.33);
    assert_eq!(cfg.width, 0.25);
    assert_eq!(cfg.input_size, (224, 224));
    assert_eq!(cfg.test_size, (224, 224));
    assert_eq!(cfg.data_num_workers, 2);
    assert!(!cfg.enable_mixup);
    assert_eq!(cfg.warmup_epochs, 2);
    assert_eq!(cfg.max_epoch, 100);
    assert_eq!(cfg.warmup_lr, 0.0);
    assert_eq!(cfg.min_lr_ratio, 0.001);
    assert!((cfg.basic_lr_per_img - 3.125e-5).abs() < 1e-12);
    assert_eq!(cfg.scheduler, SchedulerKind::YoloxWarmCos);
    assert_eq!(cfg.no_aug_epochs, 2);
    assert!(cfg.ema);
    assert_eq!(cfg.weight_decay, 1e-3);
    assert_eq!(cfg.momentum, 0.9);
    assert_eq!(cfg.print_interval, 100);
    assert_eq!(cfg.eval_interval, 10);
    assert_eq!(cfg.test_conf, 0.1);
    assert_eq!(cfg.nmsthre, 0.7);
    assert_eq!(exp.exp_name(), "mask");
    assert!(cfg.validate().is_ok());
}

#[test]
fn get_model_builds_once() {
    let mut exp = exp();
    let first: *const _ = exp.get_model(false);
    let second: *const _ = exp.get_model(true);
    assert!(std::ptr::eq(first, second));
}

#[test]
fn get_model_applies_norm_policy() {
    let mut exp = exp();
    let model = exp.get_model(false);

    let mut norms = 0;
    model.visit_layers(&mut |layer| {
        if let Layer::BatchNorm(bn) = layer {
            assert_eq!(bn.epsilon, 1e-3);
            assert_eq!(bn.momentum, 0.03);
            norms += 1;
        }
    });
    assert!(norms > 0);
}

#[test]
fn merge_overrides_fields() {
    let mut exp = exp();
    exp.merge(&["max_epoch".into(), "5".into(), "test_conf".into(), "0.25".into()])
        .unwrap();
    assert_eq!(exp.config().max_epoch, 5);
    assert_eq!(exp.config().test_conf, 0.25);
    assert!(exp.merge(&["no_such_field".into(), "1".into()]).is_err());
}

#[test]
fn output_dir_joins_exp_name() {
    let exp = exp();
    let expected = std::path::Path::new(&exp.config().output_dir).join("mask");
    assert_eq!(exp.output_dir(), expected);
}

#[test]
fn train_dataset_with_disk_cache() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    common::write_voc_fixture(data.path(), 3, 2);
    let exp = MaskExp::<B>::with_config(common::small_config(data.path(), out.path()), Default::default());

    let dataset = exp.get_dataset(true, CacheType::Disk).unwrap();
    assert_eq!(dataset.split(), Split::Train);
    assert_eq!(dataset.len(), 3);
    assert_eq!(dataset.img_size(), common::SIZE);
    assert!(dataset.cache());
    assert_eq!(dataset.cache_type(), CacheType::Disk);
    match dataset.preproc() {
        Preproc::Train(t) => assert_eq!(t.max_labels, 50),
        other => panic!("unexpected preproc {other:?}"),
    }
    assert!(dataset.cache_dir().is_dir());
    assert_eq!(std::fs::read_dir(dataset.cache_dir()).unwrap().count(), 3);
}

#[test]
fn train_dataset_without_cache() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    common::write_voc_fixture(data.path(), 2, 1);
    let exp = MaskExp::<B>::with_config(common::small_config(data.path(), out.path()), Default::default());

    let dataset = exp.get_dataset(false, CacheType::Ram).unwrap();
    assert!(!dataset.cache());
    assert!(!dataset.cache_dir().exists());

    let item = dataset.get_item(0).unwrap();
    assert_eq!(item.image.len(), 3 * 64 * 64);
    assert_eq!(item.targets.len(), 1);
}

#[test]
fn eval_dataset_legacy_flag() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    common::write_voc_fixture(data.path(), 1, 2);
    let exp = MaskExp::<B>::with_config(common::small_config(data.path(), out.path()), Default::default());

    let plain = exp.get_eval_dataset(EvalDatasetOptions::default()).unwrap();
    assert_eq!(plain.split(), Split::Val);
    assert_eq!(plain.len(), 2);
    assert_eq!(plain.preproc(), Preproc::Val(ValTransform::new(false)));
    assert!(!plain.cache());

    let legacy = exp
        .get_eval_dataset(EvalDatasetOptions {
            legacy: true,
            testdev: false,
        })
        .unwrap();
    assert_eq!(legacy.preproc(), Preproc::Val(ValTransform::new(true)));
}

#[test]
fn evaluator_carries_test_thresholds() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    common::write_voc_fixture(data.path(), 1, 2);
    let exp = MaskExp::<B>::with_config(common::small_config(data.path(), out.path()), Default::default());

    let evaluator = exp.get_evaluator::<B>(8, false, false, false).unwrap();
    assert_eq!(evaluator.confthre, 0.1);
    assert_eq!(evaluator.nmsthre, 0.7);
    assert_eq!(evaluator.num_classes, 1);
    assert_eq!(evaluator.img_size, common::SIZE);
    assert_eq!(evaluator.dataset().len(), 2);
}

#[test]
fn missing_data_dir_is_an_error() {
    let out = tempdir().unwrap();
    let missing = out.path().join("nowhere");
    let exp = MaskExp::<B>::with_config(common::small_config(&missing, out.path()), Default::default());
    assert!(exp.get_dataset(false, CacheType::Ram).is_err());
    assert!(exp.get_eval_dataset(EvalDatasetOptions::default()).is_err());
}
