//! Train on a small synthetic dataset, then predict with the produced checkpoint.
//!
//! The accuracy scenario trains for several epochs and is ignored by default.
//! Run it with: `cargo test --release -- --ignored`

mod common;

use burn::backend::{ndarray::NdArray, Autodiff};
use burn::config::Config as _;
use plant_disease_burn::{
    checkpoint,
    data::{ClassMapping, PreparedImage},
    error::TrainingError,
    Predictor, Trainer, TrainingConfig,
};

use common::*;

type B = NdArray<f32>;
type TrainB = Autodiff<B>;

#[test]
fn training_writes_a_checkpoint_with_sorted_classes() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 5, 2);
    let config = quick_config(dir.path());

    let summary = Trainer::new(config.clone())
        .run::<TrainB>(&Default::default())
        .unwrap();

    assert_eq!(summary.classes.names(), ["blighted", "healthy"]);
    assert_eq!(summary.epochs.len(), 1);
    let report = &summary.epochs[0];
    assert_eq!(report.epoch, 1);
    assert_eq!(report.skipped_samples, 0);
    assert!(report.train_loss.is_finite());
    assert!(report.valid_loss.is_finite());
    assert!((0.0..=100.0).contains(&report.valid_accuracy));

    let device = Default::default();
    let loaded = checkpoint::load::<B, _>(&summary.checkpoint_path, &device).unwrap();
    assert_eq!(loaded.classes.name(0), Some("blighted"));
    assert_eq!(loaded.classes.name(1), Some("healthy"));
    assert_eq!(loaded.model.num_classes(), 2);

    // The training configuration is kept next to the checkpoint
    let saved = TrainingConfig::load(config.config_path()).unwrap();
    assert_eq!(saved.seed, config.seed);
    assert_eq!(saved.width_mult, 0.25);
}

#[test]
fn predictions_from_a_trained_checkpoint_are_stable() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 5, 2);
    let summary = Trainer::new(quick_config(dir.path()))
        .run::<TrainB>(&Default::default())
        .unwrap();

    let predictor =
        Predictor::<B>::from_checkpoint(&summary.checkpoint_path, &Default::default()).unwrap();
    let images = [
        PreparedImage::from_bytes(&encode_png(healthy_leaf(500))).unwrap(),
        PreparedImage::from_bytes(&encode_png(blighted_leaf(500))).unwrap(),
    ];

    for image in &images {
        let first = predictor.predict_image(image).unwrap();
        let second = predictor.predict_image(image).unwrap();
        assert_eq!(first, second);

        assert!((0.0..=100.0).contains(&first.confidence));
        assert!(first.confidence >= 50.0, "two classes, the top one has at least half");
        assert_eq!(
            predictor.classes().name(first.class_index),
            Some(first.prediction.as_str())
        );

        let probabilities = predictor.probabilities(std::slice::from_ref(image)).unwrap();
        let best = probabilities[0]
            .iter()
            .cloned()
            .fold(f32::MIN, f32::max);
        assert_eq!(probabilities[0][first.class_index], best);
    }
}

#[test]
fn dev_mode_keeps_every_class() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 2, 1);
    write_class(&dir.path().join("train"), "blighted", 7, blighted_leaf);

    let summary = Trainer::new(
        quick_config(dir.path())
            .with_dev_mode(true)
            .with_max_samples_per_class(3),
    )
    .run::<TrainB>(&Default::default())
    .unwrap();

    assert_eq!(summary.classes.names(), ["blighted", "healthy"]);
}

#[test]
fn an_unreadable_image_aborts_without_a_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 5, 2);
    std::fs::write(
        dir.path().join("train").join("healthy").join("broken.jpg"),
        b"\xff\xd8 truncated jpeg",
    )
    .unwrap();
    let config = quick_config(dir.path());

    let err = Trainer::new(config.clone())
        .run::<TrainB>(&Default::default())
        .unwrap_err();

    assert!(matches!(
        err,
        TrainingError::TooManyDataErrors { failed: 1, .. }
    ));
    assert!(!std::path::Path::new(&config.checkpoint_path).exists());
}

#[test]
fn no_checkpoint_without_its_training_config() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 3, 1);
    let config = quick_config(dir.path());
    // A directory where the configuration file should go makes its write fail
    std::fs::create_dir_all(config.config_path()).unwrap();

    let err = Trainer::new(config.clone())
        .run::<TrainB>(&Default::default())
        .unwrap_err();

    assert!(matches!(err, TrainingError::Io(_)));
    assert!(!std::path::Path::new(&config.checkpoint_path).exists());
}

#[test]
fn unreadable_images_are_skipped_below_the_threshold() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 5, 2);
    std::fs::write(
        dir.path().join("train").join("healthy").join("broken.png"),
        b"not a png",
    )
    .unwrap();

    let summary = Trainer::new(quick_config(dir.path()).with_max_data_error_rate(0.5))
        .run::<TrainB>(&Default::default())
        .unwrap();

    assert_eq!(summary.epochs[0].skipped_samples, 1);
    assert!(summary.checkpoint_path.exists());
}

#[test]
fn resuming_requires_the_same_classes() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 4, 1);
    let first = Trainer::new(quick_config(dir.path()))
        .run::<TrainB>(&Default::default())
        .unwrap();
    let resume_from = first.checkpoint_path.to_string_lossy().into_owned();

    // Same classes: training continues from the checkpoint
    let mut config = quick_config(dir.path()).with_resume_from(Some(resume_from.clone()));
    config.checkpoint_path = dir.path().join("resumed.ckpt").to_string_lossy().into_owned();
    let resumed = Trainer::new(config)
        .run::<TrainB>(&Default::default())
        .unwrap();
    assert_eq!(resumed.classes, first.classes);

    // A new class shifts the indices
    write_class(&dir.path().join("train"), "mildew", 4, blighted_leaf);
    let err = Trainer::new(quick_config(dir.path()).with_resume_from(Some(resume_from)))
        .run::<TrainB>(&Default::default())
        .unwrap_err();
    assert!(matches!(err, TrainingError::ClassMappingDrift { .. }));
}

#[test]
#[allow(deprecated)]
fn standalone_class_mapping_matches_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 4, 1);
    let config = quick_config(dir.path()).with_export_class_mapping(true);

    let summary = Trainer::new(config.clone())
        .run::<TrainB>(&Default::default())
        .unwrap();

    let legacy = ClassMapping::from_legacy_json(config.class_mapping_path()).unwrap();
    assert_eq!(legacy, summary.classes);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(config.class_mapping_path()).unwrap())
            .unwrap();
    assert_eq!(raw, serde_json::json!({"0": "blighted", "1": "healthy"}));
}

#[test]
fn empty_validation_split_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 3, 0);

    let err = Trainer::new(quick_config(dir.path()))
        .run::<TrainB>(&Default::default())
        .unwrap_err();
    assert!(matches!(err, TrainingError::EmptySplit("validation")));
}

#[test]
#[ignore = "trains for several epochs"]
fn healthy_leaf_is_recognized_after_training() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 24, 6);

    let summary = Trainer::new(
        quick_config(dir.path())
            .with_num_epochs(6)
            .with_batch_size(8)
            .with_learning_rate(1e-3),
    )
    .run::<TrainB>(&Default::default())
    .unwrap();

    let last = summary.epochs.last().unwrap();
    assert!(last.valid_accuracy > 50.0, "{last:?}");

    let predictor =
        Predictor::<B>::from_checkpoint(&summary.checkpoint_path, &Default::default()).unwrap();
    let prediction = predictor
        .predict_bytes(&encode_png(healthy_leaf(1000)))
        .unwrap();

    assert_eq!(prediction.prediction, "healthy");
    assert!(prediction.confidence > 50.0);
}
