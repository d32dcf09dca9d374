//! Synthetic leaf images and datasets shared by the integration tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use plant_disease_burn::TrainingConfig;

pub const SIDE: u32 = 48;

/// A mostly green leaf with lighter veins.
pub fn healthy_leaf(variant: u32) -> RgbImage {
    RgbImage::from_fn(SIDE, SIDE, |x, y| {
        let shade = ((x * 3 + y * 5 + variant * 11) % 40) as u8;
        if (x + variant) % 12 == 0 || y == SIDE / 2 {
            Rgb([90, 200 + shade / 2, 90])
        } else {
            Rgb([30 + shade / 2, 140 + shade, 40])
        }
    })
}

/// A leaf covered with brown lesions.
pub fn blighted_leaf(variant: u32) -> RgbImage {
    RgbImage::from_fn(SIDE, SIDE, |x, y| {
        let shade = ((x * 7 + y * 3 + variant * 13) % 40) as u8;
        let cx = (x + variant * 5) % 16;
        let cy = (y + variant * 3) % 16;
        if cx * cx + cy * cy < 60 {
            Rgb([120 + shade, 70 + shade / 2, 20])
        } else {
            Rgb([100 + shade, 110, 40])
        }
    })
}

pub fn encode_png(image: RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .unwrap();
    bytes
}

pub fn write_class(root: &Path, class: &str, count: u32, leaf: fn(u32) -> RgbImage) {
    let dir = root.join(class);
    std::fs::create_dir_all(&dir).unwrap();
    for i in 0..count {
        std::fs::write(dir.join(format!("{i:03}.png")), encode_png(leaf(i))).unwrap();
    }
}

/// `root/train` and `root/val`, each with `blighted` and `healthy` classes.
pub fn write_dataset(root: &Path, train_per_class: u32, valid_per_class: u32) {
    let train = root.join("train");
    write_class(&train, "healthy", train_per_class, healthy_leaf);
    write_class(&train, "blighted", train_per_class, blighted_leaf);

    let valid = root.join("val");
    write_class(&valid, "healthy", valid_per_class, |i| healthy_leaf(i + 100));
    write_class(&valid, "blighted", valid_per_class, |i| blighted_leaf(i + 100));
}

/// One quick epoch on a narrow randomly initialized network.
pub fn quick_config(root: &Path) -> TrainingConfig {
    TrainingConfig::new(
        root.join("train").to_string_lossy().into_owned(),
        root.join("val").to_string_lossy().into_owned(),
        root.join("model").join("plant_model.ckpt").to_string_lossy().into_owned(),
    )
    .with_num_epochs(1)
    .with_batch_size(4)
    .with_width_mult(0.25)
    .with_pretrained(false)
    .with_num_workers(2)
}
