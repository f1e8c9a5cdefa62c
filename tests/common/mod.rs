#![allow(dead_code)]

use facedet::{mask::face_config, ExpConfig};
use image::{Rgb, RgbImage};
use std::{fs, path::Path};

pub const SIZE: (usize, usize) = (64, 64);

/// Writes a small VOC tree: one face per image, a bright square on a dark
/// background, split into train and val ids.
pub fn write_voc_fixture(root: &Path, train: usize, val: usize) {
    let images = root.join("JPEGImages");
    let annotations = root.join("Annotations");
    let sets = root.join("ImageSets").join("Main");
    for dir in [&images, &annotations, &sets] {
        fs::create_dir_all(dir).unwrap();
    }

    let ids: Vec<String> = (0..train + val).map(|i| format!("{i:06}")).collect();
    for (i, id) in ids.iter().enumerate() {
        let (w, h) = (80 + 8 * (i as u32 % 3), 60);
        let (x0, y0) = (10 + 4 * i as u32 % 20, 12);
        let (x1, y1) = (x0 + 30, y0 + 32);

        let mut img = RgbImage::from_pixel(w, h, Rgb([30, 30, 30]));
        for y in y0..y1 {
            for x in x0..x1 {
                img.put_pixel(x, y, Rgb([220, 180, 150]));
            }
        }
        img.save(images.join(format!("{id}.jpg"))).unwrap();

        let xml = format!(
            "<annotation>\
               <filename>{id}.jpg</filename>\
               <size><width>{w}</width><height>{h}</height><depth>3</depth></size>\
               <object><name>face</name><difficult>0</difficult>\
                 <bndbox><xmin>{}</xmin><ymin>{}</ymin><xmax>{x1}</xmax><ymax>{y1}</ymax></bndbox>\
               </object>\
             </annotation>",
            x0 + 1,
            y0 + 1,
        );
        fs::write(annotations.join(format!("{id}.xml")), xml).unwrap();
    }

    fs::write(sets.join("train.txt"), ids[..train].join("\n")).unwrap();
    fs::write(sets.join("val.txt"), ids[train..].join("\n")).unwrap();
}

/// Face experiment shrunk for tests: 64x64 inputs, one epoch, in-process loading.
pub fn small_config(data_dir: &Path, output_dir: &Path) -> ExpConfig {
    ExpConfig {
        input_size: SIZE,
        test_size: SIZE,
        data_dir: data_dir.to_string_lossy().into_owned(),
        output_dir: output_dir.to_string_lossy().into_owned(),
        data_num_workers: 0,
        max_epoch: 1,
        warmup_epochs: 0,
        no_aug_epochs: 0,
        print_interval: 1,
        eval_interval: 1,
        ..face_config()
    }
}

/// Runs `f` on a thread with a 64 MiB stack; building and differentiating the
/// full detector graph on NdArray needs more than the default test stack.
pub fn with_large_stack<F: FnOnce() + Send + 'static>(f: F) {
    std::thread::Builder::new()
        .stack_size(64 << 20)
        .spawn(f)
        .unwrap()
        .join()
        .unwrap();
}
