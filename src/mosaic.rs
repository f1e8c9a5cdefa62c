use crate::{
    data::{DetectionItem, VocDetection},
    transforms::{letterbox, Preproc, TrainTransform, PAD_VALUE},
};
use burn::data::dataset::Dataset;
use image::{imageops::FilterType, Rgb, RgbImage};
use rand::Rng;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared on/off flag for mosaic augmentation. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct MosaicSwitch(Arc<AtomicBool>);

impl MosaicSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Training dataset wrapper stitching four samples into one image, with
/// optional mixup on top.
#[derive(Debug)]
pub struct MosaicDetection {
    dataset: VocDetection,
    transform: TrainTransform,
    input_size: (usize, usize),
    switch: MosaicSwitch,
    mosaic_prob: f64,
    mixup_prob: f64,
    enable_mixup: bool,
}

impl MosaicDetection {
    pub fn new(dataset: VocDetection, mosaic: bool, mosaic_prob: f64, mixup_prob: f64, enable_mixup: bool) -> Self {
        let transform = match dataset.preproc() {
            Preproc::Train(t) => t,
            Preproc::Val(_) => TrainTransform::default(),
        };
        let input_size = dataset.img_size();
        Self {
            dataset,
            transform,
            input_size,
            switch: MosaicSwitch::new(mosaic),
            mosaic_prob,
            mixup_prob,
            enable_mixup,
        }
    }

    pub fn switch(&self) -> MosaicSwitch {
        self.switch.clone()
    }

    fn mosaic_item<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> anyhow::Result<DetectionItem> {
        let (in_h, in_w) = (self.input_size.0 as f32, self.input_size.1 as f32);
        let (canvas_w, canvas_h) = (2 * self.input_size.1 as u32, 2 * self.input_size.0 as u32);
        let yc = rng.random_range(0.5 * in_h..1.5 * in_h) as i64;
        let xc = rng.random_range(0.5 * in_w..1.5 * in_w) as i64;

        let mut indices = vec![index];
        indices.extend((0..3).map(|_| rng.random_range(0..self.dataset.len())));

        let mut canvas = RgbImage::from_pixel(canvas_w, canvas_h, Rgb([PAD_VALUE; 3]));
        let mut labels: Vec<[f32; 5]> = Vec::new();
        let mut info = None;

        for (slot, &i) in indices.iter().enumerate() {
            let (img, targets, img_info) = self.dataset.pull_item(i)?;
            if slot == 0 {
                info = Some(img_info);
            }
            let (w0, h0) = img.dimensions();
            let scale = (in_h / h0 as f32).min(in_w / w0 as f32);
            let (w, h) = (((w0 as f32 * scale) as u32).max(1), ((h0 as f32 * scale) as u32).max(1));
            let img = image::imageops::resize(&img, w, h, FilterType::Triangle);

            let (x0, y0) = match slot {
                0 => (xc - w as i64, yc - h as i64),
                1 => (xc, yc - h as i64),
                2 => (xc - w as i64, yc),
                _ => (xc, yc),
            };
            image::imageops::replace(&mut canvas, &img, x0, y0);

            for t in targets {
                labels.push([
                    t[0] * scale + x0 as f32,
                    t[1] * scale + y0 as f32,
                    t[2] * scale + x0 as f32,
                    t[3] * scale + y0 as f32,
                    t[4],
                ]);
            }
        }

        // back to the input resolution
        let mut canvas = image::imageops::resize(&canvas, canvas_w / 2, canvas_h / 2, FilterType::Triangle);
        let mut labels: Vec<[f32; 5]> = labels
            .into_iter()
            .map(|l| {
                [
                    (l[0] * 0.5).clamp(0.0, in_w),
                    (l[1] * 0.5).clamp(0.0, in_h),
                    (l[2] * 0.5).clamp(0.0, in_w),
                    (l[3] * 0.5).clamp(0.0, in_h),
                    l[4],
                ]
            })
            .filter(|l| l[2] > l[0] && l[3] > l[1])
            .collect();

        if self.enable_mixup && !labels.is_empty() && rng.random_bool(self.mixup_prob.clamp(0.0, 1.0)) {
            self.mixup(&mut canvas, &mut labels, rng)?;
        }

        let (image, targets) = self.transform.apply(&canvas, &labels, self.input_size, rng);
        let info = info.ok_or_else(|| anyhow::anyhow!("empty mosaic"))?;
        Ok(DetectionItem { image, targets, info })
    }

    /// Blends a second, letterboxed sample into `canvas` at equal weight.
    fn mixup<R: Rng + ?Sized>(&self, canvas: &mut RgbImage, labels: &mut Vec<[f32; 5]>, rng: &mut R) -> anyhow::Result<()> {
        let other = rng.random_range(0..self.dataset.len());
        let (img, targets, _) = self.dataset.pull_item(other)?;
        if targets.is_empty() {
            return Ok(());
        }
        let (img, r) = letterbox(&img, self.input_size);
        for (dst, src) in canvas.pixels_mut().zip(img.pixels()) {
            for c in 0..3 {
                dst.0[c] = ((dst.0[c] as u16 + src.0[c] as u16) / 2) as u8;
            }
        }
        labels.extend(targets.iter().map(|t| [t[0] * r, t[1] * r, t[2] * r, t[3] * r, t[4]]));
        Ok(())
    }
}

impl Dataset<DetectionItem> for MosaicDetection {
    fn get(&self, index: usize) -> Option<DetectionItem> {
        if index >= self.dataset.len() {
            return None;
        }
        let mut rng = rand::rng();
        if self.switch.is_enabled() && rng.random_bool(self.mosaic_prob.clamp(0.0, 1.0)) {
            match self.mosaic_item(index, &mut rng) {
                Ok(item) => return Some(item),
                Err(e) => eprintln!("⚠️  Mosaic impossible pour l'index {}: {}", index, e),
            }
        }
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}
