//! Per-sample preprocessing: letterbox resize, colour jitter and flips.
//!
//! Images are RGB `u8` buffers; network input is CHW `f32`. Targets come in
//! as `[x0, y0, x1, y1, class]` and training targets go out as
//! `[class, cx, cy, w, h]` in input pixels.

use crate::boxes::xyxy_to_cxcywh;
use image::{imageops::FilterType, Rgb, RgbImage};
use rand::Rng;

pub const PAD_VALUE: u8 = 114;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resizes `image` so that it fits inside `input_size` keeping its aspect
/// ratio, pads the bottom/right with grey and returns the canvas with the
/// scale factor that was applied.
pub fn letterbox(image: &RgbImage, input_size: (usize, usize)) -> (RgbImage, f32) {
    let (in_h, in_w) = input_size;
    let (w, h) = image.dimensions();
    let r = letterbox_ratio((w, h), input_size);
    let new_w = ((w as f32 * r) as u32).clamp(1, in_w as u32);
    let new_h = ((h as f32 * r) as u32).clamp(1, in_h as u32);

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(in_w as u32, in_h as u32, Rgb([PAD_VALUE; 3]));
    image::imageops::replace(&mut canvas, &resized, 0, 0);
    (canvas, r)
}

/// Scale [`letterbox`] applies to an image of `(width, height)`.
pub fn letterbox_ratio(dims: (u32, u32), input_size: (usize, usize)) -> f32 {
    let (in_h, in_w) = input_size;
    (in_h as f32 / dims.1.max(1) as f32).min(in_w as f32 / dims.0.max(1) as f32)
}

/// HWC `u8` to CHW `f32`, either raw 0..255 or ImageNet-normalised.
pub fn to_chw(image: &RgbImage, normalize: bool) -> Vec<f32> {
    let (w, h) = image.dimensions();
    let frame_size = (w * h) as usize;
    let raw = image.as_raw();

    let mut chw = vec![0.0; frame_size * 3];
    for i in 0..frame_size {
        for c in 0..3 {
            let v = raw[i * 3 + c] as f32;
            chw[i + c * frame_size] = if normalize {
                (v / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
            } else {
                v
            };
        }
    }
    chw
}

/// Random hue/saturation/value shift. Each gain is applied with probability
/// one half. Hue is on the 0..180 scale.
pub fn augment_hsv<R: Rng + ?Sized>(image: &mut RgbImage, rng: &mut R) {
    let gains = [5.0f32, 30.0, 30.0];
    let mut shift = [0.0f32; 3];
    for (s, g) in shift.iter_mut().zip(gains) {
        let on = rng.random_bool(0.5);
        *s = if on { rng.random_range(-1.0f32..1.0) * g } else { 0.0 };
    }
    if shift == [0.0; 3] {
        return;
    }

    for pixel in image.pixels_mut() {
        let [h, s, v] = rgb_to_hsv(pixel.0);
        let h = (h + shift[0]).rem_euclid(180.0);
        let s = (s + shift[1]).clamp(0.0, 255.0);
        let v = (v + shift[2]).clamp(0.0, 255.0);
        pixel.0 = hsv_to_rgb([h, s, v]);
    }
}

fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [f32; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max == 0.0 { 0.0 } else { delta / max * 255.0 };
    [h / 2.0, s, max]
}

fn hsv_to_rgb([h, s, v]: [f32; 3]) -> [u8; 3] {
    let h = h * 2.0;
    let s = s / 255.0;
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0).rem_euclid(2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match (h / 60.0) as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [
        (r + m).round().clamp(0.0, 255.0) as u8,
        (g + m).round().clamp(0.0, 255.0) as u8,
        (b + m).round().clamp(0.0, 255.0) as u8,
    ]
}

/// Horizontal flip of the image and its `[x0, y0, x1, y1, cls]` targets.
pub fn mirror(image: &mut RgbImage, targets: &mut [[f32; 5]]) {
    let width = image.width() as f32;
    image::imageops::flip_horizontal_in_place(image);
    for t in targets.iter_mut() {
        let (x0, x1) = (t[0], t[2]);
        t[0] = width - x1;
        t[2] = width - x0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainTransform {
    pub max_labels: usize,
    pub flip_prob: f64,
    pub hsv_prob: f64,
}

impl Default for TrainTransform {
    fn default() -> Self {
        Self {
            max_labels: 50,
            flip_prob: 0.5,
            hsv_prob: 1.0,
        }
    }
}

impl TrainTransform {
    pub fn apply<R: Rng + ?Sized>(
        &self,
        image: &RgbImage,
        targets: &[[f32; 5]],
        input_size: (usize, usize),
        rng: &mut R,
    ) -> (Vec<f32>, Vec<[f32; 5]>) {
        if targets.is_empty() {
            let (canvas, _) = letterbox(image, input_size);
            return (to_chw(&canvas, false), Vec::new());
        }

        let mut augmented = image.clone();
        let mut boxes = targets.to_vec();
        if rng.random_bool(self.hsv_prob.clamp(0.0, 1.0)) {
            augment_hsv(&mut augmented, rng);
        }
        if rng.random_bool(self.flip_prob.clamp(0.0, 1.0)) {
            mirror(&mut augmented, &mut boxes);
        }
        let (canvas, r) = letterbox(&augmented, input_size);

        let mut labels = to_labels(&boxes, r);
        labels.retain(|l| l[3].min(l[4]) > 1.0);
        let (canvas, mut labels) = if labels.is_empty() {
            let (canvas, r) = letterbox(image, input_size);
            (canvas, to_labels(targets, r))
        } else {
            (canvas, labels)
        };
        labels.truncate(self.max_labels);
        (to_chw(&canvas, false), labels)
    }
}

fn to_labels(targets: &[[f32; 5]], r: f32) -> Vec<[f32; 5]> {
    targets
        .iter()
        .map(|t| {
            let [cx, cy, w, h] = xyxy_to_cxcywh([t[0], t[1], t[2], t[3]]);
            [t[4], cx * r, cy * r, w * r, h * r]
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValTransform {
    /// Scale to 0..1 and normalise with ImageNet statistics, as older
    /// checkpoints expect.
    pub legacy: bool,
}

impl ValTransform {
    pub fn new(legacy: bool) -> Self {
        Self { legacy }
    }

    /// Returns the CHW input and the letterbox ratio used.
    pub fn apply(&self, image: &RgbImage, input_size: (usize, usize)) -> (Vec<f32>, f32) {
        let (canvas, r) = letterbox(image, input_size);
        (to_chw(&canvas, self.legacy), r)
    }
}

/// The transform a dataset runs on every sample it hands out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Preproc {
    Train(TrainTransform),
    Val(ValTransform),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn letterbox_keeps_aspect_and_pads_bottom_right() {
        let image = RgbImage::from_pixel(100, 50, Rgb([10, 20, 30]));
        let (canvas, r) = letterbox(&image, (64, 64));
        assert_eq!(canvas.dimensions(), (64, 64));
        assert!((r - 0.64).abs() < 1e-6);
        assert_eq!(canvas.get_pixel(0, 0).0, [10, 20, 30]);
        assert_eq!(canvas.get_pixel(0, 40).0, [PAD_VALUE; 3]);
    }

    #[test]
    fn legacy_normalises_and_plain_keeps_raw_values() {
        let image = RgbImage::from_pixel(32, 32, Rgb([255, 0, 128]));
        let (raw, _) = ValTransform::new(false).apply(&image, (32, 32));
        assert_eq!(raw[0], 255.0);
        assert_eq!(raw[32 * 32], 0.0);

        let (norm, _) = ValTransform::new(true).apply(&image, (32, 32));
        assert!((norm[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((norm[32 * 32] - (-0.456 / 0.224)).abs() < 1e-5);
    }

    #[test]
    fn hsv_round_trip_is_stable() {
        for rgb in [[0u8, 0, 0], [255, 255, 255], [200, 30, 60], [12, 180, 90], [40, 40, 220]] {
            let back = hsv_to_rgb(rgb_to_hsv(rgb));
            for c in 0..3 {
                assert!((back[c] as i32 - rgb[c] as i32).abs() <= 1, "{rgb:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn mirror_reflects_boxes() {
        let mut image = RgbImage::new(100, 40);
        let mut targets = [[10.0, 5.0, 30.0, 15.0, 0.0]];
        mirror(&mut image, &mut targets);
        assert_eq!(targets[0], [70.0, 5.0, 90.0, 15.0, 0.0]);
    }

    #[test]
    fn train_transform_emits_center_format_and_caps_labels() {
        let image = RgbImage::from_pixel(128, 128, Rgb([90, 90, 90]));
        let targets: Vec<[f32; 5]> = (0..8)
            .map(|i| {
                let x = i as f32 * 12.0;
                [x, 10.0, x + 10.0, 30.0, 0.0]
            })
            .collect();
        let transform = TrainTransform {
            max_labels: 5,
            flip_prob: 0.0,
            hsv_prob: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (chw, labels) = transform.apply(&image, &targets, (64, 64), &mut rng);

        assert_eq!(chw.len(), 3 * 64 * 64);
        assert_eq!(labels.len(), 5);
        assert_eq!(labels[0], [0.0, 2.5, 10.0, 5.0, 10.0]);
    }

    #[test]
    fn tiny_boxes_fall_back_to_the_original_sample() {
        let image = RgbImage::from_pixel(640, 640, Rgb([90, 90, 90]));
        // 4px box shrinks below one pixel at 64x64 input
        let targets = [[100.0, 100.0, 104.0, 104.0, 0.0]];
        let transform = TrainTransform {
            max_labels: 50,
            flip_prob: 0.0,
            hsv_prob: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (_, labels) = transform.apply(&image, &targets, (64, 64), &mut rng);
        assert_eq!(labels.len(), 1);
        assert!((labels[0][3] - 0.4).abs() < 1e-5);
    }
}
