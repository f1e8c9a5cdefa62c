use crate::{
    boxes::{iou_xyxy, postprocess},
    data::{Annotation, DetectionBatch, VocDetection, VOC_CLASSES},
    yolox::Yolox,
};
use anyhow::{anyhow, Result};
use burn::{data::dataloader::DataLoader, tensor::backend::Backend};
use std::{cmp::Ordering, sync::Arc};

/// Sequential evaluation loader plus the dataset it reads, which holds the
/// ground truth.
pub struct EvalLoader<B: Backend> {
    pub loader: Arc<dyn DataLoader<B, DetectionBatch<B>>>,
    pub dataset: Arc<VocDetection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalSummary {
    pub ap50_95: f64,
    pub ap50: f64,
    /// (class name, AP at IoU 0.5)
    pub per_class: Vec<(String, f64)>,
}

/// A detection kept for AP computation, in original image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
    pub image: usize,
    pub score: f32,
    pub bbox: [f32; 4],
}

/// Ground-truth boxes of one class in one image.
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    pub boxes: Vec<[f32; 4]>,
    pub difficult: Vec<bool>,
}

pub struct VocEvaluator<B: Backend> {
    loader: EvalLoader<B>,
    pub img_size: (usize, usize),
    pub confthre: f64,
    pub nmsthre: f64,
    pub num_classes: usize,
    pub use_07_metric: bool,
}

impl<B: Backend> VocEvaluator<B> {
    pub fn new(
        loader: EvalLoader<B>,
        img_size: (usize, usize),
        confthre: f64,
        nmsthre: f64,
        num_classes: usize,
    ) -> Self {
        Self {
            loader,
            img_size,
            confthre,
            nmsthre,
            num_classes,
            use_07_metric: true,
        }
    }

    pub fn dataset(&self) -> &VocDetection {
        &self.loader.dataset
    }

    pub fn evaluate(&self, model: &Yolox<B>) -> Result<EvalSummary> {
        let start = std::time::Instant::now();
        let mut detections: Vec<Vec<ScoredBox>> = vec![Vec::new(); self.num_classes];

        for batch in self.loader.loader.iter() {
            let batch_size = batch.infos.len();
            let predictions = model
                .infer(batch.images)
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow!("Lecture des prédictions: {:?}", e))?;
            let outputs = postprocess(
                &predictions,
                batch_size,
                self.num_classes,
                self.confthre as f32,
                self.nmsthre as f32,
            );

            for (info, dets) in batch.infos.iter().zip(outputs) {
                let (w, h) = (info.width as f32, info.height as f32);
                for det in dets {
                    let mut bbox = det.scaled(1.0 / info.scale.max(f32::EPSILON)).bbox;
                    bbox[0] = bbox[0].clamp(0.0, w);
                    bbox[1] = bbox[1].clamp(0.0, h);
                    bbox[2] = bbox[2].clamp(0.0, w);
                    bbox[3] = bbox[3].clamp(0.0, h);
                    detections[det.class_id].push(ScoredBox {
                        image: info.index,
                        score: det.score(),
                        bbox,
                    });
                }
            }
        }
        println!("⏱️  Inférence terminée en {:?}", start.elapsed());

        let summary = self.summarize(&detections);
        print_summary(&summary);
        Ok(summary)
    }

    fn summarize(&self, detections: &[Vec<ScoredBox>]) -> EvalSummary {
        let dataset = self.dataset();
        let annotations: Vec<&Annotation> = (0..dataset.len()).filter_map(|i| dataset.annotation(i)).collect();

        let thresholds: Vec<f32> = (0..10).map(|i| 0.5 + 0.05 * i as f32).collect();
        let mut per_class = Vec::with_capacity(self.num_classes);
        let mut ap_by_threshold = vec![0.0; thresholds.len()];

        for (class_id, dets) in detections.iter().enumerate() {
            let gts = ground_truth(&annotations, class_id);
            let aps: Vec<f64> = thresholds
                .iter()
                .map(|&t| class_ap(dets, &gts, t, self.use_07_metric))
                .collect();
            for (acc, ap) in ap_by_threshold.iter_mut().zip(&aps) {
                *acc += ap / self.num_classes as f64;
            }
            let name = VOC_CLASSES
                .get(class_id)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("class_{class_id}"));
            per_class.push((name, aps[0]));
        }

        EvalSummary {
            ap50_95: ap_by_threshold.iter().sum::<f64>() / thresholds.len() as f64,
            ap50: ap_by_threshold[0],
            per_class,
        }
    }
}

fn print_summary(summary: &EvalSummary) {
    println!("📊 Évaluation VOC:");
    for (name, ap) in &summary.per_class {
        println!("   • AP50 {}: {:.4}", name, ap);
    }
    println!("   - mAP50:95: {:.4}", summary.ap50_95);
    println!("   - mAP50: {:.4}", summary.ap50);
}

/// Per-image ground truth for one class.
pub fn ground_truth(annotations: &[&Annotation], class_id: usize) -> Vec<GroundTruth> {
    annotations
        .iter()
        .map(|ann| {
            let mut gt = GroundTruth::default();
            for obj in ann.objects.iter().filter(|o| o.class_id == class_id) {
                gt.boxes.push(obj.bbox);
                gt.difficult.push(obj.difficult);
            }
            gt
        })
        .collect()
}

/// Average precision of one class at one IoU threshold. Matches against
/// difficult boxes count neither as true nor false positives.
pub fn class_ap(detections: &[ScoredBox], gts: &[GroundTruth], iou_thresh: f32, use_07_metric: bool) -> f64 {
    let npos: usize = gts
        .iter()
        .map(|g| g.difficult.iter().filter(|d| !**d).count())
        .sum();
    if npos == 0 {
        return 0.0;
    }

    let mut order: Vec<&ScoredBox> = detections.iter().collect();
    order.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut matched: Vec<Vec<bool>> = gts.iter().map(|g| vec![false; g.boxes.len()]).collect();
    let mut tp = Vec::with_capacity(order.len());
    let mut fp = Vec::with_capacity(order.len());

    for det in order {
        let Some(gt) = gts.get(det.image) else {
            tp.push(0.0);
            fp.push(1.0);
            continue;
        };
        let best = gt
            .boxes
            .iter()
            .enumerate()
            .map(|(j, b)| (j, iou_xyxy(det.bbox, *b)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let (is_tp, is_fp) = match best {
            Some((j, iou)) if iou > iou_thresh => {
                if gt.difficult[j] {
                    (0.0, 0.0)
                } else if !matched[det.image][j] {
                    matched[det.image][j] = true;
                    (1.0, 0.0)
                } else {
                    (0.0, 1.0)
                }
            }
            _ => (0.0, 1.0),
        };
        tp.push(is_tp);
        fp.push(is_fp);
    }

    let (mut tp_sum, mut fp_sum) = (0.0, 0.0);
    let mut rec = Vec::with_capacity(tp.len());
    let mut prec = Vec::with_capacity(tp.len());
    for (t, f) in tp.iter().zip(&fp) {
        tp_sum += t;
        fp_sum += f;
        rec.push(tp_sum / npos as f64);
        prec.push(tp_sum / f64::max(tp_sum + fp_sum, f64::EPSILON));
    }
    voc_ap(&rec, &prec, use_07_metric)
}

/// VOC AP from a precision/recall curve: the 11-point interpolation of
/// VOC2007 or the exact area under the monotone envelope.
pub fn voc_ap(rec: &[f64], prec: &[f64], use_07_metric: bool) -> f64 {
    if use_07_metric {
        return (0..=10)
            .map(|i| {
                let t = i as f64 / 10.0;
                rec.iter()
                    .zip(prec)
                    .filter(|(r, _)| **r >= t)
                    .map(|(_, p)| *p)
                    .fold(0.0, f64::max)
                    / 11.0
            })
            .sum();
    }

    let mut mrec = Vec::with_capacity(rec.len() + 2);
    mrec.push(0.0);
    mrec.extend_from_slice(rec);
    mrec.push(1.0);
    let mut mpre = Vec::with_capacity(prec.len() + 2);
    mpre.push(0.0);
    mpre.extend_from_slice(prec);
    mpre.push(0.0);

    for i in (0..mpre.len() - 1).rev() {
        mpre[i] = mpre[i].max(mpre[i + 1]);
    }
    (1..mrec.len())
        .filter(|&i| mrec[i] != mrec[i - 1])
        .map(|i| (mrec[i] - mrec[i - 1]) * mpre[i])
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gt(boxes: &[[f32; 4]], difficult: &[bool]) -> GroundTruth {
        GroundTruth {
            boxes: boxes.to_vec(),
            difficult: difficult.to_vec(),
        }
    }

    #[test]
    fn perfect_detections_score_one() {
        let gts = vec![gt(&[[0.0, 0.0, 10.0, 10.0]], &[false]), gt(&[[5.0, 5.0, 20.0, 20.0]], &[false])];
        let dets = [
            ScoredBox { image: 0, score: 0.9, bbox: [0.0, 0.0, 10.0, 10.0] },
            ScoredBox { image: 1, score: 0.8, bbox: [5.0, 5.0, 20.0, 20.0] },
        ];
        assert!((class_ap(&dets, &gts, 0.5, true) - 1.0).abs() < 1e-9);
        assert!((class_ap(&dets, &gts, 0.5, false) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn duplicates_and_misses_lower_ap() {
        let gts = vec![gt(&[[0.0, 0.0, 10.0, 10.0], [50.0, 50.0, 60.0, 60.0]], &[false, false])];
        let dets = [
            ScoredBox { image: 0, score: 0.9, bbox: [0.0, 0.0, 10.0, 10.0] },
            ScoredBox { image: 0, score: 0.8, bbox: [0.0, 0.0, 10.0, 10.0] },
        ];
        // recall tops out at 0.5 with precision 1.0: 6 of 11 points
        let ap = class_ap(&dets, &gts, 0.5, true);
        assert!((ap - 6.0 / 11.0).abs() < 1e-9, "ap = {ap}");
    }

    #[test]
    fn difficult_matches_are_ignored() {
        let gts = vec![gt(&[[0.0, 0.0, 10.0, 10.0], [30.0, 30.0, 40.0, 40.0]], &[false, true])];
        let dets = [
            ScoredBox { image: 0, score: 0.9, bbox: [30.0, 30.0, 40.0, 40.0] },
            ScoredBox { image: 0, score: 0.5, bbox: [0.0, 0.0, 10.0, 10.0] },
        ];
        assert!((class_ap(&dets, &gts, 0.5, true) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_positives_gives_zero() {
        let gts = vec![gt(&[], &[])];
        assert_eq!(class_ap(&[], &gts, 0.5, true), 0.0);
    }

    #[test]
    fn area_metric_on_known_curve() {
        let rec = [0.5, 0.5, 1.0];
        let prec = [1.0, 0.5, 2.0 / 3.0];
        let ap = voc_ap(&rec, &prec, false);
        assert!((ap - (0.5 + 0.5 * 2.0 / 3.0)).abs() < 1e-9);
    }
}
