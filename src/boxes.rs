//! Box geometry, NMS and detection post-processing on host data.

use std::cmp::Ordering;

pub fn cxcywh_to_xyxy(b: [f32; 4]) -> [f32; 4] {
    let (hw, hh) = (b[2] * 0.5, b[3] * 0.5);
    [b[0] - hw, b[1] - hh, b[0] + hw, b[1] + hh]
}

pub fn xyxy_to_cxcywh(b: [f32; 4]) -> [f32; 4] {
    [(b[0] + b[2]) * 0.5, (b[1] + b[3]) * 0.5, b[2] - b[0], b[3] - b[1]]
}

pub fn iou_xyxy(a: [f32; 4], b: [f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

pub fn iou_cxcywh(a: [f32; 4], b: [f32; 4]) -> f32 {
    iou_xyxy(cxcywh_to_xyxy(a), cxcywh_to_xyxy(b))
}

/// Greedy NMS; returns kept indices ordered by descending score.
pub fn nms(boxes: &[[f32; 4]], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order[pos + 1..] {
            if !suppressed[j] && iou_xyxy(boxes[i], boxes[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }
    keep
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// x0, y0, x1, y1 in pixels.
    pub bbox: [f32; 4],
    pub obj_conf: f32,
    pub cls_conf: f32,
    pub class_id: usize,
}

impl Detection {
    pub fn score(&self) -> f32 {
        self.obj_conf * self.cls_conf
    }

    pub fn scaled(mut self, factor: f32) -> Self {
        for v in self.bbox.iter_mut() {
            *v *= factor;
        }
        self
    }
}

/// Filters sigmoided predictions (`cx, cy, w, h, obj, cls...` per anchor) by
/// `obj * cls_conf >= conf_thre` and runs NMS per class.
pub fn postprocess(
    predictions: &[f32],
    batch: usize,
    num_classes: usize,
    conf_thre: f32,
    nms_thre: f32,
) -> Vec<Vec<Detection>> {
    let channels = 5 + num_classes;
    let num_anchors = if batch == 0 { 0 } else { predictions.len() / (batch * channels) };

    (0..batch)
        .map(|b| {
            let image = &predictions[b * num_anchors * channels..(b + 1) * num_anchors * channels];
            let candidates: Vec<Detection> = image
                .chunks_exact(channels)
                .filter_map(|row| {
                    let (class_id, cls_conf) = row[5..]
                        .iter()
                        .copied()
                        .enumerate()
                        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))?;
                    let det = Detection {
                        bbox: cxcywh_to_xyxy([row[0], row[1], row[2], row[3]]),
                        obj_conf: row[4],
                        cls_conf,
                        class_id,
                    };
                    (det.score() >= conf_thre).then_some(det)
                })
                .collect();
            batched_nms(candidates, num_classes, nms_thre)
        })
        .collect()
}

fn batched_nms(candidates: Vec<Detection>, num_classes: usize, nms_thre: f32) -> Vec<Detection> {
    let mut kept = Vec::new();
    for class_id in 0..num_classes {
        let class_dets: Vec<&Detection> = candidates.iter().filter(|d| d.class_id == class_id).collect();
        if class_dets.is_empty() {
            continue;
        }
        let boxes: Vec<[f32; 4]> = class_dets.iter().map(|d| d.bbox).collect();
        let scores: Vec<f32> = class_dets.iter().map(|d| d.score()).collect();
        kept.extend(nms(&boxes, &scores, nms_thre).into_iter().map(|i| *class_dets[i]));
    }
    kept.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(Ordering::Equal));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou_xyxy(a, a) - 1.0).abs() < 1e-6);
        assert_eq!(iou_xyxy(a, [20.0, 20.0, 30.0, 30.0]), 0.0);
        assert!((iou_xyxy(a, [5.0, 0.0, 15.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_center_size_boxes() {
        let c = [5.0, 5.0, 10.0, 10.0];
        assert!((iou_cxcywh(c, c) - 1.0).abs() < 1e-6);
        assert!((iou_cxcywh(c, [10.0, 5.0, 10.0, 10.0]) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(iou_cxcywh(c, [25.0, 25.0, 10.0, 10.0]), 0.0);
    }

    #[test]
    fn nms_keeps_highest_and_drops_overlaps() {
        let boxes = [
            [0.0, 0.0, 10.0, 10.0],
            [1.0, 1.0, 11.0, 11.0],
            [50.0, 50.0, 60.0, 60.0],
        ];
        let scores = [0.6, 0.9, 0.3];
        assert_eq!(nms(&boxes, &scores, 0.5), vec![1, 2]);
        assert_eq!(nms(&boxes, &scores, 0.9), vec![1, 0, 2]);
    }

    #[test]
    fn postprocess_filters_by_score_and_class() {
        // two anchors, two classes: cx cy w h obj c0 c1
        let preds = [
            10.0, 10.0, 4.0, 4.0, 0.9, 0.1, 0.8, //
            10.0, 10.0, 4.0, 4.0, 0.2, 0.9, 0.1,
        ];
        let out = postprocess(&preds, 1, 2, 0.3, 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 1);
        let det = out[0][0];
        assert_eq!(det.class_id, 1);
        assert_eq!(det.bbox, [8.0, 8.0, 12.0, 12.0]);
        assert!((det.score() - 0.72).abs() < 1e-6);
    }

    #[test]
    fn overlapping_boxes_of_different_classes_survive() {
        let preds = [
            10.0, 10.0, 4.0, 4.0, 0.9, 0.9, 0.0, //
            10.0, 10.0, 4.0, 4.0, 0.9, 0.0, 0.8,
        ];
        let out = postprocess(&preds, 1, 2, 0.1, 0.5);
        assert_eq!(out[0].len(), 2);
    }
}
