//! YOLOX training loss with SimOTA label assignment.
//!
//! Assignment runs on host copies of the detached predictions; the loss
//! itself is built from tensors so gradients flow through the selected rows.

use crate::{
    boxes::iou_cxcywh,
    heads::{flatten_levels, AnchorPoint},
};
use burn::tensor::{backend::Backend, ElementConversion, Int, Tensor, TensorData};
use std::cmp::Ordering;

/// One ground-truth row: `[class, cx, cy, w, h]` in input pixels.
pub type Target = [f32; 5];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub anchor: usize,
    pub gt: usize,
    pub iou: f32,
}

#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    pub total: Tensor<B, 1>,
    pub iou_loss: f32,
    pub obj_loss: f32,
    pub cls_loss: f32,
    pub num_fg: usize,
}

#[derive(Debug, Clone)]
pub struct YoloxLoss {
    pub num_classes: usize,
    pub reg_weight: f32,
    pub center_radius: f32,
}

impl YoloxLoss {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            reg_weight: 5.0,
            center_radius: 2.5,
        }
    }

    pub fn forward<B: Backend>(&self, outputs: Vec<Tensor<B, 4>>, targets: &[Vec<Target>]) -> LossOutput<B> {
        let (decoded, anchors) = flatten_levels(outputs);
        let [batch, num_anchors, channels] = decoded.dims();
        let device = decoded.device();
        let host = decoded
            .clone()
            .detach()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();

        let mut fg_rows: Vec<i64> = Vec::new();
        let mut reg_targets: Vec<f32> = Vec::new();
        let mut cls_targets: Vec<f32> = Vec::new();
        let mut obj_targets = vec![0.0f32; batch * num_anchors];

        for (b, gts) in targets.iter().enumerate().take(batch) {
            if gts.is_empty() || host.is_empty() {
                continue;
            }
            let preds = &host[b * num_anchors * channels..(b + 1) * num_anchors * channels];
            for m in simota_assign(&anchors, preds, gts, self.num_classes, self.center_radius) {
                let row = b * num_anchors + m.anchor;
                let gt = gts[m.gt];
                fg_rows.push(row as i64);
                obj_targets[row] = 1.0;
                reg_targets.extend_from_slice(&gt[1..5]);
                let mut one_hot = vec![0.0f32; self.num_classes];
                if let Some(slot) = one_hot.get_mut(gt[0] as usize) {
                    *slot = m.iou;
                }
                cls_targets.extend(one_hot);
            }
        }

        let num_fg = fg_rows.len();
        let norm = num_fg.max(1) as f32;
        let flat = decoded.reshape([batch * num_anchors, channels]);

        let obj_t = Tensor::<B, 2>::from_data(TensorData::new(obj_targets, [batch * num_anchors, 1]), &device);
        let loss_obj = bce_with_logits(flat.clone().narrow(1, 4, 1), obj_t).sum();

        let (loss_iou, loss_cls) = if num_fg == 0 {
            (Tensor::<B, 1>::zeros([1], &device), Tensor::<B, 1>::zeros([1], &device))
        } else {
            let index = Tensor::<B, 1, Int>::from_data(TensorData::new(fg_rows, [num_fg]), &device);
            let fg = flat.select(0, index);
            let reg_t = Tensor::<B, 2>::from_data(TensorData::new(reg_targets, [num_fg, 4]), &device);
            let cls_t = Tensor::<B, 2>::from_data(
                TensorData::new(cls_targets, [num_fg, self.num_classes]),
                &device,
            );
            (
                iou_loss(fg.clone().narrow(1, 0, 4), reg_t).sum(),
                bce_with_logits(fg.narrow(1, 5, self.num_classes), cls_t).sum(),
            )
        };

        let scalar = |t: &Tensor<B, 1>| t.clone().into_scalar().elem::<f32>() / norm;
        let (iou_loss, obj_loss, cls_loss) = (scalar(&loss_iou), scalar(&loss_obj), scalar(&loss_cls));

        let total = (loss_iou * self.reg_weight + loss_obj + loss_cls) / norm;

        LossOutput {
            total,
            iou_loss: iou_loss * self.reg_weight,
            obj_loss,
            cls_loss,
            num_fg,
        }
    }
}

/// Numerically stable `BCE(sigmoid(logits), targets)` per element.
pub fn bce_with_logits<B: Backend, const D: usize>(logits: Tensor<B, D>, targets: Tensor<B, D>) -> Tensor<B, D> {
    let max_val = logits.clone().clamp_min(0.0);
    let bce_term = max_val - logits.clone() * targets;
    let log_term = (logits.abs().neg().exp() + 1.0).log();
    bce_term + log_term
}

/// `1 - IoU^2` per row for `cx, cy, w, h` boxes.
pub fn iou_loss<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 2> {
    let corners = |b: Tensor<B, 2>| {
        let xy = b.clone().narrow(1, 0, 2);
        let half = b.narrow(1, 2, 2) / 2.0;
        (xy.clone() - half.clone(), xy + half)
    };
    let area = |b: &Tensor<B, 2>| b.clone().narrow(1, 2, 1) * b.clone().narrow(1, 3, 1);

    let (p_tl, p_br) = corners(pred.clone());
    let (t_tl, t_br) = corners(target.clone());
    let tl = p_tl.max_pair(t_tl);
    let br = p_br.min_pair(t_br);
    let wh = (br - tl).clamp_min(0.0);
    let area_i = wh.clone().narrow(1, 0, 1) * wh.narrow(1, 1, 1);

    let union = area(&pred) + area(&target) - area_i.clone();
    let iou = area_i / (union + 1e-16);
    (iou.clone() * iou).neg() + 1.0
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// SimOTA assignment for one image.
///
/// `preds` holds `anchors.len()` rows of `cx, cy, w, h, obj_logit, cls_logits...`.
pub fn simota_assign(
    anchors: &[AnchorPoint],
    preds: &[f32],
    gts: &[Target],
    num_classes: usize,
    center_radius: f32,
) -> Vec<Match> {
    let channels = 5 + num_classes;
    if gts.is_empty() || anchors.is_empty() {
        return Vec::new();
    }

    // Geometry prior: anchor centre inside the gt box and/or its centre region.
    let mut candidate = vec![false; anchors.len()];
    let mut in_both = vec![vec![false; anchors.len()]; gts.len()];
    for (a, anchor) in anchors.iter().enumerate() {
        let (cx, cy) = anchor.center();
        let radius = center_radius * anchor.stride;
        for (g, gt) in gts.iter().enumerate() {
            let (gx, gy, gw, gh) = (gt[1], gt[2], gt[3], gt[4]);
            let in_box = cx > gx - gw / 2.0 && cx < gx + gw / 2.0 && cy > gy - gh / 2.0 && cy < gy + gh / 2.0;
            let in_center = cx > gx - radius && cx < gx + radius && cy > gy - radius && cy < gy + radius;
            candidate[a] |= in_box || in_center;
            in_both[g][a] = in_box && in_center;
        }
    }
    let candidates: Vec<usize> = (0..anchors.len()).filter(|&a| candidate[a]).collect();
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut ious = vec![vec![0.0f32; candidates.len()]; gts.len()];
    let mut costs = vec![vec![0.0f32; candidates.len()]; gts.len()];
    for (g, gt) in gts.iter().enumerate() {
        let gt_box = [gt[1], gt[2], gt[3], gt[4]];
        let gt_class = gt[0] as usize;
        for (c, &a) in candidates.iter().enumerate() {
            let row = &preds[a * channels..(a + 1) * channels];
            let iou = iou_cxcywh([row[0], row[1], row[2], row[3]], gt_box);

            let obj = sigmoid(row[4]);
            let cls_cost: f32 = (0..num_classes)
                .map(|k| {
                    let p = (sigmoid(row[5 + k]) * obj).sqrt().clamp(1e-7, 1.0 - 1e-7);
                    if k == gt_class {
                        -p.ln()
                    } else {
                        -(1.0 - p).ln()
                    }
                })
                .sum();

            let penalty = if in_both[g][a] { 0.0 } else { 100_000.0 };
            ious[g][c] = iou;
            costs[g][c] = cls_cost + 3.0 * -(iou + 1e-8).ln() + penalty;
        }
    }

    // Dynamic k per gt from the sum of its top-10 IoUs.
    let mut matched_gt: Vec<Option<usize>> = vec![None; candidates.len()];
    let mut matched_cost = vec![f32::INFINITY; candidates.len()];
    for g in 0..gts.len() {
        let mut top = ious[g].clone();
        top.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let dynamic_k = (top.iter().take(10).sum::<f32>() as usize).max(1);

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| costs[g][a].partial_cmp(&costs[g][b]).unwrap_or(Ordering::Equal));
        for &c in order.iter().take(dynamic_k) {
            // An anchor claimed by several gts goes to the cheapest one.
            if costs[g][c] < matched_cost[c] {
                matched_cost[c] = costs[g][c];
                matched_gt[c] = Some(g);
            }
        }
    }

    candidates
        .iter()
        .enumerate()
        .zip(matched_gt)
        .filter_map(|((c, &anchor), gt)| gt.map(|g| Match { anchor, gt: g, iou: ious[g][c] }))
        .collect()
}
