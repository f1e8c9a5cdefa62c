use crate::config::SchedulerKind;
use std::f64::consts::PI;

/// Per-iteration learning rate for a training run.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    pub kind: SchedulerKind,
    pub lr: f64,
    pub iters_per_epoch: usize,
    pub total_epochs: usize,
    pub warmup_epochs: usize,
    pub warmup_lr_start: f64,
    pub no_aug_epochs: usize,
    pub min_lr_ratio: f64,
}

impl LrScheduler {
    pub fn new(kind: SchedulerKind, lr: f64, iters_per_epoch: usize, total_epochs: usize) -> Self {
        Self {
            kind,
            lr,
            iters_per_epoch,
            total_epochs,
            warmup_epochs: 0,
            warmup_lr_start: 0.0,
            no_aug_epochs: 0,
            min_lr_ratio: 0.0,
        }
    }

    pub fn with_warmup(mut self, warmup_epochs: usize, warmup_lr_start: f64) -> Self {
        self.warmup_epochs = warmup_epochs;
        self.warmup_lr_start = warmup_lr_start;
        self
    }

    pub fn with_no_aug_epochs(mut self, no_aug_epochs: usize) -> Self {
        self.no_aug_epochs = no_aug_epochs;
        self
    }

    pub fn with_min_lr_ratio(mut self, min_lr_ratio: f64) -> Self {
        self.min_lr_ratio = min_lr_ratio;
        self
    }

    pub fn total_iters(&self) -> usize {
        self.iters_per_epoch * self.total_epochs
    }

    /// Learning rate for the given global iteration (0-based).
    pub fn update_lr(&self, iters: usize) -> f64 {
        let total = self.total_iters().max(1) as f64;
        let iters = iters as f64;
        let warmup_total = (self.iters_per_epoch * self.warmup_epochs) as f64;

        match self.kind {
            SchedulerKind::Cos => self.lr * 0.5 * (1.0 + (PI * iters / total).cos()),
            SchedulerKind::WarmCos => {
                if iters <= warmup_total && warmup_total > 0.0 {
                    (self.lr - self.warmup_lr_start) * iters / warmup_total + self.warmup_lr_start
                } else {
                    let span = (total - warmup_total).max(1.0);
                    self.lr * 0.5 * (1.0 + (PI * (iters - warmup_total) / span).cos())
                }
            }
            SchedulerKind::YoloxWarmCos => {
                let warmup_total = warmup_total.max(1.0);
                let no_aug = (self.iters_per_epoch * self.no_aug_epochs) as f64;
                let min_lr = self.lr * self.min_lr_ratio;

                if iters <= warmup_total {
                    (self.lr - self.warmup_lr_start) * (iters / warmup_total).powi(2) + self.warmup_lr_start
                } else if iters >= total - no_aug {
                    min_lr
                } else {
                    let span = (total - warmup_total - no_aug).max(1.0);
                    min_lr + 0.5 * (self.lr - min_lr) * (1.0 + (PI * (iters - warmup_total) / span).cos())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn face_schedule() -> LrScheduler {
        // 2 warmup epochs, 10 epochs, last 2 without augmentation, 10 iters each
        LrScheduler::new(SchedulerKind::YoloxWarmCos, 0.01, 10, 10)
            .with_warmup(2, 0.0)
            .with_no_aug_epochs(2)
            .with_min_lr_ratio(0.001)
    }

    #[test]
    fn yolox_warmup_is_quadratic() {
        let s = face_schedule();
        assert!(close(s.update_lr(0), 0.0));
        assert!(close(s.update_lr(10), 0.01 * 0.25));
        assert!(close(s.update_lr(20), 0.01));
    }

    #[test]
    fn yolox_cosine_reaches_min_and_stays_flat() {
        let s = face_schedule();
        let min_lr = 0.01 * 0.001;
        // midpoint of the cosine segment [20, 80)
        assert!(close(s.update_lr(50), min_lr + 0.5 * (0.01 - min_lr)));
        for it in 80..100 {
            assert!(close(s.update_lr(it), min_lr));
        }
        let mut prev = f64::MAX;
        for it in 20..80 {
            let lr = s.update_lr(it);
            assert!(lr <= prev);
            prev = lr;
        }
    }

    #[test]
    fn warmcos_is_linear_then_cosine() {
        let s = LrScheduler::new(SchedulerKind::WarmCos, 0.1, 10, 4).with_warmup(1, 0.0);
        assert!(close(s.update_lr(5), 0.05));
        assert!(close(s.update_lr(10), 0.1));
        assert!(close(s.update_lr(25), 0.05));
    }

    #[test]
    fn plain_cosine_halves_at_midpoint() {
        let s = LrScheduler::new(SchedulerKind::Cos, 0.2, 5, 4);
        assert!(close(s.update_lr(0), 0.2));
        assert!(close(s.update_lr(10), 0.1));
        assert!(s.update_lr(20).abs() < 1e-12);
    }
}
