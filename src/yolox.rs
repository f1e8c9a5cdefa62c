use crate::{
    heads::YoloxHead,
    layers::{Layer, LayerMut, Layers},
    loss::{LossOutput, Target, YoloxLoss},
    pafpn::YoloPafpn,
};
use burn::{
    prelude::*,
    tensor::{backend::Backend, Tensor},
};

#[derive(Module, Debug)]
pub struct Yolox<B: Backend> {
    pub backbone: YoloPafpn<B>,
    pub head: YoloxHead<B>,
}

impl<B: Backend> Yolox<B> {
    pub fn new(backbone: YoloPafpn<B>, head: YoloxHead<B>) -> Self {
        Self { backbone, head }
    }

    /// Raw per-level head maps `[B, 5 + C, H, W]` for strides 8/16/32.
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let features = self.backbone.forward(x);
        self.head.forward(features)
    }

    /// Decoded predictions `[B, anchors, 5 + C]`: pixel `cx, cy, w, h`,
    /// objectness and class probabilities.
    pub fn infer(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let outputs = self.forward(x);
        self.head.decode_outputs(outputs)
    }

    pub fn loss(&self, images: Tensor<B, 4>, targets: &[Vec<Target>]) -> LossOutput<B> {
        let outputs = self.forward(images);
        YoloxLoss::new(self.head.num_classes()).forward(outputs, targets)
    }
}

impl<B: Backend> Layers<B> for Yolox<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.backbone.visit_layers(visit);
        self.head.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.backbone.visit_layers_mut(visit);
        self.head.visit_layers_mut(visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Activation;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn nano_forward_and_infer_shapes() {
        let device = Default::default();
        let in_channels = [256, 512, 1024];
        let backbone = YoloPafpn::<TestBackend>::new(0.33, 0.25, in_channels, true, Activation::Silu, &device);
        let head = YoloxHead::new(1, 0.25, in_channels, true, Activation::Silu, &device);
        let model = Yolox::new(backbone, head);

        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        let outputs = model.forward(x.clone());
        let dims: Vec<[usize; 4]> = outputs.iter().map(|o| o.dims()).collect();
        assert_eq!(dims, vec![[1, 6, 8, 8], [1, 6, 4, 4], [1, 6, 2, 2]]);

        assert_eq!(model.infer(x).dims(), [1, 64 + 16 + 4, 6]);
    }
}
