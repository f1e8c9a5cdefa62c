use crate::{
    blocks::{BaseConv, ConvBlock},
    config::Activation,
    layers::{Layer, LayerMut, Layers},
};
use burn::{
    module::Param,
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::*,
    tensor::{activation::sigmoid, backend::Backend, Tensor, TensorData},
};

pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Grid cell of one prediction level, in grid units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorPoint {
    pub x: f32,
    pub y: f32,
    pub stride: f32,
}

impl AnchorPoint {
    pub fn center(&self) -> (f32, f32) {
        ((self.x + 0.5) * self.stride, (self.y + 0.5) * self.stride)
    }
}

/// Decoupled classification / regression branch for one pyramid level.
#[derive(Module, Debug)]
pub struct HeadLevel<B: Backend> {
    stem: BaseConv<B>,
    cls_convs: Vec<ConvBlock<B>>,
    reg_convs: Vec<ConvBlock<B>>,
    cls_pred: Conv2d<B>,
    reg_pred: Conv2d<B>,
    obj_pred: Conv2d<B>,
}

impl<B: Backend> HeadLevel<B> {
    fn new(
        in_channels: usize,
        hidden: usize,
        num_classes: usize,
        depthwise: bool,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        let branch = || {
            (0..2)
                .map(|_| ConvBlock::new(hidden, hidden, 3, 1, depthwise, act, device))
                .collect::<Vec<_>>()
        };
        let pred = |out: usize| Conv2dConfig::new([hidden, out], [1, 1]).init(device);

        Self {
            stem: BaseConv::new(in_channels, hidden, 1, 1, 1, act, device),
            cls_convs: branch(),
            reg_convs: branch(),
            cls_pred: pred(num_classes),
            reg_pred: pred(4),
            obj_pred: pred(1),
        }
    }

    /// `[B, 4 + 1 + num_classes, H, W]` laid out as reg | obj | cls.
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem.forward(x);

        let mut cls_feat = x.clone();
        for conv in &self.cls_convs {
            cls_feat = conv.forward(cls_feat);
        }
        let mut reg_feat = x;
        for conv in &self.reg_convs {
            reg_feat = conv.forward(reg_feat);
        }

        let reg = self.reg_pred.forward(reg_feat.clone());
        let obj = self.obj_pred.forward(reg_feat);
        let cls = self.cls_pred.forward(cls_feat);
        Tensor::cat(vec![reg, obj, cls], 1)
    }
}

impl<B: Backend> Layers<B> for HeadLevel<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.stem.visit_layers(visit);
        self.cls_convs.visit_layers(visit);
        self.reg_convs.visit_layers(visit);
        self.cls_pred.visit_layers(visit);
        self.reg_pred.visit_layers(visit);
        self.obj_pred.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.stem.visit_layers_mut(visit);
        self.cls_convs.visit_layers_mut(visit);
        self.reg_convs.visit_layers_mut(visit);
        self.cls_pred.visit_layers_mut(visit);
        self.reg_pred.visit_layers_mut(visit);
        self.obj_pred.visit_layers_mut(visit);
    }
}

#[derive(Module, Debug)]
pub struct YoloxHead<B: Backend> {
    levels: Vec<HeadLevel<B>>,
    num_classes: usize,
}

impl<B: Backend> YoloxHead<B> {
    pub fn new(
        num_classes: usize,
        width: f64,
        in_channels: [usize; 3],
        depthwise: bool,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        let hidden = (256.0 * width) as usize;
        let levels = in_channels
            .iter()
            .map(|&c| {
                let c = (c as f64 * width) as usize;
                HeadLevel::new(c, hidden, num_classes, depthwise, act, device)
            })
            .collect();

        Self { levels, num_classes }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward(&self, features: [Tensor<B, 4>; 3]) -> Vec<Tensor<B, 4>> {
        self.levels
            .iter()
            .zip(features)
            .map(|(level, x)| level.forward(x))
            .collect()
    }

    /// Sets the objectness and class biases so the initial sigmoid output
    /// equals `prior_prob`.
    pub fn initialize_biases(&mut self, prior_prob: f64) {
        let bias = -((1.0 - prior_prob) / prior_prob).ln();
        for level in self.levels.iter_mut() {
            for conv in [&mut level.cls_pred, &mut level.obj_pred] {
                let weight = conv.weight.val();
                let [out_channels, ..] = weight.dims();
                let value = Tensor::<B, 1>::full([out_channels], bias, &weight.device());
                conv.bias = Some(Param::from_tensor(value));
            }
        }
    }

    /// Sigmoided, image-space predictions `[B, anchors, 5 + num_classes]`.
    pub fn decode_outputs(&self, outputs: Vec<Tensor<B, 4>>) -> Tensor<B, 3> {
        let (decoded, _) = flatten_levels(outputs);
        let [_, _, channels] = decoded.dims();
        let boxes = decoded.clone().narrow(2, 0, 4);
        let scores = sigmoid(decoded.narrow(2, 4, channels - 4));
        Tensor::cat(vec![boxes, scores], 2)
    }
}

impl<B: Backend> Layers<B> for YoloxHead<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.levels.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.levels.visit_layers_mut(visit);
    }
}

/// Concatenates per-level head maps into `[B, anchors, 5 + C]`, turning the
/// regression channels into `cx, cy, w, h` pixels. Objectness and class
/// channels stay as logits.
pub fn flatten_levels<B: Backend>(outputs: Vec<Tensor<B, 4>>) -> (Tensor<B, 3>, Vec<AnchorPoint>) {
    let mut anchors = Vec::new();
    let mut levels = Vec::with_capacity(outputs.len());

    for (output, stride) in outputs.into_iter().zip(STRIDES) {
        let [batch, channels, height, width] = output.dims();
        let device = output.device();
        let flat = output
            .reshape([batch, channels, height * width])
            .swap_dims(1, 2);

        let mut grid = Vec::with_capacity(height * width * 2);
        for y in 0..height {
            for x in 0..width {
                grid.push(x as f32);
                grid.push(y as f32);
                anchors.push(AnchorPoint {
                    x: x as f32,
                    y: y as f32,
                    stride: stride as f32,
                });
            }
        }
        let grid = Tensor::<B, 3>::from_data(TensorData::new(grid, [1, height * width, 2]), &device);

        let xy = (flat.clone().narrow(2, 0, 2) + grid) * (stride as f32);
        let wh = flat.clone().narrow(2, 2, 2).exp() * (stride as f32);
        let rest = flat.narrow(2, 4, channels - 4);
        levels.push(Tensor::cat(vec![xy, wh, rest], 2));
    }

    (Tensor::cat(levels, 1), anchors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray<f32>;

    #[test]
    fn bias_init_matches_prior() {
        let device = Default::default();
        let mut head = YoloxHead::<TestBackend>::new(1, 0.25, [256, 512, 1024], true, Activation::Silu, &device);
        head.initialize_biases(0.01);

        let features = [
            Tensor::<TestBackend, 4>::zeros([1, 64, 4, 4], &device),
            Tensor::<TestBackend, 4>::zeros([1, 128, 2, 2], &device),
            Tensor::<TestBackend, 4>::zeros([1, 256, 1, 1], &device),
        ];
        let outputs = head.forward(features);
        assert_eq!(outputs[0].dims(), [1, 6, 4, 4]);

        let decoded = head.decode_outputs(outputs);
        assert_eq!(decoded.dims(), [1, 16 + 4 + 1, 6]);
        let obj = decoded.narrow(2, 4, 1).mean().into_scalar().elem::<f32>();
        assert!((obj - 0.01).abs() < 1e-3, "objectness prior was {obj}");
    }

    #[test]
    fn flatten_decodes_grid_offsets() {
        let device = Default::default();
        let zeros = |h, w| Tensor::<TestBackend, 4>::zeros([1, 6, h, w], &device);
        let (decoded, anchors) = flatten_levels(vec![zeros(2, 2), zeros(1, 1), zeros(1, 1)]);
        assert_eq!(anchors.len(), 6);
        assert_eq!(anchors[3], AnchorPoint { x: 1.0, y: 1.0, stride: 8.0 });

        let values = decoded.into_data().to_vec::<f32>().unwrap();
        // anchor 3: xy = (0 + 1) * 8, wh = exp(0) * 8
        assert_eq!(&values[3 * 6..3 * 6 + 4], &[8.0, 8.0, 8.0, 8.0]);
        // anchor 4 (stride 16)
        assert_eq!(&values[4 * 6..4 * 6 + 4], &[0.0, 0.0, 16.0, 16.0]);
    }
}
