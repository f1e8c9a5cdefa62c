use crate::{
    blocks::{BaseConv, ConvBlock, CspLayer},
    config::Activation,
    darknet::CspDarknet,
    layers::{Layer, LayerMut, Layers},
};
use burn::{
    prelude::*,
    tensor::{
        backend::Backend,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
        Tensor,
    },
};

fn upsample<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    interpolate(x, [h * 2, w * 2], InterpolateOptions::new(InterpolateMode::Nearest))
}

/// Path-aggregation neck on top of the CSP-Darknet backbone.
#[derive(Module, Debug)]
pub struct YoloPafpn<B: Backend> {
    pub backbone: CspDarknet<B>,
    lateral_conv0: BaseConv<B>,
    c3_p4: CspLayer<B>,
    reduce_conv1: BaseConv<B>,
    c3_p3: CspLayer<B>,
    bu_conv2: ConvBlock<B>,
    c3_n3: CspLayer<B>,
    bu_conv1: ConvBlock<B>,
    c3_n4: CspLayer<B>,
}

impl<B: Backend> YoloPafpn<B> {
    pub fn new(
        depth: f64,
        width: f64,
        in_channels: [usize; 3],
        depthwise: bool,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        let ch = |i: usize| (in_channels[i] as f64 * width) as usize;
        let n = (3.0 * depth).round() as usize;

        Self {
            backbone: CspDarknet::new(depth, width, depthwise, act, device),
            lateral_conv0: BaseConv::new(ch(2), ch(1), 1, 1, 1, act, device),
            c3_p4: CspLayer::new(2 * ch(1), ch(1), n, false, depthwise, act, device),
            reduce_conv1: BaseConv::new(ch(1), ch(0), 1, 1, 1, act, device),
            c3_p3: CspLayer::new(2 * ch(0), ch(0), n, false, depthwise, act, device),
            bu_conv2: ConvBlock::new(ch(0), ch(0), 3, 2, depthwise, act, device),
            c3_n3: CspLayer::new(2 * ch(0), ch(1), n, false, depthwise, act, device),
            bu_conv1: ConvBlock::new(ch(1), ch(1), 3, 2, depthwise, act, device),
            c3_n4: CspLayer::new(2 * ch(1), ch(2), n, false, depthwise, act, device),
        }
    }

    /// Returns feature maps at strides 8, 16 and 32.
    pub fn forward(&self, x: Tensor<B, 4>) -> [Tensor<B, 4>; 3] {
        let [x2, x1, x0] = self.backbone.forward(x);

        let fpn_out0 = self.lateral_conv0.forward(x0);
        let f_out0 = Tensor::cat(vec![upsample(fpn_out0.clone()), x1], 1);
        let f_out0 = self.c3_p4.forward(f_out0);

        let fpn_out1 = self.reduce_conv1.forward(f_out0);
        let f_out1 = Tensor::cat(vec![upsample(fpn_out1.clone()), x2], 1);
        let pan_out2 = self.c3_p3.forward(f_out1);

        let p_out1 = Tensor::cat(vec![self.bu_conv2.forward(pan_out2.clone()), fpn_out1], 1);
        let pan_out1 = self.c3_n3.forward(p_out1);

        let p_out0 = Tensor::cat(vec![self.bu_conv1.forward(pan_out1.clone()), fpn_out0], 1);
        let pan_out0 = self.c3_n4.forward(p_out0);

        [pan_out2, pan_out1, pan_out0]
    }
}

impl<B: Backend> Layers<B> for YoloPafpn<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.backbone.visit_layers(visit);
        self.lateral_conv0.visit_layers(visit);
        self.c3_p4.visit_layers(visit);
        self.reduce_conv1.visit_layers(visit);
        self.c3_p3.visit_layers(visit);
        self.bu_conv2.visit_layers(visit);
        self.c3_n3.visit_layers(visit);
        self.bu_conv1.visit_layers(visit);
        self.c3_n4.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.backbone.visit_layers_mut(visit);
        self.lateral_conv0.visit_layers_mut(visit);
        self.c3_p4.visit_layers_mut(visit);
        self.reduce_conv1.visit_layers_mut(visit);
        self.c3_p3.visit_layers_mut(visit);
        self.bu_conv2.visit_layers_mut(visit);
        self.c3_n3.visit_layers_mut(visit);
        self.bu_conv1.visit_layers_mut(visit);
        self.c3_n4.visit_layers_mut(visit);
    }
}
