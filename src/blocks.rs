use crate::{
    config::Activation,
    layers::{Layer, LayerMut, Layers},
};
use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        activation::{leaky_relu, relu, silu},
        backend::Backend,
        Tensor,
    },
};

pub fn activate<B: Backend>(act: Activation, x: Tensor<B, 4>) -> Tensor<B, 4> {
    match act {
        Activation::Silu => silu(x),
        Activation::Relu => relu(x),
        Activation::Lrelu => leaky_relu(x, 0.1),
    }
}

/// Conv2d -> BatchNorm -> activation, "same" padding for odd kernels.
#[derive(Module, Debug)]
pub struct BaseConv<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    act: Ignored<Activation>,
}

impl<B: Backend> BaseConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        ksize: usize,
        stride: usize,
        groups: usize,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        let pad = (ksize - 1) / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [ksize, ksize])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            act: Ignored(act),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        activate(self.act.0, self.bn.forward(x))
    }
}

impl<B: Backend> Layers<B> for BaseConv<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        visit(Layer::Conv(&self.conv));
        visit(Layer::BatchNorm(&self.bn));
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        visit(LayerMut::Conv(&mut self.conv));
        visit(LayerMut::BatchNorm(&mut self.bn));
    }
}

/// Depthwise + pointwise pair when `depthwise`, a single `BaseConv` otherwise.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    dconv: BaseConv<B>,
    pconv: Option<BaseConv<B>>,
}

impl<B: Backend> ConvBlock<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        ksize: usize,
        stride: usize,
        depthwise: bool,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        if depthwise {
            Self {
                dconv: BaseConv::new(in_channels, in_channels, ksize, stride, in_channels, act, device),
                pconv: Some(BaseConv::new(in_channels, out_channels, 1, 1, 1, act, device)),
            }
        } else {
            Self {
                dconv: BaseConv::new(in_channels, out_channels, ksize, stride, 1, act, device),
                pconv: None,
            }
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.dconv.forward(x);
        match &self.pconv {
            Some(pconv) => pconv.forward(x),
            None => x,
        }
    }
}

impl<B: Backend> Layers<B> for ConvBlock<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.dconv.visit_layers(visit);
        self.pconv.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.dconv.visit_layers_mut(visit);
        self.pconv.visit_layers_mut(visit);
    }
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: BaseConv<B>,
    conv2: ConvBlock<B>,
    use_add: bool,
}

impl<B: Backend> Bottleneck<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        shortcut: bool,
        expansion: f64,
        depthwise: bool,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        let hidden = (out_channels as f64 * expansion) as usize;
        Self {
            conv1: BaseConv::new(in_channels, hidden, 1, 1, 1, act, device),
            conv2: ConvBlock::new(hidden, out_channels, 3, 1, depthwise, act, device),
            use_add: shortcut && in_channels == out_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let y = self.conv2.forward(self.conv1.forward(x.clone()));
        if self.use_add {
            y + x
        } else {
            y
        }
    }
}

impl<B: Backend> Layers<B> for Bottleneck<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.conv1.visit_layers(visit);
        self.conv2.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.conv1.visit_layers_mut(visit);
        self.conv2.visit_layers_mut(visit);
    }
}

/// Cross-stage partial layer: half the channels go through `n` bottlenecks,
/// the other half bypass them, then both are fused.
#[derive(Module, Debug)]
pub struct CspLayer<B: Backend> {
    conv1: BaseConv<B>,
    conv2: BaseConv<B>,
    conv3: BaseConv<B>,
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> CspLayer<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        n: usize,
        shortcut: bool,
        depthwise: bool,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        let hidden = out_channels / 2;
        let blocks = (0..n)
            .map(|_| Bottleneck::new(hidden, hidden, shortcut, 1.0, depthwise, act, device))
            .collect();

        Self {
            conv1: BaseConv::new(in_channels, hidden, 1, 1, 1, act, device),
            conv2: BaseConv::new(in_channels, hidden, 1, 1, 1, act, device),
            conv3: BaseConv::new(2 * hidden, out_channels, 1, 1, 1, act, device),
            blocks,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x1 = self.conv1.forward(x.clone());
        for block in &self.blocks {
            x1 = block.forward(x1);
        }
        let x2 = self.conv2.forward(x);
        self.conv3.forward(Tensor::cat(vec![x1, x2], 1))
    }
}

impl<B: Backend> Layers<B> for CspLayer<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.conv1.visit_layers(visit);
        self.conv2.visit_layers(visit);
        self.conv3.visit_layers(visit);
        self.blocks.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.conv1.visit_layers_mut(visit);
        self.conv2.visit_layers_mut(visit);
        self.conv3.visit_layers_mut(visit);
        self.blocks.visit_layers_mut(visit);
    }
}

/// Spatial pyramid pooling with 5/9/13 max-pool kernels.
#[derive(Module, Debug)]
pub struct SppBottleneck<B: Backend> {
    conv1: BaseConv<B>,
    pools: Vec<MaxPool2d>,
    conv2: BaseConv<B>,
}

impl<B: Backend> SppBottleneck<B> {
    pub fn new(in_channels: usize, out_channels: usize, act: Activation, device: &B::Device) -> Self {
        let kernel_sizes = [5, 9, 13];
        let hidden = in_channels / 2;
        let pools = kernel_sizes
            .iter()
            .map(|&k| {
                MaxPool2dConfig::new([k, k])
                    .with_strides([1, 1])
                    .with_padding(PaddingConfig2d::Explicit(k / 2, k / 2))
                    .init()
            })
            .collect();

        Self {
            conv1: BaseConv::new(in_channels, hidden, 1, 1, 1, act, device),
            pools,
            conv2: BaseConv::new(hidden * (kernel_sizes.len() + 1), out_channels, 1, 1, 1, act, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let mut branches = vec![x.clone()];
        for pool in &self.pools {
            branches.push(pool.forward(x.clone()));
        }
        self.conv2.forward(Tensor::cat(branches, 1))
    }
}

impl<B: Backend> Layers<B> for SppBottleneck<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.conv1.visit_layers(visit);
        self.conv2.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.conv1.visit_layers_mut(visit);
        self.conv2.visit_layers_mut(visit);
    }
}

/// Space-to-depth (2x2 patches into channels) followed by a conv.
#[derive(Module, Debug)]
pub struct Focus<B: Backend> {
    conv: BaseConv<B>,
}

impl<B: Backend> Focus<B> {
    pub fn new(in_channels: usize, out_channels: usize, ksize: usize, act: Activation, device: &B::Device) -> Self {
        Self {
            conv: BaseConv::new(in_channels * 4, out_channels, ksize, 1, 1, act, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let (h2, w2) = (height / 2, width / 2);
        // [b, c, h2, dy, w2, dx] -> [b, dx, dy, c, h2, w2]
        let patches = x
            .reshape([batch, channels, h2, 2, w2, 2])
            .permute([0, 5, 3, 1, 2, 4])
            .reshape([batch, channels * 4, h2, w2]);
        self.conv.forward(patches)
    }
}

impl<B: Backend> Layers<B> for Focus<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.conv.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.conv.visit_layers_mut(visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::count_layers;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn focus_halves_resolution_and_quadruples_channels_before_conv() {
        let device = Default::default();
        let focus = Focus::<TestBackend>::new(3, 8, 3, Activation::Silu, &device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(focus.forward(x).dims(), [2, 8, 16, 16]);
    }

    #[test]
    fn depthwise_block_has_two_convs() {
        let device = Default::default();
        let dw = ConvBlock::<TestBackend>::new(8, 16, 3, 2, true, Activation::Silu, &device);
        let plain = ConvBlock::<TestBackend>::new(8, 16, 3, 2, false, Activation::Silu, &device);
        assert_eq!(count_layers(&dw), (2, 2));
        assert_eq!(count_layers(&plain), (1, 1));

        let x = Tensor::<TestBackend, 4>::zeros([1, 8, 16, 16], &device);
        assert_eq!(dw.forward(x.clone()).dims(), [1, 16, 8, 8]);
        assert_eq!(plain.forward(x).dims(), [1, 16, 8, 8]);
    }

    #[test]
    fn csp_and_spp_keep_spatial_size() {
        let device = Default::default();
        let csp = CspLayer::<TestBackend>::new(16, 32, 2, true, true, Activation::Silu, &device);
        let spp = SppBottleneck::<TestBackend>::new(32, 32, Activation::Silu, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 16, 8, 8], &device);
        let y = csp.forward(x);
        assert_eq!(y.dims(), [1, 32, 8, 8]);
        assert_eq!(spp.forward(y).dims(), [1, 32, 8, 8]);
    }
}
