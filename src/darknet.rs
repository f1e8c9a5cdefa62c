use crate::{
    blocks::{ConvBlock, CspLayer, Focus, SppBottleneck},
    config::Activation,
    layers::{Layer, LayerMut, Layers},
};
use burn::{
    prelude::*,
    tensor::{backend::Backend, Tensor},
};

/// One downsampling stage: strided conv followed by CSP (and SPP for the last stage).
#[derive(Module, Debug)]
pub struct DarkStage<B: Backend> {
    down: ConvBlock<B>,
    spp: Option<SppBottleneck<B>>,
    csp: CspLayer<B>,
}

impl<B: Backend> DarkStage<B> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        in_channels: usize,
        out_channels: usize,
        n: usize,
        last: bool,
        depthwise: bool,
        act: Activation,
        device: &B::Device,
    ) -> Self {
        let spp = if last {
            Some(SppBottleneck::new(out_channels, out_channels, act, device))
        } else {
            None
        };

        Self {
            down: ConvBlock::new(in_channels, out_channels, 3, 2, depthwise, act, device),
            spp,
            csp: CspLayer::new(out_channels, out_channels, n, !last, depthwise, act, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.down.forward(x);
        if let Some(spp) = &self.spp {
            x = spp.forward(x);
        }
        self.csp.forward(x)
    }
}

impl<B: Backend> Layers<B> for DarkStage<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.down.visit_layers(visit);
        self.spp.visit_layers(visit);
        self.csp.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.down.visit_layers_mut(visit);
        self.spp.visit_layers_mut(visit);
        self.csp.visit_layers_mut(visit);
    }
}

#[derive(Module, Debug)]
pub struct CspDarknet<B: Backend> {
    stem: Focus<B>,
    dark2: DarkStage<B>,
    dark3: DarkStage<B>,
    dark4: DarkStage<B>,
    dark5: DarkStage<B>,
}

impl<B: Backend> CspDarknet<B> {
    pub fn new(depth: f64, width: f64, depthwise: bool, act: Activation, device: &B::Device) -> Self {
        let base_channels = (width * 64.0) as usize;
        let base_depth = ((depth * 3.0).round() as usize).max(1);

        Self {
            stem: Focus::new(3, base_channels, 3, act, device),
            dark2: DarkStage::new(base_channels, base_channels * 2, base_depth, false, depthwise, act, device),
            dark3: DarkStage::new(base_channels * 2, base_channels * 4, base_depth * 3, false, depthwise, act, device),
            dark4: DarkStage::new(base_channels * 4, base_channels * 8, base_depth * 3, false, depthwise, act, device),
            dark5: DarkStage::new(base_channels * 8, base_channels * 16, base_depth, true, depthwise, act, device),
        }
    }

    /// Returns the dark3, dark4 and dark5 feature maps (strides 8, 16, 32).
    pub fn forward(&self, x: Tensor<B, 4>) -> [Tensor<B, 4>; 3] {
        let x = self.stem.forward(x);
        let x = self.dark2.forward(x);
        let c3 = self.dark3.forward(x);
        let c4 = self.dark4.forward(c3.clone());
        let c5 = self.dark5.forward(c4.clone());
        [c3, c4, c5]
    }
}

impl<B: Backend> Layers<B> for CspDarknet<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        self.stem.visit_layers(visit);
        self.dark2.visit_layers(visit);
        self.dark3.visit_layers(visit);
        self.dark4.visit_layers(visit);
        self.dark5.visit_layers(visit);
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        self.stem.visit_layers_mut(visit);
        self.dark2.visit_layers_mut(visit);
        self.dark3.visit_layers_mut(visit);
        self.dark4.visit_layers_mut(visit);
        self.dark5.visit_layers_mut(visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn nano_backbone_feature_shapes() {
        let device = Default::default();
        let net = CspDarknet::<NdArray<f32>>::new(0.33, 0.25, true, Activation::Silu, &device);
        let x = Tensor::<NdArray<f32>, 4>::zeros([1, 3, 64, 64], &device);
        let [c3, c4, c5] = net.forward(x);
        assert_eq!(c3.dims(), [1, 64, 8, 8]);
        assert_eq!(c4.dims(), [1, 128, 4, 4]);
        assert_eq!(c5.dims(), [1, 256, 2, 2]);
    }
}
