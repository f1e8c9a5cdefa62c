use crate::layers::{Layer, LayerMut, Layers};
use burn::{
    module::{AutodiffModule, RunningState},
    tensor::{backend::AutodiffBackend, Tensor},
};

enum Snapshot<B: AutodiffBackend> {
    Conv {
        weight: Tensor<B::InnerBackend, 4>,
        bias: Option<Tensor<B::InnerBackend, 1>>,
    },
    Norm {
        gamma: Tensor<B::InnerBackend, 1>,
        beta: Tensor<B::InnerBackend, 1>,
        mean: Tensor<B::InnerBackend, 1>,
        var: Tensor<B::InnerBackend, 1>,
    },
}

/// Exponential moving average of a trained model's weights and batch-norm
/// statistics. The averaged copy lives on the inner (non-autodiff) backend.
pub struct ModelEma<B: AutodiffBackend, M: AutodiffModule<B>> {
    ema: M::InnerModule,
    updates: usize,
    base_decay: f64,
}

impl<B, M> ModelEma<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Layers<B>,
    M::InnerModule: Layers<B::InnerBackend>,
{
    pub fn new(model: &M, updates: usize) -> Self {
        Self {
            ema: model.valid(),
            updates,
            base_decay: 0.9999,
        }
    }

    /// `base · (1 − e^(−updates / 2000))`: small early in training so the
    /// average follows the model closely.
    pub fn decay(&self) -> f64 {
        self.base_decay * (1.0 - (-(self.updates as f64) / 2000.0).exp())
    }

    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn module(&self) -> &M::InnerModule {
        &self.ema
    }

    pub fn update(&mut self, model: &M) {
        self.updates += 1;
        let d = self.decay();

        let mut snapshots = Vec::new();
        model.visit_layers(&mut |layer| {
            snapshots.push(match layer {
                Layer::Conv(conv) => Snapshot::<B>::Conv {
                    weight: conv.weight.val().inner(),
                    bias: conv.bias.as_ref().map(|b| b.val().inner()),
                },
                Layer::BatchNorm(bn) => Snapshot::Norm {
                    gamma: bn.gamma.val().inner(),
                    beta: bn.beta.val().inner(),
                    mean: bn.running_mean.value().inner(),
                    var: bn.running_var.value().inner(),
                },
            })
        });

        let blend1 = |ema: Tensor<B::InnerBackend, 1>, src: Tensor<B::InnerBackend, 1>| ema * d + src * (1.0 - d);
        let mut snapshots = snapshots.into_iter();
        self.ema.visit_layers_mut(&mut |layer| match (layer, snapshots.next()) {
            (LayerMut::Conv(conv), Some(Snapshot::Conv { weight, bias })) => {
                conv.weight = conv.weight.clone().map(|w| w * d + weight * (1.0 - d));
                if let (Some(param), Some(src)) = (conv.bias.take(), bias) {
                    conv.bias = Some(param.map(|b| blend1(b, src)));
                }
            }
            (LayerMut::BatchNorm(bn), Some(Snapshot::Norm { gamma, beta, mean, var })) => {
                bn.gamma = bn.gamma.clone().map(|g| blend1(g, gamma));
                bn.beta = bn.beta.clone().map(|b| blend1(b, beta));
                bn.running_mean = RunningState::new(blend1(bn.running_mean.value(), mean));
                bn.running_var = RunningState::new(blend1(bn.running_var.value(), var));
            }
            _ => {}
        });
    }
}
