//! Layer enumeration for composite networks.
//!
//! Network types expose their parameterised sub-layers as tagged variants so
//! that init policies and the EMA can walk them without knowing the
//! network's shape.

use burn::{
    nn::{conv::Conv2d, BatchNorm},
    tensor::backend::Backend,
};

pub enum Layer<'a, B: Backend> {
    Conv(&'a Conv2d<B>),
    BatchNorm(&'a BatchNorm<B, 2>),
}

pub enum LayerMut<'a, B: Backend> {
    Conv(&'a mut Conv2d<B>),
    BatchNorm(&'a mut BatchNorm<B, 2>),
}

/// Depth-first, declaration-ordered visit of every sub-layer.
pub trait Layers<B: Backend> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>));
    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>));
}

impl<B: Backend> Layers<B> for Conv2d<B> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        visit(Layer::Conv(self));
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        visit(LayerMut::Conv(self));
    }
}

impl<B: Backend> Layers<B> for BatchNorm<B, 2> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        visit(Layer::BatchNorm(self));
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        visit(LayerMut::BatchNorm(self));
    }
}

impl<B: Backend, L: Layers<B>> Layers<B> for Vec<L> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        for layer in self {
            layer.visit_layers(visit);
        }
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        for layer in self {
            layer.visit_layers_mut(visit);
        }
    }
}

impl<B: Backend, L: Layers<B>> Layers<B> for Option<L> {
    fn visit_layers(&self, visit: &mut dyn FnMut(Layer<'_, B>)) {
        if let Some(layer) = self {
            layer.visit_layers(visit);
        }
    }

    fn visit_layers_mut(&mut self, visit: &mut dyn FnMut(LayerMut<'_, B>)) {
        if let Some(layer) = self {
            layer.visit_layers_mut(visit);
        }
    }
}

/// Sets epsilon/momentum on every batch-norm layer. Returns how many were touched.
pub fn init_norm_layers<B: Backend, M: Layers<B>>(module: &mut M, epsilon: f64, momentum: f64) -> usize {
    let mut touched = 0;
    module.visit_layers_mut(&mut |layer| {
        if let LayerMut::BatchNorm(bn) = layer {
            bn.epsilon = epsilon;
            bn.momentum = momentum;
            touched += 1;
        }
    });
    touched
}

/// (conv layers, batch-norm layers)
pub fn count_layers<B: Backend, M: Layers<B>>(module: &M) -> (usize, usize) {
    let (mut convs, mut norms) = (0, 0);
    module.visit_layers(&mut |layer| match layer {
        Layer::Conv(_) => convs += 1,
        Layer::BatchNorm(_) => norms += 1,
    });
    (convs, norms)
}
