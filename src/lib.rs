pub mod blocks;
pub mod boxes;
pub mod config;
pub mod darknet;
pub mod data;
pub mod ema;
pub mod error;
pub mod evaluator;
pub mod exp;
pub mod heads;
pub mod layers;
pub mod loss;
pub mod mask;
pub mod mosaic;
pub mod pafpn;
pub mod scheduler;
pub mod training;
pub mod transforms;
pub mod yolox;

pub use config::ExpConfig;
pub use exp::{EvalDatasetOptions, Experiment};
pub use mask::MaskExp;
pub use yolox::Yolox;

#[cfg(feature = "wgpu")]
pub type InferBackend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
pub type InferBackend = burn::backend::NdArray<f32>;

pub type TrainBackend = burn::backend::Autodiff<InferBackend>;
