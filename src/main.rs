use anyhow::Result;
use burn::tensor::backend::Backend;
use clap::{Args, Parser, Subcommand};
use facedet::{
    data::CacheType,
    training::{load_model, TrainOptions, Trainer},
    ExpConfig, Experiment, InferBackend, MaskExp, TrainBackend,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "facedet", about = "YOLOX face detector: training and VOC evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ExpArgs {
    /// JSON experiment file replacing the built-in face defaults.
    #[arg(short = 'f', long = "exp_file")]
    exp_file: Option<PathBuf>,
    /// Field overrides as `key value` pairs, e.g. `max_epoch 50`.
    #[arg(trailing_var_arg = true)]
    opts: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the detector.
    Train {
        #[arg(short, long, default_value_t = 64)]
        batch_size: usize,
        /// Cache resized images in `ram` or on `disk`.
        #[arg(long, num_args = 0..=1, default_missing_value = "ram")]
        cache: Option<CacheType>,
        /// Checkpoint to resume from.
        #[arg(long)]
        resume: Option<PathBuf>,
        #[command(flatten)]
        exp: ExpArgs,
    },
    /// Evaluate a checkpoint on the validation split.
    Eval {
        #[arg(short = 'c', long)]
        ckpt: PathBuf,
        #[arg(short, long, default_value_t = 64)]
        batch_size: usize,
        /// ImageNet normalisation at test time, for older checkpoints.
        #[arg(long, default_value_t = false)]
        legacy: bool,
        #[command(flatten)]
        exp: ExpArgs,
    },
    /// Print the effective configuration as JSON.
    ShowConfig {
        #[command(flatten)]
        exp: ExpArgs,
    },
}

fn build_exp<B: Backend>(args: &ExpArgs, device: B::Device) -> Result<MaskExp<B>> {
    let mut exp = match &args.exp_file {
        Some(path) => {
            println!("📄 Configuration: {}", path.display());
            MaskExp::with_config(ExpConfig::from_json_file(path)?, device)
        }
        None => MaskExp::new(device),
    };
    exp.merge(&args.opts)?;
    Ok(exp)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            batch_size,
            cache,
            resume,
            exp,
        } => {
            let device = <TrainBackend as Backend>::Device::default();
            let exp = build_exp::<TrainBackend>(&exp, device)?;
            let opts = TrainOptions {
                batch_size,
                cache: cache.is_some(),
                cache_type: cache.unwrap_or_default(),
                resume,
            };
            let report = Trainer::<TrainBackend, _>::new(exp, opts).run()?;
            println!("✅ Résultats dans: {}", report.output_dir.display());
        }
        Command::Eval {
            ckpt,
            batch_size,
            legacy,
            exp,
        } => {
            let device = <InferBackend as Backend>::Device::default();
            let mut exp = build_exp::<InferBackend>(&exp, device.clone())?;
            exp.get_model(false);
            let model = exp
                .take_model()
                .ok_or_else(|| anyhow::anyhow!("Experiment did not provide a model"))?;
            let model = load_model(model, &ckpt, &device)?;
            println!("📥 Checkpoint chargé: {}", ckpt.display());

            let evaluator = exp.get_evaluator::<InferBackend>(batch_size, false, false, legacy)?;
            let summary = evaluator.evaluate(&model)?;
            println!("✅ AP50:95 = {:.4}, AP50 = {:.4}", summary.ap50_95, summary.ap50);
        }
        Command::ShowConfig { exp } => {
            let exp = build_exp::<InferBackend>(&exp, Default::default())?;
            println!("{}", serde_json::to_string_pretty(exp.config())?);
        }
    }

    Ok(())
}
