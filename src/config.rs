use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, fs, path::Path, str::FromStr};

/// Activation used by every `BaseConv` in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Silu,
    Relu,
    Lrelu,
}

/// Learning-rate schedule tag, serialized the way experiment files spell it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SchedulerKind {
    #[serde(rename = "cos")]
    Cos,
    #[serde(rename = "warmcos")]
    WarmCos,
    #[default]
    #[serde(rename = "yoloxwarmcos")]
    YoloxWarmCos,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Cos => "cos",
            SchedulerKind::WarmCos => "warmcos",
            SchedulerKind::YoloxWarmCos => "yoloxwarmcos",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cos" => Ok(SchedulerKind::Cos),
            "warmcos" => Ok(SchedulerKind::WarmCos),
            "yoloxwarmcos" => Ok(SchedulerKind::YoloxWarmCos),
            other => Err(anyhow!("Unknown scheduler: {other}")),
        }
    }
}

/// Every tunable of a training run. `Default` holds the generic detector
/// defaults; experiments override what they need.
///
/// Sizes are `(height, width)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpConfig {
    // model
    pub num_classes: usize,
    pub depth: f64,
    pub width: f64,
    pub act: Activation,

    // dataloader
    pub data_num_workers: usize,
    pub input_size: (usize, usize),
    pub data_dir: String,

    // transform
    pub mosaic_prob: f64,
    pub mixup_prob: f64,
    pub hsv_prob: f64,
    pub flip_prob: f64,
    pub enable_mixup: bool,

    // training
    pub warmup_epochs: usize,
    pub max_epoch: usize,
    pub warmup_lr: f64,
    pub min_lr_ratio: f64,
    pub basic_lr_per_img: f64,
    pub scheduler: SchedulerKind,
    pub no_aug_epochs: usize,
    pub ema: bool,
    pub weight_decay: f64,
    pub momentum: f64,
    pub print_interval: usize,
    pub eval_interval: usize,
    pub save_history_ckpt: bool,
    pub seed: Option<u64>,
    pub exp_name: String,
    pub output_dir: String,

    // testing
    pub test_size: (usize, usize),
    pub test_conf: f64,
    pub nmsthre: f64,
}

impl Default for ExpConfig {
    fn default() -> Self {
        Self {
            num_classes: 80,
            depth: 1.0,
            width: 1.0,
            act: Activation::Silu,
            data_num_workers: 4,
            input_size: (640, 640),
            data_dir: "datasets/VOCdevkit".to_string(),
            mosaic_prob: 1.0,
            mixup_prob: 1.0,
            hsv_prob: 1.0,
            flip_prob: 0.5,
            enable_mixup: true,
            warmup_epochs: 5,
            max_epoch: 300,
            warmup_lr: 0.0,
            min_lr_ratio: 0.05,
            basic_lr_per_img: 0.01 / 64.0,
            scheduler: SchedulerKind::YoloxWarmCos,
            no_aug_epochs: 15,
            ema: true,
            weight_decay: 5e-4,
            momentum: 0.9,
            print_interval: 10,
            eval_interval: 10,
            save_history_ckpt: true,
            seed: None,
            exp_name: "yolox_base".to_string(),
            output_dir: "./YOLOX_outputs".to_string(),
            test_size: (640, 640),
            test_conf: 0.01,
            nmsthre: 0.65,
        }
    }
}

impl ExpConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Lecture de la configuration {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Configuration invalide: {}", path.display()))
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Overrides fields from a flat `[key, value, key, value, ...]` list.
    /// Each value is parsed as the JSON type of the field it replaces.
    pub fn merge(&mut self, opts: &[String]) -> Result<()> {
        if opts.len() % 2 != 0 {
            bail!("Options must come in key/value pairs, got {} items", opts.len());
        }

        let mut fields = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            other => bail!("Unexpected configuration shape: {other}"),
        };

        for pair in opts.chunks(2) {
            let (key, raw) = (pair[0].as_str(), pair[1].as_str());
            let current = fields
                .get(key)
                .ok_or_else(|| anyhow!("Unknown option: {key}"))?;
            let value = parse_like(current, raw)
                .with_context(|| format!("Invalid value for {key}: {raw}"))?;
            fields.insert(key.to_string(), value);
        }

        *self = serde_json::from_value(Value::Object(fields))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            bail!("num_classes must be > 0");
        }
        if self.depth <= 0.0 || self.width <= 0.0 {
            bail!("depth and width multipliers must be > 0");
        }
        for (name, (h, w)) in [("input_size", self.input_size), ("test_size", self.test_size)] {
            if h == 0 || w == 0 || h % 32 != 0 || w % 32 != 0 {
                bail!("{name} must be a non-zero multiple of 32, got {h}x{w}");
            }
        }
        if self.max_epoch == 0 {
            bail!("max_epoch must be > 0");
        }
        if self.no_aug_epochs > self.max_epoch {
            bail!("no_aug_epochs cannot exceed max_epoch");
        }
        if self.basic_lr_per_img <= 0.0 {
            bail!("basic_lr_per_img must be > 0");
        }
        if !(0.0..=1.0).contains(&self.test_conf) || !(0.0..=1.0).contains(&self.nmsthre) {
            bail!("test_conf and nmsthre must be within [0, 1]");
        }
        if self.print_interval == 0 || self.eval_interval == 0 {
            bail!("print_interval and eval_interval must be > 0");
        }
        Ok(())
    }
}

fn parse_like(current: &Value, raw: &str) -> Result<Value> {
    let value = match current {
        Value::String(_) => Value::String(raw.to_string()),
        Value::Bool(_) => Value::Bool(raw.parse()?),
        Value::Number(n) if n.is_f64() => serde_json::to_value(raw.parse::<f64>()?)?,
        Value::Number(_) => serde_json::to_value(raw.parse::<u64>()?)?,
        // Tuples, optionals: accept JSON ("[416,416]", "42") and bare "416,416".
        _ => match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => serde_json::from_str(&format!("[{raw}]"))?,
        },
    };
    Ok(value)
}
