use crate::{
    common::*,
    loss::{HeatmapLoss, JointsLoss},
    model::{params, ModelPhase, ModelType},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub trainer: TrainerKind,
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub training: TrainingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Fallible<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Fallible<()> {
        let Self {
            model,
            dataset,
            training,
            ..
        } = self;

        ensure!(
            model.input_size > 0 && model.input_size % params::INPUT_SIZE_ALIGN as usize == 0,
            "input_size must be a positive multiple of {}, but get {}",
            params::INPUT_SIZE_ALIGN,
            model.input_size
        );

        let num_joints = model.num_joints.get();
        if let Some([lhs, rhs]) = dataset
            .flip_pairs
            .iter()
            .find(|[lhs, rhs]| *lhs >= num_joints || *rhs >= num_joints)
        {
            bail!(
                "flip pair ({}, {}) is out of range for {} joints",
                lhs,
                rhs,
                num_joints
            );
        }
        ensure!(
            dataset.heatmap_sigma > 0.0,
            "heatmap_sigma must be positive"
        );

        let LossConfig {
            heatmap_weight,
            joints_weight,
            ..
        } = training.loss;
        ensure!(
            heatmap_weight >= 0.0 && joints_weight >= 0.0,
            "loss weights must be non-negative"
        );

        let LrSchedule { begin, end, .. } = training.learning_rate;
        ensure!(begin > 0.0 && end > 0.0, "learning rates must be positive");
        ensure!(
            training.pck_threshold > 0.0,
            "pck_threshold must be positive"
        );

        Ok(())
    }
}

/// Selects the model family and how its heads are trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainerKind {
    /// Dual-head family configured by `model.model_type`.
    #[serde(rename = "blazepose")]
    BlazePose,
    /// Phased family configured by `model.phase`.
    #[serde(rename = "keypoint_detection")]
    KeypointDetection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub num_joints: NonZeroUsize,
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    #[serde(default)]
    pub model_type: ModelType,
    #[serde(default)]
    pub phase: ModelPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub image_dir: PathBuf,
    pub train_labels: PathBuf,
    pub val_labels: Option<PathBuf>,
    #[serde(default = "default_heatmap_sigma")]
    pub heatmap_sigma: f64,
    #[serde(default)]
    pub random_flip: bool,
    /// Left/right joint index pairs swapped on horizontal flips.
    #[serde(default)]
    pub flip_pairs: Vec<[usize; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(
        serialize_with = "serialize_device",
        deserialize_with = "deserialize_device",
        default = "default_device"
    )]
    pub device: Device,
    pub batch_size: NonZeroUsize,
    pub epochs: usize,
    pub seed: Option<u64>,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default)]
    pub learning_rate: LrSchedule,
    #[serde(default)]
    pub loss: LossConfig,
    pub model_file: Option<PathBuf>,
    pub initial_step: Option<i64>,
    #[serde(default)]
    pub save_steps: usize,
    #[serde(default = "default_pck_threshold")]
    pub pck_threshold: f64,
}

/// Linear annealing of the learning rate from `begin` to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub begin: f64,
    pub end: f64,
    /// Number of steps to reach `end`; zero keeps the rate at `begin`.
    pub anneal_steps: usize,
}

impl LrSchedule {
    pub fn at(&self, step: i64) -> f64 {
        if self.anneal_steps == 0 {
            return self.begin;
        }
        let progress = (step as f64 / self.anneal_steps as f64).max(0.0).min(1.0);
        self.end + (self.begin - self.end) * (1.0 - progress)
    }
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self {
            begin: params::ADAM_LR_BEGIN,
            end: params::ADAM_LR_END,
            anneal_steps: params::ANNEAL_LR_MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default)]
    pub heatmap: HeatmapLoss,
    #[serde(default)]
    pub joints: JointsLoss,
    #[serde(default = "default_loss_weight")]
    pub heatmap_weight: f64,
    #[serde(default = "default_loss_weight")]
    pub joints_weight: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            heatmap: HeatmapLoss::default(),
            joints: JointsLoss::default(),
            heatmap_weight: default_loss_weight(),
            joints_weight: default_loss_weight(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
    #[serde(default = "default_log_steps")]
    pub log_steps: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: PathBuf::from("logs"),
            log_steps: default_log_steps(),
        }
    }
}

fn default_input_size() -> usize {
    params::INPUT_SIZE as usize
}

fn default_heatmap_sigma() -> f64 {
    params::HEATMAP_SIGMA
}

fn default_pck_threshold() -> f64 {
    params::PCK_THRESHOLD
}

fn default_loss_weight() -> f64 {
    1.0
}

fn default_log_steps() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_device() -> Device {
    Device::cuda_if_available()
}

fn serialize_device<S>(device: &Device, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let text = match device {
        Device::Cpu => "cpu".into(),
        Device::Cuda(n) => format!("cuda({})", n),
    };
    text.serialize(serializer)
}

fn deserialize_device<'de, D>(deserializer: D) -> Result<Device, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    parse_device(&name).ok_or_else(|| D::Error::custom(format!("invalid device name {}", name)))
}

fn parse_device(name: &str) -> Option<Device> {
    match name {
        "cpu" => Some(Device::Cpu),
        "cuda" => Some(Device::Cuda(0)),
        _ => {
            let number: usize = name
                .strip_prefix("cuda(")?
                .strip_suffix(')')?
                .parse()
                .ok()?;
            Some(Device::Cuda(number))
        }
    }
}
