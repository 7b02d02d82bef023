use super::{
    backbone::{Encoder, Stem},
    heads::{HeatmapDecoder, RegressionHead},
    params,
};
use crate::common::*;

/// Variable path prefixes of the stem, encoder and heatmap decoder.
pub const HEATMAP_PATH_PREFIXES: [&str; 3] = ["stem.", "encoder.", "decoder."];

/// Outputs of the dual-head model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Regression,
    Heatmap,
    /// Both heads; the regression head is trained on gradient-isolated features.
    TwoHead,
}

impl Default for ModelType {
    fn default() -> Self {
        Self::Regression
    }
}

/// Training phase of the phased model family, each exposing a single head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    Heatmap,
    Regression,
}

impl Default for ModelPhase {
    fn default() -> Self {
        Self::Regression
    }
}

impl From<ModelPhase> for ModelType {
    fn from(phase: ModelPhase) -> Self {
        match phase {
            ModelPhase::Heatmap => Self::Heatmap,
            ModelPhase::Regression => Self::Regression,
        }
    }
}

impl ModelType {
    pub fn has_heatmap(&self) -> bool {
        matches!(self, Self::Heatmap | Self::TwoHead)
    }

    pub fn has_joints(&self) -> bool {
        matches!(self, Self::Regression | Self::TwoHead)
    }
}

// output type

#[derive(Debug)]
pub struct BlazePoseOutput {
    /// `[batch, 3 * num_joints]` (x, y, visibility) triples.
    pub joints: Option<Tensor>,
    /// `[batch, num_joints, size / 2, size / 2]`.
    pub heatmap: Option<Tensor>,
}

// model

#[derive(Debug, Clone)]
pub struct BlazePoseInit {
    pub num_joints: i64,
    pub model_type: ModelType,
    pub stop_gradient: bool,
}

impl BlazePoseInit {
    pub fn new(num_joints: i64, model_type: ModelType) -> Self {
        Self {
            num_joints,
            model_type,
            stop_gradient: model_type == ModelType::TwoHead,
        }
    }

    pub fn from_phase(num_joints: i64, phase: ModelPhase) -> Self {
        Self {
            num_joints,
            model_type: phase.into(),
            stop_gradient: false,
        }
    }

    /// Registers the variables of both heads regardless of the model type, so
    /// that a checkpoint restores into any type or phase.
    pub fn build<'p, P>(self, path: P) -> BlazePose
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let Self {
            num_joints,
            model_type,
            stop_gradient,
        } = self;

        BlazePose {
            num_joints,
            model_type,
            stop_gradient,
            stem: Stem::new(path / "stem"),
            encoder: Encoder::new(path / "encoder"),
            decoder: HeatmapDecoder::new(path / "decoder", num_joints),
            regression: RegressionHead::new(path / "regression", num_joints),
        }
    }
}

#[derive(Debug)]
pub struct BlazePose {
    num_joints: i64,
    model_type: ModelType,
    stop_gradient: bool,
    stem: Stem,
    encoder: Encoder,
    decoder: HeatmapDecoder,
    regression: RegressionHead,
}

impl BlazePose {
    pub fn num_joints(&self) -> i64 {
        self.num_joints
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    /// Runs the network on `[batch, 3, size, size]` images scaled to `[0, 1]`.
    ///
    /// `size` must be a positive multiple of 128. Only the branches needed by
    /// the model type are evaluated.
    pub fn forward_t(&self, input: &Tensor, _train: bool) -> Fallible<BlazePoseOutput> {
        let (_batch_size, channels, height, width) = input
            .size4()
            .with_context(|| format!("expect a 4-D input, but get shape {:?}", input.size()))?;
        ensure!(
            channels == params::IMAGE_CHANNELS,
            "expect {} input channels, but get {}",
            params::IMAGE_CHANNELS,
            channels
        );
        ensure!(
            height == width && height > 0 && height % params::INPUT_SIZE_ALIGN == 0,
            "input must be square with a side multiple of {}, but get {}x{}",
            params::INPUT_SIZE_ALIGN,
            height,
            width
        );

        let y0 = self.stem.forward(input);
        let features = self.encoder.forward(y0);
        let fused = self.decoder.fuse(&features);

        let heatmap = self
            .model_type
            .has_heatmap()
            .then(|| self.decoder.heatmap(&fused, &features.y0));
        let joints = self
            .model_type
            .has_joints()
            .then(|| self.regression.forward(&fused, &features, self.stop_gradient));

        Ok(BlazePoseOutput { joints, heatmap })
    }
}

/// Stops gradient updates of the stem, encoder and heatmap decoder, leaving
/// only the regression head trainable. Returns the number of frozen variables.
pub fn freeze_heatmap_path(vs: &VarStore) -> usize {
    let mut count = 0;
    for (name, var) in vs.variables() {
        if HEATMAP_PATH_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            let _ = var.set_requires_grad(false);
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: i64 = 128;

    fn input() -> Tensor {
        Tensor::rand(&[2, 3, SIZE, SIZE], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn output_heads_follow_model_type() {
        let vs = VarStore::new(Device::Cpu);
        let root = vs.root();

        let regression = BlazePoseInit::new(4, ModelType::Regression).build(&root / "a");
        let output = regression.forward_t(&input(), false).unwrap();
        assert_eq!(output.joints.unwrap().size(), vec![2, 12]);
        assert!(output.heatmap.is_none());

        let heatmap = BlazePoseInit::new(4, ModelType::Heatmap).build(&root / "b");
        let output = heatmap.forward_t(&input(), false).unwrap();
        assert!(output.joints.is_none());
        assert_eq!(output.heatmap.unwrap().size(), vec![2, 4, SIZE / 2, SIZE / 2]);

        let two_head = BlazePoseInit::new(4, ModelType::TwoHead).build(&root / "c");
        let output = two_head.forward_t(&input(), false).unwrap();
        assert_eq!(output.joints.unwrap().size(), vec![2, 12]);
        assert_eq!(output.heatmap.unwrap().size(), vec![2, 4, SIZE / 2, SIZE / 2]);
    }

    #[test]
    fn phases_map_to_single_heads() {
        let init = BlazePoseInit::from_phase(3, ModelPhase::Heatmap);
        assert_eq!(init.model_type, ModelType::Heatmap);
        assert!(!init.stop_gradient);

        let init = BlazePoseInit::from_phase(3, ModelPhase::Regression);
        assert_eq!(init.model_type, ModelType::Regression);
        assert!(!init.stop_gradient);

        assert!(BlazePoseInit::new(3, ModelType::TwoHead).stop_gradient);
        assert!(!BlazePoseInit::new(3, ModelType::Regression).stop_gradient);
    }

    #[test]
    fn rejects_malformed_input() {
        let vs = VarStore::new(Device::Cpu);
        let model = BlazePoseInit::new(2, ModelType::Regression).build(vs.root());

        let flat = Tensor::rand(&[3, SIZE, SIZE], (Kind::Float, Device::Cpu));
        assert!(model.forward_t(&flat, false).is_err());

        let gray = Tensor::rand(&[1, 1, SIZE, SIZE], (Kind::Float, Device::Cpu));
        assert!(model.forward_t(&gray, false).is_err());

        let unaligned = Tensor::rand(&[1, 3, 96, 96], (Kind::Float, Device::Cpu));
        assert!(model.forward_t(&unaligned, false).is_err());

        let oblong = Tensor::rand(&[1, 3, SIZE, 2 * SIZE], (Kind::Float, Device::Cpu));
        assert!(model.forward_t(&oblong, false).is_err());
    }

    #[test]
    fn two_head_isolates_regression_gradient() {
        let backbone_grad_defined = |model_type| {
            let vs = VarStore::new(Device::Cpu);
            let model = BlazePoseInit::new(2, model_type).build(vs.root());
            let output = model.forward_t(&input(), true).unwrap();
            output.joints.unwrap().sum(Kind::Float).backward();

            let variables = vs.variables();
            let stem = &variables["stem.conv1.weight"];
            let head = &variables["regression.conv16.weight"];
            assert!(head.grad().defined());
            stem.grad().defined()
        };

        assert!(backbone_grad_defined(ModelType::Regression));
        assert!(!backbone_grad_defined(ModelType::TwoHead));
    }

    #[test]
    fn freezing_leaves_regression_trainable() {
        let vs = VarStore::new(Device::Cpu);
        let _model = BlazePoseInit::from_phase(2, ModelPhase::Regression).build(vs.root());

        let frozen = freeze_heatmap_path(&vs);

        let variables = vs.variables();
        let on_path = variables
            .keys()
            .filter(|name| {
                HEATMAP_PATH_PREFIXES
                    .iter()
                    .any(|prefix| name.starts_with(prefix))
            })
            .count();
        assert!(frozen > 0);
        assert_eq!(frozen, on_path);
        assert!(variables
            .iter()
            .all(|(name, var)| var.requires_grad() == name.starts_with("regression.")));
        assert!(!variables["stem.conv1.weight"].requires_grad());
        assert!(!variables["encoder.conv6.downsample_b.weight"].requires_grad());
        assert!(!variables["decoder.heatmap.weight"].requires_grad());
        assert!(variables["regression.conv16.weight"].requires_grad());
        assert!(variables["regression.conv12a.downsample_a.depthwise.weight"].requires_grad());
    }
}
