use crate::{common::*, config::LossConfig, dataset::PoseBatch, model::BlazePoseOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatmapLoss {
    Mse,
    BinaryCrossEntropy,
}

impl Default for HeatmapLoss {
    fn default() -> Self {
        Self::Mse
    }
}

impl HeatmapLoss {
    pub fn compute(&self, pred: &Tensor, target: &Tensor) -> Tensor {
        match self {
            Self::Mse => pred.mse_loss(target, Reduction::Mean),
            Self::BinaryCrossEntropy => {
                // keep the logarithm finite on saturated sigmoid outputs
                let pred = pred.clamp(1e-7, 1.0 - 1e-7);
                pred.binary_cross_entropy::<Tensor>(target, None, Reduction::Mean)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointsLoss {
    L2,
    L1,
}

impl Default for JointsLoss {
    fn default() -> Self {
        Self::L2
    }
}

impl JointsLoss {
    pub fn compute(&self, pred: &Tensor, target: &Tensor) -> Tensor {
        match self {
            Self::L2 => pred.mse_loss(target, Reduction::Mean),
            Self::L1 => pred.l1_loss(target, Reduction::Mean),
        }
    }
}

#[derive(Debug)]
pub struct PoseLosses {
    pub total: Tensor,
    pub heatmap: Option<Tensor>,
    pub joints: Option<Tensor>,
}

/// Weighted sum of the losses of whichever heads the model produced.
#[derive(Debug, Clone)]
pub struct PoseObjective {
    pub heatmap_loss: HeatmapLoss,
    pub joints_loss: JointsLoss,
    pub heatmap_weight: f64,
    pub joints_weight: f64,
}

impl From<&LossConfig> for PoseObjective {
    fn from(config: &LossConfig) -> Self {
        let LossConfig {
            heatmap,
            joints,
            heatmap_weight,
            joints_weight,
        } = *config;

        Self {
            heatmap_loss: heatmap,
            joints_loss: joints,
            heatmap_weight,
            joints_weight,
        }
    }
}

impl PoseObjective {
    pub fn compute(&self, output: &BlazePoseOutput, batch: &PoseBatch) -> Fallible<PoseLosses> {
        let heatmap = output
            .heatmap
            .as_ref()
            .map(|pred| {
                ensure!(
                    pred.size() == batch.heatmaps.size(),
                    "heatmap shape {:?} does not match target shape {:?}",
                    pred.size(),
                    batch.heatmaps.size()
                );
                Ok(self.heatmap_loss.compute(pred, &batch.heatmaps))
            })
            .transpose()?;

        let joints = output
            .joints
            .as_ref()
            .map(|pred| {
                ensure!(
                    pred.size() == batch.joints.size(),
                    "joints shape {:?} does not match target shape {:?}",
                    pred.size(),
                    batch.joints.size()
                );
                Ok(self.joints_loss.compute(pred, &batch.joints))
            })
            .transpose()?;

        let total = match (&heatmap, &joints) {
            (Some(heatmap), Some(joints)) => {
                heatmap * self.heatmap_weight + joints * self.joints_weight
            }
            (Some(heatmap), None) => heatmap * self.heatmap_weight,
            (None, Some(joints)) => joints * self.joints_weight,
            (None, None) => bail!("the model output contains neither heatmaps nor joints"),
        };

        Ok(PoseLosses {
            total,
            heatmap,
            joints,
        })
    }
}
