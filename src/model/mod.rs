mod backbone;
mod heads;
pub mod layers;
mod model;
pub mod params;

pub use backbone::{Encoder, Features, Stem};
pub use heads::{HeatmapDecoder, RegressionHead};
pub use model::{
    freeze_heatmap_path, BlazePose, BlazePoseInit, BlazePoseOutput, ModelPhase, ModelType,
    HEATMAP_PATH_PREFIXES,
};
