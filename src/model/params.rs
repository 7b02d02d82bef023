// input
pub const IMAGE_CHANNELS: i64 = 3;
pub const INPUT_SIZE: i64 = 256; // default square input resolution
pub const INPUT_SIZE_ALIGN: i64 = 128; // total down-sampling factor of the regression path

// stem
pub const STEM_CHANNELS: i64 = 24;

// heatmap backbone, from shallow to deep
pub const ENCODER_CHANNELS: [i64; 4] = [48, 96, 192, 288];
pub const ENCODER_BLOCK_NUMS: [i64; 4] = [3, 4, 5, 6];

// heatmap decoder
pub const DECODER_CHANNELS: i64 = 48;
pub const HEATMAP_CHANNELS: i64 = 8;

// regression head
pub const TAIL_BLOCK_NUM: i64 = 7;
pub const TAIL_BLOCK_REPEATS: usize = 2;
pub const JOINT_DIMS: i64 = 3; // x, y, visibility

// heatmap targets
pub const HEATMAP_SIGMA: f64 = 2.0; // gaussian sigma in heatmap pixels

// hyper-parameters: ADAM optimization
pub const ADAM_LR_BEGIN: f64 = 1e-3;
pub const ADAM_LR_END: f64 = 1e-5;
pub const ANNEAL_LR_MAX: usize = 100_000; // annealing interval for learning rate

// evaluation
pub const PCK_THRESHOLD: f64 = 0.05; // in normalized image units
