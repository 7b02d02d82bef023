//! BlazePose human pose estimation built on libtorch.

pub mod common;
pub mod config;
pub mod dataset;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod trainer;
