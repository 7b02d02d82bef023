use super::{
    backbone::Features,
    layers::{upsample2x, BlazeBlock, BlazeBlockInit, SeparableConv},
    params,
};
use crate::common::*;

// heatmap decoder

#[derive(Debug)]
pub struct HeatmapDecoder {
    num_joints: i64,
    conv7a: SeparableConv,
    conv7b: SeparableConv,
    conv8b: SeparableConv,
    conv9b: SeparableConv,
    conv10a: SeparableConv,
    conv10b: SeparableConv,
    conv11: SeparableConv,
    heatmap_conv: nn::Conv2D,
}

impl HeatmapDecoder {
    pub fn new<'p, P>(path: P, num_joints: i64) -> HeatmapDecoder
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let [c1, c2, c3, c4] = params::ENCODER_CHANNELS;
        let dec = params::DECODER_CHANNELS;
        let hm = params::HEATMAP_CHANNELS;

        let sep = |name: &str, in_channels, out_channels| {
            SeparableConv::new(path / name, in_channels, out_channels, 1, true)
        };

        let heatmap_conv = nn::conv2d(
            path / "heatmap",
            hm,
            num_joints,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );

        HeatmapDecoder {
            num_joints,
            conv7a: sep("conv7a", c4, dec),
            conv7b: sep("conv7b", c3, dec),
            conv8b: sep("conv8b", c2, dec),
            conv9b: sep("conv9b", c1, dec),
            conv10a: sep("conv10a", dec, hm),
            conv10b: sep("conv10b", params::STEM_CHANNELS, hm),
            conv11: sep("conv11", hm, hm),
            heatmap_conv,
        }
    }

    /// Fuses the encoder levels back up to a quarter of the input resolution.
    pub fn fuse(&self, features: &Features) -> Tensor {
        let Features { y1, y2, y3, y4, .. } = features;

        let xs = upsample2x(&self.conv7a.forward(y4)) + self.conv7b.forward(y3);
        let xs = upsample2x(&xs) + self.conv8b.forward(y2);
        upsample2x(&xs) + self.conv9b.forward(y1)
    }

    /// Produces per-joint heatmaps at half the input resolution, in `[0, 1]`.
    pub fn heatmap(&self, fused: &Tensor, y0: &Tensor) -> Tensor {
        let ys = upsample2x(&self.conv10a.forward(fused)) + self.conv10b.forward(y0);
        let heatmap = self
            .conv11
            .forward(&ys)
            .apply(&self.heatmap_conv)
            .sigmoid();
        debug_assert_eq!(heatmap.size()[1], self.num_joints);
        heatmap
    }
}

// regression head

#[derive(Debug)]
pub struct RegressionHead {
    num_joints: i64,
    conv12a: BlazeBlock,
    conv12b: SeparableConv,
    conv13a: BlazeBlock,
    conv13b: SeparableConv,
    conv14a: BlazeBlock,
    conv14b: SeparableConv,
    conv15: Vec<BlazeBlock>,
    conv16: nn::Linear,
}

impl RegressionHead {
    pub fn new<'p, P>(path: P, num_joints: i64) -> RegressionHead
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let [c1, c2, c3, c4] = params::ENCODER_CHANNELS;
        let [_, n2, n3, n4] = params::ENCODER_BLOCK_NUMS;

        let block = |name: String, in_channels, out_channels, block_num| {
            BlazeBlockInit {
                in_channels,
                out_channels,
                block_num,
            }
            .build(path / name)
        };
        let sep = |name: &str, channels| SeparableConv::new(path / name, channels, channels, 1, true);

        let conv15 = (0..params::TAIL_BLOCK_REPEATS)
            .map(|index| block(format!("conv15_{}", index), c4, c4, params::TAIL_BLOCK_NUM))
            .collect();
        let conv16 = nn::linear(
            path / "conv16",
            c4,
            params::JOINT_DIMS * num_joints,
            Default::default(),
        );

        RegressionHead {
            num_joints,
            conv12a: block("conv12a".into(), c1, c2, n2),
            conv12b: sep("conv12b", c2),
            conv13a: block("conv13a".into(), c2, c3, n3),
            conv13b: sep("conv13b", c3),
            conv14a: block("conv14a".into(), c3, c4, n4),
            conv14b: sep("conv14b", c4),
            conv15,
            conv16,
        }
    }

    /// Regresses `[batch, 3 * num_joints]` joint triples from the fused
    /// quarter-resolution feature and the deeper encoder levels.
    ///
    /// With `stop_gradient` set, no gradient flows back into the shared features.
    pub fn forward(&self, fused: &Tensor, features: &Features, stop_gradient: bool) -> Tensor {
        let isolate = |xs: &Tensor| {
            if stop_gradient {
                xs.detach()
            } else {
                xs.shallow_clone()
            }
        };
        let fused = isolate(fused);
        let y2 = isolate(&features.y2);
        let y3 = isolate(&features.y3);
        let y4 = isolate(&features.y4);

        let xs = self.conv12a.forward(&fused) + self.conv12b.forward(&y2);
        let xs = self.conv13a.forward(&xs) + self.conv13b.forward(&y3);
        let xs = self.conv14a.forward(&xs) + self.conv14b.forward(&y4);
        let xs = self
            .conv15
            .iter()
            .fold(xs, |xs, block| block.forward(&xs));

        let joints = xs
            .adaptive_avg_pool2d(&[1, 1])
            .flatten(1, -1)
            .apply(&self.conv16)
            .sigmoid();
        debug_assert_eq!(joints.size()[1], params::JOINT_DIMS * self.num_joints);
        joints
    }
}
