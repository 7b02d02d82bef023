use super::{
    layers::{BlazeBlock, BlazeBlockInit, SeparableConv},
    params,
};
use crate::common::*;

/// Multi-scale features shared by the heatmap and regression heads.
///
/// `y0` has half the input resolution; each following level halves it again.
#[derive(Debug)]
pub struct Features {
    pub y0: Tensor,
    pub y1: Tensor,
    pub y2: Tensor,
    pub y3: Tensor,
    pub y4: Tensor,
}

// stem

#[derive(Debug)]
pub struct Stem {
    conv1: nn::Conv2D,
    conv2_1: SeparableConv,
    conv2_2: SeparableConv,
}

impl Stem {
    pub fn new<'p, P>(path: P) -> Stem
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let channels = params::STEM_CHANNELS;

        let conv1 = nn::conv2d(
            path / "conv1",
            params::IMAGE_CHANNELS,
            channels,
            3,
            nn::ConvConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        );
        let conv2_1 = SeparableConv::new(path / "conv2_1", channels, channels, 1, false);
        let conv2_2 = SeparableConv::new(path / "conv2_2", channels, channels, 1, false);

        Stem {
            conv1,
            conv2_1,
            conv2_2,
        }
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        let xs = input.apply(&self.conv1).relu();
        let xs = (&xs + self.conv2_1.forward(&xs)).relu();
        (&xs + self.conv2_2.forward(&xs)).relu()
    }
}

// encoder

#[derive(Debug)]
pub struct Encoder {
    conv3: BlazeBlock,
    conv4: BlazeBlock,
    conv5: BlazeBlock,
    conv6: BlazeBlock,
}

impl Encoder {
    pub fn new<'p, P>(path: P) -> Encoder
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let [c3, c4, c5, c6] = params::ENCODER_CHANNELS;
        let [n3, n4, n5, n6] = params::ENCODER_BLOCK_NUMS;
        let block = |name: &str, in_channels, out_channels, block_num| {
            BlazeBlockInit {
                in_channels,
                out_channels,
                block_num,
            }
            .build(path / name)
        };

        Encoder {
            conv3: block("conv3", params::STEM_CHANNELS, c3, n3),
            conv4: block("conv4", c3, c4, n4),
            conv5: block("conv5", c4, c5, n5),
            conv6: block("conv6", c5, c6, n6),
        }
    }

    pub fn forward(&self, y0: Tensor) -> Features {
        let y1 = self.conv3.forward(&y0);
        let y2 = self.conv4.forward(&y1);
        let y3 = self.conv5.forward(&y2);
        let y4 = self.conv6.forward(&y3);
        Features { y0, y1, y2, y3, y4 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_halves_resolution() {
        let vs = VarStore::new(Device::Cpu);
        let stem = Stem::new(&vs.root() / "stem");
        let output = stem.forward(&Tensor::rand(&[1, 3, 64, 64], (Kind::Float, Device::Cpu)));
        assert_eq!(output.size(), vec![1, params::STEM_CHANNELS, 32, 32]);
    }

    #[test]
    fn encoder_levels_halve_resolution_and_widen() {
        let vs = VarStore::new(Device::Cpu);
        let encoder = Encoder::new(&vs.root() / "encoder");
        let y0 = Tensor::rand(&[1, params::STEM_CHANNELS, 64, 64], (Kind::Float, Device::Cpu));
        let Features { y0, y1, y2, y3, y4 } = encoder.forward(y0);

        let sizes: Vec<_> = [&y0, &y1, &y2, &y3, &y4]
            .iter()
            .map(|ys| ys.size4().unwrap())
            .collect();
        assert_eq!(
            sizes,
            vec![
                (1, 24, 64, 64),
                (1, 48, 32, 32),
                (1, 96, 16, 16),
                (1, 192, 8, 8),
                (1, 288, 4, 4),
            ]
        );
    }

    #[test]
    fn encoder_blocks_are_named_after_stage() {
        let vs = VarStore::new(Device::Cpu);
        let _encoder = Encoder::new(&vs.root() / "encoder");
        let variables = vs.variables();
        assert!(variables.contains_key("encoder.conv3.downsample_a.depthwise.weight"));
        assert!(variables.contains_key("encoder.conv6.conv_5.pointwise.weight"));
        assert!(!variables.contains_key("encoder.conv7.downsample_a.depthwise.weight"));
    }
}
