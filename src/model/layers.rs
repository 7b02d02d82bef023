use crate::common::*;

// depthwise separable convolution

#[derive(Debug)]
pub struct SeparableConv {
    depthwise: nn::Conv2D,
    pointwise: nn::Conv2D,
    relu: bool,
}

impl SeparableConv {
    pub fn new<'p, P>(
        path: P,
        in_channels: i64,
        out_channels: i64,
        stride: i64,
        relu: bool,
    ) -> SeparableConv
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let depthwise = nn::conv2d(
            path / "depthwise",
            in_channels,
            in_channels,
            3,
            nn::ConvConfig {
                stride,
                padding: 1,
                groups: in_channels,
                ..Default::default()
            },
        );
        let pointwise = nn::conv2d(
            path / "pointwise",
            in_channels,
            out_channels,
            1,
            Default::default(),
        );

        SeparableConv {
            depthwise,
            pointwise,
            relu,
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let xs = xs.apply(&self.depthwise).apply(&self.pointwise);
        if self.relu {
            xs.relu()
        } else {
            xs
        }
    }
}

/// Bilinear up-sampling by a factor of two.
pub fn upsample2x(xs: &Tensor) -> Tensor {
    let size = xs.size();
    let (height, width) = (size[size.len() - 2], size[size.len() - 1]);
    xs.upsample_bilinear2d(&[height * 2, width * 2], false, None::<f64>, None::<f64>)
}

fn max_pool2x(xs: &Tensor) -> Tensor {
    xs.max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false)
}

// blaze block

/// Down-sampling block: a strided separable convolution fused with a
/// max-pooled shortcut, followed by `block_num` residual separable convolutions.
///
/// The shortcut is projected by a 1x1 convolution whenever the channel count
/// changes.
#[derive(Debug, Clone)]
pub struct BlazeBlockInit {
    pub in_channels: i64,
    pub out_channels: i64,
    pub block_num: i64,
}

impl BlazeBlockInit {
    pub fn build<'p, P>(self, path: P) -> BlazeBlock
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let Self {
            in_channels,
            out_channels,
            block_num,
        } = self;

        let downsample_a = SeparableConv::new(
            path / "downsample_a",
            in_channels,
            out_channels,
            2,
            false,
        );
        let shortcut_proj = (in_channels != out_channels).then(|| {
            nn::conv2d(
                path / "downsample_b",
                in_channels,
                out_channels,
                1,
                Default::default(),
            )
        });
        let convs = (0..block_num)
            .map(|index| {
                SeparableConv::new(
                    path / format!("conv_{}", index),
                    out_channels,
                    out_channels,
                    1,
                    false,
                )
            })
            .collect();

        BlazeBlock {
            in_channels,
            downsample_a,
            shortcut_proj,
            convs,
        }
    }
}

#[derive(Debug)]
pub struct BlazeBlock {
    in_channels: i64,
    downsample_a: SeparableConv,
    shortcut_proj: Option<nn::Conv2D>,
    convs: Vec<SeparableConv>,
}

impl BlazeBlock {
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        debug_assert_eq!(xs.size()[1], self.in_channels);

        let branch_a = self.downsample_a.forward(xs);
        let branch_b = {
            let pooled = max_pool2x(xs);
            match &self.shortcut_proj {
                Some(proj) => pooled.apply(proj),
                None => pooled,
            }
        };

        self.convs
            .iter()
            .fold((branch_a + branch_b).relu(), |xs, conv| {
                (&xs + conv.forward(&xs)).relu()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separable_conv_keeps_resolution() {
        let vs = VarStore::new(Device::Cpu);
        let conv = SeparableConv::new(&vs.root() / "sep", 8, 16, 1, true);
        let output = conv.forward(&Tensor::rand(&[2, 8, 12, 12], (Kind::Float, Device::Cpu)));
        assert_eq!(output.size(), vec![2, 16, 12, 12]);
        assert!(output.min().double_value(&[]) >= 0.0);
    }

    #[test]
    fn strided_separable_conv_halves_resolution() {
        let vs = VarStore::new(Device::Cpu);
        let conv = SeparableConv::new(&vs.root() / "sep", 4, 4, 2, false);
        let output = conv.forward(&Tensor::rand(&[1, 4, 16, 16], (Kind::Float, Device::Cpu)));
        assert_eq!(output.size(), vec![1, 4, 8, 8]);
    }

    #[test]
    fn upsample_doubles_resolution() {
        let xs = Tensor::ones(&[1, 3, 5, 7], (Kind::Float, Device::Cpu));
        let output = upsample2x(&xs);
        assert_eq!(output.size(), vec![1, 3, 10, 14]);
        assert!((output.mean(Kind::Float).double_value(&[]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn blaze_block_halves_resolution_and_widens() {
        let vs = VarStore::new(Device::Cpu);
        let block = BlazeBlockInit {
            in_channels: 24,
            out_channels: 48,
            block_num: 3,
        }
        .build(&vs.root() / "block");

        let output = block.forward(&Tensor::rand(&[2, 24, 32, 32], (Kind::Float, Device::Cpu)));
        assert_eq!(output.size(), vec![2, 48, 16, 16]);
        assert!(output.min().double_value(&[]) >= 0.0);
    }

    #[test]
    fn blaze_block_projects_shortcut_only_when_widening() {
        let vs = VarStore::new(Device::Cpu);
        let root = vs.root();
        let _widening = BlazeBlockInit {
            in_channels: 8,
            out_channels: 16,
            block_num: 1,
        }
        .build(&root / "widening");
        let _keeping = BlazeBlockInit {
            in_channels: 16,
            out_channels: 16,
            block_num: 2,
        }
        .build(&root / "keeping");

        let variables = vs.variables();
        assert!(variables.contains_key("widening.downsample_b.weight"));
        assert!(!variables.contains_key("keeping.downsample_b.weight"));
        assert!(variables.contains_key("keeping.conv_1.depthwise.weight"));
        assert!(!variables.contains_key("keeping.conv_2.depthwise.weight"));
    }
}
