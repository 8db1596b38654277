use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

/// A stack of 3x3 convolutions with a 1x1 side-output projection.
#[derive(Debug)]
struct DoubleConvBlock {
    convs: Vec<Conv2d>,
    projection: Conv2d,
}

impl DoubleConvBlock {
    fn new(vb: VarBuilder, in_channels: usize, out_channels: usize, layers: usize) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let vb_convs = vb.pp("convs");
        let convs = (0..layers)
            .map(|i| {
                let c_in = if i == 0 { in_channels } else { out_channels };
                conv2d(c_in, out_channels, 3, cfg, vb_convs.pp(i))
            })
            .collect::<Result<Vec<_>>>()?;
        let projection = conv2d(out_channels, 1, 1, Default::default(), vb.pp("projection"))?;
        Ok(Self { convs, projection })
    }

    fn forward(&self, xs: &Tensor, down_sample: bool) -> Result<(Tensor, Tensor)> {
        let mut xs = if down_sample {
            xs.max_pool2d(2)?
        } else {
            xs.clone()
        };
        for conv in &self.convs {
            xs = conv.forward(&xs)?.relu()?;
        }
        let side = self.projection.forward(&xs)?;
        Ok((xs, side))
    }
}

/// Holistically-nested edge detection network (Apache-2 ControlNet variant).
#[derive(Debug)]
pub struct Hed {
    norm: Tensor,
    blocks: [DoubleConvBlock; 5],
}

impl Hed {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let norm = vb.get((1, 3, 1, 1), "norm")?;
        let blocks = [
            DoubleConvBlock::new(vb.pp("block1"), 3, 64, 2)?,
            DoubleConvBlock::new(vb.pp("block2"), 64, 128, 2)?,
            DoubleConvBlock::new(vb.pp("block3"), 128, 256, 3)?,
            DoubleConvBlock::new(vb.pp("block4"), 256, 512, 3)?,
            DoubleConvBlock::new(vb.pp("block5"), 512, 512, 3)?,
        ];
        Ok(Self { norm, blocks })
    }

    /// Takes (1, 3, h, w) pixels in [0, 255] and returns the five side outputs,
    /// each (1, 1, h / 2^i, w / 2^i).
    pub fn forward(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        let mut xs = xs.broadcast_sub(&self.norm)?;
        let mut sides = Vec::with_capacity(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let (next, side) = block.forward(&xs, i > 0)?;
            sides.push(side);
            xs = next;
        }
        Ok(sides)
    }
}
