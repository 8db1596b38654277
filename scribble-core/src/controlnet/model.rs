use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d::{BlockConfig, UNet2DConditionModelConfig},
    unet_2d_blocks::{
        CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
        UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
    },
};

const EMBEDDING_CHANNELS: [usize; 4] = [16, 32, 96, 256];

fn conv3x3(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    conv2d(in_channels, out_channels, 3, cfg, vb)
}

/// Encodes the conditioning image down to latent resolution.
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn new(vb: VarBuilder, out_channels: usize) -> Result<Self> {
        let conv_in = conv3x3(3, EMBEDDING_CHANNELS[0], 1, vb.pp("conv_in"))?;
        let vb_blocks = vb.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * (EMBEDDING_CHANNELS.len() - 1));
        for pair in EMBEDDING_CHANNELS.windows(2) {
            let (c_in, c_out) = (pair[0], pair[1]);
            blocks.push(conv3x3(c_in, c_in, 1, vb_blocks.pp(blocks.len()))?);
            blocks.push(conv3x3(c_in, c_out, 2, vb_blocks.pp(blocks.len()))?);
        }
        let last = EMBEDDING_CHANNELS[EMBEDDING_CHANNELS.len() - 1];
        let conv_out = conv3x3(last, out_channels, 1, vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for block in &self.blocks {
            xs = block.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

/// Residuals a ControlNet adds to the UNet's skip connections and mid block.
pub struct ControlResiduals {
    pub down: Vec<Tensor>,
    pub mid: Tensor,
}

/// Trainable copy of the UNet encoder that turns a conditioning image into
/// residuals for the frozen UNet.
pub struct ControlNet {
    conv_in: Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    controlnet_down_blocks: Vec<Conv2d>,
    mid_block: UNetMidBlock2DCrossAttn,
    controlnet_mid_block: Conv2d,
}

impl ControlNet {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        use_flash_attn: bool,
        config: &UNet2DConditionModelConfig,
    ) -> Result<Self> {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let last = config.blocks[n_blocks - 1];
        let time_embed_dim = b_channels * 4;

        let conv_in = conv3x3(in_channels, b_channels, 1, vb.pp("conv_in"))?;
        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vb.pp("time_embedding"), b_channels, time_embed_dim)?;
        let cond_embedding =
            ConditioningEmbedding::new(vb.pp("controlnet_cond_embedding"), b_channels)?;

        // Every skip connection the encoder produces gets its own zero-initialized 1x1 conv.
        let mut residual_channels = vec![b_channels];
        let vb_down = vb.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(n_blocks);
        for (i, block) in config.blocks.iter().enumerate() {
            let BlockConfig {
                out_channels,
                use_cross_attn,
                attention_head_dim,
            } = *block;
            let in_channels = if i > 0 {
                config.blocks[i - 1].out_channels
            } else {
                b_channels
            };
            let add_downsample = i < n_blocks - 1;
            let db_cfg = DownBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: config.norm_eps,
                resnet_groups: config.norm_num_groups,
                add_downsample,
                downsample_padding: config.downsample_padding,
                ..Default::default()
            };
            let sliced_attention_size = match config.sliced_attention_size {
                Some(0) => Some(attention_head_dim / 2),
                other => other,
            };
            let down_block = match use_cross_attn {
                Some(transformer_layers_per_block) => {
                    let cfg = CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size,
                        use_linear_projection: config.use_linear_projection,
                        transformer_layers_per_block,
                    };
                    DownBlock::CrossAttn(CrossAttnDownBlock2D::new(
                        vb_down.pp(i),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        cfg,
                    )?)
                }
                None => DownBlock::Basic(DownBlock2D::new(
                    vb_down.pp(i),
                    in_channels,
                    out_channels,
                    Some(time_embed_dim),
                    db_cfg,
                )?),
            };
            down_blocks.push(down_block);
            residual_channels.extend(std::iter::repeat_n(out_channels, config.layers_per_block));
            if add_downsample {
                residual_channels.push(out_channels);
            }
        }

        let vb_zero = vb.pp("controlnet_down_blocks");
        let controlnet_down_blocks = residual_channels
            .iter()
            .enumerate()
            .map(|(i, &c)| conv2d(c, c, 1, Default::default(), vb_zero.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: last.attention_head_dim,
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            transformer_layers_per_block: last.use_cross_attn.unwrap_or(1),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vb.pp("mid_block"),
            last.out_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;
        let controlnet_mid_block = conv2d(
            last.out_channels,
            last.out_channels,
            1,
            Default::default(),
            vb.pp("controlnet_mid_block"),
        )?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            controlnet_down_blocks,
            mid_block,
            controlnet_mid_block,
        })
    }

    /// `cond` is the conditioning image batch in [0, 1] at pixel resolution;
    /// every residual is multiplied by `scale`.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        cond: &Tensor,
        scale: f64,
    ) -> Result<ControlResiduals> {
        let bsize = xs.dim(0)?;
        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let xs = self.conv_in.forward(xs)?;
        let xs = (xs + self.cond_embedding.forward(cond)?)?;

        let mut residuals = vec![xs.clone()];
        let mut xs = xs;
        for block in &self.down_blocks {
            let (next, res) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?
                }
            };
            residuals.extend(res);
            xs = next;
        }
        let xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let down = residuals
            .iter()
            .zip(&self.controlnet_down_blocks)
            .map(|(res, zero_conv)| zero_conv.forward(res)? * scale)
            .collect::<Result<Vec<_>>>()?;
        let mid = (self.controlnet_mid_block.forward(&xs)? * scale)?;
        Ok(ControlResiduals { down, mid })
    }
}
