use burn::prelude::*;

use crate::layers::{
    attention::{Attention, AttentionConfig},
    mlp::{Mlp, MlpConfig},
    prenorm::{PreNorm, PreNormConfig},
};

#[derive(Config, Debug)]
pub struct BlockConfig {
    pub attn: AttentionConfig,
    pub mlp_dim: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl BlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Block<B> {
        Block::new(device, self.clone())
    }
}

/// One `(attention, feed-forward)` stage pair, each behind its own
/// pre-norm residual.
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    norm1: PreNorm<B>,
    attn: Attention<B>,
    norm2: PreNorm<B>,
    mlp: Mlp<B, 3>,
}

impl<B: Backend> Block<B> {
    pub fn new(device: &B::Device, config: BlockConfig) -> Self {
        let dim = config.attn.dim;

        let norm1 = PreNormConfig::new(dim).init(device);
        let attn = config
            .attn
            .clone()
            .with_proj_drop(config.dropout)
            .init(device);

        let norm2 = PreNormConfig::new(dim).init(device);
        let mlp = MlpConfig::new(dim, config.mlp_dim)
            .with_dropout(config.dropout)
            .init::<B, 3>(device);

        Self {
            norm1,
            attn,
            norm2,
            mlp,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.norm1.forward(x, |h| self.attn.forward(h));
        self.norm2.forward(x, |h| self.mlp.forward(h))
    }
}
