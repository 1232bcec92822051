use burn::prelude::*;

use crate::layers::block::{Block, BlockConfig};

#[derive(Config, Debug)]
pub struct TransformerConfig {
    pub depth: usize,
    pub block: BlockConfig,
}

impl TransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Transformer<B> {
        let blocks = (0..self.depth).map(|_| self.block.init(device)).collect();
        Transformer { blocks }
    }
}

/// Fixed-depth stack of pre-norm blocks, applied in construction order.
#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    blocks: Vec<Block<B>>,
}

impl<B: Backend> Transformer<B> {
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    /// Runs the full stack and also returns the tokens after every block
    /// index listed in `layers`, in stack order.
    pub fn forward_with_intermediate(
        &self,
        x: Tensor<B, 3>,
        layers: &[usize],
    ) -> (Tensor<B, 3>, Vec<Tensor<B, 3>>) {
        let mut tokens = x;
        let mut outputs = Vec::with_capacity(layers.len());

        for (index, block) in self.blocks.iter().enumerate() {
            tokens = block.forward(tokens);

            if layers.contains(&index) {
                outputs.push(tokens.clone());
            }
        }

        (tokens, outputs)
    }
}
