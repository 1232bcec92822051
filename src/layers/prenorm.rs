use burn::prelude::*;

#[derive(Config, Debug)]
pub struct PreNormConfig {
    pub dim: usize,
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

impl PreNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PreNorm<B> {
        let norm = nn::LayerNormConfig::new(self.dim)
            .with_epsilon(self.epsilon)
            .init(device);

        PreNorm { norm }
    }
}

/// Pre-normalization residual wrapper: `x + f(norm(x))`.
///
/// `norm` standardizes each token over its feature axis with a learnable
/// scale and shift. The residual path carries the unnormalized input.
#[derive(Module, Debug)]
pub struct PreNorm<B: Backend> {
    pub norm: nn::LayerNorm<B>,
}

impl<B: Backend> PreNorm<B> {
    pub fn forward<F>(&self, x: Tensor<B, 3>, sublayer: F) -> Tensor<B, 3>
    where
        F: FnOnce(Tensor<B, 3>) -> Tensor<B, 3>,
    {
        let residual = sublayer(self.norm.forward(x.clone()));
        x + residual
    }
}
