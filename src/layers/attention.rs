use burn::{nn::Initializer, prelude::*, tensor::activation::softmax};

#[derive(Config, Debug)]
pub struct AttentionConfig {
    pub dim: usize,
    #[config(default = 8)]
    pub num_heads: usize,
    #[config(default = 64)]
    pub head_dim: usize,
    #[config(default = 0.0)]
    pub proj_drop: f64,
}

impl AttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Attention<B> {
        Attention::new(device, self.clone())
    }

    pub fn inner_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// A single head already as wide as the model needs no output projection.
    pub fn projects_out(&self) -> bool {
        !(self.num_heads == 1 && self.head_dim == self.dim)
    }
}

#[derive(Module, Debug)]
pub struct OutputProjection<B: Backend> {
    pub proj: nn::Linear<B>,
    pub proj_drop: nn::Dropout,
}

impl<B: Backend> OutputProjection<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.proj_drop.forward(self.proj.forward(x))
    }
}

/// Multi-head scaled dot-product self-attention.
///
/// Axis conventions: tokens are `[batch, seq, channels]`, per-head tensors
/// are `[batch, heads, seq, head_dim]`, and attention weights are
/// `[batch, heads, query, key]`.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    pub qkv: nn::Linear<B>,
    pub proj: Option<OutputProjection<B>>,
    pub num_heads: usize,
    pub head_dim: usize,
    pub scale: f32,
}

impl<B: Backend> Attention<B> {
    pub fn new(device: &B::Device, config: AttentionConfig) -> Self {
        let inner_dim = config.inner_dim();
        let scale = (config.head_dim as f32).powf(-0.5);

        let qkv = nn::LinearConfig::new(config.dim, inner_dim * 3)
            .with_bias(false)
            .with_initializer(Initializer::Zeros)
            .init::<B>(device);

        let proj = if config.projects_out() {
            Some(OutputProjection {
                proj: nn::LinearConfig::new(inner_dim, config.dim)
                    .with_initializer(Initializer::Zeros)
                    .init::<B>(device),
                proj_drop: nn::DropoutConfig::new(config.proj_drop).init(),
            })
        } else {
            None
        };

        Self {
            qkv,
            proj,
            num_heads: config.num_heads,
            head_dim: config.head_dim,
            scale,
        }
    }

    /// Splits the fused projection into per-head `q`, `k`, `v`.
    #[allow(non_snake_case, clippy::single_range_in_vec_init)]
    fn split_heads(&self, x: Tensor<B, 3>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let [B, N, _] = x.dims();
        let (H, D) = (self.num_heads, self.head_dim);

        // channels are laid out as [q | k | v], each [head][head_dim]
        let qkv = self
            .qkv
            .forward(x)
            .reshape([B, N, 3, H, D])
            .permute([2, 0, 3, 1, 4]);

        let q = qkv.clone().slice([0..1]).reshape([B, H, N, D]);
        let k = qkv.clone().slice([1..2]).reshape([B, H, N, D]);
        let v = qkv.slice([2..3]).reshape([B, H, N, D]);

        (q, k, v)
    }

    fn attend(&self, q: Tensor<B, 4>, k: Tensor<B, 4>) -> Tensor<B, 4> {
        let dots = q.matmul(k.swap_dims(2, 3)).mul_scalar(self.scale);
        softmax(dots, 3)
    }

    /// Normalized attention weights `[batch, heads, query, key]`; each
    /// query row is a distribution over keys.
    pub fn attention_weights(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let (q, k, _) = self.split_heads(x);
        self.attend(q, k)
    }

    #[allow(non_snake_case)]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [B, N, _] = x.dims();

        let (q, k, v) = self.split_heads(x);
        let attn = self.attend(q, k);

        let x = attn
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([B, N, self.num_heads * self.head_dim]);

        match &self.proj {
            Some(proj) => proj.forward(x),
            None => x,
        }
    }
}
