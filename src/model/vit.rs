use std::str::FromStr;

use burn::{
    module::{Ignored, Param},
    nn::Initializer,
    prelude::*,
};

use crate::{
    error::VitError,
    layers::{
        attention::AttentionConfig,
        block::BlockConfig,
        patch_embed::{PatchEmbed, PatchEmbedConfig},
        transformer::{Transformer, TransformerConfig},
    },
    model::init::{self, InitPolicy, InitializerPolicy},
};

/// Expands a square size to `[height, width]`.
pub fn pair(size: usize) -> [usize; 2] {
    [size, size]
}

/// How the token sequence is reduced to one vector.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Pool {
    /// Take the class token at position 0.
    Cls,
    /// Average over every position, class token included.
    Mean,
}

impl FromStr for Pool {
    type Err = VitError;

    fn from_str(value: &str) -> crate::Result<Self> {
        match value {
            "cls" => Ok(Self::Cls),
            "mean" => Ok(Self::Mean),
            other => Err(VitError::UnknownPool(other.to_owned())),
        }
    }
}

#[derive(Config, Debug)]
pub struct ViTConfig {
    pub image_size: [usize; 2],
    pub patch_size: [usize; 2],
    /// Zero returns the pooled latent instead of class logits.
    pub num_classes: usize,
    pub dim: usize,
    pub depth: usize,
    pub heads: usize,
    pub mlp_dim: usize,
    #[config(default = "Pool::Cls")]
    pub pool: Pool,
    #[config(default = 3)]
    pub channels: usize,
    #[config(default = 64)]
    pub dim_head: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 0.0)]
    pub emb_dropout: f64,
    #[config(default = "Initializer::Normal{mean:0.0, std:0.02}")]
    pub initializer: Initializer,
}

impl ViTConfig {
    /// Builds the encoder and initializes it with the configured [`Initializer`].
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::Result<ViT<B>> {
        let mut policy = InitializerPolicy::new(self.initializer.clone());
        self.init_with(device, &mut policy)
    }

    /// Builds the encoder and runs `policy` once over every parameter.
    pub fn init_with<B: Backend, P: InitPolicy<B>>(
        &self,
        device: &B::Device,
        policy: &mut P,
    ) -> crate::Result<ViT<B>> {
        let model = ViT::new(device, self.clone())?;
        let (model, _) = init::apply(model, policy)?;
        Ok(model)
    }

    fn from_size(image_size: Option<usize>, patch_size: Option<usize>, num_classes: usize) -> Self {
        let image_size = image_size.unwrap_or(224);
        let patch_size = patch_size.unwrap_or(16);

        Self::new(pair(image_size), pair(patch_size), num_classes, 768, 12, 12, 3072)
    }

    pub fn tiny(image_size: Option<usize>, patch_size: Option<usize>, num_classes: usize) -> Self {
        Self {
            dim: 192,
            heads: 3,
            mlp_dim: 768,
            ..Self::from_size(image_size, patch_size, num_classes)
        }
    }

    pub fn small(image_size: Option<usize>, patch_size: Option<usize>, num_classes: usize) -> Self {
        Self {
            dim: 384,
            heads: 6,
            mlp_dim: 1536,
            ..Self::from_size(image_size, patch_size, num_classes)
        }
    }

    pub fn base(image_size: Option<usize>, patch_size: Option<usize>, num_classes: usize) -> Self {
        Self::from_size(image_size, patch_size, num_classes)
    }

    pub fn large(image_size: Option<usize>, patch_size: Option<usize>, num_classes: usize) -> Self {
        Self {
            dim: 1024,
            depth: 24,
            heads: 16,
            mlp_dim: 4096,
            ..Self::from_size(image_size, patch_size, num_classes)
        }
    }

    /// Patch grid as `[rows, columns]`.
    pub fn grid_size(&self) -> [usize; 2] {
        self.patch_embed().grid_size()
    }

    pub fn num_patches(&self) -> usize {
        self.patch_embed().num_patches()
    }

    pub fn validate(&self) -> crate::Result<()> {
        let result = self.check();
        if let Err(err) = &result {
            tracing::warn!(%err, "rejected vision transformer configuration");
        }
        result
    }

    fn check(&self) -> crate::Result<()> {
        let [image_height, image_width] = self.image_size;
        let [patch_height, patch_width] = self.patch_size;

        if patch_height == 0 || patch_width == 0 {
            return Err(VitError::InvalidConfig(format!(
                "patch size {patch_height}x{patch_width} must be non-zero"
            )));
        }

        if image_height % patch_height != 0 || image_width % patch_width != 0 {
            return Err(VitError::IndivisibleImage {
                image_height,
                image_width,
                patch_height,
                patch_width,
            });
        }

        if self.num_patches() == 0 {
            return Err(VitError::InvalidConfig(format!(
                "image size {image_height}x{image_width} yields no patches"
            )));
        }

        for (name, value) in [
            ("dim", self.dim),
            ("heads", self.heads),
            ("dim_head", self.dim_head),
            ("mlp_dim", self.mlp_dim),
            ("channels", self.channels),
        ] {
            if value == 0 {
                return Err(VitError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }

        for (name, rate) in [("dropout", self.dropout), ("emb_dropout", self.emb_dropout)] {
            if !(0.0..1.0).contains(&rate) {
                return Err(VitError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {rate}"
                )));
            }
        }

        Ok(())
    }

    fn patch_embed(&self) -> PatchEmbedConfig {
        PatchEmbedConfig::new(self.image_size, self.patch_size, self.channels, self.dim)
    }

    fn transformer(&self) -> TransformerConfig {
        let attn = AttentionConfig::new(self.dim)
            .with_num_heads(self.heads)
            .with_head_dim(self.dim_head);

        TransformerConfig::new(
            self.depth,
            BlockConfig::new(attn, self.mlp_dim).with_dropout(self.dropout),
        )
    }
}

/// Normalize-then-project classification head.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    norm: nn::LayerNorm<B>,
    linear: nn::Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    fn new(device: &B::Device, dim: usize, num_classes: usize) -> Self {
        Self {
            norm: nn::LayerNormConfig::new(dim).with_epsilon(1e-5).init(device),
            linear: nn::LinearConfig::new(dim, num_classes)
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(self.norm.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct ViT<B: Backend> {
    patch_embed: PatchEmbed<B>,
    pub cls_token: Param<Tensor<B, 3>>,
    pub pos_embed: Param<Tensor<B, 3>>,
    dropout: nn::Dropout,
    transformer: Transformer<B>,
    head: Option<ClassifierHead<B>>,
    pool: Ignored<Pool>,
    channels: usize,
    image_height: usize,
    image_width: usize,
    num_patches: usize,
}

impl<B: Backend> ViT<B> {
    /// Allocates every parameter with placeholders. Callers go through
    /// [`ViTConfig::init`] so the initialization policy always runs.
    fn new(device: &B::Device, config: ViTConfig) -> crate::Result<Self> {
        config.validate()?;

        let patch_embed = config.patch_embed();
        let num_patches = patch_embed.num_patches();

        let cls_token = Initializer::Zeros.init([1, 1, config.dim], device);
        let pos_embed = Initializer::Zeros.init([1, num_patches + 1, config.dim], device);

        let head = if config.num_classes > 0 {
            Some(ClassifierHead::new(device, config.dim, config.num_classes))
        } else {
            None
        };

        let model = Self {
            patch_embed: patch_embed.init(device),
            cls_token,
            pos_embed,
            dropout: nn::DropoutConfig::new(config.emb_dropout).init(),
            transformer: config.transformer().init(device),
            head,
            pool: Ignored(config.pool.clone()),
            channels: config.channels,
            image_height: config.image_size[0],
            image_width: config.image_size[1],
            num_patches,
        };

        tracing::debug!(
            num_patches,
            patch_dim = patch_embed.patch_dim(),
            depth = config.depth,
            parameters = model.num_params(),
            "allocated vision transformer"
        );

        Ok(model)
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }

    pub fn pool(&self) -> &Pool {
        &self.pool.0
    }

    pub fn has_head(&self) -> bool {
        self.head.is_some()
    }

    fn check_input(&self, x: &Tensor<B, 4>) -> crate::Result<()> {
        let [_, channels, height, width] = x.dims();
        let expected = [self.channels, self.image_height, self.image_width];
        let actual = [channels, height, width];

        if expected != actual {
            tracing::warn!(?expected, ?actual, "image batch does not match encoder input shape");
            return Err(VitError::ShapeMismatch { expected, actual });
        }

        Ok(())
    }

    /// Patch tokens with the class token prepended, positions added, and
    /// embedding dropout applied: `[B, N + 1, D]`.
    pub fn prepare_tokens(&self, x: Tensor<B, 4>) -> crate::Result<Tensor<B, 3>> {
        self.check_input(&x)?;

        let x = self.patch_embed.forward(x);
        let [batch, num_patches, _] = x.dims();

        let x = Tensor::cat(
            vec![self.cls_token.val().expand([batch as i64, -1, -1]), x],
            1,
        );
        let x = x + self.pos_embed.val().slice([0..1, 0..num_patches + 1]);

        Ok(self.dropout.forward(x))
    }

    /// Reduces `[B, L, D]` tokens to `[B, D]` with the configured pooling.
    pub fn pool_tokens(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, _, dim] = x.dims();

        match &self.pool.0 {
            Pool::Cls => x.slice([0..batch, 0..1]).reshape([batch, dim]),
            Pool::Mean => x.mean_dim(1).reshape([batch, dim]),
        }
    }

    /// Transformer output before pooling: `[B, N + 1, D]`.
    pub fn forward_tokens(&self, x: Tensor<B, 4>) -> crate::Result<Tensor<B, 3>> {
        let x = self.prepare_tokens(x)?;
        Ok(self.transformer.forward(x))
    }

    /// Class tokens and full token tensors after each stack index in `layers`.
    pub fn forward_with_intermediate_tokens(
        &self,
        x: Tensor<B, 4>,
        layers: &[usize],
    ) -> crate::Result<(Vec<Tensor<B, 2>>, Vec<Tensor<B, 3>>)> {
        let x = self.prepare_tokens(x)?;
        let (_, outputs) = self.transformer.forward_with_intermediate(x, layers);

        let class_tokens = outputs
            .iter()
            .map(|tokens| {
                let [batch, _, dim] = tokens.dims();
                tokens.clone().slice([0..batch, 0..1]).reshape([batch, dim])
            })
            .collect();

        Ok((class_tokens, outputs))
    }

    /// `[B, C, H, W]` images to `[B, dim]` latents, or `[B, num_classes]`
    /// logits when the encoder was built with a head.
    pub fn forward(&self, x: Tensor<B, 4>) -> crate::Result<Tensor<B, 2>> {
        let tokens = self.forward_tokens(x)?;
        let pooled = self.pool_tokens(tokens);

        Ok(match &self.head {
            Some(head) => head.forward(pooled),
            None => pooled,
        })
    }
}

#[cfg(all(test, feature = "backend_ndarray"))]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type TestBackend = burn::backend::NdArray<f32>;

    fn test_config() -> ViTConfig {
        ViTConfig::new(pair(32), pair(8), 0, 64, 2, 4, 128).with_dim_head(16)
    }

    struct Counting {
        calls: usize,
    }

    impl<B: Backend> InitPolicy<B> for Counting {
        fn init<const D: usize>(&mut self, tensor: Tensor<B, D>) -> Tensor<B, D> {
            self.calls += 1;
            tensor
        }
    }

    fn to_vec<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn pool_parses_known_modes_only() {
        assert_eq!("cls".parse::<Pool>().unwrap(), Pool::Cls);
        assert_eq!("mean".parse::<Pool>().unwrap(), Pool::Mean);

        let err = "max".parse::<Pool>().unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, VitError::UnknownPool(value) if value == "max"));
    }

    #[test]
    fn config_serializes_through_derived_json() {
        let config = test_config().with_pool(Pool::Mean).with_emb_dropout(0.25);

        let json = config.to_string();
        assert!(json.contains("Mean"), "pool missing from {json}");

        let loaded = ViTConfig::load_binary(json.as_bytes()).unwrap();
        assert_eq!(loaded.pool, Pool::Mean);
        assert_eq!(loaded.patch_size, [8, 8]);
        assert_eq!(loaded.dim_head, 16);
        assert_eq!(loaded.emb_dropout, 0.25);
    }

    #[test]
    fn patch_counts_are_zero_for_empty_patches() {
        let config = ViTConfig {
            patch_size: [0, 8],
            ..test_config()
        };

        assert_eq!(config.grid_size(), [0, 4]);
        assert_eq!(config.num_patches(), 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn shape_changing_policy_is_rejected() {
        struct Grow;

        impl<B: Backend> InitPolicy<B> for Grow {
            fn init<const D: usize>(&mut self, tensor: Tensor<B, D>) -> Tensor<B, D> {
                let mut dims = tensor.dims();
                dims[0] += 1;
                Tensor::zeros(dims, &tensor.device())
            }
        }

        let device = Default::default();
        let err = test_config()
            .init_with::<TestBackend, _>(&device, &mut Grow)
            .unwrap_err();
        assert!(matches!(err, VitError::InvalidConfig(_)));
    }

    #[test]
    fn policy_runs_once_per_parameter() {
        let device = Default::default();

        // patch proj (2) + cls + pos + 2 blocks * (2 norms * 2 + qkv + out (2) + fc1 (2) + fc2 (2))
        let mut policy = Counting { calls: 0 };
        test_config()
            .init_with::<TestBackend, _>(&device, &mut policy)
            .unwrap();
        assert_eq!(policy.calls, 26);

        // head adds a norm and a linear layer
        let mut policy = Counting { calls: 0 };
        ViTConfig {
            num_classes: 10,
            ..test_config()
        }
        .init_with::<TestBackend, _>(&device, &mut policy)
            .unwrap();
        assert_eq!(policy.calls, 30);
    }

    #[test]
    fn default_initializer_draws_tokens_and_keeps_norms() {
        let device = Default::default();
        let model = test_config().init::<TestBackend>(&device).unwrap();

        let cls = to_vec(model.cls_token.val());
        assert!(cls.iter().any(|v| *v != 0.0));

        let pos = to_vec(model.pos_embed.val());
        assert_eq!(pos.len(), 17 * 64);
        assert!(pos.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn rejects_indivisible_image() {
        let device = Default::default();
        let err = ViTConfig::new(pair(30), pair(8), 0, 64, 2, 4, 128)
            .init::<TestBackend>(&device)
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(matches!(
            err,
            VitError::IndivisibleImage {
                image_height: 30,
                patch_height: 8,
                ..
            }
        ));
    }

    #[test]
    fn rejects_out_of_range_dropout() {
        let err = test_config().with_dropout(1.0).validate().unwrap_err();
        assert!(matches!(err, VitError::InvalidConfig(_)));

        let err = test_config().with_emb_dropout(-0.1).validate().unwrap_err();
        assert!(matches!(err, VitError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_sizes() {
        let zero_patch = ViTConfig {
            patch_size: [0, 8],
            ..test_config()
        };
        assert!(zero_patch.validate().is_err());

        let empty_image = ViTConfig {
            image_size: [0, 0],
            ..test_config()
        };
        assert!(empty_image.validate().is_err());

        let no_heads = ViTConfig {
            heads: 0,
            ..test_config()
        };
        assert!(no_heads.validate().is_err());

        assert!(test_config().with_channels(0).validate().is_err());
    }

    #[test]
    fn rectangular_images_use_per_axis_grid() {
        let config = ViTConfig::new([32, 48], [8, 16], 0, 64, 1, 4, 128);
        assert_eq!(config.grid_size(), [4, 3]);
        assert_eq!(config.num_patches(), 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cls_pooling_ignores_non_class_positions() {
        let device = Default::default();
        let model = test_config().init::<TestBackend>(&device).unwrap();

        let tokens = Tensor::<TestBackend, 3>::random([2, 17, 64], Distribution::Normal(0.0, 1.0), &device);
        let noise = Tensor::<TestBackend, 3>::random([2, 16, 64], Distribution::Normal(0.0, 1.0), &device);
        let perturbed = tokens.clone().slice_assign([0..2, 1..17, 0..64], noise);

        assert_eq!(
            to_vec(model.pool_tokens(tokens.clone())),
            to_vec(model.pool_tokens(perturbed))
        );
        assert_eq!(
            to_vec(model.pool_tokens(tokens.clone())),
            to_vec(tokens.slice([0..2, 0..1]).reshape([2, 64]))
        );
    }

    #[test]
    fn mean_pooling_averages_every_position() {
        let device = Default::default();
        let model = test_config()
            .with_pool(Pool::Mean)
            .init::<TestBackend>(&device)
            .unwrap();

        let tokens = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 2.0], [3.0, 6.0], [5.0, 10.0]], [[0.0, 0.0], [0.0, 3.0], [3.0, 0.0]]],
            &device,
        );

        assert_eq!(to_vec(model.pool_tokens(tokens)), vec![3.0, 6.0, 1.0, 1.0]);
    }

    #[test]
    fn forward_rejects_mismatched_images() {
        let device = Default::default();
        let model = test_config().init::<TestBackend>(&device).unwrap();

        let wrong_channels = Tensor::<TestBackend, 4>::zeros([1, 1, 32, 32], &device);
        assert!(matches!(
            model.forward(wrong_channels),
            Err(VitError::ShapeMismatch {
                expected: [3, 32, 32],
                actual: [1, 32, 32],
            })
        ));

        let wrong_size = Tensor::<TestBackend, 4>::zeros([1, 3, 40, 40], &device);
        assert!(matches!(
            model.forward(wrong_size),
            Err(VitError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn intermediate_class_tokens_match_token_slices() {
        let device = Default::default();
        let model = test_config().init::<TestBackend>(&device).unwrap();

        let images = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let (class_tokens, outputs) = model
            .forward_with_intermediate_tokens(images.clone(), &[1])
            .unwrap();

        assert_eq!(class_tokens.len(), 1);
        assert_eq!(class_tokens[0].dims(), [2, 64]);
        assert_eq!(outputs[0].dims(), [2, 17, 64]);

        // the last stage's class token is the cls-pooled latent
        let latent = model.forward(images).unwrap();
        let expected = to_vec(latent);
        let actual = to_vec(class_tokens[0].clone());
        for (lhs, rhs) in actual.iter().zip(expected.iter()) {
            assert!((lhs - rhs).abs() < 1e-5);
        }
    }
}
