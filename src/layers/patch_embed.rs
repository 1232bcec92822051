use burn::{nn::Initializer, prelude::*};

#[derive(Config, Debug)]
pub struct PatchEmbedConfig {
    pub image_size: [usize; 2],
    pub patch_size: [usize; 2],
    pub input_channels: usize,
    pub embedding_dimension: usize,
}

impl PatchEmbedConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchEmbed<B> {
        PatchEmbed::new(device, self.clone())
    }

    /// Patch grid as `[rows, columns]`. A zero patch extent yields an empty axis.
    pub fn grid_size(&self) -> [usize; 2] {
        let [height, width] = self.image_size;
        let [patch_height, patch_width] = self.patch_size;

        [
            height.checked_div(patch_height).unwrap_or(0),
            width.checked_div(patch_width).unwrap_or(0),
        ]
    }

    pub fn num_patches(&self) -> usize {
        let [rows, cols] = self.grid_size();
        rows * cols
    }

    pub fn patch_dim(&self) -> usize {
        self.input_channels * self.patch_size[0] * self.patch_size[1]
    }
}

/// Splits images into non-overlapping patches and projects every flattened
/// patch to the embedding dimension with one shared linear map.
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    proj: nn::Linear<B>,
    patch_height: usize,
    patch_width: usize,
}

impl<B: Backend> PatchEmbed<B> {
    pub fn new(device: &B::Device, config: PatchEmbedConfig) -> Self {
        let proj = nn::LinearConfig::new(config.patch_dim(), config.embedding_dimension)
            .with_initializer(Initializer::Zeros)
            .init(device);

        Self {
            proj,
            patch_height: config.patch_size[0],
            patch_width: config.patch_size[1],
        }
    }

    /// `[B, C, H, W] -> [B, N, ph * pw * C]`.
    ///
    /// Patches are numbered row-major over the grid. Within a patch, values
    /// run row by row, column by column, with the channel axis fastest.
    #[allow(non_snake_case)]
    pub fn patchify(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [B, C, H, W] = x.dims();
        let (ph, pw) = (self.patch_height, self.patch_width);
        let (rows, cols) = (H / ph, W / pw);

        x.reshape([B, C, rows, ph, cols, pw])
            .permute([0, 2, 4, 3, 5, 1])
            .reshape([B, rows * cols, ph * pw * C])
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        self.proj.forward(self.patchify(x))
    }
}
